//! Spawning and signalling service processes

use std::io;
use std::path::Path;
use std::process::Stdio;

use tokio::process::{Child, Command};

use dh_core::service::LaunchSpec;

/// Whether nothing is listening on `127.0.0.1:port`
pub fn port_is_free(port: u16) -> bool {
    std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
}

/// Spawn `binary` in its own process group with output appended to `log_path`
///
/// The service leads the new group; `stop` signals it together with its
/// children.
pub async fn spawn_service(
    binary: &Path,
    launch: &LaunchSpec,
    data_dir: &Path,
    log_path: &Path,
) -> io::Result<Child> {
    tokio::fs::create_dir_all(data_dir).await?;
    if let Some(parent) = log_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let stdout = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;
    let stderr = stdout.try_clone()?;

    let mut cmd = Command::new(binary);
    cmd.args(&launch.args)
        .envs(launch.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .current_dir(data_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .process_group(0);

    cmd.spawn()
}

/// Send `signal` to the process group led by `pid`, or to `pid` alone
///
/// Adopted processes may not lead their own group, hence the fallback.
pub fn signal_process(pid: u32, signal: libc::c_int) -> io::Result<()> {
    if pid == 0 || pid > i32::MAX as u32 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid pid {}", pid),
        ));
    }
    let pid = pid as libc::pid_t;
    // SAFETY: killpg and kill only deliver a signal; no memory is shared.
    if unsafe { libc::killpg(pid, signal) } == 0 {
        return Ok(());
    }
    if unsafe { libc::kill(pid, signal) } == 0 {
        return Ok(());
    }
    Err(io::Error::last_os_error())
}

/// Whether a signalling error means the process is already gone
pub fn is_no_such_process(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::ESRCH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_port_is_free() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!port_is_free(port));
        drop(listener);
        assert!(port_is_free(port));
    }

    #[test]
    fn test_signal_invalid_pid() {
        assert!(signal_process(0, libc::SIGTERM).is_err());
        assert!(signal_process(u32::MAX, libc::SIGTERM).is_err());
    }

    #[tokio::test]
    async fn test_spawn_writes_log_and_can_be_signalled() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("logs/svc.log");
        let launch = LaunchSpec {
            args: vec!["-c".into(), "echo started; exec sleep 30".into()],
            env: vec![],
        };

        let mut child = spawn_service(Path::new("/bin/sh"), &launch, &dir.path().join("data"), &log)
            .await
            .unwrap();
        let pid = child.id().unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        signal_process(pid, libc::SIGTERM).unwrap();
        let status = child.wait().await.unwrap();
        assert!(!status.success());

        let contents = std::fs::read_to_string(&log).unwrap();
        assert!(contents.contains("started"));
        assert!(matches!(
            signal_process(pid, libc::SIGTERM),
            Err(e) if is_no_such_process(&e)
        ));
    }
}
