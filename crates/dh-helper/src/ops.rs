//! Privileged operations
//!
//! [`SystemOps`] performs the real work with the platform tools. Every
//! mutating operation is idempotent and reports whether it changed
//! anything.

use std::ffi::OsStr;
use std::io;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use dh_core::certs;
use dh_protocol::CertInfo;

use crate::error::RequestError;

/// Mode given to directories created for the orchestrator
const DIRECTORY_MODE: u32 = 0o755;

/// File name the CA gets in the Linux anchor directory
const LINUX_ANCHOR_NAME: &str = "devhost-local-ca.crt";

const LINUX_ANCHOR_DIR: &str = "/usr/local/share/ca-certificates";

const MACOS_SYSTEM_KEYCHAIN: &str = "/Library/Keychains/System.keychain";

/// Written into every daemon definition the helper installs
const MANAGED_MARKER: &str = "Managed by devhost-helper";

/// The operations behind each helper request
#[async_trait]
pub trait PrivilegedOps: Send + Sync {
    async fn cert_info(&self, path: &Path) -> Result<CertInfo, RequestError>;

    async fn is_trusted(&self, path: &Path) -> Result<bool, RequestError>;

    /// Returns false when the CA was already trusted
    async fn trust_ca(&self, path: &Path) -> Result<bool, RequestError>;

    /// Returns false when an identical definition was already installed
    async fn install_daemon(
        &self,
        label: &str,
        program: &Path,
        args: &[String],
    ) -> Result<bool, RequestError>;

    /// Returns false when no definition existed
    async fn uninstall_daemon(&self, label: &str) -> Result<bool, RequestError>;

    /// Returns false when the directory already had the right owner and mode
    async fn setup_directory(&self, path: &Path, owner_uid: u32) -> Result<bool, RequestError>;
}

/// Daemon definition flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonFormat {
    Launchd,
    Systemd,
}

impl DaemonFormat {
    pub fn current() -> Self {
        if cfg!(target_os = "macos") {
            DaemonFormat::Launchd
        } else {
            DaemonFormat::Systemd
        }
    }

    fn default_dir(&self) -> PathBuf {
        match self {
            DaemonFormat::Launchd => PathBuf::from("/Library/LaunchDaemons"),
            DaemonFormat::Systemd => PathBuf::from("/etc/systemd/system"),
        }
    }

    fn file_name(&self, label: &str) -> String {
        match self {
            DaemonFormat::Launchd => format!("{}.plist", label),
            DaemonFormat::Systemd => format!("{}.service", label),
        }
    }

    /// Render the definition file
    pub fn render(&self, label: &str, program: &Path, args: &[String]) -> String {
        match self {
            DaemonFormat::Launchd => render_plist(label, program, args),
            DaemonFormat::Systemd => render_unit(label, program, args),
        }
    }
}

/// Operations backed by the platform's own tools
pub struct SystemOps {
    format: DaemonFormat,
    /// Where definitions are written; activation is skipped when overridden
    daemon_dir: Option<PathBuf>,
}

impl SystemOps {
    pub fn new(daemon_dir: Option<PathBuf>) -> Self {
        Self {
            format: DaemonFormat::current(),
            daemon_dir,
        }
    }

    fn daemon_file(&self, label: &str) -> PathBuf {
        self.daemon_dir
            .clone()
            .unwrap_or_else(|| self.format.default_dir())
            .join(self.format.file_name(label))
    }

    /// Only definitions in the system directory are loaded and unloaded
    fn activates(&self) -> bool {
        self.daemon_dir.is_none()
    }

    async fn activate(&self, label: &str, file: &Path) -> Result<(), RequestError> {
        match self.format {
            DaemonFormat::Launchd => {
                // Reload so a changed definition takes effect
                let _ = run("launchctl", [OsStr::new("unload"), file.as_os_str()]).await;
                run("launchctl", [OsStr::new("load"), OsStr::new("-w"), file.as_os_str()]).await
            }
            DaemonFormat::Systemd => {
                run("systemctl", [OsStr::new("daemon-reload")]).await?;
                let unit = self.format.file_name(label);
                run(
                    "systemctl",
                    [OsStr::new("enable"), OsStr::new("--now"), OsStr::new(&unit)],
                )
                .await
            }
        }
    }

    async fn deactivate(&self, label: &str, file: &Path) -> Result<(), RequestError> {
        match self.format {
            DaemonFormat::Launchd => {
                run("launchctl", [OsStr::new("unload"), OsStr::new("-w"), file.as_os_str()]).await
            }
            DaemonFormat::Systemd => {
                let unit = self.format.file_name(label);
                run(
                    "systemctl",
                    [OsStr::new("disable"), OsStr::new("--now"), OsStr::new(&unit)],
                )
                .await
            }
        }
    }
}

#[async_trait]
impl PrivilegedOps for SystemOps {
    async fn cert_info(&self, path: &Path) -> Result<CertInfo, RequestError> {
        Ok(certs::inspect_certificate(path).await?)
    }

    async fn is_trusted(&self, path: &Path) -> Result<bool, RequestError> {
        if !certs::inspect_certificate(path).await?.exists {
            return Err(RequestError::NotFound(path.display().to_string()));
        }
        Ok(certs::is_trusted_by_os(path).await?)
    }

    async fn trust_ca(&self, path: &Path) -> Result<bool, RequestError> {
        if !certs::inspect_certificate(path).await?.exists {
            return Err(RequestError::NotFound(path.display().to_string()));
        }
        if certs::is_trusted_by_os(path).await? {
            return Ok(false);
        }

        match self.format {
            DaemonFormat::Launchd => {
                run(
                    "security",
                    [
                        OsStr::new("add-trusted-cert"),
                        OsStr::new("-d"),
                        OsStr::new("-r"),
                        OsStr::new("trustRoot"),
                        OsStr::new("-k"),
                        OsStr::new(MACOS_SYSTEM_KEYCHAIN),
                        path.as_os_str(),
                    ],
                )
                .await?;
            }
            DaemonFormat::Systemd => {
                let anchor = Path::new(LINUX_ANCHOR_DIR).join(LINUX_ANCHOR_NAME);
                let contents = tokio::fs::read(path).await?;
                if tokio::fs::read(&anchor).await.ok().as_deref() != Some(contents.as_slice()) {
                    tokio::fs::create_dir_all(LINUX_ANCHOR_DIR).await?;
                    tokio::fs::write(&anchor, &contents).await?;
                }
                run("update-ca-certificates", std::iter::empty::<&OsStr>()).await?;
            }
        }
        tracing::info!("Trusted CA {}", path.display());
        Ok(true)
    }

    async fn install_daemon(
        &self,
        label: &str,
        program: &Path,
        args: &[String],
    ) -> Result<bool, RequestError> {
        let file = self.daemon_file(label);
        let contents = self.format.render(label, program, args);
        match read_definition(&file).await? {
            Some(existing) if existing == contents => return Ok(false),
            Some(existing) => ensure_managed(label, &existing)?,
            None => {}
        }

        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&file, contents).await?;
        tokio::fs::set_permissions(&file, std::fs::Permissions::from_mode(0o644)).await?;

        if self.activates() {
            self.activate(label, &file).await?;
        }
        tracing::info!("Installed daemon {} at {}", label, file.display());
        Ok(true)
    }

    async fn uninstall_daemon(&self, label: &str) -> Result<bool, RequestError> {
        let file = self.daemon_file(label);
        let Some(existing) = read_definition(&file).await? else {
            return Ok(false);
        };
        ensure_managed(label, &existing)?;
        if self.activates() {
            if let Err(e) = self.deactivate(label, &file).await {
                tracing::warn!("Failed to unload {} (removing anyway): {}", label, e);
            }
        }
        tokio::fs::remove_file(&file).await?;
        tracing::info!("Uninstalled daemon {}", label);
        Ok(true)
    }

    async fn setup_directory(&self, path: &Path, owner_uid: u32) -> Result<bool, RequestError> {
        let mut changed = false;
        match tokio::fs::symlink_metadata(path).await {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(RequestError::InvalidPath(format!(
                    "{} is a symlink",
                    path.display()
                )));
            }
            Ok(meta) if !meta.is_dir() => {
                return Err(RequestError::InvalidPath(format!(
                    "{} exists and is not a directory",
                    path.display()
                )));
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tokio::fs::create_dir_all(path).await?;
                changed = true;
            }
            Err(e) => return Err(e.into()),
        }

        changed |= adopt_directory(path, owner_uid)?;
        if changed {
            tracing::info!("Prepared {} for uid {}", path.display(), owner_uid);
        }
        Ok(changed)
    }
}

/// Give the directory at `path` to `uid` with [`DIRECTORY_MODE`]
///
/// Works on an open handle so a symlink swapped in after the checks is never
/// followed.
fn adopt_directory(path: &Path, uid: u32) -> Result<bool, RequestError> {
    let dir = std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NOFOLLOW | libc::O_DIRECTORY)
        .open(path)
        .map_err(|e| match e.raw_os_error() {
            Some(libc::ELOOP) | Some(libc::ENOTDIR) => RequestError::InvalidPath(format!(
                "{} is not a plain directory",
                path.display()
            )),
            _ => RequestError::Io(e),
        })?;

    let meta = dir.metadata()?;
    let mut changed = false;
    if meta.uid() != uid {
        std::os::unix::fs::fchown(&dir, Some(uid), None)?;
        changed = true;
    }
    if meta.mode() & 0o7777 != DIRECTORY_MODE {
        dir.set_permissions(std::fs::Permissions::from_mode(DIRECTORY_MODE))?;
        changed = true;
    }
    Ok(changed)
}

/// Current contents of a daemon definition, if one exists
async fn read_definition(file: &Path) -> Result<Option<String>, RequestError> {
    match tokio::fs::read(file).await {
        Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Refuse to touch a definition the helper did not write
fn ensure_managed(label: &str, definition: &str) -> Result<(), RequestError> {
    if definition.contains(MANAGED_MARKER) {
        return Ok(());
    }
    Err(RequestError::PermissionDenied(format!(
        "daemon {} was not installed by devhost",
        label
    )))
}

/// Run a system command to completion, failing on a non-zero exit
async fn run<I, S>(program: &str, args: I) -> Result<(), RequestError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| RequestError::CommandFailed {
            command: program.to_string(),
            detail: e.to_string(),
        })?;

    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(RequestError::CommandFailed {
        command: program.to_string(),
        detail: format!("{}: {}", output.status, stderr.trim()),
    })
}

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn render_plist(label: &str, program: &Path, args: &[String]) -> String {
    let mut arguments = format!(
        "        <string>{}</string>\n",
        xml_escape(&program.display().to_string())
    );
    for arg in args {
        arguments.push_str(&format!("        <string>{}</string>\n", xml_escape(arg)));
    }
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<!-- {marker} -->
<plist version="1.0">
<dict>
    <key>Label</key>
    <string>{label}</string>
    <key>ProgramArguments</key>
    <array>
{arguments}    </array>
    <key>RunAtLoad</key>
    <true/>
    <key>KeepAlive</key>
    <true/>
</dict>
</plist>
"#,
        marker = MANAGED_MARKER,
        label = xml_escape(label),
        arguments = arguments,
    )
}

/// Quote one word for a systemd `ExecStart=` line
fn unit_word(word: &str) -> String {
    if !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-=:,@+".contains(c))
    {
        return word.to_string();
    }
    let escaped = word
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('%', "%%")
        .replace('$', "$$");
    format!("\"{}\"", escaped)
}

fn render_unit(label: &str, program: &Path, args: &[String]) -> String {
    let mut exec = unit_word(&program.display().to_string());
    for arg in args {
        exec.push(' ');
        exec.push_str(&unit_word(arg));
    }
    format!(
        "# {marker}\n[Unit]\nDescription={label}\nAfter=network.target\n\n\
         [Service]\nExecStart={exec}\nRestart=on-failure\n\n\
         [Install]\nWantedBy=multi-user.target\n",
        marker = MANAGED_MARKER,
        label = label,
        exec = exec,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_unit_quotes_arguments() {
        let unit = render_unit(
            "dev.devhost.dns",
            Path::new("/opt/devhost/bin/devhost"),
            &["--data-dir".into(), "/home/ada/My Dev".into(), "100%".into()],
        );
        assert!(unit.contains(
            "ExecStart=/opt/devhost/bin/devhost --data-dir \"/home/ada/My Dev\" \"100%%\"\n"
        ));
        assert!(unit.contains("Description=dev.devhost.dns\n"));
        assert!(unit.starts_with(&format!("# {}\n", MANAGED_MARKER)));
    }

    #[test]
    fn test_plist_escapes_arguments() {
        let plist = render_plist("dev.devhost.dns", Path::new("/opt/devhost/bin/devhost"), &["a<b".into()]);
        assert!(plist.contains("<string>dev.devhost.dns</string>"));
        assert!(plist.contains("<string>/opt/devhost/bin/devhost</string>"));
        assert!(plist.contains("<string>a&lt;b</string>"));
        assert!(plist.contains(MANAGED_MARKER));
    }

    #[tokio::test]
    async fn test_install_daemon_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let ops = SystemOps::new(Some(dir.path().to_path_buf()));
        let program = Path::new("/opt/devhost/bin/devhost");
        let args = vec!["--foreground".to_string()];

        assert!(ops.install_daemon("dev.devhost.dns", program, &args).await.unwrap());
        assert!(!ops.install_daemon("dev.devhost.dns", program, &args).await.unwrap());

        let file = ops.daemon_file("dev.devhost.dns");
        assert!(file.starts_with(dir.path()));
        assert!(file.exists());

        assert!(ops.uninstall_daemon("dev.devhost.dns").await.unwrap());
        assert!(!ops.uninstall_daemon("dev.devhost.dns").await.unwrap());
        assert!(!file.exists());
    }

    #[tokio::test]
    async fn test_setup_directory_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("run").join("devhost");
        let ops = SystemOps::new(None);
        // SAFETY: geteuid has no preconditions
        let me = unsafe { libc::geteuid() };

        assert!(ops.setup_directory(&target, me).await.unwrap());
        assert!(!ops.setup_directory(&target, me).await.unwrap());

        let meta = std::fs::metadata(&target).unwrap();
        assert_eq!(meta.mode() & 0o777, DIRECTORY_MODE);
        assert_eq!(meta.uid(), me);
    }

    #[tokio::test]
    async fn test_setup_directory_rejects_files() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("plain");
        std::fs::write(&file, b"x").unwrap();
        let ops = SystemOps::new(None);
        assert!(matches!(
            ops.setup_directory(&file, 0).await,
            Err(RequestError::InvalidPath(_))
        ));
    }

    #[tokio::test]
    async fn test_trust_missing_ca_is_not_found() {
        let dir = TempDir::new().unwrap();
        let ops = SystemOps::new(None);
        assert!(matches!(
            ops.trust_ca(&dir.path().join("root.crt")).await,
            Err(RequestError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_foreign_definitions_are_left_alone() {
        let dir = TempDir::new().unwrap();
        let ops = SystemOps::new(Some(dir.path().to_path_buf()));
        let file = ops.daemon_file("dev.devhost.dns");
        let foreign = "[Service]\nExecStart=/usr/sbin/something\n";
        std::fs::write(&file, foreign).unwrap();

        assert!(matches!(
            ops.uninstall_daemon("dev.devhost.dns").await,
            Err(RequestError::PermissionDenied(_))
        ));
        assert!(matches!(
            ops.install_daemon("dev.devhost.dns", Path::new("/opt/devhost/bin/devhost"), &[])
                .await,
            Err(RequestError::PermissionDenied(_))
        ));
        assert_eq!(std::fs::read_to_string(&file).unwrap(), foreign);
    }

    #[tokio::test]
    async fn test_setup_directory_refuses_symlinks() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("elsewhere");
        std::fs::create_dir_all(&target).unwrap();
        std::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o700)).unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&target, &link).unwrap();
        let ops = SystemOps::new(None);
        // SAFETY: geteuid has no preconditions
        let me = unsafe { libc::geteuid() };

        assert!(matches!(
            ops.setup_directory(&link, me).await,
            Err(RequestError::InvalidPath(_))
        ));
        let meta = std::fs::metadata(&target).unwrap();
        assert_eq!(meta.mode() & 0o777, 0o700);
    }
}

