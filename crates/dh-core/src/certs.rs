//! Local CA certificate inspection
//!
//! Both the orchestrator (when it can read the certificate itself) and the
//! privileged helper (when it cannot) use these functions, so the two paths
//! report identical metadata.

use std::io;
use std::path::Path;
use std::process::Stdio;

use dh_protocol::CertInfo;
use tokio::process::Command;

/// Read subject and expiry of the certificate at `path`
///
/// A missing file is reported as `CertInfo { exists: false, .. }`. A file
/// that exists but cannot be read yields the underlying I/O error so the
/// caller can decide to escalate. If the certificate tooling itself is
/// unavailable, existence is still reported without name or expiry.
pub async fn inspect_certificate(path: &Path) -> io::Result<CertInfo> {
    match tokio::fs::File::open(path).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(CertInfo::missing()),
        Err(e) => return Err(e),
    }

    let output = Command::new("openssl")
        .args(["x509", "-noout", "-subject", "-enddate", "-in"])
        .arg(path)
        .stdin(Stdio::null())
        .output()
        .await;

    let (name, expiry) = match output {
        Ok(out) if out.status.success() => parse_x509_output(&String::from_utf8_lossy(&out.stdout)),
        Ok(out) => {
            tracing::warn!(
                "openssl could not parse {}: {}",
                path.display(),
                String::from_utf8_lossy(&out.stderr).trim()
            );
            (None, None)
        }
        Err(e) => {
            tracing::warn!("openssl unavailable, reporting bare existence: {}", e);
            (None, None)
        }
    };

    Ok(CertInfo {
        exists: true,
        name,
        expiry,
    })
}

/// Extract the subject common name and `notAfter` from `openssl x509` output
pub fn parse_x509_output(output: &str) -> (Option<String>, Option<String>) {
    let mut name = None;
    let mut expiry = None;

    for line in output.lines() {
        let line = line.trim();
        if let Some(subject) = line.strip_prefix("subject=") {
            name = Some(common_name(subject).unwrap_or_else(|| subject.trim().to_string()));
        } else if let Some(end) = line.strip_prefix("notAfter=") {
            expiry = Some(end.trim().to_string());
        }
    }

    (name, expiry)
}

/// `CN` value from either `CN = x, O = y` or `/O=y/CN=x` subject formats
fn common_name(subject: &str) -> Option<String> {
    subject
        .split([',', '/'])
        .map(str::trim)
        .find_map(|part| {
            let (key, value) = part.split_once('=')?;
            (key.trim() == "CN").then(|| value.trim().to_string())
        })
}

/// Ask the OS whether the certificate at `path` is a trusted root
///
/// Uses `security verify-cert` on macOS and `openssl verify` against the
/// system bundle elsewhere. A non-zero exit means "not trusted".
pub async fn is_trusted_by_os(path: &Path) -> io::Result<bool> {
    let mut command = if cfg!(target_os = "macos") {
        let mut c = Command::new("security");
        c.args(["verify-cert", "-L", "-c"]).arg(path);
        c
    } else {
        let mut c = Command::new("openssl");
        c.arg("verify").arg(path);
        c
    };

    let status = command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await?;
    Ok(status.success())
}
