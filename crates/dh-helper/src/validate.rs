//! Request validation
//!
//! Every request is checked here before any operation runs. Paths must be
//! absolute, free of `..` and below one of the configured roots, both as
//! written and once symlinks are resolved. Daemon labels live in the devhost
//! namespace and daemon programs must be files the peer cannot rewrite.

use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::{Component, Path, PathBuf};

use dh_core::config::HelperConfig;
use dh_protocol::HelperRequest;

use crate::error::RequestError;

/// Longest accepted daemon label
pub const MAX_LABEL_LEN: usize = 128;

/// Most arguments a daemon definition may carry
pub const MAX_ARGS: usize = 64;

/// Every daemon the helper manages carries this label prefix
pub const DAEMON_LABEL_PREFIX: &str = "dev.devhost.";

/// Check a request against the helper configuration
///
/// Purely lexical; [`resolve_path`] and [`check_program`] finish the job
/// against the filesystem.
pub fn check_request(request: &HelperRequest, config: &HelperConfig) -> Result<(), RequestError> {
    match request {
        HelperRequest::GetCertInfo { path }
        | HelperRequest::IsCaddyCaTrusted { path }
        | HelperRequest::TrustCa { path }
        | HelperRequest::SetupPrivilegedDirectory { path, .. } => check_path(path, config),
        HelperRequest::InstallDaemon {
            label,
            program,
            args,
        } => {
            check_label(label)?;
            check_program_path(program, config)?;
            check_args(args)
        }
        HelperRequest::UninstallDaemon { label } => check_label(label),
        HelperRequest::Ping => Ok(()),
    }
}

/// Absolute, no traversal, no NUL, under an allowed root
pub fn check_path(path: &Path, config: &HelperConfig) -> Result<(), RequestError> {
    check_normalized(path)?;
    if !config.is_allowed(path) {
        return Err(RequestError::InvalidPath(format!(
            "{} is outside the allowed roots",
            path.display()
        )));
    }
    Ok(())
}

/// Absolute, no traversal, no NUL, under a program root
pub fn check_program_path(path: &Path, config: &HelperConfig) -> Result<(), RequestError> {
    check_normalized(path)?;
    if !config.is_program_allowed(path) {
        return Err(RequestError::InvalidPath(format!(
            "{} is outside the program roots",
            path.display()
        )));
    }
    Ok(())
}

fn check_normalized(path: &Path) -> Result<(), RequestError> {
    let shown = path.display().to_string();
    if !path.is_absolute() {
        return Err(RequestError::InvalidPath(format!("{} is not absolute", shown)));
    }
    if path.as_os_str().as_bytes().contains(&0) {
        return Err(RequestError::InvalidPath("path contains NUL".to_string()));
    }
    if path.components().any(|c| c == Component::ParentDir) {
        return Err(RequestError::InvalidPath(format!("{} is not normalized", shown)));
    }
    Ok(())
}

/// Resolve symlinks in `path` and check the result is still under `roots`
///
/// Components that do not exist yet are kept as written on top of the
/// nearest existing ancestor. A trailing dangling symlink stays unresolved;
/// operations refuse to follow it.
pub async fn resolve_path(path: &Path, roots: &[PathBuf]) -> Result<PathBuf, RequestError> {
    let mut existing = path.to_path_buf();
    let mut missing = Vec::new();
    let real = loop {
        match tokio::fs::canonicalize(&existing).await {
            Ok(real) => break real,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let Some(name) = existing.file_name().map(|n| n.to_os_string()) else {
                    return Err(e.into());
                };
                missing.push(name);
                existing.pop();
            }
            Err(e) => return Err(e.into()),
        }
    };
    let resolved = missing.into_iter().rev().fold(real, |acc, name| acc.join(name));

    for root in roots {
        let root = tokio::fs::canonicalize(root)
            .await
            .unwrap_or_else(|_| root.clone());
        if resolved.starts_with(&root) {
            return Ok(resolved);
        }
    }
    Err(RequestError::InvalidPath(format!(
        "{} resolves to {}, outside the allowed roots",
        path.display(),
        resolved.display()
    )))
}

/// A daemon program must be a regular file that only `owner` can change
///
/// The same holds for the directory it sits in, so the file cannot be
/// swapped out either.
pub async fn check_program(program: &Path, owner: u32) -> Result<(), RequestError> {
    let meta = tokio::fs::symlink_metadata(program).await?;
    if !meta.file_type().is_file() {
        return Err(RequestError::InvalidPath(format!(
            "{} is not a regular file",
            program.display()
        )));
    }
    check_guarded(program, &meta, owner)?;

    if let Some(parent) = program.parent() {
        let meta = tokio::fs::metadata(parent).await?;
        check_guarded(parent, &meta, owner)?;
    }
    Ok(())
}

fn check_guarded(path: &Path, meta: &std::fs::Metadata, owner: u32) -> Result<(), RequestError> {
    if meta.uid() != owner {
        return Err(RequestError::PermissionDenied(format!(
            "{} is owned by uid {}, not {}",
            path.display(),
            meta.uid(),
            owner
        )));
    }
    if meta.mode() & 0o022 != 0 {
        return Err(RequestError::PermissionDenied(format!(
            "{} is writable by group or others",
            path.display()
        )));
    }
    Ok(())
}

/// `dev.devhost.` followed by `[A-Za-z0-9][A-Za-z0-9.-]*`
pub fn check_label(label: &str) -> Result<(), RequestError> {
    let name = label.strip_prefix(DAEMON_LABEL_PREFIX).unwrap_or_default();
    let mut chars = name.chars();
    let valid_start = chars.next().is_some_and(|c| c.is_ascii_alphanumeric());
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-');
    if !valid_start || !valid_rest || label.len() > MAX_LABEL_LEN {
        return Err(RequestError::InvalidArgument(format!(
            "daemon label {:?} must be {}<name> with letters, digits, dots and hyphens",
            label, DAEMON_LABEL_PREFIX
        )));
    }
    Ok(())
}

pub fn check_args(args: &[String]) -> Result<(), RequestError> {
    if args.len() > MAX_ARGS {
        return Err(RequestError::InvalidArgument(format!(
            "at most {} arguments are accepted",
            MAX_ARGS
        )));
    }
    match args.iter().find(|a| a.contains(['\0', '\n', '\r'])) {
        Some(bad) => Err(RequestError::InvalidArgument(format!(
            "argument {:?} contains a control character",
            bad
        ))),
        None => Ok(()),
    }
}
