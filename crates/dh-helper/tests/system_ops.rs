//! Helper boundary tests against the real operations
//!
//! `SystemOps` writes daemon definitions into a temp directory, so nothing
//! is activated; the paths it is asked to touch live under temp roots.

use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempDir;

use dh_core::config::HelperConfig;
use dh_helper::{HelperServer, SystemOps};
use dh_protocol::{FailureReason, HelperRequest, HelperResponse};

struct Sandbox {
    dir: TempDir,
    server: HelperServer,
    uid: u32,
}

impl Sandbox {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let home = dir.path().join("home");
        let programs = dir.path().join("opt");
        let units = dir.path().join("units");
        for path in [&home, &programs, &units, &dir.path().join("etc")] {
            std::fs::create_dir_all(path).unwrap();
        }

        let config = HelperConfig {
            socket_path: dir.path().join("helper.sock"),
            allowed_roots: vec![home],
            program_roots: vec![programs],
            daemon_dir: Some(units.clone()),
            ..HelperConfig::default()
        };
        let server = HelperServer::new(config, Arc::new(SystemOps::new(Some(units))));
        let uid = std::fs::metadata(dir.path()).unwrap().uid();
        Self { dir, server, uid }
    }

    fn path(&self, relative: &str) -> PathBuf {
        self.dir.path().join(relative)
    }

    /// A program file under `relative` with the given mode, in a 0755 directory
    fn program(&self, relative: &str, mode: u32) -> PathBuf {
        let program = self.path(relative);
        let parent = program.parent().unwrap();
        std::fs::create_dir_all(parent).unwrap();
        std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o755)).unwrap();
        std::fs::write(&program, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&program, std::fs::Permissions::from_mode(mode)).unwrap();
        program
    }

    fn unit_files(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(self.path("units"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    async fn send(&self, request: HelperRequest) -> HelperResponse {
        self.server.dispatch(request, self.uid).await
    }
}

fn assert_failure(response: HelperResponse, expected: FailureReason) {
    match response {
        HelperResponse::Failure { reason, .. } => assert_eq!(reason, expected),
        other => panic!("Expected {:?} failure, got {:?}", expected, other),
    }
}

#[tokio::test]
async fn test_symlink_out_of_allowed_roots_is_refused() {
    let sandbox = Sandbox::new();
    let etc = sandbox.path("etc");
    std::fs::set_permissions(&etc, std::fs::Permissions::from_mode(0o700)).unwrap();
    std::fs::write(etc.join("root.crt"), "not a certificate").unwrap();
    std::fs::create_dir_all(sandbox.path("home/ada")).unwrap();
    std::os::unix::fs::symlink(&etc, sandbox.path("home/ada/link")).unwrap();

    let response = sandbox
        .send(HelperRequest::SetupPrivilegedDirectory {
            path: sandbox.path("home/ada/link"),
            owner_uid: sandbox.uid,
        })
        .await;
    assert_failure(response, FailureReason::InvalidPath);
    assert_eq!(std::fs::metadata(&etc).unwrap().mode() & 0o777, 0o700);

    for request in [
        HelperRequest::GetCertInfo {
            path: sandbox.path("home/ada/link/root.crt"),
        },
        HelperRequest::TrustCa {
            path: sandbox.path("home/ada/link/root.crt"),
        },
    ] {
        assert_failure(sandbox.send(request).await, FailureReason::InvalidPath);
    }

    // A real directory under the root is still prepared
    let response = sandbox
        .send(HelperRequest::SetupPrivilegedDirectory {
            path: sandbox.path("home/ada/run"),
            owner_uid: sandbox.uid,
        })
        .await;
    assert_eq!(response, HelperResponse::Done { changed: true });
}

#[tokio::test]
async fn test_daemon_labels_stay_in_the_devhost_namespace() {
    let sandbox = Sandbox::new();
    let foreign = sandbox.path("units/sshd.service");
    std::fs::write(&foreign, "[Service]\nExecStart=/usr/sbin/sshd -D\n").unwrap();
    let program = sandbox.program("opt/bin/devhost", 0o755);

    assert_failure(
        sandbox
            .send(HelperRequest::UninstallDaemon {
                label: "sshd".into(),
            })
            .await,
        FailureReason::MalformedRequest,
    );
    assert_failure(
        sandbox
            .send(HelperRequest::InstallDaemon {
                label: "sshd".into(),
                program,
                args: vec![],
            })
            .await,
        FailureReason::MalformedRequest,
    );
    assert!(foreign.exists());
    assert_eq!(sandbox.unit_files(), vec!["sshd.service".to_string()]);
}

#[tokio::test]
async fn test_definitions_written_elsewhere_are_not_replaced() {
    let sandbox = Sandbox::new();
    let program = sandbox.program("opt/bin/devhost", 0o755);
    let label = "dev.devhost.dns";

    let install = HelperRequest::InstallDaemon {
        label: label.into(),
        program: program.clone(),
        args: vec![],
    };
    assert_eq!(sandbox.send(install.clone()).await, HelperResponse::Done { changed: true });
    let written = sandbox.unit_files();
    assert_eq!(written.len(), 1);
    let file = sandbox.path("units").join(&written[0]);
    // Replaced by hand, so the helper no longer owns it
    std::fs::write(&file, "hand written\n").unwrap();

    assert_failure(
        sandbox
            .send(HelperRequest::UninstallDaemon {
                label: label.into(),
            })
            .await,
        FailureReason::PermissionDenied,
    );
    assert_failure(sandbox.send(install).await, FailureReason::PermissionDenied);
    assert_eq!(std::fs::read_to_string(&file).unwrap(), "hand written\n");
}

#[tokio::test]
async fn test_daemon_program_must_be_guarded() {
    let sandbox = Sandbox::new();
    let label = "dev.devhost.proxy";

    // Under the user's home: outside the program roots even though path
    // requests may touch it
    let in_home = sandbox.program("home/ada/bin/evil", 0o755);
    assert_failure(
        sandbox
            .send(HelperRequest::InstallDaemon {
                label: label.into(),
                program: in_home,
                args: vec![],
            })
            .await,
        FailureReason::InvalidPath,
    );

    let writable = sandbox.program("opt/shared/devhost", 0o777);
    assert_failure(
        sandbox
            .send(HelperRequest::InstallDaemon {
                label: label.into(),
                program: writable,
                args: vec![],
            })
            .await,
        FailureReason::PermissionDenied,
    );

    // A symlink inside the program root pointing back into home
    let evil = sandbox.program("home/ada/bin/evil2", 0o755);
    std::os::unix::fs::symlink(&evil, sandbox.path("opt/bin-link")).unwrap();
    assert_failure(
        sandbox
            .send(HelperRequest::InstallDaemon {
                label: label.into(),
                program: sandbox.path("opt/bin-link"),
                args: vec![],
            })
            .await,
        FailureReason::InvalidPath,
    );
    assert!(sandbox.unit_files().is_empty());

    let program = sandbox.program("opt/bin/devhost", 0o755);
    let response = sandbox
        .send(HelperRequest::InstallDaemon {
            label: label.into(),
            program: program.clone(),
            args: vec!["--foreground".into()],
        })
        .await;
    assert_eq!(response, HelperResponse::Done { changed: true });

    let written = sandbox.unit_files();
    assert_eq!(written.len(), 1);
    assert!(written[0].starts_with(label));
    let definition = std::fs::read_to_string(sandbox.path("units").join(&written[0])).unwrap();
    assert!(definition.contains("Managed by devhost-helper"));
    assert!(definition.contains(&*program.file_name().unwrap().to_string_lossy()));

    let response = sandbox
        .send(HelperRequest::UninstallDaemon {
            label: label.into(),
        })
        .await;
    assert_eq!(response, HelperResponse::Done { changed: true });
    assert!(sandbox.unit_files().is_empty());
    assert!(program.exists());
}
