//! Supervisor against a stand-in manager script
#![cfg(unix)]

use evt_harness::supervisor::{Supervisor, SupervisorConfig, SupervisorError};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

/// Write an executable manager that records its arguments, runs `body`
/// and then idles until interrupted
fn fake_manager(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("manager");
    let script = format!(
        "#!/bin/sh\n\
         echo \"$@\" > \"{args}\"\n\
         trap 'echo interrupted; exit 0' INT TERM\n\
         {body}\n\
         while true; do sleep 0.1; done\n",
        args = dir.join("args").display(),
        body = body,
    );
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn config(dir: &Path, manager: PathBuf) -> SupervisorConfig {
    SupervisorConfig::new(dir.join("prefix"), dir.join("everest_config.yaml"))
        .with_manager_binary(manager)
        .with_startup_timeout(Duration::from_secs(5))
        .with_stop_timeout(Duration::from_secs(5))
        .with_working_dir(dir)
}

#[tokio::test]
async fn test_ready_then_stop() {
    let dir = TempDir::new().unwrap();
    let manager = fake_manager(dir.path(), "echo '[INFO] manager :: All modules are ready.'");

    let mut supervisor = Supervisor::start(config(dir.path(), manager)).await.unwrap();
    assert!(supervisor.is_running());
    assert!(supervisor.pid().is_some());

    let args = std::fs::read_to_string(dir.path().join("args")).unwrap();
    assert!(args.contains(&format!("--prefix {}", dir.path().join("prefix").display())));
    assert!(args.contains("--config"));
    assert!(!args.contains("--standalone"));

    let status = supervisor.stop().await.unwrap().unwrap();
    assert!(status.success());
    assert!(!supervisor.is_running());
}

#[tokio::test]
async fn test_standalone_probe_readiness() {
    let dir = TempDir::new().unwrap();
    let manager = fake_manager(dir.path(), "echo 'Not starting standalone module: probe' >&2");

    let mut supervisor = Supervisor::start(config(dir.path(), manager).with_standalone("probe"))
        .await
        .unwrap();
    let args = std::fs::read_to_string(dir.path().join("args")).unwrap();
    assert!(args.contains("--standalone probe"));
    assert!(supervisor
        .last_lines()
        .iter()
        .any(|l| l.contains("Not starting standalone module")));

    supervisor.stop().await.unwrap();
}

#[tokio::test]
async fn test_startup_timeout_reports_tail() {
    let dir = TempDir::new().unwrap();
    let manager = fake_manager(dir.path(), "echo 'loading modules'");

    let err = Supervisor::start(config(dir.path(), manager).with_startup_timeout(Duration::from_millis(500)))
        .await
        .err()
        .unwrap();
    match err {
        SupervisorError::StartupTimeout { last_lines, .. } => {
            assert!(last_lines.iter().any(|l| l == "loading modules"));
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn test_early_exit_is_reported() {
    let dir = TempDir::new().unwrap();
    let manager = fake_manager(dir.path(), "echo 'config invalid' >&2; exit 3");

    let err = Supervisor::start(config(dir.path(), manager)).await.err().unwrap();
    match err {
        SupervisorError::ExitedEarly { status, last_lines } => {
            assert_eq!(status.code(), Some(3));
            assert!(last_lines.iter().any(|l| l == "config invalid"));
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn test_missing_binary() {
    let dir = TempDir::new().unwrap();
    let err = Supervisor::start(config(dir.path(), dir.path().join("no-such-manager")))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, SupervisorError::Spawn { .. }));
}

#[tokio::test]
async fn test_user_config_displaced_and_temp_dirs_removed() {
    let dir = TempDir::new().unwrap();
    let manager = fake_manager(dir.path(), "echo 'all modules are ready'");

    let template = dir.path().join("config-sil-ocpp.yaml");
    std::fs::write(&template, "active_modules: {}\n").unwrap();
    let user_config = dir.path().join("user-config").join("config-sil-ocpp.yaml");
    std::fs::create_dir_all(user_config.parent().unwrap()).unwrap();
    std::fs::write(&user_config, "active_modules: {}\n").unwrap();

    let mut supervisor = Supervisor::start(config(dir.path(), manager).with_template(&template))
        .await
        .unwrap();
    assert!(!user_config.exists());

    let session = TempDir::new().unwrap();
    let session_path = session.path().to_path_buf();
    supervisor.adopt(session);

    supervisor.stop().await.unwrap();
    assert!(user_config.is_file());
    assert!(!session_path.exists());
}
