#![allow(missing_docs)]

mod common;

use celery_fleet_helper::supervisor::pidfile::PidFile;
use common::Project;

#[test]
fn pid_file_names_cannot_escape_the_pid_dir() {
    let dir = tempfile::tempdir().expect("tempdir");
    for name in ["../evil", "a/b", "", ".", "..", "worker.pid"] {
        let err = PidFile::new(dir.path(), name).expect_err(name);
        assert_eq!(err.code(), "CFH-4005", "{name:?}");
    }
    assert!(PidFile::new(dir.path(), "embeddings_gpu").is_ok());
}

#[test]
fn logs_rejects_path_like_names() {
    let project = Project::new();
    std::fs::write(project.path().join("secret.log"), "do not print\n").expect("write");
    let result = project.run("logs_traversal", &["logs", "../secret"]);
    assert_eq!(result.status.code(), Some(1));
    assert!(result.stderr.contains("CFH-4005"), "log: {}", result.log_path.display());
    assert!(!result.stdout.contains("do not print"));
}
