use std::process::{Command, Output};

fn troop(dir: &std::path::Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_troop"))
        .current_dir(dir)
        .env_remove("RUST_LOG")
        .env_remove("TROOP_CONFIG")
        .arg("--config")
        .arg(dir.join("config.yaml"))
        .args(args)
        .output()
        .unwrap()
}

#[test]
fn reserved_agent_name_fails() {
    let dir = tempfile::tempdir().unwrap();
    let out = troop(dir.path(), &["agent", "add", "config", "--instructions", "hi"]);
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("reserved"), "{stderr}");
    assert!(!dir.path().join("config.yaml").exists());
}

#[test]
fn log_filter_can_come_from_dotenv() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join(".env"), "RUST_LOG=troop=debug\n").unwrap();
    let out = troop(dir.path(), &["config", "check"]);
    assert!(out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("no config file"), "{stderr}");
}
