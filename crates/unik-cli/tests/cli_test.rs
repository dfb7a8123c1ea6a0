//! End-to-end tests for the unik binary

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use tempfile::TempDir;

/// Run unik inside `dir` with HOME pointed at it, so no user config leaks in
fn unik(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_unik"))
        .args(args)
        .current_dir(dir)
        .env("HOME", dir)
        .env_remove("UNIK_KLIB_DIR")
        .env_remove("UNIK_TARGET_ROOT")
        .env_remove("UNIK_BOOT")
        .env_remove("UNIK_IMAGE_SIZE")
        .output()
        .expect("Failed to execute unik")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn build_sample(dir: &Path) -> String {
    fs::create_dir_all(dir.join("bin")).unwrap();
    fs::write(dir.join("bin/app"), b"\x7fELF app").unwrap();
    fs::create_dir_all(dir.join("etc")).unwrap();
    fs::write(dir.join("etc/motd"), b"welcome\n").unwrap();

    let output = unik(
        dir,
        &[
            "mkfs",
            "app.img",
            "--program",
            "bin/app",
            "--arg",
            "app",
            "--arg",
            "--verbose",
            "--env",
            "MODE=test",
            "--file",
            "/etc/motd=etc/motd",
            "--label",
            "sample",
        ],
    );
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    stdout(&output).trim().to_string()
}

#[test]
fn test_mkfs_prints_uuid() {
    let dir = TempDir::new().unwrap();
    let uuid = build_sample(dir.path());
    assert_eq!(uuid.len(), 36);
    assert_eq!(uuid.matches('-').count(), 4);

    let info = unik(dir.path(), &["info", "app.img", "--json"]);
    assert!(info.status.success());
    let summary: serde_json::Value = serde_json::from_str(&stdout(&info)).unwrap();
    assert_eq!(summary["uuid"], uuid.as_str());
    assert_eq!(summary["label"], "sample");
    assert_eq!(summary["program"], "/bin/app");
    assert_eq!(summary["arguments"], serde_json::json!(["app", "--verbose"]));
}

#[test]
fn test_ls_and_cat() {
    let dir = TempDir::new().unwrap();
    build_sample(dir.path());

    let ls = unik(dir.path(), &["ls", "app.img"]);
    assert!(ls.status.success());
    assert_eq!(stdout(&ls), "bin\netc\n");

    let cat = unik(dir.path(), &["cat", "app.img", "/etc/motd"]);
    assert!(cat.status.success());
    assert_eq!(stdout(&cat), "welcome\n");

    let missing = unik(dir.path(), &["cat", "app.img", "/etc/nope"]);
    assert!(!missing.status.success());
}

#[test]
fn test_env_json() {
    let dir = TempDir::new().unwrap();
    build_sample(dir.path());

    let env = unik(dir.path(), &["env", "app.img", "--json"]);
    assert!(env.status.success());
    let vars: serde_json::Value = serde_json::from_str(&stdout(&env)).unwrap();
    assert_eq!(vars, serde_json::json!({ "MODE": "test" }));
}

#[test]
fn test_cp_recursive() {
    let dir = TempDir::new().unwrap();
    build_sample(dir.path());

    let out = dir.path().join("extracted");
    let cp = unik(dir.path(), &["cp", "app.img", "/etc", "extracted", "-r"]);
    assert!(cp.status.success(), "{}", String::from_utf8_lossy(&cp.stderr));
    assert_eq!(fs::read(out.join("motd")).unwrap(), b"welcome\n");

    let no_recurse = unik(dir.path(), &["cp", "app.img", "/etc", "again"]);
    assert!(!no_recurse.status.success());
}

#[test]
fn test_bootfs_missing_on_raw_image() {
    let dir = TempDir::new().unwrap();
    build_sample(dir.path());

    let ls = unik(dir.path(), &["ls", "app.img", "--bootfs"]);
    assert!(!ls.status.success());
    assert!(String::from_utf8_lossy(&ls.stderr).contains("bootfs not found"));
}

#[test]
fn test_mkfs_rejects_bad_size() {
    let dir = TempDir::new().unwrap();
    let output = unik(dir.path(), &["mkfs", "bad.img", "--size", "2s"]);
    assert!(!output.status.success());
    assert!(!dir.path().join("bad.img").exists());
}

#[test]
fn test_config_show_and_path() {
    let dir = TempDir::new().unwrap();

    let show = unik(dir.path(), &["config", "show"]);
    assert!(show.status.success());
    let text = stdout(&show);
    assert!(text.contains("[mkfs]"));
    assert!(text.contains("[log]"));

    let path = unik(dir.path(), &["config", "path"]);
    assert!(stdout(&path).contains("Global:"));
    assert!(stdout(&path).contains(".unik/config.toml"));
}

#[test]
fn test_project_config_supplies_label() {
    let dir = TempDir::new().unwrap();
    let init = unik(dir.path(), &["config", "init"]);
    assert!(init.status.success());

    let config_path = dir.path().join(".unik/config.toml");
    assert!(fs::read_to_string(&config_path).unwrap().contains("[mkfs]"));
    fs::write(&config_path, "[mkfs]\nlabel = \"from-config\"\n").unwrap();

    let again = unik(dir.path(), &["config", "init"]);
    assert!(!again.status.success());

    assert!(unik(dir.path(), &["mkfs", "plain.img"]).status.success());
    let info = unik(dir.path(), &["info", "plain.img", "--json"]);
    let summary: serde_json::Value = serde_json::from_str(&stdout(&info)).unwrap();
    assert_eq!(summary["label"], "from-config");
}
