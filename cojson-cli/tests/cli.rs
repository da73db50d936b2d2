use std::process::Command;

#[test]
fn test_init_config_writes_toml() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cojson.toml");

    let status = Command::new(env!("CARGO_BIN_EXE_cojson"))
        .args(["init-config"])
        .arg(&path)
        .env("COJSON_SERVER_BIND_ADDRESS", "127.0.0.1:4999")
        .status()
        .unwrap();
    assert!(status.success());

    let written = std::fs::read_to_string(&path).unwrap();
    assert!(written.contains("[server]"));
    assert!(written.contains("127.0.0.1:4999"));
}

#[test]
fn test_rejects_unknown_storage_backend() {
    let output = Command::new(env!("CARGO_BIN_EXE_cojson"))
        .args(["serve", "--storage", "floppy"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("floppy"));
}
