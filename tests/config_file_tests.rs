// Integration tests for migration file parsing
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use vmshift::{DiskFormat, GuestOs, MigrationFile, MigrationPath};

fn example_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("contrib/migration.example.toml")
}

#[test]
fn test_example_migration_file_is_valid_toml() {
    let path = example_path();
    assert!(path.exists(), "example migration file should exist");

    let content = fs::read_to_string(&path).expect("Should be able to read example");
    let value: toml::Value = toml::from_str(&content).expect("Example should be valid TOML");

    for section in ["source", "destination", "vm", "staging", "timeouts", "conversion"] {
        assert!(value.get(section).is_some(), "missing [{}] section", section);
    }
    assert!(!content.contains("password ="), "example must not carry passwords");
}

#[test]
fn test_example_migration_file_builds_a_request() {
    let mut file = MigrationFile::from_file(example_path()).unwrap();
    file.destination.password = Some("secret".to_string());

    let request = file.into_request().unwrap();
    assert_eq!(request.vm_name, "WinVM");
    assert_eq!(request.vmid, 200);
    assert_eq!(request.node, "pve01");
    assert_eq!(request.mode, MigrationPath::Warm);
    assert_eq!(request.guest_os, GuestOs::Windows);
    assert_eq!(request.disk_format, DiskFormat::Qcow2);
    assert_eq!(request.staging_dir, PathBuf::from("/mnt/vmshift-staging"));

    let timeouts = file.timeouts();
    assert_eq!(timeouts.stop, Duration::from_secs(300));
    assert_eq!(timeouts.import, Duration::from_secs(2 * 60 * 60));

    assert_eq!(
        file.staging.remote_dir.as_deref(),
        Some(r"\\pve01\vmshift-staging")
    );
    assert!(file.conversion.guest_tools_command.contains("virtio-win-guest-tools.exe"));
}

#[test]
fn test_missing_required_fields_are_reported() {
    let file = MigrationFile::from_str("[vm]\ncores = 2\n").unwrap();
    let err = file.into_request().unwrap_err();
    assert!(err.to_string().contains("source.host"));
}
