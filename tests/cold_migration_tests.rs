// Integration tests for the cold migration path
mod common;

use common::{Harness, api_rejected, connection_lost};
use std::time::Duration;
use vmshift::artifacts::ArtifactRole;
use vmshift::orchestrator::planned_steps;
use vmshift::{DiskFormat, ErrorKind, GuestOs, MigrationError, MigrationPath, Phase};

#[tokio::test]
async fn test_cold_linux_migration_runs_every_step_once() {
    let harness = Harness::new();
    let request = harness.request("MyVM", 100, MigrationPath::Cold, GuestOs::Linux);

    let result = harness.orchestrator().run(&request).await;

    assert!(result.success, "unexpected failure: {}", result);
    assert_eq!(result.final_phase, Phase::Started);
    assert_eq!(result.phases(), MigrationPath::Cold.sequence());
    assert!(result.warnings.is_empty());

    let expected: Vec<String> =
        planned_steps(MigrationPath::Cold, GuestOs::Linux, DiskFormat::Qcow2)
            .into_iter()
            .flat_map(|(_, calls)| calls)
            .map(str::to_string)
            .collect();
    assert_eq!(harness.recorder.calls(), expected);
    assert!(!harness.recorder.called("destination.attach_media"));
    assert_eq!(harness.recorder.inject_flags(), vec![false]);

    let handle = result.destination.as_ref().expect("destination handle");
    assert_eq!(handle.vmid, 100);
}

#[tokio::test]
async fn test_cold_windows_migration_injects_drivers_and_attaches_media() {
    let harness = Harness::new();
    let request = harness.request("WinVM", 150, MigrationPath::Cold, GuestOs::Windows);

    let result = harness.orchestrator().run(&request).await;

    assert!(result.success);
    assert_eq!(harness.recorder.inject_flags(), vec![true]);
    let attach = harness.recorder.position("destination.attach_media").unwrap();
    let import = harness.recorder.position("destination.import_disk").unwrap();
    let start = harness.recorder.position("destination.start").unwrap();
    assert!(import < attach && attach < start);
}

#[tokio::test]
async fn test_cold_imports_the_converted_disk() {
    let harness = Harness::new();
    let request = harness.request("MyVM", 100, MigrationPath::Cold, GuestOs::Linux);

    let result = harness.orchestrator().run(&request).await;

    let converted = result
        .artifacts
        .iter()
        .find(|(role, _)| *role == ArtifactRole::BaseDiskConverted)
        .map(|(_, path)| path.clone())
        .expect("converted artifact");
    assert_eq!(converted.extension().unwrap(), "qcow2");
    assert_eq!(harness.recorder.imported(), vec![converted.clone()]);
    assert!(converted.exists(), "staged artifacts are kept");
}

#[tokio::test]
async fn test_existing_vmid_conflicts_before_the_source_is_touched() {
    let mut harness = Harness::new();
    harness.existing = vec![100];
    let request = harness.request("MyVM", 100, MigrationPath::Cold, GuestOs::Linux);

    let result = harness.orchestrator().run(&request).await;

    assert!(!result.success);
    assert_eq!(result.final_phase, Phase::NotStarted);
    let error = result.error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::Conflict);
    assert!(!error.source_stopped);
    assert_eq!(harness.recorder.calls(), vec!["destination.exists"]);
    assert!(result.artifacts.is_empty());

    match result.into_result() {
        Err(MigrationError::Failed { phase, source }) => {
            assert_eq!(phase, Phase::NotStarted);
            assert!(matches!(*source, MigrationError::Conflict(100)));
        }
        other => panic!("expected Failed, got {:?}", other),
    }
}

#[tokio::test]
async fn test_export_timeout_leaves_source_stopped_and_nothing_created() {
    let mut harness = Harness::new();
    harness.timeouts.export = Duration::from_millis(50);
    harness
        .recorder
        .delay("source.export", Duration::from_secs(10));
    let request = harness.request("MyVM", 100, MigrationPath::Cold, GuestOs::Linux);

    let result = harness.orchestrator().run(&request).await;

    assert!(!result.success);
    assert_eq!(result.final_phase, Phase::SourceStopped);
    let error = result.error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::Timeout);
    assert!(error.source_stopped);
    assert!(!harness.recorder.called("destination.create_vm"));
    assert!(result.destination.is_none());
    assert!(result.to_string().contains("source VM is stopped"));

    let report: serde_json::Value = serde_json::from_str(&result.to_json().unwrap()).unwrap();
    assert_eq!(report["error"]["kind"], "timeout");
    assert_eq!(report["error"]["reported_kind"], "partial-failure");

    match result.into_result() {
        Err(MigrationError::PartialFailure { phase, source }) => {
            assert_eq!(phase, Phase::SourceStopped);
            assert!(matches!(*source, MigrationError::Timeout { .. }));
        }
        other => panic!("expected PartialFailure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_stop_timeout_fails_before_anything_is_exported() {
    let mut harness = Harness::new();
    harness.timeouts.stop = Duration::from_millis(50);
    harness
        .recorder
        .delay("source.stop", Duration::from_secs(10));
    let request = harness.request("MyVM", 100, MigrationPath::Cold, GuestOs::Linux);

    let result = harness.orchestrator().run(&request).await;

    assert!(!result.success);
    assert_eq!(result.final_phase, Phase::NotStarted);
    let error = result.error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::Timeout);
    assert_eq!(error.reported_kind, ErrorKind::Timeout);
    assert!(!error.source_stopped);
    assert!(harness.recorder.called("source.stop"));
    assert!(!harness.recorder.called("source.export"));
    assert!(matches!(
        result.into_result(),
        Err(MigrationError::Failed {
            phase: Phase::NotStarted,
            ..
        })
    ));
}

#[tokio::test]
async fn test_convert_timeout_stops_after_export() {
    let mut harness = Harness::new();
    harness.timeouts.convert = Duration::from_millis(50);
    harness
        .recorder
        .delay("converter.convert", Duration::from_secs(10));
    let request = harness.request("MyVM", 100, MigrationPath::Cold, GuestOs::Linux);

    let result = harness.orchestrator().run(&request).await;

    assert_eq!(result.final_phase, Phase::BaseExported);
    let error = result.error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::Timeout);
    assert_eq!(error.reported_kind, ErrorKind::PartialFailure);
    assert!(error.message.starts_with("convert base disk timed out"));
    assert!(!harness.recorder.called("destination.create_vm"));
    assert!(
        result
            .artifacts
            .iter()
            .any(|(role, _)| *role == ArtifactRole::BaseDiskExport)
    );
}

#[tokio::test]
async fn test_stop_failure_keeps_source_running() {
    let harness = Harness::new();
    harness.recorder.fail("source.stop", connection_lost);
    let request = harness.request("MyVM", 100, MigrationPath::Cold, GuestOs::Linux);

    let result = harness.orchestrator().run(&request).await;

    assert_eq!(result.final_phase, Phase::NotStarted);
    let error = result.error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::Connection);
    assert!(!error.source_stopped);
    assert_eq!(*result.phases().last().unwrap(), Phase::Failed);
}

#[tokio::test]
async fn test_import_failure_leaves_partial_destination_in_place() {
    let harness = Harness::new();
    harness.recorder.fail("destination.import_disk", api_rejected);
    let request = harness.request("MyVM", 100, MigrationPath::Cold, GuestOs::Linux);

    let result = harness.orchestrator().run(&request).await;

    assert_eq!(result.final_phase, Phase::DestinationCreated);
    assert_eq!(result.error.as_ref().unwrap().kind, ErrorKind::Api);
    assert_eq!(result.destination.as_ref().map(|h| h.vmid), Some(100));
    assert!(!harness.recorder.called("destination.start"));
    assert!(!harness.recorder.called("destination.configure_devices"));
}

#[tokio::test]
async fn test_result_serializes_for_reports() {
    let harness = Harness::new();
    let request = harness.request("MyVM", 100, MigrationPath::Cold, GuestOs::Linux);

    let result = harness.orchestrator().run(&request).await;
    let json: serde_json::Value = serde_json::from_str(&result.to_json().unwrap()).unwrap();

    assert_eq!(json["success"], true);
    assert_eq!(json["final_phase"], "Started");
    assert_eq!(json["path"], "cold");
}
