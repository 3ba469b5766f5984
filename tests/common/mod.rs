// Shared fakes for orchestrator integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use vmshift::connectors::{BootOrder, CheckpointToken, NetworkSpec, VmDefinition, VmHandle};
use vmshift::delta::{DeltaWriter, merge_delta};
use vmshift::{
    Credentials, DestinationConnector, DiskConverter, DiskFormat, GuestOs, MigrationError,
    MigrationPath, MigrationRequest, Orchestrator, Result, SourceConnector, Timeouts,
};

pub const DISK_SIZE: u64 = 4096;
pub const CHANGED_OFFSET: u64 = 1024;
pub const CHANGED_BYTES: &[u8] = b"written after the base export";

/// Ordered log of collaborator calls plus injected failures and delays.
#[derive(Default)]
pub struct Recorder {
    calls: Mutex<Vec<String>>,
    failures: Mutex<HashMap<&'static str, fn() -> MigrationError>>,
    delays: Mutex<HashMap<&'static str, Duration>>,
    inject_flags: Mutex<Vec<bool>>,
    imported: Mutex<Vec<PathBuf>>,
}

impl Recorder {
    pub fn fail(&self, op: &'static str, make: fn() -> MigrationError) {
        self.failures.lock().unwrap().insert(op, make);
    }

    pub fn delay(&self, op: &'static str, by: Duration) {
        self.delays.lock().unwrap().insert(op, by);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn position(&self, op: &str) -> Option<usize> {
        self.calls().iter().position(|call| call == op)
    }

    pub fn called(&self, op: &str) -> bool {
        self.position(op).is_some()
    }

    pub fn inject_flags(&self) -> Vec<bool> {
        self.inject_flags.lock().unwrap().clone()
    }

    /// Disks handed to `import_disk` and `replace_disk`, in order.
    pub fn imported(&self) -> Vec<PathBuf> {
        self.imported.lock().unwrap().clone()
    }

    async fn record(&self, op: &'static str) -> Result<()> {
        self.calls.lock().unwrap().push(op.to_string());
        let delay = self.delays.lock().unwrap().get(op).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failure = self.failures.lock().unwrap().get(op).copied();
        match failure {
            Some(make) => Err(make()),
            None => Ok(()),
        }
    }
}

pub fn connection_lost() -> MigrationError {
    MigrationError::Connection("connection reset by peer".to_string())
}

pub fn api_rejected() -> MigrationError {
    MigrationError::Api("HTTP 500 Internal Server Error".to_string())
}

pub fn conversion_failed() -> MigrationError {
    MigrationError::Conversion("qemu-img: unsupported image".to_string())
}

/// Source that writes a zeroed base disk and a one-extent journal.
pub struct FakeSource {
    recorder: Arc<Recorder>,
}

#[async_trait]
impl SourceConnector for FakeSource {
    fn name(&self) -> &str {
        "fake-hyperv"
    }

    fn export_format(&self) -> DiskFormat {
        DiskFormat::Vhdx
    }

    async fn stop(&self, _vm: &str) -> Result<()> {
        self.recorder.record("source.stop").await
    }

    async fn export(&self, _vm: &str, path: &Path) -> Result<()> {
        self.recorder.record("source.export").await?;
        tokio::fs::write(path, vec![0u8; DISK_SIZE as usize]).await?;
        Ok(())
    }

    async fn enable_cbt(&self, vm: &str) -> Result<CheckpointToken> {
        self.recorder.record("source.enable_cbt").await?;
        Ok(CheckpointToken(format!("rct:{}:1", vm)))
    }

    async fn disable_cbt(&self, _vm: &str) -> Result<()> {
        self.recorder.record("source.disable_cbt").await
    }

    async fn export_changed_blocks(
        &self,
        _vm: &str,
        _token: &CheckpointToken,
        path: &Path,
    ) -> Result<()> {
        self.recorder.record("source.export_changed_blocks").await?;
        let mut writer = DeltaWriter::new(Vec::new(), DISK_SIZE, 1)?;
        writer.push(CHANGED_OFFSET, CHANGED_BYTES)?;
        tokio::fs::write(path, writer.finish()?).await?;
        Ok(())
    }
}

/// Converter that copies bytes through unchanged and merges natively.
pub struct FakeConverter {
    recorder: Arc<Recorder>,
}

#[async_trait]
impl DiskConverter for FakeConverter {
    fn name(&self) -> &str {
        "fake-converter"
    }

    async fn convert(&self, src: &Path, dst: &Path, inject_drivers: bool) -> Result<()> {
        self.recorder.inject_flags.lock().unwrap().push(inject_drivers);
        self.recorder.record("converter.convert").await?;
        tokio::fs::copy(src, dst).await?;
        Ok(())
    }

    async fn merge_delta(&self, base: &Path, delta: &Path, out: &Path) -> Result<()> {
        self.recorder.record("converter.merge_delta").await?;
        merge_delta(base, delta, out)?;
        Ok(())
    }
}

pub struct FakeDestination {
    recorder: Arc<Recorder>,
    existing: Vec<u32>,
}

#[async_trait]
impl DestinationConnector for FakeDestination {
    fn name(&self) -> &str {
        "fake-proxmox"
    }

    async fn exists(&self, vmid: u32) -> Result<bool> {
        self.recorder.record("destination.exists").await?;
        Ok(self.existing.contains(&vmid))
    }

    async fn create_vm(&self, definition: &VmDefinition) -> Result<VmHandle> {
        self.recorder.record("destination.create_vm").await?;
        Ok(VmHandle {
            node: "pve01".to_string(),
            vmid: definition.vmid,
        })
    }

    async fn import_disk(&self, _vm: &VmHandle, disk: &Path) -> Result<()> {
        self.recorder.record("destination.import_disk").await?;
        self.recorder.imported.lock().unwrap().push(disk.to_path_buf());
        Ok(())
    }

    async fn replace_disk(&self, _vm: &VmHandle, disk: &Path) -> Result<()> {
        self.recorder.record("destination.replace_disk").await?;
        self.recorder.imported.lock().unwrap().push(disk.to_path_buf());
        Ok(())
    }

    async fn configure_devices(
        &self,
        _vm: &VmHandle,
        _network: &NetworkSpec,
        _boot: &BootOrder,
    ) -> Result<()> {
        self.recorder.record("destination.configure_devices").await
    }

    async fn attach_media(&self, _vm: &VmHandle, _iso: &str) -> Result<()> {
        self.recorder.record("destination.attach_media").await
    }

    async fn start(&self, _vm: &VmHandle) -> Result<()> {
        self.recorder.record("destination.start").await
    }
}

pub fn generous_timeouts() -> Timeouts {
    Timeouts {
        stop: Duration::from_secs(30),
        export: Duration::from_secs(30),
        convert: Duration::from_secs(30),
        import: Duration::from_secs(30),
    }
}

pub struct Harness {
    pub recorder: Arc<Recorder>,
    pub existing: Vec<u32>,
    pub timeouts: Timeouts,
    staging: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            recorder: Arc::new(Recorder::default()),
            existing: Vec::new(),
            timeouts: generous_timeouts(),
            staging: TempDir::new().unwrap(),
        }
    }

    pub fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(
            Arc::new(FakeSource {
                recorder: self.recorder.clone(),
            }),
            Arc::new(FakeConverter {
                recorder: self.recorder.clone(),
            }),
            Arc::new(FakeDestination {
                recorder: self.recorder.clone(),
                existing: self.existing.clone(),
            }),
            self.timeouts,
        )
    }

    pub fn request(
        &self,
        vm_name: &str,
        vmid: u32,
        mode: MigrationPath,
        guest_os: GuestOs,
    ) -> MigrationRequest {
        MigrationRequest {
            source: Credentials {
                host: "hyperv01.lab".to_string(),
                username: "Administrator".to_string(),
                password: None,
            },
            destination: Credentials {
                host: "pve01.lab".to_string(),
                username: "root@pam".to_string(),
                password: None,
            },
            node: "pve01".to_string(),
            vm_name: vm_name.to_string(),
            vmid,
            cores: 2,
            memory_mb: 2048,
            guest_os,
            mode,
            staging_dir: self.staging.path().to_path_buf(),
            disk_format: DiskFormat::Qcow2,
            network: NetworkSpec::default(),
            driver_iso: "local:iso/virtio-win.iso".to_string(),
        }
    }
}
