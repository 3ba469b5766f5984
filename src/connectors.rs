//! Interfaces to the three external systems a migration touches.
//!
//! - [`SourceConnector`]: hypervisor management plane on the source side
//! - [`DiskConverter`]: local disk image conversion and delta merge
//! - [`DestinationConnector`]: virtualization platform API on the target side
//!
//! The orchestrator only talks to these traits, so every run can be driven
//! against fakes. Retrying transient failures is the implementation's job.

use crate::Result;
use crate::config::DiskFormat;
use crate::request::GuestOs;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Opaque change-tracking checkpoint issued by the source when CBT is enabled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointToken(pub String);

impl fmt::Display for CheckpointToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference to a VM definition on the destination platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmHandle {
    pub node: String,
    pub vmid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmDefinition {
    pub vmid: u32,
    pub name: String,
    pub cores: u32,
    pub memory_mb: u64,
    pub guest_os: GuestOs,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSpec {
    pub bridge: String,
    pub model: String,
}

impl Default for NetworkSpec {
    fn default() -> Self {
        Self {
            bridge: "vmbr0".to_string(),
            model: "virtio".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BootDevice {
    PrimaryDisk,
    Cdrom,
    Network,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootOrder(pub Vec<BootDevice>);

impl BootOrder {
    pub fn disk_first() -> Self {
        BootOrder(vec![BootDevice::PrimaryDisk])
    }

    pub fn devices(&self) -> &[BootDevice] {
        &self.0
    }
}

#[async_trait]
pub trait SourceConnector: Send + Sync {
    fn name(&self) -> &str;

    /// Format of the disk images written by `export`.
    fn export_format(&self) -> DiskFormat;

    async fn stop(&self, vm: &str) -> Result<()>;

    async fn export(&self, vm: &str, path: &Path) -> Result<()>;

    async fn enable_cbt(&self, vm: &str) -> Result<CheckpointToken>;

    async fn disable_cbt(&self, vm: &str) -> Result<()>;

    /// Write every block changed since `token` as a changed-block journal.
    async fn export_changed_blocks(
        &self,
        vm: &str,
        token: &CheckpointToken,
        path: &Path,
    ) -> Result<()>;
}

#[async_trait]
pub trait DiskConverter: Send + Sync {
    fn name(&self) -> &str;

    /// Convert `src` into `dst`. Formats follow the file extensions.
    async fn convert(&self, src: &Path, dst: &Path, inject_drivers: bool) -> Result<()>;

    /// Apply a changed-block journal onto a raw base image, writing `out`.
    async fn merge_delta(&self, base: &Path, delta: &Path, out: &Path) -> Result<()>;
}

#[async_trait]
pub trait DestinationConnector: Send + Sync {
    fn name(&self) -> &str;

    async fn exists(&self, vmid: u32) -> Result<bool>;

    async fn create_vm(&self, definition: &VmDefinition) -> Result<VmHandle>;

    /// Import `path` into destination storage and attach it as the primary disk.
    async fn import_disk(&self, handle: &VmHandle, path: &Path) -> Result<()>;

    /// Import `path` and make it the primary disk in place of the current one.
    async fn replace_disk(&self, handle: &VmHandle, path: &Path) -> Result<()>;

    async fn configure_devices(
        &self,
        handle: &VmHandle,
        network: &NetworkSpec,
        boot: &BootOrder,
    ) -> Result<()>;

    async fn attach_media(&self, handle: &VmHandle, iso: &str) -> Result<()>;

    async fn start(&self, handle: &VmHandle) -> Result<()>;
}
