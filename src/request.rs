use crate::config::DiskFormat;
use crate::connectors::{BootOrder, NetworkSpec, VmDefinition};
use crate::phase::MigrationPath;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub host: String,
    pub username: String,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("host", &self.host)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GuestOs {
    #[default]
    Linux,
    Windows,
}

impl GuestOs {
    /// Windows guests need virtio drivers injected and the driver ISO attached.
    pub fn needs_drivers(&self) -> bool {
        matches!(self, GuestOs::Windows)
    }

    pub fn proxmox_ostype(&self) -> &'static str {
        match self {
            GuestOs::Linux => "l26",
            GuestOs::Windows => "win10",
        }
    }
}

/// Everything a single run needs. Built once from configuration, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationRequest {
    pub source: Credentials,
    pub destination: Credentials,
    pub node: String,
    pub vm_name: String,
    pub vmid: u32,
    pub cores: u32,
    pub memory_mb: u64,
    pub guest_os: GuestOs,
    pub mode: MigrationPath,
    pub staging_dir: PathBuf,
    pub disk_format: DiskFormat,
    pub network: NetworkSpec,
    pub driver_iso: String,
}

impl MigrationRequest {
    pub fn vm_definition(&self) -> VmDefinition {
        VmDefinition {
            vmid: self.vmid,
            name: self.vm_name.clone(),
            cores: self.cores,
            memory_mb: self.memory_mb,
            guest_os: self.guest_os,
        }
    }

    pub fn boot_order(&self) -> BootOrder {
        BootOrder::disk_first()
    }
}
