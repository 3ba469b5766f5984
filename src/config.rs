use crate::connectors::NetworkSpec;
use crate::phase::MigrationPath;
use crate::request::{Credentials, GuestOs, MigrationRequest};
use crate::{MigrationError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "migration.toml";

/// Migration file: `[source]`, `[destination]`, `[vm]`, `[staging]`, `[timeouts]`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MigrationFile {
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub destination: DestinationConfig,
    #[serde(default)]
    pub vm: VmConfig,
    #[serde(default)]
    pub staging: StagingConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub conversion: ConversionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub vm_name: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    #[serde(default = "default_retries")]
    pub retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    /// `user@realm!tokenid=secret`; used instead of a password ticket when set.
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default)]
    pub node: String,
    #[serde(default)]
    pub vmid: u32,
    #[serde(default = "default_storage")]
    pub storage: String,
    #[serde(default = "default_bridge")]
    pub bridge: String,
    #[serde(default = "default_nic_model")]
    pub nic_model: String,
    #[serde(default = "default_driver_iso")]
    pub driver_iso: String,
    #[serde(default = "default_disk_format")]
    pub disk_format: DiskFormat,
    #[serde(default)]
    pub verify_tls: bool,
    /// Run `qm importdisk` on the node over ssh instead of locally.
    #[serde(default)]
    pub import_via_ssh: bool,
    /// Node ssh port used when `import_via_ssh` is set.
    #[serde(default = "default_ssh_port")]
    pub node_ssh_port: u16,
    #[serde(default = "default_retries")]
    pub retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmConfig {
    #[serde(default = "default_cores")]
    pub cores: u32,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,
    #[serde(default)]
    pub guest_os: GuestOs,
    #[serde(default = "default_mode")]
    pub mode: MigrationPath,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingConfig {
    /// Staging directory as seen from this machine.
    #[serde(default = "default_staging_dir")]
    pub local_dir: PathBuf,
    /// The same directory as seen from the source host, e.g. an SMB share.
    #[serde(default)]
    pub remote_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(default = "default_stop_secs")]
    pub stop_secs: u64,
    #[serde(default = "default_long_running_secs")]
    pub export_secs: u64,
    #[serde(default = "default_long_running_secs")]
    pub convert_secs: u64,
    #[serde(default = "default_import_secs")]
    pub import_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionConfig {
    /// First-boot command that installs the guest tools from the driver media.
    #[serde(default = "default_guest_tools_command")]
    pub guest_tools_command: String,
}

/// Bounds the orchestrator applies around blocking collaborator calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub stop: Duration,
    pub export: Duration,
    pub convert: Duration,
    pub import: Duration,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DiskFormat {
    Qcow2,
    Raw,
    Vhdx,
}

impl DiskFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskFormat::Qcow2 => "qcow2",
            DiskFormat::Raw => "raw",
            DiskFormat::Vhdx => "vhdx",
        }
    }

    pub fn extension(&self) -> &'static str {
        self.as_str()
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match ext.as_str() {
            "qcow2" => Ok(DiskFormat::Qcow2),
            "raw" | "img" => Ok(DiskFormat::Raw),
            "vhdx" | "avhdx" => Ok(DiskFormat::Vhdx),
            _ => Err(MigrationError::Conversion(format!(
                "cannot infer disk format of {}",
                path.display()
            ))),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            username: String::new(),
            password: None,
            vm_name: String::new(),
            ssh_port: default_ssh_port(),
            retries: default_retries(),
        }
    }
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_api_port(),
            username: String::new(),
            password: None,
            api_token: None,
            node: String::new(),
            vmid: 0,
            storage: default_storage(),
            bridge: default_bridge(),
            nic_model: default_nic_model(),
            driver_iso: default_driver_iso(),
            disk_format: default_disk_format(),
            verify_tls: false,
            import_via_ssh: false,
            node_ssh_port: default_ssh_port(),
            retries: default_retries(),
        }
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            cores: default_cores(),
            memory_mb: default_memory_mb(),
            guest_os: GuestOs::default(),
            mode: default_mode(),
        }
    }
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            local_dir: default_staging_dir(),
            remote_dir: None,
        }
    }
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            stop_secs: default_stop_secs(),
            export_secs: default_long_running_secs(),
            convert_secs: default_long_running_secs(),
            import_secs: default_import_secs(),
        }
    }
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            guest_tools_command: default_guest_tools_command(),
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        TimeoutsConfig::default().to_timeouts()
    }
}

fn default_ssh_port() -> u16 {
    22
}

fn default_api_port() -> u16 {
    8006
}

fn default_retries() -> u32 {
    2
}

fn default_storage() -> String {
    "local-lvm".to_string()
}

fn default_bridge() -> String {
    "vmbr0".to_string()
}

fn default_nic_model() -> String {
    "virtio".to_string()
}

fn default_driver_iso() -> String {
    "local:iso/virtio-win.iso".to_string()
}

fn default_disk_format() -> DiskFormat {
    DiskFormat::Qcow2
}

fn default_cores() -> u32 {
    2
}

fn default_memory_mb() -> u64 {
    2048
}

fn default_mode() -> MigrationPath {
    MigrationPath::Cold
}

fn default_staging_dir() -> PathBuf {
    PathBuf::from("/var/tmp/vmshift")
}

fn default_guest_tools_command() -> String {
    r#"cmd /c "D:\virtio-win-guest-tools.exe" /quiet /noreboot"#.to_string()
}

fn default_stop_secs() -> u64 {
    300
}

fn default_long_running_secs() -> u64 {
    4 * 60 * 60
}

fn default_import_secs() -> u64 {
    2 * 60 * 60
}

impl TimeoutsConfig {
    pub fn to_timeouts(&self) -> Timeouts {
        Timeouts {
            stop: Duration::from_secs(self.stop_secs),
            export: Duration::from_secs(self.export_secs),
            convert: Duration::from_secs(self.convert_secs),
            import: Duration::from_secs(self.import_secs),
        }
    }
}

impl MigrationFile {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: MigrationFile = toml::from_str(&contents)?;
        Ok(config)
    }

    pub fn from_str(contents: &str) -> Result<Self> {
        let config: MigrationFile = toml::from_str(contents)?;
        Ok(config)
    }

    /// `./migration.toml` if present, otherwise the per-user config directory.
    pub fn default_location() -> PathBuf {
        let local = PathBuf::from(DEFAULT_CONFIG_FILE);
        if local.exists() {
            return local;
        }
        dirs::config_dir()
            .map(|dir| dir.join("vmshift").join(DEFAULT_CONFIG_FILE))
            .unwrap_or(local)
    }

    pub fn timeouts(&self) -> Timeouts {
        self.timeouts.to_timeouts()
    }

    pub fn validate(&self) -> Result<()> {
        let required = [
            ("source.host", &self.source.host),
            ("source.username", &self.source.username),
            ("source.vm_name", &self.source.vm_name),
            ("destination.host", &self.destination.host),
            ("destination.node", &self.destination.node),
            ("destination.storage", &self.destination.storage),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(MigrationError::Config(format!("{} is required", field)));
            }
        }

        if self.destination.api_token.is_none() && self.destination.username.trim().is_empty() {
            return Err(MigrationError::Config(
                "destination.username or destination.api_token is required".to_string(),
            ));
        }
        if self.destination.vmid < 100 {
            return Err(MigrationError::Config(format!(
                "destination.vmid must be >= 100, got {}",
                self.destination.vmid
            )));
        }
        if self.vm.cores == 0 || self.vm.memory_mb == 0 {
            return Err(MigrationError::Config(
                "vm.cores and vm.memory_mb must be non-zero".to_string(),
            ));
        }
        if self.destination.disk_format == DiskFormat::Vhdx {
            return Err(MigrationError::Config(
                "destination.disk_format must be qcow2 or raw".to_string(),
            ));
        }
        if self.timeouts.stop_secs == 0
            || self.timeouts.export_secs == 0
            || self.timeouts.convert_secs == 0
            || self.timeouts.import_secs == 0
        {
            return Err(MigrationError::Config(
                "timeouts must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn into_request(&self) -> Result<MigrationRequest> {
        self.validate()?;
        Ok(MigrationRequest {
            source: Credentials {
                host: self.source.host.clone(),
                username: self.source.username.clone(),
                password: self.source.password.clone(),
            },
            destination: Credentials {
                host: self.destination.host.clone(),
                username: self.destination.username.clone(),
                password: self.destination.password.clone(),
            },
            node: self.destination.node.clone(),
            vm_name: self.source.vm_name.clone(),
            vmid: self.destination.vmid,
            cores: self.vm.cores,
            memory_mb: self.vm.memory_mb,
            guest_os: self.vm.guest_os,
            mode: self.vm.mode,
            staging_dir: self.staging.local_dir.clone(),
            disk_format: self.destination.disk_format,
            network: NetworkSpec {
                bridge: self.destination.bridge.clone(),
                model: self.destination.nic_model.clone(),
            },
            driver_iso: self.destination.driver_iso.clone(),
        })
    }
}
