pub mod artifacts;
pub mod config;
pub mod connectors;
pub mod converter;
pub mod delta;
pub mod error;
pub mod exec;
pub mod hyperv;
pub mod logger;
pub mod orchestrator;
pub mod phase;
pub mod preflight;
pub mod proxmox;
pub mod request;
pub mod retry;
pub mod state;

pub use error::{ErrorKind, MigrationError};
pub use phase::{MigrationPath, Phase};

pub type Result<T> = std::result::Result<T, MigrationError>;

// Convenience re-exports for driving a run
pub use config::{DiskFormat, MigrationFile, Timeouts};
pub use connectors::{DestinationConnector, DiskConverter, SourceConnector};
pub use orchestrator::Orchestrator;
pub use request::{Credentials, GuestOs, MigrationRequest};
pub use state::MigrationResult;
