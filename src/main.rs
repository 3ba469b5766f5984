use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use vmshift::{
    GuestOs, MigrationFile, MigrationPath, Orchestrator,
    converter::QemuConverter,
    hyperv::HyperVConnector,
    logger,
    orchestrator::planned_steps,
    preflight::run_preflight,
    proxmox::ProxmoxConnector,
};

#[derive(Parser)]
#[command(name = "vmshift")]
#[command(about = "Hyper-V to Proxmox VE migration with cold and warm (change-tracked) paths")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the migration file
    #[arg(short, long, env = "VMSHIFT_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Migrate the configured VM
    Migrate {
        #[command(flatten)]
        overrides: Overrides,
        /// Write the JSON run report to this path
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Show the steps a migration would run without touching either side
    Plan {
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Check local tooling, privileges and the staging directory
    Preflight,
}

#[derive(Args)]
struct Overrides {
    /// Hyper-V host
    #[arg(long)]
    source_host: Option<String>,
    /// Hyper-V user
    #[arg(long)]
    source_user: Option<String>,
    /// Source VM name
    #[arg(long)]
    vm_name: Option<String>,
    /// Proxmox host
    #[arg(long)]
    dest_host: Option<String>,
    /// Proxmox user, e.g. root@pam
    #[arg(long)]
    dest_user: Option<String>,
    /// Destination VM id
    #[arg(long)]
    vmid: Option<u32>,
    /// Destination node
    #[arg(long)]
    node: Option<String>,
    /// vCPU count for the new VM
    #[arg(long)]
    cores: Option<u32>,
    /// Memory for the new VM in MiB
    #[arg(long)]
    memory_mb: Option<u64>,
    /// Proxmox storage for imported disks
    #[arg(long)]
    storage: Option<String>,
    /// Network bridge for net0
    #[arg(long)]
    bridge: Option<String>,
    /// VirtIO driver ISO volume, e.g. local:iso/virtio-win.iso
    #[arg(long)]
    driver_iso: Option<String>,
    /// Use the warm (change-tracked) path
    #[arg(long)]
    warm: bool,
    /// Guest is Windows: inject virtio drivers and attach the driver ISO
    #[arg(long)]
    windows: bool,
    /// Local staging directory
    #[arg(long)]
    staging_dir: Option<PathBuf>,
    /// Hyper-V password
    #[arg(long, env = "VMSHIFT_SOURCE_PASS", hide_env_values = true)]
    source_password: Option<String>,
    /// Proxmox password
    #[arg(long, env = "VMSHIFT_DEST_PASS", hide_env_values = true)]
    dest_password: Option<String>,
}

impl Overrides {
    fn apply(self, file: &mut MigrationFile) {
        if let Some(host) = self.source_host {
            file.source.host = host;
        }
        if let Some(user) = self.source_user {
            file.source.username = user;
        }
        if let Some(vm_name) = self.vm_name {
            file.source.vm_name = vm_name;
        }
        if let Some(host) = self.dest_host {
            file.destination.host = host;
        }
        if let Some(user) = self.dest_user {
            file.destination.username = user;
        }
        if let Some(vmid) = self.vmid {
            file.destination.vmid = vmid;
        }
        if let Some(node) = self.node {
            file.destination.node = node;
        }
        if let Some(cores) = self.cores {
            file.vm.cores = cores;
        }
        if let Some(memory_mb) = self.memory_mb {
            file.vm.memory_mb = memory_mb;
        }
        if let Some(storage) = self.storage {
            file.destination.storage = storage;
        }
        if let Some(bridge) = self.bridge {
            file.destination.bridge = bridge;
        }
        if let Some(iso) = self.driver_iso {
            file.destination.driver_iso = iso;
        }
        if self.warm {
            file.vm.mode = MigrationPath::Warm;
        }
        if self.windows {
            file.vm.guest_os = GuestOs::Windows;
        }
        if let Some(dir) = self.staging_dir {
            file.staging.local_dir = dir;
        }
        if self.source_password.is_some() {
            file.source.password = self.source_password;
        }
        if self.dest_password.is_some() {
            file.destination.password = self.dest_password;
        }
    }
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<MigrationFile> {
    let path = path.unwrap_or_else(MigrationFile::default_location);
    if path.exists() {
        MigrationFile::from_file(&path)
            .with_context(|| format!("failed to load {}", path.display()))
    } else {
        logger::warn!(
            "Migration file not found at {}, using defaults",
            path.display()
        );
        Ok(MigrationFile::default())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        unsafe {
            std::env::set_var("RUST_LOG", "vmshift=debug");
        }
    }
    logger::init_logger();

    let mut file = load_config(cli.config)?;

    match cli.command {
        Commands::Migrate { overrides, report } => {
            overrides.apply(&mut file);
            let request = file.into_request()?;

            let timeouts = file.timeouts();
            let source = HyperVConnector::from_config(
                &request.source,
                &file.source,
                &file.staging,
                timeouts,
            );
            let destination =
                ProxmoxConnector::from_config(&request.destination, &file.destination)?;
            let converter = QemuConverter::new(&file.conversion);
            let orchestrator = Orchestrator::new(
                Arc::new(source),
                Arc::new(converter),
                Arc::new(destination),
                timeouts,
            );

            let result = orchestrator.run(&request).await;
            println!("{}", result);
            if let Some(path) = report {
                std::fs::write(&path, result.to_json()?)
                    .with_context(|| format!("failed to write report {}", path.display()))?;
                println!("Report written to {}", path.display());
            }
            if let Err(err) = result.into_result() {
                eprintln!("Error: {}", err);
                std::process::exit(1);
            }
        }
        Commands::Plan { overrides } => {
            overrides.apply(&mut file);
            let request = file.into_request()?;
            println!(
                "{} migration of '{}' from {} to VM {} on {} ({})",
                request.mode,
                request.vm_name,
                request.source.host,
                request.vmid,
                request.node,
                request.disk_format.as_str()
            );
            let steps = planned_steps(request.mode, request.guest_os, request.disk_format);
            for (phase, calls) in steps {
                if calls.is_empty() {
                    println!("  {:<20} (no-op)", phase.as_str());
                } else {
                    println!("  {:<20} {}", phase.as_str(), calls.join(", "));
                }
            }
        }
        Commands::Preflight => {
            let summary = run_preflight(&file)?;
            println!("{}", summary);
            if !summary.is_ready() {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_build_a_request_without_a_migration_file() {
        let cli = Cli::try_parse_from([
            "vmshift",
            "plan",
            "--source-host",
            "hv01",
            "--source-user",
            "Administrator",
            "--vm-name",
            "WinVM",
            "--dest-host",
            "pve01",
            "--dest-user",
            "root@pam",
            "--node",
            "pve01",
            "--vmid",
            "300",
            "--cores",
            "8",
            "--memory-mb",
            "16384",
            "--storage",
            "ceph",
            "--bridge",
            "vmbr1",
            "--driver-iso",
            "nfs:iso/virtio-win-0.1.248.iso",
        ])
        .unwrap();
        let Commands::Plan { overrides } = cli.command else {
            panic!("expected plan");
        };

        let mut file = MigrationFile::default();
        overrides.apply(&mut file);
        let request = file.into_request().unwrap();

        assert_eq!(request.source.host, "hv01");
        assert_eq!(request.source.username, "Administrator");
        assert_eq!(request.destination.host, "pve01");
        assert_eq!(request.destination.username, "root@pam");
        assert_eq!(request.vmid, 300);
        assert_eq!(request.cores, 8);
        assert_eq!(request.memory_mb, 16384);
        assert_eq!(request.network.bridge, "vmbr1");
        assert_eq!(request.driver_iso, "nfs:iso/virtio-win-0.1.248.iso");
        assert_eq!(file.destination.storage, "ceph");
    }
}
