use crate::config::MigrationFile;
use crate::{Result, log_info};
use nix::unistd::Uid;
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::process::Command;

#[derive(Debug, Clone, Serialize)]
pub struct ToolStatus {
    pub name: &'static str,
    pub purpose: &'static str,
    pub available: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PreflightSummary {
    pub kernel_release: Option<String>,
    pub running_as_root: bool,
    pub staging_dir: String,
    pub staging_writable: bool,
    pub tool_status: Vec<ToolStatus>,
    pub issues: Vec<String>,
}

impl PreflightSummary {
    pub fn is_ready(&self) -> bool {
        self.issues.is_empty()
    }
}

impl fmt::Display for PreflightSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "vmshift Preflight Summary (kernel: {}, root: {})",
            self.kernel_release.as_deref().unwrap_or("unknown"),
            if self.running_as_root { "yes" } else { "no" }
        )?;
        writeln!(
            f,
            "\nStaging: {} ({})",
            self.staging_dir,
            if self.staging_writable {
                "writable"
            } else {
                "not writable"
            }
        )?;
        writeln!(f, "\nUserland Tooling:")?;
        for tool in &self.tool_status {
            writeln!(
                f,
                "  - {} ({}): {}",
                tool.name,
                tool.purpose,
                if tool.available {
                    "available"
                } else {
                    "missing"
                }
            )?;
        }
        if self.issues.is_empty() {
            writeln!(f, "\n✅ Ready to migrate")
        } else {
            writeln!(f, "\n⚠ Issues:")?;
            for issue in &self.issues {
                writeln!(f, "  - {}", issue)?;
            }
            Ok(())
        }
    }
}

/// Tools the selected configuration will shell out to.
pub fn required_tools(config: &MigrationFile) -> Vec<(&'static str, &'static str)> {
    let mut tools = vec![
        ("ssh", "Hyper-V remoting"),
        ("qemu-img", "disk conversion"),
    ];
    // The node importer always uses key-based ssh as root.
    if config.source.password.is_some() {
        tools.push(("sshpass", "password ssh to the Hyper-V host"));
    }
    if config.vm.guest_os.needs_drivers() {
        tools.push(("virt-v2v", "driver injection"));
        tools.push(("virt-customize", "guest tools install"));
    }
    if !config.destination.import_via_ssh {
        tools.push(("qm", "local disk import"));
    }
    tools
}

pub fn run_preflight(config: &MigrationFile) -> Result<PreflightSummary> {
    log_info!("Running preflight checks for migration host");

    let kernel_release = read_command_output("uname", &["-r"]);
    let running_as_root = Uid::effective().is_root();
    let staging = &config.staging.local_dir;
    let staging_writable = check_writable(staging);

    let tool_status: Vec<ToolStatus> = required_tools(config)
        .into_iter()
        .map(|(name, purpose)| check_tool(name, purpose))
        .collect();

    let mut issues = Vec::new();
    if let Err(err) = config.validate() {
        issues.push(format!("configuration: {}", err));
    }
    if !staging_writable {
        issues.push(format!(
            "staging directory {} is not writable",
            staging.display()
        ));
    }
    if !running_as_root && !config.destination.import_via_ssh {
        issues.push("qm importdisk requires root on the Proxmox node".to_string());
    }
    for tool in &tool_status {
        if !tool.available {
            issues.push(format!("{} command missing from PATH", tool.name));
        }
    }

    Ok(PreflightSummary {
        kernel_release,
        running_as_root,
        staging_dir: staging.display().to_string(),
        staging_writable,
        tool_status,
        issues,
    })
}

fn check_writable(dir: &Path) -> bool {
    if std::fs::create_dir_all(dir).is_err() {
        return false;
    }
    let marker = dir.join(".vmshift-preflight");
    let writable = std::fs::write(&marker, b"ok").is_ok();
    let _ = std::fs::remove_file(&marker);
    writable
}

fn check_tool(name: &'static str, purpose: &'static str) -> ToolStatus {
    let available = Command::new("sh")
        .arg("-c")
        .arg(format!("command -v {} >/dev/null 2>&1", name))
        .status()
        .map(|status| status.success())
        .unwrap_or(false);

    ToolStatus {
        name,
        purpose,
        available,
    }
}

fn read_command_output(cmd: &str, args: &[&str]) -> Option<String> {
    Command::new(cmd)
        .args(args)
        .output()
        .ok()
        .filter(|output| output.status.success())
        .map(|output| String::from_utf8_lossy(&output.stdout).trim().to_string())
}
