//! Hyper-V source connector.
//!
//! Every operation is a PowerShell script executed on the Hyper-V host over
//! OpenSSH. Change tracking uses Resilient Change Tracking (RCT) reference
//! points; the checkpoint token is the RCT identifier of the primary disk.

use crate::config::{DiskFormat, SourceConfig, StagingConfig, Timeouts};
use crate::connectors::{CheckpointToken, SourceConnector};
use crate::exec::RemoteShell;
use crate::request::Credentials;
use crate::{MigrationError, Result, log_debug, log_info, log_warn};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Maps local staging paths to the source host's view of the same share.
#[derive(Debug, Clone)]
pub struct PathMap {
    local_root: PathBuf,
    remote_root: Option<String>,
}

impl PathMap {
    pub fn new(local_root: PathBuf, remote_root: Option<String>) -> Self {
        Self {
            local_root,
            remote_root,
        }
    }

    pub fn to_remote(&self, local: &Path) -> Result<String> {
        let Some(remote_root) = &self.remote_root else {
            return Ok(local.to_string_lossy().into_owned());
        };
        let relative = local.strip_prefix(&self.local_root).map_err(|_| {
            MigrationError::Config(format!(
                "{} is outside the staging directory {}",
                local.display(),
                self.local_root.display()
            ))
        })?;

        let mut remote = remote_root.trim_end_matches('\\').to_string();
        for component in relative.components() {
            match component {
                Component::Normal(part) => {
                    remote.push('\\');
                    remote.push_str(&part.to_string_lossy());
                }
                _ => {
                    return Err(MigrationError::Config(format!(
                        "unsupported staging path {}",
                        local.display()
                    )));
                }
            }
        }
        Ok(remote)
    }
}

/// Quote a value as a PowerShell single-quoted literal.
pub fn ps_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn script(vars: &[(&str, &str)], limit: Duration, body: &str) -> String {
    let mut out = String::from("$ErrorActionPreference = 'Stop'\n");
    for (name, value) in vars {
        out.push_str(&format!("${} = {}\n", name, ps_quote(value)));
    }
    // Closing the ssh session does not stop a running script on Windows.
    out.push_str(&format!("$TimeoutSec = {}\n", limit.as_secs().max(1)));
    out.push_str("$Deadline = (Get-Date).AddSeconds($TimeoutSec)\n");
    out.push_str(CIM_HELPERS);
    out.push_str(body);
    out
}

/// WQL string literal contents: backslash and quote are escaped.
fn wql_escape(value: &str) -> String {
    value.replace('\\', r"\\").replace('\'', r"\'")
}

const CIM_HELPERS: &str = r#"
$ns = 'root\virtualization\v2'
function Wait-CimResult($r) {
    if ($r.ReturnValue -eq 4096) {
        while ($true) {
            $job = Get-CimInstance -InputObject $r.Job
            if ($job.JobState -ge 7) {
                if ($job.JobState -ne 7) { throw $job.ErrorDescription }
                return
            }
            if ((Get-Date) -gt $Deadline) { throw "WMI job did not finish within $TimeoutSec seconds" }
            Start-Sleep -Seconds 1
        }
    } elseif ($r.ReturnValue -ne 0) {
        throw "WMI call failed with $($r.ReturnValue)"
    }
}
function Get-PrimaryDrive($vm) {
    $drive = Get-VMHardDiskDrive -VM $vm |
        Sort-Object ControllerType, ControllerNumber, ControllerLocation |
        Select-Object -First 1
    if (-not $drive) { throw "VM $($vm.Name) has no hard disk" }
    $drive
}
function Get-PrimaryDisk($vm) {
    (Get-PrimaryDrive $vm).Path
}
function Get-CimVm($vm) {
    Get-CimInstance -Namespace $ns -ClassName Msvm_ComputerSystem -Filter "Name='$($vm.Id)'"
}
function Get-SecondsLeft {
    [int][Math]::Max(1, ($Deadline - (Get-Date)).TotalSeconds)
}
"#;

const STOP_BODY: &str = r#"
$vm = Get-VM -Name $VmName
if ($vm.State -ne 'Off') { Stop-VM -VM $vm -Force -AsJob | Out-Null }
while ((Get-VM -Name $VmName).State -ne 'Off') {
    if ((Get-Date) -gt $Deadline) { throw "VM $VmName did not power off within $TimeoutSec seconds" }
    Start-Sleep -Seconds 2
}
"#;

const EXPORT_BODY: &str = r#"
$vm = Get-VM -Name $VmName
$primary = Split-Path -Leaf (Get-PrimaryDisk $vm)
$scratch = Join-Path (Split-Path -Parent $Dest) ('export-' + [guid]::NewGuid().ToString('N'))
try {
    $job = Export-VM -VM $vm -Path $scratch -AsJob
    if (-not (Wait-Job -Job $job -Timeout (Get-SecondsLeft))) {
        Stop-Job -Job $job
        throw "export of $VmName did not finish within $TimeoutSec seconds"
    }
    Receive-Job -Job $job -ErrorAction Stop | Out-Null
    $disk = Get-ChildItem -LiteralPath $scratch -Recurse -File |
        Where-Object { $_.Name -eq $primary } |
        Select-Object -First 1
    if (-not $disk) { throw "export of $VmName did not contain $primary" }
    Move-Item -LiteralPath $disk.FullName -Destination $Dest -Force
} finally {
    if (Test-Path -LiteralPath $scratch) { Remove-Item -LiteralPath $scratch -Recurse -Force }
}
"#;

// Emits `RP:<InstanceID>` and `RCT:<identifier of the primary disk>`.
const ENABLE_CBT_BODY: &str = r#"
$vm = Get-VM -Name $VmName
if ([version]$vm.Version -lt [version]'6.2') {
    throw "VM configuration version $($vm.Version) does not support resilient change tracking"
}
$cim = Get-CimVm $vm
$drive = Get-PrimaryDrive $vm
$svc = Get-CimInstance -Namespace $ns -ClassName Msvm_VirtualSystemReferencePointService
$r = Invoke-CimMethod -InputObject $svc -MethodName CreateReferencePoint -Arguments @{
    AffectedSystem = $cim
    ReferencePointType = [uint16]1
}
Wait-CimResult $r
$rp = $null
if ($r.ResultingReferencePoint) {
    $rp = Get-CimInstance -InputObject $r.ResultingReferencePoint
} elseif ($r.Job) {
    $rp = Get-CimAssociatedInstance -InputObject (Get-CimInstance -InputObject $r.Job) `
        -ResultClassName Msvm_VirtualSystemReferencePoint | Select-Object -First 1
}
if (-not $rp) { throw "no reference point was created for $VmName" }
$ids = @($rp.ResilientChangeTrackingIdentifiers)
$disks = @($rp.VirtualDiskIdentifiers)
$rct = $null
if ($disks.Count -eq $ids.Count) {
    for ($i = 0; $i -lt $disks.Count; $i++) {
        if ($drive.Id -like "*$($disks[$i])*") { $rct = $ids[$i] }
    }
}
if (-not $rct) {
    if ($ids.Count -ne 1) { throw "cannot tell which RCT identifier belongs to $($drive.Path)" }
    $rct = $ids[0]
}
Write-Output "RP:$($rp.InstanceID)"
Write-Output "RCT:$rct"
"#;

const DISABLE_CBT_BODY: &str = r#"
$svc = Get-CimInstance -Namespace $ns -ClassName Msvm_VirtualSystemReferencePointService
$rp = Get-CimInstance -Namespace $ns -ClassName Msvm_VirtualSystemReferencePoint `
    -Filter "InstanceID='$RefPoint'"
if ($rp) {
    $r = Invoke-CimMethod -InputObject $svc -MethodName DestroyReferencePoint -Arguments @{
        AffectedReferencePoint = $rp
    }
    Wait-CimResult $r
}
"#;

// GetVirtualDiskChanges may stop short of the requested range; continue from
// ProcessedByteLength until the whole disk is covered.
const EXPORT_CHANGES_BODY: &str = r#"
$vm = Get-VM -Name $VmName
$disk = Get-PrimaryDisk $vm
$size = [uint64](Get-VHD -Path $disk).Size
$ims = Get-CimInstance -Namespace $ns -ClassName Msvm_ImageManagementService
$offsets = New-Object 'System.Collections.Generic.List[uint64]'
$lengths = New-Object 'System.Collections.Generic.List[uint64]'
$pos = [uint64]0
while ($pos -lt $size) {
    $r = Invoke-CimMethod -InputObject $ims -MethodName GetVirtualDiskChanges -Arguments @{
        Path = $disk
        LimitId = $Token
        ByteOffset = $pos
        ByteLength = [uint64]($size - $pos)
        Type = [uint16]0
    }
    Wait-CimResult $r
    $batchOffsets = @($r.ChangedByteOffsets)
    $batchLengths = @($r.ChangedByteLengths)
    if ($batchOffsets.Count -ne $batchLengths.Count) {
        throw "GetVirtualDiskChanges returned $($batchOffsets.Count) offsets and $($batchLengths.Count) lengths"
    }
    for ($i = 0; $i -lt $batchOffsets.Count; $i++) {
        $offsets.Add([uint64]$batchOffsets[$i])
        $lengths.Add([uint64]$batchLengths[$i])
    }
    $done = [uint64]$r.ProcessedByteLength
    if ($done -eq 0) { throw "GetVirtualDiskChanges made no progress at offset $pos" }
    $pos += $done
}
$mounted = Mount-VHD -Path $disk -ReadOnly -NoDriveLetter -Passthru | Get-Disk
$src = $null
$w = $null
try {
    $src = [System.IO.File]::Open("\\.\PhysicalDrive$($mounted.Number)", 'Open', 'Read', 'ReadWrite')
    $w = New-Object System.IO.BinaryWriter([System.IO.File]::Create($Dest))
    $w.Write([System.Text.Encoding]::ASCII.GetBytes('VSDELTA1'))
    $w.Write($size)
    $w.Write([uint64]$offsets.Count)
    $buf = New-Object byte[] 1048576
    for ($i = 0; $i -lt $offsets.Count; $i++) {
        $off = $offsets[$i]
        $len = $lengths[$i]
        $w.Write($off)
        $w.Write($len)
        $src.Position = $off
        $left = $len
        while ($left -gt 0) {
            if ((Get-Date) -gt $Deadline) { throw "changed-block export did not finish within $TimeoutSec seconds" }
            $n = $src.Read($buf, 0, [int][Math]::Min([uint64]$buf.Length, $left))
            if ($n -le 0) { throw "short read at offset $off" }
            $w.Write($buf, 0, $n)
            $left -= $n
        }
    }
    $w.Flush()
} finally {
    if ($w) { $w.Dispose() }
    if ($src) { $src.Dispose() }
    Dismount-VHD -Path $disk
}
"#;

// Creating or destroying a reference point is metadata work on the host.
const REFERENCE_POINT_LIMIT: Duration = Duration::from_secs(10 * 60);

/// Split enable output into (reference point InstanceID, RCT identifier).
pub fn parse_reference_point(output: &str) -> Result<(String, String)> {
    let mut instance = None;
    let mut rct = None;
    for line in output.lines().map(str::trim) {
        if let Some(id) = line.strip_prefix("RP:") {
            instance = Some(id.to_string());
        } else if let Some(id) = line.strip_prefix("RCT:") {
            rct = Some(id.to_string());
        }
    }
    match (instance, rct) {
        (Some(instance), Some(rct)) if !instance.is_empty() && !rct.is_empty() => {
            Ok((instance, rct))
        }
        _ => Err(MigrationError::command(
            "CreateReferencePoint",
            format!("no reference point in output: {}", output.trim()),
        )),
    }
}

pub struct HyperVConnector {
    shell: RemoteShell,
    paths: PathMap,
    limits: Timeouts,
    // VM name -> InstanceID of the reference point this run created.
    reference_points: Mutex<HashMap<String, String>>,
}

impl HyperVConnector {
    pub fn new(shell: RemoteShell, paths: PathMap, limits: Timeouts) -> Self {
        Self {
            shell,
            paths,
            limits,
            reference_points: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(
        credentials: &Credentials,
        source: &SourceConfig,
        staging: &StagingConfig,
        limits: Timeouts,
    ) -> Self {
        Self::new(
            RemoteShell::new(credentials, source.ssh_port, source.retries),
            PathMap::new(staging.local_dir.clone(), staging.remote_dir.clone()),
            limits,
        )
    }

    fn reference_points(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.reference_points
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl SourceConnector for HyperVConnector {
    fn name(&self) -> &str {
        "hyper-v"
    }

    fn export_format(&self) -> DiskFormat {
        DiskFormat::Vhdx
    }

    async fn stop(&self, vm: &str) -> Result<()> {
        log_info!("Stopping VM '{}' on {}", vm, self.shell.host());
        self.shell
            .run_powershell(&script(&[("VmName", vm)], self.limits.stop, STOP_BODY))
            .await?;
        Ok(())
    }

    async fn export(&self, vm: &str, path: &Path) -> Result<()> {
        let dest = self.paths.to_remote(path)?;
        log_info!("Exporting VM '{}' disk to {}", vm, dest);
        self.shell
            .run_powershell(&script(
                &[("VmName", vm), ("Dest", &dest)],
                self.limits.export,
                EXPORT_BODY,
            ))
            .await?;
        Ok(())
    }

    async fn enable_cbt(&self, vm: &str) -> Result<CheckpointToken> {
        log_info!("Creating change tracking reference point for '{}'", vm);
        let output = self
            .shell
            .run_powershell(&script(&[("VmName", vm)], REFERENCE_POINT_LIMIT, ENABLE_CBT_BODY))
            .await?;
        let (instance, rct) = parse_reference_point(&output)?;
        log_debug!("Reference point {} for '{}', RCT {}", instance, vm, rct);
        self.reference_points().insert(vm.to_string(), instance);
        Ok(CheckpointToken(rct))
    }

    async fn disable_cbt(&self, vm: &str) -> Result<()> {
        let Some(instance) = self.reference_points().get(vm).cloned() else {
            log_warn!("No reference point recorded for '{}', nothing to remove", vm);
            return Ok(());
        };
        log_info!("Removing change tracking reference point {} for '{}'", instance, vm);
        self.shell
            .run_powershell(&script(
                &[("RefPoint", &wql_escape(&instance))],
                REFERENCE_POINT_LIMIT,
                DISABLE_CBT_BODY,
            ))
            .await?;
        self.reference_points().remove(vm);
        Ok(())
    }

    async fn export_changed_blocks(
        &self,
        vm: &str,
        token: &CheckpointToken,
        path: &Path,
    ) -> Result<()> {
        let dest = self.paths.to_remote(path)?;
        log_info!("Exporting blocks of '{}' changed since {} to {}", vm, token, dest);
        self.shell
            .run_powershell(&script(
                &[("VmName", vm), ("Token", &token.0), ("Dest", &dest)],
                self.limits.export,
                EXPORT_CHANGES_BODY,
            ))
            .await?;
        Ok(())
    }
}
