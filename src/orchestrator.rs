//! Drives one VM through a cold or warm migration.
//!
//! Cold: stop, export, convert, create, import, start. Warm: enable change
//! tracking, export and convert the base while the source keeps running,
//! provision the destination, then stop the source, export only the changed
//! blocks, merge them onto the converted base, swap the disk and start.
//!
//! Each step runs at most once. A failure ends the run with the last
//! committed phase attached; nothing on the destination is rolled back.

use crate::artifacts::{ArtifactRole, DELTA_EXTENSION, StagingLayout};
use crate::config::{DiskFormat, Timeouts};
use crate::connectors::{DestinationConnector, DiskConverter, SourceConnector};
use crate::phase::{MigrationPath, Phase};
use crate::request::{GuestOs, MigrationRequest};
use crate::state::{MigrationResult, MigrationState};
use crate::{MigrationError, Result, log_error, log_info, log_warn};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Run `step` with an upper bound; expiry becomes a `Timeout` error.
async fn bounded<T>(
    operation: &str,
    limit: Duration,
    step: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(limit, step).await {
        Ok(result) => result,
        Err(_) => Err(MigrationError::Timeout {
            operation: operation.to_string(),
            limit,
        }),
    }
}

pub struct Orchestrator {
    source: Arc<dyn SourceConnector>,
    converter: Arc<dyn DiskConverter>,
    destination: Arc<dyn DestinationConnector>,
    timeouts: Timeouts,
}

impl Orchestrator {
    pub fn new(
        source: Arc<dyn SourceConnector>,
        converter: Arc<dyn DiskConverter>,
        destination: Arc<dyn DestinationConnector>,
        timeouts: Timeouts,
    ) -> Self {
        Self {
            source,
            converter,
            destination,
            timeouts,
        }
    }

    pub async fn run(&self, request: &MigrationRequest) -> MigrationResult {
        let mut state = MigrationState::new(request.mode);
        log_info!(
            "Starting {} migration of '{}' ({} -> {} VM {} on {}), run {}",
            request.mode,
            request.vm_name,
            self.source.name(),
            self.destination.name(),
            request.vmid,
            request.node,
            state.run_id.simple()
        );

        let outcome = match request.mode {
            MigrationPath::Cold => self.run_cold(request, &mut state).await,
            MigrationPath::Warm => self.run_warm(request, &mut state).await,
        };

        match outcome {
            Ok(()) => {
                log_info!(
                    "Migration of '{}' complete; VM {} is running",
                    request.vm_name,
                    request.vmid
                );
                state.succeed()
            }
            Err(err) => {
                log_error!(
                    "Migration of '{}' failed after {}: {}",
                    request.vm_name,
                    state.last_committed(),
                    err
                );
                self.release_change_tracking(request, &mut state).await;
                if state.source_stopped() {
                    log_warn!(
                        "Source VM '{}' is stopped and destination VM {} may be incomplete",
                        request.vm_name,
                        request.vmid
                    );
                }
                state.fail(err)
            }
        }
    }

    async fn run_cold(&self, request: &MigrationRequest, state: &mut MigrationState) -> Result<()> {
        self.ensure_destination_free(request).await?;
        let layout = self.prepare_staging(request, state).await?;

        self.stop_source(request).await?;
        state.advance(Phase::SourceStopped)?;

        self.export_base(request, state, &layout).await?;
        state.advance(Phase::BaseExported)?;

        let inject = request.guest_os.needs_drivers();
        self.convert_base(state, &layout, request.disk_format, inject)
            .await?;
        state.advance(Phase::BaseConverted)?;

        self.provision_destination(request, state).await?;

        self.start_destination(state).await?;
        state.advance(Phase::Started)?;
        Ok(())
    }

    async fn run_warm(&self, request: &MigrationRequest, state: &mut MigrationState) -> Result<()> {
        self.ensure_destination_free(request).await?;
        let layout = self.prepare_staging(request, state).await?;

        log_info!("Enabling change tracking on '{}'", request.vm_name);
        let token = self.source.enable_cbt(&request.vm_name).await?;
        log_info!("Change tracking checkpoint: {}", token);
        state.checkpoint = Some(token);
        state.advance(Phase::CbtEnabled)?;

        // Source stays live through BaseImported.
        self.export_base(request, state, &layout).await?;
        state.advance(Phase::BaseExported)?;

        // Raw base so changed blocks land at guest offsets; drivers go in at the end.
        self.convert_base(state, &layout, DiskFormat::Raw, false)
            .await?;
        state.advance(Phase::BaseConverted)?;

        self.provision_destination(request, state).await?;

        self.stop_source(request).await?;
        state.advance(Phase::SourceStopped)?;

        let token = state.checkpoint.clone().ok_or_else(|| {
            MigrationError::State("change tracking checkpoint missing".to_string())
        })?;
        let delta = layout.path_for(ArtifactRole::DeltaExport, DELTA_EXTENSION);
        log_info!("Exporting blocks changed since checkpoint {}", token);
        bounded(
            "export changed blocks",
            self.timeouts.export,
            self.source
                .export_changed_blocks(&request.vm_name, &token, &delta),
        )
        .await?;
        state.artifacts.register(ArtifactRole::DeltaExport, delta)?;
        state.advance(Phase::DeltaExported)?;

        let base = state
            .artifacts
            .require(ArtifactRole::BaseDiskConverted)?
            .to_path_buf();
        let delta = state
            .artifacts
            .require(ArtifactRole::DeltaExport)?
            .to_path_buf();
        let merged = layout.path_for(ArtifactRole::MergedDisk, DiskFormat::Raw.extension());
        log_info!("Merging changed blocks onto {}", base.display());
        bounded(
            "merge changed blocks",
            self.timeouts.convert,
            self.converter.merge_delta(&base, &delta, &merged),
        )
        .await?;
        state.artifacts.register(ArtifactRole::MergedDisk, merged)?;
        state.advance(Phase::DeltaMerged)?;

        let final_disk = self.convert_merged(request, state, &layout).await?;
        state.advance(Phase::DeltaConverted)?;

        let handle = state.destination()?.clone();
        log_info!("Replacing disk of VM {} with {}", handle.vmid, final_disk.display());
        bounded(
            "replace destination disk",
            self.timeouts.import,
            self.destination.replace_disk(&handle, &final_disk),
        )
        .await?;
        state.advance(Phase::DiskUpdated)?;

        self.start_destination(state).await?;
        state.advance(Phase::Started)?;

        self.release_change_tracking(request, state).await;
        Ok(())
    }

    /// Fail before touching the source if the destination id is taken.
    async fn ensure_destination_free(&self, request: &MigrationRequest) -> Result<()> {
        if self.destination.exists(request.vmid).await? {
            return Err(MigrationError::Conflict(request.vmid));
        }
        Ok(())
    }

    async fn prepare_staging(
        &self,
        request: &MigrationRequest,
        state: &MigrationState,
    ) -> Result<StagingLayout> {
        let layout = StagingLayout::new(&request.staging_dir, &request.vm_name, state.run_id);
        layout.prepare().await?;
        Ok(layout)
    }

    async fn stop_source(&self, request: &MigrationRequest) -> Result<()> {
        log_info!("Stopping source VM '{}'", request.vm_name);
        bounded(
            "stop source VM",
            self.timeouts.stop,
            self.source.stop(&request.vm_name),
        )
        .await
    }

    async fn export_base(
        &self,
        request: &MigrationRequest,
        state: &mut MigrationState,
        layout: &StagingLayout,
    ) -> Result<()> {
        let export = layout.path_for(
            ArtifactRole::BaseDiskExport,
            self.source.export_format().extension(),
        );
        log_info!("Exporting '{}' to {}", request.vm_name, export.display());
        bounded(
            "export source disk",
            self.timeouts.export,
            self.source.export(&request.vm_name, &export),
        )
        .await?;
        state.artifacts.register(ArtifactRole::BaseDiskExport, export)
    }

    async fn convert_base(
        &self,
        state: &mut MigrationState,
        layout: &StagingLayout,
        format: DiskFormat,
        inject_drivers: bool,
    ) -> Result<()> {
        let src = state
            .artifacts
            .require(ArtifactRole::BaseDiskExport)?
            .to_path_buf();
        let converted = layout.path_for(ArtifactRole::BaseDiskConverted, format.extension());
        bounded(
            "convert base disk",
            self.timeouts.convert,
            self.converter.convert(&src, &converted, inject_drivers),
        )
        .await?;
        state
            .artifacts
            .register(ArtifactRole::BaseDiskConverted, converted)
    }

    /// Convert the merged image unless it already is the final disk.
    async fn convert_merged(
        &self,
        request: &MigrationRequest,
        state: &mut MigrationState,
        layout: &StagingLayout,
    ) -> Result<PathBuf> {
        let merged = state
            .artifacts
            .require(ArtifactRole::MergedDisk)?
            .to_path_buf();
        let inject = request.guest_os.needs_drivers();
        if request.disk_format == DiskFormat::Raw && !inject {
            log_info!("Merged image is already in the destination format");
            return Ok(merged);
        }

        let final_disk = layout.path_for(ArtifactRole::FinalDisk, request.disk_format.extension());
        bounded(
            "convert merged disk",
            self.timeouts.convert,
            self.converter.convert(&merged, &final_disk, inject),
        )
        .await?;
        state
            .artifacts
            .register(ArtifactRole::FinalDisk, final_disk.clone())?;
        Ok(final_disk)
    }

    /// Create the VM, import the converted base and wire up devices.
    async fn provision_destination(
        &self,
        request: &MigrationRequest,
        state: &mut MigrationState,
    ) -> Result<()> {
        let handle = self
            .destination
            .create_vm(&request.vm_definition())
            .await?;
        state.destination = Some(handle.clone());
        state.advance(Phase::DestinationCreated)?;

        let disk = state
            .artifacts
            .require(ArtifactRole::BaseDiskConverted)?
            .to_path_buf();
        bounded(
            "import disk",
            self.timeouts.import,
            self.destination.import_disk(&handle, &disk),
        )
        .await?;
        self.destination
            .configure_devices(&handle, &request.network, &request.boot_order())
            .await?;
        if request.guest_os.needs_drivers() {
            log_info!("Attaching driver media {}", request.driver_iso);
            self.destination
                .attach_media(&handle, &request.driver_iso)
                .await?;
        }
        state.advance(Phase::BaseImported)
    }

    async fn start_destination(&self, state: &MigrationState) -> Result<()> {
        let handle = state.destination()?;
        self.destination.start(handle).await
    }

    /// Best-effort: a failed disable is recorded as a warning, never an error.
    async fn release_change_tracking(
        &self,
        request: &MigrationRequest,
        state: &mut MigrationState,
    ) {
        if state.checkpoint.take().is_none() {
            return;
        }
        match self.source.disable_cbt(&request.vm_name).await {
            Ok(()) => log_info!("Change tracking disabled on '{}'", request.vm_name),
            Err(err) => {
                log_warn!(
                    "Could not disable change tracking on '{}': {}",
                    request.vm_name,
                    err
                );
                state.warn(format!(
                    "change tracking is still enabled on source VM '{}': {}",
                    request.vm_name, err
                ));
            }
        }
    }
}

/// Collaborator calls a run would make, in order, without making them.
pub fn planned_steps(
    path: MigrationPath,
    guest_os: GuestOs,
    disk_format: DiskFormat,
) -> Vec<(Phase, Vec<&'static str>)> {
    let drivers = guest_os.needs_drivers();
    let mut import = vec!["destination.import_disk", "destination.configure_devices"];
    if drivers {
        import.push("destination.attach_media");
    }

    let mut steps = vec![(Phase::NotStarted, vec!["destination.exists"])];
    match path {
        MigrationPath::Cold => {
            steps.push((Phase::SourceStopped, vec!["source.stop"]));
            steps.push((Phase::BaseExported, vec!["source.export"]));
            steps.push((Phase::BaseConverted, vec!["converter.convert"]));
            steps.push((Phase::DestinationCreated, vec!["destination.create_vm"]));
            steps.push((Phase::BaseImported, import));
            steps.push((Phase::Started, vec!["destination.start"]));
        }
        MigrationPath::Warm => {
            steps.push((Phase::CbtEnabled, vec!["source.enable_cbt"]));
            steps.push((Phase::BaseExported, vec!["source.export"]));
            steps.push((Phase::BaseConverted, vec!["converter.convert"]));
            steps.push((Phase::DestinationCreated, vec!["destination.create_vm"]));
            steps.push((Phase::BaseImported, import));
            steps.push((Phase::SourceStopped, vec!["source.stop"]));
            steps.push((Phase::DeltaExported, vec!["source.export_changed_blocks"]));
            steps.push((Phase::DeltaMerged, vec!["converter.merge_delta"]));
            let final_convert = if disk_format == DiskFormat::Raw && !drivers {
                vec![]
            } else {
                vec!["converter.convert"]
            };
            steps.push((Phase::DeltaConverted, final_convert));
            steps.push((Phase::DiskUpdated, vec!["destination.replace_disk"]));
            steps.push((
                Phase::Started,
                vec!["destination.start", "source.disable_cbt"],
            ));
        }
    }
    steps
}
