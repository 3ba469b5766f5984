use crate::artifacts::{ArtifactRegistry, ArtifactRole};
use crate::connectors::{CheckpointToken, VmHandle};
use crate::error::ErrorKind;
use crate::phase::{MigrationPath, Phase};
use crate::{MigrationError, Result, log_info};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub phase: Phase,
    pub at: DateTime<Utc>,
}

/// Progress of one run. Owned by the orchestrator and dropped with it.
#[derive(Debug)]
pub struct MigrationState {
    pub run_id: Uuid,
    pub path: MigrationPath,
    phase: Phase,
    last_committed: Phase,
    history: Vec<PhaseTransition>,
    pub artifacts: ArtifactRegistry,
    pub destination: Option<VmHandle>,
    pub checkpoint: Option<CheckpointToken>,
    pub warnings: Vec<String>,
}

impl MigrationState {
    pub fn new(path: MigrationPath) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            path,
            phase: Phase::NotStarted,
            last_committed: Phase::NotStarted,
            history: vec![PhaseTransition {
                phase: Phase::NotStarted,
                at: Utc::now(),
            }],
            artifacts: ArtifactRegistry::new(),
            destination: None,
            checkpoint: None,
            warnings: Vec::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Last phase that actually completed; unchanged by a failure.
    pub fn last_committed(&self) -> Phase {
        self.last_committed
    }

    pub fn history(&self) -> &[PhaseTransition] {
        &self.history
    }

    /// Commit the next phase of the active path.
    pub fn advance(&mut self, next: Phase) -> Result<()> {
        if next == Phase::Failed || !self.path.permits(self.phase, next) {
            return Err(MigrationError::State(format!(
                "{} path cannot move from {} to {}",
                self.path, self.phase, next
            )));
        }
        self.phase = next;
        self.last_committed = next;
        self.history.push(PhaseTransition {
            phase: next,
            at: Utc::now(),
        });
        log_info!("[{}] phase {}", self.path, next);
        Ok(())
    }

    pub fn destination(&self) -> Result<&VmHandle> {
        self.destination.as_ref().ok_or_else(|| {
            MigrationError::State("destination VM used before it was created".to_string())
        })
    }

    pub fn source_stopped(&self) -> bool {
        self.path.source_stopped_by(self.last_committed)
    }

    pub fn cbt_active(&self) -> bool {
        self.checkpoint.is_some()
    }

    pub fn warn(&mut self, message: String) {
        self.warnings.push(message);
    }

    pub fn succeed(self) -> MigrationResult {
        MigrationResult::from_state(self, None)
    }

    pub fn fail(mut self, error: MigrationError) -> MigrationResult {
        let source_stopped = self.source_stopped();
        let descriptor = ErrorDescriptor {
            phase: self.last_committed,
            kind: error.kind(),
            reported_kind: if source_stopped {
                ErrorKind::PartialFailure
            } else {
                error.kind()
            },
            message: error.to_string(),
            source_stopped,
            error: Some(error),
        };
        if self.phase != Phase::Failed {
            self.phase = Phase::Failed;
            self.history.push(PhaseTransition {
                phase: Phase::Failed,
                at: Utc::now(),
            });
        }
        MigrationResult::from_state(self, Some(descriptor))
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorDescriptor {
    /// Last phase completed before the failure.
    pub phase: Phase,
    /// Kind of the underlying error.
    pub kind: ErrorKind,
    /// What the run reports: `PartialFailure` once the source was stopped.
    pub reported_kind: ErrorKind,
    pub message: String,
    pub source_stopped: bool,
    #[serde(skip)]
    pub error: Option<MigrationError>,
}

#[derive(Debug, Serialize)]
pub struct MigrationResult {
    pub run_id: Uuid,
    pub path: MigrationPath,
    pub success: bool,
    pub final_phase: Phase,
    pub error: Option<ErrorDescriptor>,
    pub warnings: Vec<String>,
    pub history: Vec<PhaseTransition>,
    pub artifacts: Vec<(ArtifactRole, PathBuf)>,
    pub destination: Option<VmHandle>,
}

impl MigrationResult {
    fn from_state(state: MigrationState, error: Option<ErrorDescriptor>) -> Self {
        Self {
            run_id: state.run_id,
            path: state.path,
            success: error.is_none(),
            final_phase: state.last_committed,
            artifacts: state
                .artifacts
                .iter()
                .map(|(role, path)| (*role, path.clone()))
                .collect(),
            error,
            warnings: state.warnings,
            history: state.history,
            destination: state.destination,
        }
    }

    pub fn phases(&self) -> Vec<Phase> {
        self.history.iter().map(|t| t.phase).collect()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Collapse into a `Result`, tagging the error with how far the run got.
    pub fn into_result(mut self) -> Result<Phase> {
        let Some(descriptor) = self.error.take() else {
            return Ok(self.final_phase);
        };
        let source = Box::new(descriptor.error.unwrap_or_else(|| {
            MigrationError::State(descriptor.message.clone())
        }));
        if descriptor.source_stopped {
            Err(MigrationError::PartialFailure {
                phase: descriptor.phase,
                source,
            })
        } else {
            Err(MigrationError::Failed {
                phase: descriptor.phase,
                source,
            })
        }
    }
}

impl fmt::Display for MigrationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Migration {} ({} path, run {})",
            if self.success { "succeeded" } else { "FAILED" },
            self.path,
            self.run_id.simple()
        )?;
        writeln!(f, "  Final phase: {}", self.final_phase)?;
        if let Some(handle) = &self.destination {
            writeln!(f, "  Destination: VM {} on node {}", handle.vmid, handle.node)?;
        }
        if let Some(err) = &self.error {
            if err.reported_kind == err.kind {
                writeln!(f, "  Error: {} after {}: {}", err.kind, err.phase, err.message)?;
            } else {
                writeln!(
                    f,
                    "  Error: {} ({}) after {}: {}",
                    err.reported_kind, err.kind, err.phase, err.message
                )?;
            }
            if err.source_stopped {
                writeln!(
                    f,
                    "  ⚠ The source VM is stopped and the destination may be incomplete."
                )?;
                writeln!(
                    f,
                    "    Restart the source VM or finish the destination manually; partial VMs are not removed."
                )?;
            }
        }
        for warning in &self.warnings {
            writeln!(f, "  Warning: {}", warning)?;
        }
        if !self.artifacts.is_empty() {
            writeln!(f, "  Staged artifacts (not cleaned up):")?;
            for (role, path) in &self.artifacts {
                writeln!(f, "    {:<20} {}", role.as_str(), path.display())?;
            }
        }
        Ok(())
    }
}
