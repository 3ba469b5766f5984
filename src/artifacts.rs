use crate::{MigrationError, Result, log_debug};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// File extension of a changed-block journal produced by a delta export.
pub const DELTA_EXTENSION: &str = "vsdelta";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactRole {
    BaseDiskExport,
    BaseDiskConverted,
    DeltaExport,
    MergedDisk,
    FinalDisk,
}

impl ArtifactRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactRole::BaseDiskExport => "base-disk-export",
            ArtifactRole::BaseDiskConverted => "base-disk-converted",
            ArtifactRole::DeltaExport => "delta-export",
            ArtifactRole::MergedDisk => "merged-disk",
            ArtifactRole::FinalDisk => "final-disk",
        }
    }
}

impl fmt::Display for ArtifactRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-run staging directory. The run id keeps paths unique across runs.
#[derive(Debug, Clone)]
pub struct StagingLayout {
    run_dir: PathBuf,
}

impl StagingLayout {
    pub fn new(root: &Path, vm_name: &str, run_id: Uuid) -> Self {
        let safe_name: String = vm_name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        Self {
            run_dir: root.join(format!("{}-{}", safe_name, run_id.simple())),
        }
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn path_for(&self, role: ArtifactRole, extension: &str) -> PathBuf {
        self.run_dir.join(format!("{}.{}", role.as_str(), extension))
    }

    pub async fn prepare(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.run_dir).await?;
        log_debug!("Staging directory ready: {}", self.run_dir.display());
        Ok(())
    }
}

/// Paths produced during a run, keyed by the role they play.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArtifactRegistry {
    entries: BTreeMap<ArtifactRole, PathBuf>,
}

impl ArtifactRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an artifact once it exists. A role can only be produced once per run.
    pub fn register(&mut self, role: ArtifactRole, path: PathBuf) -> Result<()> {
        if let Some(existing) = self.entries.get(&role) {
            return Err(MigrationError::State(format!(
                "artifact {} already produced at {}",
                role,
                existing.display()
            )));
        }
        if self.entries.values().any(|p| *p == path) {
            return Err(MigrationError::State(format!(
                "path {} is already registered for another artifact",
                path.display()
            )));
        }
        self.entries.insert(role, path);
        Ok(())
    }

    pub fn require(&self, role: ArtifactRole) -> Result<&Path> {
        self.entries
            .get(&role)
            .map(PathBuf::as_path)
            .ok_or_else(|| {
                MigrationError::State(format!("artifact {} consumed before it was produced", role))
            })
    }

    pub fn get(&self, role: ArtifactRole) -> Option<&Path> {
        self.entries.get(&role).map(PathBuf::as_path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ArtifactRole, &PathBuf)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
