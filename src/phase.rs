//! Migration phases and the per-path transition order.
//!
//! Each path owns a fixed phase sequence. A run may only move from its
//! current phase to the immediate successor in that sequence, or to
//! `Failed` from anywhere that is not already terminal.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    NotStarted,
    SourceStopped,
    BaseExported,
    BaseConverted,
    DestinationCreated,
    BaseImported,
    #[serde(rename = "CBTEnabled")]
    CbtEnabled,
    DeltaExported,
    DeltaMerged,
    DeltaConverted,
    DiskUpdated,
    Started,
    Failed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::NotStarted => "NotStarted",
            Phase::SourceStopped => "SourceStopped",
            Phase::BaseExported => "BaseExported",
            Phase::BaseConverted => "BaseConverted",
            Phase::DestinationCreated => "DestinationCreated",
            Phase::BaseImported => "BaseImported",
            Phase::CbtEnabled => "CBTEnabled",
            Phase::DeltaExported => "DeltaExported",
            Phase::DeltaMerged => "DeltaMerged",
            Phase::DeltaConverted => "DeltaConverted",
            Phase::DiskUpdated => "DiskUpdated",
            Phase::Started => "Started",
            Phase::Failed => "Failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Started | Phase::Failed)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationPath {
    Cold,
    Warm,
}

const COLD_SEQUENCE: &[Phase] = &[
    Phase::NotStarted,
    Phase::SourceStopped,
    Phase::BaseExported,
    Phase::BaseConverted,
    Phase::DestinationCreated,
    Phase::BaseImported,
    Phase::Started,
];

// The source keeps running until BaseImported; SourceStopped is the cutover.
const WARM_SEQUENCE: &[Phase] = &[
    Phase::NotStarted,
    Phase::CbtEnabled,
    Phase::BaseExported,
    Phase::BaseConverted,
    Phase::DestinationCreated,
    Phase::BaseImported,
    Phase::SourceStopped,
    Phase::DeltaExported,
    Phase::DeltaMerged,
    Phase::DeltaConverted,
    Phase::DiskUpdated,
    Phase::Started,
];

impl MigrationPath {
    pub fn sequence(&self) -> &'static [Phase] {
        match self {
            MigrationPath::Cold => COLD_SEQUENCE,
            MigrationPath::Warm => WARM_SEQUENCE,
        }
    }

    pub fn position(&self, phase: Phase) -> Option<usize> {
        self.sequence().iter().position(|p| *p == phase)
    }

    /// The phase that must follow `current`, if any.
    pub fn successor(&self, current: Phase) -> Option<Phase> {
        let index = self.position(current)?;
        self.sequence().get(index + 1).copied()
    }

    pub fn permits(&self, from: Phase, to: Phase) -> bool {
        if to == Phase::Failed {
            return !from.is_terminal();
        }
        self.successor(from) == Some(to)
    }

    /// True once the source VM has been powered off on this path.
    pub fn source_stopped_by(&self, phase: Phase) -> bool {
        match (self.position(phase), self.position(Phase::SourceStopped)) {
            (Some(at), Some(stop)) => at >= stop,
            _ => false,
        }
    }
}

impl fmt::Display for MigrationPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationPath::Cold => f.write_str("cold"),
            MigrationPath::Warm => f.write_str("warm"),
        }
    }
}
