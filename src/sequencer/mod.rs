//! Provisioning sequencer.
//!
//! A sequencer runs the ordered host operations for one workload and records
//! every step in a [`ProvisionState`]. The first fatal failure stops the run
//! and is returned as [`ProvisionError::Step`] together with the state
//! accumulated so far. Best-effort steps record a [`StepOutcome::Degraded`]
//! entry and the run continues. Nothing is rolled back.

mod container;
mod vm;

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use strum::Display;
use tracing::{info, warn};

use crate::error::ProvisionError;
use crate::host::{VmConfig, VmId};

pub use container::ContainerSequencer;
pub use vm::VmSequencer;

/// A named provisioning step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum Step {
    CreateResource,
    AttachFirmware,
    ImportDisk,
    ResolveVolume,
    AttachDisk,
    ResizeDisk,
    SetBootOrder,
    EnableGuestAgent,
    Start,
    RunSetup,
}

/// What happened in a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Completed { detail: String },
    /// Not applicable to this request
    Skipped { reason: String },
    /// Best-effort step failed; the run continued
    Degraded { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRecord {
    pub step: Step,
    pub outcome: StepOutcome,
}

/// Append-only log of the steps performed for one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionState {
    vmid: VmId,
    records: Vec<StepRecord>,
}

impl ProvisionState {
    pub fn new(vmid: VmId) -> Self {
        Self {
            vmid,
            records: Vec::new(),
        }
    }

    pub fn vmid(&self) -> VmId {
        self.vmid
    }

    pub fn records(&self) -> &[StepRecord] {
        &self.records
    }

    /// Steps that finished with [`StepOutcome::Completed`], in order.
    pub fn completed_steps(&self) -> Vec<Step> {
        self.records
            .iter()
            .filter(|r| matches!(r.outcome, StepOutcome::Completed { .. }))
            .map(|r| r.step)
            .collect()
    }

    pub fn outcome_of(&self, step: Step) -> Option<&StepOutcome> {
        self.records.iter().rev().find(|r| r.step == step).map(|r| &r.outcome)
    }

    pub(crate) fn completed(&mut self, step: Step, detail: impl Into<String>) {
        let detail = detail.into();
        info!("[{}] {}: {}", self.vmid, step, detail);
        self.records.push(StepRecord {
            step,
            outcome: StepOutcome::Completed { detail },
        });
    }

    pub(crate) fn skipped(&mut self, step: Step, reason: impl Into<String>) {
        let reason = reason.into();
        info!("[{}] {}: skipped ({})", self.vmid, step, reason);
        self.records.push(StepRecord {
            step,
            outcome: StepOutcome::Skipped { reason },
        });
    }

    pub(crate) fn degraded(&mut self, step: Step, error: &anyhow::Error) {
        warn!("[{}] {} failed, continuing: {:#}", self.vmid, step, error);
        self.records.push(StepRecord {
            step,
            outcome: StepOutcome::Degraded {
                error: format!("{:#}", error),
            },
        });
    }

    /// Builds the step error for `step`, carrying a snapshot of this state.
    pub(crate) fn failed(
        &self,
        step: Step,
        source: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    ) -> ProvisionError {
        ProvisionError::Step {
            step,
            vmid: self.vmid,
            state: self.clone(),
            source: source.into(),
        }
    }
}

impl fmt::Display for ProvisionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "resource {}", self.vmid)?;
        if self.records.is_empty() {
            return write!(f, ": no steps performed");
        }
        for record in &self.records {
            match &record.outcome {
                StepOutcome::Completed { detail } => {
                    write!(f, "\n  [done]     {}: {}", record.step, detail)?
                }
                StepOutcome::Skipped { reason } => {
                    write!(f, "\n  [skipped]  {}: {}", record.step, reason)?
                }
                StepOutcome::Degraded { error } => {
                    write!(f, "\n  [degraded] {}: {}", record.step, error)?
                }
            }
        }
        Ok(())
    }
}

// Older releases print `Successfully imported disk as 'unused0:<volid>'`,
// newer ones `unused0: successfully imported disk '<volid>'`.
static IMPORTED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)imported disk (?:as )?'(?:unused\d+:)?([^']+)'").expect("import regex is valid")
});

/// Where the imported volume name was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeResolution {
    /// Named in the import command output
    FoundDirect(String),
    /// Read from an `unusedN` slot of the VM configuration
    FoundFallback(String),
    NotFound,
}

impl VolumeResolution {
    pub fn volume(&self) -> Option<&str> {
        match self {
            Self::FoundDirect(v) | Self::FoundFallback(v) => Some(v),
            Self::NotFound => None,
        }
    }
}

/// Extracts the volume name from `qm importdisk` output.
pub fn volume_from_import_output(output: &str) -> Option<String> {
    IMPORTED_RE
        .captures_iter(output)
        .last()
        .map(|c| c[1].trim().to_string())
}

/// Locates the imported volume: import output first, then the newest unused slot.
pub fn resolve_volume(import_output: &str, config: &VmConfig) -> VolumeResolution {
    if let Some(volume) = volume_from_import_output(import_output) {
        return VolumeResolution::FoundDirect(volume);
    }
    match config.unused_volumes().pop() {
        Some((_, volume)) => VolumeResolution::FoundFallback(volume),
        None => VolumeResolution::NotFound,
    }
}
