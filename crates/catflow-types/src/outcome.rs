//! Outcome vocabulary shared by the restart controller and the stage pipeline.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::structure::Structure;
use crate::CatflowError;

// ---------------------------------------------------------------------------
// StageTag: ordinal stage identifier (`stage_0`, `stage_1`, ...)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StageTag(pub u32);

impl StageTag {
    /// The canonical first tag of every protocol.
    pub const FIRST: StageTag = StageTag(0);

    pub fn index(self) -> u32 {
        self.0
    }

    pub fn next(self) -> StageTag {
        StageTag(self.0 + 1)
    }

    pub fn is_first(self) -> bool {
        self == Self::FIRST
    }
}

impl fmt::Display for StageTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage_{}", self.0)
    }
}

impl FromStr for StageTag {
    type Err = CatflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.strip_prefix("stage_")
            .and_then(|n| n.parse::<u32>().ok())
            .map(StageTag)
            .ok_or_else(|| CatflowError::ProtocolError(format!("invalid stage tag '{s}'")))
    }
}

impl TryFrom<String> for StageTag {
    type Error = CatflowError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<StageTag> for String {
    fn from(tag: StageTag) -> Self {
        tag.to_string()
    }
}

// ---------------------------------------------------------------------------
// Calculation typing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalcType {
    Static,
    Relaxation,
}

impl CalcType {
    /// Map an `IBRION` value to a calculation type. `-1` is a static run,
    /// `1`, `2` and `3` are ionic relaxations; everything else is unsupported.
    pub fn from_ibrion(ibrion: i64) -> Option<CalcType> {
        match ibrion {
            -1 => Some(CalcType::Static),
            1..=3 => Some(CalcType::Relaxation),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CalcType::Static => "static",
            CalcType::Relaxation => "relaxation",
        }
    }
}

impl fmt::Display for CalcType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a stage is convergence-checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageRole {
    Probe,
    Production,
}

// ---------------------------------------------------------------------------
// Job handles
// ---------------------------------------------------------------------------

/// Opaque handle of one submitted job attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobHandle(pub String);

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque handle to the retrieved outputs of a finished attempt. Also used as
/// the restart reference that seeds a later attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutputHandle(pub String);

impl fmt::Display for OutputHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCompletion {
    pub succeeded: bool,
    pub outputs: OutputHandle,
}

// ---------------------------------------------------------------------------
// StructuredResult: what the result parser hands back
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuredResult {
    pub converged: bool,
    pub converged_electronically: bool,
    pub converged_ionically: bool,
    /// Scalar diagnostics such as `final_energy_per_atom` or `band_gap_spin_up`.
    #[serde(default)]
    pub diagnostics: BTreeMap<String, f64>,
    /// Final geometry, present for relaxation runs.
    #[serde(default)]
    pub structure: Option<Structure>,
}

impl StructuredResult {
    /// A fully converged result with no diagnostics.
    pub fn converged() -> Self {
        Self {
            converged: true,
            converged_electronically: true,
            converged_ionically: true,
            ..Default::default()
        }
    }

    pub fn diagnostic(&self, name: &str) -> Option<f64> {
        self.diagnostics.get(name).copied()
    }

    pub fn with_diagnostic(mut self, name: impl Into<String>, value: f64) -> Self {
        self.diagnostics.insert(name.into(), value);
        self
    }

    pub fn with_structure(mut self, structure: Structure) -> Self {
        self.structure = Some(structure);
        self
    }
}

// ---------------------------------------------------------------------------
// AbortReason: why a pipeline stopped without finishing
// ---------------------------------------------------------------------------

/// Distinguishes the failure modes an operator must react to differently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AbortReason {
    /// The job failed and no catalog signature matched its logs.
    #[error("{stage}: job failed with no recognised error signature")]
    UnclassifiedFailure { stage: StageTag },

    /// Signatures matched but no enabled handler claimed them.
    #[error("{stage}: no enabled handler for errors {errors:?}")]
    UnhandledErrors { stage: StageTag, errors: Vec<String> },

    /// Handled failures kept recurring until the job submission cap was hit.
    #[error("{stage}: job iteration cap reached after {submissions} submissions")]
    IterationCapExceeded { stage: StageTag, submissions: usize },

    /// The job ran but the stage never met its convergence predicate.
    #[error("{stage}: not converged after {attempts} attempts")]
    NonConvergence { stage: StageTag, attempts: usize },

    #[error("pipeline cancelled")]
    Cancelled { stage: Option<StageTag> },
}

impl AbortReason {
    pub fn stage(&self) -> Option<StageTag> {
        match self {
            AbortReason::UnclassifiedFailure { stage }
            | AbortReason::UnhandledErrors { stage, .. }
            | AbortReason::IterationCapExceeded { stage, .. }
            | AbortReason::NonConvergence { stage, .. } => Some(*stage),
            AbortReason::Cancelled { stage } => *stage,
        }
    }

    /// Operator-facing hint for the corrective action.
    pub fn remedy(&self) -> &'static str {
        match self {
            AbortReason::UnclassifiedFailure { .. } => "extend the error signature catalog",
            AbortReason::UnhandledErrors { .. } => "enable or add a handler for the matched errors",
            AbortReason::IterationCapExceeded { .. } | AbortReason::NonConvergence { .. } => {
                "raise the iteration cap or inspect the input"
            }
            AbortReason::Cancelled { .. } => "resubmit when ready",
        }
    }
}
