//! Shared types, errors, parameters, and structures for the catflow engine.
//!
//! This crate provides the foundational types used across all other catflow crates:
//! - `CatflowError`: unified error taxonomy for preconditions and collaborators
//! - `Parameters` / `Modifications`: INCAR-style parameter sets and the per-cycle accumulator
//! - `Structure`: geometry owned by a pipeline run
//! - `elements`: periodic-table data for ordering species and weighing cells
//! - `AbortReason`, `StageTag`, job handles: outcome vocabulary shared by controller and pipeline

use serde::{Deserialize, Serialize};

pub mod elements;
pub mod outcome;
pub mod params;
pub mod structure;

pub use elements::{atomic_number, electronegativity, element, element_symbol, Element};
pub use outcome::{
    AbortReason, CalcType, JobCompletion, JobHandle, OutputHandle, StageRole, StageTag,
    StructuredResult,
};
pub use params::{Modifications, Parameters};
pub use structure::{Site, Structure};

/// Which of the two retrieved log streams a signature or error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl std::fmt::Display for LogStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogStream::Stdout => f.write_str("stdout"),
            LogStream::Stderr => f.write_str("stderr"),
        }
    }
}

/// Unified error type for all catflow subsystems.
///
/// Domain failures of a job (unknown error signature, non-convergence, ...)
/// are not errors; they end a pipeline with an [`AbortReason`]. This enum
/// covers broken preconditions, invalid templates, and collaborator failures.
#[derive(Debug, thiserror::Error)]
pub enum CatflowError {
    // === Classifier Errors ===
    #[error("{stream} stream is missing for job '{job}'")]
    MissingStream { job: String, stream: LogStream },

    #[error("Signature catalog error: {0}")]
    CatalogError(String),

    // === Protocol Errors ===
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Unsupported calculation in {stage}: IBRION={ibrion}")]
    UnsupportedCalculation { stage: String, ibrion: String },

    #[error("Invalid parameter '{key}': {message}")]
    InvalidParameter { key: String, message: String },

    // === Collaborator Errors ===
    #[error("{collaborator} failed: {message}")]
    Collaborator {
        collaborator: String,
        message: String,
    },

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("{0}")]
    Other(String),
}

impl CatflowError {
    /// Shorthand for wrapping a failure reported by an external collaborator.
    pub fn collaborator(collaborator: impl Into<String>, message: impl Into<String>) -> Self {
        CatflowError::Collaborator {
            collaborator: collaborator.into(),
            message: message.into(),
        }
    }

    /// Returns `true` if the error comes from a malformed catalog or protocol
    /// rather than from a running job. Such errors surface before any submission.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            CatflowError::CatalogError(_)
                | CatflowError::ProtocolError(_)
                | CatflowError::UnsupportedCalculation { .. }
                | CatflowError::Yaml(_)
        )
    }
}

/// A convenience alias for `Result<T, CatflowError>`.
pub type Result<T> = std::result::Result<T, CatflowError>;
