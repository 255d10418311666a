//! Error signature catalog and log classifier for VASP job outputs.
//!
//! A [`SignatureCatalog`] maps signature names to literal patterns, each bound
//! to one log stream. [`classify`] scans a job's stdout and stderr and returns
//! the set of signature names found.
//!
//! # Example
//! ```
//! use catflow_catalog::{classify, SignatureCatalog};
//!
//! let stdout = " WARNING: Sub-Space-Matrix is not hermitian in DAV           1\n";
//! let errors = classify(stdout, "", SignatureCatalog::builtin());
//! assert!(errors.contains("subspacematrix"));
//! assert_eq!(errors.len(), 1);
//! ```

mod builtin;
mod catalog;
mod classify;

pub use catalog::{ErrorSignature, SignatureCatalog, BUILTIN_CATALOG_VERSION};
pub use classify::{classify, classify_detailed, ClassifiedErrors, SignatureMatch};
