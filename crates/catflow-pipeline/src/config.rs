//! Run configuration loaded from YAML.
//!
//! ```yaml
//! stage_cap: 5
//! job_cap: 5
//! checkpoint_dir: runs/licoo2
//! catalog: signatures.json
//! hubbard: hubbard_u.yaml
//! enable_handlers: [tetrahedron]
//! disable_handlers: [zbrent]
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use catflow_catalog::SignatureCatalog;
use catflow_types::Result;

use crate::derive::HubbardSet;
use crate::handler::HandlerRegistry;

/// Settings for one pipeline run. Every field has a default, so an empty
/// file is a valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Attempts of one stage that may end unconverged before the run aborts.
    pub stage_cap: usize,
    /// Submissions allowed within one stage attempt.
    pub job_cap: usize,
    /// Where checkpoints are written; no checkpointing when unset.
    pub checkpoint_dir: Option<PathBuf>,
    /// JSON signature catalog replacing the built-in one.
    pub catalog: Option<PathBuf>,
    /// YAML Hubbard set; enables DFT+U derivation when set.
    pub hubbard: Option<PathBuf>,
    pub enable_handlers: Vec<String>,
    pub disable_handlers: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stage_cap: 5,
            job_cap: 5,
            checkpoint_dir: None,
            catalog: None,
            hubbard: None,
            enable_handlers: Vec::new(),
            disable_handlers: Vec::new(),
        }
    }
}

impl PipelineConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml(&yaml)
    }

    /// Apply the enable list, then the disable list. Unknown handler names
    /// are an error.
    pub fn apply_handler_overrides(&self, registry: &mut HandlerRegistry) -> Result<()> {
        for name in &self.enable_handlers {
            registry.set_enabled(name, true)?;
        }
        for name in &self.disable_handlers {
            registry.set_enabled(name, false)?;
        }
        Ok(())
    }

    /// The configured catalog, or a copy of the built-in one.
    pub fn load_catalog(&self) -> Result<SignatureCatalog> {
        match &self.catalog {
            Some(path) => SignatureCatalog::load(path),
            None => Ok(SignatureCatalog::builtin().clone()),
        }
    }

    pub fn load_hubbard(&self) -> Result<Option<HubbardSet>> {
        self.hubbard.as_deref().map(HubbardSet::load).transpose()
    }
}
