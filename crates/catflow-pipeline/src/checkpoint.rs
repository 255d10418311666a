//! Checkpoint save/restore for pipeline runs.
//!
//! After each converged stage the executor can persist a [`PipelineCheckpoint`]
//! to disk. [`PipelineExecutor::resume`](crate::PipelineExecutor::resume)
//! picks the run up at the first unfinished stage instead of starting over.
//!
//! Each run owns `<dir>/<run>.json`, so runs sharing a checkpoint directory
//! never overwrite or clear each other's snapshots.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use catflow_types::Result;

use crate::engine::PipelineState;

const CHECKPOINT_EXT: &str = "json";

/// Snapshot of a pipeline run taken between stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineCheckpoint {
    /// Name of the protocol template the run was started from.
    #[serde(default)]
    pub protocol: Option<String>,
    pub state: PipelineState,
    /// RFC 3339 timestamp of when the checkpoint was created.
    pub timestamp: String,
}

impl PipelineCheckpoint {
    pub fn new(protocol: Option<String>, state: PipelineState) -> Self {
        Self {
            protocol,
            state,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn run(&self) -> &str {
        &self.state.run
    }
}

/// File a run's checkpoint lives in. Characters outside `[A-Za-z0-9._-]` in
/// the run id are replaced by `_`.
pub fn checkpoint_path(dir: &Path, run: &str) -> PathBuf {
    let stem: String = run
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    dir.join(format!("{stem}.{CHECKPOINT_EXT}"))
}

/// Save a checkpoint to `<dir>/<run>.json`, creating `dir` if needed.
pub async fn save_checkpoint(checkpoint: &PipelineCheckpoint, dir: &Path) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let path = checkpoint_path(dir, checkpoint.run());
    let json = serde_json::to_string_pretty(checkpoint)?;
    tokio::fs::write(&path, json).await?;
    tracing::debug!(
        path = %path.display(),
        run = checkpoint.run(),
        stage = %checkpoint.state.current,
        "Checkpoint saved"
    );
    Ok(path)
}

/// Load the checkpoint of `run` in `dir`, or `Ok(None)` if there is none.
pub async fn load_checkpoint(dir: &Path, run: &str) -> Result<Option<PipelineCheckpoint>> {
    let path = checkpoint_path(dir, run);
    if !tokio::fs::try_exists(&path).await? {
        return Ok(None);
    }
    let json = tokio::fs::read_to_string(&path).await?;
    let checkpoint: PipelineCheckpoint = serde_json::from_str(&json)?;
    Ok(Some(checkpoint))
}

/// Every checkpoint in `dir`, ordered by run id.
pub async fn list_checkpoints(dir: &Path) -> Result<Vec<PipelineCheckpoint>> {
    if !tokio::fs::try_exists(dir).await? {
        return Ok(Vec::new());
    }
    let mut checkpoints = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(CHECKPOINT_EXT) {
            continue;
        }
        let json = tokio::fs::read_to_string(&path).await?;
        checkpoints.push(serde_json::from_str::<PipelineCheckpoint>(&json)?);
    }
    checkpoints.sort_by(|a, b| a.state.run.cmp(&b.state.run));
    Ok(checkpoints)
}

/// Delete the checkpoint of `run` after it succeeded.
pub async fn clear_checkpoint(dir: &Path, run: &str) -> Result<()> {
    let path = checkpoint_path(dir, run);
    if tokio::fs::try_exists(&path).await? {
        tokio::fs::remove_file(&path).await?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use catflow_types::{
        CalcType, OutputHandle, Parameters, Site, StageRole, StageTag, Structure,
        StructuredResult,
    };

    use crate::engine::StageResult;

    fn sample_checkpoint(run: &str) -> PipelineCheckpoint {
        let structure = Structure::new(
            [[3.0, 0.0, 0.0], [0.0, 3.0, 0.0], [0.0, 0.0, 3.0]],
            vec![Site::new("Li", [0.0, 0.0, 0.0])],
        );
        let mut state = PipelineState::new(run, structure);
        state.results.insert(
            StageTag(0),
            StageResult {
                tag: StageTag(0),
                calc_type: CalcType::Static,
                role: StageRole::Probe,
                attempts: 1,
                parameters: Parameters::new().with("IBRION", -1).with("ALGO", "Fast"),
                result: StructuredResult::converged().with_diagnostic("final_energy", -1.9),
                outputs: OutputHandle("out-1".into()),
            },
        );
        state.current = StageTag(1);
        state.restart = Some(OutputHandle("out-1".into()));
        PipelineCheckpoint::new(Some("catmat".into()), state)
    }

    #[tokio::test]
    async fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cp = sample_checkpoint("discharged");

        let path = save_checkpoint(&cp, dir.path()).await.unwrap();
        assert!(path.exists());
        assert_eq!(path, dir.path().join("discharged.json"));

        let loaded = load_checkpoint(dir.path(), "discharged")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.protocol.as_deref(), Some("catmat"));
        assert_eq!(loaded.timestamp, cp.timestamp);
        assert_eq!(loaded.state, cp.state);
    }

    #[tokio::test]
    async fn load_from_nonexistent_directory_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does_not_exist");

        let result = load_checkpoint(&missing, "pipeline").await.unwrap();
        assert!(result.is_none());
        assert!(list_checkpoints(&missing).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn runs_sharing_a_directory_keep_their_own_files() {
        let dir = tempfile::tempdir().unwrap();
        save_checkpoint(&sample_checkpoint("encut_500"), dir.path())
            .await
            .unwrap();
        save_checkpoint(&sample_checkpoint("encut_400"), dir.path())
            .await
            .unwrap();

        clear_checkpoint(dir.path(), "encut_500").await.unwrap();
        assert!(load_checkpoint(dir.path(), "encut_500").await.unwrap().is_none());
        assert!(load_checkpoint(dir.path(), "encut_400").await.unwrap().is_some());
        // clearing twice is fine
        clear_checkpoint(dir.path(), "encut_500").await.unwrap();

        save_checkpoint(&sample_checkpoint("charged"), dir.path())
            .await
            .unwrap();
        let runs: Vec<String> = list_checkpoints(dir.path())
            .await
            .unwrap()
            .iter()
            .map(|c| c.run().to_string())
            .collect();
        assert_eq!(runs, vec!["charged", "encut_400"]);
    }

    #[test]
    fn run_ids_are_made_file_safe() {
        let path = checkpoint_path(Path::new("/tmp/runs"), "ENCUT = 520/a");
        assert_eq!(path, PathBuf::from("/tmp/runs/ENCUT___520_a.json"));
    }

    #[tokio::test]
    async fn corrupt_checkpoint_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(checkpoint_path(dir.path(), "pipeline"), "{not json").unwrap();
        assert!(load_checkpoint(dir.path(), "pipeline").await.is_err());
    }
}
