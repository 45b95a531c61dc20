use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub const CHECKPOINT_PREFIX: &str = "checkpoint-";
pub const WEIGHTS_FILE: &str = "model.safetensors";

/// Files copied from the base snapshot next to the trained weights.
const REQUIRED_FILES: &[&str] = &["config.json", "tokenizer.json"];
const OPTIONAL_FILES: &[&str] = &["tokenizer_config.json", "generation_config.json"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerState {
    pub global_step: usize,
    pub epoch: usize,
    pub loss: f32,
    pub learning_rate: f64,
    pub saved_at: String,
}

pub fn checkpoint_dir(output: &Path, step: usize) -> PathBuf {
    output.join(format!("{CHECKPOINT_PREFIX}{step}"))
}

pub fn is_checkpoint_name(name: &str) -> bool {
    name.strip_prefix(CHECKPOINT_PREFIX)
        .map(|n| n.parse::<usize>().is_ok())
        .unwrap_or(false)
}

/// Checkpoints under `output`, oldest step first.
pub fn list_checkpoints(output: &Path) -> Result<Vec<(usize, PathBuf)>> {
    if !output.exists() {
        return Ok(Vec::new());
    }

    let mut found = fs::read_dir(output)
        .with_context(|| format!("cannot read {}", output.display()))?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().to_string();
            let step = name.strip_prefix(CHECKPOINT_PREFIX)?.parse::<usize>().ok()?;
            Some((step, e.path()))
        })
        .collect::<Vec<_>>();
    found.sort_by_key(|(step, _)| *step);
    Ok(found)
}

/// Deletes all but the newest `keep` checkpoints. Returns what was removed.
pub fn prune_checkpoints(output: &Path, keep: usize) -> Result<Vec<PathBuf>> {
    let found = list_checkpoints(output)?;
    let excess = found.len().saturating_sub(keep);

    let mut removed = Vec::with_capacity(excess);
    for (step, path) in found.into_iter().take(excess) {
        fs::remove_dir_all(&path)
            .with_context(|| format!("failed to remove {}", path.display()))?;
        debug!(step, "old checkpoint removed");
        removed.push(path);
    }
    Ok(removed)
}

pub fn write_trainer_state(dir: &Path, state: &TrainerState) -> Result<()> {
    fs::create_dir_all(dir)?;
    let path = dir.join("trainer_state.json");
    fs::write(&path, serde_json::to_vec_pretty(state)?)
        .with_context(|| format!("failed to write {}", path.display()))
}

pub fn save_checkpoint(
    output: &Path,
    varmap: &VarMap,
    state: &TrainerState,
    keep: usize,
) -> Result<PathBuf> {
    let dir = checkpoint_dir(output, state.global_step);
    fs::create_dir_all(&dir)?;
    varmap
        .save(dir.join(WEIGHTS_FILE))
        .with_context(|| format!("failed to save weights to {}", dir.display()))?;
    write_trainer_state(&dir, state)?;
    info!(step = state.global_step, path = %dir.display(), "checkpoint saved");

    prune_checkpoints(output, keep)?;
    Ok(dir)
}

/// Copies config and tokenizer files from the base snapshot into `output`.
pub fn copy_model_files(base: &Path, output: &Path) -> Result<()> {
    fs::create_dir_all(output)?;
    for name in REQUIRED_FILES {
        let from = base.join(name);
        fs::copy(&from, output.join(name))
            .with_context(|| format!("failed to copy {}", from.display()))?;
    }
    for name in OPTIONAL_FILES {
        let from = base.join(name);
        if from.exists() {
            fs::copy(&from, output.join(name))
                .with_context(|| format!("failed to copy {}", from.display()))?;
        }
    }
    Ok(())
}

/// Final artifact: trained weights plus everything needed to load them.
pub fn save_final(output: &Path, varmap: &VarMap, base: &Path) -> Result<()> {
    fs::create_dir_all(output)?;
    varmap
        .save(output.join(WEIGHTS_FILE))
        .with_context(|| format!("failed to save weights to {}", output.display()))?;
    copy_model_files(base, output)?;
    info!(path = %output.display(), "model saved");
    Ok(())
}
