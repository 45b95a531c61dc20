//! Supervised fine-tuning of a Phi-family causal LM on question/answer
//! pairs, producing the model directory (and optionally the zip) the
//! server downloads.

pub mod base;
pub mod checkpoint;
pub mod dataset;
pub mod trainer;

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Result};
use tracing::info;

use crate::artifact::archive;
use crate::device::select_device;
use crate::inference::phi::load_tokenizer;

pub use trainer::{TrainSummary, Trainer};

#[derive(Debug, Clone)]
pub struct TrainConfig {
    /// Hub repo id or local directory.
    pub base_model: String,
    pub data_file: PathBuf,
    pub output_dir: PathBuf,
    pub max_length: usize,
    pub epochs: usize,
    pub batch_size: usize,
    pub grad_accum: usize,
    pub learning_rate: f64,
    pub save_steps: usize,
    pub logging_steps: usize,
    pub save_total_limit: usize,
    pub seed: u64,
    pub device: Option<String>,
    pub package: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            base_model: "microsoft/phi-2".into(),
            data_file: PathBuf::from("training_data.json"),
            output_dir: PathBuf::from("./examsathi-model"),
            max_length: 512,
            epochs: 3,
            batch_size: 2,
            grad_accum: 4,
            learning_rate: 2e-5,
            save_steps: 100,
            logging_steps: 10,
            save_total_limit: 2,
            seed: 42,
            device: None,
            package: false,
        }
    }
}

impl TrainConfig {
    /// Sequences consumed per optimizer step.
    pub fn effective_batch(&self) -> usize {
        self.batch_size * self.grad_accum
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("max_length", self.max_length),
            ("epochs", self.epochs),
            ("batch_size", self.batch_size),
            ("grad_accum", self.grad_accum),
            ("save_steps", self.save_steps),
            ("logging_steps", self.logging_steps),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            bail!("{name} must be at least 1");
        }
        if self.max_length < 2 {
            bail!("max_length must be at least 2");
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            bail!("learning_rate must be a positive number");
        }
        Ok(())
    }
}

/// Dataset → base model → training loop → saved artifact.
pub fn run(cfg: &TrainConfig) -> Result<TrainSummary> {
    cfg.validate()?;

    let examples = dataset::load_examples(&cfg.data_file)?;
    let base = base::resolve_base_model(&cfg.base_model)?;
    let tokenizer = load_tokenizer(&base)?;
    let sequences = dataset::tokenize_examples(&tokenizer, &examples, cfg.max_length)?;

    let device = select_device(cfg.device.as_deref())?;
    let mut trainer = Trainer::load(&base, device, cfg.learning_rate)?;
    let summary = trainer.train(&sequences, cfg)?;

    checkpoint::save_final(&cfg.output_dir, trainer.varmap(), &base)?;
    if cfg.package {
        package_output(&cfg.output_dir)?;
    }

    info!(
        steps = summary.global_step,
        first_loss = summary.first_loss,
        loss = summary.final_loss,
        output = %cfg.output_dir.display(),
        "training complete"
    );
    Ok(summary)
}

/// Zips the trained model directory next to it as `{dir}.zip`, leaving
/// intermediate checkpoints out.
pub fn package_output(output: &Path) -> Result<PathBuf> {
    let name = output
        .file_name()
        .ok_or_else(|| anyhow!("cannot package {}: no directory name", output.display()))?
        .to_string_lossy()
        .to_string();
    let archive_path = output
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(format!("{name}.zip"));

    let files = archive::pack_dir(output, &archive_path, checkpoint::is_checkpoint_name)?;
    info!(files, archive = %archive_path.display(), "model packaged");
    Ok(archive_path)
}
