use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use candle::{backprop::GradStore, safetensors::MmapedSafetensors, DType, Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use tracing::{debug, info};

use crate::inference::phi::{find_weight_files, CausalLm, ModelConfig};
use crate::train::{
    checkpoint::{self, TrainerState},
    TrainConfig,
};

#[derive(Debug, Clone, PartialEq)]
pub struct TrainSummary {
    pub global_step: usize,
    pub examples: usize,
    pub first_loss: Option<f32>,
    pub final_loss: Option<f32>,
}

/// Causal-LM fine-tuning over pre-tokenized sequences. Trainable weights
/// live in a `VarMap` seeded from the base snapshot.
pub struct Trainer {
    model: CausalLm,
    varmap: VarMap,
    optimizer: AdamW,
    device: Device,
}

impl Trainer {
    pub fn load(base: &Path, device: Device, learning_rate: f64) -> Result<Self> {
        let cfg = ModelConfig::from_file(&base.join("config.json"))?;
        let shards = find_weight_files(base)?;
        info!(arch = cfg.name(), shards = shards.len(), ?device, "building trainable model");

        // Optimizer state needs full precision.
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = CausalLm::new(&cfg, vb)?;
        load_pretrained(&varmap, &shards, &device)?;

        let optimizer = AdamW::new(
            varmap.all_vars(),
            ParamsAdamW {
                lr: learning_rate,
                weight_decay: 0.0,
                ..Default::default()
            },
        )?;

        Ok(Self {
            model,
            varmap,
            optimizer,
            device,
        })
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// Mean next-token cross-entropy over one sequence. Tokens are fed one
    /// at a time through the KV cache so every position yields logits.
    fn sequence_loss(&mut self, ids: &[u32]) -> Result<Tensor> {
        if ids.len() < 2 {
            bail!("sequence too short for a next-token target");
        }
        self.model.clear_kv_cache();

        let mut logits = Vec::with_capacity(ids.len() - 1);
        for (pos, &token) in ids[..ids.len() - 1].iter().enumerate() {
            let input = Tensor::new(&[token], &self.device)?.unsqueeze(0)?;
            logits.push(self.model.forward(&input, pos)?.to_dtype(DType::F32)?);
        }
        let logits = Tensor::stack(&logits, 0)?;
        let targets = Tensor::new(&ids[1..], &self.device)?;
        Ok(candle_nn::loss::cross_entropy(&logits, &targets)?)
    }

    /// Gradients of the mean loss over `batch`, built `micro` sequences at
    /// a time so only one micro-batch graph is alive. Returns the mean loss.
    fn accumulate_grads(
        &mut self,
        batch: &[&Vec<u32>],
        micro: usize,
    ) -> Result<(f32, GradStore)> {
        let vars = self.varmap.all_vars();
        let mut summed: Vec<Option<Tensor>> = vec![None; vars.len()];
        let weight = 1.0 / batch.len() as f64;
        let mut total = 0f32;
        let mut last = None;

        for chunk in batch.chunks(micro.max(1)) {
            let mut losses = Vec::with_capacity(chunk.len());
            for ids in chunk {
                losses.push(self.sequence_loss(ids)?);
            }
            // this micro-batch's share of the step mean
            let loss = (Tensor::stack(&losses, 0)?.sum_all()? * weight)?;
            self.model.clear_kv_cache();
            total += loss.to_scalar::<f32>()?;

            let grads = loss.backward()?;
            for (var, acc) in vars.iter().zip(summed.iter_mut()) {
                if let Some(grad) = grads.get(var.as_tensor()) {
                    *acc = Some(match acc.take() {
                        Some(prev) => (prev + grad)?,
                        None => grad.clone(),
                    });
                }
            }
            last = Some(grads);
        }

        let mut grads = last.ok_or_else(|| anyhow!("empty batch"))?;
        for (var, acc) in vars.iter().zip(summed) {
            if let Some(grad) = acc {
                grads.insert(var.as_tensor(), grad);
            }
        }
        Ok((total, grads))
    }

    /// One optimizer step over `batch`; returns the mean loss.
    fn step(&mut self, batch: &[&Vec<u32>], micro: usize) -> Result<f32> {
        let (loss, grads) = self.accumulate_grads(batch, micro)?;
        self.optimizer.step(&grads)?;
        Ok(loss)
    }

    pub fn train(&mut self, sequences: &[Vec<u32>], cfg: &TrainConfig) -> Result<TrainSummary> {
        let per_step = cfg.effective_batch();
        let steps_per_epoch = steps_per_epoch(sequences.len(), per_step);
        let total_steps = steps_per_epoch * cfg.epochs;
        info!(
            examples = sequences.len(),
            epochs = cfg.epochs,
            effective_batch = per_step,
            total_steps,
            "training started"
        );

        let mut global_step = 0usize;
        let mut window = Vec::with_capacity(cfg.logging_steps);
        let mut first_loss = None;
        let mut last_loss = None;

        for epoch in 0..cfg.epochs {
            let order = epoch_order(sequences.len(), cfg.seed, epoch);
            for chunk in order.chunks(per_step) {
                let lr = learning_rate_at(cfg.learning_rate, global_step, total_steps);
                self.optimizer.set_learning_rate(lr);

                let batch = chunk.iter().map(|&i| &sequences[i]).collect::<Vec<_>>();
                let loss = self.step(&batch, cfg.batch_size)?;
                first_loss.get_or_insert(loss);
                global_step += 1;
                last_loss = Some(loss);
                window.push(loss);
                debug!(step = global_step, loss, "step");

                if global_step % cfg.logging_steps == 0 {
                    let mean = window.iter().sum::<f32>() / window.len() as f32;
                    info!(step = global_step, epoch, loss = mean, lr, "training progress");
                    window.clear();
                }

                if global_step % cfg.save_steps == 0 {
                    let state = TrainerState {
                        global_step,
                        epoch,
                        loss,
                        learning_rate: lr,
                        saved_at: chrono::Utc::now().to_rfc3339(),
                    };
                    checkpoint::save_checkpoint(
                        &cfg.output_dir,
                        &self.varmap,
                        &state,
                        cfg.save_total_limit,
                    )?;
                }
            }
            info!(epoch, step = global_step, "epoch finished");
        }

        Ok(TrainSummary {
            global_step,
            examples: sequences.len(),
            first_loss,
            final_loss: last_loss,
        })
    }
}

/// Copies every trainable tensor from the base safetensors into `varmap`.
fn load_pretrained(varmap: &VarMap, shards: &[PathBuf], device: &Device) -> Result<()> {
    let weights = unsafe { MmapedSafetensors::multi(shards)? };
    let vars = varmap
        .data()
        .lock()
        .map_err(|_| anyhow!("variable map lock poisoned"))?;

    for (name, var) in vars.iter() {
        let tensor = weights
            .load(name, device)
            .with_context(|| format!("base weights have no tensor {name}"))?
            .to_dtype(var.dtype())?;
        var.set(&tensor)
            .with_context(|| format!("shape mismatch for {name}"))?;
    }
    info!(tensors = vars.len(), "pretrained weights loaded");
    Ok(())
}

pub fn steps_per_epoch(examples: usize, per_step: usize) -> usize {
    examples.div_ceil(per_step.max(1))
}

/// Linear decay to zero over the run.
pub fn learning_rate_at(base: f64, step: usize, total: usize) -> f64 {
    if total == 0 {
        return base;
    }
    base * (1.0 - step as f64 / total as f64).max(0.0)
}

/// Deterministic shuffle of `0..n` for one epoch.
pub fn epoch_order(n: usize, seed: u64, epoch: usize) -> Vec<usize> {
    let mut order = (0..n).collect::<Vec<_>>();
    let mut rng = StdRng::seed_from_u64(seed.wrapping_add(epoch as u64));
    order.shuffle(&mut rng);
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::phi::load_tokenizer;
    use crate::testing::{temp_root, tiny_phi_snapshot};
    use crate::train::dataset::{tokenize_examples, QaExample};
    use std::fs;

    fn tiny_sequences(base: &Path) -> Vec<Vec<u32>> {
        let tokenizer = load_tokenizer(base).unwrap();
        let examples = [
            ("what is water", "H2O ."),
            ("what is salt", "NaCl ."),
            ("what is the sky", "blue ."),
            ("what is sugar", "sweet ."),
        ]
        .iter()
        .map(|(q, a)| QaExample {
            question: q.to_string(),
            answer: a.to_string(),
        })
        .collect::<Vec<_>>();
        tokenize_examples(&tokenizer, &examples, 64).unwrap()
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    #[test]
    fn micro_batches_accumulate_to_the_full_batch_gradient() {
        let root = temp_root("accumulate");
        tiny_phi_snapshot(&root);
        let sequences = tiny_sequences(&root);
        let batch = sequences.iter().collect::<Vec<_>>();

        let mut trainer = Trainer::load(&root, Device::Cpu, 1e-3).unwrap();
        let (full_loss, full) = trainer.accumulate_grads(&batch, batch.len()).unwrap();
        let (micro_loss, micro) = trainer.accumulate_grads(&batch, 1).unwrap();

        assert!((full_loss - micro_loss).abs() < 1e-4);
        for var in trainer.varmap().all_vars() {
            let a = full.get(var.as_tensor()).expect("gradient for every weight");
            let b = micro.get(var.as_tensor()).expect("gradient for every weight");
            assert!(max_abs_diff(a, b) < 1e-4);
        }
        fs::remove_dir_all(root).ok();
    }

    #[test]
    fn partial_batches_count_as_a_step() {
        assert_eq!(steps_per_epoch(16, 8), 2);
        assert_eq!(steps_per_epoch(17, 8), 3);
        assert_eq!(steps_per_epoch(3, 8), 1);
    }

    #[test]
    fn learning_rate_decays_linearly() {
        assert_eq!(learning_rate_at(2e-5, 0, 10), 2e-5);
        assert!((learning_rate_at(2e-5, 5, 10) - 1e-5).abs() < 1e-12);
        assert_eq!(learning_rate_at(2e-5, 10, 10), 0.0);
        assert_eq!(learning_rate_at(2e-5, 3, 0), 2e-5);
    }

    #[test]
    fn shuffle_is_seeded_per_epoch() {
        let a = epoch_order(50, 42, 0);
        assert_eq!(a, epoch_order(50, 42, 0));
        assert_ne!(a, epoch_order(50, 42, 1));

        let mut sorted = a.clone();
        sorted.sort();
        assert_eq!(sorted, (0..50).collect::<Vec<_>>());
    }
}
