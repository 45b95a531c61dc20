use anyhow::{anyhow, Context, Result};
use candle::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::{phi, phi3};
use tokenizers::Tokenizer;
use tracing::{debug, info};

use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::{SystemTime, UNIX_EPOCH},
};

use crate::device::{dtype_for, select_device};
use crate::inference::{GenerationParams, Generator, ModelLoader};

const EOS_TOKENS: &[&str] = &["<|endoftext|>", "<|end|>", "</s>", "<eos>"];

// ---------------------------------------------------------
// Architecture selection: config.json `model_type`
// ---------------------------------------------------------
pub enum ModelConfig {
    Phi(phi::Config),
    Phi3(phi3::Config),
}

impl ModelConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw: serde_json::Value = serde_json::from_slice(
            &fs::read(path).with_context(|| format!("failed to read {}", path.display()))?,
        )
        .with_context(|| format!("{} is not valid JSON", path.display()))?;
        Self::from_value(raw)
    }

    pub fn from_value(raw: serde_json::Value) -> Result<Self> {
        let model_type = raw
            .get("model_type")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        match model_type.as_str() {
            "phi" => Ok(Self::Phi(
                serde_json::from_value(raw).context("Phi config parse error")?,
            )),
            "phi3" => Ok(Self::Phi3(
                serde_json::from_value(raw).context("Phi-3 config parse error")?,
            )),
            other => Err(anyhow!(
                "unsupported model_type {other:?}, expected \"phi\" or \"phi3\""
            )),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Phi(_) => "phi",
            Self::Phi3(_) => "phi3",
        }
    }
}

// ---------------------------------------------------------
// Model wrapper: one forward signature for both architectures
// ---------------------------------------------------------
pub enum CausalLm {
    Phi(phi::Model),
    Phi3(phi3::Model),
}

impl CausalLm {
    pub fn new(cfg: &ModelConfig, vb: VarBuilder) -> candle::Result<Self> {
        Ok(match cfg {
            ModelConfig::Phi(c) => Self::Phi(phi::Model::new(c, vb)?),
            ModelConfig::Phi3(c) => Self::Phi3(phi3::Model::new(c, vb)?),
        })
    }

    /// Logits for the last position of `x`, flattened to `[vocab]`.
    /// `pos` is the number of tokens already in the KV cache.
    pub fn forward(&mut self, x: &Tensor, pos: usize) -> candle::Result<Tensor> {
        let out = match self {
            Self::Phi(m) => m.forward(x)?,
            Self::Phi3(m) => m.forward(x, pos)?,
        };
        out.flatten_all()
    }

    pub fn clear_kv_cache(&mut self) {
        match self {
            Self::Phi(m) => m.clear_kv_cache(),
            Self::Phi3(m) => m.clear_kv_cache(),
        }
    }
}

// ---------------------------------------------------------
// Snapshot helpers
// ---------------------------------------------------------
pub fn load_tokenizer(dir: &Path) -> Result<Tokenizer> {
    let path = dir.join("tokenizer.json");
    if !path.exists() {
        return Err(anyhow!("tokenizer.json not found under {}", dir.display()));
    }
    let mut tokenizer = Tokenizer::from_file(&path)
        .map_err(|e| anyhow!("Tokenizer load failed ({}): {e}", path.display()))?;
    tokenizer.with_padding(None);
    let _ = tokenizer.with_truncation(None);
    Ok(tokenizer)
}

/// Safetensors files of a snapshot: the shards named in the index, a single
/// `model.safetensors`, or whatever `.safetensors` files are present.
pub fn find_weight_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let index_path = dir.join("model.safetensors.index.json");
    if index_path.exists() {
        let shards = index_shard_names(&index_path)?;
        return Ok(shards.into_iter().map(|f| dir.join(f)).collect());
    }

    let single = dir.join("model.safetensors");
    if single.exists() {
        return Ok(vec![single]);
    }

    let mut files = fs::read_dir(dir)
        .with_context(|| format!("cannot read {}", dir.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().map(|ext| ext == "safetensors").unwrap_or(false))
        .collect::<Vec<_>>();
    files.sort();

    if files.is_empty() {
        return Err(anyhow!("no model weights found under {}", dir.display()));
    }
    Ok(files)
}

/// Distinct shard file names referenced by a `model.safetensors.index.json`.
pub fn index_shard_names(index: &Path) -> Result<BTreeSet<String>> {
    let raw: serde_json::Value = serde_json::from_slice(&fs::read(index)?)
        .with_context(|| format!("{} is not valid JSON", index.display()))?;
    raw["weight_map"]
        .as_object()
        .ok_or_else(|| anyhow!("index.json: weight_map is not an object"))?
        .values()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| anyhow!("invalid shard entry in index.json"))
        })
        .collect()
}

pub fn eos_token_ids(tokenizer: &Tokenizer) -> Vec<u32> {
    EOS_TOKENS
        .iter()
        .filter_map(|t| tokenizer.token_to_id(t))
        .collect()
}

// ---------------------------------------------------------
// PUBLIC SERVICE
// ---------------------------------------------------------
pub struct PhiService {
    model: Mutex<CausalLm>,
    tokenizer: Tokenizer,
    device: Device,
    eos: Vec<u32>,
    seed: Option<u64>,
}

impl PhiService {
    pub fn load(snapshot_dir: &Path, device: Device, seed: Option<u64>) -> Result<Self> {
        info!(path = %snapshot_dir.display(), ?device, "loading model");

        let tokenizer = load_tokenizer(snapshot_dir)?;
        let cfg = ModelConfig::from_file(&snapshot_dir.join("config.json"))?;
        let shards = find_weight_files(snapshot_dir)?;
        info!(arch = cfg.name(), shards = shards.len(), "model snapshot resolved");

        let dtype = dtype_for(&device);
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&shards, dtype, &device)? };
        let model = CausalLm::new(&cfg, vb)?;

        let eos = eos_token_ids(&tokenizer);
        if eos.is_empty() {
            debug!("tokenizer has no known EOS token, generation stops at max_new_tokens");
        }

        info!(arch = cfg.name(), ?dtype, "model loaded");
        Ok(Self {
            model: Mutex::new(model),
            tokenizer,
            device,
            eos,
            seed,
        })
    }

    fn sampling_seed(&self) -> u64 {
        self.seed.unwrap_or_else(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or_default()
        })
    }
}

impl Generator for PhiService {
    fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<String> {
        let enc = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| anyhow!("encode error: {e}"))?;
        let mut tokens = enc.get_ids().to_vec();
        tokens.truncate(params.max_length);
        if tokens.is_empty() {
            return Err(anyhow!("prompt produced no tokens"));
        }
        let prompt_len = tokens.len();

        let mut model = self
            .model
            .lock()
            .map_err(|_| anyhow!("model lock poisoned by an earlier panic"))?;
        model.clear_kv_cache();

        let temperature = (params.temperature > 0.0).then_some(params.temperature);
        let mut lp = LogitsProcessor::new(self.sampling_seed(), temperature, Some(params.top_p));
        let mut pos = 0usize;

        for _ in 0..params.max_new_tokens {
            // first step: whole prompt; later: last token only
            let ctx: &[u32] = if pos == 0 {
                &tokens
            } else {
                &tokens[tokens.len() - 1..]
            };

            let input = Tensor::new(ctx, &self.device)?.unsqueeze(0)?;
            let logits = model.forward(&input, pos)?.to_dtype(DType::F32)?;
            pos += ctx.len();

            let next = lp.sample(&logits)?;
            if self.eos.contains(&next) {
                break;
            }
            tokens.push(next);
        }

        debug!(
            prompt_tokens = prompt_len,
            new_tokens = tokens.len() - prompt_len,
            "generation finished"
        );

        self.tokenizer
            .decode(&tokens, true)
            .map_err(|e| anyhow!("decode error: {e}"))
    }
}

/// Loads Phi-family snapshots on the configured device.
pub struct PhiLoader {
    device: Option<String>,
    seed: Option<u64>,
}

impl PhiLoader {
    pub fn new(device: Option<String>, seed: Option<u64>) -> Self {
        Self { device, seed }
    }
}

impl ModelLoader for PhiLoader {
    fn load(&self, dir: &Path) -> Result<Arc<dyn Generator>> {
        let device = select_device(self.device.as_deref())?;
        let service = PhiService::load(dir, device, self.seed)?;
        Ok(Arc::new(service))
    }
}
