//! Test doubles shared by the unit tests.

use std::{
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
    str::FromStr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use candle::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use serde_json::json;
use tokenizers::Tokenizer;
use uuid::Uuid;
use zip::{write::SimpleFileOptions, ZipWriter};

use crate::artifact::ArtifactFetcher;
use crate::inference::{
    phi::{CausalLm, ModelConfig},
    GenerationParams, Generator, ModelLoader,
};

pub fn temp_root(tag: &str) -> PathBuf {
    let root = std::env::temp_dir().join(format!("examsathi-{tag}-{}", Uuid::new_v4()));
    fs::create_dir_all(&root).unwrap();
    root
}

/// Word-level tokenizer over `words`, `[UNK]` at id 0.
pub fn tiny_tokenizer(words: &[&str]) -> Tokenizer {
    let mut vocab = serde_json::Map::new();
    vocab.insert("[UNK]".into(), json!(0));
    for (i, w) in words.iter().enumerate() {
        vocab.insert(w.to_string(), json!(i + 1));
    }

    let definition = json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": { "type": "Whitespace" },
        "post_processor": null,
        "decoder": null,
        "model": { "type": "WordLevel", "vocab": vocab, "unk_token": "[UNK]" }
    });
    Tokenizer::from_str(&definition.to_string()).expect("valid tokenizer definition")
}

/// Words of the tiny snapshot tokenizer; ids 1..=15, vocab 16.
pub const TINY_WORDS: &[&str] = &[
    "Question", ":", "Answer", "what", "is", "water", "H2O", ".", "salt", "NaCl", "the", "sky",
    "blue", "sugar", "sweet",
];

/// Writes a randomly initialised one-layer Phi snapshot (config, tokenizer,
/// weights) small enough to train on the CPU in a test.
pub fn tiny_phi_snapshot(dir: &Path) {
    fs::create_dir_all(dir).unwrap();
    let config = json!({
        "model_type": "phi",
        "vocab_size": TINY_WORDS.len() + 1,
        "hidden_size": 16,
        "intermediate_size": 32,
        "num_hidden_layers": 1,
        "num_attention_heads": 2,
        "num_key_value_heads": null,
        "hidden_act": "gelu_new",
        "max_position_embeddings": 64,
        "layer_norm_eps": 1e-5,
        "tie_word_embeddings": false,
        "rope_theta": 10000.0,
        "partial_rotary_factor": 0.5,
        "qk_layernorm": false
    });
    fs::write(dir.join("config.json"), config.to_string()).unwrap();

    let cfg = ModelConfig::from_value(config).unwrap();
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    CausalLm::new(&cfg, vb).unwrap();
    varmap.save(dir.join("model.safetensors")).unwrap();

    tiny_tokenizer(TINY_WORDS)
        .save(dir.join("tokenizer.json"), false)
        .unwrap();
}

/// Echoes the prompt followed by a fixed answer.
pub struct StubGenerator {
    answer: Option<String>,
}

impl StubGenerator {
    pub fn answering(answer: &str) -> Self {
        Self {
            answer: Some(answer.to_string()),
        }
    }

    pub fn failing() -> Self {
        Self { answer: None }
    }
}

impl Generator for StubGenerator {
    fn generate(&self, prompt: &str, _params: &GenerationParams) -> Result<String> {
        match &self.answer {
            Some(answer) => Ok(format!("{prompt} {answer}")),
            None => Err(anyhow!("out of memory")),
        }
    }
}

pub struct StubLoader {
    answer: Option<String>,
    delay: Duration,
    pub loads: AtomicUsize,
}

impl StubLoader {
    pub fn answering(answer: &str) -> Self {
        Self {
            answer: Some(answer.to_string()),
            delay: Duration::ZERO,
            loads: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            answer: None,
            delay: Duration::ZERO,
            loads: AtomicUsize::new(0),
        }
    }

    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl ModelLoader for StubLoader {
    fn load(&self, dir: &Path) -> Result<Arc<dyn Generator>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        match &self.answer {
            Some(answer) => Ok(Arc::new(StubGenerator::answering(answer))),
            None => Err(anyhow!("config.json missing under {}", dir.display())),
        }
    }
}

/// Serves a zip built from in-memory files.
pub struct ArchiveFetcher {
    files: Vec<(String, String)>,
    pub calls: AtomicUsize,
}

impl ArchiveFetcher {
    pub fn with_files(files: &[(&str, &str)]) -> Self {
        Self {
            files: files
                .iter()
                .map(|(n, c)| (n.to_string(), c.to_string()))
                .collect(),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ArtifactFetcher for ArchiveFetcher {
    async fn fetch(&self, _file_id: &str, dest: &Path) -> Result<u64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut zip = ZipWriter::new(File::create(dest)?);
        for (name, content) in &self.files {
            zip.start_file(name.as_str(), SimpleFileOptions::default())?;
            zip.write_all(content.as_bytes())?;
        }
        zip.finish()?;
        Ok(fs::metadata(dest)?.len())
    }
}

pub struct FailingFetcher;

#[async_trait]
impl ArtifactFetcher for FailingFetcher {
    async fn fetch(&self, file_id: &str, _dest: &Path) -> Result<u64> {
        Err(anyhow!("HTTP 404 Not Found for {file_id}"))
    }
}
