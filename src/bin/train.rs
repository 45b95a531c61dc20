use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use examsathi::train::{self, TrainConfig};

/// Fine-tune a Phi-family model on question/answer pairs.
#[derive(Parser, Debug)]
#[command(name = "examsathi-train", version)]
struct Cli {
    /// Hugging Face repo id or local model directory
    #[arg(long, default_value = "microsoft/phi-2")]
    base_model: String,

    /// JSON array of {"question", "answer"} objects
    #[arg(long, default_value = "training_data.json")]
    data: PathBuf,

    #[arg(long, default_value = "./examsathi-model")]
    output: PathBuf,

    /// Tokens kept per example
    #[arg(long, default_value_t = 512)]
    max_length: usize,

    #[arg(long, default_value_t = 3)]
    epochs: usize,

    #[arg(long, default_value_t = 2)]
    batch_size: usize,

    /// Micro-batches per optimizer step
    #[arg(long, default_value_t = 4)]
    grad_accum: usize,

    #[arg(long, default_value_t = 2e-5)]
    lr: f64,

    #[arg(long, default_value_t = 100)]
    save_steps: usize,

    #[arg(long, default_value_t = 10)]
    logging_steps: usize,

    /// Checkpoints kept on disk
    #[arg(long, default_value_t = 2)]
    save_total_limit: usize,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// cpu, cuda or cuda:N (default: CUDA when available)
    #[arg(long)]
    device: Option<String>,

    /// Also write {output}.zip for upload
    #[arg(long)]
    package: bool,
}

impl From<Cli> for TrainConfig {
    fn from(cli: Cli) -> Self {
        Self {
            base_model: cli.base_model,
            data_file: cli.data,
            output_dir: cli.output,
            max_length: cli.max_length,
            epochs: cli.epochs,
            batch_size: cli.batch_size,
            grad_accum: cli.grad_accum,
            learning_rate: cli.lr,
            save_steps: cli.save_steps,
            logging_steps: cli.logging_steps,
            save_total_limit: cli.save_total_limit,
            seed: cli.seed,
            device: cli.device,
            package: cli.package,
        }
    }
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = TrainConfig::from(Cli::parse());
    let summary = train::run(&config)?;

    println!(
        "Trained {} steps on {} examples. Model saved to {}",
        summary.global_step,
        summary.examples,
        config.output_dir.display()
    );
    if config.package {
        println!("Upload the .zip next to it and set MODEL_FILE_ID to its file id.");
    }
    Ok(())
}
