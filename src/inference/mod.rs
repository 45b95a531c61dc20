pub mod phi;

use std::{path::Path, sync::Arc};

use anyhow::Result;

use crate::{error::ServeError, prompt};

pub use phi::{PhiLoader, PhiService};

pub const DEFAULT_MAX_LENGTH: usize = 512;
pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const TOP_P: f64 = 0.9;

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    /// Prompt tokens kept after truncation.
    pub max_length: usize,
    pub max_new_tokens: usize,
    /// 0 means greedy decoding.
    pub temperature: f64,
    pub top_p: f64,
}

impl GenerationParams {
    pub fn new(
        max_length: Option<i64>,
        temperature: Option<f64>,
        max_new_tokens: Option<i64>,
        default_new_tokens: usize,
    ) -> Result<Self, ServeError> {
        let max_length = positive("max_length", max_length, DEFAULT_MAX_LENGTH)?;
        let max_new_tokens = positive("max_new_tokens", max_new_tokens, default_new_tokens)?;

        let temperature = temperature.unwrap_or(DEFAULT_TEMPERATURE);
        if !temperature.is_finite() || temperature < 0.0 {
            return Err(ServeError::invalid(
                "temperature",
                format!("must be a finite number >= 0, got {temperature}"),
            ));
        }

        Ok(Self {
            max_length,
            max_new_tokens,
            temperature,
            top_p: TOP_P,
        })
    }
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_length: DEFAULT_MAX_LENGTH,
            max_new_tokens: crate::config::DEFAULT_MAX_NEW_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
            top_p: TOP_P,
        }
    }
}

fn positive(name: &'static str, value: Option<i64>, default: usize) -> Result<usize, ServeError> {
    match value {
        None => Ok(default),
        Some(v) if v >= 1 => Ok(v as usize),
        Some(v) => Err(ServeError::invalid(name, format!("must be at least 1, got {v}"))),
    }
}

/// A loaded causal LM. Returns the decoded prompt plus continuation.
pub trait Generator: Send + Sync {
    fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<String>;
}

/// Turns a model directory into a ready generator.
pub trait ModelLoader: Send + Sync {
    fn load(&self, dir: &Path) -> Result<Arc<dyn Generator>>;
}

/// Full question → answer round: template, generate on the blocking pool,
/// cut the prompt prefix.
pub async fn answer_question(
    generator: Arc<dyn Generator>,
    question: &str,
    params: GenerationParams,
) -> Result<String, ServeError> {
    let prompt = prompt::question_prompt(question);
    let decoded = tokio::task::spawn_blocking(move || generator.generate(&prompt, &params))
        .await
        .map_err(|e| ServeError::Generation(format!("generation task failed: {e}")))?
        .map_err(|e| ServeError::Generation(format!("{e:#}")))?;

    Ok(prompt::extract_answer(&decoded))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StubGenerator;

    #[test]
    fn defaults_match_the_api_contract() {
        let params = GenerationParams::new(None, None, None, 256).unwrap();
        assert_eq!(params.max_length, 512);
        assert_eq!(params.max_new_tokens, 256);
        assert_eq!(params.temperature, 0.7);
        assert_eq!(params.top_p, 0.9);
    }

    #[test]
    fn rejects_out_of_range_values() {
        assert!(GenerationParams::new(Some(0), None, None, 256).is_err());
        assert!(GenerationParams::new(Some(-5), None, None, 256).is_err());
        assert!(GenerationParams::new(None, Some(-0.1), None, 256).is_err());
        assert!(GenerationParams::new(None, Some(f64::NAN), None, 256).is_err());
        assert!(GenerationParams::new(None, None, Some(0), 256).is_err());
        assert!(GenerationParams::new(None, Some(0.0), None, 256).is_ok());
    }

    #[tokio::test]
    async fn answer_strips_the_prompt() {
        let generator: Arc<dyn Generator> = Arc::new(StubGenerator::answering("Chlorophyll."));
        let answer = answer_question(
            generator,
            "What makes leaves green?",
            GenerationParams::default(),
        )
        .await
        .unwrap();
        assert_eq!(answer, "Chlorophyll.");
    }

    #[tokio::test]
    async fn generator_failure_is_a_generation_error() {
        let generator: Arc<dyn Generator> = Arc::new(StubGenerator::failing());
        let err = answer_question(generator, "q", GenerationParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ServeError::Generation(_)));
    }
}
