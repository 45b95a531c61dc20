use std::{fs, path::Path};

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use tokenizers::Tokenizer;
use tracing::{info, warn};

use crate::prompt;

#[derive(Debug, Clone, Deserialize)]
pub struct QaExample {
    #[serde(default)]
    pub question: String,
    #[serde(default)]
    pub answer: String,
}

impl QaExample {
    pub fn text(&self) -> String {
        prompt::training_text(self.question.trim(), self.answer.trim())
    }
}

/// Reads `[{question, answer}, ...]`, skipping entries with an empty side.
pub fn load_examples(path: &Path) -> Result<Vec<QaExample>> {
    let raw = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    parse_examples(&raw).with_context(|| format!("invalid dataset {}", path.display()))
}

pub fn parse_examples(raw: &[u8]) -> Result<Vec<QaExample>> {
    let entries: Vec<QaExample> =
        serde_json::from_slice(raw).context("expected a JSON array of {question, answer}")?;
    let total = entries.len();

    let examples = entries
        .into_iter()
        .enumerate()
        .filter(|(i, e)| {
            let keep = !e.question.trim().is_empty() && !e.answer.trim().is_empty();
            if !keep {
                warn!(index = i, "skipping entry with empty question or answer");
            }
            keep
        })
        .map(|(_, e)| e)
        .collect::<Vec<_>>();

    if examples.is_empty() {
        bail!("dataset has no usable entries ({total} read)");
    }
    info!(kept = examples.len(), total, "dataset loaded");
    Ok(examples)
}

/// Token ids per example, truncated to `max_length`. Sequences too short to
/// yield a next-token target are dropped.
pub fn tokenize_examples(
    tokenizer: &Tokenizer,
    examples: &[QaExample],
    max_length: usize,
) -> Result<Vec<Vec<u32>>> {
    let mut sequences = Vec::with_capacity(examples.len());
    let mut truncated = 0usize;

    for example in examples {
        let encoding = tokenizer
            .encode(example.text(), true)
            .map_err(|e| anyhow!("tokenization failed: {e}"))?;
        let mut ids = encoding.get_ids().to_vec();
        if ids.len() > max_length {
            ids.truncate(max_length);
            truncated += 1;
        }
        if ids.len() >= 2 {
            sequences.push(ids);
        }
    }

    if truncated > 0 {
        info!(truncated, max_length, "examples truncated");
    }
    if sequences.is_empty() {
        bail!("no example produced at least two tokens");
    }
    Ok(sequences)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::tiny_tokenizer;

    #[test]
    fn skips_blank_entries() {
        let raw = br#"[
            {"question": "What is H2O?", "answer": "Water."},
            {"question": "", "answer": "orphan"},
            {"question": "No answer", "answer": "   "},
            {"answer": "missing question"}
        ]"#;
        let examples = parse_examples(raw).unwrap();
        assert_eq!(examples.len(), 1);
        assert_eq!(examples[0].text(), "Question: What is H2O?\nAnswer: Water.");
    }

    #[test]
    fn all_blank_is_an_error() {
        assert!(parse_examples(br#"[{"question": "", "answer": ""}]"#).is_err());
        assert!(parse_examples(b"[]").is_err());
        assert!(parse_examples(b"{\"question\": \"q\"}").is_err());
    }

    #[test]
    fn tokenizes_and_truncates() {
        let tokenizer =
            tiny_tokenizer(&["Question", ":", "Answer", "what", "is", "water", "H2O", "."]);
        let examples = vec![QaExample {
            question: "what is water".into(),
            answer: "H2O .".into(),
        }];

        let full = tokenize_examples(&tokenizer, &examples, 512).unwrap();
        // Question : what is water Answer : H2O .
        assert_eq!(full[0].len(), 9);

        let cut = tokenize_examples(&tokenizer, &examples, 4).unwrap();
        assert_eq!(cut[0], full[0][..4].to_vec());
    }

    #[test]
    fn single_token_sequences_are_dropped() {
        let tokenizer = tiny_tokenizer(&["Question"]);
        let examples = vec![QaExample {
            question: "x".into(),
            answer: "y".into(),
        }];
        assert!(tokenize_examples(&tokenizer, &examples, 1).is_err());
    }
}
