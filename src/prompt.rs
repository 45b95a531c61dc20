//! Prompt template shared by training and serving.
//!
//! The model is fine-tuned on `Question: ...\nAnswer: ...` texts, so the
//! server prompts with the same prefix and cuts the decoded output at the
//! answer marker.

pub const ANSWER_MARKER: &str = "Answer:";

pub fn question_prompt(question: &str) -> String {
    format!("Question: {question}\n{ANSWER_MARKER}")
}

pub fn training_text(question: &str, answer: &str) -> String {
    format!("Question: {question}\n{ANSWER_MARKER} {answer}")
}

/// Text after the last answer marker, trimmed. Falls back to the whole
/// decoded text when the marker was truncated away.
pub fn extract_answer(decoded: &str) -> String {
    decoded
        .rsplit(ANSWER_MARKER)
        .next()
        .unwrap_or(decoded)
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_ends_with_marker() {
        assert_eq!(
            question_prompt("What is mitosis?"),
            "Question: What is mitosis?\nAnswer:"
        );
    }

    #[test]
    fn training_text_matches_prompt_prefix() {
        let text = training_text("Define osmosis", "Diffusion of water.");
        assert!(text.starts_with(&question_prompt("Define osmosis")));
        assert_eq!(text, "Question: Define osmosis\nAnswer: Diffusion of water.");
    }

    #[test]
    fn strips_prompt_prefix() {
        let decoded = "Question: What is 2+2?\nAnswer:  Four. \n";
        assert_eq!(extract_answer(decoded), "Four.");
    }

    #[test]
    fn keeps_text_after_last_marker() {
        let decoded = "Question: q\nAnswer: first\nQuestion: again\nAnswer: second";
        assert_eq!(extract_answer(decoded), "second");
    }

    #[test]
    fn no_marker_returns_trimmed_text() {
        assert_eq!(extract_answer("  just text "), "just text");
    }
}
