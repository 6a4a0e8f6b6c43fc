use regex::Regex;
use std::time::Duration;

use crate::agents::{Capability, Task};

const SUMMARY_SENTENCES: usize = 2;

lazy_static::lazy_static! {
    static ref REFERENCE_PATTERN: Regex =
        Regex::new(r"(?:[A-Za-z0-9_.-]+/[A-Za-z0-9_.-]+)?#\d+|https?://\S+").unwrap();
}

/// Degraded responder used when the text-generation backend is down.
/// Produces an extractive answer from the task itself.
#[derive(Debug, Clone, Default)]
pub struct LocalResponder {
    latency: Duration,
}

impl LocalResponder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulated processing delay before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub async fn respond(&self, task: &Task) -> String {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.compose(task)
    }

    fn compose(&self, task: &Task) -> String {
        let mut out = String::from("[offline] The language model is unavailable; this is a local summary.\n\n");

        let summary = summarize(task.query(), SUMMARY_SENTENCES);
        if !summary.is_empty() {
            out.push_str(&format!("Request: {}\n", summary));
        }

        let references = references(task.query());
        if !references.is_empty() {
            out.push_str(&format!("References: {}\n", references.join(", ")));
        }

        let caps = task.required_capabilities();
        if caps.contains(&Capability::CodeGeneration) {
            out.push_str("Code generation needs the model; please retry once it is back.\n");
        } else if caps.contains(&Capability::Conversational) {
            out.push_str("I can continue this conversation when the model is reachable again.\n");
        }

        out.push_str(&format!(
            "Words: {}, characters: {}",
            task.query().split_whitespace().count(),
            task.query().chars().count()
        ));
        out
    }
}

/// First `n` sentences of `text`, whitespace-normalized.
pub fn summarize(text: &str, n: usize) -> String {
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut sentences = Vec::new();
    let mut current = String::new();
    for ch in normalized.chars() {
        current.push(ch);
        if matches!(ch, '.' | '!' | '?') {
            sentences.push(current.trim().to_string());
            current.clear();
            if sentences.len() == n {
                return sentences.join(" ");
            }
        }
    }
    if !current.trim().is_empty() && sentences.len() < n {
        sentences.push(current.trim().to_string());
    }
    sentences.join(" ")
}

/// Issue references (`#12`, `owner/repo#12`) and URLs, in order, de-duplicated.
pub fn references(text: &str) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    for m in REFERENCE_PATTERN.find_iter(text) {
        let s = m.as_str().trim_end_matches(['.', ',', ')']).to_string();
        if !found.contains(&s) {
            found.push(s);
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summarize_takes_leading_sentences() {
        let text = "The build fails.   It started yesterday! Nobody knows why? Extra.";
        assert_eq!(summarize(text, 2), "The build fails. It started yesterday!");
        assert_eq!(summarize("no punctuation here", 2), "no punctuation here");
        assert_eq!(summarize("", 2), "");
    }

    #[test]
    fn test_references() {
        let refs = references("See #12 and octo/repo#7, also https://example.com/x. And #12 again.");
        assert_eq!(refs, vec!["#12", "octo/repo#7", "https://example.com/x"]);
    }

    #[tokio::test]
    async fn test_response_mentions_offline_mode() {
        let task = Task::new("t", "Why does CI fail on #42?").with_capability(Capability::CodeGeneration);
        let answer = LocalResponder::new().respond(&task).await;
        assert!(answer.starts_with("[offline]"));
        assert!(answer.contains("#42"));
        assert!(answer.contains("Code generation"));
    }
}
