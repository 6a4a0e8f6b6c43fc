use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// A skill an agent offers or a task needs.
///
/// Built-in tags never compare equal to `Custom(_)`, and two custom tags
/// are equal only when their names are.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    CodeGeneration,
    CodeReview,
    TextAnalysis,
    Summarization,
    Conversational,
    IssueTracking,
    PullRequestReview,
    Custom(String),
}

impl Capability {
    pub fn custom(name: impl Into<String>) -> Self {
        Capability::Custom(name.into())
    }

    /// Stable label used for cache keys, logs and the command line.
    pub fn label(&self) -> String {
        match self {
            Capability::CodeGeneration => "code-generation".to_string(),
            Capability::CodeReview => "code-review".to_string(),
            Capability::TextAnalysis => "text-analysis".to_string(),
            Capability::Summarization => "summarization".to_string(),
            Capability::Conversational => "conversational".to_string(),
            Capability::IssueTracking => "issue-tracking".to_string(),
            Capability::PullRequestReview => "pull-request-review".to_string(),
            Capability::Custom(name) => format!("custom:{}", name),
        }
    }

    /// Inverse of [`Capability::label`]. Unknown names become custom tags.
    pub fn parse(label: &str) -> Self {
        match label.trim() {
            "code-generation" => Capability::CodeGeneration,
            "code-review" => Capability::CodeReview,
            "text-analysis" => Capability::TextAnalysis,
            "summarization" => Capability::Summarization,
            "conversational" => Capability::Conversational,
            "issue-tracking" => Capability::IssueTracking,
            "pull-request-review" => Capability::PullRequestReview,
            other => Capability::Custom(other.strip_prefix("custom:").unwrap_or(other).to_string()),
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// True iff every required capability is available.
pub fn has_required_capabilities<'a, A, R>(available: A, required: R) -> bool
where
    A: IntoIterator<Item = &'a Capability>,
    R: IntoIterator<Item = &'a Capability>,
{
    let available: HashSet<&Capability> = available.into_iter().collect();
    required.into_iter().all(|c| available.contains(c))
}

/// `required - available`, duplicates collapsed.
pub fn missing_capabilities<'a, A, R>(available: A, required: R) -> HashSet<Capability>
where
    A: IntoIterator<Item = &'a Capability>,
    R: IntoIterator<Item = &'a Capability>,
{
    let available: HashSet<&Capability> = available.into_iter().collect();
    required
        .into_iter()
        .filter(|c| !available.contains(c))
        .cloned()
        .collect()
}

/// Sorted, de-duplicated labels. Used wherever capability sets need a
/// canonical ordering.
pub fn sorted_labels<'a>(caps: impl IntoIterator<Item = &'a Capability>) -> Vec<String> {
    let mut labels: Vec<String> = caps.into_iter().map(Capability::label).collect();
    labels.sort();
    labels.dedup();
    labels
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_custom_equality() {
        assert_eq!(Capability::custom("x"), Capability::custom("x"));
        assert_ne!(Capability::custom("x"), Capability::custom("y"));
        assert_ne!(Capability::custom("text-analysis"), Capability::TextAnalysis);

        let set: HashSet<Capability> = [
            Capability::custom("x"),
            Capability::custom("x"),
            Capability::custom("y"),
            Capability::TextAnalysis,
        ]
        .into_iter()
        .collect();
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_subset_matching() {
        let available = vec![Capability::TextAnalysis, Capability::Conversational];

        assert!(has_required_capabilities(&available, &Vec::<Capability>::new()));
        assert!(has_required_capabilities(
            &available,
            &[Capability::TextAnalysis, Capability::TextAnalysis]
        ));
        assert!(!has_required_capabilities(
            &available,
            &[Capability::TextAnalysis, Capability::CodeGeneration]
        ));
    }

    #[test]
    fn test_missing_capabilities() {
        let available = vec![Capability::TextAnalysis];
        let required = vec![
            Capability::CodeGeneration,
            Capability::TextAnalysis,
            Capability::CodeGeneration,
            Capability::custom("lint"),
        ];

        let missing = missing_capabilities(&available, &required);
        assert_eq!(missing.len(), 2);
        assert!(missing.contains(&Capability::CodeGeneration));
        assert!(missing.contains(&Capability::custom("lint")));
    }

    #[test]
    fn test_label_round_trip() {
        for cap in [
            Capability::CodeGeneration,
            Capability::PullRequestReview,
            Capability::custom("triage"),
        ] {
            assert_eq!(Capability::parse(&cap.label()), cap);
        }
        assert_eq!(Capability::parse("triage"), Capability::custom("triage"));
    }
}
