use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Closed set of values that can live in task or global context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ContextValue {
    Text(String),
    Number(f64),
    Bool(bool),
    /// Session-local binary payload, never exported.
    Bytes(Vec<u8>),
    List(Vec<ContextValue>),
    Map(BTreeMap<String, ContextValue>),
}

impl ContextValue {
    pub fn kind(&self) -> &'static str {
        match self {
            ContextValue::Text(_) => "text",
            ContextValue::Number(_) => "number",
            ContextValue::Bool(_) => "bool",
            ContextValue::Bytes(_) => "bytes",
            ContextValue::List(_) => "list",
            ContextValue::Map(_) => "map",
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContextValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            ContextValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ContextValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Projection used by export: drops bytes and non-finite numbers,
    /// recursively. Returns `None` when nothing exportable remains at the
    /// top level.
    pub fn exportable(&self) -> Option<ContextValue> {
        self.project(false)
    }

    /// Like [`Self::exportable`] but keeps bytes. JSON has no encoding for
    /// NaN or infinities, so those numbers never leave the process.
    pub fn serializable(&self) -> Option<ContextValue> {
        self.project(true)
    }

    fn project(&self, keep_bytes: bool) -> Option<ContextValue> {
        match self {
            ContextValue::Bytes(_) if !keep_bytes => None,
            ContextValue::Number(n) if !n.is_finite() => None,
            ContextValue::List(items) => Some(ContextValue::List(
                items.iter().filter_map(|v| v.project(keep_bytes)).collect(),
            )),
            ContextValue::Map(entries) => Some(ContextValue::Map(
                entries
                    .iter()
                    .filter_map(|(k, v)| v.project(keep_bytes).map(|v| (k.clone(), v)))
                    .collect(),
            )),
            other => Some(other.clone()),
        }
    }
}

impl fmt::Display for ContextValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextValue::Text(s) => f.write_str(s),
            ContextValue::Number(n) => write!(f, "{}", n),
            ContextValue::Bool(b) => write!(f, "{}", b),
            ContextValue::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            ContextValue::List(items) => {
                let parts: Vec<String> = items.iter().map(|v| v.to_string()).collect();
                write!(f, "[{}]", parts.join(", "))
            }
            ContextValue::Map(entries) => {
                let parts: Vec<String> = entries.iter().map(|(k, v)| format!("{}: {}", k, v)).collect();
                write!(f, "{{{}}}", parts.join(", "))
            }
        }
    }
}

impl From<&str> for ContextValue {
    fn from(value: &str) -> Self {
        ContextValue::Text(value.to_string())
    }
}

impl From<String> for ContextValue {
    fn from(value: String) -> Self {
        ContextValue::Text(value)
    }
}

impl From<f64> for ContextValue {
    fn from(value: f64) -> Self {
        ContextValue::Number(value)
    }
}

impl From<i64> for ContextValue {
    fn from(value: i64) -> Self {
        ContextValue::Number(value as f64)
    }
}

impl From<bool> for ContextValue {
    fn from(value: bool) -> Self {
        ContextValue::Bool(value)
    }
}

impl From<Vec<u8>> for ContextValue {
    fn from(value: Vec<u8>) -> Self {
        ContextValue::Bytes(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// One entry of a conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ConversationMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exportable_drops_bytes_recursively() {
        let mut nested = BTreeMap::new();
        nested.insert("blob".to_string(), ContextValue::Bytes(vec![1, 2, 3]));
        nested.insert("name".to_string(), ContextValue::from("octocat"));
        let value = ContextValue::List(vec![
            ContextValue::Map(nested),
            ContextValue::Bytes(vec![9]),
            ContextValue::from(true),
        ]);

        let exported = value.exportable().unwrap();
        let ContextValue::List(items) = exported else {
            panic!("expected list");
        };
        assert_eq!(items.len(), 2);
        let ContextValue::Map(map) = &items[0] else {
            panic!("expected map");
        };
        assert!(!map.contains_key("blob"));
        assert_eq!(map.get("name"), Some(&ContextValue::from("octocat")));

        assert!(ContextValue::Bytes(vec![]).exportable().is_none());
    }

    #[test]
    fn test_projections_drop_non_finite_numbers() {
        assert!(ContextValue::Number(f64::NAN).exportable().is_none());
        assert!(ContextValue::Number(f64::INFINITY).serializable().is_none());

        let value = ContextValue::List(vec![
            ContextValue::Number(f64::NEG_INFINITY),
            ContextValue::Number(1.5),
            ContextValue::Bytes(vec![7]),
        ]);
        assert_eq!(
            value.serializable(),
            Some(ContextValue::List(vec![ContextValue::Number(1.5), ContextValue::Bytes(vec![7])]))
        );
        assert_eq!(value.exportable(), Some(ContextValue::List(vec![ContextValue::Number(1.5)])));
    }

    #[test]
    fn test_serde_keeps_variant() {
        let value = ContextValue::Number(3.0);
        let json = serde_json::to_string(&value).unwrap();
        let back: ContextValue = serde_json::from_str(&json).unwrap();
        assert_eq!(back, value);
        assert_eq!(back.kind(), "number");
    }
}
