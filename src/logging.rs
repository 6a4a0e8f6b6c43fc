use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// Fire-and-forget process log.
pub trait LogSink: Send + Sync {
    fn log(&self, message: &str, level: LogLevel);
}

/// Forwards to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, message: &str, level: LogLevel) {
        match level {
            LogLevel::Debug => tracing::debug!(target: "collab", "{}", message),
            LogLevel::Info => tracing::info!(target: "collab", "{}", message),
            LogLevel::Warning => tracing::warn!(target: "collab", "{}", message),
            LogLevel::Error => tracing::error!(target: "collab", "{}", message),
        }
    }
}

/// Keeps every line in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    lines: Mutex<Vec<(LogLevel, String)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<(LogLevel, String)> {
        self.lines.lock().clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines.lock().iter().any(|(_, l)| l.contains(needle))
    }
}

impl LogSink for MemorySink {
    fn log(&self, message: &str, level: LogLevel) {
        self.lines.lock().push((level, message.to_string()));
    }
}

/// Install the global subscriber. `RUST_LOG` overrides the `info` default.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_records_levels() {
        let sink = MemorySink::new();
        sink.log("dispatching", LogLevel::Info);
        sink.log("no agent", LogLevel::Warning);

        assert_eq!(sink.lines().len(), 2);
        assert_eq!(sink.lines()[1].0, LogLevel::Warning);
        assert!(sink.contains("no agent"));
        TracingSink.log("forwarded", LogLevel::Debug);
    }
}
