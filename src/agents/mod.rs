//! Agents, tasks and the dispatcher that matches one to the other.
//!
//! # Agent types
//! - [`LlmAgent`]: answers tasks with a text-generation backend, caching
//!   responses and degrading to a local responder when the backend is down
//! - [`GitHubAgent`]: issue and pull-request work over the `gh` CLI
//!
//! Both are [`BaseAgent`]s: the base owns capability checks, timeouts,
//! progress monitors and lifecycle state, the handler owns the work.

pub mod base;
pub mod cache;
pub mod capability;
pub mod github_agent;
pub mod llm_agent;
pub mod orchestrator;
pub mod progress;
pub mod task;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub use base::{BaseAgent, HandlerOutcome, TaskHandler};
pub use cache::{CacheKey, ResponseCache};
pub use capability::{has_required_capabilities, missing_capabilities, Capability};
pub use github_agent::{GitHubAgent, GitHubHandler, GitHubOperation};
pub use llm_agent::{LlmAgent, LlmHandler};
pub use orchestrator::{CredentialValidator, Credentials, Orchestrator};
pub use progress::{ProgressMonitor, ProgressReporter};
pub use task::{
    ResourceUsage, ResultId, ResultStatus, Task, TaskId, TaskOutput, TaskPriority, TaskResult,
    TaskState,
};

use crate::config::{AgentConfiguration, ConfigError};
use crate::github::GhError;
use crate::providers::ProviderError;

/// Registry key handed out by the dispatcher. Distinct from an agent's
/// human-readable name and version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentExchangeId(Uuid);

impl AgentExchangeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AgentExchangeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AgentExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "agent-{}", self.0)
    }
}

/// Lifecycle of an agent.
///
/// [`BaseAgent`] is ready as soon as it is built, so it moves between
/// `Idle`, `Busy`, `ShuttingDown` and `Terminated` only. `Initializing` and
/// `Paused` are for agents that need a warm-up step or can be suspended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum AgentState {
    Initializing,
    Idle,
    Busy(TaskId),
    Paused,
    ShuttingDown,
    Terminated,
    Error(String),
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Capability not supported: {0}")]
    CapabilityNotSupported(Capability),

    #[error("No suitable agent for capabilities: {}", format_capabilities(.missing))]
    NoSuitableAgent { missing: Vec<Capability> },

    #[error("Task timed out after {0:?}")]
    Timeout(Duration),

    #[error("Task was cancelled")]
    Cancelled,

    #[error("Invalid state transition for {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: &'static str,
        to: &'static str,
    },

    #[error("Invalid agent id: {0}")]
    InvalidAgentId(AgentExchangeId),

    #[error("Agent is not accepting work: {0}")]
    NotAccepting(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error(transparent)]
    Configuration(#[from] ConfigError),

    #[error("Text generation failed: {0}")]
    Provider(#[from] ProviderError),

    #[error("Issue source failed: {0}")]
    Source(#[from] GhError),

    #[error("Execution failed: {0}")]
    Execution(String),
}

fn format_capabilities(caps: &[Capability]) -> String {
    capability::sorted_labels(caps).join(", ")
}

/// Thread-safe handle to a registered agent.
pub type AgentRef = Arc<dyn Agent>;

/// A worker that executes tasks matching its declared capabilities.
///
/// # Invariants
/// - `capabilities()` never changes after construction
/// - `process_task()` yields a result or an error, never a silent no-op
/// - `state()` answers without waiting on in-flight work
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn capabilities(&self) -> &HashSet<Capability>;

    fn can_execute(&self, task: &Task) -> bool {
        has_required_capabilities(self.capabilities(), task.required_capabilities())
    }

    /// Execute a task.
    ///
    /// # Errors
    /// `CapabilityNotSupported` before any work when the task needs a
    /// capability this agent lacks.
    ///
    /// # Postconditions
    /// On `Ok`, `result.task_id() == task.id()`.
    async fn process_task(&self, task: &Task) -> Result<TaskResult, AgentError>;

    fn state(&self) -> AgentState;

    /// Replace the agent configuration. Safe to call repeatedly.
    async fn initialize(&self, config: AgentConfiguration) -> Result<(), AgentError>;

    /// Release cached state and stop accepting work. Safe to call repeatedly.
    async fn shutdown(&self) -> Result<(), AgentError>;
}
