pub mod agents;
pub mod config;
pub mod context;
pub mod github;
pub mod logging;
pub mod providers;

pub use agents::{
    Agent, AgentError, AgentRef, AgentState, Capability, Orchestrator, Task, TaskPriority, TaskResult,
};
pub use config::CollabConfig;
pub use context::ContextStore;
