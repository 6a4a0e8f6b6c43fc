use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

use super::capability::{missing_capabilities, sorted_labels};
use super::{Agent, AgentError, AgentExchangeId, AgentRef, Capability, Task, TaskResult};
use crate::context::ContextStore;
use crate::logging::{LogLevel, LogSink, TracingSink};

/// Credentials for the external services agents talk to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub github_token: Option<String>,
    #[serde(default)]
    pub ollama_url: Option<String>,
}

/// Checks a credential set against the service it belongs to.
#[async_trait]
pub trait CredentialValidator: Send + Sync {
    async fn validate(&self, credentials: &Credentials) -> Result<(), String>;
}

/// Matches tasks to registered agents and records every attempt in the
/// shared context store.
///
/// Matching is first-match in registration order: the first agent whose
/// capabilities cover the task's required set wins.
pub struct Orchestrator {
    agents: RwLock<Vec<(AgentExchangeId, AgentRef)>>,
    context: ContextStore,
    sink: Arc<dyn LogSink>,
    validator: Option<Arc<dyn CredentialValidator>>,
    credentials: RwLock<Option<Credentials>>,
}

impl Orchestrator {
    pub fn new(context: ContextStore) -> Self {
        Self {
            agents: RwLock::new(Vec::new()),
            context,
            sink: Arc::new(TracingSink),
            validator: None,
            credentials: RwLock::new(None),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn CredentialValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn context(&self) -> &ContextStore {
        &self.context
    }

    /// Registering the same agent twice yields two independent entries.
    pub fn register(&self, agent: AgentRef) -> AgentExchangeId {
        let id = AgentExchangeId::new();
        info!(agent = agent.name(), %id, "Registered agent");
        self.agents.write().push((id, agent));
        id
    }

    pub fn unregister(&self, id: AgentExchangeId) -> Result<AgentRef, AgentError> {
        let mut agents = self.agents.write();
        let index = agents
            .iter()
            .position(|(existing, _)| *existing == id)
            .ok_or(AgentError::InvalidAgentId(id))?;
        Ok(agents.remove(index).1)
    }

    pub fn agent(&self, id: AgentExchangeId) -> Option<AgentRef> {
        self.agents
            .read()
            .iter()
            .find(|(existing, _)| *existing == id)
            .map(|(_, agent)| agent.clone())
    }

    /// Registration order.
    pub fn agent_ids(&self) -> Vec<AgentExchangeId> {
        self.agents.read().iter().map(|(id, _)| *id).collect()
    }

    pub fn available_capabilities(&self) -> HashSet<Capability> {
        self.agents
            .read()
            .iter()
            .flat_map(|(_, agent)| agent.capabilities().iter().cloned())
            .collect()
    }

    /// Validate and store a credential set. The stored set only changes on
    /// success.
    pub async fn connect(&self, credentials: Credentials) -> Result<(), AgentError> {
        if let Some(validator) = &self.validator {
            if let Err(reason) = validator.validate(&credentials).await {
                self.sink.log(&format!("Credential validation failed: {}", reason), LogLevel::Error);
                return Err(AgentError::Connection(reason));
            }
        }
        *self.credentials.write() = Some(credentials);
        self.sink.log("Connected", LogLevel::Info);
        Ok(())
    }

    pub fn credentials(&self) -> Option<Credentials> {
        self.credentials.read().clone()
    }

    fn find_agent(&self, task: &Task) -> Option<(AgentExchangeId, AgentRef)> {
        self.agents
            .read()
            .iter()
            .find(|(_, agent)| agent.can_execute(task))
            .map(|(id, agent)| (*id, agent.clone()))
    }

    /// Capabilities no registered agent offers, or the whole required set
    /// when each is offered somewhere but never all by one agent.
    fn missing_for(&self, task: &Task) -> Vec<Capability> {
        let available = self.available_capabilities();
        let mut missing: Vec<Capability> = missing_capabilities(&available, task.required_capabilities())
            .into_iter()
            .collect();
        if missing.is_empty() {
            missing = task.required_capabilities().iter().cloned().collect();
        }
        missing.sort_by_key(Capability::label);
        missing
    }

    /// Run a task on the first capable agent.
    ///
    /// Always yields exactly one result, and records the task before
    /// dispatch and the result before returning.
    pub async fn execute(&self, task: Task) -> TaskResult {
        self.context.record_task(task.clone()).await;

        let result = match self.find_agent(&task) {
            Some((id, agent)) => self.dispatch(id, agent, &task).await,
            None => {
                let missing = self.missing_for(&task);
                self.sink.log(
                    &format!(
                        "No agent for {} (missing: {})",
                        task.id(),
                        sorted_labels(&missing).join(", ")
                    ),
                    LogLevel::Warning,
                );
                TaskResult::failure(task.id(), AgentError::NoSuitableAgent { missing })
            }
        };

        self.context.record_result(result.clone()).await;
        result
    }

    async fn dispatch(&self, id: AgentExchangeId, agent: AgentRef, task: &Task) -> TaskResult {
        self.sink.log(
            &format!("Dispatching {} to {} ({})", task.id(), agent.name(), id),
            LogLevel::Info,
        );

        match tokio::time::timeout(task.remaining(), agent.process_task(task)).await {
            Ok(Ok(result)) if result.task_id() == task.id() => result,
            Ok(Ok(result)) => {
                warn!(agent = agent.name(), expected = %task.id(), got = %result.task_id(), "Agent answered for another task");
                TaskResult::failure(
                    task.id(),
                    AgentError::Execution(format!("{} returned a result for {}", agent.name(), result.task_id())),
                )
                .with_agent(agent.name())
            }
            Ok(Err(e)) => {
                self.sink.log(&format!("{} failed {}: {}", agent.name(), task.id(), e), LogLevel::Error);
                TaskResult::failure(task.id(), e).with_agent(agent.name())
            }
            Err(_) => {
                self.sink.log(
                    &format!("{} timed out after {:?}", task.id(), task.timeout()),
                    LogLevel::Warning,
                );
                TaskResult::timed_out(task.id(), task.timeout()).with_agent(agent.name())
            }
        }
    }

    /// Shut down every registered agent, keeping them registered.
    pub async fn shutdown_all(&self) -> Result<(), AgentError> {
        let agents: Vec<AgentRef> = self.agents.read().iter().map(|(_, a)| a.clone()).collect();
        for agent in agents {
            agent.shutdown().await?;
        }
        Ok(())
    }
}
