use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::progress::MonitorMap;
use super::{
    Agent, AgentError, AgentState, Capability, ProgressMonitor, ProgressReporter, ResourceUsage,
    ResultStatus, Task, TaskId, TaskOutput, TaskResult,
};
use crate::config::AgentConfiguration;

/// What a handler hands back; the base agent turns it into a [`TaskResult`].
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerOutcome {
    pub output: TaskOutput,
    pub status: ResultStatus,
    pub usage: Option<ResourceUsage>,
}

impl HandlerOutcome {
    pub fn completed(output: TaskOutput) -> Self {
        Self {
            output,
            status: ResultStatus::Completed,
            usage: None,
        }
    }

    /// Degraded answer, e.g. from a local fallback.
    pub fn partial(output: TaskOutput) -> Self {
        Self {
            output,
            status: ResultStatus::PartiallyCompleted,
            usage: None,
        }
    }

    pub fn with_usage(mut self, usage: ResourceUsage) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// The work-specific half of an agent.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    fn preprocess(&self, task: &Task) -> Result<Task, AgentError> {
        Ok(task.clone())
    }

    async fn handle(
        &self,
        task: &Task,
        progress: &ProgressReporter,
        config: &AgentConfiguration,
    ) -> Result<HandlerOutcome, AgentError>;

    fn postprocess(&self, outcome: HandlerOutcome) -> HandlerOutcome {
        outcome
    }

    /// Drop any cached responses. Called on shutdown.
    fn clear_cache(&self) {}
}

struct Lifecycle {
    state: AgentState,
    active: usize,
}

/// Agent shell shared by every concrete agent: capability gate, lifecycle
/// state, per-task progress monitors, rate limiting and the timeout race.
pub struct BaseAgent<H: TaskHandler> {
    name: String,
    version: String,
    capabilities: HashSet<Capability>,
    lifecycle: Mutex<Lifecycle>,
    config: RwLock<AgentConfiguration>,
    monitors: MonitorMap,
    next_start: Mutex<Option<tokio::time::Instant>>,
    handler: H,
}

/// Removes the task's monitor and releases the busy state when the task
/// finishes, including when the future is dropped mid-flight.
struct ActiveTask<'a, H: TaskHandler> {
    agent: &'a BaseAgent<H>,
    task_id: TaskId,
}

impl<H: TaskHandler> Drop for ActiveTask<'_, H> {
    fn drop(&mut self) {
        self.agent.monitors.lock().remove(&self.task_id);
        let mut lifecycle = self.agent.lifecycle.lock();
        lifecycle.active = lifecycle.active.saturating_sub(1);
        if lifecycle.active == 0 && matches!(lifecycle.state, AgentState::Busy(_)) {
            lifecycle.state = AgentState::Idle;
        }
    }
}

impl<H: TaskHandler> BaseAgent<H> {
    pub fn new(name: impl Into<String>, capabilities: impl IntoIterator<Item = Capability>, handler: H) -> Self {
        Self {
            name: name.into(),
            version: "1.0.0".to_string(),
            capabilities: capabilities.into_iter().collect(),
            lifecycle: Mutex::new(Lifecycle {
                state: AgentState::Idle,
                active: 0,
            }),
            config: RwLock::new(AgentConfiguration::default()),
            monitors: Arc::new(Mutex::new(HashMap::new())),
            next_start: Mutex::new(None),
            handler,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_config(self, config: AgentConfiguration) -> Self {
        *self.config.write() = config;
        self
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn config(&self) -> AgentConfiguration {
        self.config.read().clone()
    }

    pub fn monitor_count(&self) -> usize {
        self.monitors.lock().len()
    }

    pub fn progress(&self, task_id: TaskId) -> Option<ProgressMonitor> {
        self.monitors.lock().get(&task_id).cloned()
    }

    fn ensure_accepting(&self) -> Result<(), AgentError> {
        match &self.lifecycle.lock().state {
            AgentState::ShuttingDown | AgentState::Terminated => {
                Err(AgentError::NotAccepting(self.name.clone()))
            }
            _ => Ok(()),
        }
    }

    fn begin(&self, task: &Task) -> ActiveTask<'_, H> {
        self.monitors
            .lock()
            .insert(task.id(), ProgressMonitor::new(task.priority().expected_duration()));
        let mut lifecycle = self.lifecycle.lock();
        lifecycle.active += 1;
        lifecycle.state = AgentState::Busy(task.id());
        ActiveTask {
            agent: self,
            task_id: task.id(),
        }
    }

    /// Reserve the next start slot, then wait for it outside the lock.
    async fn wait_for_rate_limit(&self, config: &AgentConfiguration) {
        let Some(interval) = config.min_interval() else {
            return;
        };
        let slot = {
            let mut next = self.next_start.lock();
            let now = tokio::time::Instant::now();
            let slot = next.map_or(now, |n| n.max(now));
            *next = Some(slot + interval);
            slot
        };
        if slot > tokio::time::Instant::now() {
            debug!(agent = %self.name, "Rate limited, waiting {:?}", slot - tokio::time::Instant::now());
            tokio::time::sleep_until(slot).await;
        }
    }
}

#[async_trait]
impl<H: TaskHandler> Agent for BaseAgent<H> {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn capabilities(&self) -> &HashSet<Capability> {
        &self.capabilities
    }

    async fn process_task(&self, task: &Task) -> Result<TaskResult, AgentError> {
        if let Some(missing) = task
            .required_capabilities()
            .iter()
            .find(|c| !self.capabilities.contains(*c))
        {
            return Err(AgentError::CapabilityNotSupported(missing.clone()));
        }
        self.ensure_accepting()?;

        let started = Instant::now();
        let config = self.config();
        let budget = task.remaining().min(config.timeout());
        if budget.is_zero() {
            return Ok(TaskResult::timed_out(task.id(), task.timeout()).with_agent(&self.name));
        }

        let prepared = match self.handler.preprocess(task) {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!(agent = %self.name, task_id = %task.id(), "Preprocessing failed: {}", e);
                return Ok(TaskResult::failure(task.id(), e).with_agent(&self.name));
            }
        };

        let _active = self.begin(task);
        let reporter = ProgressReporter::new(task.id(), self.monitors.clone());
        debug!(agent = %self.name, task_id = %task.id(), "Processing task");

        let work = async {
            self.wait_for_rate_limit(&config).await;
            self.handler.handle(&prepared, &reporter, &config).await
        };

        let result = match tokio::time::timeout(budget, work).await {
            Ok(Ok(outcome)) => {
                let outcome = self.handler.postprocess(outcome);
                let result = match outcome.status {
                    ResultStatus::PartiallyCompleted => TaskResult::partially_completed(task.id(), outcome.output),
                    _ => TaskResult::completed(task.id(), outcome.output),
                };
                match outcome.usage {
                    Some(usage) => result.with_usage(usage),
                    None => result,
                }
            }
            Ok(Err(AgentError::Cancelled)) => TaskResult::cancelled(task.id()),
            Ok(Err(e)) => {
                warn!(agent = %self.name, task_id = %task.id(), "Task failed: {}", e);
                TaskResult::failure(task.id(), e)
            }
            Err(_) => {
                warn!(agent = %self.name, task_id = %task.id(), "Task timed out after {:?}", budget);
                TaskResult::timed_out(task.id(), budget)
            }
        };

        Ok(result.with_duration(started.elapsed()).with_agent(&self.name))
    }

    fn state(&self) -> AgentState {
        self.lifecycle.lock().state.clone()
    }

    async fn initialize(&self, config: AgentConfiguration) -> Result<(), AgentError> {
        config.validate()?;
        *self.config.write() = config;
        *self.next_start.lock() = None;

        let mut lifecycle = self.lifecycle.lock();
        if !matches!(lifecycle.state, AgentState::Busy(_)) {
            lifecycle.state = AgentState::Idle;
        }
        info!(agent = %self.name, "Agent initialized");
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), AgentError> {
        self.lifecycle.lock().state = AgentState::ShuttingDown;
        self.monitors.lock().clear();
        self.handler.clear_cache();
        self.lifecycle.lock().state = AgentState::Terminated;
        info!(agent = %self.name, "Agent shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct EchoHandler {
        calls: AtomicUsize,
        delay: Duration,
    }

    impl EchoHandler {
        fn new(delay: Duration) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay,
            }
        }
    }

    #[async_trait]
    impl TaskHandler for EchoHandler {
        async fn handle(
            &self,
            task: &Task,
            progress: &ProgressReporter,
            _config: &AgentConfiguration,
        ) -> Result<HandlerOutcome, AgentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            progress.report("echoing", 0.5);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if task.query() == "fail" {
                return Err(AgentError::Execution("asked to fail".to_string()));
            }
            Ok(HandlerOutcome::completed(TaskOutput::Text(task.query().to_uppercase())))
        }
    }

    fn echo_agent(delay: Duration) -> BaseAgent<EchoHandler> {
        BaseAgent::new("echo", [Capability::TextAnalysis], EchoHandler::new(delay))
    }

    #[tokio::test]
    async fn test_capability_mismatch_fails_before_work() {
        let agent = echo_agent(Duration::ZERO);
        let task = Task::new("review", "q").with_capability(Capability::CodeReview);

        let err = agent.process_task(&task).await.unwrap_err();
        assert!(matches!(err, AgentError::CapabilityNotSupported(Capability::CodeReview)));
        assert_eq!(agent.handler().calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_new_agent_is_ready_without_initialize() {
        let agent = echo_agent(Duration::ZERO);
        assert_eq!(agent.state(), AgentState::Idle);

        let task = Task::new("analyze", "hi").with_capability(Capability::TextAnalysis);
        let result = agent.process_task(&task).await.unwrap();
        assert_eq!(result.status(), ResultStatus::Completed);
    }

    #[tokio::test]
    async fn test_success_carries_task_id_and_agent() {
        let agent = echo_agent(Duration::ZERO);
        let task = Task::new("analyze", "hello").with_capability(Capability::TextAnalysis);

        let result = agent.process_task(&task).await.unwrap();
        assert_eq!(result.task_id(), task.id());
        assert_eq!(result.status(), ResultStatus::Completed);
        assert_eq!(result.output().as_text(), Some("HELLO"));
        assert_eq!(result.agent_name(), Some("echo"));
        assert!(result.execution_duration().is_some());
        assert_eq!(agent.state(), AgentState::Idle);
        assert_eq!(agent.monitor_count(), 0);
    }

    #[tokio::test]
    async fn test_handler_error_becomes_failed_result() {
        let agent = echo_agent(Duration::ZERO);
        let task = Task::new("analyze", "fail");

        let result = agent.process_task(&task).await.unwrap();
        assert_eq!(result.status(), ResultStatus::Failed);
        assert!(result.error().unwrap().contains("asked to fail"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_handler_times_out() {
        let agent = echo_agent(Duration::from_secs(10));
        let task = Task::new("analyze", "slow").with_timeout(Duration::from_secs(2));

        let result = agent.process_task(&task).await.unwrap();
        assert_eq!(result.status(), ResultStatus::TimedOut);
        assert!(result.error().is_some());
        assert_eq!(agent.monitor_count(), 0);
        assert_eq!(agent.state(), AgentState::Idle);
    }

    #[tokio::test]
    async fn test_expired_task_is_not_run() {
        let agent = echo_agent(Duration::ZERO);
        let task = Task::new("analyze", "late")
            .with_timeout(Duration::from_secs(1))
            .created_at_time(chrono::Utc::now() - chrono::Duration::seconds(5));

        let result = agent.process_task(&task).await.unwrap();
        assert_eq!(result.status(), ResultStatus::TimedOut);
        assert_eq!(agent.handler().calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_state_and_progress_while_running() {
        let agent = Arc::new(echo_agent(Duration::from_secs(5)));
        let task = Task::new("analyze", "hello");
        let task_id = task.id();

        let runner = {
            let agent = agent.clone();
            tokio::spawn(async move { agent.process_task(&task).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(agent.state(), AgentState::Busy(task_id));
        let monitor = agent.progress(task_id).unwrap();
        assert_eq!(monitor.progress(), 0.5);
        assert_eq!(monitor.status, "echoing");

        runner.await.unwrap().unwrap();
        assert_eq!(agent.state(), AgentState::Idle);
        assert!(agent.progress(task_id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_spaces_task_starts() {
        let agent = echo_agent(Duration::ZERO);
        let config = AgentConfiguration {
            rate_limit: Some(60),
            ..AgentConfiguration::default()
        };
        agent.initialize(config).await.unwrap();

        let start = tokio::time::Instant::now();
        for _ in 0..3 {
            agent.process_task(&Task::new("analyze", "x")).await.unwrap();
        }
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_initialize_rejects_invalid_config() {
        let agent = echo_agent(Duration::ZERO);
        let config = AgentConfiguration {
            temperature: 3.5,
            ..AgentConfiguration::default()
        };
        assert!(matches!(
            agent.initialize(config).await,
            Err(AgentError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent_and_stops_work() {
        let agent = echo_agent(Duration::ZERO);
        agent.shutdown().await.unwrap();
        agent.shutdown().await.unwrap();
        assert_eq!(agent.state(), AgentState::Terminated);

        let err = agent.process_task(&Task::new("analyze", "x")).await.unwrap_err();
        assert!(matches!(err, AgentError::NotAccepting(_)));

        agent.initialize(AgentConfiguration::default()).await.unwrap();
        assert_eq!(agent.state(), AgentState::Idle);
    }
}
