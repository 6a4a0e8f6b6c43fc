use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use super::{AgentError, Capability};
use crate::context::{ContextValue, ConversationMessage};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
const BASE_EXPECTED_DURATION: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultId(Uuid);

impl ResultId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ResultId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ResultId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "result-{}", self.0)
    }
}

/// Advisory priority. Only scales the expected duration used by progress
/// monitors; dispatch never reorders by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl TaskPriority {
    pub fn duration_factor(&self) -> f64 {
        match self {
            TaskPriority::Low => 2.0,
            TaskPriority::Normal => 1.0,
            TaskPriority::High => 0.75,
            TaskPriority::Critical => 0.5,
        }
    }

    pub fn expected_duration(&self) -> Duration {
        BASE_EXPECTED_DURATION.mul_f64(self.duration_factor())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Completed,
    PartiallyCompleted,
    Failed,
    TimedOut,
    Cancelled,
}

impl ResultStatus {
    pub fn carries_error(&self) -> bool {
        matches!(self, ResultStatus::Failed | ResultStatus::TimedOut)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ResultStatus::Completed | ResultStatus::PartiallyCompleted)
    }
}

/// Task lifecycle. Transitions only move forward; `Completed` and `Failed`
/// are terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum TaskState {
    Created,
    Queued,
    Executing,
    Completed(ResultStatus),
    Failed(String),
}

impl TaskState {
    fn rank(&self) -> u8 {
        match self {
            TaskState::Created => 0,
            TaskState::Queued => 1,
            TaskState::Executing => 2,
            TaskState::Completed(_) | TaskState::Failed(_) => 3,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 3
    }

    pub fn can_transition_to(&self, next: &TaskState) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }

    pub fn name(&self) -> &'static str {
        match self {
            TaskState::Created => "created",
            TaskState::Queued => "queued",
            TaskState::Executing => "executing",
            TaskState::Completed(_) => "completed",
            TaskState::Failed(_) => "failed",
        }
    }
}

/// A unit of work. Mutated only through [`Task::update_state`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    id: TaskId,
    description: String,
    query: String,
    context: HashMap<String, ContextValue>,
    required_capabilities: HashSet<Capability>,
    priority: TaskPriority,
    timeout: Duration,
    state: TaskState,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(description: impl Into<String>, query: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            description: description.into(),
            query: query.into(),
            context: HashMap::new(),
            required_capabilities: HashSet::new(),
            priority: TaskPriority::default(),
            timeout: DEFAULT_TIMEOUT,
            state: TaskState::Created,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_capabilities(mut self, caps: impl IntoIterator<Item = Capability>) -> Self {
        self.required_capabilities.extend(caps);
        self
    }

    pub fn with_capability(mut self, cap: Capability) -> Self {
        self.required_capabilities.insert(cap);
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Copy whose context holds only values JSON can carry.
    pub fn serializable(&self) -> Task {
        let mut task = self.clone();
        task.context = self
            .context
            .iter()
            .filter_map(|(k, v)| v.serializable().map(|v| (k.clone(), v)))
            .collect();
        task
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<ContextValue>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Overrides the creation time. Used when rebuilding tasks from a
    /// snapshot and in tests that need a controlled clock.
    pub fn created_at_time(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self.updated_at = at;
        self
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn context(&self) -> &HashMap<String, ContextValue> {
        &self.context
    }

    pub fn context_text(&self, key: &str) -> Option<&str> {
        self.context.get(key).and_then(ContextValue::as_text)
    }

    pub fn required_capabilities(&self) -> &HashSet<Capability> {
        &self.required_capabilities
    }

    pub fn priority(&self) -> TaskPriority {
        self.priority
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn state(&self) -> &TaskState {
        &self.state
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Moves the task forward. Any backward move, re-entry or exit from a
    /// terminal state is rejected.
    pub fn update_state(&mut self, next: TaskState) -> Result<(), AgentError> {
        if !self.state.can_transition_to(&next) {
            return Err(AgentError::InvalidTransition {
                task_id: self.id,
                from: self.state.name(),
                to: next.name(),
            });
        }
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn has_timed_out_at(&self, now: DateTime<Utc>) -> bool {
        self.age_at(now) > self.timeout
    }

    /// `now - created_at > timeout`, regardless of state.
    pub fn has_timed_out(&self) -> bool {
        self.has_timed_out_at(Utc::now())
    }

    /// Time left before the task expires, zero once it has.
    pub fn remaining(&self) -> Duration {
        self.timeout.saturating_sub(self.age_at(Utc::now()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_bytes: Option<u64>,
}

impl ResourceUsage {
    pub fn tokens(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
            cpu_time_ms: None,
            memory_bytes: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum TaskOutput {
    #[default]
    Empty,
    Text(String),
    Structured(serde_json::Value),
    Conversation(Vec<ConversationMessage>),
}

impl TaskOutput {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            TaskOutput::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// Outcome of one execution attempt. Built once and never mutated after it
/// leaves the agent or dispatcher that created it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    result_id: ResultId,
    task_id: TaskId,
    status: ResultStatus,
    output: TaskOutput,
    error: Option<String>,
    completed_at: DateTime<Utc>,
    execution_duration: Option<Duration>,
    resource_usage: Option<ResourceUsage>,
    agent_name: Option<String>,
}

impl TaskResult {
    fn build(task_id: TaskId, status: ResultStatus, output: TaskOutput, error: Option<String>) -> Self {
        Self {
            result_id: ResultId::new(),
            task_id,
            status,
            output,
            error,
            completed_at: Utc::now(),
            execution_duration: None,
            resource_usage: None,
            agent_name: None,
        }
    }

    pub fn completed(task_id: TaskId, output: TaskOutput) -> Self {
        Self::build(task_id, ResultStatus::Completed, output, None)
    }

    pub fn partially_completed(task_id: TaskId, output: TaskOutput) -> Self {
        Self::build(task_id, ResultStatus::PartiallyCompleted, output, None)
    }

    pub fn failure(task_id: TaskId, error: impl fmt::Display) -> Self {
        Self::build(task_id, ResultStatus::Failed, TaskOutput::Empty, Some(error.to_string()))
    }

    pub fn timed_out(task_id: TaskId, after: Duration) -> Self {
        Self::build(
            task_id,
            ResultStatus::TimedOut,
            TaskOutput::Empty,
            Some(AgentError::Timeout(after).to_string()),
        )
    }

    pub fn cancelled(task_id: TaskId) -> Self {
        Self::build(task_id, ResultStatus::Cancelled, TaskOutput::Empty, None)
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.execution_duration = Some(duration);
        self
    }

    pub fn with_usage(mut self, usage: ResourceUsage) -> Self {
        self.resource_usage = Some(usage);
        self
    }

    pub fn with_agent(mut self, name: impl Into<String>) -> Self {
        self.agent_name = Some(name.into());
        self
    }

    pub fn completed_at_time(mut self, at: DateTime<Utc>) -> Self {
        self.completed_at = at;
        self
    }

    pub fn result_id(&self) -> ResultId {
        self.result_id
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn status(&self) -> ResultStatus {
        self.status
    }

    pub fn output(&self) -> &TaskOutput {
        &self.output
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn completed_at(&self) -> DateTime<Utc> {
        self.completed_at
    }

    pub fn execution_duration(&self) -> Option<Duration> {
        self.execution_duration
    }

    pub fn resource_usage(&self) -> Option<&ResourceUsage> {
        self.resource_usage.as_ref()
    }

    pub fn agent_name(&self) -> Option<&str> {
        self.agent_name.as_deref()
    }

    /// The task state this result moves its task into.
    pub fn terminal_state(&self) -> TaskState {
        match self.status {
            ResultStatus::Failed | ResultStatus::TimedOut => {
                TaskState::Failed(self.error.clone().unwrap_or_else(|| "failed".to_string()))
            }
            status => TaskState::Completed(status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn test_forward_transitions() {
        let mut task = Task::new("analyze", "what broke?");
        let created = task.updated_at();

        task.update_state(TaskState::Queued).unwrap();
        task.update_state(TaskState::Executing).unwrap();
        assert!(task.updated_at() >= created);
        task.update_state(TaskState::Completed(ResultStatus::Completed)).unwrap();
        assert!(task.state().is_terminal());
    }

    #[test]
    fn test_terminal_state_rejects_transitions() {
        let mut task = Task::new("analyze", "q");
        task.update_state(TaskState::Failed("boom".into())).unwrap();

        let err = task.update_state(TaskState::Executing).unwrap_err();
        assert!(matches!(err, AgentError::InvalidTransition { from: "failed", .. }));
        assert!(task
            .update_state(TaskState::Completed(ResultStatus::Completed))
            .is_err());
    }

    #[test]
    fn test_no_reentry_or_backward_move() {
        let mut task = Task::new("analyze", "q");
        task.update_state(TaskState::Executing).unwrap();

        assert!(task.update_state(TaskState::Executing).is_err());
        assert!(task.update_state(TaskState::Queued).is_err());
        assert_eq!(task.state(), &TaskState::Executing);
    }

    #[test]
    fn test_timeout_is_independent_of_state() {
        let start = Utc::now() - ChronoDuration::seconds(10);
        let mut task = Task::new("slow", "q")
            .with_timeout(Duration::from_secs(5))
            .created_at_time(start);
        task.update_state(TaskState::Executing).unwrap();

        assert!(task.has_timed_out());
        assert_eq!(task.remaining(), Duration::ZERO);
        assert!(!task.has_timed_out_at(start + ChronoDuration::seconds(5)));
        assert!(task.has_timed_out_at(start + ChronoDuration::seconds(6)));
    }

    #[test]
    fn test_result_error_only_for_failures() {
        let id = TaskId::new();
        assert!(TaskResult::completed(id, TaskOutput::Text("ok".into())).error().is_none());
        assert!(TaskResult::cancelled(id).error().is_none());
        assert!(TaskResult::failure(id, "nope").error().is_some());
        assert!(TaskResult::timed_out(id, Duration::from_secs(1)).error().is_some());

        let result = TaskResult::completed(id, TaskOutput::Empty);
        assert_ne!(result.result_id().to_string(), id.to_string());
        assert_eq!(result.task_id(), id);
    }

    #[test]
    fn test_priority_scales_expected_duration() {
        assert!(TaskPriority::Low < TaskPriority::Normal);
        assert!(TaskPriority::Critical > TaskPriority::High);
        assert!(TaskPriority::Critical.expected_duration() < TaskPriority::Low.expected_duration());
        assert_eq!(TaskPriority::Normal.expected_duration(), Duration::from_secs(30));
    }
}
