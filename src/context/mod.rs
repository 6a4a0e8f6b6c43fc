//! Context store: bounded task/result/conversation history plus global and
//! task-scoped key-value data, shared by the dispatcher and its agents.
//!
//! # Invariants
//! - each history collection holds at most `max_history_size` entries;
//!   trimming removes the single oldest entry until back under the bound
//! - evicting a task also deletes its task-scoped values
//! - all mutation goes through [`ContextStore`]; callers never see the maps

pub mod value;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub use value::{ContextValue, ConversationMessage, MessageRole};

use crate::agents::{ResultId, Task, TaskId, TaskResult};

pub const DEFAULT_MAX_HISTORY_SIZE: usize = 100;
const EVENT_CAPACITY: usize = 256;
const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("Value already exists: {0}")]
    AlreadyExists(String),

    #[error("Value not found: {0}")]
    NotFound(String),

    #[error("Type mismatch for {key}: expected {expected}, found {found}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("Unsupported snapshot version {0}")]
    UnsupportedVersion(u32),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Change notifications published to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ContextEvent {
    TaskRecorded { task_id: TaskId },
    ResultRecorded { result_id: ResultId, task_id: TaskId },
    TaskEvicted { task_id: TaskId },
    ResultEvicted { result_id: ResultId },
    ConversationUpdated { conversation_id: String, length: usize },
    GlobalValueChanged { key: String },
    TaskValueChanged { task_id: TaskId, key: String },
    HistoryResized { max_history_size: usize },
    Imported,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextMetrics {
    pub tasks_recorded: u64,
    pub results_recorded: u64,
    pub tasks_evicted: u64,
    pub results_evicted: u64,
    pub messages_trimmed: u64,
}

/// Serializable image of a store.
///
/// Task and result history round-trip their serializable fields, minus
/// non-finite numbers in task context; global values also drop
/// session-local bytes (see [`ContextValue::exportable`]).
/// Task-scoped values are not exported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub version: u32,
    pub exported_at: DateTime<Utc>,
    pub max_history_size: usize,
    pub tasks: Vec<Task>,
    pub results: Vec<TaskResult>,
    pub conversations: HashMap<String, Vec<ConversationMessage>>,
    pub global: HashMap<String, ContextValue>,
    pub last_accessed_at: DateTime<Utc>,
    pub metrics: ContextMetrics,
}

#[derive(Debug, Clone)]
struct Entry<T> {
    value: T,
    // insertion order, breaks timestamp ties
    seq: u64,
}

struct ContextInner {
    max_history_size: usize,
    next_seq: u64,
    tasks: HashMap<TaskId, Entry<Task>>,
    results: HashMap<ResultId, Entry<TaskResult>>,
    conversations: HashMap<String, Vec<ConversationMessage>>,
    global: HashMap<String, ContextValue>,
    task_context: HashMap<TaskId, HashMap<String, ContextValue>>,
    last_accessed_at: DateTime<Utc>,
    metrics: ContextMetrics,
}

impl ContextInner {
    fn new(max_history_size: usize) -> Self {
        Self {
            max_history_size,
            next_seq: 0,
            tasks: HashMap::new(),
            results: HashMap::new(),
            conversations: HashMap::new(),
            global: HashMap::new(),
            task_context: HashMap::new(),
            last_accessed_at: Utc::now(),
            metrics: ContextMetrics::default(),
        }
    }

    fn touch(&mut self) {
        self.last_accessed_at = Utc::now();
    }

    fn seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn insert_task(&mut self, task: Task) {
        let id = task.id();
        match self.tasks.get_mut(&id) {
            Some(entry) => entry.value = task,
            None => {
                let seq = self.seq();
                self.tasks.insert(id, Entry { value: task, seq });
            }
        }
    }

    fn insert_result(&mut self, result: TaskResult) {
        let id = result.result_id();
        match self.results.get_mut(&id) {
            Some(entry) => entry.value = result,
            None => {
                let seq = self.seq();
                self.results.insert(id, Entry { value: result, seq });
            }
        }
    }

    fn trim_tasks(&mut self, events: &mut Vec<ContextEvent>) {
        while self.tasks.len() > self.max_history_size {
            let oldest = self
                .tasks
                .iter()
                .min_by_key(|(_, e)| (e.value.created_at(), e.seq))
                .map(|(id, _)| *id);
            let Some(id) = oldest else { break };
            self.tasks.remove(&id);
            self.task_context.remove(&id);
            self.metrics.tasks_evicted += 1;
            events.push(ContextEvent::TaskEvicted { task_id: id });
        }
    }

    fn trim_results(&mut self, events: &mut Vec<ContextEvent>) {
        while self.results.len() > self.max_history_size {
            let oldest = self
                .results
                .iter()
                .min_by_key(|(_, e)| (e.value.completed_at(), e.seq))
                .map(|(id, _)| *id);
            let Some(id) = oldest else { break };
            self.results.remove(&id);
            self.metrics.results_evicted += 1;
            events.push(ContextEvent::ResultEvicted { result_id: id });
        }
    }

    fn trim_conversation(&mut self, conversation_id: &str) {
        let max = self.max_history_size;
        if let Some(messages) = self.conversations.get_mut(conversation_id) {
            if messages.len() > max {
                let excess = messages.len() - max;
                messages.drain(..excess);
                self.metrics.messages_trimmed += excess as u64;
            }
        }
    }

    fn trim_all(&mut self, events: &mut Vec<ContextEvent>) {
        self.trim_tasks(events);
        self.trim_results(events);
        let ids: Vec<String> = self.conversations.keys().cloned().collect();
        for id in ids {
            self.trim_conversation(&id);
        }
    }

    fn sorted_tasks(&self) -> Vec<Task> {
        let mut entries: Vec<&Entry<Task>> = self.tasks.values().collect();
        entries.sort_by_key(|e| (e.value.created_at(), e.seq));
        entries.into_iter().map(|e| e.value.clone()).collect()
    }

    fn sorted_results(&self) -> Vec<TaskResult> {
        let mut entries: Vec<&Entry<TaskResult>> = self.results.values().collect();
        entries.sort_by_key(|e| (e.value.completed_at(), e.seq));
        entries.into_iter().map(|e| e.value.clone()).collect()
    }
}

/// Cloneable handle; clones share the same store.
#[derive(Clone)]
pub struct ContextStore {
    inner: Arc<Mutex<ContextInner>>,
    events: broadcast::Sender<ContextEvent>,
}

impl Default for ContextStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HISTORY_SIZE)
    }
}

impl ContextStore {
    pub fn new(max_history_size: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(ContextInner::new(max_history_size))),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ContextEvent> {
        self.events.subscribe()
    }

    fn publish(&self, events: Vec<ContextEvent>) {
        for event in events {
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
    }

    // ---- history -------------------------------------------------------

    pub async fn record_task(&self, task: Task) {
        let task_id = task.id();
        let mut events = vec![ContextEvent::TaskRecorded { task_id }];
        {
            let mut inner = self.inner.lock().await;
            inner.touch();
            inner.insert_task(task);
            inner.metrics.tasks_recorded += 1;
            inner.trim_tasks(&mut events);
        }
        debug!(%task_id, "Recorded task");
        self.publish(events);
    }

    pub async fn record_result(&self, result: TaskResult) {
        let (result_id, task_id) = (result.result_id(), result.task_id());
        let mut events = vec![ContextEvent::ResultRecorded { result_id, task_id }];
        {
            let mut inner = self.inner.lock().await;
            inner.touch();
            inner.insert_result(result);
            inner.metrics.results_recorded += 1;
            inner.trim_results(&mut events);
        }
        debug!(%result_id, %task_id, "Recorded result");
        self.publish(events);
    }

    pub async fn get_task(&self, task_id: TaskId) -> Option<Task> {
        let mut inner = self.inner.lock().await;
        inner.touch();
        inner.tasks.get(&task_id).map(|e| e.value.clone())
    }

    pub async fn get_result(&self, result_id: ResultId) -> Option<TaskResult> {
        let mut inner = self.inner.lock().await;
        inner.touch();
        inner.results.get(&result_id).map(|e| e.value.clone())
    }

    /// Oldest first.
    pub async fn get_all_tasks(&self) -> Vec<Task> {
        let mut inner = self.inner.lock().await;
        inner.touch();
        inner.sorted_tasks()
    }

    /// Oldest first.
    pub async fn get_all_results(&self) -> Vec<TaskResult> {
        let mut inner = self.inner.lock().await;
        inner.touch();
        inner.sorted_results()
    }

    pub async fn get_tasks<F>(&self, predicate: F) -> Vec<Task>
    where
        F: Fn(&Task) -> bool + Send,
    {
        let mut inner = self.inner.lock().await;
        inner.touch();
        inner.sorted_tasks().into_iter().filter(|t| predicate(t)).collect()
    }

    pub async fn results_for_task(&self, task_id: TaskId) -> Vec<TaskResult> {
        let mut inner = self.inner.lock().await;
        inner.touch();
        inner
            .sorted_results()
            .into_iter()
            .filter(|r| r.task_id() == task_id)
            .collect()
    }

    pub async fn max_history_size(&self) -> usize {
        self.inner.lock().await.max_history_size
    }

    /// Changes the bound and re-trims every collection to it.
    pub async fn set_max_history_size(&self, max_history_size: usize) {
        let mut events = vec![ContextEvent::HistoryResized { max_history_size }];
        {
            let mut inner = self.inner.lock().await;
            inner.touch();
            inner.max_history_size = max_history_size;
            inner.trim_all(&mut events);
        }
        self.publish(events);
    }

    // ---- conversations -------------------------------------------------

    pub async fn add_message(&self, conversation_id: &str, message: ConversationMessage) {
        let length = {
            let mut inner = self.inner.lock().await;
            inner.touch();
            inner
                .conversations
                .entry(conversation_id.to_string())
                .or_default()
                .push(message);
            inner.trim_conversation(conversation_id);
            inner.conversations.get(conversation_id).map_or(0, Vec::len)
        };
        self.publish(vec![ContextEvent::ConversationUpdated {
            conversation_id: conversation_id.to_string(),
            length,
        }]);
    }

    pub async fn conversation(&self, conversation_id: &str) -> Vec<ConversationMessage> {
        let mut inner = self.inner.lock().await;
        inner.touch();
        inner.conversations.get(conversation_id).cloned().unwrap_or_default()
    }

    pub async fn clear_conversation(&self, conversation_id: &str) -> bool {
        let removed = {
            let mut inner = self.inner.lock().await;
            inner.touch();
            inner.conversations.remove(conversation_id).is_some()
        };
        if removed {
            self.publish(vec![ContextEvent::ConversationUpdated {
                conversation_id: conversation_id.to_string(),
                length: 0,
            }]);
        }
        removed
    }

    // ---- global key-value ----------------------------------------------

    /// Insert or replace.
    pub async fn set_global_value(&self, key: &str, value: ContextValue) {
        {
            let mut inner = self.inner.lock().await;
            inner.touch();
            inner.global.insert(key.to_string(), value);
        }
        self.publish(vec![ContextEvent::GlobalValueChanged { key: key.to_string() }]);
    }

    /// Insert only; fails if the key is taken.
    pub async fn store_global_value(&self, key: &str, value: ContextValue) -> Result<(), ContextError> {
        {
            let mut inner = self.inner.lock().await;
            inner.touch();
            if inner.global.contains_key(key) {
                return Err(ContextError::AlreadyExists(key.to_string()));
            }
            inner.global.insert(key.to_string(), value);
        }
        self.publish(vec![ContextEvent::GlobalValueChanged { key: key.to_string() }]);
        Ok(())
    }

    /// Replace only; fails if the key is absent.
    pub async fn update_global_value(&self, key: &str, value: ContextValue) -> Result<ContextValue, ContextError> {
        let previous = {
            let mut inner = self.inner.lock().await;
            inner.touch();
            match inner.global.get_mut(key) {
                Some(slot) => std::mem::replace(slot, value),
                None => return Err(ContextError::NotFound(key.to_string())),
            }
        };
        self.publish(vec![ContextEvent::GlobalValueChanged { key: key.to_string() }]);
        Ok(previous)
    }

    pub async fn get_global_value(&self, key: &str) -> Option<ContextValue> {
        let mut inner = self.inner.lock().await;
        inner.touch();
        inner.global.get(key).cloned()
    }

    pub async fn remove_global_value(&self, key: &str) -> Option<ContextValue> {
        let removed = {
            let mut inner = self.inner.lock().await;
            inner.touch();
            inner.global.remove(key)
        };
        if removed.is_some() {
            self.publish(vec![ContextEvent::GlobalValueChanged { key: key.to_string() }]);
        }
        removed
    }

    async fn typed_global<T>(
        &self,
        key: &str,
        expected: &'static str,
        extract: impl Fn(&ContextValue) -> Option<T> + Send,
    ) -> Result<T, ContextError> {
        let value = self
            .get_global_value(key)
            .await
            .ok_or_else(|| ContextError::NotFound(key.to_string()))?;
        extract(&value).ok_or_else(|| ContextError::TypeMismatch {
            key: key.to_string(),
            expected,
            found: value.kind(),
        })
    }

    pub async fn global_text(&self, key: &str) -> Result<String, ContextError> {
        self.typed_global(key, "text", |v| v.as_text().map(str::to_string)).await
    }

    pub async fn global_number(&self, key: &str) -> Result<f64, ContextError> {
        self.typed_global(key, "number", ContextValue::as_number).await
    }

    pub async fn global_bool(&self, key: &str) -> Result<bool, ContextError> {
        self.typed_global(key, "bool", ContextValue::as_bool).await
    }

    // ---- task-scoped key-value -----------------------------------------

    /// Fails with `NotFound` unless the task is in history, so every
    /// task-scoped value is reachable by eviction.
    pub async fn set_task_value(&self, task_id: TaskId, key: &str, value: ContextValue) -> Result<(), ContextError> {
        {
            let mut inner = self.inner.lock().await;
            inner.touch();
            if !inner.tasks.contains_key(&task_id) {
                return Err(ContextError::NotFound(task_id.to_string()));
            }
            inner
                .task_context
                .entry(task_id)
                .or_default()
                .insert(key.to_string(), value);
        }
        self.publish(vec![ContextEvent::TaskValueChanged {
            task_id,
            key: key.to_string(),
        }]);
        Ok(())
    }

    pub async fn get_task_value(&self, task_id: TaskId, key: &str) -> Option<ContextValue> {
        let mut inner = self.inner.lock().await;
        inner.touch();
        inner.task_context.get(&task_id).and_then(|m| m.get(key)).cloned()
    }

    pub async fn task_values(&self, task_id: TaskId) -> HashMap<String, ContextValue> {
        let mut inner = self.inner.lock().await;
        inner.touch();
        inner.task_context.get(&task_id).cloned().unwrap_or_default()
    }

    pub async fn remove_task_value(&self, task_id: TaskId, key: &str) -> Option<ContextValue> {
        let removed = {
            let mut inner = self.inner.lock().await;
            inner.touch();
            let scoped = inner.task_context.get_mut(&task_id)?;
            let removed = scoped.remove(key);
            if scoped.is_empty() {
                inner.task_context.remove(&task_id);
            }
            removed
        };
        if removed.is_some() {
            self.publish(vec![ContextEvent::TaskValueChanged {
                task_id,
                key: key.to_string(),
            }]);
        }
        removed
    }

    // ---- diagnostics ---------------------------------------------------

    pub async fn last_accessed_at(&self) -> DateTime<Utc> {
        self.inner.lock().await.last_accessed_at
    }

    pub async fn metrics(&self) -> ContextMetrics {
        self.inner.lock().await.metrics.clone()
    }

    // ---- export / import -----------------------------------------------

    pub async fn export(&self) -> ContextSnapshot {
        let mut inner = self.inner.lock().await;
        inner.touch();
        ContextSnapshot {
            version: SNAPSHOT_VERSION,
            exported_at: Utc::now(),
            max_history_size: inner.max_history_size,
            tasks: inner.sorted_tasks().iter().map(Task::serializable).collect(),
            results: inner.sorted_results(),
            conversations: inner.conversations.clone(),
            global: inner
                .global
                .iter()
                .filter_map(|(k, v)| v.exportable().map(|v| (k.clone(), v)))
                .collect(),
            last_accessed_at: inner.last_accessed_at,
            metrics: inner.metrics.clone(),
        }
    }

    /// Build a new store from a snapshot. Access time and metrics come from
    /// the snapshot, not from the rebuild.
    pub fn import(snapshot: ContextSnapshot) -> Result<Self, ContextError> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(ContextError::UnsupportedVersion(snapshot.version));
        }

        let mut inner = ContextInner::new(snapshot.max_history_size);
        for task in snapshot.tasks {
            inner.insert_task(task);
        }
        for result in snapshot.results {
            inner.insert_result(result);
        }
        inner.conversations = snapshot.conversations;
        inner.global = snapshot.global;

        let mut evicted = Vec::new();
        inner.trim_all(&mut evicted);

        inner.last_accessed_at = snapshot.last_accessed_at;
        inner.metrics = snapshot.metrics;

        let store = Self {
            inner: Arc::new(Mutex::new(inner)),
            events: broadcast::channel(EVENT_CAPACITY).0,
        };
        Ok(store)
    }

    /// Replace this store's contents in place with a snapshot, keeping
    /// existing subscribers.
    pub async fn restore(&self, snapshot: ContextSnapshot) -> Result<(), ContextError> {
        let rebuilt = Self::import(snapshot)?;
        let replacement = {
            let mut source = rebuilt.inner.lock().await;
            std::mem::replace(&mut *source, ContextInner::new(0))
        };
        *self.inner.lock().await = replacement;
        self.publish(vec![ContextEvent::Imported]);
        Ok(())
    }

    pub async fn save_to(&self, path: &Path) -> Result<(), ContextError> {
        let snapshot = self.export().await;
        let json = serde_json::to_vec_pretty(&snapshot)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    pub async fn load_from(path: &Path) -> Result<Self, ContextError> {
        let bytes = tokio::fs::read(path).await?;
        let snapshot: ContextSnapshot = serde_json::from_slice(&bytes)?;
        Self::import(snapshot)
    }

    /// Persist to `path` every `interval` until the handle is aborted.
    pub fn spawn_autosave(&self, path: PathBuf, interval: Duration) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match store.save_to(&path).await {
                    Ok(()) => debug!(path = %path.display(), "Context autosaved"),
                    Err(e) => warn!(path = %path.display(), "Context autosave failed: {}", e),
                }
            }
        })
    }
}
