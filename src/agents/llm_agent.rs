use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{
    AgentError, BaseAgent, CacheKey, Capability, HandlerOutcome, ProgressReporter, ResourceUsage,
    ResponseCache, Task, TaskHandler, TaskOutput,
};
use crate::config::{AgentConfiguration, RetryPolicy};
use crate::providers::{GenerationOptions, LocalResponder, ProviderError, TextGenerator};

/// Progress never reaches 1.0 until the stream has finished.
const STREAMING_PROGRESS_CAP: f64 = 0.95;

/// An agent answered by a text-generation backend.
pub type LlmAgent = BaseAgent<LlmHandler>;

pub struct LlmHandler {
    generator: Arc<dyn TextGenerator>,
    system_prompt: String,
    cache: Mutex<ResponseCache>,
    fallback: LocalResponder,
}

impl LlmHandler {
    pub fn new(generator: Arc<dyn TextGenerator>, system_prompt: impl Into<String>) -> Self {
        Self {
            generator,
            system_prompt: system_prompt.into(),
            cache: Mutex::new(ResponseCache::default()),
            fallback: LocalResponder::new(),
        }
    }

    pub fn with_cache(mut self, cache: ResponseCache) -> Self {
        self.cache = Mutex::new(cache);
        self
    }

    pub fn with_fallback(mut self, fallback: LocalResponder) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.lock().len()
    }

    fn build_prompt(&self, task: &Task) -> String {
        let mut prompt = format!("{}\n\n", self.system_prompt);

        let mut context: Vec<(&String, String)> = task
            .context()
            .iter()
            .filter_map(|(k, v)| v.exportable().map(|v| (k, v.to_string())))
            .collect();
        if !context.is_empty() {
            context.sort();
            prompt.push_str("Context:\n");
            for (key, value) in context {
                prompt.push_str(&format!("- {}: {}\n", key, value));
            }
            prompt.push('\n');
        }

        if !task.description().is_empty() && task.description() != task.query() {
            prompt.push_str(&format!("Task: {}\n\n", task.description()));
        }
        prompt.push_str(task.query());
        prompt
    }

    fn options(config: &AgentConfiguration) -> GenerationOptions {
        let defaults = GenerationOptions::default();
        GenerationOptions {
            temperature: config.temperature,
            top_p: config
                .additional_parameters
                .get("top_p")
                .and_then(|v| v.as_number())
                .map_or(defaults.top_p, |p| p as f32),
            num_predict: config.max_tokens,
        }
    }

    /// Select the configured model if it differs from the backend's current
    /// one, then return the model in use.
    async fn ensure_model(&self, config: &AgentConfiguration) -> Result<String, ProviderError> {
        if let Some(model) = &config.model {
            if self.generator.selected_model().as_deref() != Some(model.as_str()) {
                self.generator.select_model(model).await?;
            }
        }
        self.generator.selected_model().ok_or(ProviderError::ModelNotSelected)
    }

    async fn generate_once(
        &self,
        prompt: &str,
        options: GenerationOptions,
        progress: &ProgressReporter,
    ) -> Result<String, ProviderError> {
        let mut stream = self.generator.generate_text(prompt, options).await?;
        let budget = options.num_predict.max(1) as f64;
        let mut text = String::new();

        while let Some(chunk) = stream.next().await {
            text.push_str(&chunk?);
            let produced = self.generator.estimate_tokens(&text) as f64;
            progress.report("generating", (produced / budget).min(STREAMING_PROGRESS_CAP));
        }
        Ok(text)
    }

    async fn generate_with_retry(
        &self,
        prompt: &str,
        options: GenerationOptions,
        progress: &ProgressReporter,
        retry: &RetryPolicy,
    ) -> Result<String, ProviderError> {
        let mut attempt = 0;
        loop {
            match self.generate_once(prompt, options, progress).await {
                Ok(text) => return Ok(text),
                Err(e) if e.is_transient() && attempt < retry.max_retries => {
                    let delay = retry.delay_for(attempt);
                    warn!(
                        task_id = %progress.task_id(),
                        "Generation attempt {} failed, retrying in {:?}: {}",
                        attempt + 1,
                        delay,
                        e
                    );
                    progress.report("retrying", 0.0);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fall_back(&self, task: &Task, progress: &ProgressReporter) -> HandlerOutcome {
        progress.report("answering locally", 0.5);
        let text = self.fallback.respond(task).await;
        progress.report("done", 1.0);
        HandlerOutcome::partial(TaskOutput::Text(text))
    }
}

#[async_trait]
impl TaskHandler for LlmHandler {
    async fn handle(
        &self,
        task: &Task,
        progress: &ProgressReporter,
        config: &AgentConfiguration,
    ) -> Result<HandlerOutcome, AgentError> {
        let model = match self.ensure_model(config).await {
            Ok(model) => model,
            Err(e) if e.is_unavailable() => return Ok(self.fall_back(task, progress).await),
            Err(e) => return Err(e.into()),
        };

        let key = CacheKey::for_task(&model, task);
        let cached = self.cache.lock().get(&key);
        if let Some(output) = cached {
            debug!(task_id = %task.id(), model = %model, "Response cache hit");
            progress.report("cached", 1.0);
            return Ok(HandlerOutcome::completed(output));
        }

        if !self.generator.check_availability().await {
            info!(backend = %self.generator.name(), "Text generation unavailable, using local responder");
            return Ok(self.fall_back(task, progress).await);
        }

        progress.report("prompting", 0.0);
        let prompt = self.build_prompt(task);
        let text = match self
            .generate_with_retry(&prompt, Self::options(config), progress, &config.retry)
            .await
        {
            Ok(text) => text,
            Err(e) if e.is_unavailable() => {
                info!(backend = %self.generator.name(), "Backend went away mid-task: {}", e);
                return Ok(self.fall_back(task, progress).await);
            }
            Err(e) => return Err(e.into()),
        };
        progress.report("done", 1.0);

        let usage = ResourceUsage::tokens(
            self.generator.estimate_tokens(&prompt),
            self.generator.estimate_tokens(&text),
        );
        let output = TaskOutput::Text(text);
        self.cache.lock().insert(key, output.clone());
        Ok(HandlerOutcome::completed(output).with_usage(usage))
    }

    fn clear_cache(&self) {
        self.cache.lock().clear();
    }
}

impl LlmAgent {
    pub fn with_prompt(
        name: impl Into<String>,
        capabilities: impl IntoIterator<Item = Capability>,
        generator: Arc<dyn TextGenerator>,
        system_prompt: impl Into<String>,
    ) -> Self {
        BaseAgent::new(name, capabilities, LlmHandler::new(generator, system_prompt))
    }

    pub fn analyst(generator: Arc<dyn TextGenerator>) -> Self {
        Self::with_prompt(
            "LLM Analyst",
            [
                Capability::TextAnalysis,
                Capability::Summarization,
                Capability::Conversational,
            ],
            generator,
            "You are an expert technical analyst. Read the request carefully, identify the key facts and answer clearly and concisely.",
        )
    }

    pub fn coder(generator: Arc<dyn TextGenerator>) -> Self {
        Self::with_prompt(
            "LLM Coder",
            [Capability::CodeGeneration, Capability::CodeReview],
            generator,
            "You are an expert software developer. Write clean, efficient and well-documented code, and review code for correctness and clarity.",
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{Agent, Orchestrator, ResultStatus};
    use crate::context::ContextStore;
    use crate::providers::{ModelInfo, TextStream};
    use futures::stream;
    use parking_lot::RwLock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// How the stub behaves on `generate_text`.
    #[derive(Clone, Copy, PartialEq)]
    enum Mode {
        Answer,
        Unavailable,
        FlakyStream,
        GoesAwayMidStream,
        Broken,
    }

    struct StubGenerator {
        mode: Mode,
        available: bool,
        calls: AtomicUsize,
        selected: RwLock<Option<String>>,
    }

    impl StubGenerator {
        fn new(mode: Mode) -> Self {
            Self {
                mode,
                available: mode != Mode::Unavailable,
                calls: AtomicUsize::new(0),
                selected: RwLock::new(Some("stub-model".to_string())),
            }
        }

        fn without_model(self) -> Self {
            *self.selected.write() = None;
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TextGenerator for StubGenerator {
        fn name(&self) -> &str {
            "stub"
        }

        async fn generate_text(&self, prompt: &str, _options: GenerationOptions) -> Result<TextStream, ProviderError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let answer = format!("answer to: {}", prompt.lines().last().unwrap_or_default());
            let chunks: Vec<Result<String, ProviderError>> = match self.mode {
                Mode::Answer => vec![Ok(answer)],
                Mode::Unavailable => return Err(ProviderError::ServiceUnavailable("down".into())),
                Mode::FlakyStream if call == 0 => {
                    vec![Ok("partial".into()), Err(ProviderError::Stream("cut off".into()))]
                }
                Mode::FlakyStream => vec![Ok(answer)],
                Mode::GoesAwayMidStream => {
                    vec![Ok("partial".into()), Err(ProviderError::ServiceUnavailable("gone".into()))]
                }
                Mode::Broken => vec![Err(ProviderError::Stream("broken pipe".into()))],
            };
            Ok(Box::pin(stream::iter(chunks)))
        }

        async fn list_models(&self) -> Result<Vec<ModelInfo>, ProviderError> {
            Ok(vec![])
        }

        async fn select_model(&self, name: &str) -> Result<(), ProviderError> {
            *self.selected.write() = Some(name.to_string());
            Ok(())
        }

        fn selected_model(&self) -> Option<String> {
            self.selected.read().clone()
        }

        async fn check_availability(&self) -> bool {
            self.available
        }
    }

    fn analyst(stub: &Arc<StubGenerator>) -> LlmAgent {
        LlmAgent::analyst(stub.clone())
    }

    fn analysis_task(query: &str) -> Task {
        Task::new("analyze", query).with_capability(Capability::TextAnalysis)
    }

    #[tokio::test]
    async fn test_cache_round_trip_skips_backend() {
        let stub = Arc::new(StubGenerator::new(Mode::Answer));
        let agent = analyst(&stub);

        let first = agent.process_task(&analysis_task("why is CI red?")).await.unwrap();
        let second = agent.process_task(&analysis_task("why is CI red?")).await.unwrap();

        assert_eq!(first.status(), ResultStatus::Completed);
        assert_eq!(first.output(), second.output());
        assert_ne!(first.task_id(), second.task_id());
        assert_eq!(stub.calls(), 1);
        assert!(first.resource_usage().is_some());
    }

    #[tokio::test]
    async fn test_cache_key_includes_capabilities_and_model() {
        let stub = Arc::new(StubGenerator::new(Mode::Answer));
        let agent = analyst(&stub);

        agent.process_task(&analysis_task("q")).await.unwrap();
        let summarize = Task::new("sum", "q").with_capability(Capability::Summarization);
        agent.process_task(&summarize).await.unwrap();
        assert_eq!(stub.calls(), 2);

        agent
            .initialize(AgentConfiguration::default().with_model("other-model"))
            .await
            .unwrap();
        agent.process_task(&analysis_task("q")).await.unwrap();
        assert_eq!(stub.calls(), 3);
        assert_eq!(stub.selected_model().as_deref(), Some("other-model"));
    }

    #[tokio::test]
    async fn test_unavailable_backend_falls_back() {
        let stub = Arc::new(StubGenerator::new(Mode::Unavailable));
        let agent = analyst(&stub);

        let result = agent.process_task(&analysis_task("summarize #12")).await.unwrap();
        assert_eq!(result.status(), ResultStatus::PartiallyCompleted);
        assert!(result.output().as_text().unwrap().starts_with("[offline]"));
        assert_eq!(stub.calls(), 0);
        assert_eq!(agent.handler().cached_entries(), 0);
    }

    #[tokio::test]
    async fn test_backend_lost_mid_stream_falls_back() {
        let stub = Arc::new(StubGenerator::new(Mode::GoesAwayMidStream));
        let agent = analyst(&stub);

        let result = agent.process_task(&analysis_task("q")).await.unwrap();
        assert_eq!(result.status(), ResultStatus::PartiallyCompleted);
        assert_eq!(stub.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_stream_error_is_retried() {
        let stub = Arc::new(StubGenerator::new(Mode::FlakyStream));
        let agent = analyst(&stub);

        let result = agent.process_task(&analysis_task("q")).await.unwrap();
        assert_eq!(result.status(), ResultStatus::Completed);
        assert_eq!(result.output().as_text(), Some("answer to: q"));
        assert_eq!(stub.calls(), 2);
    }

    #[tokio::test]
    async fn test_transient_error_without_retries_fails() {
        let stub = Arc::new(StubGenerator::new(Mode::FlakyStream));
        let agent = analyst(&stub);
        let mut config = AgentConfiguration::default();
        config.retry.max_retries = 0;
        agent.initialize(config).await.unwrap();

        let result = agent.process_task(&analysis_task("q")).await.unwrap();
        assert_eq!(result.status(), ResultStatus::Failed);
        assert!(result.error().unwrap().contains("cut off"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_backoff_factor_fails_instead_of_panicking() {
        let stub = Arc::new(StubGenerator::new(Mode::Broken));
        let agent = analyst(&stub);
        let mut config = AgentConfiguration::default();
        config.timeout_secs = 600;
        config.retry.max_retries = 3;
        config.retry.backoff_factor = 1e300;
        config.validate().unwrap();
        agent.initialize(config).await.unwrap();

        let orchestrator = Orchestrator::new(ContextStore::new(10));
        orchestrator.register(Arc::new(agent));

        let result = orchestrator.execute(analysis_task("q")).await;
        assert_eq!(result.status(), ResultStatus::Failed);
        assert!(result.error().unwrap().contains("broken pipe"));
        assert_eq!(stub.calls(), 4);
    }

    #[tokio::test]
    async fn test_missing_model_is_a_hard_failure() {
        let stub = Arc::new(StubGenerator::new(Mode::Answer).without_model());
        let agent = analyst(&stub);

        let result = agent.process_task(&analysis_task("q")).await.unwrap();
        assert_eq!(result.status(), ResultStatus::Failed);
        assert!(result.error().unwrap().contains("No model selected"));
        assert_eq!(stub.calls(), 0);
    }

    #[tokio::test]
    async fn test_capability_mismatch_is_an_error() {
        let stub = Arc::new(StubGenerator::new(Mode::Answer));
        let agent = analyst(&stub);
        let task = Task::new("code", "write it").with_capability(Capability::CodeGeneration);

        assert!(matches!(
            agent.process_task(&task).await,
            Err(AgentError::CapabilityNotSupported(Capability::CodeGeneration))
        ));
        assert_eq!(stub.calls(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_clears_cache() {
        let stub = Arc::new(StubGenerator::new(Mode::Answer));
        let agent = analyst(&stub);
        agent.process_task(&analysis_task("q")).await.unwrap();
        assert_eq!(agent.handler().cached_entries(), 1);

        agent.shutdown().await.unwrap();
        assert_eq!(agent.handler().cached_entries(), 0);
        assert_eq!(agent.monitor_count(), 0);
    }

    #[test]
    fn test_prompt_includes_context_and_query() {
        let stub = Arc::new(StubGenerator::new(Mode::Answer));
        let handler = LlmHandler::new(stub, "SYSTEM");
        let task = Task::new("Triage", "What is wrong?")
            .with_context("repo", "octo/app")
            .with_context("secret", vec![1u8, 2]);

        let prompt = handler.build_prompt(&task);
        assert!(prompt.starts_with("SYSTEM"));
        assert!(prompt.contains("- repo: octo/app"));
        assert!(!prompt.contains("secret"));
        assert!(prompt.contains("Task: Triage"));
        assert!(prompt.ends_with("What is wrong?"));
    }
}
