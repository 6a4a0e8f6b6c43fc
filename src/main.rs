use anyhow::{bail, Context, Result};
use std::sync::Arc;
use std::time::Duration;

use collab_core::agents::{
    Agent, Capability, Credentials, GitHubAgent, LlmAgent, Orchestrator, Task,
};
use collab_core::config::CollabConfig;
use collab_core::context::ContextStore;
use collab_core::github::GhCli;
use collab_core::logging::init_tracing;
use collab_core::providers::{OllamaClient, TextGenerator};

const USAGE: &str = "usage: collab \"<query>\" [capability ...] [key=value ...]";

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let mut args = std::env::args().skip(1);
    let Some(query) = args.next() else {
        bail!(USAGE);
    };
    let mut task = Task::new(query.clone(), query);
    for arg in args {
        task = match arg.split_once('=') {
            Some((key, value)) => match value.parse::<f64>() {
                Ok(number) if number.is_finite() => task.with_context(key, number),
                _ => task.with_context(key, value),
            },
            None => task.with_capability(Capability::parse(&arg)),
        };
    }

    let config = CollabConfig::load().context("loading configuration")?;

    let context = match &config.context.autosave_path {
        Some(path) if path.exists() => {
            let store = ContextStore::load_from(path)
                .await
                .with_context(|| format!("restoring context from {}", path.display()))?;
            store.set_max_history_size(config.context.max_history_size).await;
            store
        }
        _ => ContextStore::new(config.context.max_history_size),
    };
    let autosave = config.context.autosave_path.clone().map(|path| {
        context.spawn_autosave(path, Duration::from_secs(config.context.autosave_interval_secs.max(1)))
    });

    let generator: Arc<dyn TextGenerator> = Arc::new(OllamaClient::new(&config.ollama)?);
    let gh = Arc::new(GhCli::with_binary(config.github.binary.clone()));
    let orchestrator = Orchestrator::new(context.clone()).with_validator(gh.clone());

    if let Ok(token) = std::env::var("GH_TOKEN") {
        let credentials = Credentials {
            github_token: Some(token),
            ollama_url: Some(config.ollama.base_url.clone()),
        };
        if let Err(e) = orchestrator.connect(credentials).await {
            tracing::warn!("GitHub credentials rejected: {}", e);
        }
    }

    let agent_config = config.agent_configuration();
    let analyst = Arc::new(LlmAgent::analyst(generator.clone()));
    let coder = Arc::new(LlmAgent::coder(generator.clone()));
    let github = Arc::new(GitHubAgent::github_with_analysis(
        gh,
        generator,
        config.github.default_limit,
    ));
    analyst.initialize(agent_config.clone()).await?;
    coder.initialize(agent_config.clone()).await?;
    github.initialize(agent_config).await?;
    orchestrator.register(analyst);
    orchestrator.register(coder);
    orchestrator.register(github);

    let result = orchestrator.execute(task).await;
    println!("{}", serde_json::to_string_pretty(&result)?);

    if let Some(handle) = autosave {
        handle.abort();
    }
    if let Some(path) = &config.context.autosave_path {
        context.save_to(path).await?;
    }
    orchestrator.shutdown_all().await?;
    Ok(())
}
