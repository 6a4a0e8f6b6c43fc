use collab_core::agents::{Capability, LlmAgent, Orchestrator, Task};
use collab_core::config::CollabConfig;
use collab_core::context::ContextStore;
use collab_core::providers::{OllamaClient, TextGenerator};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    println!("Collab Orchestrator Demo");
    println!("========================\n");

    let config = CollabConfig::default();
    let generator: Arc<dyn TextGenerator> = Arc::new(OllamaClient::new(&config.ollama)?);

    let context = ContextStore::new(10);
    let mut events = context.subscribe();
    let orchestrator = Orchestrator::new(context.clone());
    orchestrator.register(Arc::new(LlmAgent::analyst(generator.clone())));
    orchestrator.register(Arc::new(LlmAgent::coder(generator)));

    // Works without a running Ollama server: the agents fall back to a
    // local responder and report a partial result.
    let requests = vec![
        ("Summarize the bug report", Capability::Summarization, "The app crashes on start. See #42."),
        ("Write a helper", Capability::CodeGeneration, "Write a function that reverses a string."),
        ("Track an issue", Capability::IssueTracking, "Open an issue for the crash."),
    ];

    for (description, capability, query) in requests {
        println!("Request: {}", description);
        let task = Task::new(description, query).with_capability(capability);
        let result = orchestrator.execute(task).await;

        println!("  status: {:?}", result.status());
        if let Some(agent) = result.agent_name() {
            println!("  agent:  {}", agent);
        }
        match (result.output().as_text(), result.error()) {
            (Some(text), _) => println!("  output: {}", text.lines().next().unwrap_or_default()),
            (None, Some(error)) => println!("  error:  {}", error),
            (None, None) => {}
        }
        println!("\n{}\n", "=".repeat(60));
    }

    while let Ok(event) = events.try_recv() {
        println!("event: {:?}", event);
    }
    println!("\nmetrics: {:?}", context.metrics().await);

    Ok(())
}
