//! Example: a three-stage generation against MockBackend, no network needed.
//!
//! Run with: `RUST_LOG=staged_generation=debug cargo run --example mock_generation`

use serde_json::json;
use staged_generation::events::FnEventHandler;
use staged_generation::{
    ContextStore, Event, ExecCtx, InMemoryConfigStore, InMemoryContextStore, MockBackend,
    PipelineScheduler,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "staged_generation=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    // Answer with the task line, so the flow is visible in the output
    let mock = MockBackend::from_fn(|req| {
        let content = req.last_user_content().unwrap_or_default();
        let task = content.rsplit("Задача: ").next().unwrap_or_default();
        Ok(format!("<{}>", task))
    })
    .with_delay(Duration::from_millis(150));

    let ctx = ExecCtx::builder("http://unused")
        .backend(Arc::new(mock))
        .event_handler(Arc::new(FnEventHandler(|event: Event| {
            if let Event::StageEnd { name, failures } = event {
                println!("  stage '{}' done ({} failed)", name, failures);
            }
        })))
        .build();

    let configs = Arc::new(InMemoryConfigStore::new());
    configs.create(
        "demo",
        "three-stage",
        json!({
            "analysis": [
                {"prompt": "Выдели ключевые понятия", "saveLastAsContext": true},
                {"prompt": "Найди подвохи", "blockOutsideInterstageContext": true}
            ],
            "draft": [
                {"prompt": "Набросай ответ", "stepByStepRequest": true},
                {"prompt": "Улучши набросок"}
            ],
            "answer": [{"prompt": "Дай итоговый ответ"}]
        }),
    )?;
    configs.activate("demo", "three-stage");

    let contexts = Arc::new(InMemoryContextStore::new());
    let scheduler = PipelineScheduler::new(Arc::new(ctx), configs, contexts.clone());

    let status = |text: &str, stage: usize| println!("[{}] {}", stage, text);
    let report = scheduler
        .run_detailed("Как работает ИИ?", "demo", Some(&status))
        .await;

    println!("\nStages:");
    for stage in &report.stages {
        for (i, r) in stage.results.iter().enumerate() {
            let marker = if r.block_from_context { " (blocked)" } else { "" };
            println!("  {}[{}]: {}{}", stage.name, i, r.text, marker);
        }
    }
    println!("\nAnswer: {}", report.text);
    println!("Requests: {}", report.total_requests);

    for entry in contexts.peek("demo").await {
        println!("Carried to next run: {} -> {}", entry.prompt, entry.response);
    }

    Ok(())
}
