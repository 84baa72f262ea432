//! Example: staged generation against OpenRouter.
//!
//! Run with:
//! `OPENROUTER_API_KEY=sk-or-... cargo run --example openrouter_generation -- "Ваш вопрос"`

use serde_json::json;
use staged_generation::{
    InMemoryConfigStore, InMemoryContextStore, InMemoryMessageStore, PipelineScheduler,
    ResponseSession, Role, Settings,
};
use std::sync::Arc;
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

    let question = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "Почему небо голубое?".to_string());

    let settings = Settings::from_env()?;
    println!("Model: {}", settings.model);
    let ctx = Arc::new(settings.into_ctx()?);

    let configs = Arc::new(InMemoryConfigStore::new());
    configs.create(
        "cli",
        "default",
        json!({
            "facts": [
                {"prompt": "Перечисли факты, нужные для ответа на вопрос"},
                {
                    "messages": [
                        {"role": "system", "content": "Отвечай строго в JSON."},
                        {"role": "user", "content": "{context}\n\nОцени сложность вопроса."}
                    ],
                    "json_schema": {
                        "type": "object",
                        "properties": {"level": {"type": "string"}},
                        "required": ["level"]
                    },
                    "temperature": 0.2,
                    "blockOutsideInterstageContext": true
                }
            ],
            "answer": [{"prompt": "Дай краткий и точный ответ"}]
        }),
    )?;
    configs.activate("cli", "default");

    let scheduler = Arc::new(PipelineScheduler::new(
        ctx,
        configs,
        Arc::new(InMemoryContextStore::new()),
    ));
    let messages = Arc::new(InMemoryMessageStore::new());
    let session = ResponseSession::new(scheduler, messages.clone());

    messages.push("q1", Role::User, &question);
    messages.create("m1");
    match session.respond("cli", "m1", &question).await {
        Some(text) => println!("\n{}", text),
        None => println!("\n(no answer)"),
    }
    if let Some(state) = messages.get("m1") {
        println!("\nLast status: {} ({:?})", state.status_text, state.phase);
    }

    Ok(())
}
