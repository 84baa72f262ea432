//! # Staged Generation
//!
//! Multi-stage LLM answer generation driven by a per-user configuration.
//!
//! A configuration is an ordered JSON object of stage name → prompt list.
//! Stages run one after another; the prompts of a stage run concurrently
//! (or step by step when asked to) and see the user's request plus the
//! results of earlier stages. The last stage's results are the answer.
//! Prompts can leave a prompt/response pair behind for the user's next
//! generation, consumed exactly once.
//!
//! ## Core Concepts
//!
//! - **[`config`]**: validation of raw definitions into a [`PipelineConfig`].
//! - **[`ContextStore`]**: per-user, single-use carried context.
//! - **[`PromptExecutor`]**: runs one stage's batch, parallel or sequential.
//! - **[`PipelineScheduler`]**: drives the stages and falls back to a direct
//!   call when the pipeline cannot run.
//! - **[`ExecCtx`]**: HTTP client, backend, model, call pool and event hook
//!   shared by every call.
//! - **[`ResponseSession`]**: message lifecycle around a generation, one
//!   generation per user at a time.
//!
//! ## Quick Start
//!
//! ```no_run
//! use staged_generation::{
//!     InMemoryConfigStore, InMemoryContextStore, PipelineScheduler, Settings,
//! };
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let ctx = Arc::new(Settings::from_env()?.into_ctx()?);
//!
//!     let configs = Arc::new(InMemoryConfigStore::new());
//!     configs.create("user-1", "default", json!({
//!         "analysis": [
//!             {"prompt": "Выдели ключевые понятия вопроса", "saveLastAsContext": true},
//!             {"prompt": "Перечисли возможные подвохи", "blockOutsideInterstageContext": true}
//!         ],
//!         "answer": [{"prompt": "Дай итоговый ответ"}]
//!     }))?;
//!     configs.activate("user-1", "default");
//!
//!     let scheduler = PipelineScheduler::new(ctx, configs, Arc::new(InMemoryContextStore::new()));
//!     let status = |text: &str, stage: usize| println!("[{}] {}", stage, text);
//!     let answer = scheduler.run("Как работает ИИ?", "user-1", Some(&status)).await;
//!     println!("{}", answer);
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod client;
pub mod config;
pub mod config_store;
pub mod context_store;
pub mod error;
pub mod events;
pub mod exec_ctx;
pub mod executor;
pub mod prompt;
pub mod scheduler;
pub mod session;
pub mod settings;

pub use backend::{Backend, BackoffConfig, ChatMessage, MockBackend, OpenAiBackend, Role};
pub use client::LlmConfig;
pub use config::{ConfigError, PipelineConfig, PromptFlags, PromptSpec, StageConfig};
pub use config_store::{ConfigSource, InMemoryConfigStore};
pub use context_store::{ContextStore, InMemoryContextStore, SavedContextEntry};
pub use error::{PipelineError, Result};
pub use events::{Event, EventHandler};
pub use exec_ctx::{ExecCtx, ExecCtxBuilder};
pub use executor::{PromptExecutor, StageOutcome, StagePromptResult};
pub use scheduler::{GenerationMode, GenerationReport, PipelineScheduler, StageReport};
pub use session::{GenerationLog, InMemoryMessageStore, MessageStore, ResponseSession};
pub use settings::Settings;
