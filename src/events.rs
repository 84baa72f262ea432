//! Event system for generation lifecycle hooks.
//!
//! Provides an optional, non-intrusive way to observe a generation: when it
//! starts, when each stage starts and ends, how each prompt fared, when a
//! transport retry happens, and when the pipeline falls back to a direct
//! call. Implement [`EventHandler`] to receive these for logging, progress
//! tracking, or metrics.

use std::sync::Arc;

/// Events emitted while a generation runs.
#[derive(Debug, Clone)]
pub enum Event {
    /// A generation for `user_id` has started.
    GenerationStart {
        user_id: String,
        /// Number of carried prompt/response pairs consumed by this run.
        carried: usize,
    },
    /// A stage is about to execute.
    StageStart {
        /// 1-based stage index.
        index: usize,
        /// Total number of stages in the active config.
        total: usize,
        /// Stage name as declared in the config.
        name: String,
        /// Whether the batch runs step by step.
        sequential: bool,
    },
    /// A single prompt within a stage has finished.
    PromptEnd {
        stage: String,
        /// 0-based position of the prompt in its stage.
        index: usize,
        /// Whether the LLM call succeeded.
        ok: bool,
    },
    /// A stage has finished.
    StageEnd {
        name: String,
        /// Number of prompts whose call failed.
        failures: usize,
    },
    /// A transport-level retry due to an HTTP or network error.
    TransportRetry {
        /// The retry attempt number (1-indexed).
        attempt: u32,
        /// Delay before this retry attempt in milliseconds.
        delay_ms: u64,
        /// Reason for the retry (error description).
        reason: String,
    },
    /// The pipeline could not run and a direct single call is used instead.
    Fallback {
        user_id: String,
        reason: String,
    },
    /// A generation has produced its final text.
    GenerationEnd {
        user_id: String,
        /// Whether the staged pipeline (rather than the direct fallback) produced the text.
        staged: bool,
        /// Number of LLM calls issued.
        requests: usize,
    },
}

/// Handler for generation lifecycle events.
///
/// This is entirely optional -- the scheduler works without an event handler.
///
/// # Example
///
/// ```
/// use staged_generation::events::{Event, EventHandler};
///
/// struct PrintHandler;
///
/// impl EventHandler for PrintHandler {
///     fn on_event(&self, event: Event) {
///         match event {
///             Event::StageStart { index, name, .. } => println!("[stage {}] {}", index, name),
///             Event::Fallback { reason, .. } => println!("[fallback] {}", reason),
///             _ => {}
///         }
///     }
/// }
/// ```
pub trait EventHandler: Send + Sync {
    /// Called when the pipeline emits an event.
    fn on_event(&self, event: Event);
}

/// Emit an event if a handler is present. No-op otherwise.
pub(crate) fn emit(handler: &Option<Arc<dyn EventHandler>>, event: Event) {
    if let Some(ref h) = handler {
        h.on_event(event);
    }
}

/// An [`EventHandler`] backed by a closure.
///
/// # Example
///
/// ```
/// use staged_generation::events::{Event, FnEventHandler};
/// use std::sync::Arc;
///
/// let handler = Arc::new(FnEventHandler(|event: Event| {
///     if let Event::StageEnd { name, failures } = event {
///         println!("{} done, {} failed", name, failures);
///     }
/// }));
/// ```
pub struct FnEventHandler<F: Fn(Event) + Send + Sync>(pub F);

impl<F: Fn(Event) + Send + Sync> EventHandler for FnEventHandler<F> {
    fn on_event(&self, event: Event) {
        (self.0)(event);
    }
}
