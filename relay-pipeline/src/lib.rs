//! # Relay pipeline
//!
//! Turns inbound chat messages into model answers:
//!
//! [`DebounceBatcher`] → [`Sequencer`] → [`MessageProcessor`] (dialog resolution, context bounding,
//! completion, streaming delivery, function calls).
//!
//! Every stage is behind a trait ([`BatchSink`], [`BatchProcessor`], [`Summarizer`], [`Tool`],
//! [`PreferencesProvider`]) so tests can drive them with in-memory doubles.

pub mod batcher;
pub mod cancellation;
pub mod completion;
pub mod config;
pub mod context;
pub mod dialog;
pub mod preferences;
pub mod processor;
pub mod sequencer;
pub mod streaming;
pub mod tools;
pub mod typing;

pub use batcher::{Batch, BatchSink, DebounceBatcher};
pub use cancellation::{CancellationRegistry, CancellationToken};
pub use completion::{CompletionDriver, CompletionStream, StreamEnd, CANCELLED_COMPLETION_FUDGE};
pub use config::{PipelineConfig, TELEGRAM_MESSAGE_LIMIT};
pub use context::{ContextWindow, Summarizer, SUMMARY_PREFIX};
pub use dialog::{DialogResolver, DialogThread};
pub use preferences::{PreferencesProvider, StaticPreferences, UserPreferences};
pub use processor::{
    failure_notice, MessageProcessor, ProcessorDeps, CONTEXT_TOO_LARGE_NOTICE, FAILURE_NOTICE,
    FUNCTION_LOOP_NOTICE,
};
pub use sequencer::{BatchProcessor, Sequencer};
pub use streaming::{
    deliver_text, display_text, split_message, AssembledReply, DeliveredPart, StreamingAssembler,
    MIN_DISPLAY_CHARS, STREAMING_MARKER,
};
pub use tools::{Tool, ToolRegistry};
pub use typing::TypingIndicator;
