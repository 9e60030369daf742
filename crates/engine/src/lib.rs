//! Turns user requests into streamed, tool-aware assistant turns.
//!
//! A [`Processor`] owns at most one [`Session`] at a time. The session drives the
//! model and tool services and emits blocks; the processor folds them into an
//! observable snapshot and hands finished turns back to the caller, who commits
//! them to a [`Conversation`].

pub mod accumulator;
pub mod config;
pub mod conversation;
pub mod error;
pub mod logging;
pub mod processor;
pub mod session;
pub mod state;
pub mod structured;
pub mod telemetry;

pub use accumulator::BlockAccumulator;
pub use config::{ConfigError, ConfigStore, EngineConfig, ProviderSettings};
pub use conversation::Conversation;
pub use error::{ChatError, ErrorKind};
pub use processor::{Processor, ProcessorBuilder, ProcessorSnapshot};
pub use session::{RequestOptions, Session, SessionDeps, SessionEvent, SessionOutcome, SessionRequest};
pub use state::{SessionState, SessionTransition, SessionTransitionRejection};
pub use structured::{OutputSchema, StructuredReply, extract_output};
pub use telemetry::{
    NoopTelemetry, QueueTelemetry, TelemetryEvent, TelemetryKind, TelemetryOutcome, TelemetrySink,
    TracingTelemetry,
};
