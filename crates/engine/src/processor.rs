use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chatflow_llm::{Block, Message, MessageId, ModelService, Role, SessionId, ToolService};
use serde::de::DeserializeOwned;
use tokio::sync::watch;

use crate::accumulator::BlockAccumulator;
use crate::config::EngineConfig;
use crate::conversation::Conversation;
use crate::error::ChatError;
use crate::session::{
    RequestOptions, Session, SessionDeps, SessionEvent, SessionOutcome, SessionRequest,
};
use crate::structured::{OutputSchema, StructuredReply, extract_output};
use crate::telemetry::{NoopTelemetry, TelemetrySink};

pub const DEFAULT_MAX_TOOL_ROUNDS: u32 = 10;

/// Observable processor state. A new snapshot is published after every applied event.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProcessorSnapshot {
    pub streaming: bool,
    /// Pending messages followed by the message still streaming, if any.
    pub messages: Vec<Message>,
    pub error: Option<ChatError>,
}

#[derive(Debug, Clone, PartialEq)]
struct LastRequest {
    text: String,
    options: RequestOptions,
}

struct StreamingMessage {
    id: MessageId,
    blocks: BlockAccumulator,
}

#[derive(Default)]
struct ProcessorRuntime {
    active: Option<Session>,
    pending: Vec<Message>,
    streaming: Option<StreamingMessage>,
    error: Option<ChatError>,
    last_request: Option<LastRequest>,
}

impl ProcessorRuntime {
    fn is_current(&self, session_id: SessionId) -> bool {
        self.active
            .as_ref()
            .is_some_and(|session| session.id() == session_id)
    }

    fn fold_block(&mut self, message_id: MessageId, block: Block) {
        match &mut self.streaming {
            Some(streaming) if streaming.id == message_id => {
                streaming.blocks.push(block);
            }
            streaming => {
                let mut blocks = BlockAccumulator::new();
                blocks.push(block);
                *streaming = Some(StreamingMessage {
                    id: message_id,
                    blocks,
                });
            }
        }
    }

    fn snapshot(&self) -> ProcessorSnapshot {
        let mut messages = self.pending.clone();
        if let Some(streaming) = &self.streaming {
            messages.push(streaming.blocks.to_message(streaming.id, Role::Assistant));
        }
        ProcessorSnapshot {
            streaming: self.active.is_some(),
            messages,
            error: self.error.clone(),
        }
    }

    /// Aborts the active session and discards what it produced.
    fn abort_active(&mut self) -> Vec<Message> {
        let Some(session) = self.active.take() else {
            return Vec::new();
        };
        session.abort();
        self.streaming = None;
        std::mem::take(&mut self.pending)
    }
}

struct ProcessorShared {
    deps: SessionDeps,
    max_tool_rounds: u32,
    default_system_prompt: Option<String>,
    runtime: Mutex<ProcessorRuntime>,
    snapshots: watch::Sender<ProcessorSnapshot>,
}

impl ProcessorShared {
    fn lock_runtime(&self) -> MutexGuard<'_, ProcessorRuntime> {
        self.runtime.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, runtime: &ProcessorRuntime) {
        self.snapshots.send_replace(runtime.snapshot());
    }
}

/// Runs one request at a time against a conversation.
///
/// Cloning shares the same processor.
#[derive(Clone)]
pub struct Processor {
    shared: Arc<ProcessorShared>,
}

pub struct ProcessorBuilder {
    conversation: Conversation,
    model: Arc<dyn ModelService>,
    tools: Arc<dyn ToolService>,
    telemetry: Arc<dyn TelemetrySink>,
    max_tool_rounds: u32,
    system_prompt: Option<String>,
}

impl ProcessorBuilder {
    pub fn telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn max_tool_rounds(mut self, max_tool_rounds: u32) -> Self {
        self.max_tool_rounds = max_tool_rounds;
        self
    }

    /// System prompt used when a request does not carry its own.
    pub fn system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn config(mut self, config: &EngineConfig) -> Self {
        self.max_tool_rounds = config.max_tool_rounds;
        self.system_prompt = config.system_prompt.clone();
        self
    }

    pub fn build(self) -> Processor {
        let (snapshots, _) = watch::channel(ProcessorSnapshot::default());
        Processor {
            shared: Arc::new(ProcessorShared {
                deps: SessionDeps {
                    conversation: self.conversation,
                    model: self.model,
                    tools: self.tools,
                    telemetry: self.telemetry,
                },
                max_tool_rounds: self.max_tool_rounds,
                default_system_prompt: self.system_prompt,
                runtime: Mutex::new(ProcessorRuntime::default()),
                snapshots,
            }),
        }
    }
}

impl Processor {
    pub fn builder(
        conversation: Conversation,
        model: Arc<dyn ModelService>,
        tools: Arc<dyn ToolService>,
    ) -> ProcessorBuilder {
        ProcessorBuilder {
            conversation,
            model,
            tools,
            telemetry: Arc::new(NoopTelemetry),
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
            system_prompt: None,
        }
    }

    pub fn conversation(&self) -> &Conversation {
        &self.shared.deps.conversation
    }

    /// Runs one turn for `text` and returns the messages it produced.
    ///
    /// Any active request is cancelled first and its messages are discarded. The
    /// returned messages are the caller's to commit. A failed turn still returns
    /// its finished messages and leaves the error in the snapshot. A turn that gets
    /// cancelled or superseded returns nothing.
    ///
    /// The request becomes the active one before anything is awaited, so a later
    /// `request` or `cancel` always applies to it.
    pub async fn request(&self, text: impl Into<String>, options: RequestOptions) -> Vec<Message> {
        let text = text.into();

        let (session_id, mut events) = {
            let mut runtime = self.shared.lock_runtime();
            runtime.abort_active();
            runtime.error = None;
            runtime.last_request = Some(LastRequest {
                text: text.clone(),
                options: options.clone(),
            });

            runtime.pending.push(Message::user_text(text.clone()));

            let mut options = options;
            if options.system_prompt.is_none() {
                options.system_prompt = self.shared.default_system_prompt.clone();
            }
            let (session, events) = Session::start(
                self.shared.deps.clone(),
                SessionRequest {
                    prompt: text,
                    options,
                    max_tool_rounds: self.shared.max_tool_rounds,
                },
            );
            let session_id = session.id();
            tracing::debug!(session_id = %session_id, "request started");
            runtime.active = Some(session);
            self.shared.publish(&runtime);
            (session_id, events)
        };

        while let Some(event) = events.recv().await {
            let mut runtime = self.shared.lock_runtime();
            if !runtime.is_current(session_id) {
                return Vec::new();
            }

            match event {
                SessionEvent::Block { message_id, block } => {
                    runtime.fold_block(message_id, block);
                }
                SessionEvent::Message(message) => {
                    runtime.streaming = None;
                    runtime.pending.push(message);
                }
                SessionEvent::Finished(outcome) => {
                    runtime.active = None;
                    runtime.streaming = None;
                    match outcome {
                        SessionOutcome::Completed => {}
                        SessionOutcome::Cancelled => {
                            runtime.pending.clear();
                        }
                        SessionOutcome::Failed(error) => {
                            tracing::warn!(
                                session_id = %session_id,
                                error = %error,
                                "request failed"
                            );
                            runtime.error = Some(error);
                        }
                    }
                    let pending = std::mem::take(&mut runtime.pending);
                    self.shared.publish(&runtime);
                    return pending;
                }
            }
            self.shared.publish(&runtime);
        }

        // The worker went away without reporting an outcome.
        let mut runtime = self.shared.lock_runtime();
        if !runtime.is_current(session_id) {
            return Vec::new();
        }
        runtime.active = None;
        runtime.streaming = None;
        runtime.error = Some(ChatError::Service {
            stage: "session-events",
            message: "session ended without an outcome".to_string(),
        });
        let pending = std::mem::take(&mut runtime.pending);
        self.shared.publish(&runtime);
        pending
    }

    /// Runs one turn that must end with a result shaped by `schema`.
    ///
    /// Behaves like [`Processor::request`] with the schema offered as a required
    /// tool. The result is decoded from the model's last submission.
    pub async fn request_structured<T: DeserializeOwned>(
        &self,
        text: impl Into<String>,
        mut options: RequestOptions,
        schema: OutputSchema,
    ) -> StructuredReply<T> {
        let tool_name = schema.name.clone();
        options.output = Some(schema);
        let messages = self.request(text, options).await;
        let output = match self.error() {
            Some(error) => Err(error),
            None => extract_output(&messages, &tool_name),
        };
        StructuredReply { messages, output }
    }

    /// Aborts the active request and returns its pending messages.
    pub fn cancel(&self) -> Vec<Message> {
        let mut runtime = self.shared.lock_runtime();
        let pending = runtime.abort_active();
        self.shared.publish(&runtime);
        pending
    }

    /// Repeats the last request with the same text and options.
    pub async fn retry(&self) -> Vec<Message> {
        let last_request = self.shared.lock_runtime().last_request.clone();
        match last_request {
            Some(LastRequest { text, options }) => self.request(text, options).await,
            None => Vec::new(),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ProcessorSnapshot> {
        self.shared.snapshots.subscribe()
    }

    pub fn snapshot(&self) -> ProcessorSnapshot {
        self.shared.snapshots.borrow().clone()
    }

    pub fn is_streaming(&self) -> bool {
        self.shared.snapshots.borrow().streaming
    }

    pub fn messages(&self) -> Vec<Message> {
        self.shared.snapshots.borrow().messages.clone()
    }

    pub fn error(&self) -> Option<ChatError> {
        self.shared.snapshots.borrow().error.clone()
    }
}
