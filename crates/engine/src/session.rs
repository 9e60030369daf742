use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chatflow_llm::{
    Block, BlockPayload, Message, MessageId, ModelRequest, ModelService, Role, SessionId,
    ToolInvocation, ToolOutcome, ToolService, ToolSpec,
};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::accumulator::BlockAccumulator;
use crate::conversation::Conversation;
use crate::error::{ChatError, ErrorKind};
use crate::state::{SessionState, SessionTransition, SessionTransitionRejection};
use crate::structured::OutputSchema;
use crate::telemetry::{TelemetryEvent, TelemetryKind, TelemetryOutcome, TelemetrySink};

/// Per-request overrides.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RequestOptions {
    pub system_prompt: Option<String>,
    pub model_id: Option<String>,
    pub tools: Vec<ToolSpec>,
    /// Ask for the final answer in this shape. See [`OutputSchema`].
    pub output: Option<OutputSchema>,
}

/// Collaborators a session talks to.
#[derive(Clone)]
pub struct SessionDeps {
    /// Source of the history sent with every model call.
    pub conversation: Conversation,
    pub model: Arc<dyn ModelService>,
    pub tools: Arc<dyn ToolService>,
    pub telemetry: Arc<dyn TelemetrySink>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionRequest {
    pub prompt: String,
    pub options: RequestOptions,
    pub max_tool_rounds: u32,
}

/// Everything a session reports, in emission order.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Block {
        message_id: MessageId,
        block: Block,
    },
    Message(Message),
    Finished(SessionOutcome),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    Completed,
    Cancelled,
    Failed(ChatError),
}

impl SessionOutcome {
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Completed => None,
            Self::Cancelled => Some(ErrorKind::Cancelled),
            Self::Failed(error) => Some(error.kind()),
        }
    }
}

/// Handle to one running turn. Cloning shares the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionCore {
    state: SessionState,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
}

struct SessionInner {
    id: SessionId,
    message_id: MessageId,
    core: Mutex<SessionCore>,
    cancel: CancellationToken,
    telemetry: Arc<dyn TelemetrySink>,
}

impl Session {
    /// Spawns the session worker and returns the handle with its event stream.
    pub fn start(
        deps: SessionDeps,
        request: SessionRequest,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let inner = Arc::new(SessionInner {
            id: SessionId::new_v7(),
            message_id: MessageId::new_v7(),
            core: Mutex::new(SessionCore {
                state: SessionState::Idle,
                events: Some(events),
            }),
            cancel: CancellationToken::new(),
            telemetry: Arc::clone(&deps.telemetry),
        });

        inner.record(TelemetryKind::Begin {
            prompt: request.prompt.clone(),
            model_id: request.options.model_id.clone(),
        });
        // Dispatch before the worker runs so abort() is valid immediately.
        inner.advance(&[SessionTransition::Dispatch], Vec::new());

        let worker = SessionWorker {
            inner: Arc::clone(&inner),
            deps,
            request,
            history: Vec::new(),
            turn: BlockAccumulator::new(),
        };
        tokio::spawn(worker.run());

        (Self { inner }, receiver)
    }

    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    /// Id of the assistant message this session assembles.
    pub fn message_id(&self) -> MessageId {
        self.inner.message_id
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock_core().state
    }

    /// Cancels the turn. Nothing but the `Cancelled` outcome is emitted afterwards.
    ///
    /// Returns false when the session had already ended.
    pub fn abort(&self) -> bool {
        let aborted = {
            let mut core = self.inner.lock_core();
            match core.state.apply(SessionTransition::Cancel) {
                Ok(next) => {
                    core.state = next;
                    self.inner.cancel.cancel();
                    if let Some(events) = core.events.take() {
                        let _ = events.send(SessionEvent::Finished(SessionOutcome::Cancelled));
                    }
                    true
                }
                Err(_) => false,
            }
        };

        if aborted {
            tracing::debug!(session_id = %self.inner.id, "session aborted");
            self.inner.record(TelemetryKind::End {
                outcome: TelemetryOutcome::Cancelled,
            });
        }
        aborted
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Session")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

impl SessionInner {
    fn lock_core(&self) -> MutexGuard<'_, SessionCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, kind: TelemetryKind) {
        self.telemetry.record(TelemetryEvent::new(self.id, kind));
    }

    /// Applies the transitions and sends the events as one step.
    ///
    /// Returns false, sending nothing, once the session is terminal or its
    /// receiver is gone.
    fn advance(&self, transitions: &[SessionTransition], events: Vec<SessionEvent>) -> bool {
        let mut core = self.lock_core();
        let next = transitions
            .iter()
            .try_fold(core.state, |state, transition| state.apply(*transition));
        let next = match next {
            Ok(next) => next,
            Err(SessionTransitionRejection::Terminal(_)) => return false,
            Err(rejection) => {
                tracing::error!(
                    session_id = %self.id,
                    rejection = ?rejection,
                    "session worker attempted an illegal transition"
                );
                return false;
            }
        };

        let delivered = match core.events.as_ref() {
            Some(sender) => events.into_iter().all(|event| sender.send(event).is_ok()),
            None => return false,
        };
        if !delivered {
            tracing::debug!(session_id = %self.id, "session receiver dropped");
            self.cancel.cancel();
            core.events = None;
            return false;
        }

        core.state = next;
        if next.is_terminal() {
            core.events = None;
        }
        true
    }
}

struct SessionWorker {
    inner: Arc<SessionInner>,
    deps: SessionDeps,
    request: SessionRequest,
    history: Vec<Message>,
    turn: BlockAccumulator,
}

impl SessionWorker {
    async fn run(mut self) {
        if !self.load_history().await {
            return;
        }
        let mut round: u32 = 0;

        loop {
            let Some(calls) = self.stream_model_call().await else {
                return;
            };

            if calls.is_empty() {
                self.complete();
                return;
            }

            round += 1;
            if round > self.request.max_tool_rounds {
                self.fail(ChatError::ToolLoopExceeded {
                    stage: "tool-round-guard",
                    max_rounds: self.request.max_tool_rounds,
                });
                return;
            }

            if !self
                .inner
                .advance(&[SessionTransition::RunTools], Vec::new())
            {
                return;
            }
            self.inner.record(TelemetryKind::Step {
                round,
                tools: calls.iter().map(|call| call.name.clone()).collect(),
            });

            let mut submitted = false;
            for call in calls {
                if self.is_output_tool(&call.name) {
                    if !self.accept_output(call) {
                        return;
                    }
                    submitted = true;
                } else if !self.run_tool(call).await {
                    return;
                }
            }
            if submitted {
                self.complete();
                return;
            }

            if !self
                .inner
                .advance(&[SessionTransition::Dispatch], Vec::new())
            {
                return;
            }
        }
    }

    /// Reads the conversation history while the session is already abortable.
    async fn load_history(&mut self) -> bool {
        let cancel = self.inner.cancel.clone();
        let history = tokio::select! {
            biased;
            _ = cancel.cancelled() => return false,
            history = self.deps.conversation.history() => history,
        };

        match history {
            Ok(history) => {
                self.history = history;
                true
            }
            Err(error) => {
                tracing::warn!(
                    session_id = %self.inner.id,
                    conversation_id = %self.deps.conversation.id(),
                    error = %error,
                    "failed to read conversation history"
                );
                self.fail(ChatError::Service {
                    stage: "read-history",
                    message: error.to_string(),
                });
                false
            }
        }
    }

    /// Streams one model call into the turn. Returns the tool calls it produced,
    /// or `None` once the session stopped.
    async fn stream_model_call(&mut self) -> Option<Vec<ToolInvocation>> {
        let round_start = self.turn.len();
        let request = ModelRequest {
            prompt: self.request.prompt.clone(),
            history: self.history.clone(),
            progress: self.turn.finalized(),
            system_prompt: self.request.options.system_prompt.clone(),
            tools: self.offered_tools(),
            model_id: self.request.options.model_id.clone(),
        };

        let cancel = self.inner.cancel.clone();
        if cancel.is_cancelled() {
            return None;
        }
        let mut stream = self.deps.model.run(request, cancel.child_token());

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(block)) => {
                    if !self.emit_block(block) {
                        return None;
                    }
                }
                Some(Err(error)) => {
                    tracing::warn!(
                        session_id = %self.inner.id,
                        error = %error,
                        "model call failed"
                    );
                    self.fail(ChatError::from_service("model-stream", &error));
                    return None;
                }
                None => break,
            }
        }

        // A trailing pending fragment is superseded by its final form before the turn moves on.
        if let Some(last) = self.turn.last()
            && last.pending
        {
            let block = last.clone().finalized();
            if !self.emit_block(block) {
                return None;
            }
        }

        Some(
            self.turn.blocks()[round_start..]
                .iter()
                .filter_map(tool_invocation)
                .collect(),
        )
    }

    async fn run_tool(&mut self, invocation: ToolInvocation) -> bool {
        if !self.emit_block(Block::status(format!("Running tool {}", invocation.name))) {
            return false;
        }

        let cancel = self.inner.cancel.clone();
        let tools = Arc::clone(&self.deps.tools);
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return false,
            result = tools.execute(invocation.clone(), cancel.child_token()) => result,
        };

        let outcome = match result {
            Ok(output) => ToolOutcome::Success { output },
            Err(error) => {
                tracing::warn!(
                    session_id = %self.inner.id,
                    tool_name = %invocation.name,
                    call_id = %invocation.call_id,
                    error = %error,
                    "tool execution failed"
                );
                if self.is_required(&invocation.name) {
                    self.fail(ChatError::ToolExecution {
                        stage: "tool-execute",
                        tool_name: invocation.name,
                        message: error.to_string(),
                    });
                    return false;
                }
                ToolOutcome::Error {
                    message: error.to_string(),
                }
            }
        };

        self.emit_block(Block::tool_result(
            invocation.call_id,
            invocation.name,
            outcome,
        ))
    }

    /// Answers a structured-output submission without the tool service.
    fn accept_output(&mut self, invocation: ToolInvocation) -> bool {
        tracing::debug!(
            session_id = %self.inner.id,
            tool_name = %invocation.name,
            "structured output submitted"
        );
        self.emit_block(Block::tool_result(
            invocation.call_id,
            invocation.name,
            ToolOutcome::Success {
                output: invocation.input,
            },
        ))
    }

    fn offered_tools(&self) -> Vec<ToolSpec> {
        let mut tools = self.request.options.tools.clone();
        if let Some(output) = &self.request.options.output {
            tools.push(output.tool_spec());
        }
        tools
    }

    fn is_output_tool(&self, tool_name: &str) -> bool {
        self.request
            .options
            .output
            .as_ref()
            .is_some_and(|output| output.name == tool_name)
    }

    fn is_required(&self, tool_name: &str) -> bool {
        self.request
            .options
            .tools
            .iter()
            .any(|tool| tool.name == tool_name && tool.required)
    }

    fn emit_block(&mut self, block: Block) -> bool {
        let block = self.turn.push(block).clone();
        self.inner.advance(
            &[SessionTransition::Receive],
            vec![SessionEvent::Block {
                message_id: self.inner.message_id,
                block,
            }],
        )
    }

    fn assistant_message(&self, blocks: Vec<Block>) -> Message {
        let mut message = Message::new(Role::Assistant, blocks);
        message.id = self.inner.message_id;
        message
    }

    fn complete(&mut self) {
        let mut events = Vec::with_capacity(2);
        let message = (!self.turn.is_empty())
            .then(|| self.assistant_message(self.turn.blocks().to_vec()));
        if let Some(message) = &message {
            events.push(SessionEvent::Message(message.clone()));
        }
        events.push(SessionEvent::Finished(SessionOutcome::Completed));

        // Finish and Complete share one step so abort never observes Completing.
        let completed = self.inner.advance(
            &[SessionTransition::Finish, SessionTransition::Complete],
            events,
        );
        if completed {
            self.record_message(message.as_ref());
            self.inner.record(TelemetryKind::End {
                outcome: TelemetryOutcome::Completed,
            });
        }
    }

    /// Fails the session, handing over the finished part of the turn first.
    ///
    /// Returns false when the session had already ended.
    fn fail(&mut self, error: ChatError) -> bool {
        let prefix = self.turn.finalized();
        let message = (!prefix.is_empty()).then(|| self.assistant_message(prefix));

        let mut events = Vec::with_capacity(2);
        if let Some(message) = &message {
            events.push(SessionEvent::Message(message.clone()));
        }
        events.push(SessionEvent::Finished(SessionOutcome::Failed(error.clone())));

        if !self.inner.advance(&[SessionTransition::Fail], events) {
            return false;
        }
        self.record_message(message.as_ref());
        self.inner.record(TelemetryKind::End {
            outcome: TelemetryOutcome::Failed {
                error: error.to_string(),
            },
        });
        true
    }

    fn record_message(&self, message: Option<&Message>) {
        if let Some(message) = message {
            self.inner.record(TelemetryKind::Message {
                message_id: message.id,
                block_count: message.blocks.len(),
            });
        }
    }
}

// Every exit path of the worker ends the session, including a panic inside a
// service or a rejected transition. Once terminal this is a no-op.
impl Drop for SessionWorker {
    fn drop(&mut self) {
        let stopped = self.fail(ChatError::Service {
            stage: "session-worker",
            message: "session worker stopped without an outcome".to_string(),
        });
        if stopped {
            tracing::error!(
                session_id = %self.inner.id,
                "session worker stopped without an outcome"
            );
        }
    }
}

fn tool_invocation(block: &Block) -> Option<ToolInvocation> {
    match &block.payload {
        BlockPayload::ToolCall {
            call_id,
            name,
            input,
        } => Some(ToolInvocation {
            call_id: call_id.clone(),
            name: name.clone(),
            input: input.clone(),
        }),
        _ => None,
    }
}
