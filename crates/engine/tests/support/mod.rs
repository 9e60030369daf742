#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chatflow_engine::{Conversation, Processor, TelemetryEvent, TelemetrySink};
use chatflow_llm::{
    Block, BlockStream, BoxFuture, Message, ModelRequest, ModelService, ServiceError,
    ServiceResult, ToolError, ToolInvocation, ToolService,
};
use chatflow_storage::{DurableQueue, MemoryQueue, QueueId, StorageResult};
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

pub enum Step {
    Emit(Block),
    Fail(&'static str),
    /// Never yields again; only cancellation ends the call.
    Hang,
}

/// Model whose calls replay scripts queued per prompt.
#[derive(Default)]
pub struct ScriptedModel {
    scripts: Mutex<HashMap<String, VecDeque<Vec<Step>>>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, prompt: &str, steps: Vec<Step>) -> Self {
        self.scripts
            .lock()
            .expect("scripts lock")
            .entry(prompt.to_string())
            .or_default()
            .push_back(steps);
        self
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

impl ModelService for ScriptedModel {
    fn run(&self, request: ModelRequest, _cancel: CancellationToken) -> BlockStream {
        let steps = self
            .scripts
            .lock()
            .expect("scripts lock")
            .get_mut(&request.prompt)
            .and_then(VecDeque::pop_front)
            .unwrap_or_default();
        self.requests.lock().expect("requests lock").push(request);

        let mut items = Vec::new();
        let mut hang = false;
        for step in steps {
            match step {
                Step::Emit(block) => items.push(Ok(block)),
                Step::Fail(message) => items.push(Err(ServiceError::from_message("scripted", message))),
                Step::Hang => {
                    hang = true;
                    break;
                }
            }
        }

        let head = futures::stream::iter(items);
        if hang {
            head.chain(futures::stream::pending()).boxed()
        } else {
            head.boxed()
        }
    }
}

/// Model fed by the test through a channel. It ignores cancellation on purpose.
pub struct ChannelModel {
    receiver: Mutex<Option<mpsc::UnboundedReceiver<ServiceResult<Block>>>>,
}

impl ChannelModel {
    pub fn new() -> (Self, mpsc::UnboundedSender<ServiceResult<Block>>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                receiver: Mutex::new(Some(receiver)),
            },
            sender,
        )
    }
}

impl ModelService for ChannelModel {
    fn run(&self, _request: ModelRequest, _cancel: CancellationToken) -> BlockStream {
        match self.receiver.lock().expect("receiver lock").take() {
            Some(mut receiver) => futures::stream::poll_fn(move |cx| receiver.poll_recv(cx)).boxed(),
            None => futures::stream::empty().boxed(),
        }
    }
}

/// Model whose stream panics on the first poll.
pub struct PanickingModel;

impl ModelService for PanickingModel {
    fn run(&self, _request: ModelRequest, _cancel: CancellationToken) -> BlockStream {
        futures::stream::poll_fn(|_| -> std::task::Poll<Option<ServiceResult<Block>>> {
            panic!("model stream blew up")
        })
        .boxed()
    }
}

/// Tool runner that hands its cancellation token to the test and then waits to
/// be released.
pub struct BlockingTools {
    started: mpsc::UnboundedSender<CancellationToken>,
    release: Mutex<Option<oneshot::Receiver<Value>>>,
}

impl BlockingTools {
    pub fn new() -> (
        Self,
        mpsc::UnboundedReceiver<CancellationToken>,
        oneshot::Sender<Value>,
    ) {
        let (started, started_rx) = mpsc::unbounded_channel();
        let (release, release_rx) = oneshot::channel();
        (
            Self {
                started,
                release: Mutex::new(Some(release_rx)),
            },
            started_rx,
            release,
        )
    }
}

impl ToolService for BlockingTools {
    fn execute<'a>(
        &'a self,
        _invocation: ToolInvocation,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<Value, ToolError>> {
        Box::pin(async move {
            let _ = self.started.send(cancel);
            let release = self.release.lock().expect("release lock").take();
            match release {
                Some(release) => Ok(release.await.unwrap_or(Value::Null)),
                None => Ok(Value::Null),
            }
        })
    }
}

/// Message queue whose reads take as long as the queued delays say, one per read.
pub struct SlowHistory {
    inner: MemoryQueue<Message>,
    delays: Mutex<VecDeque<Duration>>,
}

impl SlowHistory {
    pub fn new(delays: impl IntoIterator<Item = Duration>) -> Self {
        Self {
            inner: MemoryQueue::new(),
            delays: Mutex::new(delays.into_iter().collect()),
        }
    }
}

impl DurableQueue<Message> for SlowHistory {
    fn id(&self) -> QueueId {
        self.inner.id()
    }

    fn append<'a>(&'a self, items: Vec<Message>) -> BoxFuture<'a, StorageResult<()>> {
        self.inner.append(items)
    }

    fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.inner.subscribe()
    }

    fn read_all<'a>(&'a self) -> BoxFuture<'a, StorageResult<Vec<Message>>> {
        let delay = self.delays.lock().expect("delays lock").pop_front();
        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            self.inner.read_all().await
        })
    }
}

/// Tool runner answering from a fixed table.
#[derive(Default)]
pub struct ScriptedTools {
    results: Mutex<HashMap<String, Result<Value, ToolError>>>,
    calls: Mutex<Vec<ToolInvocation>>,
}

impl ScriptedTools {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ok(self, name: &str, output: Value) -> Self {
        self.results
            .lock()
            .expect("results lock")
            .insert(name.to_string(), Ok(output));
        self
    }

    pub fn failing(self, name: &str, message: &str) -> Self {
        self.results.lock().expect("results lock").insert(
            name.to_string(),
            Err(ToolError::Failed {
                tool_name: name.to_string(),
                message: message.to_string(),
            }),
        );
        self
    }

    pub fn calls(&self) -> Vec<ToolInvocation> {
        self.calls.lock().expect("calls lock").clone()
    }
}

impl ToolService for ScriptedTools {
    fn execute<'a>(
        &'a self,
        invocation: ToolInvocation,
        _cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<Value, ToolError>> {
        Box::pin(async move {
            let result = self
                .results
                .lock()
                .expect("results lock")
                .get(&invocation.name)
                .cloned()
                .unwrap_or_else(|| {
                    Err(ToolError::UnknownTool {
                        tool_name: invocation.name.clone(),
                    })
                });
            self.calls.lock().expect("calls lock").push(invocation);
            result
        })
    }
}

#[derive(Default)]
pub struct RecordingTelemetry {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl RecordingTelemetry {
    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().expect("events lock").clone()
    }
}

impl TelemetrySink for RecordingTelemetry {
    fn record(&self, event: TelemetryEvent) {
        self.events.lock().expect("events lock").push(event);
    }
}

pub fn processor(model: Arc<dyn ModelService>, tools: Arc<dyn ToolService>) -> Processor {
    Processor::builder(Conversation::in_memory(), model, tools).build()
}
