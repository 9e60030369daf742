use std::time::Instant;

use futures::StreamExt;
use rig::completion::{CompletionModel, GetTokenUsage, Message as RigMessage, ToolDefinition};
use rig::prelude::CompletionClient;
use rig::providers::openai;
use rig::streaming::StreamedAssistantContent;
use snafu::{ResultExt, ensure};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::message::{Block, BlockId, BlockPayload, Role, ToolOutcome, Usage};
use super::provider::ProviderConfig;
use super::service::{
    BlockStream, CompletionsFailedSnafu, EmptyRequestSnafu, HttpClientSnafu, MissingApiKeySnafu,
    ModelRequest, ModelService, ServiceError, ServiceResult,
};

pub const RIG_OPENAI_PROVIDER_ID: &str = "openai";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";

type RigStreamingResponse = rig::streaming::StreamingCompletionResponse<
    rig::providers::openai::responses_api::streaming::StreamingCompletionResponse,
>;

/// Model service backed by rig's OpenAI client.
pub struct RigModelService {
    config: ProviderConfig,
}

impl RigModelService {
    pub fn new(config: ProviderConfig) -> ServiceResult<Self> {
        ensure!(
            !config.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "rig-model-service-new",
                provider_id: config.provider_id.clone(),
            }
        );

        Ok(Self { config })
    }

    fn build_client(config: &ProviderConfig) -> ServiceResult<openai::Client> {
        let mut builder = openai::Client::builder().api_key(config.api_key.as_str());
        if !config.base_url.is_empty() {
            builder = builder.base_url(config.base_url.as_str());
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-client",
        })
    }

    fn resolve_model_id(config: &ProviderConfig, request: &ModelRequest) -> String {
        request
            .model_id
            .clone()
            .or_else(|| config.default_model.clone())
            .unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string())
    }

    /// Flattens the transcript into chat turns. Tool traffic is rendered as text so
    /// that any chat model can follow a turn that already ran tools.
    fn build_messages(request: &ModelRequest) -> Vec<RigMessage> {
        let mut messages = Vec::new();
        for message in &request.history {
            push_transcript(&mut messages, message.sender.role, &message.blocks);
        }
        if !request.prompt.trim().is_empty() {
            messages.push(RigMessage::user(request.prompt.clone()));
        }
        push_transcript(&mut messages, Role::Assistant, &request.progress);
        messages
    }

    fn tool_definitions(request: &ModelRequest) -> Vec<ToolDefinition> {
        request
            .tools
            .iter()
            .map(|tool| ToolDefinition {
                name: tool.name.clone(),
                description: tool.description.clone(),
                parameters: tool.parameters.clone(),
            })
            .collect()
    }

    async fn open_stream(
        config: &ProviderConfig,
        model_id: &str,
        request: &ModelRequest,
    ) -> ServiceResult<RigStreamingResponse> {
        let client = Self::build_client(config)?;
        let model = client.completion_model(model_id.to_string());

        let mut messages = Self::build_messages(request);
        let Some(prompt) = messages.pop() else {
            tracing::warn!(
                model_id = %model_id,
                history_len = request.history.len(),
                "cannot open stream because the request carries no messages"
            );
            return EmptyRequestSnafu {
                stage: "open-stream-pop-prompt",
            }
            .fail();
        };

        let mut builder = model.completion_request(prompt).messages(messages);

        if let Some(preamble) = &request.system_prompt
            && !preamble.trim().is_empty()
        {
            builder = builder.preamble(preamble.clone());
        }

        let tools = Self::tool_definitions(request);
        if !tools.is_empty() {
            builder = builder.tools(tools);
        }

        builder.stream().await.context(CompletionsFailedSnafu {
            stage: "open-stream",
        })
    }

    fn map_stream_item<R>(
        assembler: &mut BlockAssembler,
        stats: &mut StreamStats,
        item: StreamedAssistantContent<R>,
    ) -> Vec<Block>
    where
        R: Clone + Unpin + GetTokenUsage,
    {
        match item {
            StreamedAssistantContent::Text(text) => assembler.push_delta(DeltaKind::Text, text.text),
            StreamedAssistantContent::Reasoning(reasoning) => {
                // Rig can split reasoning into multiple fragments; flatten before forwarding.
                assembler.push_delta(DeltaKind::Reasoning, reasoning.reasoning.join(""))
            }
            StreamedAssistantContent::ReasoningDelta { reasoning, .. } => {
                assembler.push_delta(DeltaKind::Reasoning, reasoning)
            }
            StreamedAssistantContent::ToolCall { tool_call, .. } => {
                stats.tool_calls += 1;
                let call_id = tool_call
                    .call_id
                    .clone()
                    .unwrap_or_else(|| tool_call.id.clone());
                assembler.complete(BlockPayload::ToolCall {
                    call_id,
                    name: tool_call.function.name,
                    input: tool_call.function.arguments,
                })
            }
            StreamedAssistantContent::Final(response) => {
                stats.usage = response.token_usage().map(|usage| Usage {
                    input_tokens: usage.input_tokens,
                    output_tokens: usage.output_tokens,
                    total_tokens: usage.total_tokens,
                });
                Vec::new()
            }
            StreamedAssistantContent::ToolCallDelta { .. } => Vec::new(),
        }
    }

    fn classify(error: ServiceError) -> ServiceError {
        match error {
            ServiceError::CompletionsFailed { stage, source } => {
                ServiceError::from_message(stage, source.to_string())
            }
            ServiceError::HttpClient { stage, source } => {
                ServiceError::from_message(stage, source.to_string())
            }
            other => other,
        }
    }

    async fn run_stream_worker(
        config: ProviderConfig,
        request: ModelRequest,
        block_tx: mpsc::UnboundedSender<ServiceResult<Block>>,
        cancel: CancellationToken,
    ) {
        let started = Instant::now();
        let model_id = Self::resolve_model_id(&config, &request);

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            opened = Self::open_stream(&config, &model_id, &request) => opened,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(error) => {
                tracing::error!(
                    provider_id = %config.provider_id,
                    model_id = %model_id,
                    error = %error,
                    "failed to open model stream"
                );
                let _ = block_tx.send(Err(Self::classify(error)));
                return;
            }
        };

        let mut assembler = BlockAssembler::default();
        let mut stats = StreamStats::default();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    // Stop provider IO promptly; the receiver no longer wants blocks.
                    tracing::debug!(model_id = %model_id, "model stream cancelled");
                    stream.cancel();
                    return;
                }
                next_item = stream.next() => {
                    match next_item {
                        Some(Ok(item)) => {
                            for block in Self::map_stream_item(&mut assembler, &mut stats, item) {
                                if block_tx.send(Ok(block)).is_err() {
                                    stream.cancel();
                                    return;
                                }
                            }
                        }
                        Some(Err(source)) => {
                            tracing::warn!(
                                model_id = %model_id,
                                error = %source,
                                "model stream emitted an error chunk"
                            );
                            let error = ServiceError::from_message("stream-chunk", source.to_string());
                            let _ = block_tx.send(Err(error));
                            return;
                        }
                        None => break,
                    }
                }
            }
        }

        let summary = BlockPayload::Summary {
            model: Some(model_id),
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            tool_calls: stats.tool_calls,
            usage: stats.usage,
        };
        for block in assembler.complete(summary) {
            if block_tx.send(Ok(block)).is_err() {
                return;
            }
        }
    }
}

impl ModelService for RigModelService {
    fn run(&self, request: ModelRequest, cancel: CancellationToken) -> BlockStream {
        let (block_tx, mut block_rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::run_stream_worker(
            self.config.clone(),
            request,
            block_tx,
            cancel,
        ));
        futures::stream::poll_fn(move |cx| block_rx.poll_recv(cx)).boxed()
    }
}

#[derive(Debug, Default)]
struct StreamStats {
    tool_calls: u32,
    usage: Option<Usage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeltaKind {
    Text,
    Reasoning,
}

/// Turns provider deltas into pending blocks that grow until the next kind starts.
#[derive(Debug, Default)]
struct BlockAssembler {
    next_slot: u32,
    open: Option<(DeltaKind, Block)>,
}

impl BlockAssembler {
    fn push_delta(&mut self, kind: DeltaKind, delta: String) -> Vec<Block> {
        if delta.is_empty() {
            return Vec::new();
        }

        if let Some((open_kind, block)) = &mut self.open
            && *open_kind == kind
        {
            if let BlockPayload::Text { text } | BlockPayload::Reasoning { text } =
                &mut block.payload
            {
                text.push_str(&delta);
            }
            return vec![block.clone()];
        }

        let mut emitted = Vec::with_capacity(2);
        emitted.extend(self.close());
        let payload = match kind {
            DeltaKind::Text => BlockPayload::Text { text: delta },
            DeltaKind::Reasoning => BlockPayload::Reasoning { text: delta },
        };
        let block = Block::pending(payload).with_id(self.allocate_slot());
        emitted.push(block.clone());
        self.open = Some((kind, block));
        emitted
    }

    fn complete(&mut self, payload: BlockPayload) -> Vec<Block> {
        let mut emitted = Vec::with_capacity(2);
        emitted.extend(self.close());
        emitted.push(Block::complete(payload).with_id(self.allocate_slot()));
        emitted
    }

    fn close(&mut self) -> Option<Block> {
        self.open.take().map(|(_, block)| block.finalized())
    }

    fn allocate_slot(&mut self) -> BlockId {
        let slot = BlockId::new(self.next_slot);
        self.next_slot += 1;
        slot
    }
}

fn push_transcript(messages: &mut Vec<RigMessage>, role: Role, blocks: &[Block]) {
    let mut segment = Vec::new();
    let mut segment_is_result = false;

    for block in blocks {
        let (line, is_result) = match &block.payload {
            BlockPayload::Text { text } => (text.clone(), false),
            BlockPayload::ToolCall {
                call_id,
                name,
                input,
            } => (format!("[tool call {name} ({call_id}): {input}]"), false),
            BlockPayload::ToolResult {
                call_id,
                name,
                outcome,
            } => (render_tool_result(call_id, name, outcome), true),
            BlockPayload::Reasoning { .. }
            | BlockPayload::Summary { .. }
            | BlockPayload::Status { .. } => continue,
        };

        if is_result != segment_is_result && !segment.is_empty() {
            flush_segment(messages, role, segment_is_result, &mut segment);
        }
        segment_is_result = is_result;
        segment.push(line);
    }

    if !segment.is_empty() {
        flush_segment(messages, role, segment_is_result, &mut segment);
    }
}

fn flush_segment(
    messages: &mut Vec<RigMessage>,
    role: Role,
    is_result: bool,
    segment: &mut Vec<String>,
) {
    let content = segment.join("\n");
    segment.clear();

    // Tool results answer the assistant, so they travel as user turns, and so
    // does anything authored by a tool.
    let message = match (role, is_result) {
        (_, true) | (Role::User | Role::Tool, false) => RigMessage::user(content),
        (Role::Assistant, false) => RigMessage::assistant(content),
    };
    messages.push(message);
}

fn render_tool_result(call_id: &str, name: &str, outcome: &ToolOutcome) -> String {
    match outcome {
        ToolOutcome::Success { output } => format!("[tool result {name} ({call_id}): {output}]"),
        ToolOutcome::Error { message } => format!("[tool error {name} ({call_id}): {message}]"),
    }
}
