use std::sync::Arc;

use chatflow_llm::{MessageId, SessionId};
use chatflow_storage::DurableQueue;
use serde::{Deserialize, Serialize};

/// Lifecycle event of one session, keyed by the session id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub invocation_id: SessionId,
    pub kind: TelemetryKind,
}

impl TelemetryEvent {
    pub fn new(invocation_id: SessionId, kind: TelemetryKind) -> Self {
        Self {
            invocation_id,
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum TelemetryKind {
    Begin {
        prompt: String,
        model_id: Option<String>,
    },
    Step {
        round: u32,
        tools: Vec<String>,
    },
    Message {
        message_id: MessageId,
        block_count: usize,
    },
    End {
        outcome: TelemetryOutcome,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum TelemetryOutcome {
    Completed,
    Cancelled,
    Failed { error: String },
}

/// Fire-and-forget receiver of lifecycle events. Delivery failures stay inside the sink.
pub trait TelemetrySink: Send + Sync {
    fn record(&self, event: TelemetryEvent);
}

/// Drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTelemetry;

impl TelemetrySink for NoopTelemetry {
    fn record(&self, _event: TelemetryEvent) {}
}

/// Writes events as structured log records.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn record(&self, event: TelemetryEvent) {
        let invocation_id = event.invocation_id;
        match event.kind {
            TelemetryKind::Begin { prompt, model_id } => tracing::info!(
                invocation_id = %invocation_id,
                prompt_len = prompt.len(),
                model_id = model_id.as_deref().unwrap_or("default"),
                "session started"
            ),
            TelemetryKind::Step { round, tools } => tracing::info!(
                invocation_id = %invocation_id,
                round,
                tools = ?tools,
                "tool round started"
            ),
            TelemetryKind::Message {
                message_id,
                block_count,
            } => tracing::debug!(
                invocation_id = %invocation_id,
                message_id = %message_id,
                block_count,
                "assistant message emitted"
            ),
            TelemetryKind::End { outcome } => match outcome {
                TelemetryOutcome::Failed { error } => tracing::warn!(
                    invocation_id = %invocation_id,
                    error = %error,
                    "session failed"
                ),
                outcome => tracing::info!(
                    invocation_id = %invocation_id,
                    outcome = ?outcome,
                    "session ended"
                ),
            },
        }
    }
}

/// Appends events to a durable queue on a background task.
pub struct QueueTelemetry {
    queue: Arc<dyn DurableQueue<TelemetryEvent>>,
}

impl QueueTelemetry {
    pub fn new(queue: Arc<dyn DurableQueue<TelemetryEvent>>) -> Self {
        Self { queue }
    }
}

impl TelemetrySink for QueueTelemetry {
    fn record(&self, event: TelemetryEvent) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(
                invocation_id = %event.invocation_id,
                "dropping telemetry event recorded outside a tokio runtime"
            );
            return;
        };

        let queue = Arc::clone(&self.queue);
        runtime.spawn(async move {
            let invocation_id = event.invocation_id;
            if let Err(error) = queue.append(vec![event]).await {
                tracing::warn!(
                    invocation_id = %invocation_id,
                    queue_id = %queue.id(),
                    error = %error,
                    "failed to append telemetry event"
                );
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use chatflow_storage::MemoryQueue;

    use super::*;

    #[tokio::test]
    async fn queue_telemetry_appends_in_the_background() {
        let queue = Arc::new(MemoryQueue::<TelemetryEvent>::new());
        let mut live = queue.subscribe();
        let sink = QueueTelemetry::new(queue.clone());

        let event = TelemetryEvent::new(
            SessionId::new_v7(),
            TelemetryKind::End {
                outcome: TelemetryOutcome::Completed,
            },
        );
        sink.record(event.clone());

        assert_eq!(live.recv().await.expect("event delivered"), event);
        assert_eq!(queue.read_all().await.expect("read"), vec![event]);
    }

    #[test]
    fn queue_telemetry_outside_a_runtime_is_dropped() {
        let queue = Arc::new(MemoryQueue::<TelemetryEvent>::new());
        let sink = QueueTelemetry::new(queue.clone());
        sink.record(TelemetryEvent::new(
            SessionId::new_v7(),
            TelemetryKind::Begin {
                prompt: "hi".to_string(),
                model_id: None,
            },
        ));

        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime");
        assert!(runtime.block_on(queue.is_empty()));
    }

    #[test]
    fn events_serialize_with_event_tags() {
        let event = TelemetryEvent::new(
            SessionId::new_v7(),
            TelemetryKind::Step {
                round: 1,
                tools: vec!["search".to_string()],
            },
        );
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["kind"]["event"], "step");
        assert_eq!(value["kind"]["round"], 1);
    }
}
