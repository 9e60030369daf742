use std::future::Future;
use std::pin::Pin;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::Snafu;
use tokio_util::sync::CancellationToken;

use super::message::{Block, Message};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Ordered output of one model call. The stream ends when the call is done.
pub type BlockStream = BoxStream<'static, ServiceResult<Block>>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ServiceError {
    #[snafu(display("model service is overloaded: {message}"))]
    Overloaded {
        stage: &'static str,
        message: String,
    },
    #[snafu(display("model inference failed on `{stage}`: {message}"))]
    Inference {
        stage: &'static str,
        message: String,
    },
    #[snafu(display("missing API key for provider '{provider_id}'"))]
    MissingApiKey {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("provider '{provider_id}' is not supported"))]
    UnsupportedProvider {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("model request has nothing to send"))]
    EmptyRequest { stage: &'static str },
    #[snafu(display("http client failed on `{stage}`, {source}"))]
    HttpClient {
        stage: &'static str,
        source: rig::http_client::Error,
    },
    #[snafu(display("completions failed on `{stage}`, {source}"))]
    CompletionsFailed {
        stage: &'static str,
        source: rig::completion::CompletionError,
    },
}

impl ServiceError {
    /// Builds the error for a failure reported as text, detecting overload responses.
    pub fn from_message(stage: &'static str, message: impl Into<String>) -> Self {
        let message = message.into();
        if message.to_ascii_lowercase().contains("overloaded") {
            Self::Overloaded { stage, message }
        } else {
            Self::Inference { stage, message }
        }
    }

    pub fn is_overloaded(&self) -> bool {
        match self {
            Self::Overloaded { .. } => true,
            Self::Inference { message, .. } => message.to_ascii_lowercase().contains("overloaded"),
            Self::CompletionsFailed { source, .. } => source
                .to_string()
                .to_ascii_lowercase()
                .contains("overloaded"),
            Self::MissingApiKey { .. }
            | Self::UnsupportedProvider { .. }
            | Self::EmptyRequest { .. }
            | Self::HttpClient { .. } => false,
        }
    }
}

/// Tool the model may call during a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON schema of the tool input.
    pub parameters: Value,
    /// A failure of a required tool fails the whole turn.
    #[serde(default)]
    pub required: bool,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            required: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Input to one model call.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    pub prompt: String,
    /// Committed conversation messages preceding the prompt.
    pub history: Vec<Message>,
    /// Blocks already produced earlier in this turn (tool calls and their results).
    pub progress: Vec<Block>,
    pub system_prompt: Option<String>,
    pub tools: Vec<ToolSpec>,
    pub model_id: Option<String>,
}

impl ModelRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            history: Vec::new(),
            progress: Vec::new(),
            system_prompt: None,
            tools: Vec::new(),
            model_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub call_id: String,
    pub name: String,
    pub input: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub))]
pub enum ToolError {
    #[snafu(display("tool '{tool_name}' is not registered"))]
    UnknownTool { tool_name: String },
    #[snafu(display("tool '{tool_name}' failed: {message}"))]
    Failed { tool_name: String, message: String },
}

/// Streams model output for a prompt.
pub trait ModelService: Send + Sync {
    /// Starts a model call. Cancelling the token stops the call; the stream then ends.
    fn run(&self, request: ModelRequest, cancel: CancellationToken) -> BlockStream;
}

/// Executes tools the model asked for.
pub trait ToolService: Send + Sync {
    fn execute<'a>(
        &'a self,
        invocation: ToolInvocation,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<Value, ToolError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overload_text_is_classified_case_insensitively() {
        assert!(ServiceError::from_message("test", "529 Overloaded").is_overloaded());
        assert!(ServiceError::from_message("test", "server overloaded, retry").is_overloaded());
        assert!(!ServiceError::from_message("test", "bad gateway").is_overloaded());
    }
}
