use chatflow_llm::ServiceError as ModelServiceError;
use snafu::Snafu;

/// Classification callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ServiceOverloaded,
    ServiceError,
    ToolExecutionError,
    ToolLoopExceeded,
    StructuredOutputError,
    /// Reported as a session outcome only. Never stored as a processor error.
    Cancelled,
}

/// Failure of a turn as observed through the processor.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ChatError {
    #[snafu(display("model service is overloaded, retry shortly: {message}"))]
    ServiceOverloaded {
        stage: &'static str,
        message: String,
    },
    #[snafu(display("AI service error on `{stage}`: {message}"))]
    Service {
        stage: &'static str,
        message: String,
    },
    #[snafu(display("required tool '{tool_name}' failed: {message}"))]
    ToolExecution {
        stage: &'static str,
        tool_name: String,
        message: String,
    },
    #[snafu(display("tool loop exceeded {max_rounds} rounds"))]
    ToolLoopExceeded {
        stage: &'static str,
        max_rounds: u32,
    },
    #[snafu(display("structured output unavailable on `{stage}`: {message}"))]
    StructuredOutput {
        stage: &'static str,
        message: String,
    },
}

impl ChatError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ServiceOverloaded { .. } => ErrorKind::ServiceOverloaded,
            Self::Service { .. } => ErrorKind::ServiceError,
            Self::ToolExecution { .. } => ErrorKind::ToolExecutionError,
            Self::ToolLoopExceeded { .. } => ErrorKind::ToolLoopExceeded,
            Self::StructuredOutput { .. } => ErrorKind::StructuredOutputError,
        }
    }

    pub fn stage(&self) -> &'static str {
        match self {
            Self::ServiceOverloaded { stage, .. }
            | Self::Service { stage, .. }
            | Self::ToolExecution { stage, .. }
            | Self::ToolLoopExceeded { stage, .. }
            | Self::StructuredOutput { stage, .. } => stage,
        }
    }

    /// Classifies a model service failure.
    pub fn from_service(stage: &'static str, error: &ModelServiceError) -> Self {
        let message = error.to_string();
        if error.is_overloaded() {
            Self::ServiceOverloaded { stage, message }
        } else {
            Self::Service { stage, message }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overloaded_service_errors_keep_their_kind() {
        let error = ModelServiceError::Overloaded {
            stage: "test",
            message: "busy".to_string(),
        };
        let classified = ChatError::from_service("model-stream", &error);
        assert_eq!(classified.kind(), ErrorKind::ServiceOverloaded);
        assert_eq!(classified.stage(), "model-stream");
    }

    #[test]
    fn other_service_errors_become_service_errors() {
        let error = ModelServiceError::from_message("test", "connection reset");
        assert_eq!(
            ChatError::from_service("model-stream", &error).kind(),
            ErrorKind::ServiceError
        );
    }

    #[test]
    fn overload_detection_reads_the_message_text() {
        let error = ModelServiceError::Inference {
            stage: "test",
            message: "upstream Overloaded".to_string(),
        };
        assert_eq!(
            ChatError::from_service("model-stream", &error).kind(),
            ErrorKind::ServiceOverloaded
        );
    }
}
