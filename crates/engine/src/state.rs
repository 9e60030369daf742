/// Lifecycle of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Requesting,
    Streaming,
    ToolExecuting,
    Completing,
    Completed,
    Cancelled,
    Failed,
}

/// Input driving the session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionTransition {
    /// A model call was dispatched.
    Dispatch,
    /// A block arrived from the model or the tool runner.
    Receive,
    /// The model call ended with tool calls to run.
    RunTools,
    /// The model call ended without tool calls, or a tool round submitted the
    /// structured result.
    Finish,
    Complete,
    Cancel,
    Fail,
}

/// Rejection reason for illegal session transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionTransitionRejection {
    Terminal(SessionState),
    Illegal {
        from: SessionState,
        transition: SessionTransition,
    },
}

pub type SessionTransitionResult = Result<SessionState, SessionTransitionRejection>;

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    /// Applies one transition deterministically.
    ///
    /// Terminal states accept nothing. `Cancel` and `Fail` are only valid while a
    /// model or tool call can still be in flight.
    pub fn apply(self, transition: SessionTransition) -> SessionTransitionResult {
        if self.is_terminal() {
            return Err(SessionTransitionRejection::Terminal(self));
        }

        let next = match (self, transition) {
            (Self::Idle | Self::ToolExecuting, SessionTransition::Dispatch) => Self::Requesting,
            (Self::Requesting | Self::Streaming | Self::ToolExecuting, SessionTransition::Receive) => {
                // Tool status and result blocks arrive while tools run.
                if self == Self::ToolExecuting {
                    Self::ToolExecuting
                } else {
                    Self::Streaming
                }
            }
            (Self::Streaming, SessionTransition::RunTools) => Self::ToolExecuting,
            (
                Self::Requesting | Self::Streaming | Self::ToolExecuting,
                SessionTransition::Finish,
            ) => Self::Completing,
            (Self::Completing, SessionTransition::Complete) => Self::Completed,
            (
                Self::Requesting | Self::Streaming | Self::ToolExecuting,
                SessionTransition::Cancel,
            ) => Self::Cancelled,
            (Self::Requesting | Self::Streaming | Self::ToolExecuting, SessionTransition::Fail) => {
                Self::Failed
            }
            (from, transition) => {
                return Err(SessionTransitionRejection::Illegal { from, transition });
            }
        };
        Ok(next)
    }
}
