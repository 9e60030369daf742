use chatflow_llm::{BlockPayload, Message, ToolSpec};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ChatError;

/// Shape the model must submit its final answer in.
///
/// The schema is offered to the model as a required tool. The session answers a
/// call to it itself and ends the turn; the call input is the structured result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl OutputSchema {
    pub const DEFAULT_NAME: &'static str = "submit_result";

    pub fn new(parameters: Value) -> Self {
        Self::named(
            Self::DEFAULT_NAME,
            "Submit the final result in the required format.",
            parameters,
        )
    }

    pub fn named(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }

    pub fn tool_spec(&self) -> ToolSpec {
        ToolSpec::new(
            self.name.clone(),
            self.description.clone(),
            self.parameters.clone(),
        )
        .required()
    }
}

/// Turn messages together with the decoded structured result.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuredReply<T> {
    pub messages: Vec<Message>,
    pub output: Result<T, ChatError>,
}

/// Decodes the input of the last call to `tool_name` found in `messages`.
pub fn extract_output<T: DeserializeOwned>(
    messages: &[Message],
    tool_name: &str,
) -> Result<T, ChatError> {
    let input = messages
        .iter()
        .rev()
        .flat_map(|message| message.blocks.iter().rev())
        .find_map(|block| match &block.payload {
            BlockPayload::ToolCall { name, input, .. } if name == tool_name => Some(input),
            _ => None,
        })
        .ok_or_else(|| ChatError::StructuredOutput {
            stage: "find-structured-output",
            message: format!("the turn has no call to '{tool_name}'"),
        })?;

    serde_json::from_value(input.clone()).map_err(|error| ChatError::StructuredOutput {
        stage: "decode-structured-output",
        message: error.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use chatflow_llm::{Block, Role};
    use serde_json::json;

    use super::*;
    use crate::error::ErrorKind;

    #[derive(Debug, PartialEq, Deserialize)]
    struct Forecast {
        city: String,
        celsius: i32,
    }

    fn turn(blocks: Vec<Block>) -> Vec<Message> {
        vec![
            Message::user_text("weather?"),
            Message::new(Role::Assistant, blocks),
        ]
    }

    #[test]
    fn the_last_submission_wins() {
        let messages = turn(vec![
            Block::tool_call("c1", "submit_result", json!({"city": "Oslo", "celsius": 1})),
            Block::tool_call("c2", "lookup", json!({"city": "Bergen"})),
            Block::tool_call("c3", "submit_result", json!({"city": "Oslo", "celsius": 3})),
        ]);

        let forecast: Forecast = extract_output(&messages, "submit_result").expect("decoded");
        assert_eq!(
            forecast,
            Forecast {
                city: "Oslo".to_string(),
                celsius: 3,
            }
        );
    }

    #[test]
    fn missing_submissions_are_reported() {
        let messages = turn(vec![Block::text("It is cold.")]);
        let error = extract_output::<Forecast>(&messages, "submit_result").expect_err("missing");
        assert_eq!(error.kind(), ErrorKind::StructuredOutputError);
        assert_eq!(error.stage(), "find-structured-output");
    }

    #[test]
    fn mismatched_inputs_fail_to_decode() {
        let messages = turn(vec![Block::tool_call(
            "c1",
            "submit_result",
            json!({"city": "Oslo"}),
        )]);
        let error = extract_output::<Forecast>(&messages, "submit_result").expect_err("mismatch");
        assert_eq!(error.stage(), "decode-structured-output");
    }

    #[test]
    fn the_schema_is_offered_as_a_required_tool() {
        let schema = OutputSchema::new(json!({"type": "object"}));
        let tool = schema.tool_spec();
        assert_eq!(tool.name, OutputSchema::DEFAULT_NAME);
        assert!(tool.required);
    }
}
