//! Content model and collaborator contracts shared by the chatflow engine.

use std::sync::Arc;

mod ids;
mod message;
mod provider;
mod rig_adapter;
mod service;

pub use ids::{MessageId, SessionId};
pub use message::{Block, BlockId, BlockPayload, Message, Role, Sender, ToolOutcome, Usage};
pub use provider::ProviderConfig;
pub use rig_adapter::{DEFAULT_OPENAI_MODEL, RIG_OPENAI_PROVIDER_ID, RigModelService};
pub use service::{
    BlockStream, BoxFuture, ModelRequest, ModelService, ServiceError, ServiceResult, ToolError,
    ToolInvocation, ToolService, ToolSpec,
};

pub fn create_model_service(mut config: ProviderConfig) -> ServiceResult<Arc<dyn ModelService>> {
    if config.provider_id.trim().is_empty() {
        config.provider_id = RIG_OPENAI_PROVIDER_ID.to_string();
    }

    match config.provider_id.as_str() {
        "openai" | "rig-openai" => {
            config.provider_id = RIG_OPENAI_PROVIDER_ID.to_string();
            Ok(Arc::new(RigModelService::new(config)?))
        }
        _ => Err(ServiceError::UnsupportedProvider {
            stage: "create-model-service",
            provider_id: config.provider_id,
        }),
    }
}
