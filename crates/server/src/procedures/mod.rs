//! Server-side handlers behind the procedure names in `rpc::api`.

use rpc::{Registry, RegistryError};
use services::services::ai::AiClient;

pub mod ai;
pub mod post;

pub fn registry(ai_client: &AiClient) -> Result<Registry, RegistryError> {
    Registry::builder()
        .merge(post::procedures())
        .merge(ai::procedures(ai_client.clone()))
        .build()
}
