use crate::app_state::HttpServerState;
use crate::config::RelayInfoSettings;
use axum::{extract::State, response::Json};
use serde::Serialize;
use std::sync::Arc;

/// NIP-11 relay information document.
#[derive(Debug, Clone, Serialize)]
pub struct RelayInfoDocument {
    pub name: String,
    pub description: String,
    pub pubkey: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
    pub supported_nips: Vec<u32>,
    pub software: String,
    pub version: String,
}

impl RelayInfoDocument {
    pub fn new(settings: &RelayInfoSettings, relay_pubkey: String) -> Self {
        Self {
            name: settings.name.clone(),
            description: settings.description.clone(),
            pubkey: relay_pubkey,
            contact: settings.contact.clone(),
            supported_nips: settings.supported_nips.clone(),
            software: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

pub async fn handle_nostr_json(
    State(state): State<Arc<HttpServerState>>,
) -> Json<RelayInfoDocument> {
    Json(state.relay_info.clone())
}

pub async fn handle_health() -> &'static str {
    "OK"
}
