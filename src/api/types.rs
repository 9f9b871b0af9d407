//! API request and response types

use crate::identity::Identity;
use crate::state_machine::Selection;
use serde::{Deserialize, Serialize};

/// One inbound event from a chat client
#[derive(Debug, Deserialize)]
pub struct EventRequest {
    pub identity: Identity,
    #[serde(flatten)]
    pub body: EventBody,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventBody {
    Text { text: String },
    Selection { selection: Selection },
    /// `data` is base64
    Attachment { media_type: String, data: String },
}

/// Query for the notification stream
#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub identity: Identity,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub active_workers: usize,
    pub active_conversations: usize,
    pub unresolved_payments: usize,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }
}
