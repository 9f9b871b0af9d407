//! HTTP transport for the tutoring desk
//!
//! Inbound events are posted as JSON; outbound messages stream back over SSE.

mod handlers;
mod sse;
mod types;

pub use handlers::create_router;
#[allow(unused_imports)] // Public API re-exports
pub use types::*;

use crate::runtime::{BroadcastNotifier, Dispatcher};
use std::sync::Arc;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub notifier: BroadcastNotifier,
}

impl AppState {
    pub fn new(dispatcher: Arc<Dispatcher>, notifier: BroadcastNotifier) -> Self {
        Self {
            dispatcher,
            notifier,
        }
    }
}
