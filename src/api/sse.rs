//! Server-Sent Events support

use crate::identity::Identity;
use crate::runtime::OutboundMessage;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use serde_json::json;
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

/// Messages addressed to `identity`, starting with a `ready` event
pub fn sse_stream(
    identity: Identity,
    broadcast_rx: tokio::sync::broadcast::Receiver<OutboundMessage>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let ready = json!({ "type": "ready", "identity": identity });
    let init = futures::stream::once(async move {
        Ok(Event::default().event("ready").data(ready.to_string()))
    });

    let messages = BroadcastStream::new(broadcast_rx).filter_map(move |result| match result {
        Ok(message) if message.identity == identity => Some(Ok(message_event(&message))),
        Ok(_) => None,
        Err(e) => {
            tracing::warn!(%identity, error = %e, "Notification stream lagged");
            None
        }
    });

    Sse::new(init.chain(messages)).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

fn message_event(message: &OutboundMessage) -> Event {
    let data = json!({
        "type": "message",
        "text": message.text,
        "controls": message.controls,
    });
    Event::default().event("message").data(data.to_string())
}
