//! The bidirectional message channel to upstream.
//!
//! [`Channel`] is the transport seam: anything that can emit an event and
//! hand back the acknowledgment payload. [`forward`] is the pump that drains
//! the outbox through a channel.

use crate::{
    emitter::{DeliveryResult, Envelope},
    error::Result,
    message::{ChangeMessage, OutboundChange},
    Error,
};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A connection that can emit an event and wait for its acknowledgment.
#[async_trait]
pub trait Channel: Send {
    /// Emit `payload` under `event`; resolves to the acknowledgment payload.
    async fn send(&mut self, event: &str, payload: Value) -> Result<Value>;
}

/// Send one change and decode its acknowledgment.
pub async fn deliver<C: Channel + ?Sized>(
    channel: &mut C,
    change: &OutboundChange,
) -> DeliveryResult {
    let payload = serde_json::to_value(change).map_err(|e| Error::Channel(e.to_string()))?;
    let ack = channel.send(change.event(), payload).await?;
    change.acknowledgment(ack)
}

/// Drain the outbox through `channel`, one change at a time in queue order.
///
/// Each decoded acknowledgment completes the change's delivery and is
/// forwarded to `inbound` for the db owner to reconcile. Returns when the
/// outbox is closed.
pub async fn forward<C: Channel>(
    mut channel: C,
    mut outbox: mpsc::UnboundedReceiver<Envelope>,
    inbound: mpsc::UnboundedSender<ChangeMessage>,
) {
    while let Some(Envelope { change, reply }) = outbox.recv().await {
        let result = deliver(&mut channel, &change).await;
        match &result {
            Ok(Some(message)) => {
                if inbound.send(message.clone()).is_err() {
                    debug!("inbound queue closed, acknowledgment not forwarded");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(
                collection = %change.collection,
                kind = %change.kind,
                error = %e,
                "change not delivered"
            ),
        }
        // the caller may have dropped its delivery handle
        let _ = reply.send(result);
    }
    debug!("outbox closed, channel pump stopping");
}
