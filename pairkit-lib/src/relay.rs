//! Relay transport boundary.
//!
//! The core treats the relay as an unreliable byte channel that preserves
//! per-topic ordering. Concrete transports (websocket clients, in-memory
//! buses in tests) implement this trait and are injected at construction.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::Result;
use crate::types::Topic;

/// Raw wire frames as delivered by the relay.
pub type FrameReceiver = mpsc::UnboundedReceiver<Vec<u8>>;

/// A duplex publish/subscribe network client over opaque topic strings.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Publish a wire frame to every subscriber of the topic.
    async fn publish(&self, topic: &Topic, frame: Vec<u8>) -> Result<()>;

    /// Subscribe to a topic; frames arrive on the returned channel in
    /// relay-delivery order.
    async fn subscribe(&self, topic: &Topic) -> Result<FrameReceiver>;

    /// Stop delivery for a topic and close the channel handed out by
    /// `subscribe`, ending its reader. Unsubscribing an unknown topic is a
    /// no-op.
    async fn unsubscribe(&self, topic: &Topic) -> Result<()>;
}
