//! Overlay network contract
//!
//! The overlay moves [`Message`]s between peers. It offers fire-and-forget
//! delivery (`unicast`, `multicast`) and request/reply (`forward`,
//! `request`). One-way messages from one sender reach a receiver in the
//! order they were sent.

pub mod local;

pub use local::{LocalNetwork, LocalOverlay};

use crate::Result;
use async_trait::async_trait;
use plexus_protocol::{Message, PeerId};
use std::sync::Weak;
use std::time::Duration;

/// Receiving side of the overlay, implemented by a node
#[async_trait]
pub trait InboundHandler: Send + Sync + 'static {
    /// One-way message
    async fn on_message(&self, msg: Message);

    /// Request expecting a reply
    async fn on_request(&self, msg: Message) -> Result<Message>;

    /// A peer left the overlay
    async fn on_peer_departed(&self, peer: PeerId);
}

/// Transport between peers
#[async_trait]
pub trait Overlay: Send + Sync + 'static {
    /// Id of the local peer
    fn local_id(&self) -> PeerId;

    /// One-way message to one peer
    async fn unicast(&self, to: PeerId, msg: Message) -> Result<()>;

    /// One-way message to every other peer
    async fn multicast(&self, msg: Message) -> Result<()>;

    /// Request/reply without a deadline
    async fn forward(&self, to: PeerId, msg: Message) -> Result<Message>;

    /// Request/reply bounded by `timeout`; expiry is [`crate::Error::TimedOut`]
    async fn request(&self, to: PeerId, msg: Message, timeout: Duration) -> Result<Message>;

    /// Route inbound traffic to `handler`
    fn bind(&self, handler: Weak<dyn InboundHandler>);
}
