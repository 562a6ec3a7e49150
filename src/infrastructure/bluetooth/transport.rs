//! Transport abstraction
//!
//! The coordinator only ever talks to a device through this trait. Discovery,
//! pairing and link-layer addressing stay behind it.

use crate::error::TransportError;
use async_trait::async_trait;
use tokio::sync::watch;

/// Physical link state as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Up,
    Down,
}

/// Receives the raw payload of every pushed notification.
pub type NotifyCallback = Box<dyn Fn(Vec<u8>) + Send + Sync>;

/// Capability set of a GATT link to one remote device.
///
/// Contract:
/// - once `connect` returns `Ok`, [`link_status`](Transport::link_status)
///   reads [`LinkStatus::Up`] until the link is lost or `disconnect` is called;
/// - notification callbacks only fire between a successful `connect` and the
///   next `disconnect` (or link loss), and are forgotten afterwards.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the link. Succeeds immediately when already connected.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Release the link. Safe to call repeatedly.
    async fn disconnect(&self);

    async fn read(&self, characteristic_id: &str) -> Result<Vec<u8>, TransportError>;

    async fn write(&self, characteristic_id: &str, bytes: &[u8]) -> Result<(), TransportError>;

    async fn subscribe(
        &self,
        characteristic_id: &str,
        on_notify: NotifyCallback,
    ) -> Result<(), TransportError>;

    /// Link state changes, observed by the coordinator to detect link loss.
    fn link_status(&self) -> watch::Receiver<LinkStatus>;
}
