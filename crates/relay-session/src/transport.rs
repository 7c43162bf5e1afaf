//! Outbound transport abstraction.
//!
//! A [`Transport`] is owned by exactly one connection writer task. The
//! registry never touches it directly.

use std::sync::Arc;

use async_trait::async_trait;
use relay_core::CloseReason;
use thiserror::Error;

/// Transport write failure.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The peer is gone.
    #[error("transport closed")]
    Closed,
    /// The write failed for another reason.
    #[error("transport write failed: {0}")]
    Write(String),
}

/// A bidirectional client session's outbound half.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Write one serialized event frame.
    async fn send(&mut self, frame: Arc<String>) -> Result<(), TransportError>;

    /// Release the transport, telling the peer why. Must not fail.
    async fn close(&mut self, reason: CloseReason);
}
