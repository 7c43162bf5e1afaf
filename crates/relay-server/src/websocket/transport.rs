//! [`Transport`] over the write half of an axum WebSocket.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use futures::SinkExt;
use futures::stream::SplitSink;
use relay_core::CloseReason;
use relay_session::{Transport, TransportError};

/// Writes frames as WebSocket text messages.
pub struct WsTransport {
    sink: SplitSink<WebSocket, Message>,
}

impl WsTransport {
    /// Wrap the write half of a socket.
    pub fn new(sink: SplitSink<WebSocket, Message>) -> Self {
        Self { sink }
    }
}

/// WebSocket close code for a close reason.
pub fn close_code_for(reason: CloseReason) -> u16 {
    match reason {
        CloseReason::ClientClosed => close_code::NORMAL,
        CloseReason::SlowConsumer => close_code::POLICY,
        CloseReason::ResourcePressure => close_code::AGAIN,
        CloseReason::TransportError => close_code::ERROR,
        CloseReason::ServerShutdown => close_code::AWAY,
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, frame: Arc<String>) -> Result<(), TransportError> {
        self.sink
            .send(Message::Text(frame.as_str().into()))
            .await
            .map_err(|e| TransportError::Write(e.to_string()))
    }

    async fn close(&mut self, reason: CloseReason) {
        let frame = CloseFrame {
            code: close_code_for(reason),
            reason: reason.as_str().into(),
        };
        // The peer may already be gone.
        let _ = self.sink.send(Message::Close(Some(frame))).await;
        let _ = self.sink.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_codes_are_distinct() {
        let codes: std::collections::HashSet<u16> = [
            CloseReason::ClientClosed,
            CloseReason::SlowConsumer,
            CloseReason::ResourcePressure,
            CloseReason::TransportError,
            CloseReason::ServerShutdown,
        ]
        .into_iter()
        .map(close_code_for)
        .collect();
        assert_eq!(codes.len(), 5);
        assert_eq!(close_code_for(CloseReason::ServerShutdown), 1001);
    }
}
