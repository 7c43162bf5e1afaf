//! One WebSocket from upgrade through disconnect.
//!
//! 1. The first frame must be `{"type":"authenticate","token":...}`, within
//!    the configured timeout
//! 2. The socket's write half becomes the connection's transport and the
//!    connection is registered for the verified user
//! 3. Inbound frames refresh activity until the client leaves or the
//!    connection is closed from the server side
//! 4. The connection is unregistered

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use relay_core::{CloseReason, InboundMessage, UserId};
use relay_session::SessionHub;
use tracing::{Span, debug, info, instrument, warn};

use super::transport::WsTransport;
use crate::auth::{AuthError, IdentityVerifier};

/// Run a socket session to completion.
#[instrument(skip_all, fields(user_id = tracing::field::Empty, conn_id = tracing::field::Empty))]
pub async fn run_ws_session(
    socket: WebSocket,
    hub: Arc<SessionHub>,
    verifier: Arc<dyn IdentityVerifier>,
    auth_timeout: Duration,
) {
    let (mut sink, mut stream) = socket.split();

    let user_id = match authenticate(&mut stream, verifier.as_ref(), auth_timeout).await {
        Ok(user_id) => user_id,
        Err(e) => {
            warn!(error = %e, "authentication failed");
            reject(&mut sink, &e).await;
            return;
        }
    };
    let _ = Span::current().record("user_id", tracing::field::display(&user_id));

    let connection = match hub.connect(user_id, Box::new(WsTransport::new(sink))) {
        Ok(connection) => connection,
        Err(e) => {
            warn!(error = %e, "connection registration failed");
            return;
        }
    };
    let _ = Span::current().record("conn_id", tracing::field::display(connection.id()));

    let reason = loop {
        tokio::select! {
            biased;
            () = connection.closed() => {
                break connection.close_reason().unwrap_or(CloseReason::ClientClosed);
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    connection.touch();
                    handle_text(text.as_str());
                }
                Some(Ok(Message::Binary(_) | Message::Ping(_) | Message::Pong(_))) => {
                    connection.touch();
                }
                Some(Ok(Message::Close(_))) | None => break CloseReason::ClientClosed,
                Some(Err(e)) => {
                    debug!(error = %e, "socket read failed");
                    break CloseReason::TransportError;
                }
            },
        }
    };

    // Already unregistered if the server closed it; the first close reason sticks.
    if hub.disconnect(connection.id(), reason).is_ok() {
        info!(reason = %reason, "client left");
    }
}

async fn authenticate(
    stream: &mut SplitStream<WebSocket>,
    verifier: &dyn IdentityVerifier,
    auth_timeout: Duration,
) -> Result<UserId, AuthError> {
    let first = tokio::time::timeout(auth_timeout, next_text(stream))
        .await
        .map_err(|_| AuthError::Timeout)??;
    match serde_json::from_str::<InboundMessage>(&first) {
        Ok(InboundMessage::Authenticate { token }) => verifier.verify(&token).await,
        Ok(other) => Err(AuthError::Malformed(format!("{other:?}"))),
        Err(e) => Err(AuthError::Malformed(e.to_string())),
    }
}

/// Next text frame, skipping control frames.
async fn next_text(stream: &mut SplitStream<WebSocket>) -> Result<String, AuthError> {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => return Ok(text.to_string()),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            Some(Ok(Message::Binary(_))) => {
                return Err(AuthError::Malformed("binary frame".into()));
            }
            Some(Ok(Message::Close(_)) | Err(_)) | None => return Err(AuthError::Closed),
        }
    }
}

async fn reject(sink: &mut SplitSink<WebSocket, Message>, error: &AuthError) {
    if *error == AuthError::Closed {
        return;
    }
    let frame = CloseFrame {
        code: close_code::POLICY,
        reason: error.as_str().into(),
    };
    let _ = sink.send(Message::Close(Some(frame))).await;
    let _ = sink.close().await;
}

fn handle_text(text: &str) {
    match serde_json::from_str::<InboundMessage>(text) {
        Ok(InboundMessage::Ping) => {}
        Ok(InboundMessage::Authenticate { .. }) => debug!("ignoring repeated authenticate"),
        Err(e) => debug!(error = %e, "ignoring unrecognized inbound frame"),
    }
}
