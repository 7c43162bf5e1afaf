//! Event fan-out to a user's connections.
//!
//! An event is encoded once and the same frame is enqueued on every open
//! connection of the target user. Enqueueing never blocks; ordering within a
//! connection is the queue's FIFO order. Causal ordering across an
//! execution's events is the producer's job (see [`crate::driver`]).

use std::sync::Arc;

use metrics::counter;
use relay_core::{CloseReason, ConnectionId, DispatchError, UserId, WireEvent};
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::metrics::{
    EVENTS_DISPATCHED_TOTAL, EVENTS_DROPPED_TOTAL, SLOW_CONSUMER_DISCONNECTS_TOTAL,
};
use crate::registry::ConnectionRegistry;

/// Serializes events and routes them to connections.
#[derive(Debug)]
pub struct EventDispatcher {
    registry: Arc<ConnectionRegistry>,
}

impl EventDispatcher {
    /// Create a dispatcher over `registry`.
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Deliver `event` to every open connection owned by `user_id`.
    ///
    /// Returns the number of connections the event was enqueued on. With no
    /// open connection the event is dropped and `NoConnection` is returned;
    /// callers treat that as non-fatal.
    pub fn send(&self, user_id: &UserId, event: &WireEvent) -> Result<usize, DispatchError> {
        let frame = encode(event)?;
        let mut delivered = 0;
        for connection in self.registry.open_connections(user_id) {
            if self.enqueue(&connection, Arc::clone(&frame)).is_ok() {
                delivered += 1;
            }
        }

        if delivered == 0 {
            counter!(EVENTS_DROPPED_TOTAL, "reason" => "no_connection").increment(1);
            debug!(user_id = %user_id, event = %event.event, "no open connection, event dropped");
            return Err(DispatchError::NoConnection(user_id.clone()));
        }
        counter!(EVENTS_DISPATCHED_TOTAL, "event" => event.event.as_str()).increment(1);
        debug!(user_id = %user_id, event = %event.event, recipients = delivered, "event dispatched");
        Ok(delivered)
    }

    /// Deliver `event` to one connection.
    pub fn send_to_connection(
        &self,
        connection_id: &ConnectionId,
        event: &WireEvent,
    ) -> Result<(), DispatchError> {
        let frame = encode(event)?;
        let connection = self
            .registry
            .get(connection_id)
            .ok_or_else(|| DispatchError::ConnectionNotFound(connection_id.clone()))?;
        self.enqueue(&connection, frame)?;
        counter!(EVENTS_DISPATCHED_TOTAL, "event" => event.event.as_str()).increment(1);
        Ok(())
    }

    /// The registry this dispatcher routes through.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    fn enqueue(&self, connection: &Connection, frame: Arc<String>) -> Result<(), DispatchError> {
        let result = connection.enqueue(frame);
        match &result {
            Ok(()) => {}
            Err(DispatchError::SlowConsumer(id)) => {
                counter!(SLOW_CONSUMER_DISCONNECTS_TOTAL).increment(1);
                counter!(EVENTS_DROPPED_TOTAL, "reason" => CloseReason::SlowConsumer.as_str())
                    .increment(1);
                // Already closed by the connection; only the bookkeeping remains.
                if self.registry.remove(id).is_ok() {
                    warn!(
                        conn_id = %id,
                        user_id = %connection.user_id(),
                        "slow consumer disconnected"
                    );
                }
            }
            Err(e) => {
                counter!(EVENTS_DROPPED_TOTAL, "reason" => "closed").increment(1);
                debug!(conn_id = %connection.id(), error = %e, "skipping closed connection");
            }
        }
        result
    }
}

/// Encode an event once for every recipient.
///
/// Payload substitution happens when the event is built, so a failure here
/// means the envelope itself is broken.
fn encode(event: &WireEvent) -> Result<Arc<String>, DispatchError> {
    event.encode().map(Arc::new).map_err(|e| {
        warn!(event = %event.event, error = %e, "event encoding failed");
        DispatchError::Serialization(e.to_string())
    })
}
