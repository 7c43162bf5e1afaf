//! A single live client connection and its writer task.
//!
//! Every connection owns a bounded single-consumer queue. Producers enqueue
//! serialized frames with [`Connection::enqueue`]; one writer task drains the
//! queue and writes to the [`Transport`] strictly in enqueue order. Closing
//! cancels the writer and discards whatever is still queued.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use metrics::counter;
use parking_lot::Mutex;
use relay_core::{CloseReason, ConnectionId, ConnectionState, DispatchError, UserId};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, warn};

use crate::metrics::EVENTS_DROPPED_TOTAL;
use crate::transport::Transport;

/// Registered client connection.
pub struct Connection {
    id: ConnectionId,
    user_id: UserId,
    state: AtomicU8,
    created_at: Instant,
    last_activity: Mutex<Instant>,
    tx: mpsc::Sender<Arc<String>>,
    capacity: usize,
    close_reason: Mutex<Option<CloseReason>>,
    /// Cancels the writer loop.
    cancel: CancellationToken,
    /// Fires once the transport has been released.
    done: CancellationToken,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl Connection {
    /// Create a connection and spawn its writer task.
    ///
    /// Must be called from within a Tokio runtime. `capacity` is clamped to
    /// at least 1.
    pub fn open(
        id: ConnectionId,
        user_id: UserId,
        transport: Box<dyn Transport>,
        capacity: usize,
    ) -> Arc<Self> {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let now = Instant::now();
        let connection = Arc::new(Self {
            id,
            user_id,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            created_at: now,
            last_activity: Mutex::new(now),
            tx,
            capacity,
            close_reason: Mutex::new(None),
            cancel: CancellationToken::new(),
            done: CancellationToken::new(),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        });

        let span = info_span!("writer", conn_id = %connection.id, user_id = %connection.user_id);
        drop(tokio::spawn(
            run_writer(Arc::clone(&connection), rx, transport).instrument(span),
        ));
        connection
    }

    /// Connection ID.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Owning user.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether the connection still accepts events.
    pub fn is_open(&self) -> bool {
        !self.state().is_closed()
    }

    /// When the connection was registered.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Last inbound frame or successful enqueue.
    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    /// Record client activity.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Time since the last activity, measured at `now`.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity())
    }

    /// Frames currently waiting in the outbound queue.
    pub fn queued(&self) -> usize {
        self.capacity.saturating_sub(self.tx.capacity())
    }

    /// Outbound queue bound.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames written to the transport.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Frames rejected or discarded.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Why the connection was closed, once it has been.
    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.lock()
    }

    /// Queue a serialized frame for the writer task.
    ///
    /// Never blocks. A full queue closes the connection with
    /// [`CloseReason::SlowConsumer`].
    pub fn enqueue(&self, frame: Arc<String>) -> Result<(), DispatchError> {
        if !self.is_open() {
            return Err(DispatchError::Closed(self.id.clone()));
        }
        match self.tx.try_send(frame) {
            Ok(()) => {
                self.touch();
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    conn_id = %self.id,
                    user_id = %self.user_id,
                    capacity = self.capacity,
                    "outbound queue full, closing slow consumer"
                );
                let _ = self.close(CloseReason::SlowConsumer);
                Err(DispatchError::SlowConsumer(self.id.clone()))
            }
            Err(TrySendError::Closed(_)) => {
                let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(DispatchError::Closed(self.id.clone()))
            }
        }
    }

    /// Begin closing. Returns `false` if the connection was already closing.
    ///
    /// The first caller's reason wins.
    pub fn close(&self, reason: CloseReason) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if ConnectionState::from_u8(current).is_closed() {
                return false;
            }
            match self.state.compare_exchange(
                current,
                ConnectionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        *self.close_reason.lock() = Some(reason);
        debug!(conn_id = %self.id, user_id = %self.user_id, %reason, "closing connection");
        self.cancel.cancel();
        true
    }

    /// Wait until the writer task has released the transport.
    pub async fn closed(&self) {
        self.done.cancelled().await;
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("state", &self.state())
            .field("queued", &self.queued())
            .finish_non_exhaustive()
    }
}

async fn run_writer(
    connection: Arc<Connection>,
    mut rx: mpsc::Receiver<Arc<String>>,
    mut transport: Box<dyn Transport>,
) {
    let _ = connection.state.compare_exchange(
        ConnectionState::Connecting as u8,
        ConnectionState::Open as u8,
        Ordering::AcqRel,
        Ordering::Acquire,
    );

    loop {
        let frame = tokio::select! {
            biased;
            () = connection.cancel.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let result = tokio::select! {
            biased;
            () = connection.cancel.cancelled() => break,
            result = transport.send(frame) => result,
        };
        match result {
            Ok(()) => {
                let _ = connection.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                warn!(error = %e, "transport write failed");
                let _ = connection.close(CloseReason::TransportError);
                break;
            }
        }
    }

    // Anything still queued is discarded, never written.
    rx.close();
    let mut discarded = 0_u64;
    while rx.try_recv().is_ok() {
        discarded += 1;
    }
    if discarded > 0 {
        let _ = connection.dropped.fetch_add(discarded, Ordering::Relaxed);
        counter!(EVENTS_DROPPED_TOTAL, "reason" => "connection_closed").increment(discarded);
        debug!(discarded, "discarded queued frames on close");
    }

    let reason = connection.close_reason().unwrap_or(CloseReason::ClientClosed);
    let _ = connection.close(reason);
    transport.close(reason).await;
    connection
        .state
        .store(ConnectionState::Closed as u8, Ordering::Release);
    connection.done.cancel();
}
