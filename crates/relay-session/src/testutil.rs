//! In-memory transport and sampler for driving the core without sockets.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use relay_core::{CloseReason, SampleError, WireEvent};
use tokio::sync::Notify;

use crate::pressure::{ResourceSample, ResourceSampler};
use crate::transport::{Transport, TransportError};

#[derive(Default)]
struct RecordingInner {
    frames: Mutex<Vec<String>>,
    close_reason: Mutex<Option<CloseReason>>,
    changed: Notify,
}

/// Inspection handle for a [`RecordingTransport`].
#[derive(Clone, Default)]
pub struct Recording {
    inner: Arc<RecordingInner>,
}

impl Recording {
    /// Frames written so far, in write order.
    pub fn frames(&self) -> Vec<String> {
        self.inner.frames.lock().clone()
    }

    /// Written frames decoded as wire events. Undecodable frames are skipped.
    pub fn events(&self) -> Vec<WireEvent> {
        self.inner
            .frames
            .lock()
            .iter()
            .filter_map(|f| WireEvent::decode(f).ok())
            .collect()
    }

    /// Number of frames written.
    pub fn len(&self) -> usize {
        self.inner.frames.lock().len()
    }

    /// Whether nothing was written.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The reason passed to [`Transport::close`], once called.
    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.inner.close_reason.lock()
    }

    /// Wait until at least `count` frames have been written.
    pub async fn wait_for_frames(&self, count: usize) {
        loop {
            let notified = self.inner.changed.notified();
            if self.len() >= count {
                return;
            }
            notified.await;
        }
    }

    /// Wait until the transport has been closed.
    pub async fn wait_closed(&self) {
        loop {
            let notified = self.inner.changed.notified();
            if self.close_reason().is_some() {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Clone, Copy)]
enum Mode {
    Record,
    Stall,
    FailAfter(usize),
}

/// Transport that records every frame in memory.
pub struct RecordingTransport {
    recording: Recording,
    mode: Mode,
}

impl RecordingTransport {
    /// A transport that accepts every write immediately.
    pub fn new() -> (Self, Recording) {
        Self::with_mode(Mode::Record)
    }

    /// A transport whose writes never complete, simulating a stuck client.
    pub fn stalled() -> (Self, Recording) {
        Self::with_mode(Mode::Stall)
    }

    /// A transport that accepts `count` writes and then fails.
    pub fn failing_after(count: usize) -> (Self, Recording) {
        Self::with_mode(Mode::FailAfter(count))
    }

    fn with_mode(mode: Mode) -> (Self, Recording) {
        let recording = Recording::default();
        (
            Self {
                recording: recording.clone(),
                mode,
            },
            recording,
        )
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&mut self, frame: Arc<String>) -> Result<(), TransportError> {
        match self.mode {
            Mode::Stall => std::future::pending::<()>().await,
            Mode::FailAfter(count) if self.recording.len() >= count => {
                return Err(TransportError::Write("injected failure".into()));
            }
            Mode::Record | Mode::FailAfter(_) => {}
        }
        self.recording.inner.frames.lock().push((*frame).clone());
        self.recording.inner.changed.notify_waiters();
        Ok(())
    }

    async fn close(&mut self, reason: CloseReason) {
        *self.recording.inner.close_reason.lock() = Some(reason);
        self.recording.inner.changed.notify_waiters();
    }
}

/// Sampler returning a preset reading.
pub struct FixedSampler {
    reading: Mutex<Result<ResourceSample, SampleError>>,
}

impl FixedSampler {
    /// Report `connections` and `memory_bytes` until changed.
    pub fn new(connections: usize, memory_bytes: u64) -> Self {
        Self {
            reading: Mutex::new(Ok(ResourceSample {
                connections,
                memory_bytes,
            })),
        }
    }

    /// Change the reported reading.
    pub fn set(&self, connections: usize, memory_bytes: u64) {
        *self.reading.lock() = Ok(ResourceSample {
            connections,
            memory_bytes,
        });
    }

    /// Make subsequent samples fail.
    pub fn fail(&self, message: &str) {
        *self.reading.lock() = Err(SampleError::Unavailable(message.to_string()));
    }
}

impl ResourceSampler for FixedSampler {
    fn sample(&self) -> Result<ResourceSample, SampleError> {
        self.reading.lock().clone()
    }
}
