//! Minimal sender/receiver seams towards the surrounding IO plumbing.
//!
//! The production system wires these to its connection manager; the crate
//! ships bounded-channel implementations that are used by the emulator, the
//! tests and any in-process deployment. Senders towards congested peers
//! never block the data path: frame sends are try-only with the drop counted
//! by the caller, fragment and time-sync sends carry an explicit timeout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::RwLock;
use thiserror::Error;

use crate::types::{DataRequest, Fragment, TimeSync};

/// Why a send towards a downstream connection did not complete.
#[derive(Error, Debug)]
pub enum SendError {
    #[error("downstream queue is full")]
    Full,
    #[error("send timed out after {0:?}")]
    Timeout(Duration),
    #[error("downstream connection is closed")]
    Disconnected,
    #[error("no such destination: {0}")]
    UnknownDestination(String),
}

/// Pull side of a raw-frame connection.
pub trait FrameReceiver<F>: Send + Sync {
    /// Waits up to `timeout` for the next frame. A timeout is not an error.
    fn try_receive(&self, timeout: Duration) -> Option<F>;
}

/// Push side of a raw-frame connection. Never blocks; a full queue hands the
/// frame back so the caller can count the drop.
pub trait FrameSender<F>: Send + Sync {
    fn try_send(&self, frame: F) -> std::result::Result<(), F>;
}

/// Pull side of the data-request connection.
pub trait RequestReceiver: Send + Sync {
    fn try_receive(&self, timeout: Duration) -> Option<DataRequest>;
}

/// Fragment output, routed by the destination string embedded in each
/// request.
pub trait FragmentSender: Send + Sync {
    fn send(
        &self,
        destination: &str,
        fragment: Fragment,
        timeout: Duration,
    ) -> std::result::Result<(), SendError>;
}

/// Time-sync beacon output.
pub trait TimeSyncSender: Send + Sync {
    fn send(&self, message: TimeSync, timeout: Duration) -> std::result::Result<(), SendError>;
}

// ---------------------------------------------------------------------------
// Bounded-channel implementations
// ---------------------------------------------------------------------------

/// Creates a bounded raw-frame connection.
pub fn frame_channel<F: Send>(capacity: usize) -> (ChannelFrameSender<F>, ChannelFrameReceiver<F>) {
    let (tx, rx) = bounded(capacity);
    (ChannelFrameSender { tx }, ChannelFrameReceiver { rx })
}

#[derive(Clone)]
pub struct ChannelFrameSender<F> {
    tx: Sender<F>,
}

impl<F: Send> FrameSender<F> for ChannelFrameSender<F> {
    fn try_send(&self, frame: F) -> std::result::Result<(), F> {
        self.tx.try_send(frame).map_err(|err| match err {
            TrySendError::Full(frame) | TrySendError::Disconnected(frame) => frame,
        })
    }
}

#[derive(Clone)]
pub struct ChannelFrameReceiver<F> {
    rx: Receiver<F>,
}

impl<F: Send> FrameReceiver<F> for ChannelFrameReceiver<F> {
    fn try_receive(&self, timeout: Duration) -> Option<F> {
        self.rx.recv_timeout(timeout).ok()
    }
}

/// Creates a bounded data-request connection.
pub fn request_channel(capacity: usize) -> (Sender<DataRequest>, ChannelRequestReceiver) {
    let (tx, rx) = bounded(capacity);
    (tx, ChannelRequestReceiver { rx })
}

#[derive(Clone)]
pub struct ChannelRequestReceiver {
    rx: Receiver<DataRequest>,
}

impl RequestReceiver for ChannelRequestReceiver {
    fn try_receive(&self, timeout: Duration) -> Option<DataRequest> {
        self.rx.recv_timeout(timeout).ok()
    }
}

/// Fragment router over named bounded channels. Destinations are registered
/// up front; a send to an unknown name fails without blocking.
#[derive(Default)]
pub struct ChannelFragmentSender {
    destinations: RwLock<HashMap<String, Sender<Fragment>>>,
}

impl ChannelFragmentSender {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers `name` and returns the matching receive side.
    pub fn add_destination(&self, name: &str, capacity: usize) -> Receiver<Fragment> {
        let (tx, rx) = bounded(capacity);
        self.destinations.write().insert(name.to_owned(), tx);
        rx
    }
}

impl FragmentSender for ChannelFragmentSender {
    fn send(
        &self,
        destination: &str,
        fragment: Fragment,
        timeout: Duration,
    ) -> std::result::Result<(), SendError> {
        let tx = {
            let destinations = self.destinations.read();
            destinations
                .get(destination)
                .cloned()
                .ok_or_else(|| SendError::UnknownDestination(destination.to_owned()))?
        };
        tx.send_timeout(fragment, timeout).map_err(|err| match err {
            crossbeam_channel::SendTimeoutError::Timeout(_) => SendError::Timeout(timeout),
            crossbeam_channel::SendTimeoutError::Disconnected(_) => SendError::Disconnected,
        })
    }
}

/// Creates a bounded time-sync connection.
pub fn timesync_channel(capacity: usize) -> (ChannelTimeSyncSender, Receiver<TimeSync>) {
    let (tx, rx) = bounded(capacity);
    (ChannelTimeSyncSender { tx }, rx)
}

#[derive(Clone)]
pub struct ChannelTimeSyncSender {
    tx: Sender<TimeSync>,
}

impl TimeSyncSender for ChannelTimeSyncSender {
    fn send(&self, message: TimeSync, timeout: Duration) -> std::result::Result<(), SendError> {
        self.tx.send_timeout(message, timeout).map_err(|err| match err {
            crossbeam_channel::SendTimeoutError::Timeout(_) => SendError::Timeout(timeout),
            crossbeam_channel::SendTimeoutError::Disconnected(_) => SendError::Disconnected,
        })
    }
}
