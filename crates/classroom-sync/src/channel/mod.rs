use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace};

use crate::protocol::ChannelMessage;
use crate::{SyncError, SyncResult};

#[cfg(feature = "client")]
pub mod client;

#[cfg(feature = "client")]
pub use client::{ClassroomClient, ClientConfig};

/// Default number of inbound messages buffered per subscriber
pub const DEFAULT_INBOUND_CAPACITY: usize = 256;

/// Connection state of a classroom channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReadyState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ReadyState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ReadyState::Connecting,
            1 => ReadyState::Open,
            2 => ReadyState::Closing,
            _ => ReadyState::Closed,
        }
    }
}

impl fmt::Display for ReadyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReadyState::Connecting => "Connecting",
            ReadyState::Open => "Open",
            ReadyState::Closing => "Closing",
            ReadyState::Closed => "Closed",
        };
        f.write_str(name)
    }
}

/// How messages are framed on the socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    /// JSON in text frames
    #[default]
    Json,
    /// lib0-framed JSON in binary frames
    Lib0,
}

struct ChannelShared {
    state: AtomicU8,
    outbound: mpsc::UnboundedSender<ChannelMessage>,
    inbound: broadcast::Sender<ChannelMessage>,
}

/// A cloneable handle to a classroom channel
///
/// The channel is shared by everything in a session: each holder may send,
/// and every subscriber sees every inbound message.
#[derive(Clone)]
pub struct ChannelHandle {
    inner: Arc<ChannelShared>,
}

impl ChannelHandle {
    pub(crate) fn new(
        state: ReadyState,
        outbound: mpsc::UnboundedSender<ChannelMessage>,
        inbound_capacity: usize,
    ) -> Self {
        let (inbound, _) = broadcast::channel(inbound_capacity);
        Self {
            inner: Arc::new(ChannelShared {
                state: AtomicU8::new(state as u8),
                outbound,
                inbound,
            }),
        }
    }

    /// Create a channel not backed by a socket
    ///
    /// Messages sent through the handle arrive on the returned receiver;
    /// inbound traffic is injected with [`ChannelHandle::deliver`].
    pub fn detached(state: ReadyState) -> (Self, mpsc::UnboundedReceiver<ChannelMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(state, tx, DEFAULT_INBOUND_CAPACITY), rx)
    }

    pub fn ready_state(&self) -> ReadyState {
        ReadyState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn set_ready_state(&self, state: ReadyState) {
        let previous = self.inner.state.swap(state as u8, Ordering::AcqRel);
        if previous != state as u8 {
            debug!(
                "Channel state changed {} -> {}",
                ReadyState::from_u8(previous),
                state
            );
        }
    }

    pub fn is_open(&self) -> bool {
        self.ready_state() == ReadyState::Open
    }

    /// Queue a message for sending
    ///
    /// Fails with `ChannelNotReady` unless the channel is open.
    pub fn send(&self, message: ChannelMessage) -> SyncResult<()> {
        let state = self.ready_state();
        if state != ReadyState::Open {
            return Err(SyncError::ChannelNotReady {
                state: state.to_string(),
            });
        }

        trace!("Queueing {} from '{}'", message.action, message.user_id);
        self.inner.outbound.send(message).map_err(|_| {
            self.set_ready_state(ReadyState::Closed);
            SyncError::ChannelClosed
        })
    }

    /// Subscribe to inbound messages
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelMessage> {
        self.inner.inbound.subscribe()
    }

    /// Hand an inbound message to every subscriber
    ///
    /// Returns the number of subscribers that received it.
    pub fn deliver(&self, message: ChannelMessage) -> usize {
        match self.inner.inbound.send(message) {
            Ok(receiver_count) => receiver_count,
            Err(_) => {
                debug!("No subscribers for inbound channel message");
                0
            }
        }
    }
}
