use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError, Receiver, Sender};
use uuid::Uuid;

/// Unique identifier for a single WebSocket connection.
///
/// A user may hold several connections (tabs, devices); removal always
/// targets one connection by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Serialized outbound text frame, shared by every recipient of a broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame(Arc<str>);

impl Frame {
    pub fn new(text: impl Into<Arc<str>>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteFailure {
    /// The client is not draining its buffer fast enough
    BufferFull,
    /// The connection's session has already stopped
    Closed,
}

impl fmt::Display for WriteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BufferFull => write!(f, "send buffer full"),
            Self::Closed => write!(f, "connection closed"),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("write to connection {connection_id} of user {user_id} failed: {reason}")]
pub struct ConnectionWriteFailed {
    pub user_id: Uuid,
    pub connection_id: ConnectionId,
    pub reason: WriteFailure,
}

/// Sending half of a connection, owned by the registry.
///
/// The receiving half is drained by the connection's session actor. Writes
/// never wait: a full buffer is a failed write.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    user_id: Uuid,
    sender: Sender<Frame>,
}

impl ConnectionHandle {
    /// New handle plus the receiver the session forwards to its socket.
    pub fn channel(user_id: Uuid, capacity: usize) -> (Self, Receiver<Frame>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id: ConnectionId::new(),
            user_id,
            sender,
        };
        (handle, receiver)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    pub fn try_write(&self, frame: &Frame) -> Result<(), ConnectionWriteFailed> {
        self.sender.try_send(frame.clone()).map_err(|e| {
            let reason = match e {
                TrySendError::Full(_) => WriteFailure::BufferFull,
                TrySendError::Closed(_) => WriteFailure::Closed,
            };
            ConnectionWriteFailed {
                user_id: self.user_id,
                connection_id: self.id,
                reason,
            }
        })
    }
}
