pub mod actor;
pub mod handler;
pub mod hub;
pub mod message;
pub mod protocol;

use tokio::sync::mpsc;
use uuid::Uuid;

pub use hub::{Hub, HubError, HubHandle};
pub use message::{Message, MessageType};

pub type UserId = Uuid;
pub type GroupId = Uuid;

/// Sender half of a connection's bounded outbound queue.
/// Frames are already-encoded JSON text.
pub type OutboundSender = mpsc::Sender<String>;
pub type OutboundReceiver = mpsc::Receiver<String>;

/// Unique identifier for one WebSocket connection.
///
/// A user reconnecting gets a fresh id, which lets the hub ignore a late
/// unregister from the connection it already replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

/// A registered connection as seen by the hub.
///
/// The hub owns the only strong sender of the outbound queue. Dropping the
/// `Client` closes the queue, which is what ends the connection's write pump.
#[derive(Debug)]
pub struct Client {
    pub user_id: UserId,
    pub username: String,
    pub connection_id: ConnectionId,
    sender: OutboundSender,
}

impl Client {
    /// Create a client with an outbound queue of `capacity` frames.
    pub fn new(user_id: UserId, username: impl Into<String>, capacity: usize) -> (Self, OutboundReceiver) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let client = Self {
            user_id,
            username: username.into(),
            connection_id: ConnectionId::new(),
            sender,
        };
        (client, receiver)
    }

    /// A weak handle to the outbound queue that does not keep it open.
    pub fn weak_sender(&self) -> mpsc::WeakSender<String> {
        self.sender.downgrade()
    }

    pub(crate) fn try_send(&self, frame: String) -> Result<(), mpsc::error::TrySendError<String>> {
        self.sender.try_send(frame)
    }
}
