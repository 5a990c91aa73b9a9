//! The hub: single owner of live connections and group membership.
//!
//! All state lives inside one tokio task. Everything else talks to it through
//! a cloneable [`HubHandle`], which pushes [`HubCommand`]s onto a single
//! ordered channel. Commands are handled one at a time in arrival order, so
//! registry mutations never race and need no locks.
//!
//! The channel is bounded: when the loop falls behind, senders wait, which
//! in turn stops read pumps from pulling more frames off their sockets.

use std::collections::{HashMap, HashSet};

use tokio::sync::{mpsc, oneshot};

use super::message::{Message, MessageType};
use super::{Client, ConnectionId, GroupId, UserId};

/// Pending commands the hub accepts before senders start waiting.
pub const COMMAND_BUFFER: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("hub control loop has stopped")]
    Stopped,
}

/// Structural events and queries processed by the control loop.
#[derive(Debug)]
pub enum HubCommand {
    Register(Client),
    Unregister {
        user_id: UserId,
        connection_id: ConnectionId,
    },
    RouteDirect(Message),
    RouteGroup(Message),
    Broadcast(String),
    AddMember {
        group_id: GroupId,
        user_id: UserId,
    },
    RemoveMember {
        group_id: GroupId,
        user_id: UserId,
    },
    SetMembers {
        group_id: GroupId,
        members: Vec<UserId>,
    },
    ListOnline(oneshot::Sender<Vec<UserId>>),
    IsOnline(UserId, oneshot::Sender<bool>),
    GroupMembers(GroupId, oneshot::Sender<Vec<UserId>>),
}

/// Registry state owned by the control loop.
#[derive(Debug, Default)]
pub struct Hub {
    clients: HashMap<UserId, Client>,
    groups: HashMap<GroupId, HashSet<UserId>>,
    /// Clients evicted for backpressure, announced once the current
    /// command has finished its fan-out.
    evicted: Vec<Client>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the control loop on the current runtime and return its handle.
    ///
    /// The loop runs until every handle has been dropped.
    pub fn spawn() -> HubHandle {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        tokio::spawn(Hub::new().run(rx));
        HubHandle { tx }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<HubCommand>) {
        tracing::info!("Hub control loop started");
        while let Some(cmd) = rx.recv().await {
            self.handle(cmd);
        }
        tracing::info!(
            clients = self.clients.len(),
            "Hub command channel closed, shutting down"
        );
    }

    fn handle(&mut self, cmd: HubCommand) {
        match cmd {
            HubCommand::Register(client) => self.register(client),
            HubCommand::Unregister {
                user_id,
                connection_id,
            } => self.unregister(user_id, connection_id),
            HubCommand::RouteDirect(msg) => self.route_direct(&msg),
            HubCommand::RouteGroup(msg) => self.route_group(&msg),
            HubCommand::Broadcast(frame) => self.broadcast(&frame),
            HubCommand::AddMember { group_id, user_id } => {
                self.groups.entry(group_id).or_default().insert(user_id);
            }
            HubCommand::RemoveMember { group_id, user_id } => {
                if let Some(members) = self.groups.get_mut(&group_id) {
                    members.remove(&user_id);
                    if members.is_empty() {
                        self.groups.remove(&group_id);
                    }
                }
            }
            HubCommand::SetMembers { group_id, members } => {
                if members.is_empty() {
                    self.groups.remove(&group_id);
                } else {
                    self.groups.insert(group_id, members.into_iter().collect());
                }
            }
            HubCommand::ListOnline(reply) => {
                let _ = reply.send(self.online_users());
            }
            HubCommand::IsOnline(user_id, reply) => {
                let _ = reply.send(self.clients.contains_key(&user_id));
            }
            HubCommand::GroupMembers(group_id, reply) => {
                let mut members: Vec<UserId> = self
                    .groups
                    .get(&group_id)
                    .map(|m| m.iter().copied().collect())
                    .unwrap_or_default();
                members.sort();
                let _ = reply.send(members);
            }
        }

        self.announce_evictions();
    }

    fn register(&mut self, client: Client) {
        let user_id = client.user_id;
        let username = client.username.clone();

        if let Some(previous) = self.clients.insert(user_id, client) {
            // Dropping the old entry closes its outbound queue.
            tracing::info!(
                user_id = %user_id,
                connection_id = %previous.connection_id,
                "Replacing existing connection"
            );
        }

        tracing::info!(
            user_id = %user_id,
            username = %username,
            online = self.clients.len(),
            "Client connected"
        );

        self.broadcast_message(&Message::presence(MessageType::UserJoined, user_id, &username));
    }

    fn unregister(&mut self, user_id: UserId, connection_id: ConnectionId) {
        let is_current = self
            .clients
            .get(&user_id)
            .is_some_and(|c| c.connection_id == connection_id);
        if !is_current {
            tracing::debug!(
                user_id = %user_id,
                connection_id = %connection_id,
                "Ignoring unregister for a connection that is no longer registered"
            );
            return;
        }

        if let Some(client) = self.clients.remove(&user_id) {
            tracing::info!(
                user_id = %user_id,
                username = %client.username,
                online = self.clients.len(),
                "Client disconnected"
            );
            let left = Message::presence(MessageType::UserLeft, user_id, &client.username);
            drop(client);
            self.broadcast_message(&left);
        }
    }

    fn route_direct(&mut self, msg: &Message) {
        let Some(receiver_id) = msg.receiver_id else {
            tracing::debug!(kind = msg.kind.as_str(), "Direct message without receiver dropped");
            return;
        };
        if !self.clients.contains_key(&receiver_id) {
            tracing::debug!(receiver_id = %receiver_id, "Receiver not connected");
            return;
        }
        let Some(frame) = encode(msg) else {
            return;
        };
        self.enqueue(receiver_id, frame);
    }

    fn route_group(&mut self, msg: &Message) {
        let Some(group_id) = msg.group_id else {
            tracing::debug!("Group message without group_id dropped");
            return;
        };
        let Some(members) = self.groups.get(&group_id) else {
            // Membership is only known once the group collaborator has
            // pushed it; there is no store lookup here.
            tracing::debug!(group_id = %group_id, "Group not present in hub cache");
            return;
        };

        let recipients: Vec<UserId> = members
            .iter()
            .copied()
            .filter(|id| Some(*id) != msg.sender_id && self.clients.contains_key(id))
            .collect();
        if recipients.is_empty() {
            return;
        }

        let Some(frame) = encode(msg) else {
            return;
        };
        for user_id in recipients {
            self.enqueue(user_id, frame.clone());
        }
    }

    fn broadcast_message(&mut self, msg: &Message) {
        if let Some(frame) = encode(msg) {
            self.broadcast(&frame);
        }
    }

    fn broadcast(&mut self, frame: &str) {
        let recipients: Vec<UserId> = self.clients.keys().copied().collect();
        for user_id in recipients {
            self.enqueue(user_id, frame.to_string());
        }
    }

    /// Non-blocking enqueue. A full or closed queue evicts the recipient.
    fn enqueue(&mut self, user_id: UserId, frame: String) {
        let Some(client) = self.clients.get(&user_id) else {
            return;
        };
        match client.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(user_id = %user_id, "Outbound queue full, evicting slow client");
                self.evict(user_id);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(user_id = %user_id, "Outbound queue closed, evicting client");
                self.evict(user_id);
            }
        }
    }

    fn evict(&mut self, user_id: UserId) {
        if let Some(client) = self.clients.remove(&user_id) {
            self.evicted.push(client);
        }
    }

    /// Tell everyone still connected about clients dropped for backpressure.
    /// Announcing can evict further clients; the loop ends once none remain.
    fn announce_evictions(&mut self) {
        while let Some(client) = self.evicted.pop() {
            let left = Message::presence(MessageType::UserLeft, client.user_id, &client.username);
            drop(client);
            self.broadcast_message(&left);
        }
    }

    fn online_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.clients.keys().copied().collect();
        users.sort();
        users
    }
}

fn encode(msg: &Message) -> Option<String> {
    match msg.encode() {
        Ok(frame) => Some(frame),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode message");
            None
        }
    }
}

/// Cloneable entry point to the hub control loop.
///
/// Every call waits for room on the bounded command channel. Fire-and-forget
/// operations never report failure to the caller; if the hub has stopped
/// they are logged and dropped. Queries return [`HubError::Stopped`] instead.
#[derive(Debug, Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<HubCommand>,
}

impl HubHandle {
    async fn send(&self, cmd: HubCommand) {
        if self.tx.send(cmd).await.is_err() {
            tracing::warn!("Hub has stopped, dropping command");
        }
    }

    async fn query<T>(&self, cmd: impl FnOnce(oneshot::Sender<T>) -> HubCommand) -> Result<T, HubError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(cmd(reply_tx)).await.map_err(|_| HubError::Stopped)?;
        reply_rx.await.map_err(|_| HubError::Stopped)
    }

    /// Add or replace the connection for `client.user_id` and announce it.
    pub async fn register(&self, client: Client) {
        self.send(HubCommand::Register(client)).await;
    }

    /// Remove the user's connection if it is still `connection_id`.
    pub async fn unregister(&self, user_id: UserId, connection_id: ConnectionId) {
        self.send(HubCommand::Unregister {
            user_id,
            connection_id,
        })
        .await;
    }

    pub async fn route_direct(&self, msg: Message) {
        self.send(HubCommand::RouteDirect(msg)).await;
    }

    pub async fn route_group(&self, msg: Message) {
        self.send(HubCommand::RouteGroup(msg)).await;
    }

    /// Enqueue an encoded frame to every connected user.
    pub async fn broadcast(&self, frame: String) {
        self.send(HubCommand::Broadcast(frame)).await;
    }

    pub async fn add_member(&self, group_id: GroupId, user_id: UserId) {
        self.send(HubCommand::AddMember { group_id, user_id }).await;
    }

    pub async fn remove_member(&self, group_id: GroupId, user_id: UserId) {
        self.send(HubCommand::RemoveMember { group_id, user_id }).await;
    }

    /// Replace the cached membership of a group. An empty list drops it.
    pub async fn set_members(&self, group_id: GroupId, members: Vec<UserId>) {
        self.send(HubCommand::SetMembers { group_id, members }).await;
    }

    /// Push a read receipt to `original_sender` on behalf of `reader`.
    pub async fn notify_read(&self, reader: UserId, original_sender: UserId) {
        self.route_direct(Message::read_receipt(reader, original_sender))
            .await;
    }

    /// Online user ids, sorted.
    pub async fn list_online(&self) -> Result<Vec<UserId>, HubError> {
        self.query(HubCommand::ListOnline).await
    }

    pub async fn is_online(&self, user_id: UserId) -> Result<bool, HubError> {
        self.query(|reply| HubCommand::IsOnline(user_id, reply)).await
    }

    /// Cached members of a group, sorted. Empty if the group is unknown.
    pub async fn group_members(&self, group_id: GroupId) -> Result<Vec<UserId>, HubError> {
        self.query(|reply| HubCommand::GroupMembers(group_id, reply)).await
    }
}
