//! The routing table: live connections, presence and conversation logs.
//!
//! Every operation here is synchronous and never blocks. Envelopes are
//! serialized and pushed onto the recipients' bounded outbound queues with
//! `try_send`; a queue that rejects a push gets its connection removed on
//! the spot and is then treated as a regular disconnect. The table is only
//! ever touched through [`crate::hub::Hub`], which wraps it in a lock.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use murmur_shared::protocol::{
    format_timestamp, AckEvent, OutboundMessage, ServerEnvelope, StatusEvent, TypingNotice,
};
use murmur_shared::types::{ConversationSummary, UserSummary};
use murmur_shared::{ConnectionId, ConversationKey, DeliveryStatus, Username};

use crate::client::ClientHandle;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Last known presence of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Presence {
    pub online: bool,
    pub last_seen: DateTime<Utc>,
}

/// A message stored in a conversation log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: Uuid,
    pub from: Username,
    pub to: Username,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub status: DeliveryStatus,
}

impl Message {
    fn outbound(&self, status: DeliveryStatus) -> OutboundMessage {
        OutboundMessage {
            id: self.id,
            from: self.from.clone(),
            to: self.to.clone(),
            content: self.content.clone(),
            timestamp: format_timestamp(&self.timestamp),
            status,
        }
    }

    /// Wire form carrying the stored delivery status.
    pub fn to_wire(&self) -> OutboundMessage {
        self.outbound(self.status)
    }
}

// ---------------------------------------------------------------------------
// Table
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct RoutingTable {
    /// Registered connection per user. Holds the only sender of each queue.
    clients: HashMap<Username, ClientHandle>,
    /// Every user that ever registered.
    presence: HashMap<Username, Presence>,
    /// Append-only logs keyed by canonical pair.
    conversations: HashMap<ConversationKey, Vec<Message>>,
    /// Users whose connection was dropped by a failed delivery during the
    /// current operation and still need the offline transition.
    dropped: Vec<Username>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `client` as the live connection for its user, evicting any
    /// previous one, and exchange online statuses with everyone else.
    pub fn register(&mut self, client: ClientHandle) {
        let username = client.username().clone();
        let connection = client.id();

        if let Some(previous) = self.clients.remove(&username) {
            info!(
                user = %username,
                old = %previous.id(),
                new = %connection,
                "User already connected, evicting previous connection"
            );
            // Dropping the handle closes its queue.
            drop(previous);
        }
        self.clients.insert(username.clone(), client);

        let now = Utc::now();
        self.presence.insert(
            username.clone(),
            Presence {
                online: true,
                last_seen: now,
            },
        );

        self.broadcast_except(
            &username,
            &ServerEnvelope::Status(StatusEvent {
                username: username.clone(),
                online: true,
            }),
        );

        // Tell the newcomer who is already here.
        let mut online: Vec<Username> = self
            .presence
            .iter()
            .filter(|(name, p)| p.online && **name != username)
            .map(|(name, _)| name.clone())
            .collect();
        online.sort();
        for peer in online {
            self.deliver(
                &username,
                &ServerEnvelope::Status(StatusEvent {
                    username: peer,
                    online: true,
                }),
            );
        }

        info!(user = %username, connection = %connection, "Client registered");
        self.settle();
    }

    /// Remove `connection` if it is still the live one for `username`.
    ///
    /// Returns `false` for a stale unregister (the connection was already
    /// replaced or dropped), which is not an error.
    pub fn unregister(&mut self, username: &Username, connection: ConnectionId) -> bool {
        match self.clients.get(username) {
            Some(current) if current.id() == connection => {}
            _ => {
                debug!(
                    user = %username,
                    connection = %connection,
                    "Connection already replaced, skipping unregister"
                );
                return false;
            }
        }

        self.clients.remove(username);
        self.go_offline(username);
        info!(user = %username, connection = %connection, "Client unregistered");
        self.settle();
        true
    }

    /// Unregister whatever connection `username` currently has.
    pub fn disconnect(&mut self, username: &Username) -> bool {
        match self.clients.get(username).map(ClientHandle::id) {
            Some(connection) => self.unregister(username, connection),
            None => false,
        }
    }

    /// Store a message and push it to both ends.
    ///
    /// The sender always gets a `sent` copy. When the recipient is live and
    /// accepts the `delivered` copy, the stored message flips to delivered
    /// and the sender gets an ack.
    pub fn route_message(&mut self, from: &Username, to: &Username, content: String) -> Message {
        let mut message = Message {
            id: Uuid::new_v4(),
            from: from.clone(),
            to: to.clone(),
            content,
            timestamp: Utc::now(),
            status: DeliveryStatus::Sent,
        };

        let key = ConversationKey::new(from, to);
        let log = self.conversations.entry(key.clone()).or_default();
        log.push(message.clone());
        let index = log.len() - 1;

        let confirmation = ServerEnvelope::Message(message.outbound(DeliveryStatus::Sent));
        if !self.deliver(from, &confirmation) {
            debug!(user = %from, "Sender not connected, skipping send confirmation");
        }

        let delivered = self.clients.contains_key(to)
            && self.deliver(
                to,
                &ServerEnvelope::Message(message.outbound(DeliveryStatus::Delivered)),
            );

        if delivered {
            if let Some(stored) = self
                .conversations
                .get_mut(&key)
                .and_then(|log| log.get_mut(index))
            {
                stored.status = DeliveryStatus::Delivered;
            }
            message.status = DeliveryStatus::Delivered;

            self.deliver(
                from,
                &ServerEnvelope::Ack(AckEvent {
                    message_id: message.id,
                    status: DeliveryStatus::Delivered,
                }),
            );
        } else {
            debug!(from = %from, to = %to, id = %message.id, "Recipient offline, message kept as sent");
        }

        self.settle();
        message
    }

    /// Forward a typing signal. Dropped when the recipient is offline.
    pub fn route_typing(&mut self, from: &Username, to: &Username, is_typing: bool) -> bool {
        if !self.clients.contains_key(to) {
            debug!(from = %from, to = %to, "Recipient offline, dropping typing signal");
            return false;
        }

        let delivered = self.deliver(
            to,
            &ServerEnvelope::Typing(TypingNotice {
                from: from.clone(),
                is_typing,
            }),
        );
        self.settle();
        delivered
    }

    // -- Queries --

    /// One entry per peer, newest conversation first.
    pub fn list_conversations(&self, username: &Username) -> Vec<ConversationSummary> {
        let mut seen = HashSet::new();
        let mut summaries = Vec::new();

        for log in self.conversations.values() {
            let Some(last) = log.last() else {
                continue;
            };

            let peer = if last.from == *username {
                &last.to
            } else if last.to == *username {
                &last.from
            } else {
                continue;
            };

            if !seen.insert(peer.clone()) {
                continue;
            }

            summaries.push(ConversationSummary {
                peer_username: peer.clone(),
                last_message_preview: last.content.clone(),
                last_message_time: last.timestamp,
                peer_online: self.is_online(peer),
            });
        }

        summaries.sort_by(|a, b| {
            b.last_message_time
                .cmp(&a.last_message_time)
                .then_with(|| a.peer_username.cmp(&b.peer_username))
        });
        summaries
    }

    /// Full log between two users in chronological order.
    pub fn conversation(&self, a: &Username, b: &Username) -> Vec<Message> {
        self.conversations
            .get(&ConversationKey::new(a, b))
            .cloned()
            .unwrap_or_default()
    }

    /// Case-insensitive substring search over every known user.
    pub fn search(&self, query: &str, exclude: &Username) -> Vec<UserSummary> {
        let needle = query.to_lowercase();
        let mut results: Vec<UserSummary> = self
            .presence
            .iter()
            .filter(|(name, _)| *name != exclude)
            .filter(|(name, _)| needle.is_empty() || name.as_str().to_lowercase().contains(&needle))
            .map(|(name, p)| UserSummary {
                username: name.clone(),
                online: p.online,
            })
            .collect();
        results.sort_by(|a, b| a.username.cmp(&b.username));
        results
    }

    pub fn presence(&self, username: &Username) -> Option<Presence> {
        self.presence.get(username).copied()
    }

    pub fn is_connected(&self, username: &Username) -> bool {
        self.clients.contains_key(username)
    }

    pub fn online_count(&self) -> usize {
        self.clients.len()
    }

    fn is_online(&self, username: &Username) -> bool {
        self.presence
            .get(username)
            .map(|p| p.online)
            .unwrap_or(false)
    }

    // -- Delivery --

    fn deliver(&mut self, to: &Username, envelope: &ServerEnvelope) -> bool {
        match envelope.to_json() {
            Ok(frame) => self.deliver_frame(to, frame, envelope.kind()),
            Err(e) => {
                warn!(user = %to, kind = envelope.kind(), error = %e, "Failed to serialize envelope");
                false
            }
        }
    }

    fn deliver_frame(&mut self, to: &Username, frame: String, kind: &'static str) -> bool {
        let Some(client) = self.clients.get(to) else {
            return false;
        };

        match client.try_push(frame) {
            Ok(()) => {
                debug!(user = %to, kind, "Envelope queued");
                true
            }
            Err(e) => {
                warn!(user = %to, kind, error = %e, "Delivery failed, closing connection");
                if let Some(client) = self.clients.remove(to) {
                    self.dropped.push(client.username().clone());
                }
                false
            }
        }
    }

    fn broadcast_except(&mut self, except: &Username, envelope: &ServerEnvelope) {
        let frame = match envelope.to_json() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(kind = envelope.kind(), error = %e, "Failed to serialize broadcast");
                return;
            }
        };

        let targets: Vec<Username> = self
            .clients
            .keys()
            .filter(|name| *name != except)
            .cloned()
            .collect();
        for target in targets {
            self.deliver_frame(&target, frame.clone(), envelope.kind());
        }
    }

    fn go_offline(&mut self, username: &Username) {
        let now = Utc::now();
        self.presence
            .entry(username.clone())
            .and_modify(|p| {
                p.online = false;
                p.last_seen = now;
            })
            .or_insert(Presence {
                online: false,
                last_seen: now,
            });

        self.broadcast_except(
            username,
            &ServerEnvelope::Status(StatusEvent {
                username: username.clone(),
                online: false,
            }),
        );
    }

    /// Finish the offline transition for connections dropped by failed
    /// deliveries. Broadcasting may drop more, so this drains a worklist.
    fn settle(&mut self) {
        while let Some(username) = self.dropped.pop() {
            if self.clients.contains_key(&username) {
                continue;
            }
            info!(user = %username, "Client dropped after failed delivery");
            self.go_offline(&username);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio::sync::mpsc::error::TryRecvError;

    fn user(name: &str) -> Username {
        Username::parse(name).unwrap()
    }

    fn connect(
        table: &mut RoutingTable,
        name: &str,
        capacity: usize,
    ) -> (ConnectionId, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity);
        let client = ClientHandle::new(user(name), tx);
        let id = client.id();
        table.register(client);
        (id, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<ServerEnvelope> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(ServerEnvelope::from_json(&frame).unwrap());
        }
        out
    }

    fn is_closed(rx: &mut mpsc::Receiver<String>) -> bool {
        drain(rx);
        matches!(rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    #[test]
    fn test_register_exchanges_status() {
        let mut table = RoutingTable::new();
        let (_, mut alice_rx) = connect(&mut table, "alice", 16);
        assert!(drain(&mut alice_rx).is_empty());

        let (_, mut bob_rx) = connect(&mut table, "bob", 16);
        assert_eq!(
            drain(&mut alice_rx),
            vec![ServerEnvelope::Status(StatusEvent {
                username: user("bob"),
                online: true
            })]
        );
        assert_eq!(
            drain(&mut bob_rx),
            vec![ServerEnvelope::Status(StatusEvent {
                username: user("alice"),
                online: true
            })]
        );
    }

    #[test]
    fn test_second_registration_evicts_first() {
        let mut table = RoutingTable::new();
        let (first, mut first_rx) = connect(&mut table, "alice", 16);
        let (second, mut second_rx) = connect(&mut table, "alice", 16);
        let (_, _bob_rx) = connect(&mut table, "bob", 16);

        assert!(is_closed(&mut first_rx));
        assert!(!is_closed(&mut second_rx));
        assert_eq!(table.online_count(), 2);

        // The evicted connection's unregister is stale and changes nothing.
        assert!(!table.unregister(&user("alice"), first));
        assert!(table.is_connected(&user("alice")));

        let found = table.search("ali", &user("bob"));
        assert_eq!(
            found,
            vec![UserSummary {
                username: user("alice"),
                online: true
            }]
        );

        assert!(table.unregister(&user("alice"), second));
        assert!(!table.is_connected(&user("alice")));
    }

    #[test]
    fn test_unregister_marks_offline_and_broadcasts() {
        let mut table = RoutingTable::new();
        let (alice, mut alice_rx) = connect(&mut table, "alice", 16);
        let (_, mut bob_rx) = connect(&mut table, "bob", 16);
        drain(&mut bob_rx);
        let online_since = table.presence(&user("alice")).unwrap().last_seen;

        assert!(table.unregister(&user("alice"), alice));

        let presence = table.presence(&user("alice")).unwrap();
        assert!(!presence.online);
        assert!(presence.last_seen >= online_since);
        assert!(is_closed(&mut alice_rx));
        assert_eq!(
            drain(&mut bob_rx),
            vec![ServerEnvelope::Status(StatusEvent {
                username: user("alice"),
                online: false
            })]
        );
    }

    #[test]
    fn test_message_to_online_recipient() {
        let mut table = RoutingTable::new();
        let (_, mut alice_rx) = connect(&mut table, "alice", 16);
        let (_, mut bob_rx) = connect(&mut table, "bob", 16);
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        let message = table.route_message(&user("alice"), &user("bob"), "hi".into());
        assert_eq!(message.status, DeliveryStatus::Delivered);

        let alice_frames = drain(&mut alice_rx);
        assert_eq!(alice_frames.len(), 2);
        match &alice_frames[0] {
            ServerEnvelope::Message(m) => {
                assert_eq!(m.status, DeliveryStatus::Sent);
                assert_eq!(m.content, "hi");
                assert_eq!(m.id, message.id);
            }
            other => panic!("expected message, got {other:?}"),
        }
        assert_eq!(
            alice_frames[1],
            ServerEnvelope::Ack(AckEvent {
                message_id: message.id,
                status: DeliveryStatus::Delivered
            })
        );

        let bob_frames = drain(&mut bob_rx);
        assert_eq!(bob_frames.len(), 1);
        match &bob_frames[0] {
            ServerEnvelope::Message(m) => {
                assert_eq!(m.status, DeliveryStatus::Delivered);
                assert_eq!(m.from, user("alice"));
            }
            other => panic!("expected message, got {other:?}"),
        }

        let log = table.conversation(&user("alice"), &user("bob"));
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].content, "hi");
        assert_eq!(log[0].status, DeliveryStatus::Delivered);
    }

    #[test]
    fn test_message_to_offline_recipient() {
        let mut table = RoutingTable::new();
        let (_, mut alice_rx) = connect(&mut table, "alice", 16);

        let message = table.route_message(&user("alice"), &user("carol"), "anyone?".into());
        assert_eq!(message.status, DeliveryStatus::Sent);

        let frames = drain(&mut alice_rx);
        assert_eq!(frames.len(), 1);
        assert!(matches!(
            &frames[0],
            ServerEnvelope::Message(m) if m.status == DeliveryStatus::Sent
        ));

        let log = table.conversation(&user("carol"), &user("alice"));
        assert_eq!(log[0].status, DeliveryStatus::Sent);

        let list = table.list_conversations(&user("alice"));
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].peer_username, user("carol"));
        assert!(!list[0].peer_online);
        assert_eq!(list[0].last_message_preview, "anyone?");
    }

    #[test]
    fn test_conversation_is_symmetric() {
        let mut table = RoutingTable::new();
        table.route_message(&user("alice"), &user("bob"), "one".into());
        table.route_message(&user("bob"), &user("alice"), "two".into());
        table.route_message(&user("alice"), &user("carol"), "other".into());

        let ab = table.conversation(&user("alice"), &user("bob"));
        let ba = table.conversation(&user("bob"), &user("alice"));
        assert_eq!(ab, ba);
        assert_eq!(
            ab.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(),
            vec!["one", "two"]
        );
        assert!(table.conversation(&user("bob"), &user("carol")).is_empty());
    }

    #[test]
    fn test_list_conversations_sorted_and_unique() {
        let mut table = RoutingTable::new();
        let (_, _bob_rx) = connect(&mut table, "bob", 64);
        table.route_message(&user("alice"), &user("bob"), "first".into());
        table.route_message(&user("carol"), &user("alice"), "second".into());
        table.route_message(&user("alice"), &user("dave"), "third".into());
        table.route_message(&user("bob"), &user("alice"), "fourth".into());
        table.route_message(&user("bob"), &user("carol"), "unrelated".into());

        let list = table.list_conversations(&user("alice"));
        let peers: Vec<&str> = list.iter().map(|c| c.peer_username.as_str()).collect();
        let unique: HashSet<&str> = peers.iter().copied().collect();
        assert_eq!(peers.len(), 3);
        assert_eq!(unique.len(), 3);
        assert!(list
            .windows(2)
            .all(|w| w[0].last_message_time >= w[1].last_message_time));

        let bob = list.iter().find(|c| c.peer_username == user("bob")).unwrap();
        assert_eq!(bob.last_message_preview, "fourth");
        assert!(bob.peer_online);
    }

    #[test]
    fn test_typing_routing() {
        let mut table = RoutingTable::new();
        let (_, mut alice_rx) = connect(&mut table, "alice", 16);
        let (_, mut bob_rx) = connect(&mut table, "bob", 16);
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        assert!(table.route_typing(&user("alice"), &user("bob"), true));
        assert_eq!(
            drain(&mut bob_rx),
            vec![ServerEnvelope::Typing(TypingNotice {
                from: user("alice"),
                is_typing: true
            })]
        );

        assert!(!table.route_typing(&user("alice"), &user("carol"), true));
        assert!(drain(&mut alice_rx).is_empty());
        assert!(drain(&mut bob_rx).is_empty());
    }

    #[test]
    fn test_full_queue_disconnects_recipient() {
        let mut table = RoutingTable::new();
        let (_, mut alice_rx) = connect(&mut table, "alice", 16);
        // bob's single slot is taken by alice's online status.
        let (_, mut bob_rx) = connect(&mut table, "bob", 1);
        drain(&mut alice_rx);

        let message = table.route_message(&user("alice"), &user("bob"), "hello".into());
        assert_eq!(message.status, DeliveryStatus::Sent);
        assert!(!table.is_connected(&user("bob")));
        assert!(!table.presence(&user("bob")).unwrap().online);

        let frames = drain(&mut alice_rx);
        assert_eq!(frames.len(), 2);
        assert!(matches!(&frames[0], ServerEnvelope::Message(m) if m.status == DeliveryStatus::Sent));
        assert_eq!(
            frames[1],
            ServerEnvelope::Status(StatusEvent {
                username: user("bob"),
                online: false
            })
        );

        assert_eq!(drain(&mut bob_rx).len(), 1);
        assert!(is_closed(&mut bob_rx));
    }

    fn offline_users(frames: &[ServerEnvelope]) -> HashSet<Username> {
        frames
            .iter()
            .filter_map(|frame| match frame {
                ServerEnvelope::Status(s) if !s.online => Some(s.username.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_broadcast_drops_cascade_through_worklist() {
        let mut table = RoutingTable::new();
        let (_, mut bob_rx) = connect(&mut table, "bob", 64);
        let mut victims: Vec<_> = ["a1", "a2", "a3"]
            .iter()
            .map(|name| (*name, connect(&mut table, name, 4).1))
            .collect();
        drain(&mut bob_rx);
        for (_, rx) in victims.iter_mut() {
            drain(rx);
        }

        // a1 and a2 end up full; a3 keeps a single free slot.
        for (name, fill) in [("a1", 4), ("a2", 4), ("a3", 3)] {
            for i in 0..fill {
                table.route_message(&user("bob"), &user(name), format!("m{i}"));
            }
        }
        drain(&mut bob_rx);

        // carol's online status overflows a1 and a2 and fills a3, whose
        // queue then overflows on the first offline broadcast.
        let (_, mut carol_rx) = connect(&mut table, "carol", 64);

        let expected: HashSet<Username> = ["a1", "a2", "a3"].into_iter().map(user).collect();
        for name in &expected {
            assert!(!table.is_connected(name), "{name} still connected");
            assert!(!table.presence(name).unwrap().online, "{name} still online");
        }
        assert_eq!(table.online_count(), 2);
        for (name, rx) in victims.iter_mut() {
            assert!(is_closed(rx), "{name} queue still open");
        }

        let bob_frames = drain(&mut bob_rx);
        assert_eq!(bob_frames.len(), 4);
        assert_eq!(
            bob_frames[0],
            ServerEnvelope::Status(StatusEvent {
                username: user("carol"),
                online: true
            })
        );
        assert_eq!(offline_users(&bob_frames), expected);

        let carol_frames = drain(&mut carol_rx);
        assert_eq!(carol_frames.len(), 7);
        assert_eq!(offline_users(&carol_frames), expected);
        assert!(table.is_connected(&user("carol")));
    }

    #[test]
    fn test_search() {
        let mut table = RoutingTable::new();
        let (alice, _alice_rx) = connect(&mut table, "Alice", 16);
        let (_, _bob_rx) = connect(&mut table, "bob", 16);
        let (_, _ali_rx) = connect(&mut table, "malik", 16);
        table.unregister(&user("Alice"), alice);

        let found = table.search("ALI", &user("bob"));
        assert_eq!(
            found,
            vec![
                UserSummary {
                    username: user("Alice"),
                    online: false
                },
                UserSummary {
                    username: user("malik"),
                    online: true
                },
            ]
        );

        let everyone = table.search("", &user("bob"));
        assert_eq!(everyone.len(), 2);
        assert!(table.search("zzz", &user("bob")).is_empty());
    }

    #[test]
    fn test_disconnect() {
        let mut table = RoutingTable::new();
        let (_, mut alice_rx) = connect(&mut table, "alice", 16);
        assert!(table.disconnect(&user("alice")));
        assert!(is_closed(&mut alice_rx));
        assert!(!table.disconnect(&user("alice")));
        assert!(!table.disconnect(&user("nobody")));
    }
}
