//! The connection hub.
//!
//! Owns the [`RoutingTable`] behind a `tokio::sync::RwLock` and runs one
//! long-lived event loop that applies connection churn (register,
//! unregister, disconnect) and typing signals in arrival order. Chat
//! messages skip the loop: the reader pump routes them directly under the
//! write lock so a burst of connects cannot delay chat traffic. Queries
//! only take the read lock.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info};

use murmur_shared::constants::HUB_EVENT_QUEUE_CAPACITY;
use murmur_shared::types::{ConversationSummary, UserSummary};
use murmur_shared::{ConnectionId, Username};

use crate::client::ClientHandle;
use crate::table::{Message, Presence, RoutingTable};

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Events serialized through the hub's run loop.
#[derive(Debug)]
enum HubEvent {
    /// Install a connection; replies once it is live.
    Register {
        client: ClientHandle,
        reply: oneshot::Sender<()>,
    },
    /// Remove a connection if it is still the current one.
    Unregister {
        username: Username,
        connection: ConnectionId,
    },
    /// Remove whatever connection the user currently has.
    Disconnect { username: Username },
    /// Forward a typing indicator.
    Typing {
        from: Username,
        to: Username,
        is_typing: bool,
    },
}

// ---------------------------------------------------------------------------
// Hub
// ---------------------------------------------------------------------------

/// Cheap-to-clone handle to the shared routing table and its event loop.
#[derive(Clone)]
pub struct Hub {
    table: Arc<RwLock<RoutingTable>>,
    events: mpsc::Sender<HubEvent>,
}

impl Hub {
    /// Create the routing table and spawn the event loop.
    ///
    /// The loop stops once every `Hub` clone has been dropped.
    pub fn spawn() -> Self {
        let table = Arc::new(RwLock::new(RoutingTable::new()));
        let (events, rx) = mpsc::channel(HUB_EVENT_QUEUE_CAPACITY);

        tokio::spawn(run(table.clone(), rx));

        Self { table, events }
    }

    /// Register a connection, evicting any previous one for the same user.
    ///
    /// Returns `false` only if the event loop is gone.
    pub async fn register(&self, client: ClientHandle) -> bool {
        let (reply, done) = oneshot::channel();
        if self
            .events
            .send(HubEvent::Register { client, reply })
            .await
            .is_err()
        {
            return false;
        }
        done.await.is_ok()
    }

    pub async fn unregister(&self, username: Username, connection: ConnectionId) {
        self.submit(HubEvent::Unregister {
            username,
            connection,
        })
        .await;
    }

    /// Drop the user's live connection, if any (logout).
    pub async fn disconnect(&self, username: Username) {
        self.submit(HubEvent::Disconnect { username }).await;
    }

    pub async fn route_typing(&self, from: Username, to: Username, is_typing: bool) {
        self.submit(HubEvent::Typing {
            from,
            to,
            is_typing,
        })
        .await;
    }

    /// Store and deliver a chat message. Runs on the caller's task.
    pub async fn route_message(&self, from: &Username, to: &Username, content: String) -> Message {
        self.table.write().await.route_message(from, to, content)
    }

    pub async fn list_conversations(&self, username: &Username) -> Vec<ConversationSummary> {
        self.table.read().await.list_conversations(username)
    }

    pub async fn conversation(&self, a: &Username, b: &Username) -> Vec<Message> {
        self.table.read().await.conversation(a, b)
    }

    pub async fn search_identities(&self, query: &str, exclude: &Username) -> Vec<UserSummary> {
        self.table.read().await.search(query, exclude)
    }

    pub async fn presence(&self, username: &Username) -> Option<Presence> {
        self.table.read().await.presence(username)
    }

    /// Admission check: does the user hold a registered connection?
    pub async fn is_connected(&self, username: &Username) -> bool {
        self.table.read().await.is_connected(username)
    }

    pub async fn online_count(&self) -> usize {
        self.table.read().await.online_count()
    }

    async fn submit(&self, event: HubEvent) {
        if let Err(e) = self.events.send(event).await {
            debug!(event = ?e.0, "Hub event loop stopped, dropping event");
        }
    }
}

async fn run(table: Arc<RwLock<RoutingTable>>, mut events: mpsc::Receiver<HubEvent>) {
    info!("Hub event loop started");

    while let Some(event) = events.recv().await {
        let mut table = table.write().await;
        match event {
            HubEvent::Register { client, reply } => {
                table.register(client);
                let _ = reply.send(());
            }
            HubEvent::Unregister {
                username,
                connection,
            } => {
                table.unregister(&username, connection);
            }
            HubEvent::Disconnect { username } => {
                if !table.disconnect(&username) {
                    debug!(user = %username, "No live connection to disconnect");
                }
            }
            HubEvent::Typing {
                from,
                to,
                is_typing,
            } => {
                table.route_typing(&from, &to, is_typing);
            }
        }
    }

    info!("Hub event loop stopped");
}
