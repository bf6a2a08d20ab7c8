//! Login sessions.
//!
//! A session binds an opaque cookie value to a username until it expires.
//! Expired entries are treated as missing on lookup and swept periodically
//! by a background task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use murmur_shared::Username;

/// An authenticated login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub username: Username,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    fn is_live(&self) -> bool {
        Utc::now() < self.expires_at
    }
}

#[derive(Clone)]
pub struct SessionStore {
    ttl: chrono::Duration,
    sessions: Arc<RwLock<HashMap<String, Session>>>,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::days(1)),
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Open a session and return its id.
    pub async fn create(&self, username: Username) -> String {
        let id = Uuid::new_v4().to_string();
        let expires_at = Utc::now()
            .checked_add_signed(self.ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let session = Session {
            username,
            expires_at,
        };
        debug!(user = %session.username, until = %session.expires_at, "Session created");
        self.sessions.write().await.insert(id.clone(), session);
        id
    }

    /// Look up a live session. Expired ones are removed.
    pub async fn get(&self, id: &str) -> Option<Session> {
        {
            let sessions = self.sessions.read().await;
            match sessions.get(id) {
                Some(session) if session.is_live() => return Some(session.clone()),
                Some(_) => {}
                None => return None,
            }
        }

        self.sessions.write().await.remove(id);
        None
    }

    pub async fn delete(&self, id: &str) {
        self.sessions.write().await.remove(id);
    }

    /// Drop every session belonging to `username`.
    pub async fn delete_for(&self, username: &Username) {
        self.sessions
            .write()
            .await
            .retain(|_, session| session.username != *username);
    }

    /// Evict expired sessions.
    pub async fn purge_expired(&self) {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, session| session.is_live());
        let removed = before - sessions.len();
        if removed > 0 {
            debug!(removed, "Purged expired sessions");
        }
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }
}
