use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::providers::chat::ChatMessage;

/// Pending payload stored between the POST handoff and the GET stream pickup.
///
/// The variant tags the route the payload was submitted on; a pickup from the
/// wrong route treats the entry as absent.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionPayload {
    /// 小木鱼助手对话历史
    Chat(Vec<ChatMessage>),
    /// 木鱼书检索查询
    Search(String),
}

#[derive(Debug)]
struct SessionEntry {
    payload: SessionPayload,
    created_at: Instant,
}

/// In-memory session handoff store.
///
/// Maps client-generated session tokens to pending request payloads. Entries
/// live until they are taken or until the TTL elapses, whichever comes first.
/// `put`/`take` are atomic per token under the mutex; a background sweeper
/// removes abandoned entries so a GET that never arrives cannot leak memory.
pub struct SessionStore {
    entries: Mutex<HashMap<String, SessionEntry>>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Store a payload for later pickup. Overwrites any existing entry for
    /// the same token.
    pub async fn put(&self, token: impl Into<String>, payload: SessionPayload) {
        let token = token.into();
        let mut entries = self.entries.lock().await;
        entries.insert(
            token,
            SessionEntry {
                payload,
                created_at: Instant::now(),
            },
        );
    }

    /// Destructive read: the entry is removed as part of being returned.
    ///
    /// An entry past its TTL that the sweeper has not reached yet behaves as
    /// absent.
    pub async fn take(&self, token: &str) -> Option<SessionPayload> {
        let mut entries = self.entries.lock().await;
        let entry = entries.remove(token)?;
        if entry.created_at.elapsed() > self.ttl {
            tracing::debug!(token, "session entry expired before pickup");
            return None;
        }
        Some(entry.payload)
    }

    /// Remove all expired entries.
    pub async fn sweep(&self) {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.created_at.elapsed() <= self.ttl);
        let removed = before - entries.len();
        if removed > 0 {
            tracing::debug!(removed, "swept expired session entries");
        }
    }

    /// Number of live entries, expired-but-unswept included.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Spawn the periodic sweeper task for this store.
    pub fn spawn_sweeper(store: Arc<Self>, interval: Duration) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                store.sweep().await;
            }
        });
    }
}
