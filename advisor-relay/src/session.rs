//! In-memory session registry.
//!
//! Maps a caller-supplied session key to its conversation state. The map is
//! guarded by one async mutex so resolve and reset are atomic per key; each
//! entry carries its own mutex so a turn holds its session for the whole
//! stream without blocking other sessions.
//!
//! The registry is bounded two ways: entries idle for longer than the TTL are
//! purged on the next resolve, and when the registry is full the least
//! recently used entry makes room for a new one.

use crate::provider::Conversation;
use advisor_common::config::SessionsConfig;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Key used when the caller does not supply one.
pub const DEFAULT_SESSION_ID: &str = "default";

/// Conversation state for one session key.
#[derive(Debug)]
pub struct Session {
    /// Upstream conversation context
    pub conversation: Conversation,
    /// Whether the system prompt has been sent
    pub primed: bool,
    created_at: Instant,
}

impl Session {
    fn new() -> Self {
        Self {
            conversation: Conversation::new(),
            primed: false,
            created_at: Instant::now(),
        }
    }

    /// Time since this session was created or last reset.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// Shared handle to one registry entry.
pub type SessionHandle = Arc<Mutex<Session>>;

struct Entry {
    session: SessionHandle,
    last_used: Instant,
}

/// Bounded, idle-evicting session store.
pub struct SessionRegistry {
    entries: Mutex<LruCache<String, Entry>>,
    idle_ttl: Duration,
}

impl SessionRegistry {
    pub fn new(config: &SessionsConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_sessions).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            idle_ttl: Duration::from_secs(config.idle_ttl_secs),
        }
    }

    /// Return the session for `key`, creating a fresh one when `reset` is set
    /// or no live entry exists.
    ///
    /// A reset replaces the entry; turns still running against the previous
    /// handle finish against the detached session.
    pub async fn resolve(&self, key: &str, reset: bool) -> SessionHandle {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;

        self.purge_idle(&mut entries, now);

        if !reset {
            if let Some(entry) = entries.get_mut(key) {
                entry.last_used = now;
                return Arc::clone(&entry.session);
            }
        }

        let session = Arc::new(Mutex::new(Session::new()));
        let displaced = entries.push(
            key.to_string(),
            Entry {
                session: Arc::clone(&session),
                last_used: now,
            },
        );
        if let Some((evicted, _)) = displaced.filter(|(k, _)| k != key) {
            tracing::debug!(session_id = %evicted, "Evicted least recently used session");
        }

        tracing::info!(
            session_id = %key,
            reset,
            live_sessions = entries.len(),
            "Initialized new chat session"
        );

        session
    }

    /// Number of live sessions.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Drop entries idle for longer than the TTL. Recency order matches
    /// `last_used`, so expired entries are always at the cold end.
    fn purge_idle(&self, entries: &mut LruCache<String, Entry>, now: Instant) {
        let mut purged = 0usize;
        while let Some((_, entry)) = entries.peek_lru() {
            if now.duration_since(entry.last_used) <= self.idle_ttl {
                break;
            }
            entries.pop_lru();
            purged += 1;
        }

        if purged > 0 {
            tracing::debug!(purged, "Purged idle sessions");
        }
    }
}
