//! # Session Registry
//!
//! Directory of live sessions with a time-to-live, the in-process equivalent of
//! a connection table. It decides which sessions exist and are reachable; it
//! never holds model state.
//!
//! ## Expiry:
//! Every entry expires `ttl_secs` after its last activity. A background task
//! calls [`SessionRegistry::sweep_expired`] and the pipeline drops the recurrent
//! state of whatever it returns.

use crate::config::{SessionsConfig, MAX_SESSION_TTL_SECS};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Liveness metadata for one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionEntry {
    pub session_id: String,
    pub connected_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
struct RegistryLimits {
    ttl: Duration,
    max_sessions: usize,
}

impl From<&SessionsConfig> for RegistryLimits {
    fn from(config: &SessionsConfig) -> Self {
        Self {
            ttl: Duration::try_seconds(config.ttl_secs.min(MAX_SESSION_TTL_SECS) as i64)
                .unwrap_or_else(|| Duration::hours(1)),
            max_sessions: config.max_concurrent_sessions,
        }
    }
}

/// `now + ttl`, saturating at the latest representable time.
fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub struct SessionRegistry {
    entries: RwLock<HashMap<String, SessionEntry>>,
    limits: RwLock<RegistryLimits>,
}

impl SessionRegistry {
    pub fn new(config: &SessionsConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            limits: RwLock::new(RegistryLimits::from(config)),
        }
    }

    /// Apply new TTL and session limit. Existing entries keep their current expiry.
    pub async fn reconfigure(&self, config: &SessionsConfig) {
        *self.limits.write().await = RegistryLimits::from(config);
    }

    /// Register a session.
    ///
    /// ## Returns:
    /// - **Ok(())**: registered, or refreshed when the id was already known
    /// - **Err(message)**: the maximum number of live sessions is reached
    pub async fn connect(&self, session_id: &str) -> Result<(), String> {
        let limits = *self.limits.read().await;
        let mut entries = self.entries.write().await;
        let now = Utc::now();

        if let Some(entry) = entries.get_mut(session_id) {
            entry.last_seen_at = now;
            entry.expires_at = expiry(now, limits.ttl);
            return Ok(());
        }

        if entries.len() >= limits.max_sessions {
            return Err(format!(
                "Maximum concurrent sessions ({}) reached",
                limits.max_sessions
            ));
        }

        entries.insert(
            session_id.to_string(),
            SessionEntry {
                session_id: session_id.to_string(),
                connected_at: now,
                last_seen_at: now,
                expires_at: expiry(now, limits.ttl),
            },
        );
        Ok(())
    }

    /// Refresh a session's expiry. Returns false for unknown ids.
    pub async fn touch(&self, session_id: &str) -> bool {
        let ttl = self.limits.read().await.ttl;
        let mut entries = self.entries.write().await;
        match entries.get_mut(session_id) {
            Some(entry) => {
                let now = Utc::now();
                entry.last_seen_at = now;
                entry.expires_at = expiry(now, ttl);
                true
            }
            None => false,
        }
    }

    pub async fn forget(&self, session_id: &str) -> bool {
        self.entries.write().await.remove(session_id).is_some()
    }

    pub async fn contains(&self, session_id: &str) -> bool {
        self.entries.read().await.contains_key(session_id)
    }

    pub async fn get(&self, session_id: &str) -> Option<SessionEntry> {
        self.entries.read().await.get(session_id).cloned()
    }

    /// All live entries, oldest connection first.
    pub async fn list(&self) -> Vec<SessionEntry> {
        let mut entries: Vec<SessionEntry> = self.entries.read().await.values().cloned().collect();
        entries.sort_by_key(|entry| entry.connected_at);
        entries
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Remove every entry that expired at or before `now` and return their ids.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut entries = self.entries.write().await;
        let expired: Vec<String> = entries
            .values()
            .filter(|entry| entry.expires_at <= now)
            .map(|entry| entry.session_id.clone())
            .collect();

        for session_id in &expired {
            entries.remove(session_id);
        }
        expired
    }
}
