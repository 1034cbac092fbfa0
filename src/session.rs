//! Session registry (component F).
//!
//! A session groups a caller's tasks under one directory and tracks
//! activity; unlike the teacher's `SessionManager`, a session here is not a
//! process to supervise — it is a lightweight counter plus a lock that
//! serializes calls sharing a session id. Grounded on the original's
//! `session_manager.py::SessionData`/`SessionManager` for the state
//! machine, and on the teacher's `session.rs::SessionManager` for the
//! `RwLock<HashMap<..>>` + per-key lock + background reaper shape.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

/// Snapshot of a session's activity, safe to serialize into a status tool
/// response.
#[derive(Debug, Clone, Serialize)]
pub struct SessionState {
    pub session_id: String,
    pub created_at: u64,
    pub last_activity: u64,
    pub task_count: u64,
}

impl SessionState {
    fn new(session_id: String) -> Self {
        let now = unix_now();
        Self {
            session_id,
            created_at: now,
            last_activity: now,
            task_count: 0,
        }
    }

    fn touch(&mut self) {
        self.last_activity = unix_now();
        self.task_count += 1;
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is after the epoch")
        .as_secs()
}

/// Optional bound on how many idle sessions the registry keeps around.
/// `None` reproduces the original's behavior of never evicting a session
/// except by explicit removal (SPEC_FULL.md §9's open-question decision).
#[derive(Debug, Clone, Default)]
pub struct SessionRegistryConfig {
    pub max_sessions: Option<usize>,
    pub idle_timeout: Option<Duration>,
}

/// Tracks active sessions and the per-session lock that serializes
/// concurrent calls sharing a `session_id`.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionState>>,
    locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
    config: SessionRegistryConfig,
}

impl SessionRegistry {
    #[must_use]
    pub fn new(config: SessionRegistryConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            locks: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Per-session lock, created on first use. Mirrors the teacher's
    /// `get_execute_lock` fast-path-read/slow-path-write pattern.
    pub async fn lock_for(&self, session_id: &str) -> Arc<Mutex<()>> {
        {
            let locks = self.locks.read().await;
            if let Some(lock) = locks.get(session_id) {
                return Arc::clone(lock);
            }
        }
        let mut locks = self.locks.write().await;
        Arc::clone(
            locks
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Look up a session without marking it active.
    pub async fn get(&self, session_id: &str) -> Option<SessionState> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Get an existing session or create one, bumping `last_activity` and
    /// `task_count` either way — matching `get_or_create_session`'s
    /// behavior of always calling `update_activity()`.
    pub async fn get_or_create(&self, session_id: Option<&str>) -> SessionState {
        if let Some(id) = session_id {
            let mut sessions = self.sessions.write().await;
            if let Some(state) = sessions.get_mut(id) {
                state.touch();
                return state.clone();
            }
        }

        let id = session_id
            .map(str::to_string)
            .unwrap_or_else(generate_session_id);

        let mut sessions = self.sessions.write().await;
        let state = sessions
            .entry(id.clone())
            .or_insert_with(|| SessionState::new(id.clone()));
        state.touch();
        info!(session = %id, "Session activated");
        state.clone()
    }

    /// Reset a session's task counter without destroying it, matching
    /// `clear_session`.
    pub async fn reset(&self, session_id: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        if let Some(state) = sessions.get_mut(session_id) {
            state.task_count = 0;
            state.last_activity = unix_now();
            true
        } else {
            false
        }
    }

    /// Snapshot of every tracked session, matching `get_session_stats`.
    pub async fn stats(&self) -> Vec<SessionState> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Evict idle sessions past `idle_timeout`, and if `max_sessions` is
    /// set, evict the least-recently-active sessions beyond the bound.
    /// A no-op when both are unset (the spec's default: sessions persist
    /// for the life of the process).
    pub async fn cleanup_expired(&self) {
        let mut sessions = self.sessions.write().await;

        if let Some(idle_timeout) = self.config.idle_timeout {
            let cutoff = unix_now().saturating_sub(idle_timeout.as_secs());
            let expired: Vec<String> = sessions
                .iter()
                .filter(|(_, s)| s.last_activity < cutoff)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &expired {
                sessions.remove(id);
                debug!(session = %id, "Evicted idle session");
            }
        }

        if let Some(max_sessions) = self.config.max_sessions {
            if sessions.len() > max_sessions {
                let mut by_activity: Vec<(String, u64)> = sessions
                    .iter()
                    .map(|(id, s)| (id.clone(), s.last_activity))
                    .collect();
                by_activity.sort_by_key(|(_, activity)| *activity);
                let overflow = sessions.len() - max_sessions;
                for (id, _) in by_activity.into_iter().take(overflow) {
                    sessions.remove(&id);
                    debug!(session = %id, "Evicted session over max_sessions bound");
                }
            }
        }

        drop(sessions);
        let mut locks = self.locks.write().await;
        let sessions = self.sessions.read().await;
        locks.retain(|id, _| sessions.contains_key(id));
    }

    /// Start the background eviction task. A no-op sweep if the registry
    /// has no bounds configured, reproducing the teacher's
    /// `start_reaper` daemon-task shape.
    pub fn start_reaper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                registry.cleanup_expired().await;
            }
        })
    }
}

/// `sid_<unix_time>_<8 hex chars>`, matching `generate_session_id`'s
/// `sid_{timestamp}_{os.urandom(4).hex()}` shape. Uses a process-local
/// counter mixed with the time instead of OS randomness, since the crate
/// has no other dependency on a CSPRNG.
fn generate_session_id() -> String {
    use std::sync::atomic::{AtomicU32, Ordering};
    static COUNTER: AtomicU32 = AtomicU32::new(0);

    let ts = unix_now();
    let nonce = COUNTER.fetch_add(1, Ordering::Relaxed);
    let pid = std::process::id();
    format!("sid_{ts}_{:08x}", nonce ^ pid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_or_create_generates_id_when_none_given() {
        let registry = SessionRegistry::new(SessionRegistryConfig::default());
        let state = registry.get_or_create(None).await;
        assert!(state.session_id.starts_with("sid_"));
        assert_eq!(state.task_count, 1);
    }

    #[tokio::test]
    async fn get_or_create_bumps_activity_on_existing_session() {
        let registry = SessionRegistry::new(SessionRegistryConfig::default());
        let first = registry.get_or_create(Some("s1")).await;
        let second = registry.get_or_create(Some("s1")).await;
        assert_eq!(first.session_id, second.session_id);
        assert_eq!(second.task_count, 2);
    }

    #[tokio::test]
    async fn reset_zeroes_task_count() {
        let registry = SessionRegistry::new(SessionRegistryConfig::default());
        registry.get_or_create(Some("s1")).await;
        registry.get_or_create(Some("s1")).await;
        assert!(registry.reset("s1").await);
        let state = registry.get("s1").await.unwrap();
        assert_eq!(state.task_count, 0);
    }

    #[tokio::test]
    async fn reset_unknown_session_returns_false() {
        let registry = SessionRegistry::new(SessionRegistryConfig::default());
        assert!(!registry.reset("missing").await);
    }

    #[tokio::test]
    async fn unbounded_registry_never_evicts() {
        let registry = SessionRegistry::new(SessionRegistryConfig::default());
        for i in 0..5 {
            registry.get_or_create(Some(&format!("s{i}"))).await;
        }
        registry.cleanup_expired().await;
        assert_eq!(registry.stats().await.len(), 5);
    }

    #[tokio::test]
    async fn bounded_registry_evicts_least_recently_active() {
        let registry = SessionRegistry::new(SessionRegistryConfig {
            max_sessions: Some(2),
            idle_timeout: None,
        });
        registry.get_or_create(Some("old")).await;
        registry.get_or_create(Some("mid")).await;
        registry.get_or_create(Some("new")).await;
        registry.cleanup_expired().await;
        let remaining: Vec<String> = registry
            .stats()
            .await
            .into_iter()
            .map(|s| s.session_id)
            .collect();
        assert_eq!(remaining.len(), 2);
        assert!(!remaining.contains(&"old".to_string()));
    }

    #[tokio::test]
    async fn same_session_shares_one_lock_instance() {
        let registry = SessionRegistry::new(SessionRegistryConfig::default());
        let a = registry.lock_for("s1").await;
        let b = registry.lock_for("s1").await;
        assert!(Arc::ptr_eq(&a, &b));
    }
}
