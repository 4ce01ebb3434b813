//! Registry of live sessions.
//!
//! Sessions are registered when a transport accepts a request and removed
//! when the returned [`SessionGuard`] is dropped, so an adapter that bails
//! out early cannot leave a stale entry behind.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use protocol::SessionSummary;
use tokio::sync::Notify;

use super::{CloseReason, Session, SessionError, SessionId};

/// Thread-safe session registry using DashMap.
pub struct SessionRegistry {
    /// Map of session ID to session.
    sessions: DashMap<SessionId, Arc<Session>>,
    /// Slots in use, including ones reserved but not yet inserted.
    active: AtomicUsize,
    /// Maximum concurrent sessions; zero means unlimited.
    max_sessions: usize,
    removed: Notify,
}

impl SessionRegistry {
    /// Creates a registry allowing at most `max_sessions` live sessions.
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            active: AtomicUsize::new(0),
            max_sessions,
            removed: Notify::new(),
        }
    }

    /// Registers a session. The entry lives as long as the returned guard.
    pub fn register(self: &Arc<Self>, session: Arc<Session>) -> Result<SessionGuard, SessionError> {
        let max = self.max_sessions;
        let reserved = self
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (max == 0 || n < max).then_some(n + 1)
            });
        if let Err(current) = reserved {
            tracing::warn!(active = current, max = max, "Session limit reached");
            return Err(SessionError::LimitReached(current));
        }

        let id = session.id().clone();
        tracing::debug!(session_id = %id, mode = %session.mode(), "Registered session");
        self.sessions.insert(id.clone(), session);

        Ok(SessionGuard {
            registry: Arc::clone(self),
            id,
        })
    }

    fn unregister(&self, id: &SessionId) {
        if self.sessions.remove(id).is_some() {
            self.active.fetch_sub(1, Ordering::SeqCst);
            tracing::debug!(session_id = %id, "Unregistered session");
            self.removed.notify_waiters();
        }
    }

    /// Returns a session by ID.
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Returns the number of live sessions.
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Lists live sessions, oldest first.
    pub fn list(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<_> = self
            .sessions
            .iter()
            .map(|entry| entry.value().summary())
            .collect();
        summaries.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
        summaries
    }

    /// Cancels one session.
    pub fn cancel(&self, id: &str) -> Result<(), SessionError> {
        let session = self
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        session.cancel();
        Ok(())
    }

    /// Cancels every live session. Returns how many were signalled.
    pub fn cancel_all(&self, reason: CloseReason) -> usize {
        let sessions: Vec<_> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for session in &sessions {
            session.cancel_with(reason.clone());
        }
        if !sessions.is_empty() {
            tracing::info!(count = sessions.len(), reason = %reason, "Cancelled sessions");
        }
        sessions.len()
    }

    /// Waits until no session is registered. Returns false on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let idle = async {
            loop {
                let notified = self.removed.notified();
                if self.sessions.is_empty() {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, idle).await.is_ok()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Keeps a session registered until dropped.
pub struct SessionGuard {
    registry: Arc<SessionRegistry>,
    id: SessionId,
}

impl SessionGuard {
    /// Returns the guarded session ID.
    pub fn id(&self) -> &SessionId {
        &self.id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.unregister(&self.id);
    }
}
