//! # Conversation Session Manager
//!
//! Owns the table of `ConversationSession`s, one per user key.
//!
//! ## State machine per user key:
//! ```text
//! Absent --acquire/prewarm--> Active --turn ok--> Active (sequence + 1)
//! Active --session invalid--> Absent --next acquire--> Active (fresh handshake)
//! Active --idle past TTL----> Absent (on next access or sweep)
//! ```
//!
//! ## Concurrency:
//! Each user key has its own async mutex. A handshake runs while holding it,
//! so concurrent turns for the same user wait for a single handshake and
//! then draw consecutive sequence numbers. Different users never contend.
//!
//! A second per-user lock (`turn_lock`) is held by the executor for a whole
//! turn, so the backend receives one user's turns in sequence order.
//!
//! Storage is private to this type; callers only see the methods below, so
//! the map can be replaced by an external store without touching them.

use super::AgentBackend;
use crate::error::{PipelineError, PipelineResult};
use crate::messaging::mask_user_key;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ConversationSession {
    pub session_id: String,
    /// Last sequence number handed out; the first turn uses 1
    pub sequence_number: u64,
    pub last_used_at: Instant,
}

impl ConversationSession {
    fn new(session_id: String) -> Self {
        Self {
            session_id,
            sequence_number: 0,
            last_used_at: Instant::now(),
        }
    }

    fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.duration_since(self.last_used_at) >= ttl
    }
}

/// What a turn needs from its session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLease {
    pub session_id: String,
    pub sequence_number: u64,
}

type Slot = Arc<Mutex<Option<ConversationSession>>>;

pub struct SessionManager {
    backend: Arc<dyn AgentBackend>,
    ttl: Duration,
    slots: DashMap<String, Slot>,
    turns: DashMap<String, Arc<Mutex<()>>>,
}

impl SessionManager {
    pub fn new(backend: Arc<dyn AgentBackend>, ttl: Duration) -> Self {
        Self {
            backend,
            ttl,
            slots: DashMap::new(),
            turns: DashMap::new(),
        }
    }

    fn slot(&self, user_key: &str) -> Slot {
        self.slots.entry(user_key.to_string()).or_default().clone()
    }

    /// Current session for `user_key`, opening one if absent or expired.
    async fn ensure(&self, user_key: &str, consume: bool) -> PipelineResult<SessionLease> {
        let slot = self.slot(user_key);
        let mut guard = slot.lock().await;
        let now = Instant::now();

        let mut session = match guard.take() {
            Some(existing) if !existing.is_expired(now, self.ttl) => existing,
            previous => {
                if let Some(expired) = previous {
                    debug!(user = %mask_user_key(user_key), session_id = %expired.session_id, "Session idle past TTL");
                }
                let session_id = self.backend.create_session(user_key).await?;
                info!(user = %mask_user_key(user_key), session_id = %session_id, "Session established");
                ConversationSession::new(session_id)
            }
        };

        if consume {
            session.sequence_number += 1;
        }
        session.last_used_at = Instant::now();

        let lease = SessionLease {
            session_id: session.session_id.clone(),
            sequence_number: session.sequence_number,
        };
        *guard = Some(session);
        Ok(lease)
    }

    /// A valid session id and the next sequence number for one turn attempt.
    pub async fn acquire(&self, user_key: &str) -> PipelineResult<SessionLease> {
        self.ensure(user_key, true).await
    }

    /// Exclusive right to run a turn for `user_key` until the guard drops.
    pub async fn turn_lock(&self, user_key: &str) -> OwnedMutexGuard<()> {
        let lock = self.turns.entry(user_key.to_string()).or_default().clone();
        lock.lock_owned().await
    }

    /// Make sure a session exists without consuming a sequence number, so
    /// the handshake overlaps the media download.
    pub async fn prewarm(&self, user_key: &str) -> PipelineResult<()> {
        self.ensure(user_key, false).await.map(|_| ())
    }

    /// Drop the session if it is still `session_id`. Returns whether it was
    /// dropped; a newer session opened by a concurrent turn is kept.
    pub async fn invalidate(&self, user_key: &str, session_id: &str) -> bool {
        let Some(slot) = self.slots.get(user_key).map(|s| s.clone()) else {
            return false;
        };
        let mut guard = slot.lock().await;
        if guard.as_ref().is_some_and(|s| s.session_id == session_id) {
            *guard = None;
            warn!(user = %mask_user_key(user_key), session_id, "Session invalidated");
            true
        } else {
            false
        }
    }

    /// Report a failed turn. Only a session-invalid failure changes state;
    /// transport and backend failures leave the session in place.
    pub async fn record_turn_failure(&self, user_key: &str, session_id: &str, error: &PipelineError) -> bool {
        match error {
            PipelineError::SessionInvalid(_) => self.invalidate(user_key, session_id).await,
            _ => false,
        }
    }

    /// Remove idle sessions. Slots that are locked or referenced by an
    /// in-flight call are left for the next sweep.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.turns.retain(|_, lock| Arc::strong_count(lock) > 1);
        self.slots.retain(|_, slot| {
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            match slot.try_lock() {
                Ok(guard) => match guard.as_ref() {
                    Some(session) if !session.is_expired(now, self.ttl) => true,
                    Some(_) => {
                        removed += 1;
                        false
                    }
                    None => false,
                },
                Err(_) => true,
            }
        });
        removed
    }

    /// Sessions currently believed alive. Busy slots count as active.
    pub fn active_count(&self) -> usize {
        let now = Instant::now();
        self.slots
            .iter()
            .filter(|entry| match entry.value().try_lock() {
                Ok(guard) => guard.as_ref().is_some_and(|s| !s.is_expired(now, self.ttl)),
                Err(_) => true,
            })
            .count()
    }

    #[cfg(test)]
    pub async fn get(&self, user_key: &str) -> Option<ConversationSession> {
        let slot = self.slots.get(user_key).map(|s| s.clone())?;
        let guard = slot.lock().await;
        guard.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct HandshakeCounter {
        handshakes: AtomicU32,
        delay: Duration,
    }

    #[async_trait]
    impl AgentBackend for HandshakeCounter {
        async fn create_session(&self, _user_key: &str) -> PipelineResult<String> {
            tokio::time::sleep(self.delay).await;
            let n = self.handshakes.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("session-{}", n))
        }

        async fn send_turn(&self, _session_id: &str, _sequence_number: u64, _text: &str) -> PipelineResult<String> {
            Ok(String::new())
        }
    }

    fn manager(ttl: Duration) -> (Arc<SessionManager>, Arc<HandshakeCounter>) {
        let backend = Arc::new(HandshakeCounter {
            handshakes: AtomicU32::new(0),
            delay: Duration::from_millis(10),
        });
        (Arc::new(SessionManager::new(backend.clone(), ttl)), backend)
    }

    #[tokio::test]
    async fn test_sequence_numbers_increase_per_turn() {
        let (sessions, backend) = manager(Duration::from_secs(60));
        let first = sessions.acquire("+201234").await.unwrap();
        let second = sessions.acquire("+201234").await.unwrap();
        assert_eq!(first.session_id, second.session_id);
        assert_eq!((first.sequence_number, second.sequence_number), (1, 2));
        assert_eq!(backend.handshakes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_prewarm_does_not_consume_sequence_number() {
        let (sessions, backend) = manager(Duration::from_secs(60));
        sessions.prewarm("+1555").await.unwrap();
        sessions.prewarm("+1555").await.unwrap();
        let lease = sessions.acquire("+1555").await.unwrap();
        assert_eq!(lease.sequence_number, 1);
        assert_eq!(backend.handshakes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_turns_never_share_a_sequence_number() {
        let (sessions, backend) = manager(Duration::from_secs(60));
        let handles: Vec<_> = (0..20)
            .map(|_| {
                let sessions = sessions.clone();
                tokio::spawn(async move { sessions.acquire("+1555").await.unwrap() })
            })
            .collect();

        let mut numbers = HashSet::new();
        for handle in handles {
            let lease = handle.await.unwrap();
            assert_eq!(lease.session_id, "session-1");
            assert!(numbers.insert(lease.sequence_number));
        }
        assert_eq!(numbers, (1..=20).collect::<HashSet<u64>>());
        assert_eq!(backend.handshakes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_only_session_invalid_failures_reset_state() {
        let (sessions, backend) = manager(Duration::from_secs(60));
        let lease = sessions.acquire("+1555").await.unwrap();

        let transport = PipelineError::Transport("reset".into());
        assert!(!sessions.record_turn_failure("+1555", &lease.session_id, &transport).await);
        assert_eq!(sessions.acquire("+1555").await.unwrap().session_id, "session-1");

        let invalid = PipelineError::SessionInvalid("404".into());
        assert!(sessions.record_turn_failure("+1555", &lease.session_id, &invalid).await);
        let fresh = sessions.acquire("+1555").await.unwrap();
        assert_eq!(fresh.session_id, "session-2");
        assert_eq!(fresh.sequence_number, 1);
        assert_eq!(backend.handshakes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_stale_invalidation_keeps_newer_session() {
        let (sessions, _) = manager(Duration::from_secs(60));
        let old = sessions.acquire("+1555").await.unwrap();
        sessions.invalidate("+1555", &old.session_id).await;
        let new = sessions.acquire("+1555").await.unwrap();

        assert!(!sessions.invalidate("+1555", &old.session_id).await);
        assert_eq!(sessions.get("+1555").await.unwrap().session_id, new.session_id);
    }

    #[tokio::test]
    async fn test_idle_sessions_expire() {
        let (sessions, backend) = manager(Duration::from_millis(30));
        sessions.acquire("+1555").await.unwrap();
        sessions.acquire("+1666").await.unwrap();
        assert_eq!(sessions.active_count(), 2);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sessions.active_count(), 0);

        // Lazy expiry on access
        let lease = sessions.acquire("+1555").await.unwrap();
        assert_eq!(lease.session_id, "session-3");
        assert_eq!(backend.handshakes.load(Ordering::SeqCst), 3);

        // Sweep removes the other one
        assert_eq!(sessions.sweep_expired(), 1);
        assert!(sessions.get("+1666").await.is_none());
    }
}
