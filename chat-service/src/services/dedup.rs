//! Idempotent persistence of finished assistant replies.
//!
//! Three checks run in order and any of them short-circuits with a success:
//! the caller's message id, a process-local fingerprint cache with a short
//! window, and a durable fingerprint lookup performed by the store under a
//! row lock. The cache is only a fast path; the store makes the final call.

use crate::config::DedupConfig;
use crate::models::{fingerprint, Message, Role};
use crate::services::metrics;
use crate::services::preview;
use crate::services::store::{AppendOutcome, ChatStore};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use service_core::error::AppError;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// A finished reply the caller wants recorded.
#[derive(Debug, Clone)]
pub struct AssistantReply {
    pub session_id: Uuid,
    /// Client-generated id; ignored when malformed.
    pub message_id: Option<String>,
    pub content: String,
    pub user_input: Option<String>,
    pub images_used: i32,
    /// Client clock at completion. Logged only.
    pub timestamp: Option<String>,
}

/// Which check recognised the reply as already handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateReason {
    MessageId,
    RecentFingerprint,
    StoredFingerprint,
}

impl DuplicateReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MessageId => "message_id",
            Self::RecentFingerprint => "memory",
            Self::StoredFingerprint => "durable",
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Self::MessageId => "Message already logged",
            Self::RecentFingerprint => "Duplicate message ignored (recently logged)",
            Self::StoredFingerprint => "Duplicate message ignored (already stored)",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LogOutcome {
    Created(Message),
    AlreadyLogged {
        reason: DuplicateReason,
        /// Id of the stored message when known.
        message_id: Option<Uuid>,
    },
}

pub struct DedupGuard {
    store: Arc<dyn ChatStore>,
    /// Fingerprint to the instant it was last claimed.
    seen: Arc<DashMap<String, Instant>>,
    memory_window: Duration,
    durable_window: Duration,
    retention: Duration,
}

impl DedupGuard {
    pub fn new(store: Arc<dyn ChatStore>, config: &DedupConfig) -> Self {
        Self {
            store,
            seen: Arc::new(DashMap::new()),
            memory_window: config.memory_window(),
            durable_window: config.durable_window(),
            retention: config.cache_retention().max(config.memory_window()),
        }
    }

    #[instrument(
        skip(self, reply),
        fields(session_id = %reply.session_id, content = %preview(&reply.content))
    )]
    pub async fn log(&self, reply: AssistantReply) -> Result<LogOutcome, AppError> {
        if reply.content.trim().is_empty() {
            return Err(AppError::BadRequest(anyhow::anyhow!("content is required")));
        }
        if self.store.get_session(reply.session_id).await?.is_none() {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Session {} not found",
                reply.session_id
            )));
        }
        if let Some(ts) = &reply.timestamp {
            debug!(client_timestamp = %ts, "Client completion timestamp");
        }

        // 1. Caller-supplied id.
        let client_id = reply.message_id.as_deref().and_then(|raw| match Uuid::parse_str(raw) {
            Ok(id) => Some(id),
            Err(_) => {
                warn!(message_id = %raw, "Ignoring malformed client message id");
                None
            }
        });
        let mut id = client_id.unwrap_or_else(Uuid::new_v4);
        if let Some(candidate) = client_id {
            if let Some(existing) = self.store.find_message(candidate).await? {
                if existing.session_id == reply.session_id && existing.role == Role::Assistant {
                    return Ok(self.duplicate(DuplicateReason::MessageId, Some(existing.id)));
                }
                warn!(message_id = %candidate, "Client id belongs to another message; assigning a fresh id");
                id = Uuid::new_v4();
            }
        }

        // 2. Process-local fingerprint cache.
        let fp = fingerprint(reply.session_id, Role::Assistant, &reply.content);
        let claimed_at = match self.claim(&fp) {
            Some(at) => at,
            None => return Ok(self.duplicate(DuplicateReason::RecentFingerprint, None)),
        };

        // 3. Durable check and conditional insert.
        let message = Message::assistant(
            id,
            reply.session_id,
            reply.content,
            reply.images_used,
            reply.user_input,
        );
        match self
            .store
            .append_unless_duplicate(&message, self.durable_window)
            .await
        {
            Ok(AppendOutcome::Inserted(stored)) => {
                metrics::record_dedup_decision("inserted");
                info!(message_id = %stored.id, "Assistant message logged");
                Ok(LogOutcome::Created(stored))
            }
            Ok(AppendOutcome::Duplicate(existing)) => {
                Ok(self.duplicate(DuplicateReason::StoredFingerprint, Some(existing)))
            }
            Err(e) => {
                self.release(&fp, claimed_at);
                Err(e)
            }
        }
    }

    fn duplicate(&self, reason: DuplicateReason, message_id: Option<Uuid>) -> LogOutcome {
        metrics::record_dedup_decision(reason.as_str());
        info!(reason = reason.as_str(), "Duplicate assistant message skipped");
        LogOutcome::AlreadyLogged { reason, message_id }
    }

    /// Record `fp` as in flight. `None` if it was claimed within the window.
    fn claim(&self, fp: &str) -> Option<Instant> {
        let now = Instant::now();
        match self.seen.entry(fp.to_string()) {
            Entry::Occupied(mut entry) => {
                if now.duration_since(*entry.get()) < self.memory_window {
                    None
                } else {
                    entry.insert(now);
                    Some(now)
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(now);
                Some(now)
            }
        }
    }

    /// Undo a claim after a failed write so a retry is not mistaken for a
    /// duplicate.
    fn release(&self, fp: &str, claimed_at: Instant) {
        self.seen.remove_if(fp, |_, at| *at == claimed_at);
    }

    /// Evict cache entries older than the retention period.
    pub fn sweep(&self) -> usize {
        sweep_map(&self.seen, self.retention)
    }

    pub fn cached_fingerprints(&self) -> usize {
        self.seen.len()
    }

    /// Periodically sweep the cache. The task ends once the guard is dropped.
    pub fn start_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let seen: Weak<DashMap<String, Instant>> = Arc::downgrade(&self.seen);
        let retention = self.retention;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(seen) = seen.upgrade() else {
                    debug!("Dedup guard dropped; sweeper exiting");
                    return;
                };
                let evicted = sweep_map(&seen, retention);
                if evicted > 0 {
                    debug!(evicted, remaining = seen.len(), "Swept fingerprint cache");
                }
            }
        })
    }
}

fn sweep_map(seen: &DashMap<String, Instant>, retention: Duration) -> usize {
    let before = seen.len();
    let now = Instant::now();
    seen.retain(|_, at| now.duration_since(*at) < retention);
    before.saturating_sub(seen.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Session;
    use crate::services::store::InMemoryChatStore;

    async fn guard_with_session(config: DedupConfig) -> (DedupGuard, Arc<InMemoryChatStore>, Uuid) {
        let store = Arc::new(InMemoryChatStore::new());
        let session = store
            .create_session(&Session::new("s".into(), "echo".into()))
            .await
            .unwrap();
        let guard = DedupGuard::new(store.clone(), &config);
        (guard, store, session.id)
    }

    fn reply(session_id: Uuid, content: &str) -> AssistantReply {
        AssistantReply {
            session_id,
            message_id: None,
            content: content.to_string(),
            user_input: Some("question".into()),
            images_used: 0,
            timestamp: None,
        }
    }

    #[tokio::test]
    async fn identical_content_is_stored_once() {
        let (guard, store, session_id) = guard_with_session(DedupConfig::default()).await;

        let first = guard.log(reply(session_id, "answer")).await.unwrap();
        let second = guard.log(reply(session_id, "answer")).await.unwrap();

        assert!(matches!(first, LogOutcome::Created(_)));
        assert_eq!(
            second,
            LogOutcome::AlreadyLogged {
                reason: DuplicateReason::RecentFingerprint,
                message_id: None
            }
        );
        assert_eq!(store.list_messages(session_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn durable_check_catches_what_the_cache_forgot() {
        let config = DedupConfig {
            memory_window_secs: 0,
            ..DedupConfig::default()
        };
        let (guard, store, session_id) = guard_with_session(config).await;

        let first = guard.log(reply(session_id, "answer")).await.unwrap();
        let LogOutcome::Created(stored) = first else {
            panic!("first log should insert");
        };
        let second = guard.log(reply(session_id, "answer")).await.unwrap();

        assert_eq!(
            second,
            LogOutcome::AlreadyLogged {
                reason: DuplicateReason::StoredFingerprint,
                message_id: Some(stored.id)
            }
        );
        assert_eq!(store.list_messages(session_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn known_client_id_short_circuits() {
        let (guard, store, session_id) = guard_with_session(DedupConfig::default()).await;
        let id = Uuid::new_v4();

        let mut first = reply(session_id, "one");
        first.message_id = Some(id.to_string());
        let LogOutcome::Created(stored) = guard.log(first).await.unwrap() else {
            panic!("expected insert");
        };
        assert_eq!(stored.id, id);

        let mut retry = reply(session_id, "different text");
        retry.message_id = Some(id.to_string());
        assert_eq!(
            guard.log(retry).await.unwrap(),
            LogOutcome::AlreadyLogged {
                reason: DuplicateReason::MessageId,
                message_id: Some(id)
            }
        );
        assert_eq!(store.list_messages(session_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn malformed_or_foreign_ids_get_fresh_ids() {
        let (guard, store, session_id) = guard_with_session(DedupConfig::default()).await;
        let user = store
            .append_message(&Message::user(session_id, "q".into(), vec![]))
            .await
            .unwrap();

        let mut foreign = reply(session_id, "a1");
        foreign.message_id = Some(user.id.to_string());
        let LogOutcome::Created(a1) = guard.log(foreign).await.unwrap() else {
            panic!("expected insert");
        };
        assert_ne!(a1.id, user.id);

        let mut malformed = reply(session_id, "a2");
        malformed.message_id = Some("not-a-uuid".into());
        assert!(matches!(
            guard.log(malformed).await.unwrap(),
            LogOutcome::Created(_)
        ));
    }

    #[tokio::test]
    async fn different_content_is_each_stored() {
        let (guard, store, session_id) = guard_with_session(DedupConfig::default()).await;
        for text in ["first", "second", "third"] {
            assert!(matches!(
                guard.log(reply(session_id, text)).await.unwrap(),
                LogOutcome::Created(_)
            ));
        }
        assert_eq!(store.list_messages(session_id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn unknown_session_and_empty_content_are_rejected() {
        let (guard, store, session_id) = guard_with_session(DedupConfig::default()).await;

        let err = guard.log(reply(Uuid::new_v4(), "x")).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        let err = guard.log(reply(session_id, "   ")).await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));

        assert!(store.list_messages(session_id).await.unwrap().is_empty());
        assert_eq!(guard.cached_fingerprints(), 0);
    }

    #[tokio::test]
    async fn concurrent_duplicates_persist_exactly_once() {
        let config = DedupConfig {
            memory_window_secs: 0,
            ..DedupConfig::default()
        };
        let (guard, store, session_id) = guard_with_session(config).await;
        let guard = Arc::new(guard);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let guard = guard.clone();
            handles.push(tokio::spawn(async move {
                guard.log(reply(session_id, "same reply")).await
            }));
        }
        let mut created = 0;
        for handle in handles {
            if let LogOutcome::Created(_) = handle.await.unwrap().unwrap() {
                created += 1;
            }
        }

        assert_eq!(created, 1);
        assert_eq!(store.list_messages(session_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sweep_evicts_entries_past_retention() {
        let config = DedupConfig {
            memory_window_secs: 0,
            cache_retention_secs: 0,
            ..DedupConfig::default()
        };
        let (guard, _, session_id) = guard_with_session(config).await;
        guard.log(reply(session_id, "x")).await.unwrap();
        assert_eq!(guard.cached_fingerprints(), 1);

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(guard.sweep(), 1);
        assert_eq!(guard.cached_fingerprints(), 0);
    }

    #[tokio::test]
    async fn sweeper_stops_when_guard_is_dropped() {
        let (guard, _, _) = guard_with_session(DedupConfig::default()).await;
        let handle = guard.start_sweeper(Duration::from_millis(10));
        drop(guard);

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("sweeper did not stop")
            .unwrap();
    }
}
