//! # Session Registry
//!
//! Process-wide table of live calls, injected wherever it is needed rather
//! than reached through a global. Each operation takes the table lock once,
//! so create, lookup and remove are individually atomic.
//!
//! A session is registered when the telephony `start` message arrives and
//! stays registered until it is `ENDED` and finalized; removing it any earlier
//! is refused.

use crate::call::session::{CallSession, CallSnapshot, SessionSettings};
use crate::call::state::{CallState, EndReason};
use crate::error::{BridgeError, BridgeResult};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<CallSession>>>,
    max_concurrent_calls: usize,
    total_created: AtomicU64,
}

/// Counts for `/health`.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySummary {
    pub active_calls: usize,
    pub max_concurrent_calls: usize,
    pub total_created: u64,
    pub by_state: HashMap<CallState, usize>,
}

impl SessionRegistry {
    pub fn new(max_concurrent_calls: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_concurrent_calls,
            total_created: AtomicU64::new(0),
        }
    }

    /// Register a new `INITIATED` session.
    ///
    /// ## Returns:
    /// - **Err(DuplicateCallId)**: a session with this id is still registered
    /// - **Err(CapacityReached)**: the concurrent call limit is reached
    pub fn create(&self, call_id: &str, settings: SessionSettings) -> BridgeResult<Arc<CallSession>> {
        let mut sessions = self.sessions.write();

        if sessions.contains_key(call_id) {
            return Err(BridgeError::DuplicateCallId(call_id.to_string()));
        }
        if sessions.len() >= self.max_concurrent_calls {
            return Err(BridgeError::CapacityReached(self.max_concurrent_calls));
        }

        let session = Arc::new(CallSession::new(call_id, settings));
        sessions.insert(call_id.to_string(), session.clone());
        self.total_created.fetch_add(1, Ordering::Relaxed);

        info!(call_id, active = sessions.len(), "Call registered");
        Ok(session)
    }

    pub fn lookup(&self, call_id: &str) -> Option<Arc<CallSession>> {
        self.sessions.read().get(call_id).cloned()
    }

    /// Like `lookup`, but a missing call is an error.
    pub fn get(&self, call_id: &str) -> BridgeResult<Arc<CallSession>> {
        self.lookup(call_id)
            .ok_or_else(|| BridgeError::NotFound(call_id.to_string()))
    }

    /// Evict a finished session.
    pub fn remove(&self, call_id: &str) -> BridgeResult<Arc<CallSession>> {
        let mut sessions = self.sessions.write();

        let state = match sessions.get(call_id) {
            Some(session) => session.state(),
            None => return Err(BridgeError::NotFound(call_id.to_string())),
        };
        if !state.is_terminal() {
            return Err(BridgeError::InvalidStateTransition {
                call_id: call_id.to_string(),
                from: state,
                operation: "remove",
            });
        }

        let session = sessions
            .remove(call_id)
            .ok_or_else(|| BridgeError::NotFound(call_id.to_string()))?;
        debug!(call_id, active = sessions.len(), "Call removed from registry");
        Ok(session)
    }

    /// Ask every registered call to end. Returns how many accepted.
    pub fn end_all(&self, reason: EndReason) -> usize {
        let ended = self
            .sessions()
            .iter()
            .filter(|session| session.request_end(reason))
            .count();
        if ended > 0 {
            info!(ended, reason = %reason, "Ending all calls");
        }
        ended
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    pub fn sessions(&self) -> Vec<Arc<CallSession>> {
        self.sessions.read().values().cloned().collect()
    }

    /// Snapshots ordered by start time, oldest first.
    pub fn snapshots(&self) -> Vec<CallSnapshot> {
        let mut snapshots: Vec<_> = self.sessions().iter().map(|s| s.snapshot()).collect();
        snapshots.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        snapshots
    }

    pub fn summary(&self) -> RegistrySummary {
        let sessions = self.sessions.read();
        let mut by_state = HashMap::new();
        for session in sessions.values() {
            *by_state.entry(session.state()).or_insert(0) += 1;
        }

        RegistrySummary {
            active_calls: sessions.len(),
            max_concurrent_calls: self.max_concurrent_calls,
            total_created: self.total_created.load(Ordering::Relaxed),
            by_state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_call_id_rejected() {
        let registry = SessionRegistry::new(4);
        registry.create("CA1", SessionSettings::default()).unwrap();

        let err = registry.create("CA1", SessionSettings::default()).unwrap_err();
        assert_eq!(err, BridgeError::DuplicateCallId("CA1".to_string()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_capacity_limit() {
        let registry = SessionRegistry::new(1);
        registry.create("CA1", SessionSettings::default()).unwrap();
        assert!(matches!(
            registry.create("CA2", SessionSettings::default()),
            Err(BridgeError::CapacityReached(1))
        ));
    }

    #[test]
    fn test_remove_only_when_ended() {
        let registry = SessionRegistry::new(4);
        let session = registry.create("CA1", SessionSettings::default()).unwrap();
        let _handles = session.begin_streaming().unwrap();

        assert!(matches!(
            registry.remove("CA1"),
            Err(BridgeError::InvalidStateTransition { from: CallState::Streaming, .. })
        ));

        session.request_end(EndReason::CallerHungUp);
        assert!(registry.remove("CA1").is_err());

        session.finish().unwrap();
        assert!(registry.remove("CA1").is_ok());
        assert!(registry.lookup("CA1").is_none());
        assert!(matches!(registry.remove("CA1"), Err(BridgeError::NotFound(_))));
    }

    #[test]
    fn test_summary_counts_states() {
        let registry = SessionRegistry::new(4);
        registry.create("CA1", SessionSettings::default()).unwrap();
        let streaming = registry.create("CA2", SessionSettings::default()).unwrap();
        let _handles = streaming.begin_streaming().unwrap();

        let summary = registry.summary();
        assert_eq!(summary.active_calls, 2);
        assert_eq!(summary.total_created, 2);
        assert_eq!(summary.by_state.get(&CallState::Initiated), Some(&1));
        assert_eq!(summary.by_state.get(&CallState::Streaming), Some(&1));
    }

    #[test]
    fn test_end_all_requests_shutdown() {
        let registry = SessionRegistry::new(4);
        let a = registry.create("CA1", SessionSettings::default()).unwrap();
        let b = registry.create("CA2", SessionSettings::default()).unwrap();
        let _handles = a.begin_streaming().unwrap();

        assert_eq!(registry.end_all(EndReason::Shutdown), 2);
        assert_eq!(a.state(), CallState::Ending);
        assert_eq!(b.end_reason(), Some(EndReason::Shutdown));
    }

    #[tokio::test]
    async fn test_concurrent_creates_are_atomic() {
        let registry = Arc::new(SessionRegistry::new(100));
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                registry.create("CA-same", SessionSettings::default()).is_ok()
            }));
        }

        let mut created = 0;
        for task in tasks {
            if task.await.unwrap() {
                created += 1;
            }
        }
        assert_eq!(created, 1);
    }
}
