use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::session::{SessionHandle, SessionId, WeakSessionHandle};

/// Set of open sessions, keyed by ID.
///
/// Entries are non-owning: a session's lifetime belongs to whoever holds its
/// [`SessionHandle`]s, and a session removes itself here when it closes.
/// Entries whose task has already exited are skipped and pruned.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, WeakSessionHandle>>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate the ID for a new session.
    pub fn next_session_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<SessionId, WeakSessionHandle>> {
        // The map stays consistent even if a holder panicked.
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, handle: &SessionHandle) {
        let replaced = self.sessions().insert(handle.id(), handle.downgrade());
        if replaced.is_some() {
            log::warn!("session {} registered twice", handle.id());
        }
    }

    pub fn unregister(&self, id: SessionId) -> bool {
        self.sessions().remove(&id).is_some()
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions().is_empty()
    }

    /// IDs of registered sessions, ascending.
    pub fn session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.sessions().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn get(&self, id: SessionId) -> Option<SessionHandle> {
        self.sessions().get(&id).and_then(WeakSessionHandle::upgrade)
    }

    /// Live handles for every registered session, in ID order.
    pub fn snapshot(&self) -> Vec<SessionHandle> {
        let mut sessions = self.sessions();
        let mut handles = Vec::with_capacity(sessions.len());
        sessions.retain(|_, weak| match weak.upgrade() {
            Some(handle) => {
                handles.push(handle);
                true
            }
            None => false,
        });
        drop(sessions);

        handles.sort_unstable_by_key(SessionHandle::id);
        handles
    }

    /// Submit `command` to every registered session.
    ///
    /// Each session echoes the command; only connected ones send it on.
    /// The set is captured up front, so sessions opened or closed meanwhile
    /// do not disturb the iteration. Returns how many sessions accepted it.
    pub async fn broadcast(&self, command: &str) -> usize {
        let targets = self.snapshot();
        log::info!("broadcasting to {} sessions: {command}", targets.len());

        let mut delivered = 0;
        for handle in targets {
            match handle.submit_command(command).await {
                Ok(()) => delivered += 1,
                Err(e) => log::debug!("broadcast skipped: {e}"),
            }
        }
        delivered
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{spawn_session, ConnectionState};
    use crate::testing::{
        wait_for, wait_for_state, FakeState, FakeTransport, Journal, RecordingSink, SharedJournal,
    };
    use crate::transport::ConnectionKind;
    use std::sync::Arc;

    fn open(
        registry: &Arc<SessionRegistry>,
        kind: ConnectionKind,
    ) -> (SessionHandle, Arc<std::sync::Mutex<FakeState>>) {
        let journal: SharedJournal = Arc::new(std::sync::Mutex::new(Journal::default()));
        let (transport, state) = FakeTransport::new(kind, Arc::clone(&journal));
        let (sink, _log) = RecordingSink::new(journal);
        let handle = spawn_session(
            registry.next_session_id(),
            Box::new(transport),
            Box::new(sink),
            Arc::clone(registry),
        );
        (handle, state)
    }

    #[test]
    fn test_ids_are_sequential() {
        let registry = SessionRegistry::new();
        assert_eq!(registry.next_session_id(), 1);
        assert_eq!(registry.next_session_id(), 2);
        assert_eq!(registry.next_session_id(), 3);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_register_and_unregister() {
        let registry = Arc::new(SessionRegistry::new());
        let (a, _) = open(&registry, ConnectionKind::Local);
        let (b, _) = open(&registry, ConnectionKind::Remote);

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.session_ids(), vec![a.id(), b.id()]);
        assert_eq!(registry.get(b.id()).map(|h| h.kind()), Some(ConnectionKind::Remote));

        assert!(registry.unregister(a.id()));
        assert!(!registry.unregister(a.id()));
        assert!(!registry.contains(a.id()));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_entries_do_not_keep_sessions_alive() {
        let registry = Arc::new(SessionRegistry::new());
        let (handle, _) = open(&registry, ConnectionKind::Local);
        let id = handle.id();
        drop(handle);

        // The task exits once its last handle is gone.
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
        while registry.contains(id) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(!registry.contains(id));
        assert!(registry.snapshot().is_empty());
        assert_eq!(registry.broadcast("ls").await, 0);
    }

    #[tokio::test]
    async fn test_closed_session_leaves_registry() {
        let registry = Arc::new(SessionRegistry::new());
        let (keep, _) = open(&registry, ConnectionKind::Local);
        let (gone, _) = open(&registry, ConnectionKind::Local);

        gone.close().await.unwrap();
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
        while registry.contains(gone.id()) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        assert_eq!(registry.session_ids(), vec![keep.id()]);
    }

    #[tokio::test]
    async fn test_broadcast_echoes_everywhere_and_writes_to_connected_only() {
        let registry = Arc::new(SessionRegistry::new());
        let (local, local_state) = open(&registry, ConnectionKind::Local);
        let (remote, remote_state) = open(&registry, ConnectionKind::Remote);
        let (idle, idle_state) = open(&registry, ConnectionKind::Local);

        local.connect().await.unwrap();
        remote.connect().await.unwrap();
        wait_for_state(&local, ConnectionState::Connected).await;
        wait_for_state(&remote, ConnectionState::Connected).await;
        // Broadcast ignores the typing toggle.
        remote.set_input_enabled(false).await.unwrap();

        assert_eq!(registry.broadcast("uptime").await, 3);

        for handle in [&local, &remote, &idle] {
            let snapshot = wait_for(handle, "echo", |s| s.text.contains("uptime")).await;
            assert_eq!(snapshot.text, "uptime\n");
        }
        assert_eq!(local_state.lock().unwrap().writes, vec![b"uptime\n".to_vec()]);
        assert_eq!(remote_state.lock().unwrap().writes, vec![b"uptime\r".to_vec()]);
        assert!(idle_state.lock().unwrap().writes.is_empty());
    }
}
