//! Live helper sessions, indexed by identity.
//!
//! Entries are added once a handshake succeeds and removed when the
//! session's receive loop ends or the session is dropped, whichever comes
//! first.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant, SystemTime},
};

use serde::Serialize;
use warden_common::Capabilities;

/// Point-in-time summary of one connected helper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    /// Numeric UID; 0 on Windows
    pub uid:          u32,
    pub identity_key: String,
    pub username:     String,
    pub display_env:  String,
    pub session_id:   String,
    pub pid:          u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Capabilities>,
    pub connected_at: SystemTime,
}

/// State a session shares with the registry.
pub(crate) struct SessionState {
    info:         SessionInfo,
    capabilities: Mutex<Option<Capabilities>>,
    last_seen:    Mutex<Instant>,
    closer:       Box<dyn Fn() + Send + Sync>,
}

impl SessionState {
    pub(crate) fn new<F>(info: SessionInfo, closer: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            info,
            capabilities: Mutex::new(None),
            last_seen: Mutex::new(Instant::now()),
            closer: Box::new(closer),
        }
    }

    pub(crate) fn info(&self) -> SessionInfo {
        SessionInfo {
            capabilities: self.capabilities(),
            ..self.info.clone()
        }
    }

    pub(crate) fn capabilities(&self) -> Option<Capabilities> {
        lock(&self.capabilities).clone()
    }

    pub(crate) fn set_capabilities(&self, capabilities: Capabilities) {
        *lock(&self.capabilities) = Some(capabilities);
    }

    pub(crate) fn touch(&self) {
        *lock(&self.last_seen) = Instant::now();
    }

    pub(crate) fn last_seen(&self) -> Instant {
        *lock(&self.last_seen)
    }

    pub(crate) fn idle_duration(&self) -> Duration {
        self.last_seen().elapsed()
    }

    /// Shuts the connection down; the blocked receive loop then ends.
    pub(crate) fn close(&self) {
        (self.closer)();
    }
}

#[derive(Default)]
struct Sessions {
    next_id:     u64,
    by_id:       HashMap<u64, Arc<SessionState>>,
    /// Registry ids per identity key, oldest first
    by_identity: HashMap<String, Vec<u64>>,
}

/// Every live session the broker admitted.
#[derive(Default)]
pub(crate) struct Registry {
    sessions: Mutex<Sessions>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("sessions", &self.len())
            .finish()
    }
}

impl Registry {
    pub(crate) fn count_for(&self, identity_key: &str) -> usize {
        lock(&self.sessions)
            .by_identity
            .get(identity_key)
            .map_or(0, Vec::len)
    }

    /// Adds a session unless its identity already holds `max` of them, in
    /// which case the live count is returned.
    pub(crate) fn register(self: &Arc<Self>, state: Arc<SessionState>, max: usize) -> Result<Registration, usize> {
        let mut sessions = lock(&self.sessions);
        let key = state.info.identity_key.clone();
        let count = sessions.by_identity.get(&key).map_or(0, Vec::len);
        if count >= max {
            return Err(count);
        }

        let id = sessions.next_id;
        sessions.next_id += 1;
        sessions.by_id.insert(id, state);
        sessions.by_identity.entry(key).or_default().push(id);

        Ok(Registration {
            registry: Arc::clone(self),
            id,
        })
    }

    fn remove(&self, id: u64) {
        let mut sessions = lock(&self.sessions);
        let Some(state) = sessions.by_id.remove(&id) else {
            return;
        };
        let key = &state.info.identity_key;
        let now_empty = match sessions.by_identity.get_mut(key) {
            Some(ids) => {
                ids.retain(|other| *other != id);
                ids.is_empty()
            }
            None => false,
        };
        if now_empty {
            sessions.by_identity.remove(key);
        }
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.sessions).by_id.len()
    }

    pub(crate) fn first_for_identity(&self, identity_key: &str) -> Option<SessionInfo> {
        let sessions = lock(&self.sessions);
        let id = sessions.by_identity.get(identity_key)?.first()?;
        sessions.by_id.get(id).map(|state| state.info())
    }

    /// Oldest matching session first.
    pub(crate) fn find<P>(&self, predicate: P) -> Option<SessionInfo>
    where
        P: Fn(&SessionInfo) -> bool,
    {
        let sessions = lock(&self.sessions);
        let mut states: Vec<_> = sessions.by_id.iter().collect();
        states.sort_by_key(|(id, _)| **id);
        states
            .into_iter()
            .map(|(_, state)| state.info())
            .find(|info| predicate(info))
    }

    pub(crate) fn all(&self) -> Vec<SessionInfo> {
        let sessions = lock(&self.sessions);
        let mut states: Vec<_> = sessions.by_id.iter().collect();
        states.sort_by_key(|(id, _)| **id);
        states.into_iter().map(|(_, state)| state.info()).collect()
    }

    /// Sessions matching `predicate`, collected so they can be closed
    /// without holding the lock.
    pub(crate) fn states_where<P>(&self, predicate: P) -> Vec<Arc<SessionState>>
    where
        P: Fn(&SessionState) -> bool,
    {
        lock(&self.sessions)
            .by_id
            .values()
            .filter(|state| predicate(state))
            .cloned()
            .collect()
    }
}

/// Keeps a session in the registry until dropped.
pub(crate) struct Registration {
    registry: Arc<Registry>,
    id:       u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn state(identity_key: &str, username: &str) -> Arc<SessionState> {
        Arc::new(SessionState::new(
            SessionInfo {
                uid:          1000,
                identity_key: identity_key.to_string(),
                username:     username.to_string(),
                display_env:  String::new(),
                session_id:   format!("helper-{username}"),
                pid:          1,
                capabilities: None,
                connected_at: SystemTime::now(),
            },
            || {},
        ))
    }

    #[test]
    fn cap_is_per_identity() {
        let registry = Arc::new(Registry::default());
        let a = registry.register(state("1000", "alice"), 2).unwrap();
        let _b = registry.register(state("1000", "alice"), 2).unwrap();
        assert_eq!(registry.register(state("1000", "alice"), 2).err(), Some(2));

        let _other = registry.register(state("1001", "bob"), 2).unwrap();
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.count_for("1000"), 2);

        drop(a);
        assert_eq!(registry.count_for("1000"), 1);
        assert!(registry.register(state("1000", "alice"), 2).is_ok());
    }

    #[test]
    fn lookups_return_oldest_first() {
        let registry = Arc::new(Registry::default());
        let _first = registry.register(state("1000", "alice"), 3).unwrap();
        let _second = registry.register(state("1000", "alice-2"), 3).unwrap();

        let info = registry.first_for_identity("1000").unwrap();
        assert_eq!(info.username, "alice");
        assert_eq!(
            registry
                .find(|info| info.username == "alice-2")
                .map(|info| info.session_id),
            Some("helper-alice-2".to_string())
        );
        assert!(registry.first_for_identity("1001").is_none());

        let names: Vec<_> = registry.all().into_iter().map(|i| i.username).collect();
        assert_eq!(names, ["alice", "alice-2"]);
    }

    #[test]
    fn empty_identity_entries_are_dropped() {
        let registry = Arc::new(Registry::default());
        let registration = registry.register(state("S-1-5-21-1", "carol"), 1).unwrap();
        drop(registration);
        assert_eq!(registry.len(), 0);
        assert!(lock(&registry.sessions).by_identity.is_empty());
    }

    #[test]
    fn state_tracks_activity_and_closes() {
        let closed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&closed);
        let session = SessionState::new(state("1000", "alice").info(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let before = session.last_seen();
        std::thread::sleep(Duration::from_millis(20));
        assert!(session.idle_duration() >= Duration::from_millis(20));
        session.touch();
        assert!(session.last_seen() > before);

        assert!(session.info().capabilities.is_none());
        session.set_capabilities(Capabilities {
            can_notify: true,
            ..Capabilities::default()
        });
        assert_eq!(session.info().capabilities.map(|c| c.can_notify), Some(true));

        session.close();
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }
}
