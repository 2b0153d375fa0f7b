//! Per-instance registry of live sessions, keyed by (user, device).
//!
//! Adding a session for an occupied slot closes and displaces the old one.
//! Removal is identity-matched: a late `remove` from a replaced session's
//! teardown only evicts the entry if the registry still holds that exact
//! session, so it can never kill the replacement.

use super::{Session, CLOSE_SESSION_REPLACED};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

#[derive(Default)]
pub struct Registry {
    sessions: RwLock<HashMap<Uuid, HashMap<String, Arc<Session>>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, session: Arc<Session>) {
        let mut sessions = self.sessions.write().unwrap();
        let devices = sessions.entry(session.user_id).or_default();

        if let Some(old) = devices.insert(session.device_id.clone(), session.clone()) {
            tracing::info!(
                user_id = %session.user_id,
                device_id = %session.device_id,
                old_session = %old.id,
                new_session = %session.id,
                "replacing existing session"
            );
            old.close_with_reason(CLOSE_SESSION_REPLACED, "session_replaced");
        }
    }

    pub fn remove(&self, session: &Session) {
        let mut sessions = self.sessions.write().unwrap();
        if let Some(devices) = sessions.get_mut(&session.user_id) {
            let matches = devices
                .get(&session.device_id)
                .map(|current| current.id == session.id)
                .unwrap_or(false);
            if matches {
                devices.remove(&session.device_id);
                if devices.is_empty() {
                    sessions.remove(&session.user_id);
                }
            }
        }
    }

    pub fn user_sessions(&self, user_id: Uuid) -> Vec<Arc<Session>> {
        let sessions = self.sessions.read().unwrap();
        sessions
            .get(&user_id)
            .map(|devices| devices.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        let sessions = self.sessions.read().unwrap();
        sessions.values().map(|devices| devices.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn close_all(&self) {
        let sessions = self.sessions.read().unwrap();
        for devices in sessions.values() {
            for session in devices.values() {
                session.close();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replacement_closes_old_session_and_survives_late_remove() {
        let registry = Registry::new();
        let user = Uuid::new_v4();

        let (s1, _rx1) = Session::new(user, "device1".into(), 8);
        registry.add(s1.clone());

        let found = registry.user_sessions(user);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, s1.id);

        let (s2, _rx2) = Session::new(user, "device1".into(), 8);
        registry.add(s2.clone());

        // Old session was closed with the replacement code.
        assert!(s1.is_closed());
        assert_eq!(s1.close_frame().0, CLOSE_SESSION_REPLACED);

        // Late teardown of the replaced session must not evict the new one.
        registry.remove(&s1);
        let found = registry.user_sessions(user);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, s2.id);

        registry.remove(&s2);
        assert!(registry.user_sessions(user).is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn sessions_for_distinct_devices_coexist() {
        let registry = Registry::new();
        let user = Uuid::new_v4();

        let (s1, _rx1) = Session::new(user, "phone".into(), 8);
        let (s2, _rx2) = Session::new(user, "laptop".into(), 8);
        registry.add(s1.clone());
        registry.add(s2.clone());

        assert_eq!(registry.user_sessions(user).len(), 2);
        assert!(!s1.is_closed());
        assert!(!s2.is_closed());
    }

    #[test]
    fn close_all_closes_every_session() {
        let registry = Registry::new();
        let (s1, _rx1) = Session::new(Uuid::new_v4(), "d1".into(), 8);
        let (s2, _rx2) = Session::new(Uuid::new_v4(), "d2".into(), 8);
        registry.add(s1.clone());
        registry.add(s2.clone());

        registry.close_all();
        assert!(s1.is_closed());
        assert!(s2.is_closed());
    }
}
