//! In-memory conversation membership cache.
//!
//! A performance layer only: the dispatcher falls back to the conversation
//! store on miss and tolerates brief staleness across the race between a
//! membership change and an in-flight delivery. The reverse index
//! (user -> conversations) serves the presence watcher.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
pub struct MembershipCache {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    members: HashMap<Uuid, HashSet<Uuid>>,
    user_to_convs: HashMap<Uuid, HashSet<Uuid>>,
}

impl MembershipCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, conversation_id: Uuid, user_id: Uuid) {
        let mut inner = self.inner.write().unwrap();
        inner.members.entry(conversation_id).or_default().insert(user_id);
        inner
            .user_to_convs
            .entry(user_id)
            .or_default()
            .insert(conversation_id);
    }

    pub fn remove(&self, conversation_id: Uuid, user_id: Uuid) {
        let mut inner = self.inner.write().unwrap();
        if let Some(members) = inner.members.get_mut(&conversation_id) {
            members.remove(&user_id);
        }
        if let Some(convs) = inner.user_to_convs.get_mut(&user_id) {
            convs.remove(&conversation_id);
        }
    }

    pub fn members(&self, conversation_id: Uuid) -> Vec<Uuid> {
        let inner = self.inner.read().unwrap();
        inner
            .members
            .get(&conversation_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn user_conversations(&self, user_id: Uuid) -> Vec<Uuid> {
        let inner = self.inner.read().unwrap();
        inner
            .user_to_convs
            .get(&user_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Full replacement for one conversation; unlinks the previous members
    /// from the reverse index first.
    pub fn set_members(&self, conversation_id: Uuid, users: &[Uuid]) {
        let mut inner = self.inner.write().unwrap();

        if let Some(old_members) = inner.members.remove(&conversation_id) {
            for user_id in old_members {
                if let Some(convs) = inner.user_to_convs.get_mut(&user_id) {
                    convs.remove(&conversation_id);
                }
            }
        }

        let mut set = HashSet::with_capacity(users.len());
        for user_id in users {
            set.insert(*user_id);
            inner
                .user_to_convs
                .entry(*user_id)
                .or_default()
                .insert(conversation_id);
        }
        inner.members.insert(conversation_id, set);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_remove_keep_both_indexes_in_sync() {
        let cache = MembershipCache::new();
        let conv = Uuid::new_v4();
        let user = Uuid::new_v4();

        cache.add(conv, user);
        assert_eq!(cache.members(conv), vec![user]);
        assert_eq!(cache.user_conversations(user), vec![conv]);

        cache.remove(conv, user);
        assert!(cache.members(conv).is_empty());
        assert!(cache.user_conversations(user).is_empty());
    }

    #[test]
    fn set_members_replaces_and_unlinks_old_members() {
        let cache = MembershipCache::new();
        let conv = Uuid::new_v4();
        let old_user = Uuid::new_v4();
        let new_user = Uuid::new_v4();

        cache.add(conv, old_user);
        cache.set_members(conv, &[new_user]);

        assert_eq!(cache.members(conv), vec![new_user]);
        assert!(cache.user_conversations(old_user).is_empty());
        assert_eq!(cache.user_conversations(new_user), vec![conv]);
    }

    #[test]
    fn user_can_belong_to_multiple_conversations() {
        let cache = MembershipCache::new();
        let user = Uuid::new_v4();
        let conv_a = Uuid::new_v4();
        let conv_b = Uuid::new_v4();

        cache.add(conv_a, user);
        cache.add(conv_b, user);

        let mut convs = cache.user_conversations(user);
        convs.sort();
        let mut expected = vec![conv_a, conv_b];
        expected.sort();
        assert_eq!(convs, expected);
    }
}
