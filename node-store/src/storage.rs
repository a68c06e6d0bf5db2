use dashmap::DashMap;
use node_core::model::{diff_inbounds, Inbound, User};
use node_core::NodeError;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// In-memory record of which tags a user is currently wired into, keyed
/// by the same `(id, username)` identity as the `User` it describes.
#[derive(Clone)]
struct UserEntry {
    user: User,
    inbounds: HashSet<String>,
}

/// Live view of every inbound and user this node currently knows about.
///
/// Populated from `FetchBackends`/`SyncUsers`/`RepopulateUsers` calls and
/// read by the supervisor to reconcile engine state. Mirrors the teacher's
/// `ConfigCache` — a set of `DashMap`s behind a cheap `Clone`, so every task
/// holding a `Storage` handle sees the same live data without a lock.
#[derive(Clone)]
pub struct Storage {
    inbounds: Arc<DashMap<String, Inbound>>,
    users: Arc<DashMap<u64, UserEntry>>,
    /// tag -> set of user ids currently assigned to it.
    tag_users: Arc<DashMap<String, HashSet<u64>>>,
}

impl Storage {
    pub fn new() -> Self {
        Self {
            inbounds: Arc::new(DashMap::new()),
            users: Arc::new(DashMap::new()),
            tag_users: Arc::new(DashMap::new()),
        }
    }

    /// Register or replace an inbound's descriptor.
    pub fn register_inbound(&self, inbound: Inbound) {
        debug!(tag = %inbound.tag, "registering inbound");
        self.tag_users.entry(inbound.tag.clone()).or_default();
        self.inbounds.insert(inbound.tag.clone(), inbound);
    }

    /// Drop an inbound and strip it from every user's membership set.
    pub fn remove_inbound(&self, tag: &str) {
        self.inbounds.remove(tag);
        if let Some((_, user_ids)) = self.tag_users.remove(tag) {
            for id in user_ids {
                if let Some(mut entry) = self.users.get_mut(&id) {
                    entry.inbounds.remove(tag);
                }
            }
        }
    }

    /// All known inbounds, or only those whose tag is in `tags` when given.
    /// Tags absent from storage are silently skipped rather than erroring.
    pub fn list_inbounds(&self, tags: Option<&[String]>) -> Vec<Inbound> {
        match tags {
            None => self.inbounds.iter().map(|e| e.value().clone()).collect(),
            Some(tags) => tags
                .iter()
                .filter_map(|tag| self.inbounds.get(tag).map(|e| e.value().clone()))
                .collect(),
        }
    }

    pub fn contains_tag(&self, tag: &str) -> bool {
        self.inbounds.contains_key(tag)
    }

    pub fn list_users(&self) -> Vec<User> {
        self.users.iter().map(|e| e.value().user.clone()).collect()
    }

    /// Look up a single known user by id, e.g. before removing it so the
    /// caller can still tell each engine adapter who to remove.
    pub fn get_user(&self, user_id: u64) -> Option<User> {
        self.users.get(&user_id).map(|e| e.user.clone())
    }

    /// Users currently assigned to `tag`, in no particular order.
    pub fn list_inbound_users(&self, tag: &str) -> Vec<User> {
        let Some(ids) = self.tag_users.get(tag) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| self.users.get(id).map(|e| e.user.clone()))
            .collect()
    }

    /// Upsert `user` and set its inbound membership to exactly `tags`,
    /// returning the tags added and removed relative to its prior state.
    /// Unknown tags are rejected up front — no partial application.
    pub fn update_user_inbounds(
        &self,
        user: User,
        tags: HashSet<String>,
    ) -> Result<(HashSet<String>, HashSet<String>), NodeError> {
        for tag in &tags {
            if !self.inbounds.contains_key(tag) {
                return Err(NodeError::UnknownTag(tag.clone()));
            }
        }

        let old_tags = self
            .users
            .get(&user.id)
            .map(|e| e.inbounds.clone())
            .unwrap_or_default();
        let (added, removed) = diff_inbounds(&old_tags, &tags);

        for tag in &added {
            self.tag_users.entry(tag.clone()).or_default().insert(user.id);
        }
        for tag in &removed {
            if let Some(mut ids) = self.tag_users.get_mut(tag) {
                ids.remove(&user.id);
            }
        }

        self.users.insert(
            user.id,
            UserEntry {
                user,
                inbounds: tags,
            },
        );

        Ok((added, removed))
    }

    /// Remove a user entirely, returning the tags it was wired into.
    pub fn remove_user(&self, user_id: u64) -> HashSet<String> {
        let Some((_, entry)) = self.users.remove(&user_id) else {
            return HashSet::new();
        };
        for tag in &entry.inbounds {
            if let Some(mut ids) = self.tag_users.get_mut(tag) {
                ids.remove(&user_id);
            }
        }
        entry.inbounds
    }

    /// Drop every known user (used by `RepopulateUsers` before re-adding the
    /// controller's full snapshot). Inbound descriptors are left intact.
    pub fn flush_users(&self) {
        self.users.clear();
        for mut ids in self.tag_users.iter_mut() {
            ids.clear();
        }
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }
}

impl Default for Storage {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use node_core::model::Protocol;

    fn inbound(tag: &str) -> Inbound {
        Inbound {
            tag: tag.to_string(),
            protocol: Protocol::Vless,
            config: Default::default(),
        }
    }

    fn user(id: u64, name: &str) -> User {
        User {
            id,
            username: name.to_string(),
            key: format!("key-{id}"),
        }
    }

    #[test]
    fn register_and_list_inbounds() {
        let store = Storage::new();
        store.register_inbound(inbound("vless-tcp"));
        store.register_inbound(inbound("vmess-ws"));
        assert_eq!(store.list_inbounds(None).len(), 2);
        assert!(store.contains_tag("vless-tcp"));
    }

    #[test]
    fn list_inbounds_filters_by_tag_and_skips_unknown_tags() {
        let store = Storage::new();
        store.register_inbound(inbound("vless-tcp"));
        store.register_inbound(inbound("vmess-ws"));

        let filter = vec!["vless-tcp".to_string(), "ghost-tag".to_string()];
        let filtered = store.list_inbounds(Some(&filter));
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].tag, "vless-tcp");
    }

    #[test]
    fn update_user_inbounds_rejects_unknown_tag() {
        let store = Storage::new();
        let tags: HashSet<String> = ["ghost-tag".into()].into_iter().collect();
        let err = store.update_user_inbounds(user(1, "alice"), tags).unwrap_err();
        assert!(matches!(err, NodeError::UnknownTag(t) if t == "ghost-tag"));
    }

    #[test]
    fn update_user_inbounds_tracks_diff() {
        let store = Storage::new();
        store.register_inbound(inbound("a"));
        store.register_inbound(inbound("b"));

        let first: HashSet<String> = ["a".into()].into_iter().collect();
        let (added, removed) = store.update_user_inbounds(user(1, "alice"), first).unwrap();
        assert_eq!(added, HashSet::from(["a".to_string()]));
        assert!(removed.is_empty());

        let second: HashSet<String> = ["b".into()].into_iter().collect();
        let (added, removed) = store.update_user_inbounds(user(1, "alice"), second).unwrap();
        assert_eq!(added, HashSet::from(["b".to_string()]));
        assert_eq!(removed, HashSet::from(["a".to_string()]));

        assert_eq!(store.list_inbound_users("a").len(), 0);
        assert_eq!(store.list_inbound_users("b").len(), 1);
    }

    #[test]
    fn get_user_returns_none_for_unknown_id() {
        let store = Storage::new();
        assert!(store.get_user(42).is_none());
    }

    #[test]
    fn get_user_returns_the_registered_user() {
        let store = Storage::new();
        store.register_inbound(inbound("a"));
        let tags: HashSet<String> = ["a".into()].into_iter().collect();
        store.update_user_inbounds(user(1, "alice"), tags).unwrap();
        assert_eq!(store.get_user(1), Some(user(1, "alice")));
    }

    #[test]
    fn remove_user_clears_membership() {
        let store = Storage::new();
        store.register_inbound(inbound("a"));
        let tags: HashSet<String> = ["a".into()].into_iter().collect();
        store.update_user_inbounds(user(1, "alice"), tags).unwrap();

        let removed_tags = store.remove_user(1);
        assert_eq!(removed_tags, HashSet::from(["a".to_string()]));
        assert_eq!(store.list_users().len(), 0);
        assert_eq!(store.list_inbound_users("a").len(), 0);
    }

    #[test]
    fn remove_inbound_strips_membership_from_users() {
        let store = Storage::new();
        store.register_inbound(inbound("a"));
        let tags: HashSet<String> = ["a".into()].into_iter().collect();
        store.update_user_inbounds(user(1, "alice"), tags).unwrap();

        store.remove_inbound("a");
        assert!(!store.contains_tag("a"));
        assert_eq!(store.list_users().len(), 1);
    }

    #[test]
    fn flush_users_clears_everyone_but_keeps_inbounds() {
        let store = Storage::new();
        store.register_inbound(inbound("a"));
        let tags: HashSet<String> = ["a".into()].into_iter().collect();
        store.update_user_inbounds(user(1, "alice"), tags).unwrap();

        store.flush_users();
        assert_eq!(store.user_count(), 0);
        assert!(store.contains_tag("a"));
        assert_eq!(store.list_inbound_users("a").len(), 0);
    }

    #[test]
    fn update_user_inbounds_is_idempotent() {
        let store = Storage::new();
        store.register_inbound(inbound("a"));
        let tags: HashSet<String> = ["a".into()].into_iter().collect();
        store.update_user_inbounds(user(1, "alice"), tags.clone()).unwrap();
        let (added, removed) = store.update_user_inbounds(user(1, "alice"), tags).unwrap();
        assert!(added.is_empty());
        assert!(removed.is_empty());
    }
}
