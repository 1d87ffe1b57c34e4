//! Request-scoped principal correlation.
//!
//! Header-only boundaries (the RPC metadata hook) can only see the request id.
//! Stages bind resolved principals under that id and the metadata bridge reads
//! them back. Bindings are released by guards, so an entry never outlives its
//! request on any exit path. A guard only releases its own binding: when two
//! requests share an id, the later binding wins and survives the earlier
//! request finishing.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use crate::principal::{AppPrincipal, UserPrincipal};

/// Concurrent `request id -> principal` map.
///
/// Sharded, so unrelated request ids never contend on the same lock. Provider
/// calls never run while a shard is held.
pub struct CorrelationStore<P> {
    entries: DashMap<String, (u64, Arc<P>)>,
    tickets: AtomicU64,
}

impl<P> Default for CorrelationStore<P> {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
            tickets: AtomicU64::new(0),
        }
    }
}

impl<P> CorrelationStore<P> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `principal` to `request_id`, returning the replaced entry.
    pub fn add(&self, request_id: &str, principal: Arc<P>) -> Option<Arc<P>> {
        self.insert(request_id, principal).1
    }

    /// Remove the entry for `request_id`. Absent ids are a no-op.
    pub fn remove(&self, request_id: &str) -> Option<Arc<P>> {
        self.entries.remove(request_id).map(|(_, (_, principal))| principal)
    }

    #[must_use]
    pub fn get(&self, request_id: &str) -> Option<Arc<P>> {
        self.entries.get(request_id).map(|entry| Arc::clone(&entry.value().1))
    }

    fn insert(&self, request_id: &str, principal: Arc<P>) -> (u64, Option<Arc<P>>) {
        let ticket = self.tickets.fetch_add(1, Ordering::Relaxed);
        let replaced = self
            .entries
            .insert(request_id.to_string(), (ticket, principal))
            .map(|(_, principal)| principal);
        (ticket, replaced)
    }

    /// Remove the entry for `request_id` only if it is still binding `ticket`.
    fn release(&self, request_id: &str, ticket: u64) {
        self.entries.remove_if(request_id, |_, (current, _)| *current == ticket);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<P> fmt::Debug for CorrelationStore<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CorrelationStore")
            .field("entries", &self.entries.len())
            .finish()
    }
}

/// Removes its binding when dropped.
#[must_use = "dropping the guard releases the binding immediately"]
pub struct CorrelationGuard<P> {
    store: Arc<CorrelationStore<P>>,
    request_id: String,
    ticket: u64,
}

impl<P> CorrelationGuard<P> {
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

impl<P> Drop for CorrelationGuard<P> {
    fn drop(&mut self) {
        self.store.release(&self.request_id, self.ticket);
    }
}

impl<P> fmt::Debug for CorrelationGuard<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CorrelationGuard")
            .field("request_id", &self.request_id)
            .finish()
    }
}

/// App and user stores behind one handle.
///
/// The only way stages touch correlation state: bind with a guard, read by id.
#[derive(Debug, Clone, Default)]
pub struct PrincipalBridge {
    apps: Arc<CorrelationStore<AppPrincipal>>,
    users: Arc<CorrelationStore<UserPrincipal>>,
}

impl PrincipalBridge {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind_app(&self, request_id: &str, app: Arc<AppPrincipal>) -> CorrelationGuard<AppPrincipal> {
        bind(&self.apps, request_id, app)
    }

    pub fn bind_user(
        &self,
        request_id: &str,
        user: Arc<UserPrincipal>,
    ) -> CorrelationGuard<UserPrincipal> {
        bind(&self.users, request_id, user)
    }

    #[must_use]
    pub fn app(&self, request_id: &str) -> Option<Arc<AppPrincipal>> {
        self.apps.get(request_id)
    }

    #[must_use]
    pub fn user(&self, request_id: &str) -> Option<Arc<UserPrincipal>> {
        self.users.get(request_id)
    }

    /// Number of live bindings across both kinds.
    #[must_use]
    pub fn len(&self) -> usize {
        self.apps.len() + self.users.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.apps.is_empty() && self.users.is_empty()
    }
}

fn bind<P>(store: &Arc<CorrelationStore<P>>, request_id: &str, principal: Arc<P>) -> CorrelationGuard<P> {
    let (ticket, _) = store.insert(request_id, principal);
    CorrelationGuard {
        store: Arc::clone(store),
        request_id: request_id.to_string(),
        ticket,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_overwrites_and_remove_is_idempotent() {
        let store = CorrelationStore::new();
        assert!(store.add("rq_1", Arc::new(1)).is_none());
        assert_eq!(store.add("rq_1", Arc::new(2)).as_deref(), Some(&1));
        assert_eq!(store.get("rq_1").as_deref(), Some(&2));

        assert!(store.remove("rq_1").is_some());
        assert!(store.remove("rq_1").is_none());
        assert!(store.get("rq_1").is_none());
    }

    #[test]
    fn guard_releases_on_drop() {
        let bridge = PrincipalBridge::new();
        {
            let _app = bridge.bind_app("rq_1", Arc::new(AppPrincipal::new(1, "a", "A")));
            let _user = bridge.bind_user("rq_1", Arc::new(UserPrincipal::new(2, "u", "U")));
            assert_eq!(bridge.len(), 2);
            assert_eq!(bridge.app("rq_1").unwrap().app_id, "a");
        }
        assert!(bridge.is_empty());
    }

    #[test]
    fn guard_keeps_a_later_binding_of_the_same_id() {
        let bridge = PrincipalBridge::new();
        let shared = Arc::new(AppPrincipal::new(1, "a", "A"));

        let first = bridge.bind_app("rq_same", Arc::clone(&shared));
        let second = bridge.bind_app("rq_same", Arc::clone(&shared));
        drop(first);
        assert_eq!(bridge.app("rq_same").unwrap().app_id, "a");

        drop(second);
        assert!(bridge.is_empty());
    }

    #[test]
    fn guard_releases_during_unwind() {
        let bridge = PrincipalBridge::new();
        let cloned = bridge.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _app = cloned.bind_app("rq_1", Arc::new(AppPrincipal::default()));
            panic!("handler failed");
        }));
        assert!(result.is_err());
        assert!(bridge.app("rq_1").is_none());
    }

    #[tokio::test]
    async fn concurrent_requests_are_isolated() {
        let bridge = PrincipalBridge::new();
        let mut tasks = Vec::new();

        for i in 0..64u64 {
            let bridge = bridge.clone();
            tasks.push(tokio::spawn(async move {
                let request_id = format!("rq_{i}");
                let _guard = bridge.bind_user(&request_id, Arc::new(UserPrincipal::new(i, i.to_string(), "")));
                tokio::task::yield_now().await;
                bridge.user(&request_id).map(|user| user.id)
            }));
        }

        for (i, task) in tasks.into_iter().enumerate() {
            assert_eq!(task.await.unwrap(), Some(i as u64));
        }
        assert!(bridge.is_empty());
    }
}
