use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

/// Identifies one registration so a stale owner cannot remove its successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationId(u64);

type TriggerFn = Arc<dyn Fn() + Send + Sync>;

struct Entry {
    id: RegistrationId,
    callback: TriggerFn,
}

/// Name-keyed callbacks for on-demand runs. Registering a name again
/// replaces the previous callback.
#[derive(Clone, Default)]
pub struct ManualTriggerRegistry {
    entries: Arc<DashMap<String, Entry>>,
    next_id: Arc<AtomicU64>,
}

impl ManualTriggerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, callback: impl Fn() + Send + Sync + 'static) -> RegistrationId {
        let id = RegistrationId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let previous = self.entries.insert(
            name.to_string(),
            Entry {
                id,
                callback: Arc::new(callback),
            },
        );
        if previous.is_some() {
            debug!(job = %name, "manual trigger replaced");
        }
        id
    }

    /// Remove `name` if it is still owned by `id`.
    pub fn unregister(&self, name: &str, id: RegistrationId) -> bool {
        self.entries.remove_if(name, |_, e| e.id == id).is_some()
    }

    /// Fire the callback for `name`. `false` if nothing is registered.
    pub fn trigger(&self, name: &str) -> bool {
        // Clone out so the callback runs without holding the shard lock.
        let callback = match self.entries.get(name) {
            Some(e) => e.callback.clone(),
            None => return false,
        };
        callback();
        true
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
        let n = Arc::new(AtomicUsize::new(0));
        let c = n.clone();
        (n, move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn trigger_unknown_returns_false() {
        let reg = ManualTriggerRegistry::new();
        assert!(!reg.trigger("missing"));
    }

    #[test]
    fn trigger_invokes_callback() {
        let reg = ManualTriggerRegistry::new();
        let (n, f) = counter();
        reg.register("job", f);
        assert!(reg.trigger("job"));
        assert!(reg.trigger("job"));
        assert_eq!(n.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn last_writer_wins() {
        let reg = ManualTriggerRegistry::new();
        let (old, f_old) = counter();
        let (new, f_new) = counter();
        reg.register("job", f_old);
        reg.register("job", f_new);
        reg.trigger("job");
        assert_eq!(old.load(Ordering::SeqCst), 0);
        assert_eq!(new.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stale_unregister_keeps_replacement() {
        let reg = ManualTriggerRegistry::new();
        let (_, f_old) = counter();
        let (_, f_new) = counter();
        let old_id = reg.register("job", f_old);
        let new_id = reg.register("job", f_new);
        assert!(!reg.unregister("job", old_id));
        assert!(reg.names().contains(&"job".to_string()));
        assert!(reg.unregister("job", new_id));
        assert!(!reg.names().contains(&"job".to_string()));
    }

    #[test]
    fn names_are_sorted() {
        let reg = ManualTriggerRegistry::new();
        reg.register("b", || {});
        reg.register("a", || {});
        assert_eq!(reg.names(), vec!["a".to_string(), "b".to_string()]);
    }
}
