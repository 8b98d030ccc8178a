//! Per-organization write serialization.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::ids::OrgId;

/// One mutex per organization.
///
/// Every decide-and-write step (clustering, split, unmerge, manual merge)
/// runs under its organization's lock, so two writers can never both decide
/// "no candidate" for the same text and create duplicate entities.
#[derive(Debug, Default)]
pub struct OrgLocks {
    locks: Mutex<HashMap<OrgId, Arc<Mutex<()>>>>,
}

impl OrgLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, org_id: OrgId) -> Arc<Mutex<()>> {
        // The maps hold no invariants a panicking holder could break.
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(org_id).or_default())
    }

    /// Runs `f` while holding `org_id`'s lock.
    pub fn with_lock<T>(&self, org_id: OrgId, f: impl FnOnce() -> T) -> T {
        let handle = self.handle(org_id);
        let _guard = handle.lock().unwrap_or_else(PoisonError::into_inner);
        f()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn same_org_is_serialized() {
        let locks = Arc::new(OrgLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let org = OrgId::new();

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let inside = Arc::clone(&inside);
                let max_seen = Arc::clone(&max_seen);
                thread::spawn(move || {
                    locks.with_lock(org, || {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(5));
                        inside.fetch_sub(1, Ordering::SeqCst);
                    });
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn different_orgs_do_not_block() {
        let locks = OrgLocks::new();
        let a = OrgId::new();
        let b = OrgId::new();
        let value = locks.with_lock(a, || locks.with_lock(b, || 42));
        assert_eq!(value, 42);
    }
}
