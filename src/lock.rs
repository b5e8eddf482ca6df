//! Named advisory locks keyed by absolute path.
//!
//! Mutual exclusion is process-local and advisory: only the engine's own
//! critical sections respect it. Guards release on drop, so every exit path
//! of a protected section (including errors) unlocks.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Default)]
pub struct LockRegistry {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

/// Held lock; dropping it releases the named mutex.
pub struct LockGuard {
    _guard: OwnedMutexGuard<()>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `name`, waiting if another holder has it.
    /// Not re-entrant: a second acquisition from the same task deadlocks.
    pub async fn lock(&self, name: &str) -> LockGuard {
        let mutex = self
            .locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        LockGuard {
            _guard: mutex.lock_owned().await,
        }
    }

    /// Acquire several path locks in the canonical order: deepest path
    /// first, ties broken lexicographically. Every multi-lock section uses
    /// this order, which keeps the child-before-parent discipline cycle-free.
    pub async fn lock_all(&self, names: &[&str]) -> Vec<LockGuard> {
        let mut ordered: Vec<&str> = names.to_vec();
        ordered.sort_by(|a, b| {
            let depth = |p: &str| p.chars().filter(|c| *c == '/').count();
            depth(b).cmp(&depth(a)).then_with(|| a.cmp(b))
        });
        ordered.dedup();

        let mut guards = Vec::with_capacity(ordered.len());
        for name in ordered {
            guards.push(self.lock(name).await);
        }
        guards
    }
}
