//! Per-character named writer locks, so concurrent saves/rollbacks/deletes
//! for the same character serialize without blocking unrelated characters.
//! Mirrors `reeldub-queue`'s own `parking_lot::RwLock`-guarded shared-map
//! pattern, sized down to one entry per lock instead of the whole queue.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Mutex;

#[derive(Default)]
pub struct LockRegistry {
    locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named(&self, key: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = self.locks.read().get(key) {
            return lock.clone();
        }
        self.locks.write().entry(key.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_key_returns_the_same_lock() {
        let registry = LockRegistry::new();
        assert!(Arc::ptr_eq(&registry.named("a/b"), &registry.named("a/b")));
        assert!(!Arc::ptr_eq(&registry.named("a/b"), &registry.named("a/c")));
    }
}
