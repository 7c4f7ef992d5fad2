//! Per-key write gates
//!
//! Writers for the same (domain, app_name) queue on one async mutex so they
//! do not spin on optimistic-commit retries. Writers for different keys get
//! different mutexes and never wait on each other. Entries are weak; a gate
//! disappears once no writer holds it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Prune dead entries once the table grows past this many keys
const PRUNE_THRESHOLD: usize = 1024;

#[derive(Default)]
pub(crate) struct KeyLocks {
    gates: Mutex<HashMap<Vec<u8>, Weak<AsyncMutex<()>>>>,
}

impl KeyLocks {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn gate(&self, key: &[u8]) -> Arc<AsyncMutex<()>> {
        let mut gates = self
            .gates
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(gate) = gates.get(key).and_then(Weak::upgrade) {
            return gate;
        }

        if gates.len() >= PRUNE_THRESHOLD {
            gates.retain(|_, gate| gate.strong_count() > 0);
        }

        let gate = Arc::new(AsyncMutex::new(()));
        gates.insert(key.to_vec(), Arc::downgrade(&gate));
        gate
    }

    /// Wait for exclusive write access to `key`.
    pub(crate) async fn lock(&self, key: &[u8]) -> OwnedMutexGuard<()> {
        self.gate(key).lock_owned().await
    }

    #[cfg(test)]
    fn live_gates(&self) -> usize {
        let gates = self.gates.lock().unwrap();
        gates.values().filter(|g| g.strong_count() > 0).count()
    }
}
