use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;

use atelier_orders::PeriodKey;

use super::{SequenceStore, SequenceStoreError};
use crate::locks::LockTimeout;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Per-period counters behind one mutex, acquired with a bounded wait.
#[derive(Debug)]
pub struct InMemorySequenceStore {
    counters: Mutex<HashMap<PeriodKey, u64>>,
    lock_timeout: Duration,
}

impl Default for InMemorySequenceStore {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl InMemorySequenceStore {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            counters: Mutex::new(HashMap::new()),
            lock_timeout,
        }
    }

    fn counters(&self) -> Result<parking_lot::MutexGuard<'_, HashMap<PeriodKey, u64>>, SequenceStoreError> {
        self.counters.try_lock_for(self.lock_timeout).ok_or_else(|| {
            SequenceStoreError::Timeout(LockTimeout {
                resource: "order sequences".to_string(),
                waited: self.lock_timeout,
            })
        })
    }
}

impl SequenceStore for InMemorySequenceStore {
    fn next_value(&self, period: &PeriodKey) -> Result<u64, SequenceStoreError> {
        let mut counters = self.counters()?;
        let last = counters.entry(period.clone()).or_insert(0);
        let next = last
            .checked_add(1)
            .ok_or_else(|| SequenceStoreError::Exhausted(period.clone()))?;
        *last = next;
        Ok(next)
    }

    fn current_value(&self, period: &PeriodKey) -> Result<u64, SequenceStoreError> {
        Ok(self.counters()?.get(period).copied().unwrap_or(0))
    }
}
