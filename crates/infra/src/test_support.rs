//! Store doubles that fail on demand.

use std::collections::HashMap;

use parking_lot::Mutex;

use atelier_core::{AggregateId, ExpectedVersion};
use atelier_orders::PeriodKey;

use crate::event_store::{EventStore, EventStoreError, InMemoryEventStore, StoredEvent, UncommittedEvent};
use crate::sequence::{SequenceStore, SequenceStoreError};

/// In-memory store whose appends to chosen streams fail a set number of times.
#[derive(Debug)]
pub(crate) struct FlakyStore {
    inner: InMemoryEventStore,
    outages: Mutex<HashMap<AggregateId, u32>>,
}

impl FlakyStore {
    pub(crate) fn new() -> Self {
        Self {
            inner: InMemoryEventStore::new(),
            outages: Mutex::new(HashMap::new()),
        }
    }

    /// The next `times` appends to `aggregate_id` fail as unavailable.
    pub(crate) fn fail_appends(&self, aggregate_id: AggregateId, times: u32) {
        self.outages.lock().insert(aggregate_id, times);
    }
}

impl EventStore for FlakyStore {
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        if let Some(first) = events.first() {
            let mut outages = self.outages.lock();
            if let Some(left) = outages.get_mut(&first.aggregate_id).filter(|left| **left > 0) {
                *left -= 1;
                return Err(EventStoreError::Unavailable("connection reset".to_string()));
            }
        }
        self.inner.append(events, expected_version)
    }

    fn load_stream(&self, aggregate_id: AggregateId) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.inner.load_stream(aggregate_id)
    }

    fn load_by_type(&self, aggregate_type: &str) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.inner.load_by_type(aggregate_type)
    }
}

/// Sequence store that is never reachable.
#[derive(Debug, Default)]
pub(crate) struct OfflineSequences;

impl SequenceStore for OfflineSequences {
    fn next_value(&self, _period: &PeriodKey) -> Result<u64, SequenceStoreError> {
        Err(SequenceStoreError::Unavailable("sequence table offline".to_string()))
    }

    fn current_value(&self, _period: &PeriodKey) -> Result<u64, SequenceStoreError> {
        Err(SequenceStoreError::Unavailable("sequence table offline".to_string()))
    }
}
