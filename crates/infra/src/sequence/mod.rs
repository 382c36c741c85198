//! Order-number allocation.
//!
//! A `SequenceStore` hands out the next value of a per-period counter as one
//! atomic step; `SequenceAllocator` turns that value into an `OrderNumber`.
//! Values are never reissued, even when the order that took one fails later.

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemorySequenceStore;
pub use postgres::PostgresSequenceStore;

use std::sync::Arc;

use thiserror::Error;

use atelier_orders::{DEFAULT_ORDER_PREFIX, OrderNumber, PeriodKey};

use crate::locks::LockTimeout;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SequenceStoreError {
    #[error(transparent)]
    Timeout(#[from] LockTimeout),

    #[error("sequence for period {0} is exhausted")]
    Exhausted(PeriodKey),

    #[error("sequence store unavailable: {0}")]
    Unavailable(String),

    #[error("cannot format order number: {0}")]
    Format(String),
}

/// Atomic per-period counter.
pub trait SequenceStore: Send + Sync {
    /// Increment the period's counter and return the new value. The first
    /// value of a period is 1.
    fn next_value(&self, period: &PeriodKey) -> Result<u64, SequenceStoreError>;

    /// Last value handed out for the period (0 if none).
    fn current_value(&self, period: &PeriodKey) -> Result<u64, SequenceStoreError>;
}

impl<T> SequenceStore for Arc<T>
where
    T: SequenceStore + ?Sized,
{
    fn next_value(&self, period: &PeriodKey) -> Result<u64, SequenceStoreError> {
        (**self).next_value(period)
    }

    fn current_value(&self, period: &PeriodKey) -> Result<u64, SequenceStoreError> {
        (**self).current_value(period)
    }
}

#[derive(Debug, Clone)]
pub struct SequenceAllocator<S> {
    store: S,
    prefix: String,
}

impl<S> SequenceAllocator<S>
where
    S: SequenceStore,
{
    pub fn new(store: S, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    pub fn with_default_prefix(store: S) -> Self {
        Self::new(store, DEFAULT_ORDER_PREFIX)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Allocate the next order number of `period`.
    pub fn next_order_number(&self, period: &PeriodKey) -> Result<OrderNumber, SequenceStoreError> {
        let value = self.store.next_value(period)?;
        let number = OrderNumber::new(self.prefix.clone(), period.clone(), value)
            .map_err(|e| SequenceStoreError::Format(e.to_string()))?;
        tracing::debug!(order_number = %number, "allocated order number");
        Ok(number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;
    use std::time::Duration;

    fn period() -> PeriodKey {
        PeriodKey::parse("202403").unwrap()
    }

    #[test]
    fn numbers_start_at_one_and_are_padded() {
        let allocator = SequenceAllocator::with_default_prefix(InMemorySequenceStore::default());
        let first = allocator.next_order_number(&period()).unwrap();
        let second = allocator.next_order_number(&period()).unwrap();
        assert_eq!(first.to_string(), "CMD-202403-0001");
        assert_eq!(second.to_string(), "CMD-202403-0002");
    }

    #[test]
    fn periods_are_independent() {
        let allocator = SequenceAllocator::new(InMemorySequenceStore::default(), "ORD");
        allocator.next_order_number(&period()).unwrap();
        let april = allocator
            .next_order_number(&PeriodKey::parse("202404").unwrap())
            .unwrap();
        assert_eq!(april.to_string(), "ORD-202404-0001");
    }

    #[test]
    fn bad_prefix_is_a_format_error_after_consuming_a_value() {
        let store = Arc::new(InMemorySequenceStore::default());
        let allocator = SequenceAllocator::new(store.clone(), "C-M");
        let err = allocator.next_order_number(&period()).unwrap_err();
        assert!(matches!(err, SequenceStoreError::Format(_)));
        assert_eq!(store.current_value(&period()).unwrap(), 1);
    }

    #[test]
    fn concurrent_allocation_is_unique_and_gapless() {
        let allocator = Arc::new(SequenceAllocator::with_default_prefix(
            InMemorySequenceStore::new(Duration::from_secs(5)),
        ));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let allocator = allocator.clone();
                thread::spawn(move || {
                    (0..25)
                        .map(|_| allocator.next_order_number(&period()).unwrap().sequence())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let distinct: HashSet<u64> = all.iter().copied().collect();
        assert_eq!(distinct.len(), 400);
        assert_eq!(distinct, (1..=400).collect());
    }
}
