//! Errors returned by the ledger services.
//!
//! Domain rejections keep their meaning; every infrastructure failure
//! collapses into one of three retryable variants.

use thiserror::Error;

use atelier_core::DomainError;
use atelier_inventory::StockItemId;
use atelier_orders::OrderId;

use crate::command_dispatcher::DispatchError;
use crate::locks::LockTimeout;
use crate::sequence::SequenceStoreError;

pub type LedgerResult<T> = Result<T, LedgerError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("insufficient stock for {stock_item_id}: requested {requested}, available {available}")]
    InsufficientStock {
        stock_item_id: StockItemId,
        requested: u64,
        available: u64,
    },

    /// An order line could not be reserved; nothing was kept.
    #[error("stock unavailable for {stock_item_id}: requested {requested}, available {available}")]
    StockUnavailable {
        stock_item_id: StockItemId,
        requested: u64,
        available: u64,
    },

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("order number allocation unavailable: {0}")]
    AllocationUnavailable(String),

    #[error("persistence unavailable: {0}")]
    PersistenceUnavailable(String),

    #[error("timed out waiting for {resource}")]
    Timeout { resource: String },
}

impl LedgerError {
    /// Infrastructure failures: the same call may succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LedgerError::AllocationUnavailable(_)
                | LedgerError::PersistenceUnavailable(_)
                | LedgerError::Timeout { .. }
        )
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::ValidationFailed(_) => "VALIDATION_FAILED",
            LedgerError::InsufficientStock { .. } => "INSUFFICIENT_STOCK",
            LedgerError::StockUnavailable { .. } => "STOCK_UNAVAILABLE",
            LedgerError::InvalidTransition(_) => "INVALID_TRANSITION",
            LedgerError::InvalidAmount(_) => "INVALID_AMOUNT",
            LedgerError::NotFound { .. } => "NOT_FOUND",
            LedgerError::AllocationUnavailable(_) => "ALLOCATION_UNAVAILABLE",
            LedgerError::PersistenceUnavailable(_) => "PERSISTENCE_UNAVAILABLE",
            LedgerError::Timeout { .. } => "TIMEOUT",
        }
    }

    pub fn stock_item_not_found(id: StockItemId) -> Self {
        Subject::StockItem(id).not_found()
    }

    pub fn order_not_found(id: impl ToString) -> Self {
        LedgerError::NotFound {
            entity: "order",
            id: id.to_string(),
        }
    }
}

/// What an operation was acting on, for errors that name it.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Subject {
    StockItem(StockItemId),
    Order(OrderId),
}

impl Subject {
    fn not_found(self) -> LedgerError {
        match self {
            Subject::StockItem(id) => LedgerError::NotFound {
                entity: "stock item",
                id: id.to_string(),
            },
            Subject::Order(id) => LedgerError::NotFound {
                entity: "order",
                id: id.to_string(),
            },
        }
    }

    pub(crate) fn domain(self, err: DomainError) -> LedgerError {
        match err {
            DomainError::Validation(msg)
            | DomainError::InvalidId(msg)
            | DomainError::Conflict(msg)
            | DomainError::InvariantViolation(msg) => LedgerError::ValidationFailed(msg),
            DomainError::InsufficientStock {
                requested,
                available,
            } => match self {
                Subject::StockItem(stock_item_id) => LedgerError::InsufficientStock {
                    stock_item_id,
                    requested,
                    available,
                },
                Subject::Order(_) => LedgerError::ValidationFailed(format!(
                    "insufficient stock: requested {requested}, available {available}"
                )),
            },
            DomainError::InvalidTransition(msg) => LedgerError::InvalidTransition(msg),
            DomainError::InvalidAmount(msg) => LedgerError::InvalidAmount(msg),
            DomainError::NotFound => self.not_found(),
        }
    }

    pub(crate) fn dispatch(self, err: DispatchError) -> LedgerError {
        match err {
            DispatchError::Domain(e) => self.domain(e),
            DispatchError::Concurrency(msg) => {
                LedgerError::PersistenceUnavailable(format!("unresolved write conflict: {msg}"))
            }
            other => LedgerError::PersistenceUnavailable(other.to_string()),
        }
    }
}

impl From<LockTimeout> for LedgerError {
    fn from(value: LockTimeout) -> Self {
        LedgerError::Timeout {
            resource: value.resource,
        }
    }
}

impl From<SequenceStoreError> for LedgerError {
    fn from(value: SequenceStoreError) -> Self {
        LedgerError::AllocationUnavailable(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::EventStoreError;
    use std::time::Duration;

    #[test]
    fn only_infrastructure_errors_are_retryable() {
        let item = StockItemId::generate();
        let retryable = [
            LedgerError::AllocationUnavailable("down".into()),
            LedgerError::PersistenceUnavailable("down".into()),
            LedgerError::Timeout {
                resource: "x".into(),
            },
        ];
        let final_ = [
            LedgerError::ValidationFailed("bad".into()),
            LedgerError::InsufficientStock {
                stock_item_id: item,
                requested: 2,
                available: 1,
            },
            LedgerError::StockUnavailable {
                stock_item_id: item,
                requested: 2,
                available: 1,
            },
            LedgerError::InvalidTransition("no".into()),
            LedgerError::InvalidAmount("zero".into()),
            LedgerError::stock_item_not_found(item),
        ];
        assert!(retryable.iter().all(LedgerError::is_retryable));
        assert!(!final_.iter().any(LedgerError::is_retryable));
    }

    #[test]
    fn insufficient_stock_names_the_item() {
        let item = StockItemId::generate();
        let err = Subject::StockItem(item).dispatch(DispatchError::Domain(
            DomainError::insufficient_stock(10, 4),
        ));
        assert_eq!(
            err,
            LedgerError::InsufficientStock {
                stock_item_id: item,
                requested: 10,
                available: 4
            }
        );
    }

    #[test]
    fn infrastructure_failures_map_to_retryable_variants() {
        let order = OrderId::generate();
        let conflict = Subject::Order(order).dispatch(DispatchError::Concurrency("stale".into()));
        assert!(matches!(conflict, LedgerError::PersistenceUnavailable(_)));

        let store = Subject::Order(order).dispatch(DispatchError::Store(EventStoreError::Unavailable(
            "connection refused".into(),
        )));
        assert!(store.is_retryable());

        let timeout: LedgerError = LockTimeout {
            resource: "order".into(),
            waited: Duration::from_millis(5),
        }
        .into();
        assert_eq!(timeout.code(), "TIMEOUT");

        let alloc: LedgerError = SequenceStoreError::Unavailable("down".into()).into();
        assert_eq!(alloc.code(), "ALLOCATION_UNAVAILABLE");
    }

    #[test]
    fn missing_order_is_not_found() {
        let order = OrderId::generate();
        let err = Subject::Order(order).domain(DomainError::NotFound);
        assert_eq!(err.code(), "NOT_FOUND");
        assert_eq!(err.to_string(), format!("order {order} not found"));
    }
}
