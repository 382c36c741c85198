//! Infrastructure for the atelier ledger.
//!
//! Event stores (in-memory, Postgres), the command dispatcher, keyed locks,
//! order-number sequences, read models and the two services built on them:
//! `StockLedger` and `OrderService`.

pub mod clock;
pub mod command_dispatcher;
pub mod config;
pub mod error;
pub mod event_store;
pub mod ledger;
pub mod locks;
pub mod order_service;
pub mod projections;
pub mod sequence;
pub mod services;
pub mod sinks;

pub use clock::{Clock, FixedClock, SystemClock};
pub use command_dispatcher::{
    CommandDispatcher, Decision, DispatchError, Dispatched, decide, retry_on_conflict,
};
pub use config::{ConfigError, LedgerConfig};
pub use error::{LedgerError, LedgerResult};
pub use event_store::{
    EventStore, EventStoreError, InMemoryEventStore, PostgresEventStore, PublishingEventStore,
    StoredEvent, UncommittedEvent,
};
pub use ledger::{
    PurchaseReceipt, ReceiptLine, ReceiptOutcome, RegisterStockItemRequest, StockChange,
    StockLedger, StockMovementRequest,
};
pub use locks::{KeyedLocks, LockTimeout};
pub use order_service::{
    AddLineRequest, AssignTaskRequest, CreateOrderRequest, OrderLineRequest, OrderService,
    PaymentRequest, RemoveLineRequest, TaskStatusRequest, TransitionRequest,
};
pub use projections::{OrderFilter, OrderSummary, StockLevel};
pub use sequence::{
    InMemorySequenceStore, PostgresSequenceStore, SequenceAllocator, SequenceStore,
    SequenceStoreError,
};
pub use services::{Collaborators, Ledger, SetupError};
pub use sinks::{
    Activity, ActivityAction, ActivitySink, BusSink, LowStockAlert, LowStockNotifier, SinkError,
    TracingSink,
};

#[cfg(test)]
mod integration_tests;
#[cfg(test)]
mod test_support;
