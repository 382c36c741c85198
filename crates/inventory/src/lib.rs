//! Stock domain module (event-sourced).
//!
//! Quantity-on-hand for products and consumables, changed only through typed
//! movements. Pure, deterministic domain logic: no IO, no locking, no storage.

pub mod movement;
pub mod stock_item;

pub use movement::{MovementReference, MovementType, OperationKey, StockMovement};
pub use stock_item::{
    ConsumeReservation, MovementRecorded, RecordMovement, RegisterStockItem,
    ReorderThresholdChanged, SetReorderThreshold, StockCommand, StockEvent, StockItem,
    StockItemId, StockItemRegistered, StockKind,
};
