//! Orders domain module (event-sourced).
//!
//! Business rules for client orders: numbering, totals, the lifecycle state
//! machine, production tasks and payments. Pure, deterministic domain logic;
//! stock reservations are carried out by the infra layer and recorded here.

pub mod lifecycle;
pub mod number;
pub mod order;
pub mod pricing;
pub mod task;

pub use lifecycle::{OrderStateMachine, OrderStatus, Transition};
pub use number::{DEFAULT_ORDER_PREFIX, OrderNumber, PeriodKey};
pub use order::{
    AddLine, AssignTask, ChangeStatus, DraftLine, LineAdded, LineRemoved, LineReservation, Order,
    OrderCancelled, OrderCommand, OrderConfirmed, OrderDelivered, OrderEvent, OrderId, OrderLine,
    OrderPlaced, OrderReady, Payment, PaymentMethod, PaymentRecorded, PaymentStatus, PlaceOrder,
    Priority, ProductionStarted, RecordPayment, RemoveLine, TaskAssigned, TaskStatusChanged,
    UpdateTaskStatus, validate_draft,
};
pub use pricing::{MAX_TAX_RATE_BPS, OrderTotals, line_total};
pub use task::{ProductionTask, TaskKind, TaskStatus, default_task_set};
