//! Wire shapes of the JSON-lines protocol.
//!
//! ```text
//! -> {"id": 1, "actor": {...}, "op": {"apply_stock_movement": {"stock_item_id": "...", "movement_type": "OUT", "quantity": 3}}}
//! <- {"id": 1, "status": "ok", "result": {...}}
//! <- {"id": 1, "status": "error", "code": "INSUFFICIENT_STOCK", "message": "...", "retryable": false}
//! ```
//!
//! `id` is echoed untouched. `actor` defaults to the system actor.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use atelier_core::ActorContext;
use atelier_infra::{
    AddLineRequest, AssignTaskRequest, CreateOrderRequest, LedgerError, OrderFilter,
    PaymentRequest, PurchaseReceipt, RegisterStockItemRequest, RemoveLineRequest,
    StockMovementRequest, TaskStatusRequest, TransitionRequest,
};
use atelier_inventory::StockItemId;
use atelier_orders::OrderId;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: JsonValue,
    #[serde(default = "ActorContext::system")]
    pub actor: ActorContext,
    pub op: Operation,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    RegisterStockItem(RegisterStockItemRequest),
    ApplyStockMovement(StockMovementRequest),
    SetReorderThreshold { stock_item_id: StockItemId, threshold: u64 },
    ReceivePurchase(PurchaseReceipt),
    GetStockItem { stock_item_id: StockItemId },
    FindStockItemBySku { sku: String },
    ListStockMovements { stock_item_id: StockItemId },
    ListStockItems,
    ListLowStockItems,

    CreateOrder(CreateOrderRequest),
    TransitionOrder(TransitionRequest),
    AddOrderLine(AddLineRequest),
    RemoveOrderLine(RemoveLineRequest),
    UpdateTaskStatus(TaskStatusRequest),
    AssignTask(AssignTaskRequest),
    AddPayment(PaymentRequest),
    GetOrder { order_id: OrderId },
    FindOrderByNumber { order_number: String },
    ListOrders(OrderFilter),
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::RegisterStockItem(_) => "register_stock_item",
            Operation::ApplyStockMovement(_) => "apply_stock_movement",
            Operation::SetReorderThreshold { .. } => "set_reorder_threshold",
            Operation::ReceivePurchase(_) => "receive_purchase",
            Operation::GetStockItem { .. } => "get_stock_item",
            Operation::FindStockItemBySku { .. } => "find_stock_item_by_sku",
            Operation::ListStockMovements { .. } => "list_stock_movements",
            Operation::ListStockItems => "list_stock_items",
            Operation::ListLowStockItems => "list_low_stock_items",
            Operation::CreateOrder(_) => "create_order",
            Operation::TransitionOrder(_) => "transition_order",
            Operation::AddOrderLine(_) => "add_order_line",
            Operation::RemoveOrderLine(_) => "remove_order_line",
            Operation::UpdateTaskStatus(_) => "update_task_status",
            Operation::AssignTask(_) => "assign_task",
            Operation::AddPayment(_) => "add_payment",
            Operation::GetOrder { .. } => "get_order",
            Operation::FindOrderByNumber { .. } => "find_order_by_number",
            Operation::ListOrders(_) => "list_orders",
        }
    }

    /// Whether the operation changes ledger state.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Operation::RegisterStockItem(_)
                | Operation::ApplyStockMovement(_)
                | Operation::SetReorderThreshold { .. }
                | Operation::ReceivePurchase(_)
                | Operation::CreateOrder(_)
                | Operation::TransitionOrder(_)
                | Operation::AddOrderLine(_)
                | Operation::RemoveOrderLine(_)
                | Operation::UpdateTaskStatus(_)
                | Operation::AssignTask(_)
                | Operation::AddPayment(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub id: JsonValue,
    #[serde(flatten)]
    pub outcome: Outcome,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Ok { result: JsonValue },
    Error(ErrorBody),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    pub retryable: bool,
}

impl ErrorBody {
    /// The line could not be parsed as a request.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            code: "BAD_REQUEST",
            message: message.into(),
            retryable: false,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            code: "INTERNAL",
            message: message.into(),
            retryable: false,
        }
    }
}

impl From<&LedgerError> for ErrorBody {
    fn from(err: &LedgerError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

impl Response {
    pub fn ok(id: JsonValue, result: JsonValue) -> Self {
        Self {
            id,
            outcome: Outcome::Ok { result },
        }
    }

    pub fn error(id: JsonValue, body: ErrorBody) -> Self {
        Self {
            id,
            outcome: Outcome::Error(body),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self.outcome, Outcome::Ok { .. })
    }
}
