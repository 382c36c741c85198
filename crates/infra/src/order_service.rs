//! Order service: numbering, reservations and the order lifecycle.
//!
//! ```text
//! create_order
//!   -> validate (items exist, prices known, totals)      no side effect
//!   -> RESERVE every line                                one stock batch, all or nothing
//!   -> allocate order number                             per-period atomic counter
//!   -> append OrderPlaced
//!   any failure after the reservation: RELEASE what was reserved
//! ```
//!
//! Every stock movement an order causes is keyed by the line's hold and the
//! movement type, so a cancel, delivery or line removal that failed halfway
//! can be retried and performs only the steps still missing. Stock effects
//! go first and the order event after; the order lock is held throughout
//! and item locks are taken under it (order -> items, never the reverse).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use atelier_core::{ActorContext, ClientId, Money, UserId};
use atelier_inventory::{MovementReference, MovementType, OperationKey, StockItemId};
use atelier_orders::{
    AddLine, AssignTask, ChangeStatus, DraftLine, Order, OrderCommand, OrderEvent, OrderId,
    OrderLine, OrderNumber, OrderStatus, PaymentMethod, PeriodKey, PlaceOrder, Priority,
    RecordPayment, RemoveLine, TaskStatus, Transition, UpdateTaskStatus, validate_draft,
};

use crate::command_dispatcher::{CommandDispatcher, Dispatched, decide, retry_on_conflict};
use crate::config::LedgerConfig;
use crate::error::{LedgerError, LedgerResult, Subject};
use crate::event_store::EventStore;
use crate::ledger::{StockChange, StockLedger, StockMovementRequest};
use crate::locks::KeyedLocks;
use crate::projections::{self, OrderFilter, OrderSummary, OrderSummaryProjection, ProjectionError};
use crate::sequence::{SequenceAllocator, SequenceStore};
use crate::sinks::{Activity, ActivityAction, record_activity};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLineRequest {
    pub stock_item_id: StockItemId,
    pub quantity: u64,
    /// Defaults to the stock item's unit price.
    #[serde(default)]
    pub unit_price: Option<Money>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOrderRequest {
    pub client_id: ClientId,
    pub lines: Vec<OrderLineRequest>,
    #[serde(default)]
    pub discount: Money,
    #[serde(default)]
    pub tax_rate_bps: u32,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRequest {
    pub order_id: OrderId,
    pub target: OrderStatus,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddLineRequest {
    pub order_id: OrderId,
    #[serde(flatten)]
    pub line: OrderLineRequest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveLineRequest {
    pub order_id: OrderId,
    pub line_no: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatusRequest {
    pub order_id: OrderId,
    pub task_no: u32,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignTaskRequest {
    pub order_id: OrderId,
    pub task_no: u32,
    /// `None` clears the assignment.
    #[serde(default)]
    pub assignee: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub order_id: OrderId,
    pub amount: Money,
    pub method: PaymentMethod,
    #[serde(default)]
    pub reference: Option<String>,
}

/// Stock held for one order line.
#[derive(Debug, Clone, Copy)]
struct Hold {
    hold_id: Uuid,
    stock_item_id: StockItemId,
    quantity: u64,
}

impl Hold {
    fn of_draft(draft: &DraftLine) -> Self {
        Self {
            hold_id: draft.hold_id,
            stock_item_id: draft.stock_item_id,
            quantity: draft.quantity,
        }
    }

    fn of_line(line: &OrderLine) -> Self {
        Self {
            hold_id: line.hold_id,
            stock_item_id: line.stock_item_id,
            quantity: line.quantity,
        }
    }

    fn key(&self, movement_type: MovementType) -> OperationKey {
        OperationKey::for_hold(self.hold_id, movement_type)
    }

    fn reserve(&self, order_id: OrderId) -> StockChange {
        StockChange::Movement(StockMovementRequest {
            stock_item_id: self.stock_item_id,
            movement_type: MovementType::Reserve,
            quantity: self.quantity,
            reference: Some(MovementReference::Order(order_id.0)),
            note: Some("order reservation".to_string()),
            operation_key: Some(self.key(MovementType::Reserve)),
        })
    }

    fn release(&self, order_id: OrderId, note: &str) -> StockChange {
        StockChange::ReleaseHold {
            stock_item_id: self.stock_item_id,
            quantity: self.quantity,
            reference: Some(MovementReference::Order(order_id.0)),
            note: Some(note.to_string()),
            reserve_key: self.key(MovementType::Reserve),
            release_key: self.key(MovementType::Release),
        }
    }

    fn consume(&self, order_id: OrderId) -> StockChange {
        StockChange::ConsumeReservation {
            stock_item_id: self.stock_item_id,
            quantity: self.quantity,
            reference: Some(MovementReference::Order(order_id.0)),
            release_key: Some(self.key(MovementType::Release)),
            out_key: Some(self.key(MovementType::Out)),
        }
    }
}

pub struct OrderService<S, Q> {
    stock: Arc<StockLedger<S>>,
    dispatcher: CommandDispatcher<S>,
    allocator: SequenceAllocator<Q>,
    order_locks: KeyedLocks<OrderId>,
    summaries: Arc<OrderSummaryProjection>,
    lock_timeout: Duration,
    max_conflict_retries: u32,
}

impl<S, Q> OrderService<S, Q>
where
    S: EventStore + Clone,
    Q: SequenceStore,
{
    /// Orders share the stock ledger's store, clock and activity sink.
    pub fn new(stock: Arc<StockLedger<S>>, sequences: Q, config: &LedgerConfig) -> Self {
        Self {
            dispatcher: CommandDispatcher::new(stock.store().clone()),
            stock,
            allocator: SequenceAllocator::new(sequences, config.order_prefix.clone()),
            order_locks: KeyedLocks::new(),
            summaries: Arc::new(OrderSummaryProjection::new()),
            lock_timeout: config.lock_timeout,
            max_conflict_retries: config.max_conflict_retries,
        }
    }

    pub fn stock(&self) -> &StockLedger<S> {
        &self.stock
    }

    pub fn summaries(&self) -> &OrderSummaryProjection {
        &self.summaries
    }

    pub fn rebuild_read_models(&self) -> Result<usize, ProjectionError> {
        projections::rebuild(self.summaries.as_ref(), self.dispatcher.store())
    }

    pub fn create_order(&self, request: CreateOrderRequest, actor: &ActorContext) -> LedgerResult<Order> {
        let order_id = OrderId::generate();
        let occurred_at = self.stock.now();

        let drafts = self.price_lines(&request.lines)?;
        let totals = validate_draft(&drafts, request.discount, request.tax_rate_bps)
            .map_err(|e| Subject::Order(order_id).domain(e))?;

        let holds: Vec<Hold> = drafts.iter().map(Hold::of_draft).collect();
        self.reserve(order_id, &holds, actor)?;

        let order_number = match self
            .allocator
            .next_order_number(&PeriodKey::from_datetime(occurred_at))
        {
            Ok(number) => number,
            Err(err) => {
                tracing::warn!(%order_id, error = %err, "order number allocation failed; releasing stock");
                self.release_holds(order_id, &holds, actor);
                return Err(err.into());
            }
        };

        let command = OrderCommand::PlaceOrder(PlaceOrder {
            order_id,
            order_number: order_number.clone(),
            client_id: request.client_id,
            lines: drafts,
            discount: request.discount,
            tax_rate_bps: request.tax_rate_bps,
            priority: request.priority,
            notes: request.notes,
            deadline: request.deadline,
            actor_id: actor.actor_id,
            occurred_at,
        });

        let placed = self
            .with_order_lock(order_id, || self.dispatch(order_id, &command))
            .and_then(|placed| placed);
        let order = match placed {
            Ok(dispatched) => dispatched.aggregate,
            Err(err) => {
                tracing::warn!(%order_id, %order_number, error = %err, "order not persisted; releasing stock");
                self.release_holds(order_id, &holds, actor);
                return Err(if err.is_retryable() {
                    err
                } else {
                    LedgerError::PersistenceUnavailable(err.to_string())
                });
            }
        };

        tracing::info!(
            %order_id,
            %order_number,
            lines = order.lines().len(),
            total = %totals.total,
            "order created"
        );
        self.record(
            actor,
            ActivityAction::CreateOrder,
            &order,
            json!({
                "order_number": order_number.to_string(),
                "client_id": request.client_id,
                "total": totals.total.to_string(),
                "lines": order.lines().len(),
            }),
            occurred_at,
        );
        Ok(order)
    }

    /// Move an order to `target`, carrying out the stock effects of the edge.
    /// Asking for the current status returns the order unchanged.
    pub fn transition_order(&self, request: TransitionRequest, actor: &ActorContext) -> LedgerResult<Order> {
        let order_id = request.order_id;
        let subject = Subject::Order(order_id);

        self.with_order_lock(order_id, || -> LedgerResult<Order> {
            let order = self.load(order_id)?;
            let transition = order
                .plan_transition(request.target, request.reason.as_deref())
                .map_err(|e| subject.domain(e))?;

            let occurred_at = self.stock.now();
            let command = OrderCommand::ChangeStatus(ChangeStatus {
                order_id,
                target: request.target,
                reason: request.reason.clone(),
                actor_id: actor.actor_id,
                occurred_at,
            });
            let previous = order.status();

            match transition {
                Transition::Unchanged => return Ok(order),
                Transition::Cancel => {
                    let changes = order
                        .reserved_lines()
                        .map(|l| Hold::of_line(l).release(order_id, "order cancelled"))
                        .collect();
                    self.apply_stock(order_id, changes, "cancellation", actor)?;
                }
                Transition::Deliver => {
                    let changes = order
                        .reserved_lines()
                        .map(|l| Hold::of_line(l).consume(order_id))
                        .collect();
                    self.apply_stock(order_id, changes, "delivery", actor)?;
                }
                Transition::Confirm | Transition::Start | Transition::MarkReady => {}
            }
            let order = self.dispatch(order_id, &command)?.aggregate;

            tracing::info!(%order_id, from = %previous, to = %order.status(), "order status changed");
            self.record(
                actor,
                ActivityAction::UpdateOrderStatus,
                &order,
                json!({
                    "from": previous,
                    "to": order.status(),
                    "reason": order.cancellation_reason(),
                }),
                occurred_at,
            );
            Ok(order)
        })?
    }

    /// Add a line to a PENDING order, reserving its stock first.
    pub fn add_order_line(&self, request: AddLineRequest, actor: &ActorContext) -> LedgerResult<Order> {
        let order_id = request.order_id;
        let draft = self.price_line(&request.line, None)?;
        let hold = Hold::of_draft(&draft);
        let occurred_at = self.stock.now();
        let command = OrderCommand::AddLine(AddLine {
            order_id,
            line: draft,
            actor_id: actor.actor_id,
            occurred_at,
        });

        self.with_order_lock(order_id, || -> LedgerResult<Order> {
            let order = self.load(order_id)?;
            decide(order, [&command]).map_err(|e| Subject::Order(order_id).domain(e))?;

            self.reserve(order_id, std::slice::from_ref(&hold), actor)?;
            let order = match self.dispatch(order_id, &command) {
                Ok(dispatched) => dispatched.aggregate,
                Err(err) => {
                    tracing::warn!(%order_id, error = %err, "line not persisted; releasing stock");
                    self.release_holds(order_id, &[hold], actor);
                    return Err(err);
                }
            };

            let added = order.lines().last();
            tracing::info!(
                %order_id,
                line_no = added.map(|l| l.line_no),
                stock_item_id = %hold.stock_item_id,
                quantity = hold.quantity,
                total = %order.total_amount(),
                "order line added"
            );
            self.record(
                actor,
                ActivityAction::AddOrderLine,
                &order,
                json!({
                    "line_no": added.map(|l| l.line_no),
                    "stock_item_id": hold.stock_item_id,
                    "quantity": hold.quantity,
                    "total": order.total_amount().to_string(),
                }),
                occurred_at,
            );
            Ok(order)
        })?
    }

    /// Remove a line from a PENDING order, releasing its stock first.
    pub fn remove_order_line(&self, request: RemoveLineRequest, actor: &ActorContext) -> LedgerResult<Order> {
        let order_id = request.order_id;
        let occurred_at = self.stock.now();
        let command = OrderCommand::RemoveLine(RemoveLine {
            order_id,
            line_no: request.line_no,
            actor_id: actor.actor_id,
            occurred_at,
        });

        self.with_order_lock(order_id, || -> LedgerResult<Order> {
            let order = self.load(order_id)?;
            decide(order.clone(), [&command]).map_err(|e| Subject::Order(order_id).domain(e))?;
            let hold = order.line(request.line_no).map(Hold::of_line).ok_or_else(|| {
                LedgerError::ValidationFailed(format!("order has no line {}", request.line_no))
            })?;

            self.apply_stock(order_id, vec![hold.release(order_id, "order line removed")], "line removal", actor)?;
            let order = self.dispatch(order_id, &command)?.aggregate;

            tracing::info!(%order_id, line_no = request.line_no, total = %order.total_amount(), "order line removed");
            self.record(
                actor,
                ActivityAction::RemoveOrderLine,
                &order,
                json!({
                    "line_no": request.line_no,
                    "stock_item_id": hold.stock_item_id,
                    "quantity": hold.quantity,
                    "total": order.total_amount().to_string(),
                }),
                occurred_at,
            );
            Ok(order)
        })?
    }

    pub fn update_task_status(&self, request: TaskStatusRequest, actor: &ActorContext) -> LedgerResult<Order> {
        let order_id = request.order_id;
        let occurred_at = self.stock.now();
        let command = OrderCommand::UpdateTaskStatus(UpdateTaskStatus {
            order_id,
            task_no: request.task_no,
            status: request.status,
            actor_id: actor.actor_id,
            occurred_at,
        });

        let dispatched = self.with_order_lock(order_id, || self.dispatch(order_id, &command))??;
        if dispatched.is_noop() {
            return Ok(dispatched.aggregate);
        }

        let rolled_up = dispatched
            .events
            .iter()
            .any(|e| matches!(e, OrderEvent::OrderReady(_)));
        let order = dispatched.aggregate;
        tracing::info!(%order_id, task_no = request.task_no, status = ?request.status, rolled_up, "task status changed");
        self.record(
            actor,
            ActivityAction::UpdateTaskStatus,
            &order,
            json!({
                "task_no": request.task_no,
                "status": request.status,
                "order_status": order.status(),
            }),
            occurred_at,
        );
        Ok(order)
    }

    pub fn assign_task(&self, request: AssignTaskRequest, actor: &ActorContext) -> LedgerResult<Order> {
        let order_id = request.order_id;
        let occurred_at = self.stock.now();
        let command = OrderCommand::AssignTask(AssignTask {
            order_id,
            task_no: request.task_no,
            assignee: request.assignee,
            actor_id: actor.actor_id,
            occurred_at,
        });

        let dispatched = self.with_order_lock(order_id, || self.dispatch(order_id, &command))??;
        if dispatched.is_noop() {
            return Ok(dispatched.aggregate);
        }

        let order = dispatched.aggregate;
        tracing::info!(%order_id, task_no = request.task_no, assignee = ?request.assignee, "task assigned");
        self.record(
            actor,
            ActivityAction::AssignTask,
            &order,
            json!({
                "task_no": request.task_no,
                "assignee": request.assignee,
            }),
            occurred_at,
        );
        Ok(order)
    }

    pub fn add_payment(&self, request: PaymentRequest, actor: &ActorContext) -> LedgerResult<Order> {
        let order_id = request.order_id;
        let occurred_at = self.stock.now();
        let command = OrderCommand::RecordPayment(RecordPayment {
            order_id,
            payment_id: Uuid::now_v7(),
            amount: request.amount,
            method: request.method,
            reference: request.reference.filter(|r| !r.trim().is_empty()),
            actor_id: actor.actor_id,
            occurred_at,
        });

        let order = self
            .with_order_lock(order_id, || self.dispatch(order_id, &command))??
            .aggregate;

        tracing::info!(
            %order_id,
            amount = %request.amount,
            paid = %order.paid_amount(),
            payment_status = ?order.payment_status(),
            "payment recorded"
        );
        self.record(
            actor,
            ActivityAction::AddPayment,
            &order,
            json!({
                "amount": request.amount.to_string(),
                "method": request.method,
                "paid_amount": order.paid_amount().to_string(),
                "payment_status": order.payment_status(),
            }),
            occurred_at,
        );
        Ok(order)
    }

    pub fn get_order(&self, order_id: OrderId) -> LedgerResult<Order> {
        self.load(order_id)
    }

    pub fn find_by_number(&self, order_number: &str) -> LedgerResult<Order> {
        let number = OrderNumber::parse(order_number)
            .map_err(|e| LedgerError::ValidationFailed(e.to_string()))?;
        let order_id = self
            .summaries
            .id_for_number(&number)
            .ok_or_else(|| LedgerError::order_not_found(&number))?;
        self.load(order_id)
    }

    pub fn list_orders(&self, filter: &OrderFilter) -> Vec<OrderSummary> {
        self.summaries.list(filter)
    }

    fn load(&self, order_id: OrderId) -> LedgerResult<Order> {
        let order = self
            .dispatcher
            .load(order_id.0, |id| Order::empty(OrderId::new(id)))
            .map_err(|e| Subject::Order(order_id).dispatch(e))?;
        if !order.is_placed() {
            return Err(LedgerError::order_not_found(order_id));
        }
        Ok(order)
    }

    fn with_order_lock<R>(&self, order_id: OrderId, f: impl FnOnce() -> R) -> LedgerResult<R> {
        Ok(self.order_locks.with_lock(&order_id, self.lock_timeout, f)?)
    }

    /// Load, handle and append with conflict retries. Stock effects must
    /// already be recorded.
    fn dispatch(&self, order_id: OrderId, command: &OrderCommand) -> LedgerResult<Dispatched<Order>> {
        let dispatched = retry_on_conflict(self.max_conflict_retries, || {
            self.dispatcher
                .dispatch(order_id.0, Order::AGGREGATE_TYPE, command, |id| Order::empty(OrderId::new(id)))
        })
        .map_err(|e| Subject::Order(order_id).dispatch(e))?;
        projections::feed(self.summaries.as_ref(), self.dispatcher.store(), &dispatched.committed);
        Ok(dispatched)
    }

    /// Resolve each line's price and check the referenced items exist.
    fn price_lines(&self, lines: &[OrderLineRequest]) -> LedgerResult<Vec<DraftLine>> {
        if lines.is_empty() {
            return Err(LedgerError::ValidationFailed(
                "an order needs at least one line".to_string(),
            ));
        }

        lines
            .iter()
            .zip(1..)
            .map(|(line, line_no)| self.price_line(line, Some(line_no)))
            .collect()
    }

    fn price_line(&self, line: &OrderLineRequest, line_no: Option<u32>) -> LedgerResult<DraftLine> {
        let label = line_no.map_or_else(|| "line".to_string(), |n| format!("line {n}"));
        if line.quantity == 0 {
            return Err(LedgerError::ValidationFailed(format!(
                "{label} quantity must be greater than zero"
            )));
        }
        let item = self.stock.stock_item(line.stock_item_id).map_err(|e| match e {
            LedgerError::NotFound { .. } => LedgerError::ValidationFailed(format!(
                "{label}: stock item {} does not exist",
                line.stock_item_id
            )),
            other => other,
        })?;
        let unit_price = line.unit_price.or(item.unit_price()).ok_or_else(|| {
            LedgerError::ValidationFailed(format!(
                "{label}: no price given and {} has no unit price",
                item.sku()
            ))
        })?;
        Ok(DraftLine {
            hold_id: Uuid::now_v7(),
            stock_item_id: line.stock_item_id,
            quantity: line.quantity,
            unit_price,
        })
    }

    /// RESERVE every hold in one batch: either all are taken or none.
    fn reserve(&self, order_id: OrderId, holds: &[Hold], actor: &ActorContext) -> LedgerResult<()> {
        let changes = holds.iter().map(|h| h.reserve(order_id)).collect();
        let Err(err) = self.stock.apply_changes(changes, actor) else {
            return Ok(());
        };

        tracing::warn!(%order_id, lines = holds.len(), error = %err, "reservation failed");
        if matches!(err, LedgerError::PersistenceUnavailable(_)) {
            // A store failure can leave part of the batch recorded.
            self.release_holds(order_id, holds, actor);
        }
        Err(match err {
            LedgerError::InsufficientStock {
                stock_item_id,
                requested,
                available,
            } => LedgerError::StockUnavailable {
                stock_item_id,
                requested,
                available,
            },
            other => other,
        })
    }

    /// Compensation: RELEASE whichever of `holds` were reserved. A failure is
    /// logged and the stock stays held.
    fn release_holds(&self, order_id: OrderId, holds: &[Hold], actor: &ActorContext) {
        let changes = holds
            .iter()
            .map(|h| h.release(order_id, "reservation released"))
            .collect();
        if let Err(err) = self.stock.apply_changes(changes, actor) {
            tracing::error!(
                %order_id,
                lines = holds.len(),
                error = %err,
                "compensating release failed; stock remains held"
            );
        }
    }

    /// Stock effects of an order operation, recorded before its order event.
    /// On failure the order is left as it was; keyed changes already
    /// recorded are skipped when the operation is retried.
    fn apply_stock(
        &self,
        order_id: OrderId,
        changes: Vec<StockChange>,
        operation: &str,
        actor: &ActorContext,
    ) -> LedgerResult<()> {
        self.stock.apply_changes(changes, actor).map(|_| ()).inspect_err(|err| {
            tracing::warn!(%order_id, operation, error = %err, "stock effects not recorded; order unchanged");
        })
    }

    fn record(
        &self,
        actor: &ActorContext,
        action: ActivityAction,
        order: &Order,
        details: serde_json::Value,
        occurred_at: DateTime<Utc>,
    ) {
        record_activity(
            self.stock.activity_sink(),
            Activity {
                actor_id: actor.actor_id,
                action,
                entity_type: Order::AGGREGATE_TYPE.to_string(),
                entity_id: order
                    .order_number()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| order.id_typed().to_string()),
                details,
                occurred_at,
            },
        );
    }
}
