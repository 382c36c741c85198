use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use atelier_core::{Aggregate, AggregateId, AggregateRoot, ClientId, DomainError, Money, UserId};
use atelier_events::Event;
use atelier_inventory::StockItemId;

use crate::lifecycle::{OrderStateMachine, OrderStatus, Transition};
use crate::number::OrderNumber;
use crate::pricing::{OrderTotals, line_total};
use crate::task::{ProductionTask, TaskStatus, default_task_set};

/// Order identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(pub AggregateId);

impl OrderId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }

    pub fn generate() -> Self {
        Self(AggregateId::new())
    }
}

impl core::fmt::Display for OrderId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl core::str::FromStr for OrderId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

/// Where a line's stock hold stands.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LineReservation {
    Reserved,
    Released,
    Consumed,
}

/// Order line: stock item, quantity, unit price.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub line_no: u32,
    /// Identifies the stock hold behind this line.
    pub hold_id: Uuid,
    pub stock_item_id: StockItemId,
    pub quantity: u64,
    pub unit_price: Money,
    pub total_price: Money,
    pub reservation: LineReservation,
}

/// Line as requested by the caller, price already resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftLine {
    pub hold_id: Uuid,
    pub stock_item_id: StockItemId,
    pub quantity: u64,
    pub unit_price: Money,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMethod {
    Cash,
    Card,
    Transfer,
    Mobile,
    Other,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Unpaid,
    Partial,
    Paid,
}

impl PaymentStatus {
    pub fn from_amounts(paid: Money, total: Money) -> Self {
        if paid >= total {
            PaymentStatus::Paid
        } else if paid.is_zero() {
            PaymentStatus::Unpaid
        } else {
            PaymentStatus::Partial
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub payment_id: Uuid,
    pub amount: Money,
    pub method: PaymentMethod,
    pub reference: Option<String>,
    pub recorded_at: DateTime<Utc>,
    pub recorded_by: UserId,
}

/// Check a draft order and compute its totals. Used before any stock is touched.
pub fn validate_draft(
    lines: &[DraftLine],
    discount: Money,
    tax_rate_bps: u32,
) -> Result<OrderTotals, DomainError> {
    if lines.is_empty() {
        return Err(DomainError::validation("an order needs at least one line"));
    }
    if let Some(pos) = lines.iter().position(|l| l.quantity == 0) {
        return Err(DomainError::validation(format!(
            "line {} quantity must be greater than zero",
            pos + 1
        )));
    }
    OrderTotals::compute(
        lines.iter().map(|l| (l.unit_price, l.quantity)),
        discount,
        tax_rate_bps,
    )
}

/// Aggregate root: Order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Order {
    id: OrderId,
    order_number: Option<OrderNumber>,
    client_id: Option<ClientId>,
    status: OrderStatus,
    lines: Vec<OrderLine>,
    totals: OrderTotals,
    paid_amount: Money,
    payment_status: PaymentStatus,
    paid_at: Option<DateTime<Utc>>,
    payments: Vec<Payment>,
    tasks: Vec<ProductionTask>,
    priority: Priority,
    notes: Option<String>,
    deadline: Option<DateTime<Utc>>,
    created_at: Option<DateTime<Utc>>,
    created_by: Option<UserId>,
    confirmed_at: Option<DateTime<Utc>>,
    delivered_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
    cancellation_reason: Option<String>,
    version: u64,
    #[serde(skip)]
    placed: bool,
    /// Line numbers are never reused, even after a line is removed.
    #[serde(skip)]
    next_line_no: u32,
}

impl Order {
    pub const AGGREGATE_TYPE: &'static str = "order";

    /// Create an empty, not-yet-placed aggregate instance for rehydration.
    pub fn empty(id: OrderId) -> Self {
        Self {
            id,
            order_number: None,
            client_id: None,
            status: OrderStatus::Pending,
            lines: Vec::new(),
            totals: OrderTotals::default(),
            paid_amount: Money::ZERO,
            payment_status: PaymentStatus::Unpaid,
            paid_at: None,
            payments: Vec::new(),
            tasks: Vec::new(),
            priority: Priority::default(),
            notes: None,
            deadline: None,
            created_at: None,
            created_by: None,
            confirmed_at: None,
            delivered_at: None,
            cancelled_at: None,
            cancellation_reason: None,
            version: 0,
            placed: false,
            next_line_no: 1,
        }
    }

    pub fn id_typed(&self) -> OrderId {
        self.id
    }

    pub fn is_placed(&self) -> bool {
        self.placed
    }

    pub fn order_number(&self) -> Option<&OrderNumber> {
        self.order_number.as_ref()
    }

    pub fn client_id(&self) -> Option<ClientId> {
        self.client_id
    }

    pub fn status(&self) -> OrderStatus {
        self.status
    }

    pub fn lines(&self) -> &[OrderLine] {
        &self.lines
    }

    pub fn totals(&self) -> &OrderTotals {
        &self.totals
    }

    pub fn total_amount(&self) -> Money {
        self.totals.total
    }

    pub fn paid_amount(&self) -> Money {
        self.paid_amount
    }

    /// Still owed; zero once paid in full or overpaid.
    pub fn balance_due(&self) -> Money {
        self.totals.total.saturating_sub(self.paid_amount)
    }

    pub fn payment_status(&self) -> PaymentStatus {
        self.payment_status
    }

    pub fn paid_at(&self) -> Option<DateTime<Utc>> {
        self.paid_at
    }

    pub fn payments(&self) -> &[Payment] {
        &self.payments
    }

    pub fn tasks(&self) -> &[ProductionTask] {
        &self.tasks
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn notes(&self) -> Option<&str> {
        self.notes.as_deref()
    }

    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.deadline
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    pub fn created_by(&self) -> Option<UserId> {
        self.created_by
    }

    pub fn confirmed_at(&self) -> Option<DateTime<Utc>> {
        self.confirmed_at
    }

    pub fn delivered_at(&self) -> Option<DateTime<Utc>> {
        self.delivered_at
    }

    pub fn cancelled_at(&self) -> Option<DateTime<Utc>> {
        self.cancelled_at
    }

    pub fn cancellation_reason(&self) -> Option<&str> {
        self.cancellation_reason.as_deref()
    }

    /// Lines whose stock is still held.
    pub fn reserved_lines(&self) -> impl Iterator<Item = &OrderLine> {
        self.lines
            .iter()
            .filter(|l| l.reservation == LineReservation::Reserved)
    }

    /// Number the next added line will get.
    pub fn next_line_no(&self) -> u32 {
        self.next_line_no
    }

    /// Line numbers are stable; this is not an index.
    pub fn line(&self, line_no: u32) -> Option<&OrderLine> {
        self.lines.iter().find(|l| l.line_no == line_no)
    }

    /// Decide which lifecycle edge moving to `target` takes, checking every
    /// precondition that depends on this order. Pure; nothing is changed.
    pub fn plan_transition(
        &self,
        target: OrderStatus,
        reason: Option<&str>,
    ) -> Result<Transition, DomainError> {
        if !self.placed {
            return Err(DomainError::not_found());
        }

        let transition = OrderStateMachine::plan(self.status, target)?;
        match transition {
            Transition::Confirm => {
                if let Some(line) = self
                    .lines
                    .iter()
                    .find(|l| l.reservation != LineReservation::Reserved)
                {
                    return Err(DomainError::invalid_transition(format!(
                        "line {} is not reserved",
                        line.line_no
                    )));
                }
            }
            Transition::MarkReady => {
                let open = self
                    .tasks
                    .iter()
                    .filter(|t| t.status != TaskStatus::Completed)
                    .count();
                if open > 0 {
                    return Err(DomainError::invalid_transition(format!(
                        "{open} production task(s) not completed"
                    )));
                }
            }
            Transition::Cancel => {
                if reason.is_none_or(|r| r.trim().is_empty()) {
                    return Err(DomainError::validation("cancelling an order requires a reason"));
                }
            }
            Transition::Unchanged | Transition::Start | Transition::Deliver => {}
        }

        Ok(transition)
    }

    fn ensure_order_id(&self, order_id: OrderId) -> Result<(), DomainError> {
        if self.id != order_id {
            return Err(DomainError::invariant("order_id mismatch"));
        }
        Ok(())
    }

    /// Lines can only be added or removed before confirmation.
    fn ensure_lines_editable(&self, order_id: OrderId) -> Result<(), DomainError> {
        if !self.placed {
            return Err(DomainError::not_found());
        }
        self.ensure_order_id(order_id)?;
        if self.status != OrderStatus::Pending {
            return Err(DomainError::invalid_transition(format!(
                "lines cannot change while the order is {}",
                self.status
            )));
        }
        Ok(())
    }

    fn totals_for<'a>(&self, lines: impl IntoIterator<Item = &'a OrderLine>) -> Result<OrderTotals, DomainError> {
        OrderTotals::compute(
            lines.into_iter().map(|l| (l.unit_price, l.quantity)),
            self.totals.discount,
            self.totals.tax_rate_bps,
        )
    }

    fn refresh_totals(&mut self, at: DateTime<Utc>) {
        // Checked when the line change was decided.
        if let Ok(totals) = self.totals_for(&self.lines) {
            self.totals = totals;
        }
        self.payment_status = PaymentStatus::from_amounts(self.paid_amount, self.totals.total);
        if self.payment_status == PaymentStatus::Paid {
            self.paid_at.get_or_insert(at);
        } else {
            self.paid_at = None;
        }
    }
}

impl AggregateRoot for Order {
    type Id = OrderId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: PlaceOrder. Every line's stock must already be reserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceOrder {
    pub order_id: OrderId,
    pub order_number: OrderNumber,
    pub client_id: ClientId,
    pub lines: Vec<DraftLine>,
    pub discount: Money,
    pub tax_rate_bps: u32,
    pub priority: Priority,
    pub notes: Option<String>,
    pub deadline: Option<DateTime<Utc>>,
    pub actor_id: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ChangeStatus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeStatus {
    pub order_id: OrderId,
    pub target: OrderStatus,
    pub reason: Option<String>,
    pub actor_id: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: UpdateTaskStatus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateTaskStatus {
    pub order_id: OrderId,
    pub task_no: u32,
    pub status: TaskStatus,
    pub actor_id: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RecordPayment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordPayment {
    pub order_id: OrderId,
    pub payment_id: Uuid,
    pub amount: Money,
    pub method: PaymentMethod,
    pub reference: Option<String>,
    pub actor_id: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AddLine. The line's stock must already be reserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddLine {
    pub order_id: OrderId,
    pub line: DraftLine,
    pub actor_id: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RemoveLine. Releasing the line's stock is the caller's job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveLine {
    pub order_id: OrderId,
    pub line_no: u32,
    pub actor_id: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AssignTask. `None` clears the assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignTask {
    pub order_id: OrderId,
    pub task_no: u32,
    pub assignee: Option<UserId>,
    pub actor_id: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderCommand {
    PlaceOrder(PlaceOrder),
    ChangeStatus(ChangeStatus),
    AddLine(AddLine),
    RemoveLine(RemoveLine),
    UpdateTaskStatus(UpdateTaskStatus),
    AssignTask(AssignTask),
    RecordPayment(RecordPayment),
}

/// Event: OrderPlaced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPlaced {
    pub order_id: OrderId,
    pub order_number: OrderNumber,
    pub client_id: ClientId,
    pub lines: Vec<OrderLine>,
    pub discount: Money,
    pub tax_rate_bps: u32,
    pub priority: Priority,
    pub notes: Option<String>,
    pub deadline: Option<DateTime<Utc>>,
    pub actor_id: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: OrderConfirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderConfirmed {
    pub order_id: OrderId,
    pub tasks: Vec<ProductionTask>,
    pub actor_id: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ProductionStarted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductionStarted {
    pub order_id: OrderId,
    pub actor_id: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: OrderReady.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderReady {
    pub order_id: OrderId,
    pub actor_id: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: OrderDelivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderDelivered {
    pub order_id: OrderId,
    pub consumed_lines: Vec<u32>,
    pub actor_id: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: OrderCancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCancelled {
    pub order_id: OrderId,
    pub reason: String,
    pub released_lines: Vec<u32>,
    pub actor_id: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: TaskStatusChanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatusChanged {
    pub order_id: OrderId,
    pub task_no: u32,
    pub status: TaskStatus,
    pub actor_id: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: LineAdded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineAdded {
    pub order_id: OrderId,
    pub line: OrderLine,
    pub actor_id: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: LineRemoved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRemoved {
    pub order_id: OrderId,
    pub line_no: u32,
    pub actor_id: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: TaskAssigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskAssigned {
    pub order_id: OrderId,
    pub task_no: u32,
    pub assignee: Option<UserId>,
    pub actor_id: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: PaymentRecorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRecorded {
    pub order_id: OrderId,
    pub payment: Payment,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderEvent {
    OrderPlaced(OrderPlaced),
    OrderConfirmed(OrderConfirmed),
    ProductionStarted(ProductionStarted),
    OrderReady(OrderReady),
    OrderDelivered(OrderDelivered),
    OrderCancelled(OrderCancelled),
    LineAdded(LineAdded),
    LineRemoved(LineRemoved),
    TaskStatusChanged(TaskStatusChanged),
    TaskAssigned(TaskAssigned),
    PaymentRecorded(PaymentRecorded),
}

impl Event for OrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            OrderEvent::OrderPlaced(_) => "orders.order.placed",
            OrderEvent::OrderConfirmed(_) => "orders.order.confirmed",
            OrderEvent::ProductionStarted(_) => "orders.order.production_started",
            OrderEvent::OrderReady(_) => "orders.order.ready",
            OrderEvent::OrderDelivered(_) => "orders.order.delivered",
            OrderEvent::OrderCancelled(_) => "orders.order.cancelled",
            OrderEvent::LineAdded(_) => "orders.order.line_added",
            OrderEvent::LineRemoved(_) => "orders.order.line_removed",
            OrderEvent::TaskStatusChanged(_) => "orders.task.status_changed",
            OrderEvent::TaskAssigned(_) => "orders.task.assigned",
            OrderEvent::PaymentRecorded(_) => "orders.order.payment_recorded",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            OrderEvent::OrderPlaced(e) => e.occurred_at,
            OrderEvent::OrderConfirmed(e) => e.occurred_at,
            OrderEvent::ProductionStarted(e) => e.occurred_at,
            OrderEvent::OrderReady(e) => e.occurred_at,
            OrderEvent::OrderDelivered(e) => e.occurred_at,
            OrderEvent::OrderCancelled(e) => e.occurred_at,
            OrderEvent::LineAdded(e) => e.occurred_at,
            OrderEvent::LineRemoved(e) => e.occurred_at,
            OrderEvent::TaskStatusChanged(e) => e.occurred_at,
            OrderEvent::TaskAssigned(e) => e.occurred_at,
            OrderEvent::PaymentRecorded(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Order {
    type Command = OrderCommand;
    type Event = OrderEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            OrderEvent::OrderPlaced(e) => {
                self.id = e.order_id;
                self.order_number = Some(e.order_number.clone());
                self.client_id = Some(e.client_id);
                self.status = OrderStatus::Pending;
                self.lines = e.lines.clone();
                // Validated when placed; a stream that fails here is corrupt.
                self.totals = OrderTotals::compute(
                    self.lines.iter().map(|l| (l.unit_price, l.quantity)),
                    e.discount,
                    e.tax_rate_bps,
                )
                .unwrap_or_default();
                self.payment_status = PaymentStatus::from_amounts(self.paid_amount, self.totals.total);
                if self.payment_status == PaymentStatus::Paid {
                    self.paid_at = Some(e.occurred_at);
                }
                self.priority = e.priority;
                self.notes = e.notes.clone();
                self.deadline = e.deadline;
                self.created_at = Some(e.occurred_at);
                self.created_by = Some(e.actor_id);
                self.placed = true;
                self.next_line_no = self.lines.iter().map(|l| l.line_no).max().unwrap_or(0) + 1;
            }
            OrderEvent::OrderConfirmed(e) => {
                self.status = OrderStatus::Confirmed;
                self.tasks = e.tasks.clone();
                self.confirmed_at = Some(e.occurred_at);
            }
            OrderEvent::ProductionStarted(e) => {
                self.status = OrderStatus::InProgress;
                for task in &mut self.tasks {
                    if task.status == TaskStatus::Pending {
                        task.set_status(TaskStatus::InProgress, e.occurred_at);
                    }
                }
            }
            OrderEvent::OrderReady(_) => {
                self.status = OrderStatus::Ready;
            }
            OrderEvent::OrderDelivered(e) => {
                self.status = OrderStatus::Delivered;
                self.delivered_at = Some(e.occurred_at);
                for line in &mut self.lines {
                    if e.consumed_lines.contains(&line.line_no) {
                        line.reservation = LineReservation::Consumed;
                    }
                }
            }
            OrderEvent::OrderCancelled(e) => {
                self.status = OrderStatus::Cancelled;
                self.cancelled_at = Some(e.occurred_at);
                self.cancellation_reason = Some(e.reason.clone());
                for line in &mut self.lines {
                    if e.released_lines.contains(&line.line_no) {
                        line.reservation = LineReservation::Released;
                    }
                }
                for task in &mut self.tasks {
                    if task.status.is_open() {
                        task.set_status(TaskStatus::Cancelled, e.occurred_at);
                    }
                }
            }
            OrderEvent::LineAdded(e) => {
                self.next_line_no = self.next_line_no.max(e.line.line_no + 1);
                self.lines.push(e.line.clone());
                self.refresh_totals(e.occurred_at);
            }
            OrderEvent::LineRemoved(e) => {
                self.lines.retain(|l| l.line_no != e.line_no);
                self.refresh_totals(e.occurred_at);
            }
            OrderEvent::TaskStatusChanged(e) => {
                if let Some(task) = self.tasks.iter_mut().find(|t| t.task_no == e.task_no) {
                    task.set_status(e.status, e.occurred_at);
                }
            }
            OrderEvent::TaskAssigned(e) => {
                if let Some(task) = self.tasks.iter_mut().find(|t| t.task_no == e.task_no) {
                    task.assigned_to = e.assignee;
                }
            }
            OrderEvent::PaymentRecorded(e) => {
                self.paid_amount = self.paid_amount.checked_add(e.payment.amount).unwrap_or(self.paid_amount);
                self.payments.push(e.payment.clone());
                self.payment_status = PaymentStatus::from_amounts(self.paid_amount, self.totals.total);
                if self.payment_status == PaymentStatus::Paid && self.paid_at.is_none() {
                    self.paid_at = Some(e.occurred_at);
                }
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            OrderCommand::PlaceOrder(cmd) => self.handle_place(cmd),
            OrderCommand::ChangeStatus(cmd) => self.handle_change_status(cmd),
            OrderCommand::AddLine(cmd) => self.handle_add_line(cmd),
            OrderCommand::RemoveLine(cmd) => self.handle_remove_line(cmd),
            OrderCommand::UpdateTaskStatus(cmd) => self.handle_task(cmd),
            OrderCommand::AssignTask(cmd) => self.handle_assign(cmd),
            OrderCommand::RecordPayment(cmd) => self.handle_payment(cmd),
        }
    }
}

impl Order {
    fn handle_place(&self, cmd: &PlaceOrder) -> Result<Vec<OrderEvent>, DomainError> {
        if self.placed {
            return Err(DomainError::conflict("order already placed"));
        }
        self.ensure_order_id(cmd.order_id)?;
        validate_draft(&cmd.lines, cmd.discount, cmd.tax_rate_bps)?;
        let mut holds: Vec<Uuid> = cmd.lines.iter().map(|l| l.hold_id).collect();
        holds.sort();
        holds.dedup();
        if holds.len() != cmd.lines.len() {
            return Err(DomainError::validation("each line needs its own stock hold"));
        }

        let lines = cmd
            .lines
            .iter()
            .zip(1..)
            .map(|(draft, line_no)| {
                Ok(OrderLine {
                    line_no,
                    hold_id: draft.hold_id,
                    stock_item_id: draft.stock_item_id,
                    quantity: draft.quantity,
                    unit_price: draft.unit_price,
                    total_price: line_total(draft.unit_price, draft.quantity)?,
                    reservation: LineReservation::Reserved,
                })
            })
            .collect::<Result<Vec<_>, DomainError>>()?;

        Ok(vec![OrderEvent::OrderPlaced(OrderPlaced {
            order_id: cmd.order_id,
            order_number: cmd.order_number.clone(),
            client_id: cmd.client_id,
            lines,
            discount: cmd.discount,
            tax_rate_bps: cmd.tax_rate_bps,
            priority: cmd.priority,
            notes: cmd.notes.clone().filter(|n| !n.trim().is_empty()),
            deadline: cmd.deadline,
            actor_id: cmd.actor_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_change_status(&self, cmd: &ChangeStatus) -> Result<Vec<OrderEvent>, DomainError> {
        let transition = self.plan_transition(cmd.target, cmd.reason.as_deref())?;
        self.ensure_order_id(cmd.order_id)?;

        let order_id = self.id;
        let actor_id = cmd.actor_id;
        let occurred_at = cmd.occurred_at;

        let event = match transition {
            Transition::Unchanged => return Ok(vec![]),
            Transition::Confirm => OrderEvent::OrderConfirmed(OrderConfirmed {
                order_id,
                tasks: default_task_set(),
                actor_id,
                occurred_at,
            }),
            Transition::Start => OrderEvent::ProductionStarted(ProductionStarted {
                order_id,
                actor_id,
                occurred_at,
            }),
            Transition::MarkReady => OrderEvent::OrderReady(OrderReady {
                order_id,
                actor_id,
                occurred_at,
            }),
            Transition::Deliver => OrderEvent::OrderDelivered(OrderDelivered {
                order_id,
                consumed_lines: self.reserved_lines().map(|l| l.line_no).collect(),
                actor_id,
                occurred_at,
            }),
            Transition::Cancel => OrderEvent::OrderCancelled(OrderCancelled {
                order_id,
                reason: cmd.reason.as_deref().unwrap_or_default().trim().to_string(),
                released_lines: self.reserved_lines().map(|l| l.line_no).collect(),
                actor_id,
                occurred_at,
            }),
        };

        Ok(vec![event])
    }

    fn handle_add_line(&self, cmd: &AddLine) -> Result<Vec<OrderEvent>, DomainError> {
        self.ensure_lines_editable(cmd.order_id)?;
        if cmd.line.quantity == 0 {
            return Err(DomainError::validation("line quantity must be greater than zero"));
        }

        if self.lines.iter().any(|l| l.hold_id == cmd.line.hold_id) {
            return Err(DomainError::conflict("line hold already on the order"));
        }

        let line = OrderLine {
            line_no: self.next_line_no,
            hold_id: cmd.line.hold_id,
            stock_item_id: cmd.line.stock_item_id,
            quantity: cmd.line.quantity,
            unit_price: cmd.line.unit_price,
            total_price: line_total(cmd.line.unit_price, cmd.line.quantity)?,
            reservation: LineReservation::Reserved,
        };
        self.totals_for(self.lines.iter().chain([&line]))?;

        Ok(vec![OrderEvent::LineAdded(LineAdded {
            order_id: self.id,
            line,
            actor_id: cmd.actor_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_remove_line(&self, cmd: &RemoveLine) -> Result<Vec<OrderEvent>, DomainError> {
        self.ensure_lines_editable(cmd.order_id)?;
        if self.line(cmd.line_no).is_none() {
            return Err(DomainError::validation(format!("order has no line {}", cmd.line_no)));
        }
        if self.lines.len() == 1 {
            return Err(DomainError::validation(
                "an order needs at least one line; cancel it instead",
            ));
        }
        self.totals_for(self.lines.iter().filter(|l| l.line_no != cmd.line_no))?;

        Ok(vec![OrderEvent::LineRemoved(LineRemoved {
            order_id: self.id,
            line_no: cmd.line_no,
            actor_id: cmd.actor_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_assign(&self, cmd: &AssignTask) -> Result<Vec<OrderEvent>, DomainError> {
        if !self.placed {
            return Err(DomainError::not_found());
        }
        self.ensure_order_id(cmd.order_id)?;
        if self.status.is_terminal() {
            return Err(DomainError::invalid_transition(format!(
                "tasks cannot be assigned once the order is {}",
                self.status
            )));
        }

        let task = self
            .tasks
            .iter()
            .find(|t| t.task_no == cmd.task_no)
            .ok_or_else(|| DomainError::validation(format!("order has no task {}", cmd.task_no)))?;
        if task.assigned_to == cmd.assignee {
            return Ok(vec![]);
        }

        Ok(vec![OrderEvent::TaskAssigned(TaskAssigned {
            order_id: self.id,
            task_no: cmd.task_no,
            assignee: cmd.assignee,
            actor_id: cmd.actor_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_task(&self, cmd: &UpdateTaskStatus) -> Result<Vec<OrderEvent>, DomainError> {
        if !self.placed {
            return Err(DomainError::not_found());
        }
        self.ensure_order_id(cmd.order_id)?;

        if !matches!(self.status, OrderStatus::Confirmed | OrderStatus::InProgress) {
            return Err(DomainError::invalid_transition(format!(
                "tasks cannot change while the order is {}",
                self.status
            )));
        }

        let task = self
            .tasks
            .iter()
            .find(|t| t.task_no == cmd.task_no)
            .ok_or_else(|| DomainError::validation(format!("order has no task {}", cmd.task_no)))?;

        if task.status == cmd.status {
            return Ok(vec![]);
        }
        if !task.status.can_move_to(cmd.status) {
            return Err(DomainError::invalid_transition(format!(
                "task {} cannot move from {:?} to {:?}",
                task.task_no, task.status, cmd.status
            )));
        }

        let mut events = vec![OrderEvent::TaskStatusChanged(TaskStatusChanged {
            order_id: self.id,
            task_no: cmd.task_no,
            status: cmd.status,
            actor_id: cmd.actor_id,
            occurred_at: cmd.occurred_at,
        })];

        let last_to_complete = cmd.status == TaskStatus::Completed
            && self
                .tasks
                .iter()
                .filter(|t| t.task_no != cmd.task_no)
                .all(|t| t.status == TaskStatus::Completed);
        if last_to_complete && self.status == OrderStatus::InProgress {
            events.push(OrderEvent::OrderReady(OrderReady {
                order_id: self.id,
                actor_id: cmd.actor_id,
                occurred_at: cmd.occurred_at,
            }));
        }

        Ok(events)
    }

    fn handle_payment(&self, cmd: &RecordPayment) -> Result<Vec<OrderEvent>, DomainError> {
        if !self.placed {
            return Err(DomainError::not_found());
        }
        self.ensure_order_id(cmd.order_id)?;

        if cmd.amount.is_zero() {
            return Err(DomainError::invalid_amount("payment amount must be greater than zero"));
        }
        if self.status == OrderStatus::Cancelled {
            return Err(DomainError::invalid_transition("cannot record a payment on a cancelled order"));
        }
        if self.paid_amount.checked_add(cmd.amount).is_none() {
            return Err(DomainError::invalid_amount("payment amount is out of range"));
        }

        Ok(vec![OrderEvent::PaymentRecorded(PaymentRecorded {
            order_id: self.id,
            payment: Payment {
                payment_id: cmd.payment_id,
                amount: cmd.amount,
                method: cmd.method,
                reference: cmd.reference.clone(),
                recorded_at: cmd.occurred_at,
                recorded_by: cmd.actor_id,
            },
            occurred_at: cmd.occurred_at,
        })])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::number::PeriodKey;
    use crate::task::TaskKind;

    fn test_time() -> DateTime<Utc> {
        Utc::now()
    }

    fn run(order: &mut Order, cmd: OrderCommand) -> Result<Vec<OrderEvent>, DomainError> {
        let events = order.handle(&cmd)?;
        for e in &events {
            order.apply(e);
        }
        Ok(events)
    }

    fn draft(quantity: u64, unit_price: u64) -> DraftLine {
        DraftLine {
            hold_id: Uuid::now_v7(),
            stock_item_id: StockItemId::generate(),
            quantity,
            unit_price: Money::from_minor(unit_price),
        }
    }

    fn place_cmd(order_id: OrderId, lines: Vec<DraftLine>) -> PlaceOrder {
        PlaceOrder {
            order_id,
            order_number: OrderNumber::new("CMD", PeriodKey::parse("202403").unwrap(), 1).unwrap(),
            client_id: ClientId::new(),
            lines,
            discount: Money::ZERO,
            tax_rate_bps: 0,
            priority: Priority::High,
            notes: Some("rush".to_string()),
            deadline: None,
            actor_id: UserId::new(),
            occurred_at: test_time(),
        }
    }

    fn placed(lines: Vec<DraftLine>) -> Order {
        let order_id = OrderId::generate();
        let mut order = Order::empty(order_id);
        run(&mut order, OrderCommand::PlaceOrder(place_cmd(order_id, lines))).unwrap();
        order
    }

    fn change(order: &Order, target: OrderStatus, reason: Option<&str>) -> OrderCommand {
        OrderCommand::ChangeStatus(ChangeStatus {
            order_id: order.id_typed(),
            target,
            reason: reason.map(str::to_string),
            actor_id: UserId::new(),
            occurred_at: test_time(),
        })
    }

    fn task_cmd(order: &Order, task_no: u32, status: TaskStatus) -> OrderCommand {
        OrderCommand::UpdateTaskStatus(UpdateTaskStatus {
            order_id: order.id_typed(),
            task_no,
            status,
            actor_id: UserId::new(),
            occurred_at: test_time(),
        })
    }

    fn pay(order: &Order, amount: u64) -> OrderCommand {
        OrderCommand::RecordPayment(RecordPayment {
            order_id: order.id_typed(),
            payment_id: Uuid::now_v7(),
            amount: Money::from_minor(amount),
            method: PaymentMethod::Cash,
            reference: None,
            actor_id: UserId::new(),
            occurred_at: test_time(),
        })
    }

    #[test]
    fn place_order_numbers_lines_and_computes_totals() {
        let order_id = OrderId::generate();
        let order = Order::empty(order_id);
        let mut cmd = place_cmd(order_id, vec![draft(2, 1_500), draft(1, 499)]);
        cmd.discount = Money::from_minor(499);
        cmd.tax_rate_bps = 2_000;

        let events = order.handle(&OrderCommand::PlaceOrder(cmd)).unwrap();
        let mut order = order;
        order.apply(&events[0]);

        assert_eq!(order.status(), OrderStatus::Pending);
        assert_eq!(order.lines()[1].line_no, 2);
        assert_eq!(order.lines()[0].total_price, Money::from_minor(3_000));
        assert!(order.lines().iter().all(|l| l.reservation == LineReservation::Reserved));
        assert_eq!(order.total_amount(), Money::from_minor(3_600));
        assert_eq!(order.payment_status(), PaymentStatus::Unpaid);
        assert_eq!(order.order_number().unwrap().to_string(), "CMD-202403-0001");
    }

    #[test]
    fn lines_need_their_own_holds() {
        let order_id = OrderId::generate();
        let line = draft(1, 100);
        let cmd = place_cmd(order_id, vec![line.clone(), line.clone()]);
        assert!(matches!(
            Order::empty(order_id).handle(&OrderCommand::PlaceOrder(cmd)),
            Err(DomainError::Validation(_))
        ));

        let mut order = placed(vec![line.clone()]);
        let add = OrderCommand::AddLine(AddLine {
            order_id: order.id_typed(),
            line,
            actor_id: UserId::new(),
            occurred_at: test_time(),
        });
        assert!(matches!(run(&mut order, add), Err(DomainError::Conflict(_))));
    }

    #[test]
    fn place_order_rejects_empty_and_zero_quantity_lines() {
        let order_id = OrderId::generate();
        let order = Order::empty(order_id);

        let err = order
            .handle(&OrderCommand::PlaceOrder(place_cmd(order_id, vec![])))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));

        let err = order
            .handle(&OrderCommand::PlaceOrder(place_cmd(order_id, vec![draft(0, 10)])))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn commands_on_unplaced_order_are_not_found() {
        let order = Order::empty(OrderId::generate());
        assert_eq!(order.handle(&pay(&order, 10)).unwrap_err(), DomainError::NotFound);
        assert_eq!(
            order.handle(&change(&order, OrderStatus::Confirmed, None)).unwrap_err(),
            DomainError::NotFound
        );
    }

    #[test]
    fn confirm_generates_default_tasks() {
        let mut order = placed(vec![draft(5, 100)]);
        ({ let cmd = change(&order, OrderStatus::Confirmed, None); run(&mut order, cmd) }).unwrap();

        assert_eq!(order.status(), OrderStatus::Confirmed);
        assert_eq!(order.tasks().len(), 6);
        assert_eq!(order.tasks()[2].kind, TaskKind::Printing);
        assert!(order.confirmed_at().is_some());
    }

    #[test]
    fn start_moves_pending_tasks_in_progress() {
        let mut order = placed(vec![draft(5, 100)]);
        ({ let cmd = change(&order, OrderStatus::Confirmed, None); run(&mut order, cmd) }).unwrap();
        ({ let cmd = task_cmd(&order, 1, TaskStatus::Completed); run(&mut order, cmd) }).unwrap();
        ({ let cmd = change(&order, OrderStatus::InProgress, None); run(&mut order, cmd) }).unwrap();

        assert_eq!(order.tasks()[0].status, TaskStatus::Completed);
        assert!(order.tasks()[1..].iter().all(|t| t.status == TaskStatus::InProgress));
    }

    #[test]
    fn ready_requires_all_tasks_completed() {
        let mut order = placed(vec![draft(5, 100)]);
        ({ let cmd = change(&order, OrderStatus::Confirmed, None); run(&mut order, cmd) }).unwrap();
        ({ let cmd = change(&order, OrderStatus::InProgress, None); run(&mut order, cmd) }).unwrap();

        let err = ({ let cmd = change(&order, OrderStatus::Ready, None); run(&mut order, cmd) }).unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition(_)));
        assert_eq!(order.status(), OrderStatus::InProgress);
    }

    #[test]
    fn completing_last_task_rolls_order_up_to_ready() {
        let mut order = placed(vec![draft(5, 100)]);
        ({ let cmd = change(&order, OrderStatus::Confirmed, None); run(&mut order, cmd) }).unwrap();
        ({ let cmd = change(&order, OrderStatus::InProgress, None); run(&mut order, cmd) }).unwrap();

        for task_no in 1..=5 {
            let events = ({ let cmd = task_cmd(&order, task_no, TaskStatus::Completed); run(&mut order, cmd) }).unwrap();
            assert_eq!(events.len(), 1);
        }
        let events = ({ let cmd = task_cmd(&order, 6, TaskStatus::Completed); run(&mut order, cmd) }).unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], OrderEvent::OrderReady(_)));
        assert_eq!(order.status(), OrderStatus::Ready);
    }

    #[test]
    fn completing_all_tasks_while_confirmed_does_not_skip_start() {
        let mut order = placed(vec![draft(5, 100)]);
        ({ let cmd = change(&order, OrderStatus::Confirmed, None); run(&mut order, cmd) }).unwrap();
        for task_no in 1..=6 {
            ({ let cmd = task_cmd(&order, task_no, TaskStatus::Completed); run(&mut order, cmd) }).unwrap();
        }
        assert_eq!(order.status(), OrderStatus::Confirmed);

        ({ let cmd = change(&order, OrderStatus::InProgress, None); run(&mut order, cmd) }).unwrap();
        ({ let cmd = change(&order, OrderStatus::Ready, None); run(&mut order, cmd) }).unwrap();
        assert_eq!(order.status(), OrderStatus::Ready);
    }

    #[test]
    fn task_updates_are_rejected_outside_production() {
        let mut order = placed(vec![draft(5, 100)]);
        let err = order.handle(&task_cmd(&order, 1, TaskStatus::Completed)).unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition(_)));

        ({ let cmd = change(&order, OrderStatus::Confirmed, None); run(&mut order, cmd) }).unwrap();
        ({ let cmd = task_cmd(&order, 1, TaskStatus::Completed); run(&mut order, cmd) }).unwrap();
        let err = order.handle(&task_cmd(&order, 1, TaskStatus::InProgress)).unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition(_)));
        assert!(matches!(
            order.handle(&task_cmd(&order, 99, TaskStatus::Completed)).unwrap_err(),
            DomainError::Validation(_)
        ));
    }

    #[test]
    fn same_status_transition_is_a_no_op() {
        let order = placed(vec![draft(5, 100)]);
        let events = order.handle(&change(&order, OrderStatus::Pending, None)).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn cancel_requires_reason_and_releases_lines() {
        let mut order = placed(vec![draft(5, 100), draft(1, 100)]);
        ({ let cmd = change(&order, OrderStatus::Confirmed, None); run(&mut order, cmd) }).unwrap();

        let err = order.handle(&change(&order, OrderStatus::Cancelled, Some("  "))).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));

        let events = ({ let cmd = change(&order, OrderStatus::Cancelled, Some("client withdrew")); run(&mut order, cmd) }).unwrap();
        match &events[0] {
            OrderEvent::OrderCancelled(e) => assert_eq!(e.released_lines, vec![1, 2]),
            other => panic!("expected OrderCancelled, got {other:?}"),
        }
        assert_eq!(order.status(), OrderStatus::Cancelled);
        assert_eq!(order.cancellation_reason(), Some("client withdrew"));
        assert!(order.lines().iter().all(|l| l.reservation == LineReservation::Released));
        assert!(order.tasks().iter().all(|t| t.status == TaskStatus::Cancelled));
    }

    #[test]
    fn ready_orders_cannot_be_cancelled() {
        let mut order = placed(vec![draft(1, 100)]);
        ({ let cmd = change(&order, OrderStatus::Confirmed, None); run(&mut order, cmd) }).unwrap();
        ({ let cmd = change(&order, OrderStatus::InProgress, None); run(&mut order, cmd) }).unwrap();
        for task_no in 1..=6 {
            ({ let cmd = task_cmd(&order, task_no, TaskStatus::Completed); run(&mut order, cmd) }).unwrap();
        }
        let err = order.handle(&change(&order, OrderStatus::Cancelled, Some("late"))).unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition(_)));
    }

    #[test]
    fn deliver_marks_reservations_consumed() {
        let mut order = placed(vec![draft(5, 100)]);
        ({ let cmd = change(&order, OrderStatus::Confirmed, None); run(&mut order, cmd) }).unwrap();
        ({ let cmd = change(&order, OrderStatus::InProgress, None); run(&mut order, cmd) }).unwrap();
        for task_no in 1..=6 {
            ({ let cmd = task_cmd(&order, task_no, TaskStatus::Completed); run(&mut order, cmd) }).unwrap();
        }
        ({ let cmd = change(&order, OrderStatus::Delivered, None); run(&mut order, cmd) }).unwrap();

        assert_eq!(order.status(), OrderStatus::Delivered);
        assert!(order.delivered_at().is_some());
        assert_eq!(order.lines()[0].reservation, LineReservation::Consumed);
        assert_eq!(order.reserved_lines().count(), 0);
    }

    #[test]
    fn payments_accumulate_until_paid() {
        let mut order = placed(vec![draft(2, 500)]);

        ({ let cmd = pay(&order, 400); run(&mut order, cmd) }).unwrap();
        assert_eq!(order.payment_status(), PaymentStatus::Partial);
        assert_eq!(order.balance_due(), Money::from_minor(600));
        assert!(order.paid_at().is_none());

        ({ let cmd = pay(&order, 700); run(&mut order, cmd) }).unwrap();
        assert_eq!(order.paid_amount(), Money::from_minor(1_100));
        assert_eq!(order.payment_status(), PaymentStatus::Paid);
        assert!(order.paid_at().is_some());
        assert_eq!(order.payments().len(), 2);
        assert_eq!(order.status(), OrderStatus::Pending);
    }

    #[test]
    fn payments_reject_zero_and_cancelled_orders() {
        let mut order = placed(vec![draft(2, 500)]);
        assert!(matches!(order.handle(&pay(&order, 0)).unwrap_err(), DomainError::InvalidAmount(_)));

        ({ let cmd = change(&order, OrderStatus::Cancelled, Some("duplicate")); run(&mut order, cmd) }).unwrap();
        assert!(matches!(
            order.handle(&pay(&order, 100)).unwrap_err(),
            DomainError::InvalidTransition(_)
        ));
    }

    fn add_line(order: &Order, quantity: u64, unit_price: u64) -> OrderCommand {
        OrderCommand::AddLine(AddLine {
            order_id: order.id_typed(),
            line: draft(quantity, unit_price),
            actor_id: UserId::new(),
            occurred_at: test_time(),
        })
    }

    fn remove_line(order: &Order, line_no: u32) -> OrderCommand {
        OrderCommand::RemoveLine(RemoveLine {
            order_id: order.id_typed(),
            line_no,
            actor_id: UserId::new(),
            occurred_at: test_time(),
        })
    }

    fn assign(order: &Order, task_no: u32, assignee: Option<UserId>) -> OrderCommand {
        OrderCommand::AssignTask(AssignTask {
            order_id: order.id_typed(),
            task_no,
            assignee,
            actor_id: UserId::new(),
            occurred_at: test_time(),
        })
    }

    #[test]
    fn adding_and_removing_lines_recomputes_totals() {
        let mut order = placed(vec![draft(2, 1_000)]);
        assert_eq!(order.next_line_no(), 2);

        ({ let cmd = add_line(&order, 3, 500); run(&mut order, cmd) }).unwrap();
        assert_eq!(order.lines().len(), 2);
        assert_eq!(order.lines()[1].line_no, 2);
        assert_eq!(order.lines()[1].reservation, LineReservation::Reserved);
        assert_eq!(order.total_amount(), Money::from_minor(3_500));

        ({ let cmd = remove_line(&order, 1); run(&mut order, cmd) }).unwrap();
        assert_eq!(order.total_amount(), Money::from_minor(1_500));
        assert!(order.line(1).is_none());

        // Removed numbers are not handed out again.
        ({ let cmd = add_line(&order, 1, 100); run(&mut order, cmd) }).unwrap();
        assert_eq!(order.lines().iter().map(|l| l.line_no).collect::<Vec<_>>(), vec![2, 3]);
    }

    #[test]
    fn line_changes_are_checked() {
        let mut order = placed(vec![draft(1, 1_000)]);

        let err = order.handle(&add_line(&order, 0, 100)).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
        let err = order.handle(&remove_line(&order, 1)).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
        let err = order.handle(&remove_line(&order, 9)).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));

        ({ let cmd = change(&order, OrderStatus::Confirmed, None); run(&mut order, cmd) }).unwrap();
        let err = order.handle(&add_line(&order, 1, 100)).unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition(_)));
    }

    #[test]
    fn removing_a_line_cannot_leave_discount_above_subtotal() {
        let order_id = OrderId::generate();
        let mut order = Order::empty(order_id);
        let mut cmd = place_cmd(order_id, vec![draft(1, 1_000), draft(1, 200)]);
        cmd.discount = Money::from_minor(500);
        run(&mut order, OrderCommand::PlaceOrder(cmd)).unwrap();

        let err = order.handle(&remove_line(&order, 1)).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
        ({ let cmd = remove_line(&order, 2); run(&mut order, cmd) }).unwrap();
        assert_eq!(order.total_amount(), Money::from_minor(500));
    }

    #[test]
    fn line_changes_move_payment_status() {
        let mut order = placed(vec![draft(1, 1_000)]);
        ({ let cmd = pay(&order, 1_000); run(&mut order, cmd) }).unwrap();
        assert_eq!(order.payment_status(), PaymentStatus::Paid);

        ({ let cmd = add_line(&order, 1, 500); run(&mut order, cmd) }).unwrap();
        assert_eq!(order.payment_status(), PaymentStatus::Partial);
        assert!(order.paid_at().is_none());
        assert_eq!(order.balance_due(), Money::from_minor(500));

        let added = order.lines()[1].line_no;
        ({ let cmd = remove_line(&order, added); run(&mut order, cmd) }).unwrap();
        assert_eq!(order.payment_status(), PaymentStatus::Paid);
        assert!(order.paid_at().is_some());
    }

    #[test]
    fn tasks_can_be_assigned_until_the_order_ends() {
        let mut order = placed(vec![draft(1, 100)]);
        let printer = UserId::new();
        assert!(matches!(
            order.handle(&assign(&order, 3, Some(printer))).unwrap_err(),
            DomainError::Validation(_)
        ));

        ({ let cmd = change(&order, OrderStatus::Confirmed, None); run(&mut order, cmd) }).unwrap();
        ({ let cmd = assign(&order, 3, Some(printer)); run(&mut order, cmd) }).unwrap();
        assert_eq!(order.tasks()[2].assigned_to, Some(printer));
        assert!(order.handle(&assign(&order, 3, Some(printer))).unwrap().is_empty());

        ({ let cmd = assign(&order, 3, None); run(&mut order, cmd) }).unwrap();
        assert_eq!(order.tasks()[2].assigned_to, None);

        ({ let cmd = change(&order, OrderStatus::Cancelled, Some("duplicate")); run(&mut order, cmd) }).unwrap();
        assert!(matches!(
            order.handle(&assign(&order, 3, Some(printer))).unwrap_err(),
            DomainError::InvalidTransition(_)
        ));
    }

    #[test]
    fn placed_event_serializes_order_number_as_string() {
        let order = placed(vec![draft(1, 100)]);
        let json = serde_json::to_value(&order).unwrap();
        assert_eq!(json["order_number"], "CMD-202403-0001");
        assert_eq!(json["status"], "PENDING");
    }
}
