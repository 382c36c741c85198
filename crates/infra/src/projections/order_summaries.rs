use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use atelier_core::{Aggregate, ClientId, Money};
use atelier_events::EventEnvelope;
use atelier_orders::{Order, OrderEvent, OrderId, OrderNumber, OrderStatus, PaymentStatus, Priority};

use super::{CursorCheck, Projection, ProjectionError, StreamCursors, decode};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderSummary {
    pub order_id: OrderId,
    pub order_number: OrderNumber,
    pub client_id: ClientId,
    pub status: OrderStatus,
    pub priority: Priority,
    pub line_count: usize,
    pub total_amount: Money,
    pub paid_amount: Money,
    pub payment_status: PaymentStatus,
    pub created_at: Option<DateTime<Utc>>,
    pub deadline: Option<DateTime<Utc>>,
}

impl OrderSummary {
    fn of(order: &Order) -> Option<Self> {
        Some(Self {
            order_id: order.id_typed(),
            order_number: order.order_number()?.clone(),
            client_id: order.client_id()?,
            status: order.status(),
            priority: order.priority(),
            line_count: order.lines().len(),
            total_amount: order.total_amount(),
            paid_amount: order.paid_amount(),
            payment_status: order.payment_status(),
            created_at: order.created_at(),
            deadline: order.deadline(),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderFilter {
    #[serde(default)]
    pub status: Option<OrderStatus>,
    #[serde(default)]
    pub client_id: Option<ClientId>,
}

impl OrderFilter {
    pub fn matches(&self, summary: &OrderSummary) -> bool {
        self.status.is_none_or(|s| s == summary.status)
            && self.client_id.is_none_or(|c| c == summary.client_id)
    }
}

#[derive(Debug, Default)]
struct State {
    orders: HashMap<OrderId, Order>,
    by_number: HashMap<String, OrderId>,
    cursors: StreamCursors,
}

/// Order list and number index. Each stream is folded with the aggregate's
/// own `apply`, so summaries agree with rehydrated orders.
#[derive(Debug, Default)]
pub struct OrderSummaryProjection {
    state: RwLock<State>,
}

impl OrderSummaryProjection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: OrderId) -> Option<OrderSummary> {
        self.state.read().orders.get(&id).and_then(OrderSummary::of)
    }

    pub fn id_for_number(&self, number: &OrderNumber) -> Option<OrderId> {
        self.state.read().by_number.get(&number.to_string()).copied()
    }

    /// Matching orders in order-number sequence.
    pub fn list(&self, filter: &OrderFilter) -> Vec<OrderSummary> {
        let mut summaries: Vec<_> = self
            .state
            .read()
            .orders
            .values()
            .filter_map(OrderSummary::of)
            .filter(|s| filter.matches(s))
            .collect();
        summaries.sort_by(|a, b| {
            let key = |s: &OrderSummary| {
                (
                    s.order_number.period().clone(),
                    s.order_number.sequence(),
                    s.order_number.prefix().to_string(),
                )
            };
            key(a).cmp(&key(b))
        });
        summaries
    }
}

impl Projection for OrderSummaryProjection {
    fn aggregate_type(&self) -> &'static str {
        Order::AGGREGATE_TYPE
    }

    fn apply_envelope(&self, envelope: &EventEnvelope<JsonValue>) -> Result<(), ProjectionError> {
        if envelope.aggregate_type() != Order::AGGREGATE_TYPE {
            return Err(ProjectionError::WrongAggregateType(
                envelope.aggregate_type().to_string(),
            ));
        }

        let aggregate_id = envelope.aggregate_id();
        let seq = envelope.sequence_number();
        let mut state = self.state.write();
        if state.cursors.check(aggregate_id, seq)? == CursorCheck::Duplicate {
            return Ok(());
        }

        let event: OrderEvent = decode(envelope)?;
        let id = OrderId::new(aggregate_id);
        if let OrderEvent::OrderPlaced(placed) = &event {
            state.by_number.insert(placed.order_number.to_string(), id);
        }
        state
            .orders
            .entry(id)
            .or_insert_with(|| Order::empty(id))
            .apply(&event);

        state.cursors.advance(aggregate_id, seq);
        Ok(())
    }

    fn reset(&self) {
        let mut state = self.state.write();
        state.orders.clear();
        state.by_number.clear();
        state.cursors.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atelier_core::UserId;
    use atelier_events::Event;
    use atelier_inventory::StockItemId;
    use atelier_orders::{
        LineReservation, OrderCancelled, OrderLine, OrderPlaced, PeriodKey,
    };
    use uuid::Uuid;

    fn envelope(order_id: OrderId, seq: u64, event: &OrderEvent) -> EventEnvelope<JsonValue> {
        EventEnvelope::new(
            Uuid::now_v7(),
            order_id.0,
            Order::AGGREGATE_TYPE,
            seq,
            event.event_type(),
            event.occurred_at(),
            serde_json::to_value(event).unwrap(),
        )
    }

    fn placed(order_id: OrderId, client_id: ClientId, seq: u64) -> OrderEvent {
        OrderEvent::OrderPlaced(OrderPlaced {
            order_id,
            order_number: OrderNumber::new("CMD", PeriodKey::parse("202403").unwrap(), seq).unwrap(),
            client_id,
            lines: vec![OrderLine {
                line_no: 1,
                hold_id: uuid::Uuid::now_v7(),
                stock_item_id: StockItemId::generate(),
                quantity: 5,
                unit_price: Money::from_minor(1_000),
                total_price: Money::from_minor(5_000),
                reservation: LineReservation::Reserved,
            }],
            discount: Money::ZERO,
            tax_rate_bps: 0,
            priority: Priority::default(),
            notes: None,
            deadline: None,
            actor_id: UserId::new(),
            occurred_at: Utc::now(),
        })
    }

    #[test]
    fn filters_by_status_and_client() {
        let projection = OrderSummaryProjection::new();
        let alice = ClientId::new();
        let bob = ClientId::new();

        let first = OrderId::generate();
        let second = OrderId::generate();
        projection.apply_envelope(&envelope(second, 1, &placed(second, bob, 2))).unwrap();
        projection.apply_envelope(&envelope(first, 1, &placed(first, alice, 1))).unwrap();
        projection
            .apply_envelope(&envelope(
                second,
                2,
                &OrderEvent::OrderCancelled(OrderCancelled {
                    order_id: second,
                    reason: "client withdrew".to_string(),
                    released_lines: vec![1],
                    actor_id: UserId::new(),
                    occurred_at: Utc::now(),
                }),
            ))
            .unwrap();

        let all = projection.list(&OrderFilter::default());
        assert_eq!(
            all.iter().map(|s| s.order_number.to_string()).collect::<Vec<_>>(),
            vec!["CMD-202403-0001", "CMD-202403-0002"]
        );

        let pending = projection.list(&OrderFilter {
            status: Some(OrderStatus::Pending),
            client_id: None,
        });
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].order_id, first);

        let bobs = projection.list(&OrderFilter {
            status: None,
            client_id: Some(bob),
        });
        assert_eq!(bobs[0].status, OrderStatus::Cancelled);
        assert_eq!(bobs[0].total_amount, Money::from_minor(5_000));
    }

    #[test]
    fn finds_orders_by_number() {
        let projection = OrderSummaryProjection::new();
        let id = OrderId::generate();
        projection.apply_envelope(&envelope(id, 1, &placed(id, ClientId::new(), 7))).unwrap();

        let number = OrderNumber::parse("CMD-202403-0007").unwrap();
        assert_eq!(projection.id_for_number(&number), Some(id));
        assert!(projection.get(id).is_some());
    }
}
