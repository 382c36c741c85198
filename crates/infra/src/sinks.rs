//! Outbound side effects: the activity log and low-stock notifications.
//!
//! Both run after the mutation committed. A failing sink is logged and the
//! mutation stands.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use atelier_core::UserId;
use atelier_events::EventBus;
use atelier_inventory::{StockItem, StockItemId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("sink unavailable: {0}")]
pub struct SinkError(pub String);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityAction {
    RegisterStockItem,
    StockMovement,
    SetReorderThreshold,
    CreateOrder,
    UpdateOrderStatus,
    AddOrderLine,
    RemoveOrderLine,
    UpdateTaskStatus,
    AssignTask,
    AddPayment,
}

impl ActivityAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ActivityAction::RegisterStockItem => "REGISTER_STOCK_ITEM",
            ActivityAction::StockMovement => "STOCK_MOVEMENT",
            ActivityAction::SetReorderThreshold => "SET_REORDER_THRESHOLD",
            ActivityAction::CreateOrder => "CREATE_ORDER",
            ActivityAction::UpdateOrderStatus => "UPDATE_ORDER_STATUS",
            ActivityAction::AddOrderLine => "ADD_ORDER_LINE",
            ActivityAction::RemoveOrderLine => "REMOVE_ORDER_LINE",
            ActivityAction::UpdateTaskStatus => "UPDATE_TASK_STATUS",
            ActivityAction::AssignTask => "ASSIGN_TASK",
            ActivityAction::AddPayment => "ADD_PAYMENT",
        }
    }
}

/// Audit record of one successful mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub actor_id: UserId,
    pub action: ActivityAction,
    pub entity_type: String,
    pub entity_id: String,
    pub details: JsonValue,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LowStockAlert {
    pub stock_item_id: StockItemId,
    pub sku: String,
    pub name: String,
    pub quantity_on_hand: u64,
    pub reorder_threshold: u64,
    pub occurred_at: DateTime<Utc>,
}

impl LowStockAlert {
    /// Alert for `item` if it sits at or below its threshold.
    pub fn for_item(item: &StockItem, occurred_at: DateTime<Utc>) -> Option<Self> {
        item.is_low_stock().then(|| Self {
            stock_item_id: item.id_typed(),
            sku: item.sku().to_string(),
            name: item.name().to_string(),
            quantity_on_hand: item.quantity_on_hand(),
            reorder_threshold: item.reorder_threshold(),
            occurred_at,
        })
    }
}

pub trait ActivitySink: Send + Sync {
    fn record(&self, activity: &Activity) -> Result<(), SinkError>;
}

pub trait LowStockNotifier: Send + Sync {
    fn notify_low_stock(&self, alert: &LowStockAlert) -> Result<(), SinkError>;
}

impl<T: ActivitySink + ?Sized> ActivitySink for Arc<T> {
    fn record(&self, activity: &Activity) -> Result<(), SinkError> {
        (**self).record(activity)
    }
}

impl<T: LowStockNotifier + ?Sized> LowStockNotifier for Arc<T> {
    fn notify_low_stock(&self, alert: &LowStockAlert) -> Result<(), SinkError> {
        (**self).notify_low_stock(alert)
    }
}

/// Writes activities and alerts to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ActivitySink for TracingSink {
    fn record(&self, activity: &Activity) -> Result<(), SinkError> {
        tracing::info!(
            actor_id = %activity.actor_id,
            action = activity.action.as_str(),
            entity_type = %activity.entity_type,
            entity_id = %activity.entity_id,
            details = %activity.details,
            "activity"
        );
        Ok(())
    }
}

impl LowStockNotifier for TracingSink {
    fn notify_low_stock(&self, alert: &LowStockAlert) -> Result<(), SinkError> {
        tracing::warn!(
            stock_item_id = %alert.stock_item_id,
            sku = %alert.sku,
            quantity_on_hand = alert.quantity_on_hand,
            reorder_threshold = alert.reorder_threshold,
            "stock at or below reorder threshold"
        );
        Ok(())
    }
}

/// Publishes activities or alerts on a bus for out-of-band consumers.
#[derive(Debug, Clone)]
pub struct BusSink<B> {
    bus: B,
}

impl<B> BusSink<B> {
    pub fn new(bus: B) -> Self {
        Self { bus }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }
}

impl<B> ActivitySink for BusSink<B>
where
    B: EventBus<Activity>,
{
    fn record(&self, activity: &Activity) -> Result<(), SinkError> {
        self.bus
            .publish(activity.clone())
            .map_err(|e| SinkError(format!("{e:?}")))
    }
}

impl<B> LowStockNotifier for BusSink<B>
where
    B: EventBus<LowStockAlert>,
{
    fn notify_low_stock(&self, alert: &LowStockAlert) -> Result<(), SinkError> {
        self.bus
            .publish(alert.clone())
            .map_err(|e| SinkError(format!("{e:?}")))
    }
}

pub(crate) fn record_activity(sink: &dyn ActivitySink, activity: Activity) {
    if let Err(err) = sink.record(&activity) {
        tracing::warn!(
            action = activity.action.as_str(),
            entity_id = %activity.entity_id,
            error = %err,
            "activity not recorded"
        );
    }
}

pub(crate) fn notify_if_low(notifier: &dyn LowStockNotifier, item: &StockItem, at: DateTime<Utc>) {
    let Some(alert) = LowStockAlert::for_item(item, at) else {
        return;
    };
    if let Err(err) = notifier.notify_low_stock(&alert) {
        tracing::warn!(
            stock_item_id = %alert.stock_item_id,
            error = %err,
            "low-stock notification not delivered"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atelier_events::InMemoryEventBus;
    use serde_json::json;

    struct FailingSink;

    impl ActivitySink for FailingSink {
        fn record(&self, _: &Activity) -> Result<(), SinkError> {
            Err(SinkError("audit table offline".to_string()))
        }
    }

    fn activity() -> Activity {
        Activity {
            actor_id: UserId::new(),
            action: ActivityAction::CreateOrder,
            entity_type: "order".to_string(),
            entity_id: "CMD-202403-0001".to_string(),
            details: json!({ "total": "54.00" }),
            occurred_at: Utc::now(),
        }
    }

    #[test]
    fn bus_sink_publishes_activities() {
        let sink = BusSink::new(InMemoryEventBus::<Activity>::new());
        let sub = sink.bus().subscribe();
        let a = activity();
        sink.record(&a).unwrap();
        assert_eq!(sub.drain(), vec![a]);
    }

    #[test]
    fn failing_sink_does_not_propagate() {
        record_activity(&FailingSink, activity());
    }

    #[test]
    fn action_names_serialize_as_codes() {
        for action in [
            ActivityAction::RegisterStockItem,
            ActivityAction::StockMovement,
            ActivityAction::SetReorderThreshold,
            ActivityAction::CreateOrder,
            ActivityAction::UpdateOrderStatus,
            ActivityAction::UpdateTaskStatus,
            ActivityAction::AddPayment,
        ] {
            assert_eq!(serde_json::to_value(action).unwrap(), json!(action.as_str()));
        }
    }
}
