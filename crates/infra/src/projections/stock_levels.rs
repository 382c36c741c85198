use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value as JsonValue;

use atelier_core::Money;
use atelier_events::EventEnvelope;
use atelier_inventory::{StockEvent, StockItem, StockItemId, StockKind};

use super::{CursorCheck, Projection, ProjectionError, StreamCursors, decode};

/// Current level of one stock item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StockLevel {
    pub stock_item_id: StockItemId,
    pub sku: String,
    pub name: String,
    pub kind: StockKind,
    pub quantity_on_hand: u64,
    pub reorder_threshold: u64,
    pub unit_price: Option<Money>,
    pub updated_at: DateTime<Utc>,
}

impl StockLevel {
    pub fn is_low_stock(&self) -> bool {
        self.quantity_on_hand <= self.reorder_threshold
    }
}

#[derive(Debug, Default)]
struct State {
    levels: HashMap<StockItemId, StockLevel>,
    by_sku: HashMap<String, StockItemId>,
    cursors: StreamCursors,
}

/// Stock levels keyed by item, with a SKU index.
#[derive(Debug, Default)]
pub struct StockLevelsProjection {
    state: RwLock<State>,
}

impl StockLevelsProjection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: StockItemId) -> Option<StockLevel> {
        self.state.read().levels.get(&id).cloned()
    }

    pub fn find_by_sku(&self, sku: &str) -> Option<StockLevel> {
        let state = self.state.read();
        state
            .by_sku
            .get(sku.trim())
            .and_then(|id| state.levels.get(id))
            .cloned()
    }

    /// All items, ordered by SKU.
    pub fn list(&self) -> Vec<StockLevel> {
        let mut levels: Vec<_> = self.state.read().levels.values().cloned().collect();
        levels.sort_by(|a, b| (&a.sku, a.stock_item_id).cmp(&(&b.sku, b.stock_item_id)));
        levels
    }

    /// Items at or below their reorder threshold, ordered by SKU.
    pub fn low_stock(&self) -> Vec<StockLevel> {
        let mut levels: Vec<_> = self
            .state
            .read()
            .levels
            .values()
            .filter(|l| l.is_low_stock())
            .cloned()
            .collect();
        levels.sort_by(|a, b| (&a.sku, a.stock_item_id).cmp(&(&b.sku, b.stock_item_id)));
        levels
    }
}

impl Projection for StockLevelsProjection {
    fn aggregate_type(&self) -> &'static str {
        StockItem::AGGREGATE_TYPE
    }

    fn apply_envelope(&self, envelope: &EventEnvelope<JsonValue>) -> Result<(), ProjectionError> {
        if envelope.aggregate_type() != StockItem::AGGREGATE_TYPE {
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

        let id = StockItemId::new(aggregate_id);
        match decode::<StockEvent>(envelope)? {
            StockEvent::StockItemRegistered(e) => {
                state.by_sku.insert(e.sku.clone(), id);
                state.levels.insert(
                    id,
                    StockLevel {
                        stock_item_id: id,
                        sku: e.sku,
                        name: e.name,
                        kind: e.kind,
                        quantity_on_hand: 0,
                        reorder_threshold: e.reorder_threshold,
                        unit_price: e.unit_price,
                        updated_at: e.occurred_at,
                    },
                );
            }
            StockEvent::MovementRecorded(e) => {
                if let Some(level) = state.levels.get_mut(&id) {
                    level.quantity_on_hand = e.resulting_quantity;
                    level.updated_at = e.occurred_at;
                }
            }
            StockEvent::ReorderThresholdChanged(e) => {
                if let Some(level) = state.levels.get_mut(&id) {
                    level.reorder_threshold = e.threshold;
                    level.updated_at = e.occurred_at;
                }
            }
        }

        state.cursors.advance(aggregate_id, seq);
        Ok(())
    }

    fn reset(&self) {
        let mut state = self.state.write();
        state.levels.clear();
        state.by_sku.clear();
        state.cursors.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::{EventStore, InMemoryEventStore, UncommittedEvent};
    use crate::projections::rebuild;
    use atelier_core::{Aggregate, ExpectedVersion, UserId};
    use atelier_inventory::{MovementType, RecordMovement, RegisterStockItem, StockCommand};

    fn commit(store: &InMemoryEventStore, item: &mut StockItem, cmd: StockCommand) -> Vec<EventEnvelope<JsonValue>> {
        let events = item.handle(&cmd).unwrap();
        let uncommitted = events
            .iter()
            .map(|e| {
                UncommittedEvent::from_typed(item.id_typed().0, StockItem::AGGREGATE_TYPE, uuid::Uuid::now_v7(), e)
                    .unwrap()
            })
            .collect();
        let stored = store
            .append(uncommitted, ExpectedVersion::Exact(atelier_core::AggregateRoot::version(item)))
            .unwrap();
        for e in &events {
            item.apply(e);
        }
        stored.iter().map(|s| s.to_envelope()).collect()
    }

    fn ink(store: &InMemoryEventStore) -> (StockItem, Vec<EventEnvelope<JsonValue>>) {
        let id = StockItemId::generate();
        let mut item = StockItem::empty(id);
        let envs = commit(
            store,
            &mut item,
            StockCommand::RegisterStockItem(RegisterStockItem {
                item_id: id,
                sku: "INK-001".to_string(),
                name: "Plastisol ink, black".to_string(),
                kind: StockKind::Consumable,
                reorder_threshold: 5,
                unit_price: None,
                initial_quantity: 20,
                actor_id: UserId::new(),
                occurred_at: Utc::now(),
            }),
        );
        (item, envs)
    }

    #[test]
    fn tracks_levels_and_low_stock() {
        let store = InMemoryEventStore::new();
        let projection = StockLevelsProjection::new();
        let (mut item, envs) = ink(&store);
        for env in &envs {
            projection.apply_envelope(env).unwrap();
        }
        assert_eq!(projection.find_by_sku("INK-001").unwrap().quantity_on_hand, 20);
        assert!(projection.low_stock().is_empty());

        let id = item.id_typed();
        let envs = commit(
            &store,
            &mut item,
            StockCommand::RecordMovement(RecordMovement {
                item_id: id,
                movement_type: MovementType::Out,
                quantity: 16,
                reference: None,
                note: None,
                operation_key: None,
                requires_key: None,
                actor_id: UserId::new(),
                occurred_at: Utc::now(),
            }),
        );
        projection.apply_envelope(&envs[0]).unwrap();
        // Redelivery is ignored.
        projection.apply_envelope(&envs[0]).unwrap();

        let low = projection.low_stock();
        assert_eq!(low.len(), 1);
        assert_eq!(low[0].quantity_on_hand, 4);
    }

    #[test]
    fn rebuild_matches_incremental_state() {
        let store = InMemoryEventStore::new();
        let incremental = StockLevelsProjection::new();
        for _ in 0..3 {
            let (_, envs) = ink(&store);
            for env in &envs {
                incremental.apply_envelope(env).unwrap();
            }
        }

        let rebuilt = StockLevelsProjection::new();
        assert_eq!(rebuild(&rebuilt, &store).unwrap(), 6);
        assert_eq!(rebuilt.list(), incremental.list());
    }

    #[test]
    fn missing_events_are_reported() {
        let store = InMemoryEventStore::new();
        let projection = StockLevelsProjection::new();
        let (_, envs) = ink(&store);
        assert!(matches!(
            projection.apply_envelope(&envs[1]),
            Err(ProjectionError::SequenceGap { .. })
        ));
    }
}
