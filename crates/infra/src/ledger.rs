//! Stock ledger service.
//!
//! Every quantity change is a `MovementRecorded` event appended to the item's
//! stream, so the movement log and the quantity can never disagree. Writers
//! of one item are serialized by a keyed lock; the append carries the loaded
//! version, which catches writers in other processes.
//!
//! `apply_changes` takes the locks of several items at once, always in
//! ascending item id order. No other path holds more than one item lock.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use atelier_core::{ActorContext, Money, UserId};
use atelier_inventory::{
    ConsumeReservation, MovementReference, MovementType, OperationKey, RecordMovement,
    RegisterStockItem, SetReorderThreshold, StockCommand, StockEvent, StockItem, StockItemId,
    StockKind, StockMovement,
};

use crate::clock::{Clock, SystemClock};
use crate::command_dispatcher::{CommandDispatcher, Dispatched, decide, retry_on_conflict};
use crate::config::LedgerConfig;
use crate::error::{LedgerError, LedgerResult, Subject};
use crate::event_store::EventStore;
use crate::locks::KeyedLocks;
use crate::projections::{self, ProjectionError, StockLevel, StockLevelsProjection};
use crate::sinks::{
    Activity, ActivityAction, ActivitySink, LowStockNotifier, TracingSink, notify_if_low,
    record_activity,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterStockItemRequest {
    pub sku: String,
    pub name: String,
    pub kind: StockKind,
    #[serde(default)]
    pub reorder_threshold: u64,
    #[serde(default)]
    pub unit_price: Option<Money>,
    #[serde(default)]
    pub initial_quantity: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockMovementRequest {
    pub stock_item_id: StockItemId,
    pub movement_type: MovementType,
    pub quantity: u64,
    #[serde(default)]
    pub reference: Option<MovementReference>,
    #[serde(default)]
    pub note: Option<String>,
    /// Retrying with the same key records the movement at most once.
    #[serde(default)]
    pub operation_key: Option<OperationKey>,
}

/// One change of an all-or-nothing stock batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StockChange {
    Movement(StockMovementRequest),
    /// RELEASE of the hold reserved under `reserve_key`. Records nothing if
    /// that reservation was never recorded or `release_key` already was.
    ReleaseHold {
        stock_item_id: StockItemId,
        quantity: u64,
        reference: Option<MovementReference>,
        note: Option<String>,
        reserve_key: OperationKey,
        release_key: OperationKey,
    },
    /// RELEASE then OUT of a held reservation, as `consume_reservation`.
    ConsumeReservation {
        stock_item_id: StockItemId,
        quantity: u64,
        reference: Option<MovementReference>,
        release_key: Option<OperationKey>,
        out_key: Option<OperationKey>,
    },
}

impl StockChange {
    pub fn stock_item_id(&self) -> StockItemId {
        match self {
            StockChange::Movement(request) => request.stock_item_id,
            StockChange::ReleaseHold { stock_item_id, .. }
            | StockChange::ConsumeReservation { stock_item_id, .. } => *stock_item_id,
        }
    }

    fn into_command(self, actor_id: UserId, occurred_at: DateTime<Utc>) -> StockCommand {
        match self {
            StockChange::Movement(request) => StockCommand::RecordMovement(RecordMovement {
                item_id: request.stock_item_id,
                movement_type: request.movement_type,
                quantity: request.quantity,
                reference: request.reference,
                note: request.note.filter(|n| !n.trim().is_empty()),
                operation_key: request.operation_key,
                requires_key: None,
                actor_id,
                occurred_at,
            }),
            StockChange::ReleaseHold {
                stock_item_id,
                quantity,
                reference,
                note,
                reserve_key,
                release_key,
            } => StockCommand::RecordMovement(RecordMovement {
                item_id: stock_item_id,
                movement_type: MovementType::Release,
                quantity,
                reference,
                note,
                operation_key: Some(release_key),
                requires_key: Some(reserve_key),
                actor_id,
                occurred_at,
            }),
            StockChange::ConsumeReservation {
                stock_item_id,
                quantity,
                reference,
                release_key,
                out_key,
            } => StockCommand::ConsumeReservation(ConsumeReservation {
                item_id: stock_item_id,
                quantity,
                reference,
                release_key,
                out_key,
                actor_id,
                occurred_at,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptLine {
    pub stock_item_id: StockItemId,
    pub quantity: u64,
}

/// Goods received against a purchase order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseReceipt {
    #[serde(default)]
    pub purchase_order: Option<String>,
    pub lines: Vec<ReceiptLine>,
}

/// Result of one receipt line. Lines succeed or fail independently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptOutcome {
    pub stock_item_id: StockItemId,
    pub result: LedgerResult<StockMovement>,
}

pub struct StockLedger<S> {
    dispatcher: CommandDispatcher<S>,
    item_locks: KeyedLocks<StockItemId>,
    sku_locks: KeyedLocks<String>,
    levels: Arc<StockLevelsProjection>,
    activity: Arc<dyn ActivitySink>,
    notifier: Arc<dyn LowStockNotifier>,
    clock: Arc<dyn Clock>,
    lock_timeout: Duration,
    max_conflict_retries: u32,
}

impl<S> StockLedger<S>
where
    S: EventStore,
{
    pub fn new(store: S, config: &LedgerConfig) -> Self {
        Self {
            dispatcher: CommandDispatcher::new(store),
            item_locks: KeyedLocks::new(),
            sku_locks: KeyedLocks::new(),
            levels: Arc::new(StockLevelsProjection::new()),
            activity: Arc::new(TracingSink),
            notifier: Arc::new(TracingSink),
            clock: Arc::new(SystemClock),
            lock_timeout: config.lock_timeout,
            max_conflict_retries: config.max_conflict_retries,
        }
    }

    pub fn with_activity_sink(mut self, sink: Arc<dyn ActivitySink>) -> Self {
        self.activity = sink;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn LowStockNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &S {
        self.dispatcher.store()
    }

    pub fn levels(&self) -> &StockLevelsProjection {
        &self.levels
    }

    pub(crate) fn activity_sink(&self) -> &dyn ActivitySink {
        self.activity.as_ref()
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Rebuild the stock level read model from the store.
    pub fn rebuild_read_models(&self) -> Result<usize, ProjectionError> {
        projections::rebuild(self.levels.as_ref(), self.store())
    }

    /// Register a new SKU. A positive initial quantity is recorded as an IN
    /// movement in the same append.
    pub fn register_stock_item(
        &self,
        request: RegisterStockItemRequest,
        actor: &ActorContext,
    ) -> LedgerResult<StockItem> {
        let sku = request.sku.trim().to_string();
        if sku.is_empty() {
            return Err(LedgerError::ValidationFailed("sku cannot be empty".to_string()));
        }

        let item_id = StockItemId::generate();
        let occurred_at = self.now();
        let command = StockCommand::RegisterStockItem(RegisterStockItem {
            item_id,
            sku: sku.clone(),
            name: request.name,
            kind: request.kind,
            reorder_threshold: request.reorder_threshold,
            unit_price: request.unit_price,
            initial_quantity: request.initial_quantity,
            actor_id: actor.actor_id,
            occurred_at,
        });

        let dispatched = self.sku_locks.with_lock(&sku, self.lock_timeout, || {
            if self.levels.find_by_sku(&sku).is_some() {
                return Err(LedgerError::ValidationFailed(format!(
                    "sku {sku} is already registered"
                )));
            }
            self.execute(item_id, &command)
        })??;
        let item = dispatched.aggregate;

        tracing::info!(
            stock_item_id = %item_id,
            sku = %item.sku(),
            quantity_on_hand = item.quantity_on_hand(),
            "stock item registered"
        );
        record_activity(
            self.activity.as_ref(),
            Activity {
                actor_id: actor.actor_id,
                action: ActivityAction::RegisterStockItem,
                entity_type: StockItem::AGGREGATE_TYPE.to_string(),
                entity_id: item_id.to_string(),
                details: json!({
                    "sku": item.sku(),
                    "name": item.name(),
                    "kind": item.kind(),
                    "initial_quantity": item.quantity_on_hand(),
                }),
                occurred_at,
            },
        );
        notify_if_low(self.notifier.as_ref(), &item, occurred_at);

        Ok(item)
    }

    /// Apply one movement and return the item as it is after it.
    pub fn apply_movement(
        &self,
        request: StockMovementRequest,
        actor: &ActorContext,
    ) -> LedgerResult<(StockItem, StockMovement)> {
        let item_id = request.stock_item_id;
        let key = request.operation_key.clone();
        let occurred_at = self.now();
        let command = StockChange::Movement(request).into_command(actor.actor_id, occurred_at);

        let dispatched = self.execute(item_id, &command)?;
        if let (true, Some(key)) = (dispatched.is_noop(), key) {
            // Already recorded under this key: answer with that movement.
            let earlier = self
                .movements(item_id)?
                .into_iter()
                .rfind(|m| m.operation_key.as_ref() == Some(&key))
                .ok_or_else(|| {
                    LedgerError::PersistenceUnavailable(format!("no movement recorded under {key}"))
                })?;
            tracing::debug!(stock_item_id = %item_id, operation_key = %key, "movement already recorded");
            return Ok((dispatched.aggregate, earlier));
        }

        let mut movements = recorded_movements(&dispatched);
        let movement = movements.pop().ok_or_else(|| {
            LedgerError::PersistenceUnavailable("movement was not recorded".to_string())
        })?;

        self.after_movements(&dispatched.aggregate, std::slice::from_ref(&movement), actor, occurred_at);
        Ok((dispatched.aggregate, movement))
    }

    /// Turn a held reservation into a permanent OUT: RELEASE then OUT of the
    /// same quantity, in one append. The on-hand quantity does not change.
    pub fn consume_reservation(
        &self,
        stock_item_id: StockItemId,
        quantity: u64,
        reference: Option<MovementReference>,
        actor: &ActorContext,
    ) -> LedgerResult<(StockItem, Vec<StockMovement>)> {
        let occurred_at = self.now();
        let command = StockCommand::ConsumeReservation(ConsumeReservation {
            item_id: stock_item_id,
            quantity,
            reference,
            release_key: None,
            out_key: None,
            actor_id: actor.actor_id,
            occurred_at,
        });

        let dispatched = self.execute(stock_item_id, &command)?;
        let movements = recorded_movements(&dispatched);
        self.after_movements(&dispatched.aggregate, &movements, actor, occurred_at);
        Ok((dispatched.aggregate, movements))
    }

    #[cfg(test)]
    pub(crate) fn item_locks(&self) -> &KeyedLocks<StockItemId> {
        &self.item_locks
    }

    /// Apply several changes as one unit.
    ///
    /// Every item involved is locked up front and every change is decided
    /// before anything is appended, so a rejected change, an unknown item or
    /// a lock timeout leaves all items untouched. Changes to one item are
    /// appended together. Only a store failure between two items' appends can
    /// leave part of the batch recorded; resubmitting a batch of keyed changes
    /// then records exactly the missing part.
    pub fn apply_changes(
        &self,
        changes: Vec<StockChange>,
        actor: &ActorContext,
    ) -> LedgerResult<Vec<StockMovement>> {
        if changes.is_empty() {
            return Ok(Vec::new());
        }

        let occurred_at = self.now();
        let commands: Vec<(StockItemId, StockCommand)> = changes
            .into_iter()
            .map(|change| (change.stock_item_id(), change.into_command(actor.actor_id, occurred_at)))
            .collect();
        let mut ids: Vec<StockItemId> = commands.iter().map(|(id, _)| *id).collect();
        ids.sort();
        ids.dedup();

        let (done, outcome) = self
            .item_locks
            .with_locks(&ids, self.lock_timeout, || self.commit_batch(&ids, &commands))?;

        if outcome.is_err() && !done.is_empty() {
            tracing::warn!(
                committed = done.len(),
                items = ids.len(),
                "stock batch partially recorded"
            );
        }

        let mut movements = Vec::new();
        for dispatched in &done {
            let recorded = recorded_movements(dispatched);
            self.after_movements(&dispatched.aggregate, &recorded, actor, occurred_at);
            movements.extend(recorded);
        }
        outcome.map(|()| movements)
    }

    /// Decide every pending item, then append item by item. A conflict
    /// re-decides only the items not yet appended.
    fn commit_batch(
        &self,
        ids: &[StockItemId],
        commands: &[(StockItemId, StockCommand)],
    ) -> (Vec<Dispatched<StockItem>>, LedgerResult<()>) {
        let mut done: Vec<Dispatched<StockItem>> = Vec::with_capacity(ids.len());
        let mut failing = ids[0];

        let outcome = retry_on_conflict(self.max_conflict_retries, || {
            let mut decisions = Vec::with_capacity(ids.len() - done.len());
            for &id in &ids[done.len()..] {
                failing = id;
                let item = self.dispatcher.load(id.0, |a| StockItem::empty(StockItemId::new(a)))?;
                let decision = decide(
                    item,
                    commands.iter().filter(|(i, _)| *i == id).map(|(_, c)| c),
                )?;
                decisions.push((id, decision));
            }

            for (id, decision) in decisions {
                failing = id;
                let dispatched = self.dispatcher.commit(id.0, StockItem::AGGREGATE_TYPE, decision)?;
                projections::feed(self.levels.as_ref(), self.store(), &dispatched.committed);
                done.push(dispatched);
            }
            Ok(())
        })
        .map_err(|e| Subject::StockItem(failing).dispatch(e));

        (done, outcome)
    }

    pub fn set_reorder_threshold(
        &self,
        stock_item_id: StockItemId,
        threshold: u64,
        actor: &ActorContext,
    ) -> LedgerResult<StockItem> {
        let occurred_at = self.now();
        let command = StockCommand::SetReorderThreshold(SetReorderThreshold {
            item_id: stock_item_id,
            threshold,
            actor_id: actor.actor_id,
            occurred_at,
        });

        let dispatched = self.execute(stock_item_id, &command)?;
        if dispatched.is_noop() {
            return Ok(dispatched.aggregate);
        }

        let item = dispatched.aggregate;
        tracing::info!(stock_item_id = %stock_item_id, threshold, "reorder threshold changed");
        record_activity(
            self.activity.as_ref(),
            Activity {
                actor_id: actor.actor_id,
                action: ActivityAction::SetReorderThreshold,
                entity_type: StockItem::AGGREGATE_TYPE.to_string(),
                entity_id: stock_item_id.to_string(),
                details: json!({ "sku": item.sku(), "threshold": threshold }),
                occurred_at,
            },
        );
        notify_if_low(self.notifier.as_ref(), &item, occurred_at);
        Ok(item)
    }

    /// Record an IN movement per receipt line. Each line is its own
    /// transaction; one failing line does not undo the others.
    pub fn receive_purchase(
        &self,
        receipt: PurchaseReceipt,
        actor: &ActorContext,
    ) -> LedgerResult<Vec<ReceiptOutcome>> {
        if receipt.lines.is_empty() {
            return Err(LedgerError::ValidationFailed(
                "a receipt needs at least one line".to_string(),
            ));
        }

        let reference = receipt
            .purchase_order
            .map(|po| po.trim().to_string())
            .filter(|po| !po.is_empty())
            .map(MovementReference::PurchaseOrder);

        let outcomes: Vec<ReceiptOutcome> = receipt
            .lines
            .into_iter()
            .map(|line| {
                let result = self
                    .apply_movement(
                        StockMovementRequest {
                            stock_item_id: line.stock_item_id,
                            movement_type: MovementType::In,
                            quantity: line.quantity,
                            reference: reference.clone(),
                            note: Some("purchase receipt".to_string()),
                            operation_key: None,
                        },
                        actor,
                    )
                    .map(|(_, movement)| movement);
                ReceiptOutcome {
                    stock_item_id: line.stock_item_id,
                    result,
                }
            })
            .collect();

        let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
        if failed > 0 {
            tracing::warn!(lines = outcomes.len(), failed, "purchase receipt partially applied");
        }
        Ok(outcomes)
    }

    pub fn stock_item(&self, stock_item_id: StockItemId) -> LedgerResult<StockItem> {
        let item = self
            .dispatcher
            .load(stock_item_id.0, |id| StockItem::empty(StockItemId::new(id)))
            .map_err(|e| Subject::StockItem(stock_item_id).dispatch(e))?;
        if !item.is_registered() {
            return Err(LedgerError::stock_item_not_found(stock_item_id));
        }
        Ok(item)
    }

    pub fn find_by_sku(&self, sku: &str) -> LedgerResult<StockItem> {
        let level = self.levels.find_by_sku(sku).ok_or_else(|| LedgerError::NotFound {
            entity: "stock item",
            id: sku.trim().to_string(),
        })?;
        self.stock_item(level.stock_item_id)
    }

    /// Movement log of one item, oldest first.
    pub fn movements(&self, stock_item_id: StockItemId) -> LedgerResult<Vec<StockMovement>> {
        let stream = self
            .store()
            .load_stream(stock_item_id.0)
            .map_err(|e| LedgerError::PersistenceUnavailable(e.to_string()))?;
        if stream.first().is_none_or(|e| e.aggregate_type != StockItem::AGGREGATE_TYPE) {
            return Err(LedgerError::stock_item_not_found(stock_item_id));
        }

        let mut movements = Vec::new();
        for stored in &stream {
            let event: StockEvent = serde_json::from_value(stored.payload.clone()).map_err(|e| {
                LedgerError::PersistenceUnavailable(format!(
                    "undecodable {} #{}: {e}",
                    stored.event_type, stored.sequence_number
                ))
            })?;
            if let StockEvent::MovementRecorded(recorded) = event {
                movements.push(StockMovement::from_recorded(
                    stored.event_id,
                    stored.sequence_number,
                    &recorded,
                ));
            }
        }
        Ok(movements)
    }

    pub fn low_stock_items(&self) -> Vec<StockLevel> {
        self.levels.low_stock()
    }

    pub fn list_stock_items(&self) -> Vec<StockLevel> {
        self.levels.list()
    }

    fn execute(
        &self,
        item_id: StockItemId,
        command: &StockCommand,
    ) -> LedgerResult<Dispatched<StockItem>> {
        self.item_locks.with_lock(&item_id, self.lock_timeout, || -> LedgerResult<_> {
            let dispatched = retry_on_conflict(self.max_conflict_retries, || {
                self.dispatcher.dispatch(item_id.0, StockItem::AGGREGATE_TYPE, command, |id| {
                    StockItem::empty(StockItemId::new(id))
                })
            })
            .map_err(|e| Subject::StockItem(item_id).dispatch(e))?;

            projections::feed(self.levels.as_ref(), self.store(), &dispatched.committed);
            Ok(dispatched)
        })?
    }

    fn after_movements(
        &self,
        item: &StockItem,
        movements: &[StockMovement],
        actor: &ActorContext,
        occurred_at: DateTime<Utc>,
    ) {
        for movement in movements {
            tracing::info!(
                stock_item_id = %movement.stock_item_id,
                movement_type = %movement.movement_type,
                quantity_delta = movement.quantity_delta,
                resulting_quantity = movement.resulting_quantity,
                sequence = movement.sequence,
                "stock movement recorded"
            );
            record_activity(
                self.activity.as_ref(),
                Activity {
                    actor_id: actor.actor_id,
                    action: ActivityAction::StockMovement,
                    entity_type: StockItem::AGGREGATE_TYPE.to_string(),
                    entity_id: movement.stock_item_id.to_string(),
                    details: json!({
                        "sku": item.sku(),
                        "movement_type": movement.movement_type,
                        "quantity_delta": movement.quantity_delta,
                        "resulting_quantity": movement.resulting_quantity,
                        "reference": movement.reference.as_ref().map(ToString::to_string),
                    }),
                    occurred_at,
                },
            );
        }
        notify_if_low(self.notifier.as_ref(), item, occurred_at);
    }
}

fn recorded_movements(dispatched: &Dispatched<StockItem>) -> Vec<StockMovement> {
    dispatched
        .events
        .iter()
        .zip(&dispatched.committed)
        .filter_map(|(event, stored)| match event {
            StockEvent::MovementRecorded(recorded) => Some(StockMovement::from_recorded(
                stored.event_id,
                stored.sequence_number,
                recorded,
            )),
            _ => None,
        })
        .collect()
}
