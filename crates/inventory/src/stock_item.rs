use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use atelier_core::{Aggregate, AggregateId, AggregateRoot, DomainError, Money, UserId};
use atelier_events::Event;

use crate::movement::{MAX_QUANTITY, MovementReference, MovementType, OperationKey};

#[cfg(test)]
use uuid::Uuid;

/// Stock item identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StockItemId(pub AggregateId);

impl StockItemId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }

    pub fn generate() -> Self {
        Self(AggregateId::new())
    }
}

impl core::fmt::Display for StockItemId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl core::str::FromStr for StockItemId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

/// What a stock item is: something sold to clients or something used up in production.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StockKind {
    Product,
    Consumable,
}

/// Aggregate root: StockItem.
///
/// Owns one SKU's quantity on hand. The quantity only changes by applying
/// `MovementRecorded` events, each of which carries the resulting quantity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StockItem {
    id: StockItemId,
    sku: String,
    name: String,
    kind: StockKind,
    quantity_on_hand: u64,
    reorder_threshold: u64,
    unit_price: Option<Money>,
    registered: bool,
    updated_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    applied_keys: HashSet<OperationKey>,
    version: u64,
}

impl StockItem {
    /// Stream type recorded with every stock item event.
    pub const AGGREGATE_TYPE: &'static str = "stock_item";

    /// Create an empty, not-yet-registered aggregate instance for rehydration.
    pub fn empty(id: StockItemId) -> Self {
        Self {
            id,
            sku: String::new(),
            name: String::new(),
            kind: StockKind::Product,
            quantity_on_hand: 0,
            reorder_threshold: 0,
            unit_price: None,
            registered: false,
            updated_at: None,
            applied_keys: HashSet::new(),
            version: 0,
        }
    }

    pub fn id_typed(&self) -> StockItemId {
        self.id
    }

    pub fn sku(&self) -> &str {
        &self.sku
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> StockKind {
        self.kind
    }

    pub fn quantity_on_hand(&self) -> u64 {
        self.quantity_on_hand
    }

    pub fn reorder_threshold(&self) -> u64 {
        self.reorder_threshold
    }

    pub fn unit_price(&self) -> Option<Money> {
        self.unit_price
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    /// Whether a movement carrying `key` has been recorded.
    pub fn has_applied(&self, key: &OperationKey) -> bool {
        self.applied_keys.contains(key)
    }

    /// At or below the reorder threshold.
    pub fn is_low_stock(&self) -> bool {
        self.registered && self.quantity_on_hand <= self.reorder_threshold
    }
}

impl AggregateRoot for StockItem {
    type Id = StockItemId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: RegisterStockItem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterStockItem {
    pub item_id: StockItemId,
    pub sku: String,
    pub name: String,
    pub kind: StockKind,
    pub reorder_threshold: u64,
    pub unit_price: Option<Money>,
    /// Recorded as an IN movement in the same append when positive.
    pub initial_quantity: u64,
    pub actor_id: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RecordMovement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMovement {
    pub item_id: StockItemId,
    pub movement_type: MovementType,
    pub quantity: u64,
    pub reference: Option<MovementReference>,
    pub note: Option<String>,
    /// Records nothing when already applied.
    pub operation_key: Option<OperationKey>,
    /// Records nothing unless this key has been applied.
    pub requires_key: Option<OperationKey>,
    pub actor_id: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ConsumeReservation.
///
/// Turns a reserve into a permanent OUT: emits RELEASE(+q) followed by OUT(-q),
/// leaving the quantity on hand unchanged. A step whose key is already
/// applied is skipped, so a hold released earlier is only taken OUT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumeReservation {
    pub item_id: StockItemId,
    pub quantity: u64,
    pub reference: Option<MovementReference>,
    pub release_key: Option<OperationKey>,
    pub out_key: Option<OperationKey>,
    pub actor_id: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: SetReorderThreshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetReorderThreshold {
    pub item_id: StockItemId,
    pub threshold: u64,
    pub actor_id: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StockCommand {
    RegisterStockItem(RegisterStockItem),
    RecordMovement(RecordMovement),
    ConsumeReservation(ConsumeReservation),
    SetReorderThreshold(SetReorderThreshold),
}

/// Event: StockItemRegistered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockItemRegistered {
    pub item_id: StockItemId,
    pub sku: String,
    pub name: String,
    pub kind: StockKind,
    pub reorder_threshold: u64,
    pub unit_price: Option<Money>,
    pub actor_id: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: MovementRecorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementRecorded {
    pub item_id: StockItemId,
    pub movement_type: MovementType,
    /// Quantity as requested by the caller.
    pub quantity: u64,
    pub quantity_delta: i64,
    pub resulting_quantity: u64,
    pub reference: Option<MovementReference>,
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_key: Option<OperationKey>,
    pub actor_id: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ReorderThresholdChanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReorderThresholdChanged {
    pub item_id: StockItemId,
    pub previous: u64,
    pub threshold: u64,
    pub actor_id: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StockEvent {
    StockItemRegistered(StockItemRegistered),
    MovementRecorded(MovementRecorded),
    ReorderThresholdChanged(ReorderThresholdChanged),
}

impl Event for StockEvent {
    fn event_type(&self) -> &'static str {
        match self {
            StockEvent::StockItemRegistered(_) => "stock.item.registered",
            StockEvent::MovementRecorded(_) => "stock.item.movement_recorded",
            StockEvent::ReorderThresholdChanged(_) => "stock.item.reorder_threshold_changed",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            StockEvent::StockItemRegistered(e) => e.occurred_at,
            StockEvent::MovementRecorded(e) => e.occurred_at,
            StockEvent::ReorderThresholdChanged(e) => e.occurred_at,
        }
    }
}

impl Aggregate for StockItem {
    type Command = StockCommand;
    type Event = StockEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            StockEvent::StockItemRegistered(e) => {
                self.id = e.item_id;
                self.sku = e.sku.clone();
                self.name = e.name.clone();
                self.kind = e.kind;
                self.reorder_threshold = e.reorder_threshold;
                self.unit_price = e.unit_price;
                self.quantity_on_hand = 0;
                self.registered = true;
                self.updated_at = Some(e.occurred_at);
            }
            StockEvent::MovementRecorded(e) => {
                self.quantity_on_hand = e.resulting_quantity;
                self.updated_at = Some(e.occurred_at);
                if let Some(key) = &e.operation_key {
                    self.applied_keys.insert(key.clone());
                }
            }
            StockEvent::ReorderThresholdChanged(e) => {
                self.reorder_threshold = e.threshold;
                self.updated_at = Some(e.occurred_at);
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            StockCommand::RegisterStockItem(cmd) => self.handle_register(cmd),
            StockCommand::RecordMovement(cmd) => self.handle_movement(cmd),
            StockCommand::ConsumeReservation(cmd) => self.handle_consume(cmd),
            StockCommand::SetReorderThreshold(cmd) => self.handle_threshold(cmd),
        }
    }
}

impl StockItem {
    fn ensure_registered(&self, item_id: StockItemId) -> Result<(), DomainError> {
        if !self.registered {
            return Err(DomainError::not_found());
        }
        if self.id != item_id {
            return Err(DomainError::invariant("item_id mismatch"));
        }
        Ok(())
    }

    fn movement(
        &self,
        on_hand: u64,
        movement_type: MovementType,
        quantity: u64,
        reference: &Option<MovementReference>,
        note: &Option<String>,
        actor_id: UserId,
        occurred_at: DateTime<Utc>,
    ) -> Result<MovementRecorded, DomainError> {
        let resulting_quantity = movement_type.resulting_quantity(on_hand, quantity)?;
        // Both sides are bounded by MAX_QUANTITY, so the casts are lossless.
        let quantity_delta = resulting_quantity as i64 - on_hand as i64;

        Ok(MovementRecorded {
            item_id: self.id,
            movement_type,
            quantity,
            quantity_delta,
            resulting_quantity,
            reference: reference.clone(),
            note: note.clone(),
            operation_key: None,
            actor_id,
            occurred_at,
        })
    }

    fn is_pending(&self, key: &Option<OperationKey>) -> bool {
        key.as_ref().is_none_or(|k| !self.applied_keys.contains(k))
    }

    fn handle_register(&self, cmd: &RegisterStockItem) -> Result<Vec<StockEvent>, DomainError> {
        if self.registered {
            return Err(DomainError::conflict("stock item already registered"));
        }
        if self.id != cmd.item_id {
            return Err(DomainError::invariant("item_id mismatch"));
        }
        if cmd.sku.trim().is_empty() {
            return Err(DomainError::validation("sku cannot be empty"));
        }
        if cmd.name.trim().is_empty() {
            return Err(DomainError::validation("name cannot be empty"));
        }
        if cmd.initial_quantity > MAX_QUANTITY {
            return Err(DomainError::validation("initial quantity is out of range"));
        }

        let mut events = vec![StockEvent::StockItemRegistered(StockItemRegistered {
            item_id: cmd.item_id,
            sku: cmd.sku.trim().to_string(),
            name: cmd.name.trim().to_string(),
            kind: cmd.kind,
            reorder_threshold: cmd.reorder_threshold,
            unit_price: cmd.unit_price,
            actor_id: cmd.actor_id,
            occurred_at: cmd.occurred_at,
        })];

        if cmd.initial_quantity > 0 {
            events.push(StockEvent::MovementRecorded(self.movement(
                0,
                MovementType::In,
                cmd.initial_quantity,
                &None,
                &Some("initial stock".to_string()),
                cmd.actor_id,
                cmd.occurred_at,
            )?));
        }

        Ok(events)
    }

    fn handle_movement(&self, cmd: &RecordMovement) -> Result<Vec<StockEvent>, DomainError> {
        self.ensure_registered(cmd.item_id)?;
        let prerequisite_missing = cmd
            .requires_key
            .as_ref()
            .is_some_and(|k| !self.applied_keys.contains(k));
        if prerequisite_missing || !self.is_pending(&cmd.operation_key) {
            return Ok(vec![]);
        }

        let mut recorded = self.movement(
            self.quantity_on_hand,
            cmd.movement_type,
            cmd.quantity,
            &cmd.reference,
            &cmd.note,
            cmd.actor_id,
            cmd.occurred_at,
        )?;
        recorded.operation_key = cmd.operation_key.clone();

        Ok(vec![StockEvent::MovementRecorded(recorded)])
    }

    fn handle_consume(&self, cmd: &ConsumeReservation) -> Result<Vec<StockEvent>, DomainError> {
        self.ensure_registered(cmd.item_id)?;

        let note = Some("reservation consumed".to_string());
        let mut on_hand = self.quantity_on_hand;
        let mut events = Vec::with_capacity(2);

        if self.is_pending(&cmd.release_key) {
            let mut release = self.movement(
                on_hand,
                MovementType::Release,
                cmd.quantity,
                &cmd.reference,
                &note,
                cmd.actor_id,
                cmd.occurred_at,
            )?;
            release.operation_key = cmd.release_key.clone();
            on_hand = release.resulting_quantity;
            events.push(StockEvent::MovementRecorded(release));
        }

        if self.is_pending(&cmd.out_key) {
            let mut out = self.movement(
                on_hand,
                MovementType::Out,
                cmd.quantity,
                &cmd.reference,
                &note,
                cmd.actor_id,
                cmd.occurred_at,
            )?;
            out.operation_key = cmd.out_key.clone();
            events.push(StockEvent::MovementRecorded(out));
        }

        Ok(events)
    }

    fn handle_threshold(&self, cmd: &SetReorderThreshold) -> Result<Vec<StockEvent>, DomainError> {
        self.ensure_registered(cmd.item_id)?;

        if cmd.threshold == self.reorder_threshold {
            return Ok(vec![]);
        }

        Ok(vec![StockEvent::ReorderThresholdChanged(ReorderThresholdChanged {
            item_id: self.id,
            previous: self.reorder_threshold,
            threshold: cmd.threshold,
            actor_id: cmd.actor_id,
            occurred_at: cmd.occurred_at,
        })])
    }
}
