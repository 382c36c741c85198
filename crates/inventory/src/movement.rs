use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use atelier_core::{AggregateId, DomainError, DomainResult, UserId};

use crate::stock_item::{MovementRecorded, StockItemId};

/// Largest quantity a stock item may hold; keeps every signed delta representable.
pub const MAX_QUANTITY: u64 = i64::MAX as u64;

/// Kind of change applied to a stock item's on-hand quantity.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MovementType {
    /// Goods received.
    In,
    /// Goods leaving permanently (sale, delivery, usage).
    Out,
    /// Physical count: on-hand is set to the given quantity.
    Adjustment,
    /// Spoiled or damaged goods written off.
    Waste,
    /// Goods coming back from a client.
    Return,
    /// Soft hold for an unconfirmed order.
    Reserve,
    /// Undo of a reserve.
    Release,
}

impl MovementType {
    pub const ALL: [MovementType; 7] = [
        MovementType::In,
        MovementType::Out,
        MovementType::Adjustment,
        MovementType::Waste,
        MovementType::Return,
        MovementType::Reserve,
        MovementType::Release,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MovementType::In => "IN",
            MovementType::Out => "OUT",
            MovementType::Adjustment => "ADJUSTMENT",
            MovementType::Waste => "WASTE",
            MovementType::Return => "RETURN",
            MovementType::Reserve => "RESERVE",
            MovementType::Release => "RELEASE",
        }
    }

    /// Whether this movement can only take stock away.
    pub fn is_decrease(self) -> bool {
        matches!(self, MovementType::Out | MovementType::Waste | MovementType::Reserve)
    }

    /// Quantity on hand after applying `quantity` of this movement to `on_hand`.
    ///
    /// Rejects zero quantities (except for adjustments), decreases larger than
    /// the stock on hand, and results above [`MAX_QUANTITY`].
    pub fn resulting_quantity(self, on_hand: u64, quantity: u64) -> DomainResult<u64> {
        if quantity == 0 && self != MovementType::Adjustment {
            return Err(DomainError::validation(format!(
                "{} quantity must be greater than zero",
                self.as_str()
            )));
        }

        let result = match self {
            MovementType::In | MovementType::Return | MovementType::Release => {
                on_hand.checked_add(quantity)
            }
            MovementType::Out | MovementType::Waste | MovementType::Reserve => {
                if quantity > on_hand {
                    return Err(DomainError::insufficient_stock(quantity, on_hand));
                }
                Some(on_hand - quantity)
            }
            MovementType::Adjustment => Some(quantity),
        };

        result.filter(|q| *q <= MAX_QUANTITY).ok_or_else(|| {
            DomainError::validation(format!(
                "{} of {quantity} would overflow the stock counter",
                self.as_str()
            ))
        })
    }
}

impl core::fmt::Display for MovementType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for MovementType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MovementType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| DomainError::validation(format!("unknown movement type '{s}'")))
    }
}

/// What caused a movement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum MovementReference {
    Order(AggregateId),
    ProductionTask(Uuid),
    PurchaseOrder(String),
    Other(String),
}

impl core::fmt::Display for MovementReference {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            MovementReference::Order(id) => write!(f, "order:{id}"),
            MovementReference::ProductionTask(id) => write!(f, "task:{id}"),
            MovementReference::PurchaseOrder(po) => write!(f, "purchase:{po}"),
            MovementReference::Other(text) => f.write_str(text),
        }
    }
}

/// Idempotency key of a movement.
///
/// A stock item remembers every key it has recorded; a command carrying a
/// known key records nothing. Order-driven movements use one key per line
/// hold and movement type, so retrying a half-finished order operation only
/// performs the steps still missing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OperationKey(String);

impl OperationKey {
    pub fn new(key: impl Into<String>) -> DomainResult<Self> {
        let key = key.into().trim().to_string();
        if key.is_empty() {
            return Err(DomainError::validation("operation key cannot be empty"));
        }
        Ok(Self(key))
    }

    /// Key of the `movement_type` step taken for one hold.
    pub fn for_hold(hold_id: Uuid, movement_type: MovementType) -> Self {
        Self(format!("hold:{hold_id}:{}", movement_type.as_str()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for OperationKey {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<OperationKey> for String {
    fn from(value: OperationKey) -> Self {
        value.0
    }
}

impl core::fmt::Display for OperationKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable ledger entry describing one committed movement.
///
/// Built from a committed `MovementRecorded` event: `id` is the event id and
/// `sequence` the event's position in the item's stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockMovement {
    pub id: Uuid,
    pub stock_item_id: StockItemId,
    pub movement_type: MovementType,
    pub quantity_delta: i64,
    pub resulting_quantity: u64,
    pub reference: Option<MovementReference>,
    pub note: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub actor_id: UserId,
    pub sequence: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_key: Option<OperationKey>,
}

impl StockMovement {
    pub fn from_recorded(id: Uuid, sequence: u64, event: &MovementRecorded) -> Self {
        Self {
            id,
            stock_item_id: event.item_id,
            movement_type: event.movement_type,
            quantity_delta: event.quantity_delta,
            resulting_quantity: event.resulting_quantity,
            reference: event.reference.clone(),
            note: event.note.clone(),
            timestamp: event.occurred_at,
            actor_id: event.actor_id,
            sequence,
            operation_key: event.operation_key.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decreases_fail_when_stock_is_short() {
        for t in [MovementType::Out, MovementType::Waste, MovementType::Reserve] {
            let err = t.resulting_quantity(4, 10).unwrap_err();
            assert_eq!(err, DomainError::insufficient_stock(10, 4));
            assert_eq!(t.resulting_quantity(10, 10).unwrap(), 0);
        }
    }

    #[test]
    fn increases_add_to_on_hand() {
        for t in [MovementType::In, MovementType::Return, MovementType::Release] {
            assert_eq!(t.resulting_quantity(4, 6).unwrap(), 10);
        }
    }

    #[test]
    fn adjustment_sets_quantity_and_accepts_zero() {
        assert_eq!(MovementType::Adjustment.resulting_quantity(12, 7).unwrap(), 7);
        assert_eq!(MovementType::Adjustment.resulting_quantity(12, 0).unwrap(), 0);
    }

    #[test]
    fn zero_quantity_is_rejected_for_non_adjustments() {
        let err = MovementType::In.resulting_quantity(3, 0).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn overflow_is_rejected() {
        let err = MovementType::In.resulting_quantity(MAX_QUANTITY, 1).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
        let err = MovementType::Adjustment.resulting_quantity(0, u64::MAX).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn hold_keys_differ_per_hold_and_step() {
        let hold = Uuid::now_v7();
        let release = OperationKey::for_hold(hold, MovementType::Release);
        assert_eq!(release.as_str(), format!("hold:{hold}:RELEASE"));
        assert_ne!(release, OperationKey::for_hold(Uuid::now_v7(), MovementType::Release));
        assert_ne!(release, OperationKey::for_hold(hold, MovementType::Out));
        assert!(OperationKey::new("  ").is_err());
        assert_eq!(OperationKey::new(" po-7 ").unwrap().as_str(), "po-7");
    }

    #[test]
    fn parses_case_insensitively() {
        assert_eq!("reserve".parse::<MovementType>().unwrap(), MovementType::Reserve);
        assert_eq!(" WASTE ".parse::<MovementType>().unwrap(), MovementType::Waste);
        assert!("TRANSFER".parse::<MovementType>().is_err());
    }
}
