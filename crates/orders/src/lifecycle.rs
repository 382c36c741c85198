//! Order lifecycle state machine.
//!
//! ```text
//! PENDING -> CONFIRMED -> IN_PROGRESS -> READY -> DELIVERED
//!    \___________\______________\
//!                                 -> CANCELLED
//! ```
//!
//! The table here only knows statuses. Preconditions that depend on the order
//! (reservations held, tasks completed, cancellation reason) are checked by
//! `Order::plan_transition`.

use serde::{Deserialize, Serialize};

use atelier_core::{DomainError, DomainResult};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Confirmed,
    InProgress,
    Ready,
    Delivered,
    Cancelled,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 6] = [
        OrderStatus::Pending,
        OrderStatus::Confirmed,
        OrderStatus::InProgress,
        OrderStatus::Ready,
        OrderStatus::Delivered,
        OrderStatus::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Confirmed => "CONFIRMED",
            OrderStatus::InProgress => "IN_PROGRESS",
            OrderStatus::Ready => "READY",
            OrderStatus::Delivered => "DELIVERED",
            OrderStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Delivered | OrderStatus::Cancelled)
    }

    pub fn is_cancellable(self) -> bool {
        matches!(
            self,
            OrderStatus::Pending | OrderStatus::Confirmed | OrderStatus::InProgress
        )
    }
}

impl core::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for OrderStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OrderStatus::ALL
            .into_iter()
            .find(|st| st.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| DomainError::validation(format!("unknown order status '{s}'")))
    }
}

/// Edge of the lifecycle graph, named by what it does.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transition {
    /// Target equals current status.
    Unchanged,
    /// PENDING -> CONFIRMED: generate production tasks.
    Confirm,
    /// CONFIRMED -> IN_PROGRESS: start pending tasks.
    Start,
    /// IN_PROGRESS -> READY.
    MarkReady,
    /// READY -> DELIVERED: consume reservations.
    Deliver,
    /// -> CANCELLED: release reservations.
    Cancel,
}

pub struct OrderStateMachine;

impl OrderStateMachine {
    pub fn plan(from: OrderStatus, to: OrderStatus) -> DomainResult<Transition> {
        use OrderStatus::*;

        let transition = match (from, to) {
            (a, b) if a == b => Transition::Unchanged,
            (Pending, Confirmed) => Transition::Confirm,
            (Confirmed, InProgress) => Transition::Start,
            (InProgress, Ready) => Transition::MarkReady,
            (Ready, Delivered) => Transition::Deliver,
            (from, Cancelled) if from.is_cancellable() => Transition::Cancel,
            (from, to) => {
                return Err(DomainError::invalid_transition(format!(
                    "cannot move order from {from} to {to}"
                )));
            }
        };
        Ok(transition)
    }

    /// Statuses reachable in one step from `from` (excluding itself).
    pub fn next_statuses(from: OrderStatus) -> Vec<OrderStatus> {
        OrderStatus::ALL
            .into_iter()
            .filter(|to| *to != from && Self::plan(from, *to).is_ok())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use OrderStatus::*;

    #[test]
    fn happy_path_is_linear() {
        assert_eq!(OrderStateMachine::plan(Pending, Confirmed).unwrap(), Transition::Confirm);
        assert_eq!(OrderStateMachine::plan(Confirmed, InProgress).unwrap(), Transition::Start);
        assert_eq!(OrderStateMachine::plan(InProgress, Ready).unwrap(), Transition::MarkReady);
        assert_eq!(OrderStateMachine::plan(Ready, Delivered).unwrap(), Transition::Deliver);
    }

    #[test]
    fn same_status_is_unchanged_even_when_terminal() {
        for status in OrderStatus::ALL {
            assert_eq!(OrderStateMachine::plan(status, status).unwrap(), Transition::Unchanged);
        }
    }

    #[test]
    fn cancel_only_before_ready() {
        assert_eq!(OrderStateMachine::next_statuses(Pending), vec![Confirmed, Cancelled]);
        assert_eq!(OrderStateMachine::next_statuses(InProgress), vec![Ready, Cancelled]);
        assert_eq!(OrderStateMachine::next_statuses(Ready), vec![Delivered]);
        assert!(OrderStateMachine::next_statuses(Delivered).is_empty());
        assert!(OrderStateMachine::next_statuses(Cancelled).is_empty());
    }

    #[test]
    fn skipping_steps_is_rejected() {
        let err = OrderStateMachine::plan(Pending, Ready).unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition(_)));
        let err = OrderStateMachine::plan(Delivered, Pending).unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition(_)));
    }

    #[test]
    fn parses_wire_names() {
        assert_eq!("in_progress".parse::<OrderStatus>().unwrap(), InProgress);
        assert!("SHIPPED".parse::<OrderStatus>().is_err());
    }
}
