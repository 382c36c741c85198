//! Read models built from committed events.
//!
//! Projections are fed inline with each commit and rebuilt from the store at
//! start-up. They are disposable and idempotent: an envelope at or below the
//! stream's cursor is ignored, so replays and duplicate deliveries are safe.

pub mod order_summaries;
pub mod stock_levels;

pub use order_summaries::{OrderFilter, OrderSummary, OrderSummaryProjection};
pub use stock_levels::{StockLevel, StockLevelsProjection};

use std::collections::HashMap;

use atelier_core::AggregateId;
use atelier_events::EventEnvelope;
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::event_store::{EventStore, EventStoreError, StoredEvent};

#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error("failed to deserialize {event_type}: {reason}")]
    Deserialize { event_type: String, reason: String },

    /// The projection missed events of this stream.
    #[error("sequence gap in stream {aggregate_id} (last={last}, found={found})")]
    SequenceGap {
        aggregate_id: AggregateId,
        last: u64,
        found: u64,
    },

    #[error("unexpected aggregate type '{0}'")]
    WrongAggregateType(String),

    #[error(transparent)]
    Store(#[from] EventStoreError),
}

pub trait Projection: Send + Sync {
    /// Stream type this projection consumes.
    fn aggregate_type(&self) -> &'static str;

    fn apply_envelope(&self, envelope: &EventEnvelope<JsonValue>) -> Result<(), ProjectionError>;

    /// Forget all state, cursors included.
    fn reset(&self);
}

/// Drop the projection's state and replay every stream of its type.
pub fn rebuild<P, S>(projection: &P, store: &S) -> Result<usize, ProjectionError>
where
    P: Projection + ?Sized,
    S: EventStore + ?Sized,
{
    let events = store.load_by_type(projection.aggregate_type())?;
    projection.reset();
    for stored in &events {
        projection.apply_envelope(&stored.to_envelope())?;
    }
    tracing::info!(
        aggregate_type = projection.aggregate_type(),
        events = events.len(),
        "projection rebuilt"
    );
    Ok(events.len())
}

/// Replay one stream into the projection, e.g. after a `SequenceGap` caused
/// by a writer in another process.
pub fn catch_up<P, S>(projection: &P, store: &S, aggregate_id: AggregateId) -> Result<(), ProjectionError>
where
    P: Projection + ?Sized,
    S: EventStore + ?Sized,
{
    for stored in store.load_stream(aggregate_id)? {
        projection.apply_envelope(&stored.to_envelope())?;
    }
    Ok(())
}

/// Apply freshly committed events. Read models lag rather than fail: a gap is
/// repaired from the store, anything else is logged.
pub(crate) fn feed<P, S>(projection: &P, store: &S, committed: &[StoredEvent])
where
    P: Projection + ?Sized,
    S: EventStore + ?Sized,
{
    for stored in committed {
        match projection.apply_envelope(&stored.to_envelope()) {
            Ok(()) => {}
            Err(ProjectionError::SequenceGap { aggregate_id, last, found }) => {
                tracing::debug!(%aggregate_id, last, found, "projection behind; replaying stream");
                if let Err(err) = catch_up(projection, store, aggregate_id) {
                    tracing::warn!(%aggregate_id, error = %err, "projection catch-up failed");
                }
                return;
            }
            Err(err) => {
                tracing::warn!(
                    event_id = %stored.event_id,
                    event_type = %stored.event_type,
                    error = %err,
                    "projection skipped event"
                );
            }
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum CursorCheck {
    Apply,
    Duplicate,
}

/// Last applied sequence number per stream.
#[derive(Debug, Default)]
pub(crate) struct StreamCursors {
    last: HashMap<AggregateId, u64>,
}

impl StreamCursors {
    pub(crate) fn check(&self, aggregate_id: AggregateId, seq: u64) -> Result<CursorCheck, ProjectionError> {
        let last = self.last.get(&aggregate_id).copied().unwrap_or(0);
        if seq <= last {
            return Ok(CursorCheck::Duplicate);
        }
        if seq != last + 1 {
            return Err(ProjectionError::SequenceGap {
                aggregate_id,
                last,
                found: seq,
            });
        }
        Ok(CursorCheck::Apply)
    }

    pub(crate) fn advance(&mut self, aggregate_id: AggregateId, seq: u64) {
        self.last.insert(aggregate_id, seq);
    }

    pub(crate) fn clear(&mut self) {
        self.last.clear();
    }
}

pub(crate) fn decode<E: serde::de::DeserializeOwned>(
    envelope: &EventEnvelope<JsonValue>,
) -> Result<E, ProjectionError> {
    serde_json::from_value(envelope.payload().clone()).map_err(|e| ProjectionError::Deserialize {
        event_type: envelope.event_type().to_string(),
        reason: e.to_string(),
    })
}
