//! Command execution pipeline for event-sourced aggregates.
//!
//! ```text
//! Command
//!   -> load stream (validated: one aggregate, gapless sequence)
//!   -> rehydrate (apply history)
//!   -> handle (pure decision, produces events)
//!   -> append with ExpectedVersion::Exact(loaded version)
//!   -> apply the new events to the rehydrated state
//! ```
//!
//! `decide` and `commit` split the pipeline for callers that must decide
//! several aggregates before appending to any of them.
//!
//! Publication to subscribers is the store's concern (`PublishingEventStore`).
//! Callers serialize writers per aggregate with `KeyedLocks`; the exact
//! expected version catches writers outside this process.

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use uuid::Uuid;

use atelier_core::{Aggregate, AggregateId, AggregateRoot, DomainError, ExpectedVersion};

use crate::event_store::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};

#[derive(Debug, Error)]
pub enum DispatchError {
    /// The aggregate rejected the command.
    #[error(transparent)]
    Domain(DomainError),

    /// The stream moved since it was loaded.
    #[error("concurrency conflict: {0}")]
    Concurrency(String),

    #[error("stored event could not be decoded: {0}")]
    Deserialize(String),

    #[error("corrupt stream: {0}")]
    CorruptStream(String),

    #[error(transparent)]
    Store(EventStoreError),
}

impl From<EventStoreError> for DispatchError {
    fn from(value: EventStoreError) -> Self {
        match value {
            EventStoreError::Concurrency(msg) => DispatchError::Concurrency(msg),
            other => DispatchError::Store(other),
        }
    }
}

impl From<DomainError> for DispatchError {
    fn from(value: DomainError) -> Self {
        DispatchError::Domain(value)
    }
}

/// Result of a successful dispatch: the state after the new events, plus the
/// events themselves (typed and as stored, index-aligned).
#[derive(Debug, Clone)]
pub struct Dispatched<A: Aggregate> {
    pub aggregate: A,
    pub events: Vec<A::Event>,
    pub committed: Vec<StoredEvent>,
}

impl<A: Aggregate> Dispatched<A> {
    /// Nothing was appended (the command was a no-op).
    pub fn is_noop(&self) -> bool {
        self.committed.is_empty()
    }
}

/// Events decided against a rehydrated aggregate but not yet appended.
#[derive(Debug, Clone)]
pub struct Decision<A: Aggregate> {
    /// Version the stream must still be at when the events are appended.
    pub base_version: u64,
    /// State after the decided events.
    pub aggregate: A,
    pub events: Vec<A::Event>,
}

/// Handle `commands` in order, each against the state left by the previous
/// ones. Pure; the first rejection is returned and nothing is kept.
pub fn decide<'c, A>(
    mut aggregate: A,
    commands: impl IntoIterator<Item = &'c A::Command>,
) -> Result<Decision<A>, DomainError>
where
    A: Aggregate<Error = DomainError>,
    A::Command: 'c,
{
    let base_version = aggregate.version();
    let mut events = Vec::new();
    for command in commands {
        let decided = aggregate.handle(command)?;
        for ev in &decided {
            aggregate.apply(ev);
        }
        events.extend(decided);
    }

    Ok(Decision {
        base_version,
        aggregate,
        events,
    })
}

#[derive(Debug)]
pub struct CommandDispatcher<S> {
    store: S,
}

impl<S> CommandDispatcher<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_inner(self) -> S {
        self.store
    }
}

impl<S> CommandDispatcher<S>
where
    S: EventStore,
{
    /// Rehydrate an aggregate from its stream. A never-written stream yields
    /// the aggregate as built by `make_aggregate`.
    pub fn load<A>(
        &self,
        aggregate_id: AggregateId,
        make_aggregate: impl FnOnce(AggregateId) -> A,
    ) -> Result<A, DispatchError>
    where
        A: Aggregate,
        A::Event: DeserializeOwned,
    {
        let history = self.store.load_stream(aggregate_id)?;
        validate_loaded_stream(aggregate_id, &history)?;

        let mut aggregate = make_aggregate(aggregate_id);
        apply_history(&mut aggregate, &history)?;
        Ok(aggregate)
    }

    /// Handle `command` against an already rehydrated aggregate and append the
    /// outcome, expecting the stream to still be at `aggregate.version()`.
    pub fn execute<A>(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        aggregate: A,
        command: &A::Command,
    ) -> Result<Dispatched<A>, DispatchError>
    where
        A: Aggregate<Error = DomainError>,
        A::Event: atelier_events::Event + Serialize,
    {
        let decision = decide(aggregate, [command])?;
        self.commit(aggregate_id, aggregate_type, decision)
    }

    /// Append a decision in one batch. An empty decision appends nothing.
    pub fn commit<A>(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        decision: Decision<A>,
    ) -> Result<Dispatched<A>, DispatchError>
    where
        A: Aggregate,
        A::Event: atelier_events::Event + Serialize,
    {
        let Decision {
            base_version,
            aggregate,
            events,
        } = decision;
        if events.is_empty() {
            return Ok(Dispatched {
                aggregate,
                events,
                committed: vec![],
            });
        }

        let uncommitted = events
            .iter()
            .map(|ev| UncommittedEvent::from_typed(aggregate_id, aggregate_type, Uuid::now_v7(), ev))
            .collect::<Result<Vec<_>, _>>()?;
        let committed = self.store.append(uncommitted, ExpectedVersion::Exact(base_version))?;

        Ok(Dispatched {
            aggregate,
            events,
            committed,
        })
    }

    /// `load` followed by `execute`.
    pub fn dispatch<A>(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        command: &A::Command,
        make_aggregate: impl FnOnce(AggregateId) -> A,
    ) -> Result<Dispatched<A>, DispatchError>
    where
        A: Aggregate<Error = DomainError>,
        A::Event: atelier_events::Event + Serialize + DeserializeOwned,
    {
        let aggregate = self.load(aggregate_id, make_aggregate)?;
        self.execute(aggregate_id, aggregate_type, aggregate, command)
    }
}

/// Run `op` again while it fails with a concurrency conflict, at most
/// `max_retries` extra times. The last conflict is returned as is.
pub fn retry_on_conflict<T>(
    max_retries: u32,
    mut op: impl FnMut() -> Result<T, DispatchError>,
) -> Result<T, DispatchError> {
    let mut attempt = 0;
    loop {
        match op() {
            Err(DispatchError::Concurrency(msg)) if attempt < max_retries => {
                attempt += 1;
                tracing::debug!(attempt, conflict = %msg, "retrying after concurrency conflict");
            }
            other => return other,
        }
    }
}

fn validate_loaded_stream(aggregate_id: AggregateId, stream: &[StoredEvent]) -> Result<(), DispatchError> {
    let mut last = 0u64;
    for (idx, e) in stream.iter().enumerate() {
        if e.aggregate_id != aggregate_id {
            return Err(DispatchError::CorruptStream(format!(
                "loaded stream contains wrong aggregate_id at index {idx}"
            )));
        }
        if e.sequence_number != last + 1 {
            return Err(DispatchError::CorruptStream(format!(
                "sequence gap in loaded stream (last={last}, found={})",
                e.sequence_number
            )));
        }
        last = e.sequence_number;
    }
    Ok(())
}

fn apply_history<A>(aggregate: &mut A, history: &[StoredEvent]) -> Result<(), DispatchError>
where
    A: Aggregate,
    A::Event: DeserializeOwned,
{
    for stored in history {
        let ev: A::Event = serde_json::from_value(stored.payload.clone())
            .map_err(|e| DispatchError::Deserialize(format!("{} #{}: {e}", stored.event_type, stored.sequence_number)))?;
        aggregate.apply(&ev);
    }
    Ok(())
}
