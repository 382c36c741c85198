//! Wiring: configuration to a ready-to-use ledger.
//!
//! In-memory stores when no `DATABASE_URL` is configured, Postgres otherwise.
//! Either way read models are rebuilt from the event store before the ledger
//! is handed out.

use std::sync::Arc;

use serde_json::Value as JsonValue;
use sqlx::PgPool;
use thiserror::Error;
use tokio::runtime::Handle;

use atelier_events::{EventBus, EventEnvelope, InMemoryEventBus, Subscription};

use crate::clock::{Clock, SystemClock};
use crate::config::LedgerConfig;
use crate::event_store::{EventStore, InMemoryEventStore, PostgresEventStore, PublishingEventStore};
use crate::ledger::StockLedger;
use crate::order_service::OrderService;
use crate::projections::ProjectionError;
use crate::sequence::{InMemorySequenceStore, PostgresSequenceStore, SequenceStore};
use crate::sinks::{ActivitySink, LowStockNotifier, TracingSink};

pub type SharedEventStore = Arc<dyn EventStore>;
pub type SharedSequenceStore = Arc<dyn SequenceStore>;
pub type EnvelopeBus = InMemoryEventBus<EventEnvelope<JsonValue>>;

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("DATABASE_URL is not configured")]
    MissingDatabaseUrl,

    #[error("cannot connect to Postgres: {0}")]
    Connect(String),

    #[error("cannot create schema: {0}")]
    Schema(String),

    #[error("cannot rebuild read models: {0}")]
    Rebuild(#[from] ProjectionError),
}

/// Side-effect collaborators injected into the services.
#[derive(Clone)]
pub struct Collaborators {
    pub activity: Arc<dyn ActivitySink>,
    pub notifier: Arc<dyn LowStockNotifier>,
    pub clock: Arc<dyn Clock>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            activity: Arc::new(TracingSink),
            notifier: Arc::new(TracingSink),
            clock: Arc::new(SystemClock),
        }
    }
}

pub struct Ledger {
    stock: Arc<StockLedger<SharedEventStore>>,
    orders: OrderService<SharedEventStore, SharedSequenceStore>,
    bus: Arc<EnvelopeBus>,
}

impl Ledger {
    /// Ledger over the given stores. Committed events are published on an
    /// in-process bus after each append.
    pub fn assemble(
        events: SharedEventStore,
        sequences: SharedSequenceStore,
        config: &LedgerConfig,
        collaborators: Collaborators,
    ) -> Result<Self, SetupError> {
        let bus = Arc::new(EnvelopeBus::new());
        let store: SharedEventStore = Arc::new(PublishingEventStore::new(events, bus.clone()));

        let stock = Arc::new(
            StockLedger::new(store, config)
                .with_activity_sink(collaborators.activity)
                .with_notifier(collaborators.notifier)
                .with_clock(collaborators.clock),
        );
        let orders = OrderService::new(stock.clone(), sequences, config);

        let stock_events = stock.rebuild_read_models()?;
        let order_events = orders.rebuild_read_models()?;
        tracing::info!(stock_events, order_events, "ledger ready");

        Ok(Self { stock, orders, bus })
    }

    pub fn in_memory(config: &LedgerConfig, collaborators: Collaborators) -> Result<Self, SetupError> {
        Self::assemble(
            Arc::new(InMemoryEventStore::new()),
            Arc::new(InMemorySequenceStore::new(config.lock_timeout)),
            config,
            collaborators,
        )
    }

    /// Connect to `config.database_url` and create the tables if needed.
    ///
    /// Must not be called from a thread driving `runtime`.
    pub fn postgres(
        config: &LedgerConfig,
        runtime: Handle,
        collaborators: Collaborators,
    ) -> Result<Self, SetupError> {
        let url = config
            .database_url
            .as_deref()
            .ok_or(SetupError::MissingDatabaseUrl)?;
        let pool = runtime
            .block_on(PgPool::connect(url))
            .map_err(|e| SetupError::Connect(e.to_string()))?;

        let events = PostgresEventStore::new(pool.clone(), runtime.clone());
        let sequences = PostgresSequenceStore::new(pool, runtime.clone());
        runtime
            .block_on(events.ensure_schema())
            .map_err(|e| SetupError::Schema(e.to_string()))?;
        runtime
            .block_on(sequences.ensure_schema())
            .map_err(|e| SetupError::Schema(e.to_string()))?;
        tracing::info!("connected to Postgres");

        Self::assemble(Arc::new(events), Arc::new(sequences), config, collaborators)
    }

    /// Postgres when a database is configured, in-memory otherwise.
    pub fn from_config(
        config: &LedgerConfig,
        runtime: Option<Handle>,
        collaborators: Collaborators,
    ) -> Result<Self, SetupError> {
        match (&config.database_url, runtime) {
            (Some(_), Some(runtime)) => Self::postgres(config, runtime, collaborators),
            (Some(_), None) => Err(SetupError::Connect("no async runtime available".to_string())),
            (None, _) => Self::in_memory(config, collaborators),
        }
    }

    pub fn stock(&self) -> &StockLedger<SharedEventStore> {
        &self.stock
    }

    pub fn orders(&self) -> &OrderService<SharedEventStore, SharedSequenceStore> {
        &self.orders
    }

    /// Every event committed from now on.
    pub fn subscribe(&self) -> Subscription<EventEnvelope<JsonValue>> {
        self.bus.subscribe()
    }
}
