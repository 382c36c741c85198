//! Event primitives shared by the ledger: the `Event` contract, the envelope
//! committed events travel in, and a pub/sub bus for downstream consumers.

pub mod bus;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use envelope::EventEnvelope;
pub use event::Event;
pub use in_memory_bus::InMemoryEventBus;
