//! `atelier-core`: domain building blocks shared by the inventory and order crates.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod actor;
pub mod aggregate;
pub mod error;
pub mod id;
pub mod value_object;

pub use actor::{ActorContext, Role};
pub use aggregate::{Aggregate, AggregateRoot, ExpectedVersion};
pub use error::{DomainError, DomainResult};
pub use id::{AggregateId, ClientId, UserId};
pub use value_object::{Money, ValueObject};
