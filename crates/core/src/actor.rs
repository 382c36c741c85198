//! Caller identity as handed over by the authentication layer.
//!
//! The ledger trusts this input; it never authenticates on its own.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};

use crate::id::UserId;

/// Role name attached to the acting user (opaque at this layer).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Role(Cow<'static, str>);

impl Role {
    pub const SYSTEM: Role = Role(Cow::Borrowed("system"));

    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for Role {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who is performing a ledger operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorContext {
    pub actor_id: UserId,
    pub role: Role,
}

impl ActorContext {
    pub fn new(actor_id: UserId, role: Role) -> Self {
        Self { actor_id, role }
    }

    /// Actor used for internal compensations and background jobs.
    pub fn system() -> Self {
        Self {
            actor_id: UserId::from_uuid(uuid::Uuid::nil()),
            role: Role::SYSTEM,
        }
    }
}
