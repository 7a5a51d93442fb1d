//! Newtype identifiers used throughout the relay.
//!
//! Device ids, user ids and session ids are all plain strings at the wire
//! level, but are wrapped here so call sites that take several of them (e.g.
//! [`crate::manager::ConnectionManager::forward_command`]) can't accidentally
//! swap argument order.

use derive_more::{AsRef, Display, From};
use serde::{Deserialize, Serialize};

/// Id of a paired robot device, as assigned by the device-registration flow.
#[derive(
    AsRef, Clone, Debug, Display, Eq, From, Hash, Ord, PartialEq, PartialOrd,
    Serialize, Deserialize,
)]
#[as_ref(forward)]
pub struct DeviceId(pub String);

/// Id of an end user, taken from a bearer token's `sub` claim.
#[derive(
    AsRef, Clone, Debug, Display, Eq, From, Hash, Ord, PartialEq, PartialOrd,
    Serialize, Deserialize,
)]
#[as_ref(forward)]
pub struct UserId(pub String);

/// Opaque id of a single negotiated WebRTC session.
#[derive(
    AsRef, Clone, Debug, Display, Eq, From, Hash, Ord, PartialEq, PartialOrd,
    Serialize, Deserialize,
)]
#[as_ref(forward)]
pub struct SessionId(pub String);

impl SessionId {
    /// Mints a fresh, globally-unique session id.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl DeviceId {
    /// Borrows the underlying string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl UserId {
    /// Borrows the underlying string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl SessionId {
    /// Borrows the underlying string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}
