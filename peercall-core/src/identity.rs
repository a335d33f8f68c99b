//! Peer identity abstraction
//!
//! The call core is generic over how the surrounding application identifies
//! its users. Anything that can be cloned, compared, displayed, and
//! serialized onto the signaling wire qualifies; [`UserId`] is the
//! plain-string identity used by simple deployments and by tests.

use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display};
use std::hash::Hash;

/// Trait for the identity of a call participant.
///
/// Implementations must be cheap to clone and stable for the lifetime of a
/// session: the state machine compares identities when routing replies and
/// uses them as log fields.
pub trait PeerIdentity:
    Clone
    + Debug
    + Display
    + PartialEq
    + Eq
    + Hash
    + Serialize
    + for<'de> Deserialize<'de>
    + Send
    + Sync
    + 'static
{
    /// Stable string form for use in log fields and diagnostics.
    fn unique_id(&self) -> String {
        self.to_string()
    }
}

/// Simple string-based peer identity (application user id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    /// Create a user id from anything string-like.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the inner string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for UserId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl PeerIdentity for UserId {}
