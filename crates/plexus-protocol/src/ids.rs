//! Peer, service and transaction identifiers

use crate::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Longest service name a user service may register
pub const MAX_SERVICE_NAME_LEN: usize = 10;

/// Identity of a peer in the overlay.
///
/// Ordering follows the hyphenated lowercase string form, which is what
/// leader election compares: the lowest id wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(Uuid);

impl PeerId {
    /// Generate a fresh random peer id
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing uuid
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Underlying uuid
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// First eight hex digits, for log lines
    pub fn short(&self) -> String {
        let s = self.0.simple().to_string();
        s[..8].to_string()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for PeerId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| ProtocolError::invalid_id(format!("peer id {s:?}: {e}")))
    }
}

/// Identity of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(Uuid);

impl TransactionId {
    /// Generate a fresh transaction id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// A service instance: name plus an 8-bit area
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceKey {
    /// Service name
    pub name: String,
    /// Service area
    pub area: u8,
}

impl ServiceKey {
    /// Build a key without validating the name length.
    ///
    /// Internal shadow services (the replication index) use names longer
    /// than [`MAX_SERVICE_NAME_LEN`]; user services go through
    /// [`ServiceKey::validated`].
    pub fn new(name: impl Into<String>, area: u8) -> Self {
        Self {
            name: name.into(),
            area,
        }
    }

    /// Build a key for a user service, enforcing the name rules
    pub fn validated(name: impl Into<String>, area: u8) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(ProtocolError::invalid_id("service name is empty"));
        }
        if name.chars().count() > MAX_SERVICE_NAME_LEN {
            return Err(ProtocolError::invalid_id(format!(
                "service name {name:?} exceeds {MAX_SERVICE_NAME_LEN} characters"
            )));
        }
        Ok(Self { name, area })
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.area)
    }
}
