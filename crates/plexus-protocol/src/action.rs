//! Message actions

use crate::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What a message asks the receiving peer to do
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    /// Insert or replace
    Post = 0x01,
    /// Replace (identical to Post)
    Put = 0x02,
    /// Update the fields that are set
    Patch = 0x03,
    /// Remove
    Delete = 0x04,
    /// Read
    Get = 0x05,

    /// Map-reduce partial Post, applied locally only
    MapRPost = 0x11,
    /// Map-reduce partial Put, applied locally only
    MapRPut = 0x12,
    /// Map-reduce partial Patch, applied locally only
    MapRPatch = 0x13,
    /// Map-reduce partial Delete, applied locally only
    MapRDelete = 0x14,
    /// Map-reduce partial Get, answered from the local partition
    MapRGet = 0x15,

    /// Replay the service contents as Sync notifications
    Sync = 0x20,
    /// Fetch the replication index of a service
    EndPoints = 0x21,
    /// Carries a notification set to apply
    Notify = 0x22,

    /// Start of a bully election
    ElectionRequest = 0x30,
    /// A better candidate is alive
    ElectionResponse = 0x31,
    /// Sender is the new leader
    LeaderAnnouncement = 0x32,
    /// Periodic proof of leadership
    LeaderHeartbeat = 0x33,
    /// Who leads this service?
    LeaderQuery = 0x34,
    /// The leader steps down
    LeaderResign = 0x35,
    /// Ask the leader to prove itself
    LeaderChallenge = 0x36,

    /// Sender hosts the service
    ServiceRegister = 0x40,
    /// Sender no longer hosts the service
    ServiceUnregister = 0x41,
    /// Who hosts the service?
    ServiceQuery = 0x42,
}

impl Action {
    /// Mutating data action (goes through the transaction engine)
    pub fn is_write(self) -> bool {
        matches!(self, Self::Post | Self::Put | Self::Patch | Self::Delete)
    }

    /// Any of the map-reduce variants
    pub fn is_map_reduce(self) -> bool {
        matches!(
            self,
            Self::MapRPost | Self::MapRPut | Self::MapRPatch | Self::MapRDelete | Self::MapRGet
        )
    }

    /// Data action, plain or map-reduce
    pub fn is_data(self) -> bool {
        self.is_write() || self == Self::Get || self.is_map_reduce()
    }

    /// Election traffic
    pub fn is_election(self) -> bool {
        (0x30..=0x36).contains(&(self as u8))
    }

    /// Participant registry traffic
    pub fn is_registry(self) -> bool {
        (0x40..=0x42).contains(&(self as u8))
    }

    /// Map-reduce variant of a data action
    pub fn to_map_reduce(self) -> Self {
        match self {
            Self::Post => Self::MapRPost,
            Self::Put => Self::MapRPut,
            Self::Patch => Self::MapRPatch,
            Self::Delete => Self::MapRDelete,
            Self::Get => Self::MapRGet,
            other => other,
        }
    }

    /// Plain data action behind a map-reduce variant
    pub fn base(self) -> Self {
        match self {
            Self::MapRPost => Self::Post,
            Self::MapRPut => Self::Put,
            Self::MapRPatch => Self::Patch,
            Self::MapRDelete => Self::Delete,
            Self::MapRGet => Self::Get,
            other => other,
        }
    }
}

impl TryFrom<u8> for Action {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        let action = match value {
            0x01 => Self::Post,
            0x02 => Self::Put,
            0x03 => Self::Patch,
            0x04 => Self::Delete,
            0x05 => Self::Get,
            0x11 => Self::MapRPost,
            0x12 => Self::MapRPut,
            0x13 => Self::MapRPatch,
            0x14 => Self::MapRDelete,
            0x15 => Self::MapRGet,
            0x20 => Self::Sync,
            0x21 => Self::EndPoints,
            0x22 => Self::Notify,
            0x30 => Self::ElectionRequest,
            0x31 => Self::ElectionResponse,
            0x32 => Self::LeaderAnnouncement,
            0x33 => Self::LeaderHeartbeat,
            0x34 => Self::LeaderQuery,
            0x35 => Self::LeaderResign,
            0x36 => Self::LeaderChallenge,
            0x40 => Self::ServiceRegister,
            0x41 => Self::ServiceUnregister,
            0x42 => Self::ServiceQuery,
            other => return Err(ProtocolError::UnknownAction(other)),
        };
        Ok(action)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
            Self::Get => "GET",
            Self::MapRPost => "MapR_POST",
            Self::MapRPut => "MapR_PUT",
            Self::MapRPatch => "MapR_PATCH",
            Self::MapRDelete => "MapR_DELETE",
            Self::MapRGet => "MapR_GET",
            Self::Sync => "Sync",
            Self::EndPoints => "EndPoints",
            Self::Notify => "Notify",
            Self::ElectionRequest => "ElectionRequest",
            Self::ElectionResponse => "ElectionResponse",
            Self::LeaderAnnouncement => "LeaderAnnouncement",
            Self::LeaderHeartbeat => "LeaderHeartbeat",
            Self::LeaderQuery => "LeaderQuery",
            Self::LeaderResign => "LeaderResign",
            Self::LeaderChallenge => "LeaderChallenge",
            Self::ServiceRegister => "ServiceRegister",
            Self::ServiceUnregister => "ServiceUnregister",
            Self::ServiceQuery => "ServiceQuery",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_codes() {
        for code in 0u8..=0xFF {
            if let Ok(action) = Action::try_from(code) {
                assert_eq!(action as u8, code);
            }
        }
        assert!(Action::try_from(0x99).is_err());
    }

    #[test]
    fn test_action_classes() {
        assert!(Action::Patch.is_write());
        assert!(!Action::Get.is_write());
        assert!(Action::MapRGet.is_data());
        assert!(Action::LeaderChallenge.is_election());
        assert!(!Action::ServiceQuery.is_election());
        assert!(Action::ServiceQuery.is_registry());
        assert_eq!(Action::Delete.to_map_reduce(), Action::MapRDelete);
        assert_eq!(Action::MapRDelete.base(), Action::Delete);
        assert_eq!(Action::MapRGet.to_string(), "MapR_GET");
    }
}
