//! Transaction header and state machine

use crate::{TransactionId, now_millis};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Transaction lifecycle.
///
/// Request steps (`Create`, `Start`, `Lock`, `Commit`, `Rollback`,
/// `Cleanup`, `Finish`) are what a peer is asked to do; the remaining
/// states are what it answers or where the transaction ends.
///
/// ```text
/// Empty -> Create -> Created -> Queued -> Running -> Locked -> Commit
///       -> Committed -> Cleanup -> Finished
///                    \-> Rollback -> Rollbacked
/// terminal: Errored | Failed | LockFailed | Rollbacked | Finished
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum TransactionState {
    /// Not yet created
    #[default]
    Empty,
    /// Request: record the transaction
    Create,
    /// Answer: transaction recorded
    Created,
    /// Request: hand the transaction to the leader's queue
    Start,
    /// Waiting in the leader queue
    Queued,
    /// Being driven by the leader worker
    Running,
    /// Request: take the service lock
    Lock,
    /// Answer: service lock held
    Locked,
    /// Answer: service lock busy
    LockFailed,
    /// Request: apply the action
    Commit,
    /// Answer: action applied
    Committed,
    /// Request: undo the action
    Rollback,
    /// Answer: action undone
    Rollbacked,
    /// Request: forget the transaction
    Cleanup,
    /// Request: forget the transaction on an abort path
    Finish,
    /// Transaction completed
    Finished,
    /// A peer or handler failed to apply the action
    Errored,
    /// The transaction was aborted before commit
    Failed,
}

impl TransactionState {
    /// The transaction will not move any further
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Finished | Self::Errored | Self::Failed | Self::LockFailed | Self::Rollbacked
        )
    }

    /// The transaction ended without applying its action
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            Self::Errored | Self::Failed | Self::LockFailed | Self::Rollbacked
        )
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Transaction header carried by data messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionHeader {
    /// Transaction id
    pub id: TransactionId,
    /// Current state
    pub state: TransactionState,
    /// Error text when the transaction failed
    pub err_msg: String,
    /// Creation time (ms since epoch); commit deadlines count from here
    pub start_time: i64,
    /// Time the originating peer created the record
    pub created: i64,
    /// Time the leader queued it
    pub queued: i64,
    /// Time the leader worker picked it up
    pub running: i64,
    /// Time it finished
    pub end: i64,
    /// Commit deadline in milliseconds
    pub timeout: i64,
    /// Position of the receiving peer in the replica set, when partitioned
    pub replica_index: i32,
}

impl TransactionHeader {
    /// New header in the `Create` state
    pub fn new(timeout_ms: i64) -> Self {
        let now = now_millis();
        Self {
            id: TransactionId::new(),
            state: TransactionState::Create,
            err_msg: String::new(),
            start_time: now,
            created: now,
            queued: 0,
            running: 0,
            end: 0,
            timeout: timeout_ms,
            replica_index: -1,
        }
    }

    /// Copy of the header moved to another state
    pub fn with_state(&self, state: TransactionState) -> Self {
        let mut header = self.clone();
        header.state = state;
        header
    }

    /// Commit deadline has passed
    pub fn is_expired(&self, now: i64) -> bool {
        self.timeout > 0 && now - self.start_time > self.timeout
    }

    /// Mark as failed with a reason
    pub fn fail(&mut self, state: TransactionState, reason: impl Into<String>) {
        self.state = state;
        self.err_msg = reason.into();
        self.end = now_millis();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_header() {
        let header = TransactionHeader::new(20_000);
        assert_eq!(header.state, TransactionState::Create);
        assert!(header.err_msg.is_empty());
        assert!(!header.is_expired(header.start_time + 19_999));
        assert!(header.is_expired(header.start_time + 20_001));
    }

    #[test]
    fn test_terminal_states() {
        assert!(TransactionState::Finished.is_terminal());
        assert!(TransactionState::LockFailed.is_failure());
        assert!(!TransactionState::Committed.is_terminal());
        assert!(!TransactionState::Finished.is_failure());
    }

    #[test]
    fn test_fail() {
        let mut header = TransactionHeader::new(0);
        header.fail(TransactionState::Errored, "boom");
        assert_eq!(header.state, TransactionState::Errored);
        assert_eq!(header.err_msg, "boom");
        assert!(header.end > 0);
        // zero timeout never expires
        assert!(!header.is_expired(i64::MAX));
    }
}
