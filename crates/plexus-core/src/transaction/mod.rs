//! Leader-coordinated two-phase commit
//!
//! Every transactional service has one [`ServiceTransactions`] per peer:
//! the records of in-flight transactions, the pre-images captured before
//! commits, the single lock slot and the leader's work queue.
//!
//! ```text
//! originator            leader worker                 participants
//!   Create  ───────────────────────────────────────────► Created
//!   Start   ──► queue ──► Lock    ──────────────────────► Locked
//!                         Commit  ─────── replicas ─────► Committed
//!                         (local commit)
//!                         Cleanup ──────────────────────► Finished
//!   ◄──────── Committed ──┘
//! ```
//!
//! Any failure after a commit sends `Rollback` to the peers that committed
//! and `Finish` to everyone.

pub(crate) mod coordinator;
pub mod fanout;
pub(crate) mod participant;

pub use fanout::{FanoutReport, broadcast, to_all};

use parking_lot::Mutex;
use plexus_protocol::{
    Action, Message, PeerId, ServiceKey, TransactionId, TransactionState, now_millis,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

/// A transaction waiting for the leader worker
#[derive(Debug)]
pub struct Pending {
    /// The `Start` message
    pub msg: Message,
    /// Receives the final message
    pub reply: oneshot::Sender<Message>,
}

/// Holder of the lock slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOwner {
    /// Transaction holding the slot
    pub id: TransactionId,
    /// Peer that asked for the lock
    pub coordinator: PeerId,
}

/// How long a lock owner may keep others out
enum Hold {
    Stale,
    Until(i64),
    Open,
}

fn hold_of(tr_map: &HashMap<TransactionId, Message>, id: &TransactionId, now: i64) -> Hold {
    match tr_map.get(id).and_then(|m| m.transaction.as_ref()) {
        None => Hold::Stale,
        Some(header) if header.is_expired(now) => Hold::Stale,
        Some(header) if header.timeout > 0 => Hold::Until(header.start_time + header.timeout),
        Some(_) => Hold::Open,
    }
}

/// Per-service transaction state on one peer
pub struct ServiceTransactions {
    service: ServiceKey,
    tr_map: Mutex<HashMap<TransactionId, Message>>,
    pre_commit: Mutex<HashMap<TransactionId, Option<Value>>>,
    // steps of one transaction run one at a time on a participant
    steps: Mutex<HashMap<TransactionId, Arc<tokio::sync::Mutex<()>>>>,
    lock: watch::Sender<Option<LockOwner>>,
    queue: mpsc::UnboundedSender<Pending>,
}

impl ServiceTransactions {
    /// New state and the receiving end of the leader queue
    pub fn new(service: ServiceKey) -> (Arc<Self>, mpsc::UnboundedReceiver<Pending>) {
        let (queue, rx) = mpsc::unbounded_channel();
        let (lock, _) = watch::channel(None);
        let state = Arc::new(Self {
            service,
            tr_map: Mutex::new(HashMap::new()),
            pre_commit: Mutex::new(HashMap::new()),
            steps: Mutex::new(HashMap::new()),
            lock,
            queue,
        });
        (state, rx)
    }

    /// Service this state belongs to
    pub fn service(&self) -> &ServiceKey {
        &self.service
    }

    /// Store the latest message of a transaction
    pub fn record(&self, msg: Message) {
        if let Some(header) = &msg.transaction {
            self.tr_map.lock().insert(header.id, msg);
        }
    }

    /// Latest message of a transaction
    pub fn get(&self, id: &TransactionId) -> Option<Message> {
        self.tr_map.lock().get(id).cloned()
    }

    /// Move a recorded transaction to `state`; returns false if unknown
    pub fn set_state(&self, id: &TransactionId, state: TransactionState) -> bool {
        let mut map = self.tr_map.lock();
        match map.get_mut(id).and_then(|m| m.transaction.as_mut()) {
            Some(header) => {
                header.state = state;
                true
            }
            None => false,
        }
    }

    /// Number of recorded transactions
    pub fn in_flight(&self) -> usize {
        self.tr_map.lock().len()
    }

    /// Drop everything known about a transaction and release the lock if
    /// it holds it. Safe to call twice.
    pub fn forget(&self, id: &TransactionId) {
        self.tr_map.lock().remove(id);
        self.pre_commit.lock().remove(id);
        self.steps.lock().remove(id);
        self.unlock(id);
    }

    /// Mutex a participant holds while it takes a step of `id`
    pub fn step_guard(&self, id: TransactionId) -> Arc<tokio::sync::Mutex<()>> {
        self.steps.lock().entry(id).or_default().clone()
    }

    /// Take the lock slot for `id` on behalf of `coordinator`.
    ///
    /// Re-entrant for the owner. An owner whose commit deadline passed, or
    /// that this peer no longer knows, is replaced.
    pub fn try_lock(&self, id: TransactionId, coordinator: PeerId) -> bool {
        let now = now_millis();
        let tr_map = self.tr_map.lock();
        let mut acquired = false;
        self.lock.send_if_modified(|slot| match *slot {
            None => {
                *slot = Some(LockOwner { id, coordinator });
                acquired = true;
                true
            }
            Some(owner) if owner.id == id => {
                acquired = true;
                false
            }
            Some(owner) => {
                if matches!(hold_of(&tr_map, &owner.id, now), Hold::Stale) {
                    warn!(
                        service = %self.service,
                        tr_id = %owner.id,
                        "Taking over lock from a stale transaction"
                    );
                    *slot = Some(LockOwner { id, coordinator });
                    acquired = true;
                    true
                } else {
                    false
                }
            }
        });
        drop(tr_map);
        if acquired {
            debug!(service = %self.service, tr_id = %id, "Lock acquired");
        }
        acquired
    }

    /// Release the lock slot if `id` holds it
    pub fn unlock(&self, id: &TransactionId) -> bool {
        self.lock.send_if_modified(|slot| {
            if slot.is_some_and(|owner| owner.id == *id) {
                *slot = None;
                true
            } else {
                false
            }
        })
    }

    /// Transaction holding the lock slot
    pub fn locked_by(&self) -> Option<TransactionId> {
        self.lock.borrow().map(|owner| owner.id)
    }

    /// Holder of the lock slot and the peer driving it
    pub fn lock_owner(&self) -> Option<LockOwner> {
        *self.lock.borrow()
    }

    /// Wait until no live transaction holds the lock slot.
    ///
    /// The wait ends at the owner's commit deadline at the latest. An owner
    /// that is expired, or unknown here, is released.
    pub async fn wait_unlocked(&self) {
        let mut rx = self.lock.subscribe();
        loop {
            let Some(owner) = *rx.borrow_and_update() else {
                return;
            };
            let now = now_millis();
            let hold = hold_of(&self.tr_map.lock(), &owner.id, now);
            match hold {
                Hold::Stale => {
                    if self.unlock(&owner.id) {
                        warn!(service = %self.service, tr_id = %owner.id, "Released a stale lock");
                    }
                }
                Hold::Until(deadline) => {
                    // one past the deadline so the owner reads as expired
                    let left = Duration::from_millis((deadline - now).max(0) as u64 + 1);
                    if let Ok(Err(_)) = tokio::time::timeout(left, rx.changed()).await {
                        return;
                    }
                }
                Hold::Open => {
                    if rx.changed().await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    /// Drop the transaction holding the lock if `peer` coordinates it.
    /// A departed coordinator never sends the step that would release it.
    pub fn release_departed(&self, peer: PeerId) -> Option<TransactionId> {
        let owner = self.lock_owner().filter(|owner| owner.coordinator == peer)?;
        warn!(
            service = %self.service,
            tr_id = %owner.id,
            peer = %peer.short(),
            "Coordinator departed, releasing its lock"
        );
        self.forget(&owner.id);
        Some(owner.id)
    }

    /// Remember the record a commit is about to overwrite
    pub fn set_pre_image(&self, id: TransactionId, old: Option<Value>) {
        self.pre_commit.lock().insert(id, old);
    }

    /// Record a commit overwrote; `None` when nothing was captured
    pub fn pre_image(&self, id: &TransactionId) -> Option<Option<Value>> {
        self.pre_commit.lock().get(id).cloned()
    }

    /// Hand a `Start` message to the leader worker
    pub fn enqueue(&self, msg: Message) -> crate::Result<oneshot::Receiver<Message>> {
        let (reply, rx) = oneshot::channel();
        self.queue
            .send(Pending { msg, reply })
            .map_err(|_| crate::Error::internal(format!("{} worker stopped", self.service)))?;
        Ok(rx)
    }
}

/// The action and record that undo a committed action.
///
/// `pre` is what the key held before the commit and `applied` the record
/// the commit wrote. `None` means there is nothing to undo.
pub fn inverse(action: Action, pre: Option<Value>, applied: Value) -> Option<(Action, Value)> {
    match (action.base(), pre) {
        (Action::Post | Action::Put | Action::Patch, Some(old)) => Some((Action::Put, old)),
        (Action::Post | Action::Put | Action::Patch, None) => Some((Action::Delete, applied)),
        (Action::Delete, Some(old)) => Some((Action::Post, old)),
        _ => None,
    }
}

/// Terminal outcome of a transaction step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    /// State reported to the originator
    pub state: TransactionState,
    /// Reason
    pub msg: String,
}

impl Failure {
    /// Failure in `state`
    pub fn new(state: TransactionState, msg: impl Into<String>) -> Self {
        Self {
            state,
            msg: msg.into(),
        }
    }

    /// Failure carrying an error's text
    pub fn from_error(state: TransactionState, err: &crate::Error) -> Self {
        Self::new(state, err.to_string())
    }
}
