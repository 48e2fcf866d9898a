//! Originator and leader sides of a write

use super::fanout::{broadcast, to_all};
use super::{Failure, Pending, ServiceTransactions, participant};
use crate::node::{NodeCore, ServiceRuntime};
use crate::replication::ReplicationService;
use crate::service::{RequestContext, TransactionConfig};
use crate::{Error, Result};
use plexus_protocol::{
    Action, Elements, Message, PeerId, TransactionHeader, TransactionId, TransactionState,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Run a write as a transaction from the local peer and wait for its outcome
pub(crate) async fn execute(
    core: &NodeCore,
    rt: &ServiceRuntime,
    action: Action,
    elements: Elements,
) -> Result<Elements> {
    let (Some(tx), Some(election)) = (rt.transactions.as_ref(), rt.election.as_ref()) else {
        return Err(Error::internal(format!("{} has no transaction engine", rt.key)));
    };
    rt.handler.key_of(&elements)?;

    let leader = election
        .wait_for_leader(core.config.leader_wait())
        .await
        .ok_or_else(|| Error::timed_out(format!("no leader for {}", rt.key)))?;

    let header = TransactionHeader::new(core.config.commit_timeout().as_millis() as i64);
    let id = header.id;
    let create = Message::new(core.id, rt.key.clone(), action)
        .with_elements(elements)
        .with_transaction(header);
    tx.record(create.with_tr_state(TransactionState::Created, true));
    debug!(service = %rt.key, tr_id = %id, action = %action, "Transaction created");

    let others = core.participants.others(&rt.key, core.id);
    let report = broadcast(
        core.overlay.as_ref(),
        to_all(&others, &create),
        TransactionState::Created,
        core.config.fanout_timeout(),
    )
    .await;
    if !report.all_ok() {
        let reason = report.first_error().unwrap_or_default().to_string();
        finish(core, &create, &others).await;
        tx.forget(&id);
        return Err(Error::from_outcome(TransactionState::Failed, &reason));
    }

    let start = create.with_tr_state(TransactionState::Start, false);
    let outcome = if leader == core.id {
        let reply = tx.enqueue(start)?;
        reply
            .await
            .map_err(|_| Error::internal(format!("{} worker dropped {id}", rt.key)))
    } else {
        core.overlay
            .request(leader, start, core.config.commit_timeout() + core.config.fanout_timeout())
            .await
    };
    tx.forget(&id);

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(service = %rt.key, tr_id = %id, "Leader did not answer: {}", e);
            finish(core, &create, &others).await;
            return Err(e);
        }
    };

    match outcome.tr_state() {
        TransactionState::Committed => Ok(outcome.elements),
        state => Err(Error::from_outcome(
            state,
            &outcome.error_text().unwrap_or_default(),
        )),
    }
}

/// Leader worker: drives queued transactions one at a time
pub(crate) fn spawn_worker(
    core: Arc<NodeCore>,
    rt: Arc<ServiceRuntime>,
    mut rx: mpsc::UnboundedReceiver<Pending>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let pending = tokio::select! {
                _ = rt.cancel.cancelled() => break,
                next = rx.recv() => match next {
                    Some(pending) => pending,
                    None => break,
                },
            };
            let reply = run(&core, &rt, pending.msg).await;
            if pending.reply.send(reply).is_err() {
                debug!(service = %rt.key, "Transaction originator went away");
            }
        }
        debug!(service = %rt.key, "Transaction worker stopped");
    })
}

/// Drive one transaction and build the message its originator receives
async fn run(core: &NodeCore, rt: &ServiceRuntime, msg: Message) -> Message {
    let mut reply = msg.reply(core.id);
    let Some(id) = msg.transaction.as_ref().map(|h| h.id) else {
        reply.elements = Elements::error(Error::protocol("missing transaction header").to_string());
        return reply;
    };

    match drive(core, rt, id).await {
        Ok(elements) => {
            reply.elements = elements;
            if let Some(header) = reply.transaction.as_mut() {
                header.state = TransactionState::Committed;
                header.end = plexus_protocol::now_millis();
            }
            debug!(service = %rt.key, tr_id = %id, "Transaction committed");
        }
        Err(failure) => {
            if let Some(header) = reply.transaction.as_mut() {
                header.fail(failure.state, failure.msg.clone());
            }
            info!(
                service = %rt.key,
                tr_id = %id,
                state = %failure.state,
                "Transaction failed: {}",
                failure.msg
            );
        }
    }
    reply
}

/// Where a key is written
struct Plan {
    key: String,
    targets: Vec<PeerId>,
    replicas: Vec<PeerId>,
    leader_is_target: bool,
    // placement made by this transaction, released again on failure
    fresh: Option<Arc<ReplicationService>>,
    index: Option<Arc<ReplicationService>>,
}

async fn drive(
    core: &NodeCore,
    rt: &ServiceRuntime,
    id: TransactionId,
) -> std::result::Result<Elements, Failure> {
    let (Some(tx), Some(election)) = (rt.transactions.as_ref(), rt.election.as_ref()) else {
        return Err(Failure::from_error(
            TransactionState::Errored,
            &Error::internal(format!("{} has no transaction engine", rt.key)),
        ));
    };
    if !election.is_leader() {
        return Err(Failure::from_error(
            TransactionState::Failed,
            &Error::election_race(format!("{} is no longer leader of {}", core.id.short(), rt.key)),
        ));
    }
    let Some(mut stored) = tx.get(&id) else {
        return Err(Failure::from_error(
            TransactionState::Errored,
            &Error::protocol(format!("transaction {id} was never created here")),
        ));
    };
    tx.set_state(&id, TransactionState::Running);
    // participants see the leader as the coordinator of every step
    stored.source = core.id;

    let config = rt.tx_config.unwrap_or_else(TransactionConfig::full);
    let plan = plan(core, rt, &stored, config)?;

    // lock
    let lock = stored.with_tr_state(TransactionState::Lock, false);
    let report = broadcast(
        core.overlay.as_ref(),
        to_all(&plan.targets, &lock),
        TransactionState::Locked,
        core.config.fanout_timeout(),
    )
    .await;
    let locked_here = report.all_ok() && tx.try_lock(id, core.id);
    if !locked_here {
        let reason = report
            .first_error()
            .map(str::to_string)
            .unwrap_or_else(|| Error::lock_failed(format!("{} is busy", rt.key)).to_string());
        abort(core, tx, &stored, &plan).await;
        return Err(Failure::new(TransactionState::LockFailed, reason));
    }
    tx.set_state(&id, TransactionState::Locked);

    // commit on the replicas
    let commit = stored.with_tr_state(TransactionState::Commit, true);
    let sends = plan
        .replicas
        .iter()
        .enumerate()
        .map(|(i, peer)| {
            let mut msg = commit.clone();
            if config.replication {
                if let Some(header) = msg.transaction.as_mut() {
                    header.replica_index = i as i32;
                }
            }
            (*peer, msg)
        })
        .collect();
    let report = broadcast(
        core.overlay.as_ref(),
        sends,
        TransactionState::Committed,
        core.config.fanout_timeout(),
    )
    .await;
    if !report.all_ok() {
        for (peer, reason) in &report.failed {
            let ctx = RequestContext::commit(core.id, *peer, id);
            if let Err(e) = rt.handler.failed(stored.elements.clone(), &ctx, reason).await {
                warn!(service = %rt.key, peer = %peer.short(), "Failure hook errored: {}", e);
            }
        }
        let reason = report.first_error().unwrap_or_default().to_string();
        // a replica that timed out may still commit, so it is undone as well
        let mut undo = report.ok.clone();
        undo.extend(report.unanswered.iter().copied());
        rollback(core, &stored, &undo).await;
        abort(core, tx, &stored, &plan).await;
        return Err(Failure::new(TransactionState::Errored, reason));
    }

    // commit locally
    let result = if plan.leader_is_target {
        tx.set_state(&id, TransactionState::Commit);
        match participant::apply_commit(core, rt, tx, &commit).await {
            Ok(elements) => {
                tx.set_state(&id, TransactionState::Committed);
                elements
            }
            Err(e) => {
                rollback(core, &stored, &report.ok).await;
                abort(core, tx, &stored, &plan).await;
                return Err(Failure::from_error(TransactionState::Errored, &e));
            }
        }
    } else {
        report
            .replies
            .into_iter()
            .next()
            .map(|reply| reply.elements)
            .unwrap_or_default()
    };

    // cleanup
    let cleanup = stored.with_tr_state(TransactionState::Cleanup, false);
    let report = broadcast(
        core.overlay.as_ref(),
        to_all(&plan.targets, &cleanup),
        TransactionState::Finished,
        core.config.fanout_timeout(),
    )
    .await;
    for (peer, reason) in &report.failed {
        warn!(service = %rt.key, tr_id = %id, peer = %peer.short(), "Cleanup not acknowledged: {}", reason);
    }
    tx.forget(&id);

    if stored.action.base() == Action::Delete {
        if let Some(index) = &plan.index {
            if let Err(e) = index.release(&plan.key) {
                warn!(service = %rt.key, key = %plan.key, "Placement not released: {}", e);
            }
        }
    }
    Ok(result)
}

/// Targets and replicas of a transaction
fn plan(
    core: &NodeCore,
    rt: &ServiceRuntime,
    stored: &Message,
    config: TransactionConfig,
) -> std::result::Result<Plan, Failure> {
    let errored = |e: Error| Failure::from_error(TransactionState::Errored, &e);
    let key = rt.handler.key_of(&stored.elements).map_err(errored)?;
    let targets = core.participants.others(&rt.key, core.id);

    if !config.replication {
        return Ok(Plan {
            key,
            replicas: targets.clone(),
            targets,
            leader_is_target: true,
            fresh: None,
            index: None,
        });
    }

    let index = core
        .replication
        .get(&rt.key)
        .map(|entry| entry.value().clone())
        .ok_or_else(|| errored(Error::internal(format!("{} has no replication index", rt.key))))?;

    let (hosts, fresh) = if stored.action.base() == Action::Delete {
        let hosts = index
            .location(&key)
            .ok_or_else(|| errored(Error::not_found(format!("{key:?} is not placed"))))?;
        (hosts, false)
    } else {
        let mut candidates = core.participants.peers(&rt.key);
        if !candidates.contains(&core.id) {
            candidates.push(core.id);
        }
        let placement = index
            .place(&key, config.replication_count, &candidates)
            .map_err(errored)?;
        (placement.peers, placement.fresh)
    };

    Ok(Plan {
        key,
        leader_is_target: hosts.contains(&core.id),
        replicas: hosts.into_iter().filter(|p| *p != core.id).collect(),
        targets,
        fresh: fresh.then(|| index.clone()),
        index: Some(index),
    })
}

/// Ask peers that committed, or may have, to undo it
async fn rollback(core: &NodeCore, stored: &Message, committed: &[PeerId]) {
    if committed.is_empty() {
        return;
    }
    let msg = stored.with_tr_state(TransactionState::Rollback, true);
    let report = broadcast(
        core.overlay.as_ref(),
        to_all(committed, &msg),
        TransactionState::Rollbacked,
        core.config.fanout_timeout(),
    )
    .await;
    for (peer, reason) in &report.failed {
        warn!(service = %stored.service, peer = %peer.short(), "Rollback failed: {}", reason);
    }
}

/// Release everything a failed transaction holds
async fn abort(core: &NodeCore, tx: &ServiceTransactions, stored: &Message, plan: &Plan) {
    finish(core, stored, &plan.targets).await;
    if let Some(header) = &stored.transaction {
        tx.forget(&header.id);
    }
    if let Some(index) = &plan.fresh {
        if let Err(e) = index.release(&plan.key) {
            warn!(service = %stored.service, key = %plan.key, "Placement not released: {}", e);
        }
    }
}

/// Tell peers to forget a transaction
async fn finish(core: &NodeCore, msg: &Message, peers: &[PeerId]) {
    if peers.is_empty() {
        return;
    }
    let finish = msg.with_tr_state(TransactionState::Finish, false);
    let report = broadcast(
        core.overlay.as_ref(),
        to_all(peers, &finish),
        TransactionState::Finished,
        core.config.fanout_timeout(),
    )
    .await;
    if !report.all_ok() {
        debug!(service = %msg.service, "Finish not acknowledged by {} peers", report.failed.len());
    }
}
