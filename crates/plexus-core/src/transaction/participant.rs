//! Answers to the transaction steps a peer is asked to take

use super::{ServiceTransactions, inverse};
use crate::node::{NodeCore, ServiceRuntime};
use crate::service::{RequestContext, dispatch};
use crate::{Error, Result};
use plexus_protocol::{Elements, Message, TransactionState, now_millis};
use tracing::{debug, warn};

/// Handle one transactional request and build the reply
pub(crate) async fn handle(core: &NodeCore, rt: &ServiceRuntime, msg: Message) -> Message {
    let Some(header) = msg.transaction.clone() else {
        return fail(core, &msg, TransactionState::Errored, &Error::protocol("missing transaction header"));
    };
    let Some(tx) = rt.transactions.as_ref() else {
        return fail(
            core,
            &msg,
            TransactionState::Errored,
            &Error::protocol(format!("{} is not transactional", rt.key)),
        );
    };
    let id = header.id;
    debug!(service = %rt.key, tr_id = %id, step = %header.state, peer = %msg.source.short(), "Transaction step");

    match header.state {
        TransactionState::Create => {
            tx.record(msg.with_tr_state(TransactionState::Created, true));
            answer(core, &msg, TransactionState::Created)
        }
        TransactionState::Start => {
            let leads = rt.election.as_ref().is_some_and(|e| e.is_leader());
            if !leads {
                return fail(
                    core,
                    &msg,
                    TransactionState::Failed,
                    &Error::election_race(format!("{} does not lead {}", core.id.short(), rt.key)),
                );
            }
            tx.set_state(&id, TransactionState::Queued);
            match tx.enqueue(msg.clone()) {
                Ok(reply) => match reply.await {
                    Ok(outcome) => outcome,
                    Err(_) => fail(
                        core,
                        &msg,
                        TransactionState::Errored,
                        &Error::internal(format!("{} worker dropped {id}", rt.key)),
                    ),
                },
                Err(e) => fail(core, &msg, TransactionState::Errored, &e),
            }
        }
        TransactionState::Lock => {
            if tx.try_lock(id, msg.source) {
                tx.set_state(&id, TransactionState::Locked);
                answer(core, &msg, TransactionState::Locked)
            } else {
                let owner = tx.locked_by().map(|o| o.to_string()).unwrap_or_default();
                fail(
                    core,
                    &msg,
                    TransactionState::LockFailed,
                    &Error::lock_failed(format!("{} is held by {owner}", rt.key)),
                )
            }
        }
        TransactionState::Commit => {
            let step = tx.step_guard(id);
            let _turn = step.lock().await;
            commit(core, rt, tx, &msg).await
        }
        TransactionState::Rollback => {
            let step = tx.step_guard(id);
            let _turn = step.lock().await;
            rollback(core, rt, tx, &msg).await
        }
        TransactionState::Cleanup | TransactionState::Finish => {
            let step = tx.step_guard(id);
            let _turn = step.lock().await;
            let committed = tx
                .get(&id)
                .is_some_and(|m| m.tr_state() == TransactionState::Committed);
            let from_coordinator = tx
                .lock_owner()
                .is_some_and(|owner| owner.id == id && owner.coordinator == msg.source);
            if header.state == TransactionState::Finish && committed && from_coordinator {
                // the leader gave up on a commit that landed after its deadline
                let undone = rollback(core, rt, tx, &msg).await;
                if let Some(reason) = undone.error_text() {
                    warn!(service = %rt.key, tr_id = %id, "Abandoned commit not undone: {}", reason);
                }
            }
            tx.forget(&id);
            answer(core, &msg, TransactionState::Finished)
        }
        other => fail(
            core,
            &msg,
            TransactionState::Errored,
            &Error::protocol(format!("unexpected transaction step {other}")),
        ),
    }
}

async fn commit(core: &NodeCore, rt: &ServiceRuntime, tx: &ServiceTransactions, msg: &Message) -> Message {
    let Some(header) = msg.transaction.as_ref() else {
        return fail(core, msg, TransactionState::Errored, &Error::protocol("missing transaction header"));
    };
    let id = header.id;

    if tx.locked_by() != Some(id) {
        return fail(
            core,
            msg,
            TransactionState::Errored,
            &Error::protocol(format!("commit of {id} without holding the lock")),
        );
    }
    match tx.get(&id).map(|m| m.tr_state()) {
        Some(TransactionState::Locked | TransactionState::Commit) => {}
        state => {
            return fail(
                core,
                msg,
                TransactionState::Errored,
                &Error::protocol(format!("commit of {id} from {state:?}")),
            );
        }
    }
    if header.is_expired(now_millis()) {
        tx.set_state(&id, TransactionState::Errored);
        return fail(
            core,
            msg,
            TransactionState::Errored,
            &Error::timed_out(format!("{id} passed its {}ms commit deadline", header.timeout)),
        );
    }

    tx.set_state(&id, TransactionState::Commit);
    match apply_commit(core, rt, tx, msg).await {
        Ok(elements) => {
            tx.set_state(&id, TransactionState::Committed);
            let mut reply = answer(core, msg, TransactionState::Committed);
            reply.elements = elements;
            reply
        }
        Err(e) => {
            tx.set_state(&id, TransactionState::Errored);
            fail(core, msg, TransactionState::Errored, &e)
        }
    }
}

/// Capture the pre-image of the key and apply the action through the handler
pub(crate) async fn apply_commit(
    core: &NodeCore,
    rt: &ServiceRuntime,
    tx: &ServiceTransactions,
    msg: &Message,
) -> Result<Elements> {
    let id = msg
        .transaction
        .as_ref()
        .map(|h| h.id)
        .ok_or_else(|| Error::protocol("missing transaction header"))?;
    let ctx = RequestContext::commit(core.id, msg.source, id);

    let first = msg
        .elements
        .first()
        .cloned()
        .ok_or_else(|| Error::validation("no records"))?;
    let pre = match rt.handler.get(Elements::one(first), &ctx).await {
        Ok(found) => found.items.into_iter().next(),
        Err(Error::NotFound(_)) => None,
        Err(e) => return Err(Error::handler(format!("pre-image: {e}"))),
    };
    tx.set_pre_image(id, pre);

    dispatch(rt.handler.as_ref(), msg.action, msg.elements.clone(), &ctx)
        .await
        .map_err(|e| match e {
            Error::Handler(_) => e,
            other => Error::handler(other.to_string()),
        })
}

async fn rollback(core: &NodeCore, rt: &ServiceRuntime, tx: &ServiceTransactions, msg: &Message) -> Message {
    let Some(header) = msg.transaction.as_ref() else {
        return fail(core, msg, TransactionState::Errored, &Error::protocol("missing transaction header"));
    };
    let id = header.id;

    let Some(stored) = tx.get(&id) else {
        return fail(
            core,
            msg,
            TransactionState::Errored,
            &Error::protocol(format!("rollback of unknown transaction {id}")),
        );
    };
    match stored.tr_state() {
        TransactionState::Committed => {}
        // nothing was applied here
        TransactionState::Created
        | TransactionState::Locked
        | TransactionState::Errored
        | TransactionState::Rollbacked => {
            tx.set_state(&id, TransactionState::Rollbacked);
            return answer(core, msg, TransactionState::Rollbacked);
        }
        state => {
            return fail(
                core,
                msg,
                TransactionState::Errored,
                &Error::protocol(format!("rollback of {id} from {state}")),
            );
        }
    }

    let pre = tx.pre_image(&id).flatten();
    let Some(applied) = msg.elements.first().or(stored.elements.first()).cloned() else {
        return fail(core, msg, TransactionState::Errored, &Error::validation("no records"));
    };
    if let Some((undo, record)) = inverse(stored.action, pre, applied) {
        let ctx = RequestContext::rollback(core.id, msg.source, id);
        if let Err(e) = dispatch(rt.handler.as_ref(), undo, Elements::one(record), &ctx).await {
            // stays Committed so a later Rollback or Finish can retry
            warn!(service = %rt.key, tr_id = %id, "Rollback {} failed: {}", undo, e);
            return fail(core, msg, TransactionState::Errored, &Error::handler(e.to_string()));
        }
    }
    tx.set_state(&id, TransactionState::Rollbacked);
    answer(core, msg, TransactionState::Rollbacked)
}

fn answer(core: &NodeCore, msg: &Message, state: TransactionState) -> Message {
    let mut reply = msg.reply(core.id);
    if let Some(header) = reply.transaction.as_mut() {
        header.state = state;
    }
    reply
}

fn fail(core: &NodeCore, msg: &Message, state: TransactionState, err: &Error) -> Message {
    let mut reply = msg.reply(core.id);
    match reply.transaction.as_mut() {
        Some(header) => header.fail(state, err.to_string()),
        None => reply.elements = Elements::error(err.to_string()),
    }
    reply
}
