//! Catch-up of a late joiner from the service leader

use crate::node::{NodeCore, ServiceRuntime};
use crate::replication::shadow_key;
use crate::service::{RequestContext, count_query};
use crate::{Error, Result};
use plexus_protocol::{Action, Elements, Message, Query};
use std::sync::Arc;
use tracing::{debug, info};

/// Bring the local copy of a service in line with the leader.
///
/// Returns the number of records replayed. Nothing happens when no leader
/// shows up within the grace period or the local peer is the leader.
pub(crate) async fn recover(core: Arc<NodeCore>, rt: Arc<ServiceRuntime>) -> Result<usize> {
    let Some(election) = rt.election.as_ref() else {
        return Ok(0);
    };
    let Some(leader) = election.wait_for_leader(core.config.sync.grace_period()).await else {
        debug!(service = %rt.key, "No leader within the grace period, skipping sync");
        return Ok(0);
    };
    if leader == core.id {
        return Ok(0);
    }
    let timeout = core.config.fanout_timeout();

    let partitioned = rt.tx_config.is_some_and(|c| c.replication);
    if partitioned {
        // the leader replays its index as Sync notifications to everyone
        let msg = Message::new(core.id, shadow_key(&rt.key), Action::Sync);
        let reply = core.overlay.request(leader, msg, timeout).await?;
        if let Some(err) = reply.error_text() {
            return Err(Error::from_remote(&err));
        }
        info!(service = %rt.key, "Requested replication index from {}", leader.short());
        return Ok(0);
    }

    let read = |query: Query| {
        Message::new(core.id, rt.key.clone(), Action::Get).with_elements(Elements::query(query))
    };
    let remote = core.overlay.request(leader, read(count_query()), timeout).await?;
    if let Some(err) = remote.error_text() {
        return Err(Error::from_remote(&err));
    }
    let ctx = RequestContext::local(core.id);
    let local = rt.handler.get(Elements::query(count_query()), &ctx).await?;

    let total = remote.elements.total();
    if local.total() == total {
        debug!(service = %rt.key, total, "Already in sync");
        return Ok(0);
    }

    info!(service = %rt.key, local = local.total(), total, "Syncing from {}", leader.short());
    let replay = RequestContext::notification(core.id, leader);
    let page_size = core.config.sync.page_size;
    let mut replayed = 0;
    let mut page = 0;
    while page * page_size < total {
        let reply = core
            .overlay
            .request(leader, read(Query::page(page, page_size)), timeout)
            .await?;
        if let Some(err) = reply.error_text() {
            return Err(Error::from_remote(&err));
        }
        if reply.elements.is_empty() {
            break;
        }
        let count = reply.elements.len();
        rt.handler.post(Elements::many(reply.elements.items), &replay).await?;
        replayed += count;
        page += 1;
    }
    info!(service = %rt.key, replayed, "Sync finished");
    Ok(replayed)
}
