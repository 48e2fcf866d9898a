//! Timer task driving one service's election

use super::{Election, Outbound};
use crate::overlay::Overlay;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Send what the state machine asked for; failures are only logged since
/// the next tick retries.
pub async fn send_all(overlay: &dyn Overlay, out: Vec<Outbound>) {
    for outbound in out {
        let (action, result) = match outbound {
            Outbound::Multicast(msg) => (msg.action, overlay.multicast(msg).await),
            Outbound::Unicast(to, msg) => (msg.action, overlay.unicast(to, msg).await),
        };
        if let Err(e) = result {
            debug!("Election {} not sent: {}", action, e);
        }
    }
}

/// Tick the election until `cancel` fires
pub fn spawn_monitor(
    election: Arc<Election>,
    overlay: Arc<dyn Overlay>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(election.config().tick());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let out = election.tick(Instant::now());
                    send_all(overlay.as_ref(), out).await;
                }
            }
        }
        debug!(service = %election.service(), "Election monitor stopped");
    })
}
