//! Bounded request fan-out to a set of peers

use crate::Error;
use crate::overlay::Overlay;
use futures::future::join_all;
use plexus_protocol::{Message, PeerId, TransactionState};
use std::time::Duration;
use tracing::debug;

/// What every target answered
#[derive(Debug, Default)]
pub struct FanoutReport {
    /// Peers that answered with the expected state
    pub ok: Vec<PeerId>,
    /// Peers that failed, with the reason
    pub failed: Vec<(PeerId, String)>,
    /// Failed peers that did not answer in time; they may still act on
    /// the request
    pub unanswered: Vec<PeerId>,
    /// Replies of the peers in `ok`
    pub replies: Vec<Message>,
}

impl FanoutReport {
    /// Every target answered as expected
    pub fn all_ok(&self) -> bool {
        self.failed.is_empty()
    }

    /// Reason of the first failure
    pub fn first_error(&self) -> Option<&str> {
        self.failed.first().map(|(_, reason)| reason.as_str())
    }
}

/// The same message for every target
pub fn to_all(targets: &[PeerId], msg: &Message) -> Vec<(PeerId, Message)> {
    targets.iter().map(|peer| (*peer, msg.clone())).collect()
}

/// Send every request concurrently and wait for all of them, each bounded
/// by `timeout`. A reply counts as success when it carries `expect` and no
/// error text.
pub async fn broadcast(
    overlay: &dyn Overlay,
    sends: Vec<(PeerId, Message)>,
    expect: TransactionState,
    timeout: Duration,
) -> FanoutReport {
    let requests = sends.into_iter().map(|(peer, msg)| async move {
        let result = overlay.request(peer, msg, timeout).await;
        (peer, result)
    });

    let mut report = FanoutReport::default();
    for (peer, result) in join_all(requests).await {
        match result {
            Ok(reply) if reply.tr_state() == expect && reply.error_text().is_none() => {
                report.ok.push(peer);
                report.replies.push(reply);
            }
            Ok(reply) => {
                let reason = reply.error_text().unwrap_or_else(|| {
                    Error::peer(format!("answered {} instead of {expect}", reply.tr_state()))
                        .to_string()
                });
                debug!(peer = %peer.short(), "Fan-out step failed: {}", reason);
                report.failed.push((peer, reason));
            }
            Err(e) => {
                if matches!(e, Error::TimedOut(_)) {
                    report.unanswered.push(peer);
                }
                let reason = match e {
                    Error::TimedOut(_) | Error::PeerFailure(_) => e.to_string(),
                    other => Error::peer(other.to_string()).to_string(),
                };
                debug!(peer = %peer.short(), "Fan-out request failed: {}", reason);
                report.failed.push((peer, reason));
            }
        }
    }
    report
}
