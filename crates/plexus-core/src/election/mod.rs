//! Bully-style leader election, one instance per service
//!
//! The lowest peer id wins. [`Election`] is a pure state machine: every
//! input (an inbound message, a clock tick, a departure) returns the
//! messages to send, and the caller sends them after the state lock is
//! released. [`monitor::spawn_monitor`] drives the clock.
//!
//! ```text
//!            hold expires / leader lost
//!   Idle ───────────────────────────────► Electing
//!    ▲                                      │   │
//!    │ resign / departure                   │   │ no better candidate
//!    │                                      │   ▼    within election_timeout
//!  HasLeader ◄── announcement / heartbeat ──┘  IsLeader
//!        ▲                                      │
//!        └──── heartbeat from a lower id ───────┘
//! ```
//!
//! A joining peer first asks who leads (`LeaderQuery`) and waits one
//! election timeout before campaigning, so it follows a leader that is
//! already established instead of taking over.

pub mod monitor;

pub use monitor::{send_all, spawn_monitor};

use crate::config::ElectionConfig;
use parking_lot::Mutex;
use plexus_protocol::{Action, Message, PeerId, ServiceKey};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Local view of a service's leadership
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionState {
    /// No leader known, not campaigning
    Idle,
    /// Campaign in progress
    Electing,
    /// Local peer leads
    IsLeader,
    /// Another peer leads
    HasLeader,
}

/// A message the state machine wants sent
#[derive(Debug, Clone)]
pub enum Outbound {
    /// To every other peer
    Multicast(Message),
    /// To one peer
    Unicast(PeerId, Message),
}

#[derive(Debug)]
struct LeaderInfo {
    state: ElectionState,
    leader: Option<PeerId>,
    // last heartbeat received as follower, or sent as leader
    last_heartbeat: Instant,
    electing_since: Option<Instant>,
    got_response: bool,
    hold_until: Option<Instant>,
}

/// Leader election for one service
pub struct Election {
    service: ServiceKey,
    local: PeerId,
    config: ElectionConfig,
    info: Mutex<LeaderInfo>,
    leader_tx: watch::Sender<Option<PeerId>>,
}

impl Election {
    /// New, idle election
    pub fn new(service: ServiceKey, local: PeerId, config: ElectionConfig, now: Instant) -> Self {
        let (leader_tx, _) = watch::channel(None);
        Self {
            service,
            local,
            config,
            info: Mutex::new(LeaderInfo {
                state: ElectionState::Idle,
                leader: None,
                last_heartbeat: now,
                electing_since: None,
                got_response: false,
                hold_until: None,
            }),
            leader_tx,
        }
    }

    /// Ask who leads and hold off campaigning for one election timeout
    pub fn join(&self, now: Instant) -> Vec<Outbound> {
        let mut info = self.info.lock();
        info.hold_until = Some(now + self.config.election_timeout());
        vec![Outbound::Multicast(self.message(Action::LeaderQuery))]
    }

    /// Service this election is for
    pub fn service(&self) -> &ServiceKey {
        &self.service
    }

    /// Timing settings
    pub fn config(&self) -> &ElectionConfig {
        &self.config
    }

    /// Current leader
    pub fn leader(&self) -> Option<PeerId> {
        self.info.lock().leader
    }

    /// Whether the local peer leads
    pub fn is_leader(&self) -> bool {
        self.info.lock().state == ElectionState::IsLeader
    }

    /// Current state
    pub fn state(&self) -> ElectionState {
        self.info.lock().state
    }

    /// Leader changes
    pub fn subscribe(&self) -> watch::Receiver<Option<PeerId>> {
        self.leader_tx.subscribe()
    }

    /// Wait until some leader is known
    pub async fn wait_for_leader(&self, timeout: std::time::Duration) -> Option<PeerId> {
        let mut rx = self.leader_tx.subscribe();
        match tokio::time::timeout(timeout, rx.wait_for(Option::is_some)).await {
            Ok(Ok(leader)) => *leader,
            _ => None,
        }
    }

    /// Handle an election message
    pub fn handle(&self, msg: &Message, now: Instant) -> Vec<Outbound> {
        let sender = msg.source;
        if sender == self.local {
            return Vec::new();
        }
        let mut info = self.info.lock();
        let mut out = Vec::new();

        match msg.action {
            Action::ElectionRequest => {
                // the lower id outranks the candidate and tells it so
                if self.local < sender {
                    out.push(Outbound::Unicast(
                        sender,
                        self.message(Action::ElectionResponse),
                    ));
                    match info.state {
                        ElectionState::IsLeader => out.push(Outbound::Unicast(
                            sender,
                            self.message(Action::LeaderAnnouncement),
                        )),
                        ElectionState::Electing => {}
                        ElectionState::HasLeader if !self.heartbeat_lost(&info, now) => {}
                        _ => out.extend(self.start_election(&mut info, now)),
                    }
                } else if info.state == ElectionState::Electing {
                    // a better candidate is campaigning
                    info.got_response = true;
                }
            }
            Action::ElectionResponse => {
                if info.state == ElectionState::Electing {
                    info.got_response = true;
                }
            }
            Action::LeaderAnnouncement | Action::LeaderHeartbeat => {
                if info.state == ElectionState::IsLeader {
                    if sender < self.local {
                        info!(
                            service = %self.service,
                            leader = %sender.short(),
                            "Stepping down for a lower peer id"
                        );
                        self.adopt(&mut info, sender, now);
                    } else {
                        info.last_heartbeat = now;
                        out.push(Outbound::Multicast(
                            self.message(Action::LeaderAnnouncement),
                        ));
                    }
                } else {
                    self.adopt(&mut info, sender, now);
                }
            }
            Action::LeaderQuery => {
                if info.state == ElectionState::IsLeader {
                    out.push(Outbound::Unicast(
                        sender,
                        self.message(Action::LeaderAnnouncement),
                    ));
                }
            }
            Action::LeaderResign => {
                if info.leader == Some(sender) {
                    info!(service = %self.service, leader = %sender.short(), "Leader resigned");
                    self.clear_leader(&mut info);
                    out.extend(self.start_election(&mut info, now));
                }
            }
            Action::LeaderChallenge => match info.state {
                ElectionState::IsLeader => {
                    info.last_heartbeat = now;
                    out.push(Outbound::Multicast(self.message(Action::LeaderHeartbeat)));
                }
                ElectionState::Idle => out.extend(self.start_election(&mut info, now)),
                _ => {}
            },
            other => debug!(service = %self.service, "Ignoring {} in election", other),
        }
        out
    }

    /// Advance timers
    pub fn tick(&self, now: Instant) -> Vec<Outbound> {
        let mut info = self.info.lock();
        match info.state {
            ElectionState::IsLeader => {
                if now.saturating_duration_since(info.last_heartbeat)
                    >= self.config.heartbeat_period()
                {
                    info.last_heartbeat = now;
                    vec![Outbound::Multicast(self.message(Action::LeaderHeartbeat))]
                } else {
                    Vec::new()
                }
            }
            ElectionState::HasLeader => {
                if self.heartbeat_lost(&info, now) {
                    warn!(
                        service = %self.service,
                        leader = ?info.leader.map(|l| l.short()),
                        "Leader heartbeat lost"
                    );
                    self.clear_leader(&mut info);
                    self.start_election(&mut info, now)
                } else {
                    Vec::new()
                }
            }
            ElectionState::Electing => {
                let since = info.electing_since.unwrap_or(now);
                let elapsed = now.saturating_duration_since(since);
                let timeout = self.config.election_timeout();
                if !info.got_response && elapsed >= timeout {
                    self.become_leader(&mut info, now);
                    vec![Outbound::Multicast(
                        self.message(Action::LeaderAnnouncement),
                    )]
                } else if info.got_response && elapsed >= timeout * 2 {
                    // the better candidate never announced
                    self.start_election(&mut info, now)
                } else {
                    Vec::new()
                }
            }
            ElectionState::Idle => {
                if info.hold_until.is_none_or(|hold| now >= hold) {
                    self.start_election(&mut info, now)
                } else {
                    Vec::new()
                }
            }
        }
    }

    /// A peer left the overlay
    pub fn peer_departed(&self, peer: PeerId, now: Instant) -> Vec<Outbound> {
        let mut info = self.info.lock();
        if info.leader != Some(peer) || info.state == ElectionState::IsLeader {
            return Vec::new();
        }
        warn!(service = %self.service, leader = %peer.short(), "Leader departed");
        self.clear_leader(&mut info);
        self.start_election(&mut info, now)
    }

    /// Step down before leaving
    pub fn resign(&self, now: Instant) -> Vec<Outbound> {
        let mut info = self.info.lock();
        if info.state != ElectionState::IsLeader {
            return Vec::new();
        }
        info!(service = %self.service, "Resigning leadership");
        self.clear_leader(&mut info);
        info.hold_until = Some(now + self.config.election_timeout());
        vec![Outbound::Multicast(self.message(Action::LeaderResign))]
    }

    fn message(&self, action: Action) -> Message {
        Message::new(self.local, self.service.clone(), action)
    }

    fn heartbeat_lost(&self, info: &LeaderInfo, now: Instant) -> bool {
        now.saturating_duration_since(info.last_heartbeat) > self.config.heartbeat_timeout()
    }

    fn start_election(&self, info: &mut LeaderInfo, now: Instant) -> Vec<Outbound> {
        debug!(service = %self.service, peer = %self.local.short(), "Starting election");
        info.state = ElectionState::Electing;
        info.electing_since = Some(now);
        info.got_response = false;
        info.hold_until = None;
        vec![Outbound::Multicast(self.message(Action::ElectionRequest))]
    }

    fn become_leader(&self, info: &mut LeaderInfo, now: Instant) {
        info!(service = %self.service, peer = %self.local.short(), "Elected leader");
        info.state = ElectionState::IsLeader;
        info.leader = Some(self.local);
        info.last_heartbeat = now;
        info.electing_since = None;
        self.publish(Some(self.local));
    }

    fn adopt(&self, info: &mut LeaderInfo, leader: PeerId, now: Instant) {
        if info.leader != Some(leader) {
            info!(service = %self.service, leader = %leader.short(), "Following leader");
        }
        info.state = ElectionState::HasLeader;
        info.leader = Some(leader);
        info.last_heartbeat = now;
        info.electing_since = None;
        info.hold_until = None;
        self.publish(Some(leader));
    }

    fn clear_leader(&self, info: &mut LeaderInfo) {
        info.state = ElectionState::Idle;
        info.leader = None;
        self.publish(None);
    }

    fn publish(&self, leader: Option<PeerId>) {
        self.leader_tx.send_if_modified(|current| {
            if *current == leader {
                return false;
            }
            *current = leader;
            true
        });
    }
}
