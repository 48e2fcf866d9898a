//! Plexus Core - replicated service framework
//!
//! This crate hosts services on a set of peers and keeps their data in
//! step:
//! - Cache engine with notifications, metadata buckets and planned queries
//! - Distributed cache that replays changes received from other peers
//! - Per-service bully leader election and a participant registry
//! - Leader-coordinated two-phase commit with rollback on failure
//! - Partitioned services placed through a replicated `Rep-<name>` index
//! - Catch-up of late joiners from the leader
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                   Node                       │
//! │   (activation, reads, writes, inbound)      │
//! └──────────────┬──────────────────────────────┘
//!                │
//! ┌──────────────┴──────────────────────────────┐
//! │     Transaction Engine  /  Recovery          │
//! │  (Create, Lock, Commit, Rollback, Cleanup)  │
//! └──────────────┬──────────────────────────────┘
//!                │
//! ┌──────────────┴──────────────────────────────┐
//! │  Election  │  Participants  │  Replication   │
//! └──────────────┬──────────────────────────────┘
//!                │
//! ┌──────────────┴──────────────────────────────┐
//! │   Service handlers over distributed caches   │
//! │     (cache engine, storage sinks, notifier)  │
//! └──────────────┬──────────────────────────────┘
//!                │
//! ┌──────────────┴──────────────────────────────┐
//! │     Overlay (unicast, multicast, request)    │
//! └─────────────────────────────────────────────┘
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod config;
pub mod dcache;
pub mod election;
pub mod error;
pub mod node;
pub mod overlay;
pub mod participants;
pub mod record;
pub mod replication;
pub mod service;
mod sync;
pub mod transaction;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use cache::{Cache, CacheIdentity, JsonFileStorage, MemoryStorage, NotificationListener, Page, Storage};
pub use config::PlexusConfig;
pub use dcache::DistributedCache;
pub use error::{Error, Result};
pub use node::Node;
pub use overlay::{InboundHandler, LocalNetwork, LocalOverlay, Overlay};
pub use record::{PrimaryKey, Record};
pub use replication::{ReplicationIndex, ReplicationService};
pub use service::{CacheService, RequestContext, ServiceHandler, TransactionConfig};
