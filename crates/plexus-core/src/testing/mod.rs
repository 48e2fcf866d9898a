//! Testing infrastructure for Plexus Core
//!
//! Shared by the unit tests and, through the `testing` feature, the
//! integration tests.
//!
//! - [`TestRecord`]: a record keyed by `MyString`
//! - [`RecordingListener`]: keeps every notification a cache emits
//! - [`FaultyHandler`]: makes commits fail or stall on one peer
//! - [`Cluster`]: several nodes on a [`crate::overlay::LocalNetwork`]
//!
//! # Usage
//!
//! ```rust,no_run
//! use plexus_core::PlexusConfig;
//! use plexus_core::service::TransactionConfig;
//! use plexus_core::testing::{Cluster, TestRecord};
//!
//! # async fn demo() -> plexus_core::Result<()> {
//! let cluster = Cluster::start(3, PlexusConfig::fast(), TransactionConfig::full()).await?;
//! let record = TestRecord::new("a", 1);
//! cluster.peer(1).node.post(&cluster.service, record.elements()).await?;
//! # Ok(())
//! # }
//! ```

mod cluster;
mod faults;
mod listener;
mod record;

pub use cluster::{Cluster, ClusterPeer, SETTLE_TIMEOUT};
pub use faults::FaultyHandler;
pub use listener::RecordingListener;
pub use record::{MyEnum, Nested, TestRecord};

use std::time::{Duration, Instant};

/// Poll `predicate` until it holds or `timeout` passes
pub async fn wait_until(timeout: Duration, predicate: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Blocking [`wait_until`] for synchronous tests
pub fn wait_until_sync(timeout: Duration, predicate: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Install a test-friendly subscriber once; `RUST_LOG` overrides the
/// default `plexus_core=warn`
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("plexus_core=warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
