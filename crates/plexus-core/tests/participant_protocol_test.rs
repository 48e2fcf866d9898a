//! Participant steps driven over the overlay by a bare endpoint
//!
//! The driver is an overlay endpoint with no node behind it. It sends
//! transaction steps to a single node the way a leader would.

use plexus_core::overlay::{LocalNetwork, LocalOverlay, Overlay};
use plexus_core::service::TransactionConfig;
use plexus_core::testing::{FaultyHandler, RecordingListener, TestRecord, init_tracing, wait_until};
use plexus_core::{CacheService, Error, Node, PlexusConfig, ServiceHandler};
use plexus_protocol::{
    Action, Message, PeerId, ServiceKey, TransactionHeader, TransactionState,
};
use std::sync::Arc;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(2);

struct Harness {
    network: LocalNetwork,
    driver: Arc<LocalOverlay>,
    node: Node,
    cache: Arc<CacheService<TestRecord>>,
    faults: Arc<FaultyHandler>,
    service: ServiceKey,
}

async fn harness() -> Harness {
    init_tracing();
    let network = LocalNetwork::new();
    let node_id = PeerId::random();
    let node = Node::start(network.join(node_id), PlexusConfig::fast().with_sync(false)).unwrap();
    let service = ServiceKey::new("Tests", 0);
    let cache = Arc::new(
        CacheService::new(service.clone(), node_id)
            .with_transactions(TransactionConfig::full())
            .with_listener(Arc::new(RecordingListener::default()), 64)
            .unwrap(),
    );
    let faults = Arc::new(FaultyHandler::new(cache.clone()));
    let handler: Arc<dyn ServiceHandler> = faults.clone();
    node.activate(service.clone(), handler).await.unwrap();

    Harness {
        driver: network.join(PeerId::random()),
        network,
        node,
        cache,
        faults,
        service,
    }
}

impl Harness {
    fn message(&self, action: Action, record: &TestRecord, timeout_ms: i64) -> Message {
        Message::new(self.driver.local_id(), self.service.clone(), action)
            .with_elements(record.elements())
            .with_transaction(TransactionHeader::new(timeout_ms))
    }

    async fn step(&self, msg: &Message, state: TransactionState) -> Message {
        self.driver
            .request(self.node.id(), msg.with_tr_state(state, true), TIMEOUT)
            .await
            .unwrap()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_commit_and_rollback_steps() {
    let h = harness().await;
    let tx = h.message(Action::Post, &TestRecord::new("a", 1), 60_000);
    let id = tx.transaction.as_ref().unwrap().id;

    assert_eq!(h.step(&tx, TransactionState::Create).await.tr_state(), TransactionState::Created);
    assert_eq!(h.step(&tx, TransactionState::Lock).await.tr_state(), TransactionState::Locked);
    assert_eq!(h.node.locked_transaction(&h.service), Some(id));

    let committed = h.step(&tx, TransactionState::Commit).await;
    assert_eq!(committed.tr_state(), TransactionState::Committed);
    assert_eq!(committed.elements.items[0]["MyInt"], 1);
    assert_eq!(h.cache.cache().get_by_key("a").unwrap(), TestRecord::new("a", 1));

    let undone = h.step(&tx, TransactionState::Rollback).await;
    assert_eq!(undone.tr_state(), TransactionState::Rollbacked);
    assert!(h.cache.cache().is_empty());

    assert_eq!(h.step(&tx, TransactionState::Cleanup).await.tr_state(), TransactionState::Finished);
    assert_eq!(h.node.locked_transaction(&h.service), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rollback_restores_overwritten_record() {
    let h = harness().await;
    h.cache
        .cache()
        .post(&TestRecord::new("a", 1), false)
        .unwrap();

    let tx = h.message(Action::Post, &TestRecord::new("a", 2), 60_000);
    h.step(&tx, TransactionState::Create).await;
    h.step(&tx, TransactionState::Lock).await;
    h.step(&tx, TransactionState::Commit).await;
    assert_eq!(h.cache.cache().get_by_key("a").unwrap().my_int, Some(2));

    h.step(&tx, TransactionState::Rollback).await;
    assert_eq!(h.cache.cache().get_by_key("a").unwrap(), TestRecord::new("a", 1));
    h.step(&tx, TransactionState::Finish).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_second_lock_fails_until_release() {
    let h = harness().await;
    let first = h.message(Action::Post, &TestRecord::new("a", 1), 60_000);
    let second = h.message(Action::Post, &TestRecord::new("b", 1), 60_000);
    h.step(&first, TransactionState::Create).await;
    h.step(&second, TransactionState::Create).await;

    assert_eq!(h.step(&first, TransactionState::Lock).await.tr_state(), TransactionState::Locked);
    let refused = h.step(&second, TransactionState::Lock).await;
    assert_eq!(refused.tr_state(), TransactionState::LockFailed);
    assert!(refused.error_text().unwrap().starts_with("Lock failed"));

    // committing without the lock is refused too
    let stray = h.step(&second, TransactionState::Commit).await;
    assert_eq!(stray.tr_state(), TransactionState::Errored);

    assert_eq!(h.step(&first, TransactionState::Finish).await.tr_state(), TransactionState::Finished);
    assert_eq!(h.step(&second, TransactionState::Lock).await.tr_state(), TransactionState::Locked);
    assert_eq!(
        h.step(&second, TransactionState::Commit).await.tr_state(),
        TransactionState::Committed
    );
    h.step(&second, TransactionState::Cleanup).await;
    assert_eq!(h.cache.cache().cache().keys(), vec!["b".to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_expired_commit_times_out() {
    let h = harness().await;
    let tx = h.message(Action::Post, &TestRecord::new("late", 1), 1);
    h.step(&tx, TransactionState::Create).await;
    h.step(&tx, TransactionState::Lock).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let reply = h.step(&tx, TransactionState::Commit).await;
    assert_eq!(reply.tr_state(), TransactionState::Errored);
    assert!(reply.error_text().unwrap().starts_with("Timed out"));
    assert!(h.cache.cache().is_empty());

    // cleanup is idempotent
    for _ in 0..2 {
        let done = h.step(&tx, TransactionState::Cleanup).await;
        assert_eq!(done.tr_state(), TransactionState::Finished);
    }
    assert_eq!(h.node.locked_transaction(&h.service), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_start_on_the_leader_runs_the_transaction() {
    let h = harness().await;
    assert_eq!(
        h.node.wait_for_leader(&h.service, Duration::from_secs(5)).await,
        Some(h.node.id())
    );

    let tx = h.message(Action::Post, &TestRecord::new("a", 1), 60_000);
    h.step(&tx, TransactionState::Create).await;
    let reply = h.step(&tx, TransactionState::Start).await;
    assert_eq!(reply.tr_state(), TransactionState::Committed);
    assert_eq!(h.cache.cache().get_by_key("a").unwrap(), TestRecord::new("a", 1));
    assert_eq!(h.node.locked_transaction(&h.service), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unexpected_step_is_a_protocol_error() {
    let h = harness().await;
    let tx = h.message(Action::Post, &TestRecord::new("a", 1), 60_000);
    let reply = h.step(&tx, TransactionState::Queued).await;
    assert_eq!(reply.tr_state(), TransactionState::Errored);
    assert!(reply.error_text().unwrap().starts_with("Protocol error"));

    let rollback = h.step(&tx, TransactionState::Rollback).await;
    assert_eq!(rollback.tr_state(), TransactionState::Errored);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_read_waits_no_longer_than_the_commit_deadline() {
    let h = harness().await;
    h.cache.cache().post(&TestRecord::new("a", 1), false).unwrap();

    // locked and then abandoned by its coordinator
    let tx = h.message(Action::Put, &TestRecord::new("a", 2), 300);
    h.step(&tx, TransactionState::Create).await;
    h.step(&tx, TransactionState::Lock).await;

    let found = tokio::time::timeout(
        Duration::from_secs(3),
        h.node.get(&h.service, TestRecord::key("a").elements()),
    )
    .await
    .expect("read stuck behind an expired lock")
    .unwrap();
    assert_eq!(found.items[0]["MyInt"], 1);
    assert_eq!(h.node.locked_transaction(&h.service), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_departed_coordinator_releases_the_lock() {
    let h = harness().await;
    let tx = h.message(Action::Post, &TestRecord::new("a", 1), 60_000);
    h.step(&tx, TransactionState::Create).await;
    h.step(&tx, TransactionState::Lock).await;
    assert!(h.node.locked_transaction(&h.service).is_some());

    assert!(h.network.disconnect(h.driver.local_id()));
    assert!(wait_until(TIMEOUT, || h.node.locked_transaction(&h.service).is_none()).await);

    let missing = tokio::time::timeout(
        Duration::from_secs(1),
        h.node.get(&h.service, TestRecord::key("a").elements()),
    )
    .await
    .expect("read stuck behind a departed coordinator");
    assert!(matches!(missing, Err(Error::NotFound(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_finish_undoes_an_abandoned_commit() {
    let h = harness().await;
    let tx = h.message(Action::Post, &TestRecord::new("a", 1), 60_000);
    h.step(&tx, TransactionState::Create).await;
    h.step(&tx, TransactionState::Lock).await;
    assert_eq!(h.step(&tx, TransactionState::Commit).await.tr_state(), TransactionState::Committed);

    // Finish without Cleanup means the leader failed the transaction
    assert_eq!(h.step(&tx, TransactionState::Finish).await.tr_state(), TransactionState::Finished);
    assert!(h.cache.cache().is_empty());
    assert_eq!(h.node.locked_transaction(&h.service), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rollback_waits_for_a_slow_commit() {
    let h = harness().await;
    h.faults.set_delay(Duration::from_millis(400));
    let tx = h.message(Action::Post, &TestRecord::new("a", 1), 60_000);
    h.step(&tx, TransactionState::Create).await;
    h.step(&tx, TransactionState::Lock).await;

    let commit = {
        let driver = h.driver.clone();
        let node = h.node.id();
        let msg = tx.with_tr_state(TransactionState::Commit, true);
        tokio::spawn(async move { driver.request(node, msg, TIMEOUT).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.cache.cache().is_empty());

    let undone = h.step(&tx, TransactionState::Rollback).await;
    assert_eq!(undone.tr_state(), TransactionState::Rollbacked);
    let committed = commit.await.unwrap().unwrap();
    assert_eq!(committed.tr_state(), TransactionState::Committed);
    assert!(h.cache.cache().is_empty());
    assert_eq!(h.faults.commits(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rollback_before_commit_has_nothing_to_undo() {
    let h = harness().await;
    h.cache.cache().post(&TestRecord::new("a", 1), false).unwrap();
    let tx = h.message(Action::Put, &TestRecord::new("a", 2), 60_000);
    h.step(&tx, TransactionState::Create).await;
    h.step(&tx, TransactionState::Lock).await;

    let undone = h.step(&tx, TransactionState::Rollback).await;
    assert_eq!(undone.tr_state(), TransactionState::Rollbacked);
    assert_eq!(h.cache.cache().get_by_key("a").unwrap(), TestRecord::new("a", 1));
    h.step(&tx, TransactionState::Finish).await;
    assert_eq!(h.cache.cache().get_by_key("a").unwrap(), TestRecord::new("a", 1));
}
