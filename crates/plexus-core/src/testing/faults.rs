//! Handler wrapper that injects commit failures and slow commits

use crate::service::{RequestContext, ServiceHandler, TransactionConfig, WebService};
use crate::{Error, Result};
use async_trait::async_trait;
use plexus_protocol::{Elements, NotificationSet, PeerId, ServiceKey};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Wraps a handler; transaction commits can be made to fail or stall.
/// Rollbacks and direct calls always pass through.
pub struct FaultyHandler {
    inner: Arc<dyn ServiceHandler>,
    map_reduce: AtomicBool,
    fail_commits: AtomicBool,
    delay_ms: AtomicU64,
    commits: AtomicUsize,
    failures: AtomicUsize,
}

impl FaultyHandler {
    /// Wrap `inner`
    pub fn new(inner: Arc<dyn ServiceHandler>) -> Self {
        Self {
            inner,
            map_reduce: AtomicBool::new(false),
            fail_commits: AtomicBool::new(false),
            delay_ms: AtomicU64::new(0),
            commits: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
        }
    }

    /// Serve keyless reads on the leader by map-reduce
    pub fn set_map_reduce(&self, enabled: bool) {
        self.map_reduce.store(enabled, Ordering::SeqCst);
    }

    /// Make every following commit fail
    pub fn set_fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Hold every following commit for `delay`
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Commits applied
    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    /// Delivery failures reported through [`ServiceHandler::failed`]
    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }

    async fn before_write(&self, ctx: &RequestContext) -> Result<()> {
        if ctx.transaction.is_none() || ctx.rollback {
            return Ok(());
        }
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(Error::handler("injected commit failure"));
        }
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl ServiceHandler for FaultyHandler {
    async fn activate(&self, service: &ServiceKey, peer: PeerId) -> Result<()> {
        self.inner.activate(service, peer).await
    }

    async fn deactivate(&self) -> Result<()> {
        self.inner.deactivate().await
    }

    async fn post(&self, elements: Elements, ctx: &RequestContext) -> Result<Elements> {
        self.before_write(ctx).await?;
        self.inner.post(elements, ctx).await
    }

    async fn put(&self, elements: Elements, ctx: &RequestContext) -> Result<Elements> {
        self.before_write(ctx).await?;
        self.inner.put(elements, ctx).await
    }

    async fn patch(&self, elements: Elements, ctx: &RequestContext) -> Result<Elements> {
        self.before_write(ctx).await?;
        self.inner.patch(elements, ctx).await
    }

    async fn delete(&self, elements: Elements, ctx: &RequestContext) -> Result<Elements> {
        self.before_write(ctx).await?;
        self.inner.delete(elements, ctx).await
    }

    async fn get(&self, elements: Elements, ctx: &RequestContext) -> Result<Elements> {
        self.inner.get(elements, ctx).await
    }

    async fn failed(&self, elements: Elements, ctx: &RequestContext, msg: &str) -> Result<Elements> {
        self.failures.fetch_add(1, Ordering::SeqCst);
        self.inner.failed(elements, ctx, msg).await
    }

    fn transaction_config(&self) -> Option<TransactionConfig> {
        self.inner.transaction_config()
    }

    fn web_service(&self) -> Option<WebService> {
        self.inner.web_service()
    }

    fn key_of(&self, elements: &Elements) -> Result<String> {
        self.inner.key_of(elements)
    }

    fn is_map_reduce(&self) -> bool {
        self.map_reduce.load(Ordering::SeqCst) || self.inner.is_map_reduce()
    }

    fn merge(&self, parts: Vec<Elements>) -> Elements {
        self.inner.merge(parts)
    }

    async fn notify(&self, set: &NotificationSet) -> Result<()> {
        self.inner.notify(set).await
    }

    async fn sync(&self) -> Result<usize> {
        self.inner.sync().await
    }
}
