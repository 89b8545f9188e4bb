//! Bounded pool of rendering engine instances
//!
//! Instances are launched lazily on demand, validated before every checkout,
//! retired once they have served `max_uses` sessions, and evicted after sitting
//! idle for `idle_timeout_ms` while more than `min` are alive. At most `max`
//! instances exist at any time; callers beyond that wait in FIFO order.
//!
//! All bookkeeping lives behind the pool's own lock. Engine calls (`launch`,
//! `close`) always happen outside of it.

use crate::engine::{InstanceFactory, RenderingInstance};
use crate::{Error, Result};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Pool sizing and retirement policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    /// Instances kept alive even when idle
    pub min: usize,
    /// Hard upper bound on live instances
    pub max: usize,
    /// Sessions an instance may serve before it is retired
    pub max_uses: u32,
    /// Idle time after which instances above `min` are closed (0 disables eviction)
    pub idle_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min: 0,
            max: num_cpus::get().clamp(1, 4),
            max_uses: 1,
            idle_timeout_ms: 30_000,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max == 0 {
            return Err(Error::ConfigError("pool max must be at least 1".into()));
        }
        if self.min > self.max {
            return Err(Error::ConfigError(format!(
                "pool min ({}) exceeds max ({})",
                self.min, self.max
            )));
        }
        if self.max_uses == 0 {
            return Err(Error::ConfigError("pool max_uses must be at least 1".into()));
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

/// Caller-supplied health predicate run before an idle instance is handed out
pub type Validator = Arc<dyn Fn(&dyn RenderingInstance) -> bool + Send + Sync>;

/// Snapshot of pool occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub live: usize,
    pub idle: usize,
    pub max: usize,
    pub closed: bool,
}

struct Idle {
    id: u64,
    uses: u32,
    instance: Arc<dyn RenderingInstance>,
    since: Instant,
}

#[derive(Default)]
struct Slots {
    idle: VecDeque<Idle>,
    live: HashMap<u64, Arc<dyn RenderingInstance>>,
}

struct Shared {
    factory: Arc<dyn InstanceFactory>,
    validator: Validator,
    config: OnceLock<PoolConfig>,
    permits: OnceLock<Arc<Semaphore>>,
    slots: Mutex<Slots>,
    next_id: AtomicU64,
    closed: AtomicBool,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn config(&self) -> &PoolConfig {
        self.config.get_or_init(PoolConfig::default)
    }

    fn permits(&self) -> &Arc<Semaphore> {
        self.permits
            .get_or_init(|| Arc::new(Semaphore::new(self.config().max)))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn validate(&self, instance: &dyn RenderingInstance, uses: u32) -> bool {
        uses < self.config().max_uses && (self.validator)(instance)
    }

    /// Forget `id` and close its instance; close failures are only logged.
    async fn destroy(&self, id: u64) {
        let instance = self.slots().live.remove(&id);
        if let Some(instance) = instance {
            debug!("Closing rendering instance {}", id);
            if let Err(e) = instance.close().await {
                warn!("Failed to close rendering instance {}: {}", id, e);
            }
        }
    }

    async fn check_in(&self, id: u64, uses: u32, instance: Arc<dyn RenderingInstance>) {
        let retire = {
            let mut slots = self.slots();
            let retire = self.is_closed() || uses >= self.config().max_uses || !slots.live.contains_key(&id);
            if !retire {
                slots.idle.push_back(Idle {
                    id,
                    uses,
                    instance,
                    since: Instant::now(),
                });
            }
            retire
        };
        if retire {
            self.destroy(id).await;
        }
    }

    async fn evict_idle(&self) {
        let config = self.config();
        let timeout = config.idle_timeout();
        let expired = {
            let mut slots = self.slots();
            let mut surplus = slots.live.len().saturating_sub(config.min);
            let mut expired = Vec::new();
            slots.idle.retain(|idle| {
                if surplus > 0 && idle.since.elapsed() >= timeout {
                    surplus -= 1;
                    expired.push(idle.id);
                    false
                } else {
                    true
                }
            });
            expired
        };
        for id in expired {
            debug!("Evicting idle rendering instance {}", id);
            self.destroy(id).await;
        }
    }
}

/// Shared handle to an instance pool
///
/// Cloning is cheap; all clones refer to the same set of instances.
#[derive(Clone)]
pub struct InstancePool {
    shared: Arc<Shared>,
}

impl InstancePool {
    /// Create a pool whose validator only checks [`RenderingInstance::is_alive`].
    ///
    /// Nothing is launched until the first `acquire`.
    pub fn new(factory: Arc<dyn InstanceFactory>) -> Self {
        Self::with_validator(factory, Arc::new(|instance: &dyn RenderingInstance| instance.is_alive()))
    }

    pub fn with_validator(factory: Arc<dyn InstanceFactory>, validator: Validator) -> Self {
        Self {
            shared: Arc::new(Shared {
                factory,
                validator,
                config: OnceLock::new(),
                permits: OnceLock::new(),
                slots: Mutex::new(Slots::default()),
                next_id: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                reaper: Mutex::new(None),
            }),
        }
    }

    /// Set the pool policy.
    ///
    /// Allowed once, before first use. Afterwards the configuration is frozen
    /// and this returns [`Error::ConfigLocked`].
    pub fn configure(&self, config: PoolConfig) -> Result<()> {
        config.validate()?;
        self.shared.config.set(config).map_err(|_| Error::ConfigLocked)
    }

    pub fn status(&self) -> PoolStatus {
        let slots = self.shared.slots();
        PoolStatus {
            live: slots.live.len(),
            idle: slots.idle.len(),
            max: self.shared.config.get().map(|c| c.max).unwrap_or_else(|| PoolConfig::default().max),
            closed: self.shared.is_closed(),
        }
    }

    /// Whether an instance that has served `uses` sessions may be handed out again
    pub fn validate(&self, instance: &dyn RenderingInstance, uses: u32) -> bool {
        self.shared.validate(instance, uses)
    }

    /// Check out an instance, waiting for capacity if the pool is saturated.
    pub async fn acquire(&self) -> Result<Lease> {
        self.acquire_until(None).await
    }

    /// Like [`acquire`](Self::acquire), but gives up waiting for capacity once
    /// `cancel` fires. A launch already in progress is not interrupted.
    pub async fn acquire_cancellable(&self, cancel: &CancellationToken) -> Result<Lease> {
        self.acquire_until(Some(cancel)).await
    }

    async fn acquire_until(&self, cancel: Option<&CancellationToken>) -> Result<Lease> {
        let shared = &self.shared;
        if shared.is_closed() {
            return Err(Error::PoolClosed);
        }
        self.ensure_reaper();

        let semaphore = shared.permits().clone();
        let permit = match cancel {
            Some(token) => tokio::select! {
                permit = semaphore.acquire_owned() => permit,
                _ = token.cancelled() => {
                    return Err(Error::Cancelled("cancelled while waiting for a rendering instance".into()));
                }
            },
            None => semaphore.acquire_owned().await,
        }
        .map_err(|_| Error::PoolClosed)?;

        loop {
            let candidate = shared.slots().idle.pop_back();
            let Some(idle) = candidate else { break };
            if shared.validate(idle.instance.as_ref(), idle.uses) {
                debug!("Reusing rendering instance {} (use {})", idle.id, idle.uses + 1);
                return Ok(self.lease(idle.id, idle.uses + 1, idle.instance, permit));
            }
            debug!("Discarding rendering instance {} after {} uses", idle.id, idle.uses);
            shared.destroy(idle.id).await;
        }

        let id = shared.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("Launching rendering instance {}", id);
        let instance = shared.factory.launch(id).await.map_err(|e| match e {
            Error::PoolCreationFailed(_) => e,
            other => Error::PoolCreationFailed(other.to_string()),
        })?;

        let registered = {
            let mut slots = shared.slots();
            if shared.is_closed() {
                false
            } else {
                slots.live.insert(id, instance.clone());
                true
            }
        };
        if !registered {
            if let Err(e) = instance.close().await {
                warn!("Failed to close rendering instance {}: {}", id, e);
            }
            return Err(Error::PoolClosed);
        }

        Ok(self.lease(id, 1, instance, permit))
    }

    fn lease(
        &self,
        id: u64,
        uses: u32,
        instance: Arc<dyn RenderingInstance>,
        permit: OwnedSemaphorePermit,
    ) -> Lease {
        Lease {
            id,
            uses,
            instance,
            permit: Some(permit),
            pool: Arc::downgrade(&self.shared),
            returned: false,
        }
    }

    /// Return a checked-out instance. Retired or invalid instances are closed.
    pub async fn release(&self, mut lease: Lease) {
        lease.returned = true;
        let permit = lease.permit.take();
        let handle = lease.handle();
        drop(lease);

        self.shared
            .check_in(handle.id, handle.uses, handle.instance)
            .await;
        // the slot is only handed to a waiter once the instance is back in the idle list
        drop(permit);
    }

    /// Acquire an instance, run `f` with it, and release it whatever `f` returns.
    pub async fn with_instance<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(InstanceHandle) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let lease = self.acquire().await?;
        let outcome = f(lease.handle()).await;
        self.release(lease).await;
        outcome
    }

    /// Close every instance, including checked-out ones, and refuse further use.
    ///
    /// Idempotent. Requests still holding an instance fail on their next call.
    pub async fn drain_and_close(&self) {
        let shared = &self.shared;
        if shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(semaphore) = shared.permits.get() {
            semaphore.close();
        }
        if let Some(reaper) = shared
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            reaper.abort();
        }

        let instances: Vec<_> = {
            let mut slots = shared.slots();
            slots.idle.clear();
            slots.live.drain().collect()
        };
        debug!("Draining {} rendering instances", instances.len());
        for (id, instance) in instances {
            if let Err(e) = instance.close().await {
                warn!("Failed to close rendering instance {}: {}", id, e);
            }
        }
    }

    fn ensure_reaper(&self) {
        let config = self.shared.config();
        if config.idle_timeout_ms == 0 {
            return;
        }
        let mut reaper = self
            .shared
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if reaper.is_some() || self.shared.is_closed() {
            return;
        }

        let period = (config.idle_timeout() / 2).max(Duration::from_millis(10));
        let weak = Arc::downgrade(&self.shared);
        *reaper = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(shared) = weak.upgrade() else { break };
                if shared.is_closed() {
                    break;
                }
                shared.evict_idle().await;
            }
        }));
    }
}

/// Identity and instance of a checkout, passed to [`InstancePool::with_instance`]
#[derive(Clone)]
pub struct InstanceHandle {
    pub id: u64,
    /// Sessions served including the current one
    pub uses: u32,
    pub instance: Arc<dyn RenderingInstance>,
}

/// An instance checked out of the pool
///
/// Must be given back with [`InstancePool::release`]. A lease dropped without
/// being released has its instance closed in the background.
pub struct Lease {
    id: u64,
    uses: u32,
    instance: Arc<dyn RenderingInstance>,
    permit: Option<OwnedSemaphorePermit>,
    pool: Weak<Shared>,
    returned: bool,
}

impl Lease {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn uses(&self) -> u32 {
        self.uses
    }

    pub fn instance(&self) -> &Arc<dyn RenderingInstance> {
        &self.instance
    }

    pub fn handle(&self) -> InstanceHandle {
        InstanceHandle {
            id: self.id,
            uses: self.uses,
            instance: self.instance.clone(),
        }
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.id)
            .field("uses", &self.uses)
            .finish_non_exhaustive()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.returned {
            return;
        }
        let Some(shared) = self.pool.upgrade() else {
            return;
        };
        let id = self.id;
        // the slot stays taken until the instance is gone
        let permit = self.permit.take();
        warn!("Rendering instance {} dropped without release; discarding it", id);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    shared.destroy(id).await;
                    drop(permit);
                });
            }
            Err(_) => {
                shared.slots().live.remove(&id);
                drop(permit);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Session;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct StubInstance {
        alive: AtomicBool,
    }

    #[async_trait]
    impl RenderingInstance for StubInstance {
        async fn open_session(&self) -> Result<Box<dyn Session>> {
            Err(Error::RenderError("stub has no sessions".into()))
        }

        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        async fn close(&self) -> Result<()> {
            self.alive.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct StubFactory {
        launched: AtomicUsize,
        fail: AtomicBool,
        instances: Mutex<Vec<Arc<StubInstance>>>,
    }

    #[async_trait]
    impl InstanceFactory for StubFactory {
        async fn launch(&self, _id: u64) -> Result<Arc<dyn RenderingInstance>> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::RenderError("no browser".into()));
            }
            self.launched.fetch_add(1, Ordering::SeqCst);
            let instance = Arc::new(StubInstance {
                alive: AtomicBool::new(true),
            });
            self.instances.lock().unwrap().push(instance.clone());
            Ok(instance)
        }
    }

    fn pool_with(config: PoolConfig) -> (InstancePool, Arc<StubFactory>) {
        let factory = Arc::new(StubFactory::default());
        let pool = InstancePool::new(factory.clone());
        pool.configure(config).unwrap();
        (pool, factory)
    }

    fn config(max: usize, max_uses: u32) -> PoolConfig {
        PoolConfig {
            min: 0,
            max,
            max_uses,
            idle_timeout_ms: 0,
        }
    }

    #[tokio::test]
    async fn nothing_launches_before_first_acquire() {
        let (pool, factory) = pool_with(config(2, 1));
        assert_eq!(factory.launched.load(Ordering::SeqCst), 0);
        assert_eq!(pool.status().live, 0);
    }

    #[tokio::test]
    async fn single_use_instances_are_retired() {
        let (pool, factory) = pool_with(config(1, 1));
        let first = pool.acquire().await.unwrap();
        let first_id = first.id();
        pool.release(first).await;

        let second = pool.acquire().await.unwrap();
        assert_ne!(second.id(), first_id);
        pool.release(second).await;

        assert_eq!(factory.launched.load(Ordering::SeqCst), 2);
        let instances = factory.instances.lock().unwrap();
        assert!(instances.iter().all(|i| !i.alive.load(Ordering::SeqCst)));
    }

    #[tokio::test]
    async fn instances_are_reused_until_max_uses() {
        let (pool, factory) = pool_with(config(1, 3));
        let mut ids = Vec::new();
        for _ in 0..4 {
            let lease = pool.acquire().await.unwrap();
            ids.push((lease.id(), lease.uses()));
            pool.release(lease).await;
        }
        assert_eq!(ids, [(1, 1), (1, 2), (1, 3), (2, 1)]);
        assert_eq!(factory.launched.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failing_validator_replaces_instance() {
        let factory = Arc::new(StubFactory::default());
        let pool = InstancePool::new(factory.clone());
        pool.configure(config(1, 10)).unwrap();

        let lease = pool.acquire().await.unwrap();
        let stale = lease.id();
        pool.release(lease).await;
        factory.instances.lock().unwrap()[0]
            .alive
            .store(false, Ordering::SeqCst);

        let lease = pool.acquire().await.unwrap();
        assert_ne!(lease.id(), stale);
        assert_eq!(pool.status().live, 1);
        pool.release(lease).await;
    }

    #[tokio::test]
    async fn creation_failure_propagates_and_frees_capacity() {
        let (pool, factory) = pool_with(config(1, 1));
        factory.fail.store(true, Ordering::SeqCst);
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, Error::PoolCreationFailed(_)));

        factory.fail.store(false, Ordering::SeqCst);
        let lease = pool.acquire().await.unwrap();
        pool.release(lease).await;
    }

    #[tokio::test]
    async fn configuration_is_frozen_after_first_use() {
        let pool = InstancePool::new(Arc::new(StubFactory::default()));
        let lease = pool.acquire().await.unwrap();
        pool.release(lease).await;
        assert_eq!(pool.configure(config(2, 1)), Err(Error::ConfigLocked));
    }

    #[tokio::test]
    async fn configuration_is_set_once() {
        let (pool, _) = pool_with(config(2, 1));
        assert_eq!(pool.configure(config(3, 1)), Err(Error::ConfigLocked));
    }

    #[test]
    fn invalid_configuration_is_rejected() {
        let pool = InstancePool::new(Arc::new(StubFactory::default()));
        let bad = PoolConfig {
            min: 3,
            max: 2,
            ..config(2, 1)
        };
        assert!(matches!(pool.configure(bad), Err(Error::ConfigError(_))));
        assert!(matches!(pool.configure(config(0, 1)), Err(Error::ConfigError(_))));
        assert!(matches!(pool.configure(config(1, 0)), Err(Error::ConfigError(_))));
        assert!(pool.configure(config(1, 1)).is_ok());
    }

    #[tokio::test]
    async fn waiting_acquire_can_be_cancelled() {
        let (pool, _) = pool_with(config(1, 1));
        let held = pool.acquire().await.unwrap();

        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        let err = pool.acquire_cancellable(&token).await.unwrap_err();
        assert!(err.is_cancelled());

        pool.release(held).await;
    }

    #[tokio::test]
    async fn drain_closes_outstanding_instances_and_is_idempotent() {
        let (pool, factory) = pool_with(config(2, 5));
        let held = pool.acquire().await.unwrap();

        pool.drain_and_close().await;
        pool.drain_and_close().await;

        assert!(!held.instance().is_alive());
        assert_eq!(pool.acquire().await.unwrap_err(), Error::PoolClosed);
        pool.release(held).await;

        let status = pool.status();
        assert!(status.closed);
        assert_eq!(status.live, 0);
        assert_eq!(factory.launched.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn idle_instances_above_min_are_evicted() {
        let (pool, _) = pool_with(PoolConfig {
            min: 1,
            max: 2,
            max_uses: 10,
            idle_timeout_ms: 20,
        });
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        pool.release(a).await;
        pool.release(b).await;
        assert_eq!(pool.status().idle, 2);

        tokio::time::sleep(Duration::from_millis(150)).await;
        let status = pool.status();
        assert_eq!(status.live, 1);
        assert_eq!(status.idle, 1);
    }

    #[tokio::test]
    async fn with_instance_releases_on_error() {
        let (pool, _) = pool_with(config(1, 5));
        let result: Result<()> = pool
            .with_instance(|_| async { Err(Error::RenderError("boom".into())) })
            .await;
        assert!(result.is_err());
        assert_eq!(pool.status().idle, 1);

        let id = pool.with_instance(|h| async move { Ok(h.id) }).await.unwrap();
        assert_eq!(id, 1);
    }

    #[tokio::test]
    async fn dropped_lease_is_discarded() {
        let (pool, _) = pool_with(config(1, 5));
        let lease = pool.acquire().await.unwrap();
        drop(lease);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.status().live, 0);
        let lease = pool.acquire().await.unwrap();
        assert_eq!(lease.id(), 2);
        pool.release(lease).await;
    }

    #[tokio::test]
    async fn dropped_lease_holds_its_slot_until_closed() {
        let (pool, factory) = pool_with(config(1, 5));
        let lease = pool.acquire().await.unwrap();
        drop(lease);

        let lease = pool.acquire().await.unwrap();
        assert_eq!(lease.id(), 2);
        let instances = factory.instances.lock().unwrap().clone();
        assert_eq!(instances.len(), 2);
        assert!(!instances[0].alive.load(Ordering::SeqCst));
        assert_eq!(pool.status().live, 1);
        pool.release(lease).await;
    }
}
