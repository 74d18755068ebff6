//! Fiber registry
//!
//! Process-wide fiber lifecycle. Creation inserts the fiber into the map
//! and its scheduler, then posts an initialization continuation onto the
//! new fiber's own executor and resolves only after it ran — init code
//! always has correct thread affinity. Removal mirrors this: teardown runs
//! on the fiber's executor so it cannot race a handler already in flight.

use crate::error::{Result, RuntimeError};
use crate::fiber::Fiber;
use crate::scheduler::{
    DedicatedScheduler, PoolScheduler, Schedule, SchedulerKind, SharedScheduler,
};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info};
use types::{FiberId, ProcessId};

/// Process-wide map from fiber id to fiber, plus the three scheduler
/// strategies fibers can be assigned to.
pub struct FiberRegistry {
    process_id: ProcessId,
    fibers: DashMap<FiberId, Arc<Fiber>>,
    next_id: AtomicU32,
    shared: SharedScheduler,
    dedicated: DedicatedScheduler,
    pool: PoolScheduler,
}

impl FiberRegistry {
    pub fn new(process_id: ProcessId, pool_workers: usize, tick: Duration) -> Arc<Self> {
        Arc::new(Self {
            process_id,
            fibers: DashMap::new(),
            next_id: AtomicU32::new(1),
            shared: SharedScheduler::new(tick),
            dedicated: DedicatedScheduler::new(tick),
            pool: PoolScheduler::new(pool_workers, tick),
        })
    }

    fn scheduler(&self, kind: SchedulerKind) -> &dyn Schedule {
        match kind {
            SchedulerKind::Shared => &self.shared,
            SchedulerKind::Dedicated => &self.dedicated,
            SchedulerKind::Pool => &self.pool,
        }
    }

    fn alloc_id(&self) -> Result<FiberId> {
        // Ids wrap within u16 and skip 0 and any id still mapped.
        for _ in 0..=u16::MAX as u32 {
            let id = (self.next_id.fetch_add(1, Ordering::Relaxed) % (u16::MAX as u32 + 1)) as u16;
            if id == 0 {
                continue;
            }
            if !self.fibers.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(RuntimeError::FiberIdsExhausted)
    }

    /// Create a fiber and resolve once its init continuation has run on the
    /// fiber's own executor.
    pub async fn create(&self, kind: SchedulerKind, zone: u16, name: &str) -> Result<FiberId> {
        self.create_with_init(kind, zone, name, |_| Ok(())).await
    }

    /// As [`create`](Self::create), with an initialization body that runs
    /// with the new fiber's thread affinity. An `Err` from init disposes
    /// the half-built fiber and surfaces as [`RuntimeError::InitFailed`].
    pub async fn create_with_init<F>(
        &self,
        kind: SchedulerKind,
        zone: u16,
        name: &str,
        init: F,
    ) -> Result<FiberId>
    where
        F: FnOnce(&Arc<Fiber>) -> std::result::Result<(), String> + Send + 'static,
    {
        let id = self.alloc_id()?;
        let fiber = Fiber::new(id, self.process_id, zone, name);
        self.fibers.insert(id, fiber.clone());
        self.scheduler(kind).add(fiber.clone());

        let (tx, rx) = oneshot::channel();
        let init_fiber = fiber.clone();
        fiber.post(move || {
            let outcome = init(&init_fiber);
            if outcome.is_err() {
                init_fiber.dispose_on_self();
            }
            let _ = tx.send(outcome);
        });

        match rx
            .await
            .map_err(|_| RuntimeError::Canceled("fiber init dropped"))?
        {
            Ok(()) => {
                info!(fiber = id, zone, name, ?kind, "fiber created");
                Ok(id)
            }
            Err(message) => {
                self.fibers.remove(&id);
                Err(RuntimeError::InitFailed(message))
            }
        }
    }

    /// Remove a fiber. Teardown (dispose flag, timer clear, disposal hooks)
    /// runs on the fiber's own executor before the id is unmapped.
    pub async fn remove(&self, id: FiberId) -> Result<()> {
        let fiber = self
            .fibers
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(RuntimeError::FiberNotFound(id))?;
        if fiber.is_disposed() {
            self.fibers.remove(&id);
            return Err(RuntimeError::FiberDisposed(id));
        }

        let (tx, rx) = oneshot::channel();
        let target = fiber.clone();
        fiber.post(move || {
            target.dispose_on_self();
            let _ = tx.send(());
        });
        rx.await
            .map_err(|_| RuntimeError::Canceled("fiber teardown dropped"))?;
        self.fibers.remove(&id);
        debug!(fiber = id, "fiber removed");
        Ok(())
    }

    pub fn get(&self, id: FiberId) -> Option<Arc<Fiber>> {
        self.fibers.get(&id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.fibers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fibers.is_empty()
    }

    /// Stop all scheduler threads and drop every fiber.
    pub fn dispose(&self) {
        self.shared.dispose();
        self.dedicated.dispose();
        self.pool.dispose();
        self.fibers.clear();
    }
}
