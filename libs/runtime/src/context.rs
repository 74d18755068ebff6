//! Runtime context
//!
//! Weft has no process-wide singletons: every component receives an
//! explicitly constructed [`RuntimeContext`] holding the lock table, the
//! fiber registry, and the tokio handle that drives timers. Multiple
//! independent contexts can coexist in one process, which is how the
//! integration tests run two "processes" side by side.

use crate::lock::LockTable;
use crate::registry::FiberRegistry;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use types::ProcessId;

/// Runtime construction knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Worker threads in the pool scheduler.
    pub pool_workers: usize,
    /// Scheduler tick interval in milliseconds.
    pub tick_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            pool_workers: 4,
            tick_ms: 1,
        }
    }
}

/// Explicitly wired runtime state for one process.
pub struct RuntimeContext {
    process_id: ProcessId,
    handle: Handle,
    locks: LockTable,
    fibers: Arc<FiberRegistry>,
}

impl RuntimeContext {
    /// Build a context. `handle` must belong to a runtime with the time
    /// driver enabled; it drives coroutine-lock timeouts.
    pub fn new(process_id: ProcessId, handle: Handle, config: RuntimeConfig) -> Arc<Self> {
        let tick = Duration::from_millis(config.tick_ms);
        Arc::new(Self {
            process_id,
            locks: LockTable::new(handle.clone()),
            fibers: FiberRegistry::new(process_id, config.pool_workers, tick),
            handle,
        })
    }

    /// Convenience for code already inside a tokio runtime.
    pub fn current(process_id: ProcessId, config: RuntimeConfig) -> Arc<Self> {
        Self::new(process_id, Handle::current(), config)
    }

    pub fn process_id(&self) -> ProcessId {
        self.process_id
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn locks(&self) -> &LockTable {
        &self.locks
    }

    pub fn fibers(&self) -> &Arc<FiberRegistry> {
        &self.fibers
    }

    /// Stop scheduler threads and drop all fibers.
    pub fn shutdown(&self) {
        self.fibers.dispose();
    }
}
