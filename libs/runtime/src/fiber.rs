//! Fiber: one execution context
//!
//! A fiber owns an [`Executor`], a timer registry, and a disposal hook list.
//! All mutation of fiber-private state happens on the fiber's own executor;
//! the `running` guard is what schedulers use to guarantee a fiber is never
//! updated by two OS threads at once.

use crate::executor::Executor;
use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;
use types::{FiberId, ProcessId};

type Continuation = Box<dyn FnOnce() + Send + 'static>;

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    f: Continuation,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    // Reversed so the BinaryHeap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then(other.seq.cmp(&self.seq))
    }
}

/// One independently scheduled execution context.
pub struct Fiber {
    pub id: FiberId,
    pub process_id: ProcessId,
    pub zone: u16,
    pub name: String,
    executor: Arc<Executor>,
    timers: Mutex<BinaryHeap<TimerEntry>>,
    timer_seq: AtomicU64,
    disposal_hooks: Mutex<Vec<Box<dyn FnOnce(FiberId) + Send>>>,
    disposed: AtomicBool,
    running: AtomicBool,
}

impl Fiber {
    pub fn new(id: FiberId, process_id: ProcessId, zone: u16, name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id,
            process_id,
            zone,
            name: name.into(),
            executor: Executor::new(),
            timers: Mutex::new(BinaryHeap::new()),
            timer_seq: AtomicU64::new(0),
            disposal_hooks: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
            running: AtomicBool::new(false),
        })
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    /// Queue a continuation onto this fiber from any thread.
    pub fn post(&self, f: impl FnOnce() + Send + 'static) {
        self.executor.post(f);
    }

    /// Drive a future with this fiber's affinity.
    pub fn spawn(&self, fut: impl std::future::Future<Output = ()> + Send + 'static) {
        self.executor.spawn(fut);
    }

    /// Run `f` on this fiber after `delay`. Fires during a subsequent
    /// `update` tick, on this fiber's executor.
    pub fn schedule_after(&self, delay: Duration, f: impl FnOnce() + Send + 'static) {
        let entry = TimerEntry {
            deadline: Instant::now() + delay,
            seq: self.timer_seq.fetch_add(1, Ordering::Relaxed),
            f: Box::new(f),
        };
        self.timers.lock().push(entry);
    }

    /// Callback invoked on this fiber's executor during teardown. Used by
    /// the dispatch layer to drop this fiber's mailbox entries.
    pub fn on_dispose(&self, hook: impl FnOnce(FiberId) + Send + 'static) {
        self.disposal_hooks.lock().push(Box::new(hook));
    }

    /// Take the running guard. At most one thread holds it at a time.
    pub fn try_begin_run(&self) -> bool {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn end_run(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// One tick: fire due timers (posted so they run with everything else
    /// in queue order) and drain the executor.
    pub fn update(&self) {
        if self.is_disposed() {
            return;
        }
        let now = Instant::now();
        loop {
            let entry = {
                let mut timers = self.timers.lock();
                match timers.peek() {
                    Some(head) if head.deadline <= now => timers.pop(),
                    _ => None,
                }
            };
            match entry {
                Some(entry) => self.executor.post(entry.f),
                None => break,
            }
        }
        self.executor.drain();
    }

    /// Second drain of the tick, picking up continuations queued by update
    /// work so same-tick follow-ups do not wait a full tick.
    pub fn late_update(&self) {
        if self.is_disposed() {
            return;
        }
        self.executor.drain();
    }

    /// Teardown body. Must run on this fiber's own executor so it cannot
    /// race a handler mid-flight; [`FiberRegistry::remove`] posts it there.
    ///
    /// [`FiberRegistry::remove`]: crate::registry::FiberRegistry::remove
    pub fn dispose_on_self(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(fiber = self.id, name = %self.name, "fiber disposed");
        self.timers.lock().clear();
        let hooks = std::mem::take(&mut *self.disposal_hooks.lock());
        for hook in hooks {
            hook(self.id);
        }
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("process_id", &self.process_id)
            .field("zone", &self.zone)
            .field("name", &self.name)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
