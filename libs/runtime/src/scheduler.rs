//! Scheduler strategies
//!
//! Three interchangeable ways of mapping fibers onto OS threads. All of
//! them run one fiber tick as `update()` then `late_update()` under the
//! fiber's running guard; a fiber whose guard is already taken is skipped
//! (or re-enqueued), never blocked on.

use crate::fiber::Fiber;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::debug;

/// Which strategy a fiber is assigned to at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerKind {
    /// One shared thread round-robins all fibers.
    Shared,
    /// One dedicated OS thread per fiber.
    Dedicated,
    /// Fixed worker pool greedily picks up non-running fibers.
    Pool,
}

/// Work-assignment strategy.
pub trait Schedule: Send + Sync {
    fn add(&self, fiber: Arc<Fiber>);
    fn dispose(&self);
}

fn run_tick(fiber: &Fiber) {
    if fiber.try_begin_run() {
        fiber.update();
        fiber.late_update();
        fiber.end_run();
    }
}

/// One process-wide loop iterating all registered fibers per tick.
pub struct SharedScheduler {
    fibers: Arc<Mutex<Vec<Weak<Fiber>>>>,
    stop: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SharedScheduler {
    pub fn new(tick: Duration) -> Self {
        let fibers: Arc<Mutex<Vec<Weak<Fiber>>>> = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));
        let loop_fibers = fibers.clone();
        let loop_stop = stop.clone();
        let thread = std::thread::Builder::new()
            .name("weft-shared".into())
            .spawn(move || {
                while !loop_stop.load(Ordering::Acquire) {
                    let snapshot: Vec<Arc<Fiber>> = {
                        let mut list = loop_fibers.lock();
                        list.retain(|w| match w.upgrade() {
                            Some(f) => !f.is_disposed(),
                            None => false,
                        });
                        list.iter().filter_map(Weak::upgrade).collect()
                    };
                    for fiber in snapshot {
                        run_tick(&fiber);
                    }
                    std::thread::sleep(tick);
                }
            })
            .expect("spawn shared scheduler thread");
        Self {
            fibers,
            stop,
            thread: Mutex::new(Some(thread)),
        }
    }
}

impl Schedule for SharedScheduler {
    fn add(&self, fiber: Arc<Fiber>) {
        debug!(fiber = fiber.id, "added to shared scheduler");
        self.fibers.lock().push(Arc::downgrade(&fiber));
    }

    fn dispose(&self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

/// One dedicated OS thread per fiber. The thread exits when the fiber is
/// disposed or dropped from the registry.
pub struct DedicatedScheduler {
    tick: Duration,
    stop: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl DedicatedScheduler {
    pub fn new(tick: Duration) -> Self {
        Self {
            tick,
            stop: Arc::new(AtomicBool::new(false)),
            threads: Mutex::new(Vec::new()),
        }
    }
}

impl Schedule for DedicatedScheduler {
    fn add(&self, fiber: Arc<Fiber>) {
        let weak = Arc::downgrade(&fiber);
        let tick = self.tick;
        let stop = self.stop.clone();
        let name = format!("weft-fiber-{}", fiber.id);
        debug!(fiber = fiber.id, "added to dedicated scheduler");
        drop(fiber);
        let handle = std::thread::Builder::new()
            .name(name)
            .spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    let Some(fiber) = weak.upgrade() else {
                        break;
                    };
                    if fiber.is_disposed() {
                        break;
                    }
                    run_tick(&fiber);
                    drop(fiber);
                    std::thread::sleep(tick);
                }
            })
            .expect("spawn dedicated fiber thread");
        self.threads.lock().push(handle);
    }

    fn dispose(&self) {
        self.stop.store(true, Ordering::Release);
        for handle in self.threads.lock().drain(..) {
            let _ = handle.join();
        }
    }
}

/// Fixed pool of workers pulling fiber ids off a shared queue. A fiber whose
/// guard is taken is re-enqueued for another worker, never run twice at once.
pub struct PoolScheduler {
    tx: crossbeam_channel::Sender<Weak<Fiber>>,
    stop: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl PoolScheduler {
    pub fn new(workers: usize, tick: Duration) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded::<Weak<Fiber>>();
        let stop = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let rx = rx.clone();
            let tx = tx.clone();
            let stop = stop.clone();
            let handle = std::thread::Builder::new()
                .name(format!("weft-pool-{i}"))
                .spawn(move || loop {
                    if stop.load(Ordering::Acquire) {
                        break;
                    }
                    let weak = match rx.recv_timeout(tick) {
                        Ok(weak) => weak,
                        Err(_) => continue,
                    };
                    let Some(fiber) = weak.upgrade() else {
                        continue;
                    };
                    if fiber.is_disposed() {
                        continue;
                    }
                    run_tick(&fiber);
                    drop(fiber);
                    let _ = tx.send(weak);
                    std::thread::sleep(tick);
                })
                .expect("spawn pool worker thread");
            handles.push(handle);
        }
        Self {
            tx,
            stop,
            workers: Mutex::new(handles),
        }
    }
}

impl Schedule for PoolScheduler {
    fn add(&self, fiber: Arc<Fiber>) {
        debug!(fiber = fiber.id, "added to pool scheduler");
        let _ = self.tx.send(Arc::downgrade(&fiber));
    }

    fn dispose(&self) {
        self.stop.store(true, Ordering::Release);
        for handle in self.workers.lock().drain(..) {
            let _ = handle.join();
        }
    }
}
