//! Per-fiber executor
//!
//! A thread-safe FIFO queue of continuations bound to one fiber.
//! [`Executor::post`] is safe from any thread; [`Executor::drain`] is called
//! only by whichever OS thread currently owns the fiber and runs everything
//! queued, catching panics per continuation so one bad handler cannot abort
//! the drain.
//!
//! A minimal task layer sits on top: [`Executor::spawn`] drives a future by
//! re-posting a poll continuation every time its waker fires, so every
//! resumption of that future happens back on this executor — the affinity
//! invariant that lets fiber code mutate its private state without locks.

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Wake, Waker};
use tracing::error;

type Continuation = Box<dyn FnOnce() + Send + 'static>;

/// Task queue bound to one fiber.
pub struct Executor {
    tx: Sender<Continuation>,
    rx: Receiver<Continuation>,
}

impl Executor {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = crossbeam_channel::unbounded();
        Arc::new(Self { tx, rx })
    }

    /// Queue a continuation. Callable from any thread.
    pub fn post(&self, f: impl FnOnce() + Send + 'static) {
        // Send only fails after the executor is dropped, which cannot be
        // observed through &self.
        let _ = self.tx.send(Box::new(f));
    }

    /// Run every queued continuation in FIFO order, including ones queued
    /// while draining. Returns the number run.
    pub fn drain(&self) -> usize {
        let mut ran = 0;
        while let Ok(f) = self.rx.try_recv() {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
                let msg = panic_message(&panic);
                error!(panic = %msg, "continuation panicked during drain");
            }
            ran += 1;
        }
        ran
    }

    /// Number of continuations currently queued.
    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    /// Drive a future on this executor. Every poll, including resumptions
    /// triggered by wakeups from other threads, runs on this executor.
    pub fn spawn(self: &Arc<Self>, fut: impl Future<Output = ()> + Send + 'static) {
        let task = Arc::new(Task {
            future: Mutex::new(Some(Box::pin(fut))),
            executor: Arc::downgrade(self),
        });
        let first = task.clone();
        self.post(move || first.poll_once());
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

struct Task {
    future: Mutex<Option<Pin<Box<dyn Future<Output = ()> + Send>>>>,
    executor: Weak<Executor>,
}

impl Task {
    fn poll_once(self: &Arc<Self>) {
        let waker = Waker::from(self.clone());
        let mut cx = Context::from_waker(&waker);
        let mut slot = self.future.lock();
        if let Some(fut) = slot.as_mut() {
            if let Poll::Ready(()) = fut.as_mut().poll(&mut cx) {
                *slot = None;
            }
        }
    }
}

impl Wake for Task {
    fn wake(self: Arc<Self>) {
        // Re-post onto the origin executor; if the executor is gone the
        // fiber was torn down and the task is abandoned with it.
        if let Some(executor) = self.executor.upgrade() {
            let task = self.clone();
            executor.post(move || task.poll_once());
        }
    }
}
