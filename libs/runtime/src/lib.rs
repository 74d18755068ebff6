//! # Weft Concurrency Runtime
//!
//! Independent, single-threaded-semantics execution contexts ("fibers") and
//! the coordination primitives built around them.
//!
//! - [`executor`]: the per-fiber task queue. Continuations posted from any
//!   thread always run on the owning fiber; futures spawned on a fiber
//!   resume on that same fiber, never cross-fiber.
//! - [`fiber`]: one execution context — id, owning process, timer registry,
//!   disposal hooks, and the `is_running` guard that keeps one fiber off two
//!   OS threads.
//! - [`scheduler`]: three interchangeable strategies for mapping fibers onto
//!   OS threads (shared cooperative loop, thread per fiber, fixed pool).
//! - [`registry`]: process-wide fiber lifecycle. Creation and removal both
//!   run their critical section on the target fiber's own executor.
//! - [`lock`]: the coroutine lock — asynchronous, keyed, FIFO mutual
//!   exclusion with a fail-open timeout.
//! - [`context`]: the explicitly constructed [`RuntimeContext`] that wires
//!   the above together. There are no process-wide singletons; independent
//!   runtimes can coexist in one test process.

pub mod context;
pub mod error;
pub mod executor;
pub mod fiber;
pub mod lock;
pub mod registry;
pub mod scheduler;

pub use context::{RuntimeConfig, RuntimeContext};
pub use error::{Result, RuntimeError};
pub use executor::Executor;
pub use fiber::Fiber;
pub use lock::{LockGuard, LockStats, LockTable, LOCK_CLASS_MAILBOX};
pub use registry::FiberRegistry;
pub use scheduler::{Schedule, SchedulerKind};
