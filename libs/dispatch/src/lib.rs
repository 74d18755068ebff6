//! # Weft Mailbox Dispatch
//!
//! Routes decoded inbound actor messages to their handlers while enforcing
//! each actor's delivery policy.
//!
//! - [`mailbox`]: the process-wide mailbox table. Marking an entity
//!   actor-addressable registers a [`MailboxPolicy`]; destroying its fiber
//!   purges the entries automatically.
//! - [`handler`]: the explicit opcode → handler registration table, built
//!   once at startup. No runtime type scanning.
//! - [`dispatcher`]: the entry point the transport feeds decoded frames
//!   into. Ordered actors are serialized through the coroutine lock
//!   (class [`runtime::LOCK_CLASS_MAILBOX`], key = instance id) so message
//!   N+1 cannot start before message N's handler logically finishes, even
//!   across suspension points. Unresolvable targets become synthesized
//!   negative acknowledgements for requests, log-and-drop for
//!   fire-and-forget.

pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod mailbox;

pub use dispatcher::{DispatchConfig, DispatchStats, Dispatcher, ReplySink};
pub use error::{DispatchError, Result};
pub use handler::{HandlerRegistry, MessageHandler};
pub use mailbox::{MailboxPolicy, MailboxTable, RawDispatch, SessionSender};
