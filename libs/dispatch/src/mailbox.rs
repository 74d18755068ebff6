//! Mailbox table
//!
//! One process-wide map from [`ActorId`] to delivery policy. Entries are
//! created when an entity is marked addressable and removed when the entity
//! or its fiber goes away; the table installs a disposal hook on each fiber
//! the first time one of its entities registers, so fiber teardown purges
//! every mailbox the fiber owned.

use crate::error::{DispatchError, Result};
use bytes::Bytes;
use codec::MessageEnvelope;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use runtime::Fiber;
use std::sync::{Arc, Weak};
use tracing::debug;
use types::{ActorId, Address, FiberId, InstanceId};

/// Sink a gate-session mailbox forwards raw message bytes into.
pub type SessionSender = tokio::sync::mpsc::UnboundedSender<Bytes>;

/// Custom raw-dispatch hook, for actors that do their own routing.
pub trait RawDispatch: Send + Sync {
    fn dispatch(&self, target: ActorId, envelope: MessageEnvelope);
}

/// Delivery discipline for one actor's inbound messages.
#[derive(Clone)]
pub enum MailboxPolicy {
    /// Strict per-actor serial handling, serialized via the coroutine lock.
    Ordered,
    /// Direct invocation; concurrent messages may interleave.
    Unordered,
    /// Forward the raw message unmodified to a network session.
    GateSession(SessionSender),
    /// Hand the decoded envelope to a custom hook.
    Dispatcher(Arc<dyn RawDispatch>),
}

impl std::fmt::Debug for MailboxPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ordered => write!(f, "Ordered"),
            Self::Unordered => write!(f, "Unordered"),
            Self::GateSession(_) => write!(f, "GateSession"),
            Self::Dispatcher(_) => write!(f, "Dispatcher"),
        }
    }
}

struct TableInner {
    entries: DashMap<ActorId, MailboxPolicy>,
    hooked_fibers: DashMap<FiberId, ()>,
}

/// Process-wide mailbox registrations.
#[derive(Clone)]
pub struct MailboxTable {
    inner: Arc<TableInner>,
}

impl MailboxTable {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TableInner {
                entries: DashMap::new(),
                hooked_fibers: DashMap::new(),
            }),
        }
    }

    /// Mark an entity on `fiber` actor-addressable.
    pub fn register(
        &self,
        fiber: &Arc<Fiber>,
        instance_id: InstanceId,
        policy: MailboxPolicy,
    ) -> Result<ActorId> {
        let actor = ActorId::new(Address::new(fiber.process_id, fiber.id), instance_id);

        if self.inner.hooked_fibers.insert(fiber.id, ()).is_none() {
            let weak: Weak<TableInner> = Arc::downgrade(&self.inner);
            fiber.on_dispose(move |fiber_id| {
                if let Some(inner) = weak.upgrade() {
                    inner
                        .entries
                        .retain(|actor, _| actor.address.fiber_id != fiber_id);
                    inner.hooked_fibers.remove(&fiber_id);
                    debug!(fiber = fiber_id, "purged mailboxes for disposed fiber");
                }
            });
        }

        // Entry keeps the existence check and the insert under one shard
        // lock, so racing registrations cannot both claim the actor.
        match self.inner.entries.entry(actor) {
            Entry::Occupied(_) => Err(DispatchError::DuplicateMailbox(actor)),
            Entry::Vacant(slot) => {
                debug!(%actor, ?policy, "mailbox registered");
                slot.insert(policy);
                Ok(actor)
            }
        }
    }

    /// Remove an actor's mailbox when the entity is destroyed.
    pub fn remove(&self, actor: &ActorId) -> bool {
        self.inner.entries.remove(actor).is_some()
    }

    pub fn get(&self, actor: &ActorId) -> Option<MailboxPolicy> {
        self.inner.entries.get(actor).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }
}

impl Default for MailboxTable {
    fn default() -> Self {
        Self::new()
    }
}
