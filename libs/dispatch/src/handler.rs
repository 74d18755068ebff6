//! Handler registration
//!
//! An explicit opcode → handler table built once at startup. Handlers are
//! async and run with the owning fiber's affinity; a request handler
//! returns `Ok(Some(payload))` to produce a correlated reply.

use crate::error::{DispatchError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use codec::MessageEnvelope;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::warn;
use types::{ActorId, Opcode};

/// One message handler. Implementations are registered per opcode.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, target: ActorId, envelope: MessageEnvelope) -> Result<Option<Bytes>>;
}

/// Opcode-keyed handler table.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<DashMap<Opcode, Arc<dyn MessageHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Replacing an existing registration is almost
    /// always a startup wiring bug, so it is loud.
    pub fn register(&self, opcode: Opcode, handler: Arc<dyn MessageHandler>) {
        if self.handlers.insert(opcode, handler).is_some() {
            warn!(opcode, "handler registration replaced an existing handler");
        }
    }

    pub fn get(&self, opcode: Opcode) -> Result<Arc<dyn MessageHandler>> {
        self.handlers
            .get(&opcode)
            .map(|h| h.value().clone())
            .ok_or(DispatchError::HandlerMissing(opcode))
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
