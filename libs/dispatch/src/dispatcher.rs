//! Message dispatcher
//!
//! The transport feeds decoded [`ActorFrame`]s in here. Resolution walks
//! fiber → mailbox → policy, then the handler runs with the owning fiber's
//! affinity. Ordered actors take the mailbox coroutine lock first, so one
//! message's handler logically finishes before the next starts even when it
//! suspends. A request that cannot be delivered is answered with a
//! synthesized negative acknowledgement; an undeliverable fire-and-forget
//! message is logged and counted.

use crate::handler::HandlerRegistry;
use crate::mailbox::{MailboxPolicy, MailboxTable};
use bytes::{BufMut, BytesMut};
use codec::{ActorFrame, MessageEnvelope};
use runtime::{RuntimeContext, LOCK_CLASS_MAILBOX};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use types::{ActorId, ErrorCode, OPCODE_ERROR_RESPONSE};

/// Dispatcher knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Ordered-mailbox lock timeout in milliseconds. `None` waits forever.
    pub ordered_lock_timeout_ms: Option<u64>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            ordered_lock_timeout_ms: Some(10_000),
        }
    }
}

impl DispatchConfig {
    fn ordered_lock_timeout(&self) -> Option<Duration> {
        self.ordered_lock_timeout_ms.map(Duration::from_millis)
    }
}

/// Point-in-time dispatch counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Messages whose handler ran to completion.
    pub delivered: u64,
    /// Messages forwarded to a gate session or raw-dispatch hook.
    pub forwarded: u64,
    /// Requests answered with a synthesized error reply.
    pub nacked: u64,
    /// Fire-and-forget messages dropped with nowhere to go.
    pub dropped: u64,
}

#[derive(Default)]
struct StatCells {
    delivered: AtomicU64,
    forwarded: AtomicU64,
    nacked: AtomicU64,
    dropped: AtomicU64,
}

impl StatCells {
    fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            nacked: self.nacked.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Where synthesized and handler replies go, typically back down the
/// channel the frame arrived on.
pub trait ReplySink: Send + Sync {
    fn reply(&self, envelope: MessageEnvelope);
}

/// Routes inbound frames to mailboxes and handlers.
#[derive(Clone)]
pub struct Dispatcher {
    ctx: Arc<RuntimeContext>,
    mailboxes: MailboxTable,
    handlers: HandlerRegistry,
    config: DispatchConfig,
    stats: Arc<StatCells>,
}

impl Dispatcher {
    pub fn new(ctx: Arc<RuntimeContext>, config: DispatchConfig) -> Self {
        Self {
            ctx,
            mailboxes: MailboxTable::new(),
            handlers: HandlerRegistry::new(),
            config,
            stats: Arc::new(StatCells::default()),
        }
    }

    pub fn mailboxes(&self) -> &MailboxTable {
        &self.mailboxes
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats.snapshot()
    }

    /// Route one decoded frame. Never fails outward: misses become a
    /// negative acknowledgement (requests) or a counted drop (notifies).
    pub fn dispatch(&self, frame: ActorFrame, reply: Arc<dyn ReplySink>) {
        let target = frame.target;
        let envelope = frame.envelope;

        let Some(policy) = self.mailboxes.get(&target) else {
            let code = if self.ctx.fibers().get(target.address.fiber_id).is_some() {
                ErrorCode::MailboxMissing
            } else {
                ErrorCode::ActorNotFound
            };
            debug!(%target, opcode = envelope.opcode, ?code, "undeliverable message");
            nack_or_drop(&self.stats, reply.as_ref(), envelope.rpc_id, code);
            return;
        };

        match policy {
            MailboxPolicy::Ordered => {
                let Some(fiber) = self.ctx.fibers().get(target.address.fiber_id) else {
                    debug!(%target, "mailbox fiber gone before dispatch");
                    nack_or_drop(
                        &self.stats,
                        reply.as_ref(),
                        envelope.rpc_id,
                        ErrorCode::ActorNotFound,
                    );
                    return;
                };
                let locks = self.ctx.locks().clone();
                let handlers = self.handlers.clone();
                let stats = self.stats.clone();
                let timeout = self.config.ordered_lock_timeout();
                fiber.spawn(async move {
                    let key = target.instance_id as i64;
                    let guard = match locks.acquire(LOCK_CLASS_MAILBOX, key, timeout).await {
                        Ok(guard) => guard,
                        Err(err) => {
                            warn!(%target, %err, "mailbox lock unavailable");
                            nack_or_drop(
                                &stats,
                                reply.as_ref(),
                                envelope.rpc_id,
                                ErrorCode::LockTimeout,
                            );
                            return;
                        }
                    };
                    run_handler(&handlers, &stats, target, envelope, reply).await;
                    drop(guard);
                });
            }
            MailboxPolicy::Unordered => {
                let Some(fiber) = self.ctx.fibers().get(target.address.fiber_id) else {
                    debug!(%target, "mailbox fiber gone before dispatch");
                    nack_or_drop(
                        &self.stats,
                        reply.as_ref(),
                        envelope.rpc_id,
                        ErrorCode::ActorNotFound,
                    );
                    return;
                };
                let handlers = self.handlers.clone();
                let stats = self.stats.clone();
                fiber.spawn(async move {
                    run_handler(&handlers, &stats, target, envelope, reply).await;
                });
            }
            MailboxPolicy::GateSession(session) => {
                if session.send(envelope.encode()).is_ok() {
                    self.stats.forwarded.fetch_add(1, Ordering::Relaxed);
                } else {
                    debug!(%target, "gate session closed");
                    nack_or_drop(
                        &self.stats,
                        reply.as_ref(),
                        envelope.rpc_id,
                        ErrorCode::ChannelDisconnected,
                    );
                }
            }
            MailboxPolicy::Dispatcher(hook) => {
                hook.dispatch(target, envelope);
                self.stats.forwarded.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

async fn run_handler(
    handlers: &HandlerRegistry,
    stats: &StatCells,
    target: ActorId,
    envelope: MessageEnvelope,
    reply: Arc<dyn ReplySink>,
) {
    let opcode = envelope.opcode;
    let rpc_id = envelope.rpc_id;

    let handler = match handlers.get(opcode) {
        Ok(handler) => handler,
        Err(err) => {
            warn!(%target, opcode, %err, "no handler for inbound opcode");
            nack_or_drop(stats, reply.as_ref(), rpc_id, ErrorCode::HandlerMissing);
            return;
        }
    };

    match handler.handle(target, envelope).await {
        Ok(Some(payload)) if rpc_id != 0 => {
            reply.reply(MessageEnvelope {
                opcode,
                rpc_id,
                compressed: false,
                payload,
            });
            stats.delivered.fetch_add(1, Ordering::Relaxed);
        }
        Ok(returned) => {
            if returned.is_some() {
                debug!(%target, opcode, "handler returned a payload for a notify; dropped");
            }
            stats.delivered.fetch_add(1, Ordering::Relaxed);
        }
        Err(err) => {
            warn!(%target, opcode, %err, "handler failed");
            nack_or_drop(stats, reply.as_ref(), rpc_id, ErrorCode::HandlerFailed);
        }
    }
}

/// Requests get a negative acknowledgement carrying `code`; notifies are
/// counted and dropped.
fn nack_or_drop(stats: &StatCells, reply: &dyn ReplySink, rpc_id: u32, code: ErrorCode) {
    if rpc_id == 0 {
        stats.dropped.fetch_add(1, Ordering::Relaxed);
        return;
    }
    let mut payload = BytesMut::with_capacity(4);
    payload.put_u32_le(code as u32);
    reply.reply(MessageEnvelope {
        opcode: OPCODE_ERROR_RESPONSE,
        rpc_id,
        compressed: false,
        payload: payload.freeze(),
    });
    stats.nacked.fetch_add(1, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DispatchError, Result};
    use crate::handler::MessageHandler;
    use async_trait::async_trait;
    use bytes::Bytes;
    use runtime::{RuntimeConfig, SchedulerKind};
    use tokio::sync::{mpsc, Semaphore};
    use tokio::time::timeout;
    use types::Address;

    struct ChannelSink(mpsc::UnboundedSender<MessageEnvelope>);

    impl ReplySink for ChannelSink {
        fn reply(&self, envelope: MessageEnvelope) {
            let _ = self.0.send(envelope);
        }
    }

    fn sink() -> (Arc<dyn ReplySink>, mpsc::UnboundedReceiver<MessageEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(ChannelSink(tx)), rx)
    }

    struct Echo;

    #[async_trait]
    impl MessageHandler for Echo {
        async fn handle(
            &self,
            _target: ActorId,
            envelope: MessageEnvelope,
        ) -> Result<Option<Bytes>> {
            Ok(Some(envelope.payload))
        }
    }

    /// Reports "start <tag>"/"end <tag>" and blocks on the semaphore in
    /// between, so tests control exactly when a handler finishes.
    struct Gated {
        events: mpsc::UnboundedSender<String>,
        release: Arc<Semaphore>,
    }

    #[async_trait]
    impl MessageHandler for Gated {
        async fn handle(
            &self,
            _target: ActorId,
            envelope: MessageEnvelope,
        ) -> Result<Option<Bytes>> {
            let tag = String::from_utf8_lossy(&envelope.payload).into_owned();
            let _ = self.events.send(format!("start {tag}"));
            let permit = self
                .release
                .acquire()
                .await
                .map_err(|e| DispatchError::HandlerFailed(e.to_string()))?;
            permit.forget();
            let _ = self.events.send(format!("end {tag}"));
            Ok(None)
        }
    }

    async fn setup() -> (Arc<RuntimeContext>, Dispatcher, Arc<runtime::Fiber>) {
        let ctx = RuntimeContext::current(1, RuntimeConfig::default());
        let id = ctx
            .fibers()
            .create(SchedulerKind::Shared, 0, "dispatch-test")
            .await
            .unwrap();
        let fiber = ctx.fibers().get(id).unwrap();
        let dispatcher = Dispatcher::new(ctx.clone(), DispatchConfig::default());
        (ctx, dispatcher, fiber)
    }

    fn frame(actor: ActorId, opcode: u16, rpc_id: u32, payload: &'static [u8]) -> ActorFrame {
        ActorFrame::new(
            actor,
            MessageEnvelope::new(opcode, rpc_id, Bytes::from_static(payload)).unwrap(),
        )
    }

    #[tokio::test]
    async fn request_gets_correlated_echo_reply() {
        let (ctx, dispatcher, fiber) = setup().await;
        dispatcher.handlers().register(10, Arc::new(Echo));
        let actor = dispatcher
            .mailboxes()
            .register(&fiber, 42, MailboxPolicy::Unordered)
            .unwrap();

        let (reply, mut rx) = sink();
        dispatcher.dispatch(frame(actor, 10, 7, b"ping"), reply);

        let echoed = rx.recv().await.unwrap();
        assert_eq!(echoed.opcode, 10);
        assert_eq!(echoed.rpc_id, 7);
        assert_eq!(&echoed.payload[..], b"ping");
        assert_eq!(dispatcher.stats().delivered, 1);
        ctx.shutdown();
    }

    #[tokio::test]
    async fn ordered_mailbox_serializes_across_suspension() {
        let (ctx, dispatcher, fiber) = setup().await;
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let release = Arc::new(Semaphore::new(0));
        dispatcher.handlers().register(
            10,
            Arc::new(Gated {
                events: events_tx,
                release: release.clone(),
            }),
        );
        let actor = dispatcher
            .mailboxes()
            .register(&fiber, 1, MailboxPolicy::Ordered)
            .unwrap();

        let (reply, _rx) = sink();
        dispatcher.dispatch(frame(actor, 10, 0, b"a"), reply.clone());
        dispatcher.dispatch(frame(actor, 10, 0, b"b"), reply);

        assert_eq!(events.recv().await.unwrap(), "start a");
        // "a" is suspended and still holds the mailbox lock, so "b" must
        // not have started.
        assert!(timeout(Duration::from_millis(50), events.recv())
            .await
            .is_err());

        release.add_permits(1);
        assert_eq!(events.recv().await.unwrap(), "end a");
        assert_eq!(events.recv().await.unwrap(), "start b");
        release.add_permits(1);
        assert_eq!(events.recv().await.unwrap(), "end b");
        ctx.shutdown();
    }

    #[tokio::test]
    async fn unordered_mailbox_interleaves() {
        let (ctx, dispatcher, fiber) = setup().await;
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let release = Arc::new(Semaphore::new(0));
        dispatcher.handlers().register(
            10,
            Arc::new(Gated {
                events: events_tx,
                release: release.clone(),
            }),
        );
        let actor = dispatcher
            .mailboxes()
            .register(&fiber, 1, MailboxPolicy::Unordered)
            .unwrap();

        let (reply, _rx) = sink();
        dispatcher.dispatch(frame(actor, 10, 0, b"a"), reply.clone());
        dispatcher.dispatch(frame(actor, 10, 0, b"b"), reply);

        // Both handlers reach their suspension point while neither has
        // finished.
        let mut starts = vec![events.recv().await.unwrap(), events.recv().await.unwrap()];
        starts.sort();
        assert_eq!(starts, ["start a", "start b"]);

        release.add_permits(2);
        let mut ends = vec![events.recv().await.unwrap(), events.recv().await.unwrap()];
        ends.sort();
        assert_eq!(ends, ["end a", "end b"]);
        ctx.shutdown();
    }

    #[tokio::test]
    async fn unknown_actor_request_is_nacked() {
        let (ctx, dispatcher, _fiber) = setup().await;
        let ghost = ActorId::new(Address::new(1, 999), 5);

        let (reply, mut rx) = sink();
        dispatcher.dispatch(frame(ghost, 10, 3, b""), reply);

        let nack = rx.recv().await.unwrap();
        assert_eq!(nack.opcode, OPCODE_ERROR_RESPONSE);
        assert_eq!(nack.rpc_id, 3);
        let code = u32::from_le_bytes(nack.payload[..4].try_into().unwrap());
        assert_eq!(ErrorCode::from_u32(code), Some(ErrorCode::ActorNotFound));
        assert_eq!(dispatcher.stats().nacked, 1);
        ctx.shutdown();
    }

    #[tokio::test]
    async fn unknown_actor_notify_is_counted_and_dropped() {
        let (ctx, dispatcher, _fiber) = setup().await;
        let ghost = ActorId::new(Address::new(1, 999), 5);

        let (reply, mut rx) = sink();
        dispatcher.dispatch(frame(ghost, 10, 0, b""), reply);

        assert!(rx.try_recv().is_err());
        assert_eq!(dispatcher.stats().dropped, 1);
        ctx.shutdown();
    }

    #[tokio::test]
    async fn registered_fiber_without_mailbox_names_the_right_code() {
        let (ctx, dispatcher, fiber) = setup().await;
        // The fiber exists but instance 77 was never made addressable.
        let unmapped = ActorId::new(Address::new(1, fiber.id), 77);

        let (reply, mut rx) = sink();
        dispatcher.dispatch(frame(unmapped, 10, 9, b""), reply);

        let nack = rx.recv().await.unwrap();
        let code = u32::from_le_bytes(nack.payload[..4].try_into().unwrap());
        assert_eq!(ErrorCode::from_u32(code), Some(ErrorCode::MailboxMissing));
        ctx.shutdown();
    }

    #[tokio::test]
    async fn gate_session_receives_encoded_envelope() {
        let (ctx, dispatcher, fiber) = setup().await;
        let (session_tx, mut session_rx) = mpsc::unbounded_channel();
        let actor = dispatcher
            .mailboxes()
            .register(&fiber, 8, MailboxPolicy::GateSession(session_tx))
            .unwrap();

        let (reply, _rx) = sink();
        dispatcher.dispatch(frame(actor, 10, 0, b"fwd"), reply);

        let raw = session_rx.recv().await.unwrap();
        let inner = MessageEnvelope::decode(&raw).unwrap();
        assert_eq!(inner.opcode, 10);
        assert_eq!(&inner.payload[..], b"fwd");
        assert_eq!(dispatcher.stats().forwarded, 1);
        ctx.shutdown();
    }

    struct Failing;

    #[async_trait]
    impl MessageHandler for Failing {
        async fn handle(
            &self,
            _target: ActorId,
            _envelope: MessageEnvelope,
        ) -> Result<Option<Bytes>> {
            Err(DispatchError::HandlerFailed("boom".to_string()))
        }
    }

    #[tokio::test]
    async fn failed_handler_nacks_the_request() {
        let (ctx, dispatcher, fiber) = setup().await;
        dispatcher.handlers().register(10, Arc::new(Failing));
        let actor = dispatcher
            .mailboxes()
            .register(&fiber, 2, MailboxPolicy::Unordered)
            .unwrap();

        let (reply, mut rx) = sink();
        dispatcher.dispatch(frame(actor, 10, 4, b""), reply);

        let nack = rx.recv().await.unwrap();
        assert_eq!(nack.opcode, OPCODE_ERROR_RESPONSE);
        assert_eq!(nack.rpc_id, 4);
        let code = u32::from_le_bytes(nack.payload[..4].try_into().unwrap());
        assert_eq!(ErrorCode::from_u32(code), Some(ErrorCode::HandlerFailed));
        ctx.shutdown();
    }
}
