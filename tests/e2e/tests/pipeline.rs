//! Transport → dispatch → fiber pipeline tests

use async_trait::async_trait;
use bytes::Bytes;
use codec::{ActorFrame, MessageEnvelope};
use dispatch::{DispatchConfig, MailboxPolicy, MessageHandler};
use network::{ChannelService, MemoryDatagram, ServiceConfig};
use parking_lot::Mutex;
use runtime::SchedulerKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use types::ActorId;
use weft_e2e_tests::{init_tracing, Node};

const OP_PING: u16 = 10;
const OP_JOURNAL: u16 = 11;
const OP_STALL: u16 = 12;

struct Pong;

#[async_trait]
impl MessageHandler for Pong {
    async fn handle(
        &self,
        _target: ActorId,
        _envelope: MessageEnvelope,
    ) -> dispatch::Result<Option<Bytes>> {
        Ok(Some(Bytes::from_static(b"pong")))
    }
}

#[tokio::test]
async fn ping_request_crosses_transport_and_replies() -> anyhow::Result<()> {
    init_tracing();
    let (cs, ss) = MemoryDatagram::pair();
    let (server, server_events) = Node::new(2, ss, DispatchConfig::default())?;

    let fiber_id = server
        .ctx
        .fibers()
        .create(SchedulerKind::Shared, 0, "game")
        .await?;
    let fiber = server.ctx.fibers().get(fiber_id).unwrap();
    server.dispatcher.handlers().register(OP_PING, Arc::new(Pong));
    let actor = server
        .dispatcher
        .mailboxes()
        .register(&fiber, 7, MailboxPolicy::Unordered)?;

    let _accepts = server.serve(server_events);
    let _server_driver = server.service.spawn_driver(Duration::from_millis(2));

    let (client, _client_events) =
        ChannelService::new(Arc::new(cs), ServiceConfig::default())?;
    let mut handle = client.connect(server.service.local_addr())?;
    let _client_driver = client.spawn_driver(Duration::from_millis(2));

    let request = ActorFrame::new(
        actor,
        MessageEnvelope::new(OP_PING, 1, Bytes::from_static(b"ping"))?,
    );
    handle.send(&request.encode())?;

    let raw = timeout(Duration::from_secs(5), handle.recv()).await??;
    let reply = MessageEnvelope::decode(&raw)?;
    assert_eq!(reply.opcode, OP_PING);
    assert_eq!(reply.rpc_id, 1);
    assert_eq!(&reply.payload[..], b"pong");

    client.shutdown();
    server.shutdown();
    Ok(())
}

/// Appends each notify's payload byte after a suspension point; a "flush"
/// request replies with everything recorded so far.
struct Recorder {
    log: Arc<Mutex<Vec<u8>>>,
}

#[async_trait]
impl MessageHandler for Recorder {
    async fn handle(
        &self,
        _target: ActorId,
        envelope: MessageEnvelope,
    ) -> dispatch::Result<Option<Bytes>> {
        if envelope.payload.as_ref() == b"flush" {
            return Ok(Some(Bytes::from(self.log.lock().clone())));
        }
        tokio::task::yield_now().await;
        self.log.lock().push(envelope.payload[0]);
        Ok(None)
    }
}

#[tokio::test]
async fn ordered_actor_preserves_arrival_order_across_suspension() -> anyhow::Result<()> {
    init_tracing();
    let (cs, ss) = MemoryDatagram::pair();
    let (server, server_events) = Node::new(2, ss, DispatchConfig::default())?;

    let fiber_id = server
        .ctx
        .fibers()
        .create(SchedulerKind::Pool, 0, "journal")
        .await?;
    let fiber = server.ctx.fibers().get(fiber_id).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    server
        .dispatcher
        .handlers()
        .register(OP_JOURNAL, Arc::new(Recorder { log }));
    let actor = server
        .dispatcher
        .mailboxes()
        .register(&fiber, 1, MailboxPolicy::Ordered)?;

    let _accepts = server.serve(server_events);
    let _server_driver = server.service.spawn_driver(Duration::from_millis(2));

    let (client, _client_events) =
        ChannelService::new(Arc::new(cs), ServiceConfig::default())?;
    let mut handle = client.connect(server.service.local_addr())?;
    let _client_driver = client.spawn_driver(Duration::from_millis(2));

    for n in 1..=5u8 {
        let frame = ActorFrame::new(actor, MessageEnvelope::notify(OP_JOURNAL, Bytes::from(vec![n])));
        handle.send(&frame.encode())?;
    }
    let flush = ActorFrame::new(
        actor,
        MessageEnvelope::new(OP_JOURNAL, 1, Bytes::from_static(b"flush"))?,
    );
    handle.send(&flush.encode())?;

    let raw = timeout(Duration::from_secs(5), handle.recv()).await??;
    let reply = MessageEnvelope::decode(&raw)?;
    assert_eq!(&reply.payload[..], &[1, 2, 3, 4, 5]);

    client.shutdown();
    server.shutdown();
    Ok(())
}

/// Blocks forever on "block", replies "ok" to anything else.
struct Stall {
    gate: Arc<Semaphore>,
}

#[async_trait]
impl MessageHandler for Stall {
    async fn handle(
        &self,
        _target: ActorId,
        envelope: MessageEnvelope,
    ) -> dispatch::Result<Option<Bytes>> {
        if envelope.payload.as_ref() == b"block" {
            let _ = self.gate.acquire().await;
            return Ok(None);
        }
        Ok(Some(Bytes::from_static(b"ok")))
    }
}

#[tokio::test]
async fn stalled_ordered_handler_times_out_and_traffic_resumes() -> anyhow::Result<()> {
    init_tracing();
    let (cs, ss) = MemoryDatagram::pair();
    let config = DispatchConfig {
        ordered_lock_timeout_ms: Some(100),
    };
    let (server, server_events) = Node::new(2, ss, config)?;

    let fiber_id = server
        .ctx
        .fibers()
        .create(SchedulerKind::Shared, 0, "stall")
        .await?;
    let fiber = server.ctx.fibers().get(fiber_id).unwrap();
    let gate = Arc::new(Semaphore::new(0));
    server
        .dispatcher
        .handlers()
        .register(OP_STALL, Arc::new(Stall { gate: gate.clone() }));
    let actor = server
        .dispatcher
        .mailboxes()
        .register(&fiber, 3, MailboxPolicy::Ordered)?;

    let _accepts = server.serve(server_events);
    let _server_driver = server.service.spawn_driver(Duration::from_millis(2));

    let (client, _client_events) =
        ChannelService::new(Arc::new(cs), ServiceConfig::default())?;
    let mut handle = client.connect(server.service.local_addr())?;
    let _client_driver = client.spawn_driver(Duration::from_millis(2));

    let block = ActorFrame::new(actor, MessageEnvelope::notify(OP_STALL, Bytes::from_static(b"block")));
    handle.send(&block.encode())?;
    let probe = ActorFrame::new(
        actor,
        MessageEnvelope::new(OP_STALL, 1, Bytes::from_static(b"probe"))?,
    );
    handle.send(&probe.encode())?;

    // The mailbox lock force-advances past the stalled handler.
    let raw = timeout(Duration::from_secs(5), handle.recv()).await??;
    let reply = MessageEnvelope::decode(&raw)?;
    assert_eq!(reply.rpc_id, 1);
    assert_eq!(&reply.payload[..], b"ok");
    assert_eq!(server.ctx.locks().stats().timeouts, 1);

    // Unblock the stalled handler; its late release must be a silent no-op.
    gate.add_permits(1);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.ctx.locks().stats().timeouts, 1);

    client.shutdown();
    server.shutdown();
    Ok(())
}
