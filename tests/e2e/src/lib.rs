//! Shared harness for the end-to-end tests
//!
//! A [`Node`] is one simulated process: a fiber runtime, a dispatcher, and
//! a channel service on one datagram endpoint. [`Node::serve`] bridges the
//! two halves the way a real server does: every accepted channel gets a
//! worker task that decodes inbound actor frames and feeds them to the
//! dispatcher, with replies going back down the same channel.

use codec::{ActorFrame, MessageEnvelope};
use dispatch::{DispatchConfig, Dispatcher, ReplySink};
use network::{ChannelHandle, ChannelService, MemoryDatagram, ServiceConfig, TransportEvent};
use runtime::{RuntimeConfig, RuntimeContext};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;
use types::ProcessId;

pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

/// One simulated process wired end to end.
pub struct Node {
    pub ctx: Arc<RuntimeContext>,
    pub dispatcher: Dispatcher,
    pub service: Arc<ChannelService>,
}

impl Node {
    pub fn new(
        process_id: ProcessId,
        socket: MemoryDatagram,
        dispatch_config: DispatchConfig,
    ) -> anyhow::Result<(Self, mpsc::UnboundedReceiver<TransportEvent>)> {
        let ctx = RuntimeContext::current(process_id, RuntimeConfig::default());
        let dispatcher = Dispatcher::new(ctx.clone(), dispatch_config);
        let (service, events) = ChannelService::new(Arc::new(socket), ServiceConfig::default())?;
        Ok((
            Self {
                ctx,
                dispatcher,
                service,
            },
            events,
        ))
    }

    /// Accept loop: every inbound channel gets a dispatcher worker.
    pub fn serve(&self, mut events: mpsc::UnboundedReceiver<TransportEvent>) -> JoinHandle<()> {
        let dispatcher = self.dispatcher.clone();
        let service = self.service.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let TransportEvent::Accepted(handle) = event {
                    spawn_channel_worker(dispatcher.clone(), service.clone(), handle);
                }
            }
        })
    }

    pub fn shutdown(&self) {
        self.service.shutdown();
        self.ctx.shutdown();
    }
}

struct ChannelReplySink {
    service: Arc<ChannelService>,
    channel: u32,
}

impl ReplySink for ChannelReplySink {
    fn reply(&self, envelope: MessageEnvelope) {
        if let Err(e) = self.service.send(self.channel, &envelope.encode()) {
            warn!(channel = self.channel, %e, "reply dropped");
        }
    }
}

/// Pump one channel into the dispatcher until it disconnects. An
/// undecodable frame is fatal for the carrying channel.
pub fn spawn_channel_worker(
    dispatcher: Dispatcher,
    service: Arc<ChannelService>,
    mut handle: ChannelHandle,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let sink: Arc<dyn ReplySink> = Arc::new(ChannelReplySink {
            service,
            channel: handle.id(),
        });
        loop {
            let raw = match handle.recv().await {
                Ok(raw) => raw,
                Err(_) => break,
            };
            match ActorFrame::decode(&raw) {
                Ok(frame) => dispatcher.dispatch(frame, sink.clone()),
                Err(e) => {
                    warn!(channel = handle.id(), %e, "undecodable actor frame");
                    handle.dispose();
                    break;
                }
            }
        }
    })
}
