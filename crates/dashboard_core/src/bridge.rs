//! Bridge transports: outbound sends carry no delivery guarantee and inbound
//! traffic is an untyped broadcast of raw strings.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::protocol::OutboundEnvelope;
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::error::TransportError;

const INBOUND_CAPACITY: usize = 1024;

#[async_trait]
pub trait Bridge: Send + Sync {
    /// Hands `data` to the bridge. `Ok` says nothing about delivery.
    async fn send_data(&self, data: String) -> Result<(), TransportError>;

    fn subscribe(&self) -> broadcast::Receiver<String>;
}

/// In-process bridge for hosts that embed the store next to the bot link.
pub struct ChannelBridge {
    outbound: mpsc::UnboundedSender<String>,
    inbound: broadcast::Sender<String>,
}

/// The remote end of a [`ChannelBridge`].
pub struct BridgePeer {
    pub outbound: mpsc::UnboundedReceiver<String>,
    inbound: broadcast::Sender<String>,
}

impl ChannelBridge {
    pub fn pair() -> (Self, BridgePeer) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound, _) = broadcast::channel(INBOUND_CAPACITY);
        (
            Self {
                outbound: outbound_tx,
                inbound: inbound.clone(),
            },
            BridgePeer {
                outbound: outbound_rx,
                inbound,
            },
        )
    }
}

#[async_trait]
impl Bridge for ChannelBridge {
    async fn send_data(&self, data: String) -> Result<(), TransportError> {
        self.outbound
            .send(data)
            .map_err(|_| TransportError::BridgeClosed)
    }

    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.inbound.subscribe()
    }
}

impl BridgePeer {
    /// Broadcasts a raw message to every listener. Returns how many received it.
    pub fn reply(&self, raw: impl Into<String>) -> usize {
        self.inbound.send(raw.into()).unwrap_or(0)
    }

    /// Next outbound request that decodes as an envelope.
    pub async fn next_request(&mut self) -> Option<OutboundEnvelope> {
        while let Some(raw) = self.outbound.recv().await {
            match serde_json::from_str(&raw) {
                Ok(envelope) => return Some(envelope),
                Err(err) => debug!(error = %err, "bridge peer: skipping undecodable send"),
            }
        }
        None
    }

    pub fn try_next_request(&mut self) -> Option<OutboundEnvelope> {
        while let Ok(raw) = self.outbound.try_recv() {
            if let Ok(envelope) = serde_json::from_str(&raw) {
                return Some(envelope);
            }
        }
        None
    }
}

/// Bridge over a WebSocket link to the bot process.
pub struct WsBridge {
    outbound: mpsc::UnboundedSender<String>,
    inbound: broadcast::Sender<String>,
    tasks: Vec<JoinHandle<()>>,
}

impl WsBridge {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            anyhow::bail!("bridge url must start with ws:// or wss://");
        }
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|err| anyhow::anyhow!("failed to connect bridge websocket {url}: {err}"))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        info!(url, "bridge: websocket connected");

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let writer = tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(err) = ws_writer.send(Message::Text(text)).await {
                    warn!(error = %err, "bridge: websocket send failed");
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let (inbound, _) = broadcast::channel(INBOUND_CAPACITY);
        let inbound_tx = inbound.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        let _ = inbound_tx.send(text);
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(error = %err, "bridge: websocket receive failed");
                        break;
                    }
                }
            }
            info!("bridge: websocket reader finished");
        });

        Ok(Self {
            outbound,
            inbound,
            tasks: vec![writer, reader],
        })
    }
}

#[async_trait]
impl Bridge for WsBridge {
    async fn send_data(&self, data: String) -> Result<(), TransportError> {
        self.outbound
            .send(data)
            .map_err(|_| TransportError::BridgeClosed)
    }

    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.inbound.subscribe()
    }
}

impl Drop for WsBridge {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
