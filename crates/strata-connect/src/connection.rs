use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

/// Transport boundary. The core assumes nothing about the wire beyond
/// JSON-serializable payloads and a queryable connected state.
#[async_trait]
pub trait Connection: Send + Sync {
    fn id(&self) -> &str;

    async fn send_json(&self, msg: Value) -> Result<()>;

    async fn close(&self, code: u16, reason: &str) -> Result<()>;

    fn is_connected(&self) -> bool;
}

/// Channel-backed connection for in-process use and tests. Sent payloads
/// land on the paired receiver.
pub struct ChannelConnection {
    id: String,
    tx: mpsc::UnboundedSender<Value>,
    connected: AtomicBool,
}

impl ChannelConnection {
    pub fn pair(id: impl Into<String>) -> (Arc<Self>, mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                id: id.into(),
                tx,
                connected: AtomicBool::new(true),
            }),
            rx,
        )
    }

    /// Simulate a transport drop; subsequent sends fail.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn reconnect(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connection for ChannelConnection {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send_json(&self, msg: Value) -> Result<()> {
        if !self.is_connected() {
            anyhow::bail!("connection '{}' is closed", self.id);
        }
        self.tx
            .send(msg)
            .map_err(|_| anyhow::anyhow!("connection '{}' receiver dropped", self.id))
    }

    async fn close(&self, code: u16, reason: &str) -> Result<()> {
        tracing::debug!(connection_id = %self.id, code, reason, "closing connection");
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
