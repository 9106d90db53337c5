use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::Mutex;

use crate::connection::Connection;

/// [`Connection`] adapter over an axum WebSocket. The embedding process owns
/// the upgrade handler and the read half; the core only ever writes.
pub struct WsConnection {
    id: String,
    sink: Mutex<SplitSink<WebSocket, Message>>,
    connected: AtomicBool,
}

impl WsConnection {
    /// Split `socket` and wrap its write half. The read half is returned to
    /// the caller, which is responsible for draining it and calling
    /// [`WsConnection::mark_disconnected`] when the peer goes away.
    pub fn new(id: impl Into<String>, socket: WebSocket) -> (Arc<Self>, SplitStream<WebSocket>) {
        let (sink, stream) = socket.split();
        (
            Arc::new(Self {
                id: id.into(),
                sink: Mutex::new(sink),
                connected: AtomicBool::new(true),
            }),
            stream,
        )
    }

    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connection for WsConnection {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send_json(&self, msg: serde_json::Value) -> Result<()> {
        if !self.is_connected() {
            anyhow::bail!("websocket '{}' is closed", self.id);
        }
        let text = serde_json::to_string(&msg)?;
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.send(Message::Text(text)).await {
            self.connected.store(false, Ordering::SeqCst);
            return Err(anyhow::anyhow!("websocket '{}' send failed: {e}", self.id));
        }
        Ok(())
    }

    async fn close(&self, code: u16, reason: &str) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        let mut sink = self.sink.lock().await;
        let frame = CloseFrame {
            code,
            reason: Cow::Owned(reason.to_string()),
        };
        // Peer may already be gone; closing a dead socket is not an error.
        let _ = sink.send(Message::Close(Some(frame))).await;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
