// =============================================================================
// Exchange WebSocket client — subscribe/ping/post frames (spec §6)
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// One parsed incoming frame: `{channel, data}`.
#[derive(Debug, Clone)]
pub struct WsEvent {
    pub channel: String,
    pub data: Value,
}

/// A single WS post request awaiting its `{channel:"post", data:{...}}` reply.
pub struct WsClient {
    url: String,
    next_post_id: AtomicU64,
    outbound: mpsc::UnboundedSender<Message>,
}

impl WsClient {
    /// Connects, spawns the ping loop and the read loop, and returns a
    /// handle plus the channel of parsed events. Reconnection is the
    /// caller's responsibility (spec §5 task 2/3 own the reconnect loop).
    pub async fn connect(url: &str) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<WsEvent>)> {
        info!(url, "connecting to exchange websocket");
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .context("failed to connect to exchange websocket")?;
        let (mut write, mut read) = ws_stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<WsEvent>();

        tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                if let Err(e) = write.send(msg).await {
                    error!(error = %e, "failed to write to exchange websocket");
                    break;
                }
            }
        });

        let ping_tx = outbound_tx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(50));
            loop {
                interval.tick().await;
                let frame = Message::Text(json!({ "method": "ping" }).to_string());
                if ping_tx.send(frame).is_err() {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => match parse_frame(&text) {
                        Some(event) => {
                            if event_tx.send(event).is_err() {
                                break;
                            }
                        }
                        None => debug!(frame = %text, "dropped unrecognized websocket frame"),
                    },
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "exchange websocket read error");
                        break;
                    }
                    None => {
                        warn!("exchange websocket stream ended");
                        break;
                    }
                }
            }
        });

        Ok((
            Arc::new(Self {
                url: url.to_string(),
                next_post_id: AtomicU64::new(1),
                outbound: outbound_tx,
            }),
            event_rx,
        ))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn subscribe(&self, sub_type: &str, user: Option<&str>) -> Result<()> {
        let mut subscription = json!({ "type": sub_type });
        if let Some(u) = user {
            subscription["user"] = json!(u);
        }
        self.subscribe_json(subscription)
    }

    /// Like `subscribe`, but takes the full subscription body so callers can
    /// add fields beyond `type`/`user` (e.g. `candle`'s `coin`/`interval`).
    pub fn subscribe_json(&self, subscription: Value) -> Result<()> {
        let frame = json!({ "method": "subscribe", "subscription": subscription });
        self.send_text(frame)
    }

    /// Sends a `{method:"post", id, request:{type:"info", payload}}` frame
    /// and returns the `id` the reply will carry in `data.id`.
    pub fn post_info(&self, payload: Value) -> Result<u64> {
        let id = self.next_post_id.fetch_add(1, Ordering::SeqCst);
        let frame = json!({
            "method": "post",
            "id": id,
            "request": { "type": "info", "payload": payload },
        });
        self.send_text(frame)?;
        Ok(id)
    }

    fn send_text(&self, body: Value) -> Result<()> {
        self.outbound
            .send(Message::Text(body.to_string()))
            .map_err(|e| anyhow::anyhow!("websocket outbound channel closed: {e}"))
    }
}

fn parse_frame(text: &str) -> Option<WsEvent> {
    let root: Value = serde_json::from_str(text).ok()?;
    let channel = root.get("channel")?.as_str()?.to_string();
    let data = root.get("data").cloned().unwrap_or(Value::Null);
    Some(WsEvent { channel, data })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_recognized_channel_frame() {
        let text = r#"{"channel":"openOrders","data":{"orders":[]}}"#;
        let event = parse_frame(text).unwrap();
        assert_eq!(event.channel, "openOrders");
    }

    #[test]
    fn ignores_frame_with_no_channel() {
        let text = r#"{"foo":"bar"}"#;
        assert!(parse_frame(text).is_none());
    }
}
