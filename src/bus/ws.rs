//! WebSocket bus backend.
//!
//! Speaks a small JSON frame protocol with the bus server:
//!
//!   out: {"op":"publish","channel":C,"data":D}
//!        {"op":"subscribe","channels":[...]}
//!        {"op":"get","key":K,"reqId":N}
//!        {"op":"set","key":K,"value":V,"ttl":SECS?}
//!   in:  {"channel":C,"data":D}            — delivered message
//!        {"reqId":N,"value":V|null}        — get reply
//!
//! One IO task owns the socket. Reconnects with capped backoff + jitter,
//! re-issues all subscriptions on reconnect, and fails pending requests on
//! disconnect. While the transport is down, publish/get/set return
//! [`BusError::Disconnected`] immediately — handlers are no-ops until the
//! link is back and reconciliation closes the gap.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::{BusError, BusMessage, MessageBus};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const PING_INTERVAL: Duration = Duration::from_secs(10);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

// ─────────────────────────────────────────────────────────
// Commands (trait surface → IO task)
// ─────────────────────────────────────────────────────────

enum WsCommand {
    Publish {
        channel: String,
        data: Value,
        done: oneshot::Sender<Result<(), BusError>>,
    },
    Subscribe {
        channels: Vec<String>,
        sink: mpsc::Sender<BusMessage>,
    },
    Get {
        key: String,
        resp: oneshot::Sender<Result<Option<Value>, BusError>>,
    },
    Set {
        key: String,
        value: Value,
        ttl_secs: Option<u64>,
        done: oneshot::Sender<Result<(), BusError>>,
    },
}

// ─────────────────────────────────────────────────────────
// Frame classification (pure, testable)
// ─────────────────────────────────────────────────────────

#[derive(Debug)]
enum Frame {
    Message { channel: String, data: Value },
    Reply { req_id: u64, value: Option<Value> },
    Other,
}

fn classify_frame(value: Value) -> Frame {
    if let Some(channel) = value.get("channel").and_then(|v| v.as_str()) {
        let data = value.get("data").cloned().unwrap_or(Value::Null);
        return Frame::Message {
            channel: channel.to_string(),
            data,
        };
    }
    if let Some(req_id) = value.get("reqId").and_then(|v| v.as_u64()) {
        let inner = value.get("value").cloned();
        let value = match inner {
            None | Some(Value::Null) => None,
            Some(v) => Some(v),
        };
        return Frame::Reply { req_id, value };
    }
    Frame::Other
}

// ─────────────────────────────────────────────────────────
// Handle
// ─────────────────────────────────────────────────────────

pub struct WsBus {
    cmd_tx: mpsc::Sender<WsCommand>,
    connected: Arc<AtomicBool>,
}

impl WsBus {
    /// Spawn the IO task. The connection is established lazily — callers can
    /// subscribe before the first connect; subscriptions are replayed on
    /// every (re)connect.
    pub fn connect(url: String) -> WsBus {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let connected = Arc::new(AtomicBool::new(false));
        let task = IoTask {
            url,
            cmd_rx,
            connected: connected.clone(),
            subs: HashMap::new(),
            pending: HashMap::new(),
            next_req: 1,
        };
        tokio::spawn(task.run());
        WsBus { cmd_tx, connected }
    }
}

#[async_trait::async_trait]
impl MessageBus for WsBus {
    async fn publish(&self, channel: &str, data: Value) -> Result<(), BusError> {
        let (done, wait) = oneshot::channel();
        self.cmd_tx
            .send(WsCommand::Publish {
                channel: channel.to_string(),
                data,
                done,
            })
            .await
            .map_err(|_| BusError::Disconnected)?;
        wait.await.map_err(|_| BusError::Disconnected)?
    }

    async fn subscribe(&self, chans: &[&str]) -> Result<mpsc::Receiver<BusMessage>, BusError> {
        let (tx, rx) = mpsc::channel(256);
        self.cmd_tx
            .send(WsCommand::Subscribe {
                channels: chans.iter().map(|s| s.to_string()).collect(),
                sink: tx,
            })
            .await
            .map_err(|_| BusError::Disconnected)?;
        Ok(rx)
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, BusError> {
        let (resp, wait) = oneshot::channel();
        self.cmd_tx
            .send(WsCommand::Get {
                key: key.to_string(),
                resp,
            })
            .await
            .map_err(|_| BusError::Disconnected)?;
        match tokio::time::timeout(REQUEST_TIMEOUT, wait).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BusError::Disconnected),
            Err(_) => Err(BusError::Timeout),
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), BusError> {
        let (done, wait) = oneshot::channel();
        self.cmd_tx
            .send(WsCommand::Set {
                key: key.to_string(),
                value,
                ttl_secs: ttl.map(|d| d.as_secs()),
                done,
            })
            .await
            .map_err(|_| BusError::Disconnected)?;
        wait.await.map_err(|_| BusError::Disconnected)?
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

// ─────────────────────────────────────────────────────────
// IO task
// ─────────────────────────────────────────────────────────

struct IoTask {
    url: String,
    cmd_rx: mpsc::Receiver<WsCommand>,
    connected: Arc<AtomicBool>,
    /// channel → sinks. Kept across reconnects.
    subs: HashMap<String, Vec<mpsc::Sender<BusMessage>>>,
    /// reqId → waiting get. Failed on disconnect.
    pending: HashMap<u64, oneshot::Sender<Result<Option<Value>, BusError>>>,
    next_req: u64,
}

impl IoTask {
    async fn run(mut self) {
        let mut attempt = 0u32;
        loop {
            match tokio::time::timeout(CONNECT_TIMEOUT, connect_async(&self.url)).await {
                Ok(Ok((ws, resp))) => {
                    info!("🚌 Bus connected (status={:?})", resp.status());
                    attempt = 0;
                    self.connected.store(true, Ordering::Relaxed);
                    let closed = self.session(ws).await;
                    self.connected.store(false, Ordering::Relaxed);
                    self.fail_pending();
                    if closed {
                        info!("🚌 Bus handle dropped — IO task exiting");
                        return;
                    }
                    warn!("🚌 Bus connection lost");
                }
                Ok(Err(err)) => warn!("🚌 Bus connect error: {err:?}"),
                Err(_) => warn!("🚌 Bus connect timeout"),
            }

            attempt = attempt.saturating_add(1);
            let backoff = backoff_delay(attempt);
            info!("🚌 Reconnecting bus in {:.1}s...", backoff.as_secs_f64());
            if self.drain_while_backing_off(backoff).await {
                return; // handle dropped
            }
        }
    }

    /// Run one live session. Returns true when the command channel closed
    /// (handle dropped) — the task should exit instead of reconnecting.
    async fn session(
        &mut self,
        ws: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    ) -> bool {
        let (mut write, mut read) = ws.split();

        // Replay every known subscription.
        let channels: Vec<&String> = self.subs.keys().collect();
        if !channels.is_empty() {
            let frame = json!({"op": "subscribe", "channels": channels});
            if write.send(Message::Text(frame.to_string())).await.is_err() {
                return false;
            }
            debug!("🚌 Resubscribed {} channels", self.subs.len());
        }

        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else { return true };
                    if !self.handle_command(cmd, &mut write).await {
                        return false; // write failed → reconnect
                    }
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => self.handle_text(&text),
                        Some(Ok(Message::Close(_))) => {
                            warn!("🚌 Bus closed by server");
                            return false;
                        }
                        Some(Err(err)) => {
                            warn!("🚌 Bus read error: {err:?}");
                            return false;
                        }
                        None => return false,
                        _ => {}
                    }
                }
                _ = ping.tick() => {
                    if write.send(Message::Text("PING".to_string())).await.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    /// Returns false when the socket write failed.
    async fn handle_command(
        &mut self,
        cmd: WsCommand,
        write: &mut (impl futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    ) -> bool {
        match cmd {
            WsCommand::Publish { channel, data, done } => {
                let frame = json!({"op": "publish", "channel": channel, "data": data});
                match write.send(Message::Text(frame.to_string())).await {
                    Ok(()) => {
                        let _ = done.send(Ok(()));
                        true
                    }
                    Err(err) => {
                        let _ = done.send(Err(BusError::Transport(err.to_string())));
                        false
                    }
                }
            }
            WsCommand::Subscribe { channels, sink } => {
                let fresh: Vec<String> = channels
                    .iter()
                    .filter(|c| !self.subs.contains_key(*c))
                    .cloned()
                    .collect();
                for chan in &channels {
                    self.subs.entry(chan.clone()).or_default().push(sink.clone());
                }
                if fresh.is_empty() {
                    return true;
                }
                let frame = json!({"op": "subscribe", "channels": fresh});
                write.send(Message::Text(frame.to_string())).await.is_ok()
            }
            WsCommand::Get { key, resp } => {
                let req_id = self.next_req;
                self.next_req += 1;
                let frame = json!({"op": "get", "key": key, "reqId": req_id});
                match write.send(Message::Text(frame.to_string())).await {
                    Ok(()) => {
                        self.pending.insert(req_id, resp);
                        true
                    }
                    Err(err) => {
                        let _ = resp.send(Err(BusError::Transport(err.to_string())));
                        false
                    }
                }
            }
            WsCommand::Set { key, value, ttl_secs, done } => {
                let mut frame = json!({"op": "set", "key": key, "value": value});
                if let Some(ttl) = ttl_secs {
                    frame["ttl"] = json!(ttl);
                }
                match write.send(Message::Text(frame.to_string())).await {
                    Ok(()) => {
                        let _ = done.send(Ok(()));
                        true
                    }
                    Err(err) => {
                        let _ = done.send(Err(BusError::Transport(err.to_string())));
                        false
                    }
                }
            }
        }
    }

    fn handle_text(&mut self, text: &str) {
        let Ok(value) = serde_json::from_str::<Value>(text) else {
            debug!("🚌 Ignoring non-JSON frame");
            return;
        };
        match classify_frame(value) {
            Frame::Message { channel, data } => {
                if let Some(sinks) = self.subs.get_mut(&channel) {
                    sinks.retain(|tx| !tx.is_closed());
                    for tx in sinks.iter() {
                        // try_send: a stalled consumer must not wedge the
                        // whole bus reader.
                        if let Err(err) = tx.try_send(BusMessage {
                            channel: channel.clone(),
                            data: data.clone(),
                        }) {
                            warn!("🚌 Dropping frame for {channel}: {err}");
                        }
                    }
                }
            }
            Frame::Reply { req_id, value } => {
                if let Some(resp) = self.pending.remove(&req_id) {
                    let _ = resp.send(Ok(value));
                } else {
                    debug!("🚌 Reply for unknown reqId {req_id}");
                }
            }
            Frame::Other => {}
        }
    }

    fn fail_pending(&mut self) {
        for (_, resp) in self.pending.drain() {
            let _ = resp.send(Err(BusError::Disconnected));
        }
    }

    /// Answer commands with Disconnected while waiting out the backoff, so
    /// callers never hang on a dead transport. Returns true when the handle
    /// was dropped.
    async fn drain_while_backing_off(&mut self, backoff: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + backoff;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return false,
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(WsCommand::Publish { done, .. }) => {
                            let _ = done.send(Err(BusError::Disconnected));
                        }
                        Some(WsCommand::Set { done, .. }) => {
                            let _ = done.send(Err(BusError::Disconnected));
                        }
                        Some(WsCommand::Get { resp, .. }) => {
                            let _ = resp.send(Err(BusError::Disconnected));
                        }
                        Some(WsCommand::Subscribe { channels, sink }) => {
                            // Register now; replayed on the next connect.
                            for chan in channels {
                                self.subs.entry(chan).or_default().push(sink.clone());
                            }
                        }
                        None => return true,
                    }
                }
            }
        }
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let base = Duration::from_secs(1)
        .saturating_mul(2u32.saturating_pow(attempt.min(5)))
        .min(BACKOFF_CAP);
    // Jitter so a fleet of services doesn't reconnect in lockstep.
    let jitter_ms = rand::thread_rng().gen_range(0..250);
    base + Duration::from_millis(jitter_ms)
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_message_frame() {
        let f = classify_frame(json!({"channel": "ORDER_FILLED", "data": {"orderId": "o1"}}));
        match f {
            Frame::Message { channel, data } => {
                assert_eq!(channel, "ORDER_FILLED");
                assert_eq!(data["orderId"], "o1");
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_classify_reply_frame() {
        match classify_frame(json!({"reqId": 7, "value": {"a": 1}})) {
            Frame::Reply { req_id, value } => {
                assert_eq!(req_id, 7);
                assert_eq!(value.unwrap()["a"], 1);
            }
            other => panic!("unexpected frame {other:?}"),
        }
        // Null value → missing key.
        match classify_frame(json!({"reqId": 8, "value": null})) {
            Frame::Reply { value, .. } => assert!(value.is_none()),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_classify_junk() {
        assert!(matches!(classify_frame(json!({"hello": 1})), Frame::Other));
        assert!(matches!(classify_frame(json!(42)), Frame::Other));
    }

    #[test]
    fn test_backoff_is_capped() {
        assert!(backoff_delay(1) >= Duration::from_secs(2));
        assert!(backoff_delay(30) <= BACKOFF_CAP + Duration::from_millis(250));
    }
}
