//! In-process bus backend: tokio channels for pub/sub, a HashMap with TTL
//! for the key/value side-channel. Used by the test suite and by
//! `BUS_MODE=memory` single-node runs.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};

use super::{BusError, BusMessage, MessageBus};

struct KvEntry {
    value: Value,
    expires_at: Option<Instant>,
}

#[derive(Default)]
pub struct MemoryBus {
    subs: Mutex<HashMap<String, Vec<mpsc::Sender<BusMessage>>>>,
    kv: Mutex<HashMap<String, KvEntry>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, channel: &str, data: Value) -> Result<(), BusError> {
        let targets: Vec<mpsc::Sender<BusMessage>> = {
            let mut subs = self.subs.lock().await;
            if let Some(sinks) = subs.get_mut(channel) {
                sinks.retain(|tx| !tx.is_closed());
                sinks.clone()
            } else {
                Vec::new()
            }
        };
        for tx in targets {
            let _ = tx
                .send(BusMessage {
                    channel: channel.to_string(),
                    data: data.clone(),
                })
                .await;
        }
        Ok(())
    }

    async fn subscribe(&self, chans: &[&str]) -> Result<mpsc::Receiver<BusMessage>, BusError> {
        let (tx, rx) = mpsc::channel(256);
        let mut subs = self.subs.lock().await;
        for chan in chans {
            subs.entry(chan.to_string()).or_default().push(tx.clone());
        }
        Ok(rx)
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, BusError> {
        let mut kv = self.kv.lock().await;
        let expired = kv
            .get(key)
            .map(|e| e.expires_at.is_some_and(|t| Instant::now() >= t));
        match expired {
            None => Ok(None),
            Some(true) => {
                kv.remove(key);
                Ok(None)
            }
            Some(false) => Ok(kv.get(key).map(|e| e.value.clone())),
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), BusError> {
        let mut kv = self.kv.lock().await;
        kv.insert(
            key.to_string(),
            KvEntry {
                value,
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(())
    }

    fn is_connected(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let bus = MemoryBus::new();
        let mut a = bus.subscribe(&["X"]).await.unwrap();
        let mut b = bus.subscribe(&["X", "Y"]).await.unwrap();

        bus.publish("X", json!({"n": 1})).await.unwrap();
        assert_eq!(a.recv().await.unwrap().data["n"], 1);
        assert_eq!(b.recv().await.unwrap().data["n"], 1);

        bus.publish("Y", json!({"n": 2})).await.unwrap();
        let msg = b.recv().await.unwrap();
        assert_eq!(msg.channel, "Y");
    }

    #[tokio::test]
    async fn test_kv_roundtrip_and_missing_key() {
        let bus = MemoryBus::new();
        assert!(bus.get("nothing").await.unwrap().is_none());
        bus.set("k", json!({"v": 7}), None).await.unwrap();
        assert_eq!(bus.get("k").await.unwrap().unwrap()["v"], 7);
    }

    #[tokio::test]
    async fn test_kv_ttl_expiry() {
        let bus = MemoryBus::new();
        bus.set("tmp", json!(1), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        assert!(bus.get("tmp").await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(bus.get("tmp").await.unwrap().is_none());
    }
}
