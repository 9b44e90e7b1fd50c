//! End-to-end scenarios: a full orchestrator over the in-process bus,
//! driven through the same channels the broker adapter and webhook gateway
//! use in production.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use trade_orchestrator::bus::{channels, BusMessage, MemoryBus, MessageBus};
use trade_orchestrator::config::OrchestratorConfig;
use trade_orchestrator::contracts::{front_month, ContractFamily, SizingConfig, Underlying};
use trade_orchestrator::orchestrator::{self, OrchestratorHandle};

// ─────────────────────────────────────────────────────────
// Harness
// ─────────────────────────────────────────────────────────

struct Harness {
    bus: Arc<MemoryBus>,
    handle: OrchestratorHandle,
    out: mpsc::Receiver<BusMessage>,
}

const PRODUCED: [&str; 8] = [
    channels::TRADE_VALIDATED,
    channels::TRADE_REJECTED,
    channels::ORDER_REQUEST,
    channels::ORDER_CANCEL_REQUEST,
    channels::TRADE_SIGNAL,
    channels::POSITION_UPDATE,
    channels::POSITION_REALTIME_UPDATE,
    channels::SYNC_REQUEST,
];

async fn harness(cfg: OrchestratorConfig) -> Harness {
    let bus = Arc::new(MemoryBus::new());
    let out = bus.subscribe(&PRODUCED).await.unwrap();
    let handle = orchestrator::spawn(cfg, SizingConfig::default(), bus.clone())
        .await
        .unwrap();
    let h = Harness { bus, handle, out };
    // Establish broker freshness so entries don't park.
    h.send(channels::ORDERS_SYNCED, json!({"workingOrderIds": []}))
        .await;
    h.settle().await;
    h
}

impl Harness {
    async fn send(&self, channel: &str, data: Value) {
        self.bus.publish(channel, data).await.unwrap();
    }

    /// Wait for the next frame on `channel` matching `pred`, skipping
    /// everything else (including our own injected frames).
    async fn expect(&mut self, channel: &str, pred: impl Fn(&Value) -> bool) -> Value {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let msg = tokio::time::timeout_at(deadline, self.out.recv())
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {channel}"))
                .expect("bus closed");
            if msg.channel == channel && pred(&msg.data) {
                return msg.data;
            }
        }
    }

    /// Assert no frame matching `pred` arrives on `channel` for a while.
    async fn expect_silence(&mut self, channel: &str, pred: impl Fn(&Value) -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(300);
        loop {
            match tokio::time::timeout_at(deadline, self.out.recv()).await {
                Err(_) => return,
                Ok(Some(msg)) => {
                    assert!(
                        !(msg.channel == channel && pred(&msg.data)),
                        "unexpected frame on {channel}: {:?}",
                        msg.data
                    );
                }
                Ok(None) => return,
            }
        }
    }

    async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(150)).await;
    }

    fn nq_front(&self) -> String {
        front_month(ContractFamily::NQ, Utc::now())
    }

    // Standard happy-path steps used by several scenarios.

    async fn accept_long_signal(&mut self, signal_id: &str, strategy: &str) -> String {
        self.send(
            channels::WEBHOOK_RECEIVED,
            json!({
                "signalId": signal_id,
                "strategy": strategy,
                "symbol": "NQ1!",
                "side": "long",
                "action": "place_limit",
                "price": 21000,
                "stopLoss": 20980,
                "takeProfit": 21060,
                "quantity": 1,
                "breakevenTrigger": 20,
                "breakevenOffset": 5
            }),
        )
        .await;
        let sid = signal_id.to_string();
        let request = self
            .expect(channels::ORDER_REQUEST, |v| v["signalId"] == json!(sid))
            .await;
        request["symbol"].as_str().unwrap().to_string()
    }

    async fn place_and_fill(&mut self, signal_id: &str, order_id: &str, symbol: &str, fill: f64) {
        self.send(
            channels::ORDER_PLACED,
            json!({
                "orderId": order_id,
                "signalId": signal_id,
                "symbol": symbol,
                "role": "entry",
                "orderType": "Limit",
                "price": 21000,
                "quantity": 1
            }),
        )
        .await;
        self.settle().await;
        self.send(
            channels::ORDER_FILLED,
            json!({
                "orderId": order_id,
                "symbol": symbol,
                "action": "Buy",
                "quantity": 1,
                "fillPrice": fill
            }),
        )
        .await;
    }
}

// ─────────────────────────────────────────────────────────
// 1. Happy-path long bracket
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn happy_path_long_bracket() {
    let mut h = harness(OrchestratorConfig::default()).await;

    h.send(
        channels::TRADE_SIGNAL,
        json!({
            "signalId": "s1",
            "strategy": "IV_SKEW_GEX",
            "symbol": "NQ1!",
            "side": "long",
            "action": "place_limit",
            "price": 21000,
            "stopLoss": 20980,
            "takeProfit": 21060,
            "quantity": 1
        }),
    )
    .await;

    h.expect(channels::TRADE_VALIDATED, |v| v["signalId"] == "s1").await;
    let request = h.expect(channels::ORDER_REQUEST, |v| v["signalId"] == "s1").await;
    let symbol = h.nq_front();
    assert_eq!(request["symbol"], json!(symbol));
    assert_eq!(request["quantity"], 1);
    assert_eq!(request["action"], "Buy");
    assert_eq!(request["orderType"], "Limit");
    assert_eq!(request["positionSizing"]["originalSymbol"], "NQ1!");

    h.place_and_fill("s1", "o1", &symbol, 21000.25).await;
    let update = h
        .expect(channels::POSITION_UPDATE, |v| v["side"] == "long")
        .await;
    assert_eq!(update["netPos"], 1);
    assert_eq!(update["entryPrice"], 21000.25);

    let core = h.handle.state.read().await;
    let pos = core.positions.get(&symbol).expect("position exists");
    assert_eq!(pos.net_pos, 1);
    assert!((pos.entry_price - 21000.25).abs() < 1e-9);
    let owner = core.tracker.position(Underlying::Nq).expect("strategy state");
    assert_eq!(owner.source, "IV_SKEW_GEX");
}

// ─────────────────────────────────────────────────────────
// 2. Cross-strategy rejection
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn cross_strategy_rejection() {
    let mut h = harness(OrchestratorConfig::default()).await;
    let symbol = h.accept_long_signal("s1", "IV_SKEW_GEX").await;
    h.place_and_fill("s1", "o1", &symbol, 21000.25).await;
    h.expect(channels::POSITION_UPDATE, |v| v["side"] == "long").await;

    h.send(
        channels::TRADE_SIGNAL,
        json!({
            "signalId": "s2",
            "strategy": "GEX_SCALP",
            "symbol": "NQ1!",
            "side": "short",
            "action": "place_limit",
            "price": 21010,
            "stopLoss": 21030,
            "takeProfit": 20950,
            "quantity": 1
        }),
    )
    .await;

    let rejection = h.expect(channels::TRADE_REJECTED, |v| v["signalId"] == "s2").await;
    let reason = rejection["reason"].as_str().unwrap();
    assert!(
        reason.contains("NQ already in long position from IV_SKEW_GEX"),
        "reason was: {reason}"
    );
    h.expect_silence(channels::ORDER_REQUEST, |v| v["signalId"] == "s2").await;
}

// ─────────────────────────────────────────────────────────
// 3. Sibling cancel on fill
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn sibling_cancel_on_fill() {
    let mut cfg = OrchestratorConfig::default();
    cfg.rules.allow_same_direction = true; // permissive rule admits both
    let mut h = harness(cfg).await;

    let symbol = h.accept_long_signal("s1", "STRAT_A").await;
    let _ = h.accept_long_signal("s2", "STRAT_B").await;

    for (oid, sid) in [("o1", "s1"), ("o2", "s2")] {
        h.send(
            channels::ORDER_PLACED,
            json!({
                "orderId": oid,
                "signalId": sid,
                "symbol": symbol,
                "role": "entry",
                "orderType": "Limit",
                "price": 21000,
                "quantity": 1
            }),
        )
        .await;
    }
    h.settle().await;

    h.send(
        channels::ORDER_FILLED,
        json!({
            "orderId": "o1",
            "symbol": symbol,
            "action": "Buy",
            "quantity": 1,
            "fillPrice": 21000.25
        }),
    )
    .await;

    let cancel = h
        .expect(channels::ORDER_CANCEL_REQUEST, |v| v["orderId"] == "o2")
        .await;
    assert!(cancel["reason"].as_str().unwrap().contains("sibling"));

    let core = h.handle.state.read().await;
    let owner = core.tracker.position(Underlying::Nq).expect("winner recorded");
    assert_eq!(owner.source, "STRAT_A");
}

// ─────────────────────────────────────────────────────────
// 4. Breakeven trigger
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn breakeven_triggers_once() {
    let mut h = harness(OrchestratorConfig::default()).await;
    let symbol = h.accept_long_signal("s1", "IV_SKEW_GEX").await;
    h.place_and_fill("s1", "o1", &symbol, 21000.0).await;
    h.expect(channels::POSITION_UPDATE, |v| v["side"] == "long").await;

    h.send(
        channels::PRICE_UPDATE,
        json!({"symbol": symbol, "baseSymbol": "NQ", "close": 21021.0}),
    )
    .await;

    let modify = h
        .expect(channels::TRADE_SIGNAL, |v| v["action"] == "modify_stop")
        .await;
    assert_eq!(modify["new_stop_price"], 21005.0);
    assert_eq!(modify["symbol"], json!(symbol));

    // Prices keep rising — no second trigger.
    h.send(
        channels::PRICE_UPDATE,
        json!({"symbol": symbol, "baseSymbol": "NQ", "close": 21050.0}),
    )
    .await;
    h.expect_silence(channels::TRADE_SIGNAL, |v| v["action"] == "modify_stop")
        .await;

    let core = h.handle.state.read().await;
    let be = core.positions[&symbol].breakeven.as_ref().unwrap();
    assert!(be.triggered);
}

// ─────────────────────────────────────────────────────────
// 5. Full-sync recovery
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn full_sync_recovery() {
    let mut h = harness(OrchestratorConfig::default()).await;
    let symbol = h.accept_long_signal("s1", "IV_SKEW_GEX").await;
    h.place_and_fill("s1", "o1", &symbol, 21000.0).await;
    h.expect(channels::POSITION_UPDATE, |v| v["side"] == "long").await;

    // Broker restarts its feed: full sync.
    h.send(channels::FULL_SYNC_STARTED, json!({})).await;
    h.settle().await;
    {
        let core = h.handle.state.read().await;
        assert!(core.positions.is_empty());
        assert!(core.full_sync_active());
    }

    // Ground truth arrives: the position (with a broken entry price) and a
    // stop order the broker reports with no signal correlation.
    h.send(
        channels::POSITION_UPDATE,
        json!({"symbol": symbol, "netPos": 1, "entryPrice": 0}),
    )
    .await;
    h.send(
        channels::ORDER_PLACED,
        json!({
            "orderId": "stop1",
            "symbol": symbol,
            "orderType": "Stop",
            "stopPrice": 20980.0,
            "quantity": 1,
            "action": "Sell"
        }),
    )
    .await;
    h.settle().await;
    h.send(channels::SYNC_COMPLETED, json!({})).await;
    h.settle().await;

    let core = h.handle.state.read().await;
    let pos = core.positions.get(&symbol).expect("rebuilt position");
    assert_eq!(pos.net_pos, 1);
    assert!((pos.entry_price - 21000.0).abs() < 1e-9, "entry repaired from stash");
    assert_eq!(pos.signal_id.as_deref(), Some("s1"));
    assert_eq!(pos.strategy.as_deref(), Some("IV_SKEW_GEX"));
    let be = pos.breakeven.as_ref().expect("breakeven restored");
    assert!((be.trigger - 20.0).abs() < 1e-9);
    assert_eq!(pos.stop_loss_order_id.as_deref(), Some("stop1"));
    assert!(core.registry.context("s1").is_some(), "context promoted from stash");
    assert!(!core.full_sync_active(), "no orphan stash remains");
    let stop = core.working_orders.get("stop1").unwrap();
    assert_eq!(stop.signal_id.as_deref(), Some("s1"));
}

// ─────────────────────────────────────────────────────────
// 6. Position flip via fill
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn position_flip_via_fill() {
    let mut h = harness(OrchestratorConfig::default()).await;
    let symbol = h.accept_long_signal("s1", "IV_SKEW_GEX").await;
    h.place_and_fill("s1", "o1", &symbol, 21000.0).await;
    h.expect(channels::POSITION_UPDATE, |v| v["side"] == "long").await;

    h.send(
        channels::ORDER_FILLED,
        json!({
            "orderId": "ox",
            "symbol": symbol,
            "action": "Sell",
            "quantity": 2,
            "fillPrice": 20990.0
        }),
    )
    .await;

    let update = h
        .expect(channels::POSITION_UPDATE, |v| v["side"] == "short")
        .await;
    assert_eq!(update["netPos"], -1);
    assert_eq!(update["entryPrice"], 20990.0);

    let core = h.handle.state.read().await;
    let pos = core.positions.get(&symbol).unwrap();
    assert_eq!(pos.net_pos, -1);
    assert!((pos.entry_price - 20990.0).abs() < 1e-9, "flip uses fill price, not weighted");
}

// ─────────────────────────────────────────────────────────
// Idempotence under at-least-once delivery
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn duplicate_signal_produces_one_order_request() {
    let mut h = harness(OrchestratorConfig::default()).await;
    let signal = json!({
        "signalId": "s1",
        "strategy": "IV_SKEW_GEX",
        "symbol": "NQ1!",
        "side": "long",
        "action": "place_limit",
        "price": 21000,
        "stopLoss": 20980,
        "quantity": 1
    });
    h.send(channels::TRADE_SIGNAL, signal.clone()).await;
    h.expect(channels::ORDER_REQUEST, |v| v["signalId"] == "s1").await;

    h.send(channels::TRADE_SIGNAL, signal).await;
    h.expect_silence(channels::ORDER_REQUEST, |v| v["signalId"] == "s1").await;
}

#[tokio::test]
async fn duplicate_fill_leaves_state_unchanged() {
    let mut h = harness(OrchestratorConfig::default()).await;
    let symbol = h.accept_long_signal("s1", "IV_SKEW_GEX").await;
    h.place_and_fill("s1", "o1", &symbol, 21000.25).await;
    h.expect(channels::POSITION_UPDATE, |v| v["side"] == "long").await;

    // Redeliver the identical fill.
    h.send(
        channels::ORDER_FILLED,
        json!({
            "orderId": "o1",
            "symbol": symbol,
            "action": "Buy",
            "quantity": 1,
            "fillPrice": 21000.25
        }),
    )
    .await;
    h.expect_silence(channels::POSITION_UPDATE, |v| v["symbol"] == json!(symbol.clone()))
        .await;

    let core = h.handle.state.read().await;
    assert_eq!(core.positions[&symbol].net_pos, 1, "duplicate fill not double-applied");
}

// ─────────────────────────────────────────────────────────
// Freshness gate
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn stale_broker_truth_parks_signal_until_sync() {
    // No ORDERS_SYNCED priming here: broker truth starts stale.
    let bus = Arc::new(MemoryBus::new());
    let out = bus.subscribe(&PRODUCED).await.unwrap();
    let handle = orchestrator::spawn(OrchestratorConfig::default(), SizingConfig::default(), bus.clone())
        .await
        .unwrap();
    let mut h = Harness { bus, handle, out };

    h.send(
        channels::TRADE_SIGNAL,
        json!({
            "signalId": "s1",
            "strategy": "IV_SKEW_GEX",
            "symbol": "NQ1!",
            "side": "long",
            "action": "place_limit",
            "price": 21000,
            "stopLoss": 20980,
            "quantity": 1
        }),
    )
    .await;

    // The orchestrator asks the broker adapter for a sync first…
    h.expect(channels::SYNC_REQUEST, |v| v["mode"] == "incremental").await;
    h.expect_silence(channels::ORDER_REQUEST, |v| v["signalId"] == "s1").await;

    // …and admits the parked signal once the snapshot lands.
    h.send(channels::ORDERS_SYNCED, json!({"workingOrderIds": []})).await;
    h.expect(channels::ORDER_REQUEST, |v| v["signalId"] == "s1").await;
}

// ─────────────────────────────────────────────────────────
// POSITION_CLOSED clears working orders
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn position_closed_cancels_symbol_orders() {
    let mut h = harness(OrchestratorConfig::default()).await;
    let symbol = h.accept_long_signal("s1", "IV_SKEW_GEX").await;
    h.place_and_fill("s1", "o1", &symbol, 21000.0).await;
    h.expect(channels::POSITION_UPDATE, |v| v["side"] == "long").await;

    // Bracket children appear.
    h.send(
        channels::ORDER_PLACED,
        json!({"orderId": "stop1", "signalId": "s1", "symbol": symbol,
               "orderType": "Stop", "stopPrice": 20980.0, "quantity": 1, "action": "Sell"}),
    )
    .await;
    h.send(
        channels::ORDER_PLACED,
        json!({"orderId": "tp1", "signalId": "s1", "symbol": symbol,
               "orderType": "Limit", "price": 21060.0, "quantity": 1, "action": "Sell"}),
    )
    .await;
    h.settle().await;

    h.send(channels::POSITION_CLOSED, json!({"symbol": symbol, "netPos": 0})).await;

    h.expect(channels::ORDER_CANCEL_REQUEST, |v| v["orderId"] == "stop1" || v["orderId"] == "tp1")
        .await;
    h.expect(channels::ORDER_CANCEL_REQUEST, |v| v["orderId"] == "stop1" || v["orderId"] == "tp1")
        .await;
    h.expect(channels::POSITION_UPDATE, |v| v["side"] == "flat").await;

    let core = h.handle.state.read().await;
    assert!(core.positions.is_empty());
    assert!(core.working_orders.is_empty());
    assert!(core.tracker.position(Underlying::Nq).is_none());
}
