//! Trade Orchestrator — the actor that owns all trading state.
//!
//! Architecture:
//!
//!   bus listener ──InboundEvent──→ Orchestrator ──publish──→ bus
//!                                      │
//!                                      └── Arc<RwLock<CoreState>> ──→ HTTP surface (read-only)
//!
//! One event, one mutation step: every handler takes the write lock once,
//! computes the whole state transition, drops the lock, and only then
//! publishes and persists. The HTTP surface shares the state read-only
//! (plus the trading-flag flip). Sharding by underlying would be a valid
//! optimization; a single serial in-box is the simplest correct design.

mod admission;
mod breakeven;
mod orders;
mod positions;
mod reconcile;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::{json, Value};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::{channels, BusMessage, MessageBus};
use crate::config::OrchestratorConfig;
use crate::contracts::SymbolResolver;
use crate::events::{InboundEvent, Order, Position, Signal, SignalContext};
use crate::persist::StateStore;
use crate::registry::SignalRegistry;
use crate::strategy::StrategyTracker;

// ─────────────────────────────────────────────────────────
// Core state
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoreStats {
    pub signals_received: u64,
    pub signals_accepted: u64,
    pub signals_rejected: u64,
    pub fills_processed: u64,
    pub started_at: DateTime<Utc>,
}

/// Realized PnL accumulator, reset at the UTC day boundary.
#[derive(Debug, Clone, Copy)]
pub struct DailyPnl {
    pub day: NaiveDate,
    pub realized: f64,
}

impl DailyPnl {
    fn new(now: DateTime<Utc>) -> DailyPnl {
        DailyPnl {
            day: now.date_naive(),
            realized: 0.0,
        }
    }

    pub fn add(&mut self, now: DateTime<Utc>, amount: f64) {
        if now.date_naive() != self.day {
            self.day = now.date_naive();
            self.realized = 0.0;
        }
        self.realized += amount;
    }

    pub fn realized_today(&self, now: DateTime<Utc>) -> f64 {
        if now.date_naive() == self.day {
            self.realized
        } else {
            0.0
        }
    }
}

/// Everything the orchestrator mutates. One logical critical section per
/// event; the HTTP surface reads it.
pub struct CoreState {
    pub trading_enabled: bool,
    /// Concrete symbol → position.
    pub positions: HashMap<String, Position>,
    /// Broker order id → working order.
    pub working_orders: HashMap<String, Order>,
    pub registry: SignalRegistry,
    pub tracker: StrategyTracker,
    /// Order id → broker bracket group id.
    pub order_strategy: HashMap<String, String>,
    /// Underlying ("NQ") → last seen close.
    pub last_prices: HashMap<String, f64>,
    pub last_sync: Option<Instant>,
    pub sync_degraded: bool,
    /// Present while a full sync is in flight; holds the stashed contexts.
    pub stash: Option<HashMap<String, SignalContext>>,
    /// Fill dedup across at-least-once redelivery.
    pub seen_fills: HashSet<String>,
    pub daily: DailyPnl,
    pub stats: CoreStats,
}

impl CoreState {
    pub fn new(trading_enabled: bool) -> CoreState {
        let now = Utc::now();
        CoreState {
            trading_enabled,
            positions: HashMap::new(),
            working_orders: HashMap::new(),
            registry: SignalRegistry::default(),
            tracker: StrategyTracker::default(),
            order_strategy: HashMap::new(),
            last_prices: HashMap::new(),
            last_sync: None,
            sync_degraded: false,
            stash: None,
            seen_fills: HashSet::new(),
            daily: DailyPnl::new(now),
            stats: CoreStats {
                signals_received: 0,
                signals_accepted: 0,
                signals_rejected: 0,
                fills_processed: 0,
                started_at: now,
            },
        }
    }

    pub fn full_sync_active(&self) -> bool {
        self.stash.is_some()
    }
}

pub type SharedState = Arc<RwLock<CoreState>>;

// ─────────────────────────────────────────────────────────
// Effects
// ─────────────────────────────────────────────────────────

/// Which persisted keys an event dirtied. Whole-key writes happen after the
/// lock is dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct Dirty {
    pub contexts: bool,
    pub mappings: bool,
    pub lifecycles: bool,
    pub order_strategy: bool,
    pub strategy_state: bool,
}

impl Dirty {
    pub fn registry() -> Dirty {
        Dirty {
            contexts: true,
            mappings: true,
            lifecycles: true,
            ..Dirty::default()
        }
    }

    pub fn all() -> Dirty {
        Dirty {
            contexts: true,
            mappings: true,
            lifecycles: true,
            order_strategy: true,
            strategy_state: true,
        }
    }

    pub fn merge(&mut self, other: Dirty) {
        self.contexts |= other.contexts;
        self.mappings |= other.mappings;
        self.lifecycles |= other.lifecycles;
        self.order_strategy |= other.order_strategy;
        self.strategy_state |= other.strategy_state;
    }

    pub fn any(&self) -> bool {
        self.contexts || self.mappings || self.lifecycles || self.order_strategy || self.strategy_state
    }
}

/// Outbound side of one mutation step.
#[derive(Debug, Default)]
pub struct Effects {
    pub publishes: Vec<(&'static str, Value)>,
    pub dirty: Dirty,
}

impl Effects {
    pub fn publish(&mut self, channel: &'static str, data: Value) {
        self.publishes.push((channel, data));
    }
}

// ─────────────────────────────────────────────────────────
// Parked signal (freshness gate)
// ─────────────────────────────────────────────────────────

/// A signal held while we wait for a broker sync. Single slot, newest wins.
struct ParkedSignal {
    signal: Signal,
    deadline: tokio::time::Instant,
}

// ─────────────────────────────────────────────────────────
// Orchestrator
// ─────────────────────────────────────────────────────────

pub struct Orchestrator {
    pub(crate) cfg: OrchestratorConfig,
    pub(crate) state: SharedState,
    pub(crate) bus: Arc<dyn MessageBus>,
    pub(crate) store: StateStore,
    pub(crate) resolver: SymbolResolver,
    event_rx: mpsc::Receiver<InboundEvent>,
    parked: Option<ParkedSignal>,
}

/// Handle returned by [`spawn`]: the shared state for the HTTP surface, the
/// in-box sender, and the task handle.
pub struct OrchestratorHandle {
    pub state: SharedState,
    pub event_tx: mpsc::Sender<InboundEvent>,
    pub task: JoinHandle<()>,
    pub listener: JoinHandle<()>,
}

/// Load persisted state, wire the bus listener, and spawn the actor.
pub async fn spawn(
    cfg: OrchestratorConfig,
    sizing: crate::contracts::SizingConfig,
    bus: Arc<dyn MessageBus>,
) -> anyhow::Result<OrchestratorHandle> {
    let store = StateStore::new(bus.clone());

    // Startup load. A hard KV failure here is fatal; missing keys are not.
    let contexts = store.load_contexts().await?;
    let mappings = store.load_mappings().await?;
    let lifecycles = store.load_lifecycles().await?;
    let order_strategy = store.load_order_strategy().await?;
    let tracker = store.load_strategy_state().await?.unwrap_or_default();
    let contract_mappings = store.load_contract_mappings().await?;

    let mut core = CoreState::new(cfg.trading_enabled);
    core.registry.restore(contexts, mappings, lifecycles);
    core.registry.prune_lifecycles(Utc::now());
    core.order_strategy = order_strategy;
    core.tracker = tracker;
    info!(
        "🧭 State loaded: {} contexts, {} order links, {} strategy entries",
        core.registry.contexts().len(),
        core.registry.stats().linked_orders,
        core.tracker.positions().len(),
    );

    let state: SharedState = Arc::new(RwLock::new(core));
    let (event_tx, event_rx) = mpsc::channel(512);

    let listener = spawn_listener(bus.clone(), event_tx.clone()).await?;

    let orchestrator = Orchestrator {
        cfg,
        state: state.clone(),
        bus,
        store,
        resolver: SymbolResolver::new(sizing, contract_mappings),
        event_rx,
        parked: None,
    };
    let task = tokio::spawn(orchestrator.run());

    Ok(OrchestratorHandle {
        state,
        event_tx,
        task,
        listener,
    })
}

/// Subscribe to every consumed channel and forward typed events into the
/// orchestrator's in-box.
async fn spawn_listener(
    bus: Arc<dyn MessageBus>,
    event_tx: mpsc::Sender<InboundEvent>,
) -> anyhow::Result<JoinHandle<()>> {
    let mut rx = bus.subscribe(&channels::CONSUMED).await?;
    Ok(tokio::spawn(async move {
        while let Some(BusMessage { channel, data }) = rx.recv().await {
            let event = match channel.as_str() {
                channels::WEBHOOK_RECEIVED => Some(InboundEvent::Signal(data)),
                channels::TRADE_SIGNAL => Some(InboundEvent::Signal(data)),
                channels::ORDER_PLACED => Some(InboundEvent::OrderPlaced(data)),
                channels::ORDER_FILLED => Some(InboundEvent::OrderFilled(data)),
                channels::ORDER_REJECTED => Some(InboundEvent::OrderRejected(data)),
                channels::ORDER_CANCELLED => Some(InboundEvent::OrderCancelled(data)),
                channels::POSITION_UPDATE => {
                    // Skip the snapshots we published ourselves.
                    if data.get("source").and_then(|v| v.as_str()) == Some("orchestrator") {
                        None
                    } else {
                        Some(InboundEvent::PositionUpdate(data))
                    }
                }
                channels::POSITION_CLOSED => Some(InboundEvent::PositionClosed(data)),
                channels::PRICE_UPDATE => Some(InboundEvent::PriceUpdate(data)),
                channels::ORDERS_SYNCED => Some(InboundEvent::OrdersSynced(data)),
                channels::FULL_SYNC_STARTED => Some(InboundEvent::FullSyncStarted),
                channels::SYNC_COMPLETED => Some(InboundEvent::SyncCompleted),
                other => {
                    debug!("🧭 Ignoring frame on unexpected channel {other}");
                    None
                }
            };
            if let Some(event) = event {
                if event_tx.send(event).await.is_err() {
                    break; // orchestrator gone
                }
            }
        }
        info!("🧭 Bus listener stopped");
    }))
}

impl Orchestrator {
    pub async fn run(mut self) {
        info!(
            "🧭 Orchestrator started | freshness={}s sync_timeout={}s reversals={}",
            self.cfg.freshness.as_secs(),
            self.cfg.sync_timeout.as_secs(),
            self.cfg.allow_reversals,
        );

        loop {
            let park_deadline = self.parked.as_ref().map(|p| p.deadline);
            tokio::select! {
                event = self.event_rx.recv() => {
                    match event {
                        Some(InboundEvent::Shutdown) | None => break,
                        Some(event) => self.handle(event).await,
                    }
                }
                _ = async {
                    match park_deadline {
                        Some(d) => tokio::time::sleep_until(d).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    // Sync never answered: proceed degraded with local state.
                    warn!("🧭 Reconciliation wait timed out — admitting parked signal degraded");
                    {
                        let mut core = self.state.write().await;
                        core.sync_degraded = true;
                    }
                    self.release_parked(true).await;
                }
            }
        }

        self.flush().await;
        info!("🧭 Orchestrator stopped");
    }

    async fn handle(&mut self, event: InboundEvent) {
        match event {
            InboundEvent::Signal(value) => self.handle_signal(value).await,
            InboundEvent::OrderPlaced(value) => self.handle_order_placed(value).await,
            InboundEvent::OrderFilled(value) => self.handle_order_filled(value).await,
            InboundEvent::OrderRejected(value) => self.handle_order_terminal(value, false).await,
            InboundEvent::OrderCancelled(value) => self.handle_order_terminal(value, true).await,
            InboundEvent::PositionUpdate(value) => self.handle_position_update(value).await,
            InboundEvent::PositionClosed(value) => self.handle_position_closed(value).await,
            InboundEvent::PriceUpdate(value) => self.handle_price_update(value).await,
            InboundEvent::OrdersSynced(value) => self.handle_orders_synced(value).await,
            InboundEvent::FullSyncStarted => self.handle_full_sync_started().await,
            InboundEvent::SyncCompleted => self.handle_sync_completed().await,
            InboundEvent::Shutdown => {}
        }
    }

    // ── Effects ──

    /// Publish and persist the outcome of one mutation step. Runs with the
    /// lock released.
    pub(crate) async fn apply_effects(&self, fx: Effects) {
        for (channel, data) in fx.publishes {
            if let Err(err) = self.bus.publish(channel, data).await {
                warn!("🧭 Publish to {channel} failed: {err}");
            }
        }
        if fx.dirty.any() {
            self.persist(fx.dirty).await;
        }
    }

    pub(crate) async fn persist(&self, dirty: Dirty) {
        let core = self.state.read().await;
        if dirty.contexts {
            self.store.save_contexts(core.registry.contexts()).await;
        }
        if dirty.mappings {
            self.store.save_mappings(&core.registry.mappings_blob()).await;
        }
        if dirty.lifecycles {
            self.store.save_lifecycles(core.registry.lifecycles_blob()).await;
        }
        if dirty.order_strategy {
            self.store.save_order_strategy(&core.order_strategy).await;
        }
        if dirty.strategy_state {
            self.store.save_strategy_state(&core.tracker).await;
        }
    }

    /// Full state flush (shutdown / post-reconciliation).
    pub(crate) async fn flush(&self) {
        let core = self.state.read().await;
        self.store
            .flush_all(&core.registry, &core.tracker, &core.order_strategy)
            .await;
    }

    // ── Parked signal plumbing (see admission.rs) ──

    pub(crate) fn park(&mut self, signal: Signal) -> Option<Signal> {
        let displaced = self.parked.take().map(|p| p.signal);
        self.parked = Some(ParkedSignal {
            signal,
            deadline: tokio::time::Instant::now() + self.cfg.sync_timeout,
        });
        displaced
    }

    pub(crate) async fn release_parked(&mut self, force: bool) {
        if let Some(parked) = self.parked.take() {
            self.admit_entry(parked.signal, force).await;
        }
    }
}

// ─────────────────────────────────────────────────────────
// Envelope builders
// ─────────────────────────────────────────────────────────

pub(crate) fn trade_rejected(signal_id: Option<&str>, reason: &str, rule: Option<&str>) -> Value {
    let mut payload = json!({
        "reason": reason,
        "timestamp": Utc::now().to_rfc3339(),
    });
    if let Some(id) = signal_id {
        payload["signalId"] = json!(id);
    }
    if let Some(rule) = rule {
        payload["ruleName"] = json!(rule);
    }
    payload
}

pub(crate) fn trade_validated(signal: &Signal, symbol: &str, quantity: i64) -> Value {
    json!({
        "signalId": signal.signal_id,
        "strategy": signal.strategy,
        "symbol": symbol,
        "side": signal.side.as_str(),
        "quantity": quantity,
        "timestamp": Utc::now().to_rfc3339(),
    })
}

pub(crate) fn order_request(
    signal: &Signal,
    sizing: &crate::contracts::SizingOutcome,
) -> Value {
    let order_type = match signal.action {
        crate::events::SignalAction::PlaceMarket => "Market",
        _ => "Limit",
    };
    let mut payload = json!({
        "accountId": signal.account_id,
        "symbol": sizing.symbol,
        "action": crate::events::OrderAction::from_side(signal.side).as_str(),
        "quantity": sizing.quantity,
        "orderType": order_type,
        "signalId": signal.signal_id,
        "strategy": signal.strategy,
        "positionSizing": {
            "originalSymbol": sizing.original_symbol,
            "originalQuantity": sizing.original_quantity,
            "converted": sizing.converted,
            "reason": sizing.reason,
        },
    });
    if let Some(price) = signal.price {
        payload["price"] = json!(price);
    }
    if let Some(stop) = signal.stop_loss {
        payload["stopPrice"] = json!(stop);
    }
    if let Some(tp) = signal.take_profit {
        payload["takeProfit"] = json!(tp);
    }
    if let Some(t) = signal.trailing_trigger {
        payload["trailing_trigger"] = json!(t);
    }
    if let Some(o) = signal.trailing_offset {
        payload["trailing_offset"] = json!(o);
    }
    payload
}

pub(crate) fn cancel_request(order_id: &str, reason: &str) -> Value {
    json!({
        "orderId": order_id,
        "reason": reason,
        "timestamp": Utc::now().to_rfc3339(),
    })
}

pub(crate) fn position_update(position: &Position, side: &str) -> Value {
    json!({
        "source": "orchestrator",
        "symbol": position.symbol,
        "netPos": position.net_pos,
        "side": side,
        "entryPrice": position.entry_price,
        "unrealizedPnl": position.unrealized_pnl,
        "signalId": position.signal_id,
        "strategy": position.strategy,
        "timestamp": Utc::now().to_rfc3339(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_daily_pnl_resets_on_day_change() {
        let day1 = Utc.with_ymd_and_hms(2026, 2, 3, 20, 0, 0).unwrap();
        let day2 = Utc.with_ymd_and_hms(2026, 2, 4, 1, 0, 0).unwrap();
        let mut pnl = DailyPnl::new(day1);
        pnl.add(day1, -350.0);
        assert!((pnl.realized_today(day1) + 350.0).abs() < 1e-9);
        assert!((pnl.realized_today(day2)).abs() < 1e-9);
        pnl.add(day2, -100.0);
        assert!((pnl.realized_today(day2) + 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_rejection_envelope_carries_rule() {
        let v = trade_rejected(Some("s1"), "NQ already owned", Some("cross_strategy"));
        assert_eq!(v["signalId"], "s1");
        assert_eq!(v["ruleName"], "cross_strategy");
        assert!(v["reason"].as_str().unwrap().contains("NQ"));
    }
}
