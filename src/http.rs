//! Read-only HTTP query surface plus the trading-flag switch.
//!
//! Everything here reads the shared core state; the only write is the
//! global trading flag. All responses are JSON, times ISO-8601 UTC.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{json, Value};
use tracing::info;

use crate::bus::MessageBus;
use crate::contracts::underlying_of_symbol;
use crate::events::{Order, Position};
use crate::orchestrator::{CoreState, SharedState};

#[derive(Clone)]
pub struct AppState {
    pub core: SharedState,
    pub bus: Arc<dyn MessageBus>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/trading/enable", post(trading_enable))
        .route("/trading/disable", post(trading_disable))
        .route("/api/trading/positions", get(positions))
        .route("/api/trading/orders", get(orders))
        .route("/api/trading/enhanced-status", get(enhanced_status))
        .with_state(state)
}

/// Bind and serve until `shutdown` resolves. A bind failure is fatal for
/// the service.
pub async fn serve(
    state: AppState,
    addr: SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("🌐 HTTP surface listening on {addr}");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> Json<Value> {
    let core = state.core.read().await;
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
        "tradingEnabled": core.trading_enabled,
        "busConnected": state.bus.is_connected(),
        "lastSyncAgeSecs": core.last_sync.map(|t| t.elapsed().as_secs()),
        "syncDegraded": core.sync_degraded,
        "fullSyncActive": core.full_sync_active(),
        "positions": core.positions.len(),
        "workingOrders": core.working_orders.len(),
        "registry": core.registry.stats(),
        "stats": core.stats,
    }))
}

async fn trading_enable(State(state): State<AppState>) -> Json<Value> {
    set_trading(&state, true).await
}

async fn trading_disable(State(state): State<AppState>) -> Json<Value> {
    set_trading(&state, false).await
}

async fn set_trading(state: &AppState, enabled: bool) -> Json<Value> {
    let mut core = state.core.write().await;
    core.trading_enabled = enabled;
    info!("🌐 Trading {}", if enabled { "ENABLED" } else { "DISABLED" });
    Json(json!({ "tradingEnabled": enabled }))
}

async fn positions(State(state): State<AppState>) -> Json<Value> {
    let core = state.core.read().await;
    let list: Vec<Value> = core.positions.values().map(|p| position_view(p, &core)).collect();
    Json(json!({ "positions": list, "timestamp": Utc::now().to_rfc3339() }))
}

async fn orders(State(state): State<AppState>) -> Json<Value> {
    let core = state.core.read().await;
    let list: Vec<Value> = core.working_orders.values().map(order_view).collect();
    Json(json!({ "orders": list, "timestamp": Utc::now().to_rfc3339() }))
}

/// Positions and pending entry orders enriched with signal context, current
/// price, and distance-to-market. Bracket children, orders whose signal
/// already holds a position, and entries shadowed by an existing position on
/// the same symbol are filtered out of the pending view.
async fn enhanced_status(State(state): State<AppState>) -> Json<Value> {
    let core = state.core.read().await;

    let positions: Vec<Value> = core
        .positions
        .values()
        .map(|p| position_view(p, &core))
        .collect();

    let pending: Vec<Value> = core
        .working_orders
        .values()
        .filter(|o| pending_view_visible(o, &core))
        .map(|o| {
            let mut view = order_view(o);
            let current = current_price_for(&core, &o.symbol);
            view["currentPrice"] = json!(current);
            if let Some(sid) = &o.signal_id {
                if let Some(ctx) = core.registry.context(sid) {
                    view["signalContext"] = json!(ctx.signal);
                }
            }
            if let (Some(current), Some(target)) = (current, o.price.or(o.stop_price)) {
                view["distanceToMarket"] = distance_to_market(current, target);
            }
            view
        })
        .collect();

    Json(json!({
        "tradingEnabled": core.trading_enabled,
        "positions": positions,
        "pendingOrders": pending,
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

// ─────────────────────────────────────────────────────────
// View helpers
// ─────────────────────────────────────────────────────────

fn pending_view_visible(order: &Order, core: &CoreState) -> bool {
    // (a) bracket children never show as pending entries.
    if order.role.is_bracket_child() {
        return false;
    }
    // (b) signal already produced a position.
    if let Some(sid) = &order.signal_id {
        if core.registry.position_for_signal(sid).is_some() {
            return false;
        }
    }
    // (c) an entry shadowed by an existing position on the same symbol.
    if core.positions.contains_key(&order.symbol) {
        return false;
    }
    true
}

fn current_price_for(core: &CoreState, symbol: &str) -> Option<f64> {
    underlying_of_symbol(symbol).and_then(|u| core.last_prices.get(u.as_str()).copied())
}

fn position_view(p: &Position, core: &CoreState) -> Value {
    let mut v = json!(p);
    v["side"] = json!(p.side().map(|s| s.as_str()).unwrap_or("flat"));
    if v.get("currentPrice").map(Value::is_null).unwrap_or(true) {
        v["currentPrice"] = json!(current_price_for(core, &p.symbol));
    }
    v
}

fn order_view(o: &Order) -> Value {
    json!(o)
}

/// Distance of a resting order from the market: how far, which side of the
/// market it rests on, and which way price must travel to reach it.
fn distance_to_market(current: f64, target: f64) -> Value {
    let points = (current - target).abs();
    let (direction, needs_to_move) = if target < current {
        ("below_market", "down")
    } else if target > current {
        ("above_market", "up")
    } else {
        ("at_market", "none")
    };
    json!({
        "points": (points * 100.0).round() / 100.0,
        "direction": direction,
        "needsToMove": needs_to_move,
    })
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────
