//! Position aggregation — one logical position per concrete contract symbol.
//!
//! Entry-price rules: adding fills recompute the weighted average (rounded
//! to tick); reducing fills keep the old entry; a fill that flips the sign
//! resets the entry to that fill's price. Broker `POSITION_UPDATE` snapshots
//! are authoritative and may override any of it.

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::bus::channels;
use crate::contracts::{point_value_of_symbol, round_to_tick, underlying_of_symbol};
use crate::events::{BreakevenConfig, OrderAction, Position, PositionSnapshot};

use super::{cancel_request, position_update, CoreState, Dirty, Effects, Orchestrator};

/// Entry prices above this are treated as data corruption.
const ABSURD_PRICE: f64 = 1_000_000.0;

/// Context attached when a fill creates a position.
#[derive(Debug, Clone, Default)]
pub(super) struct FillAttach {
    pub signal_id: Option<String>,
    pub strategy: Option<String>,
    pub breakeven: Option<BreakevenConfig>,
}

#[derive(Debug)]
pub(super) struct FillResult {
    /// Realized dollars on the closed portion (0 when only adding).
    pub realized: f64,
    /// The position after the fill; `None` when it closed.
    pub after: Option<Position>,
    pub created: bool,
    pub closed: bool,
}

/// Apply one fill to the positions map. Pure with respect to the bus — the
/// caller publishes.
pub(super) fn apply_fill(
    core: &mut CoreState,
    symbol: &str,
    action: OrderAction,
    quantity: i64,
    fill_price: f64,
    attach: FillAttach,
    tick: f64,
) -> FillResult {
    let signed = action.sign() * quantity;
    let price = round_to_tick(fill_price, tick);
    let point_value = point_value_of_symbol(symbol);

    match core.positions.get_mut(symbol) {
        None => {
            let position = Position {
                symbol: symbol.to_string(),
                net_pos: signed,
                entry_price: price,
                current_price: Some(price),
                unrealized_pnl: 0.0,
                stop_loss_order_id: None,
                take_profit_order_id: None,
                signal_id: attach.signal_id.clone(),
                strategy: attach.strategy,
                breakeven: attach.breakeven,
                externally_sourced: attach.signal_id.is_none(),
                opened_at: Utc::now(),
            };
            info!(
                "📈 Position opened: {symbol} net={signed} @ {price:.2}",
            );
            core.positions.insert(symbol.to_string(), position.clone());
            FillResult {
                realized: 0.0,
                after: Some(position),
                created: true,
                closed: false,
            }
        }
        Some(pos) => {
            let old = pos.net_pos;
            let old_entry = pos.entry_price;
            let new = old + signed;
            let old_sign = old.signum();

            let mut realized = 0.0;
            if new == 0 {
                realized = (price - old_entry) * old_sign as f64 * old.abs() as f64 * point_value;
                let closed = pos.clone();
                core.positions.remove(symbol);
                info!("📈 Position closed: {symbol} realized ${realized:.2}");
                return FillResult {
                    realized,
                    after: Some(Position {
                        net_pos: 0,
                        ..closed
                    }),
                    created: false,
                    closed: true,
                };
            }

            if old_sign == new.signum() {
                if new.abs() > old.abs() {
                    // Adding: weighted-average entry, rounded to tick.
                    let blended =
                        ((old as f64 * old_entry + signed as f64 * price) / new as f64).abs();
                    pos.entry_price = round_to_tick(blended, tick);
                } else {
                    // Reducing: entry unchanged, realize the trimmed lot.
                    let trimmed = (old.abs() - new.abs()) as f64;
                    realized = (price - old_entry) * old_sign as f64 * trimmed * point_value;
                }
            } else {
                // Sign flip: realize the whole old lot, restart at fill price.
                realized = (price - old_entry) * old_sign as f64 * old.abs() as f64 * point_value;
                pos.entry_price = price;
                pos.opened_at = Utc::now();
                if attach.signal_id.is_some() {
                    pos.signal_id = attach.signal_id;
                    pos.strategy = attach.strategy;
                    pos.breakeven = attach.breakeven;
                }
            }
            pos.net_pos = new;
            pos.current_price = Some(price);

            // Sanity: an impossible entry is replaced by the fill price.
            if pos.entry_price <= 0.0 || pos.entry_price > ABSURD_PRICE {
                warn!(
                    "📈 Entry price {:.2} for {symbol} out of range — substituting fill price",
                    pos.entry_price
                );
                pos.entry_price = price;
            }

            let after = pos.clone();
            debug!(
                "📈 Position {symbol}: {} → {} entry={:.2}",
                old, new, after.entry_price
            );
            FillResult {
                realized,
                after: Some(after),
                created: false,
                closed: false,
            }
        }
    }
}

impl Orchestrator {
    // ─────────────────────────────────────────────────
    // Broker snapshots (authoritative)
    // ─────────────────────────────────────────────────

    pub(super) async fn handle_position_update(&mut self, value: Value) {
        let snap = match PositionSnapshot::parse(&value) {
            Ok(s) => s,
            Err(err) => {
                warn!("📈 Bad position snapshot: {err}");
                return;
            }
        };
        let Some(symbol) = self.snapshot_symbol(&snap) else {
            warn!(
                "📈 Position snapshot with unresolvable contractId {:?}",
                snap.contract_id
            );
            return;
        };

        if snap.net_pos == 0 {
            self.close_position_locally(&symbol, "broker reported flat").await;
            return;
        }

        let fx = {
            let mut core = self.state.write().await;
            let mut fx = Effects::default();
            let tick = self.resolver.tick();
            match core.positions.get_mut(&symbol) {
                Some(pos) => {
                    if pos.net_pos != snap.net_pos {
                        info!(
                            "📈 Broker snapshot overrides {symbol}: net {} → {}",
                            pos.net_pos, snap.net_pos
                        );
                        pos.net_pos = snap.net_pos;
                    }
                    if let Some(entry) = snap.entry_price {
                        if entry > 0.0 && entry < ABSURD_PRICE && pos.entry_price <= 0.0 {
                            pos.entry_price = round_to_tick(entry, tick);
                        }
                    }
                    if let Some(price) = snap.current_price {
                        pos.current_price = Some(price);
                    }
                }
                None => {
                    // Broker knows a position we don't: externally sourced
                    // until a full-sync stash match claims it.
                    let entry = snap
                        .entry_price
                        .filter(|e| *e > 0.0 && *e < ABSURD_PRICE)
                        .map(|e| round_to_tick(e, tick))
                        .unwrap_or(0.0);
                    let position = Position {
                        symbol: symbol.clone(),
                        net_pos: snap.net_pos,
                        entry_price: entry,
                        current_price: snap.current_price,
                        unrealized_pnl: 0.0,
                        stop_loss_order_id: None,
                        take_profit_order_id: None,
                        signal_id: None,
                        strategy: None,
                        breakeven: None,
                        externally_sourced: true,
                        opened_at: Utc::now(),
                    };
                    info!(
                        "📈 Externally sourced position: {symbol} net={}",
                        snap.net_pos
                    );
                    core.positions.insert(symbol.clone(), position);
                }
            }

            // A live broker position owns its underlying for admission.
            if let (Some(underlying), Some(side)) = (
                underlying_of_symbol(&symbol),
                core.positions.get(&symbol).and_then(|p| p.side()),
            ) {
                let source = core
                    .positions
                    .get(&symbol)
                    .and_then(|p| p.strategy.clone())
                    .unwrap_or_else(|| "external".to_string());
                core.tracker.set_position(underlying, side, &source);
                fx.dirty.strategy_state = true;
            }
            fx
        };
        self.apply_effects(fx).await;
    }

    pub(super) async fn handle_position_closed(&mut self, value: Value) {
        let snap = PositionSnapshot::parse(&value).ok();
        let symbol = snap
            .as_ref()
            .and_then(|s| self.snapshot_symbol(s))
            .or_else(|| crate::events::field_str(&value, &["symbol"]));
        match symbol {
            Some(symbol) => {
                self.close_position_locally(&symbol, "broker reported closed").await
            }
            None => warn!("📈 POSITION_CLOSED without resolvable symbol"),
        }
    }

    fn snapshot_symbol(&self, snap: &PositionSnapshot) -> Option<String> {
        snap.symbol.clone().or_else(|| {
            snap.contract_id
                .as_deref()
                .and_then(|id| self.resolver.mappings().symbol_for_contract_id(id))
        })
    }

    // ─────────────────────────────────────────────────
    // Close-out (fills, broker close, strategy close)
    // ─────────────────────────────────────────────────

    /// Remove a position and everything hanging off it: working orders for
    /// the symbol get cancel requests, the owning signal completes, the
    /// strategy tracker frees the underlying. Idempotent — a second call for
    /// the same symbol is a no-op.
    pub(super) async fn close_position_locally(&mut self, symbol: &str, reason: &str) {
        let fx = {
            let mut core = self.state.write().await;
            let Some(position) = core.positions.remove(symbol) else {
                debug!("📈 close for {symbol} ignored — no position ({reason})");
                return;
            };
            let mut fx = Effects::default();
            retire_position(&mut core, &mut fx, &position, reason);
            fx.publish(channels::POSITION_UPDATE, position_update(&position, "flat"));
            fx.dirty.merge(Dirty::all());
            info!("📈 Position {symbol} closed ({reason})");
            fx
        };
        self.apply_effects(fx).await;
    }
}

/// Post-close teardown, shared by broker closes and closing fills. The
/// position itself must already be out of the map.
pub(super) fn retire_position(
    core: &mut CoreState,
    fx: &mut Effects,
    position: &Position,
    reason: &str,
) {
    let symbol = position.symbol.as_str();

    // Cancel and drop every working order still targeting the symbol —
    // bracket OCO siblings included. Duplicate cancel acks are benign.
    let order_ids: Vec<String> = core
        .working_orders
        .values()
        .filter(|o| o.symbol == symbol)
        .map(|o| o.order_id.clone())
        .collect();
    for oid in &order_ids {
        core.working_orders.remove(oid);
        core.registry.unlink_order(oid);
        core.order_strategy.remove(oid);
        core.tracker.remove_pending(oid);
        fx.publish(channels::ORDER_CANCEL_REQUEST, cancel_request(oid, reason));
    }

    if let Some(sid) = position.signal_id.as_deref() {
        core.registry.cleanup_signal(sid, reason);
    }
    if let Some(underlying) = underlying_of_symbol(symbol) {
        for stale in core.tracker.position_closed(underlying) {
            fx.publish(channels::ORDER_CANCEL_REQUEST, cancel_request(&stale, reason));
        }
        // A sibling contract (e.g. the micro) may still be open on this
        // underlying — it keeps ownership.
        if let Some(other) = core
            .positions
            .values()
            .find(|p| underlying_of_symbol(&p.symbol) == Some(underlying))
        {
            if let Some(side) = other.side() {
                let source = other.strategy.clone().unwrap_or_else(|| "external".to_string());
                core.tracker.set_position(underlying, side, &source);
            }
        }
    }
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn core() -> CoreState {
        CoreState::new(true)
    }

    fn fill(
        core: &mut CoreState,
        action: OrderAction,
        qty: i64,
        price: f64,
    ) -> FillResult {
        apply_fill(core, "NQH6", action, qty, price, FillAttach::default(), 0.25)
    }

    #[test]
    fn test_create_long_position() {
        let mut c = core();
        let r = fill(&mut c, OrderAction::Buy, 1, 21000.25);
        assert!(r.created);
        let p = c.positions.get("NQH6").unwrap();
        assert_eq!(p.net_pos, 1);
        assert!((p.entry_price - 21000.25).abs() < 1e-9);
    }

    #[test]
    fn test_adding_recomputes_weighted_entry() {
        let mut c = core();
        fill(&mut c, OrderAction::Buy, 1, 21000.0);
        let r = fill(&mut c, OrderAction::Buy, 1, 21010.0);
        let p = r.after.unwrap();
        assert_eq!(p.net_pos, 2);
        assert!((p.entry_price - 21005.0).abs() < 1e-9);
        assert!((r.realized).abs() < 1e-9);
    }

    #[test]
    fn test_weighted_entry_rounds_to_tick() {
        let mut c = core();
        fill(&mut c, OrderAction::Buy, 1, 21000.0);
        let r = fill(&mut c, OrderAction::Buy, 2, 21000.2);
        // (21000 + 2*21000.25)/3 = 21000.1666 → 21000.25 tick
        let p = r.after.unwrap();
        assert!((p.entry_price - 21000.25).abs() < 1e-9, "{}", p.entry_price);
    }

    #[test]
    fn test_reducing_keeps_entry_and_realizes() {
        let mut c = core();
        fill(&mut c, OrderAction::Buy, 2, 21000.0);
        let r = fill(&mut c, OrderAction::Sell, 1, 21010.0);
        let p = r.after.unwrap();
        assert_eq!(p.net_pos, 1);
        assert!((p.entry_price - 21000.0).abs() < 1e-9);
        // 10 points × $20 × 1 contract
        assert!((r.realized - 200.0).abs() < 1e-9);
    }

    #[test]
    fn test_close_realizes_full_lot() {
        let mut c = core();
        fill(&mut c, OrderAction::Sell, 1, 21000.0);
        let r = fill(&mut c, OrderAction::Buy, 1, 20990.0);
        assert!(r.closed);
        assert!(c.positions.is_empty());
        // Short 1 @21000 covered @20990 → +10pts × $20
        assert!((r.realized - 200.0).abs() < 1e-9);
    }

    #[test]
    fn test_flip_resets_entry_to_fill_price() {
        let mut c = core();
        fill(&mut c, OrderAction::Buy, 1, 21000.0);
        let r = fill(&mut c, OrderAction::Sell, 2, 20990.0);
        let p = r.after.unwrap();
        assert_eq!(p.net_pos, -1);
        assert!((p.entry_price - 20990.0).abs() < 1e-9);
        // Long leg closed at a 10pt loss.
        assert!((r.realized + 200.0).abs() < 1e-9);
    }

    #[test]
    fn test_absurd_entry_substituted() {
        let mut c = core();
        fill(&mut c, OrderAction::Buy, 1, 21000.0);
        c.positions.get_mut("NQH6").unwrap().entry_price = -5.0;
        let r = fill(&mut c, OrderAction::Buy, 1, 21008.0);
        let p = r.after.unwrap();
        assert!(p.entry_price > 0.0);
    }

    #[test]
    fn test_fill_sequence_net_consistency() {
        // Net position always equals the running sum of signed fills.
        let mut c = core();
        let seq = [
            (OrderAction::Buy, 2, 21000.0),
            (OrderAction::Buy, 1, 21010.0),
            (OrderAction::Sell, 2, 21005.0),
            (OrderAction::Sell, 3, 20995.0),
            (OrderAction::Buy, 2, 20990.0),
        ];
        let mut expected = 0i64;
        for (action, qty, price) in seq {
            fill(&mut c, action, qty, price);
            expected += action.sign() * qty;
            let net = c.positions.get("NQH6").map(|p| p.net_pos).unwrap_or(0);
            assert_eq!(net, expected);
        }
    }

    #[test]
    fn test_micro_point_value_in_realized() {
        let mut c = core();
        apply_fill(&mut c, "MNQH6", OrderAction::Buy, 2, 21000.0, FillAttach::default(), 0.25);
        let r = apply_fill(&mut c, "MNQH6", OrderAction::Sell, 2, 21010.0, FillAttach::default(), 0.25);
        assert!(r.closed);
        // 10pts × $2 × 2 contracts
        assert!((r.realized - 40.0).abs() < 1e-9);
    }
}
