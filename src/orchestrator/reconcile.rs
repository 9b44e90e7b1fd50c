//! Reconciliation — keeping local state honest against broker ground truth.
//!
//! Incremental: the broker publishes its current working-order id set; local
//! orders absent from it were filled or cancelled while we weren't looking
//! and are dropped, along with stale strategy entries and pending refs.
//!
//! Full: `FULL_SYNC_STARTED` stashes the signal contexts and clears local
//! positions/orders; the broker then streams its ground truth back through
//! the ordinary `POSITION_UPDATE` / `ORDER_PLACED` channels; on
//! `SYNC_COMPLETED` each rebuilt position is re-matched to a stashed context
//! (symbol + price ≤10pt, or symbol + registration ≤5min — both
//! configurable), which restores strategy labels, breakeven config, repaired
//! entry prices, and bracket links. Whatever the stash still holds is
//! orphaned and discarded. Local contradictions always lose to the broker.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::contracts::{round_to_tick, underlying_of_symbol};
use crate::events::{OrderRole, Position, SignalContext};

use super::orders::breakeven_from;
use super::{CoreState, Dirty, Effects, Orchestrator};

impl Orchestrator {
    // ─────────────────────────────────────────────────
    // Incremental sync
    // ─────────────────────────────────────────────────

    pub(super) async fn handle_orders_synced(&mut self, value: Value) {
        let broker_set = parse_order_id_set(&value);

        let fx = {
            let mut guard = self.state.write().await;
            let core = &mut *guard;
            let mut fx = Effects::default();

            // Working orders the broker no longer knows: a fill or cancel
            // slipped past us. Drop them; position snapshots carry the truth.
            let gone: Vec<String> = core
                .working_orders
                .keys()
                .filter(|oid| !broker_set.contains(*oid))
                .cloned()
                .collect();
            for oid in &gone {
                warn!("🔄 Dropping working order {oid} — absent from broker set");
                core.working_orders.remove(oid);
                core.registry.unlink_order(oid);
                core.order_strategy.remove(oid);
                core.tracker.remove_pending(oid);
            }

            // Strategy entries with no concrete position are stale.
            let live_underlyings: HashSet<String> = core
                .positions
                .values()
                .filter_map(|p| underlying_of_symbol(&p.symbol))
                .map(|u| u.as_str().to_string())
                .collect();
            core.tracker.retain_positions(|u| {
                let keep = live_underlyings.contains(u);
                if !keep {
                    warn!("🔄 Dropping stale strategy entry for {u}");
                }
                keep
            });

            // Pending refs the broker doesn't hold. Provisional refs (ack
            // still in flight) get a short grace window.
            let grace = self.cfg.freshness;
            core.tracker.retain_pending(|key, entry| {
                if key.starts_with("signal:") {
                    let age = Utc::now() - entry.created_at;
                    age.to_std().map(|a| a < grace).unwrap_or(true)
                } else {
                    broker_set.contains(key)
                }
            });

            core.last_sync = Some(Instant::now());
            core.sync_degraded = false;
            fx.dirty.merge(Dirty::all());
            info!(
                "🔄 Incremental sync: {} broker orders, {} local dropped",
                broker_set.len(),
                gone.len()
            );
            fx
        };
        self.apply_effects(fx).await;

        // A parked signal was waiting on exactly this.
        self.release_parked(false).await;
    }

    // ─────────────────────────────────────────────────
    // Full sync
    // ─────────────────────────────────────────────────

    pub(super) async fn handle_full_sync_started(&mut self) {
        let mut core = self.state.write().await;
        if core.full_sync_active() {
            debug!("🔄 FULL_SYNC_STARTED while already syncing — restashing");
        }
        let stashed = core.registry.take_contexts();
        info!(
            "🔄 Full sync started: stashed {} contexts, clearing {} positions / {} orders",
            stashed.len(),
            core.positions.len(),
            core.working_orders.len()
        );
        core.stash = Some(stashed);
        core.positions.clear();
        core.working_orders.clear();
    }

    pub(super) async fn handle_sync_completed(&mut self) {
        let fx = {
            let mut guard = self.state.write().await;
            let core = &mut *guard;
            let mut fx = Effects::default();

            let Some(mut stash) = core.stash.take() else {
                // Bare completion (no preceding FULL_SYNC_STARTED): just
                // refresh the clock.
                core.last_sync = Some(Instant::now());
                core.sync_degraded = false;
                drop(guard);
                self.release_parked(false).await;
                return;
            };

            let tick = self.resolver.tick();
            let now = Utc::now();
            let CoreState {
                positions,
                working_orders,
                registry,
                tracker,
                ..
            } = &mut *core;

            for pos in positions.values_mut() {
                let matched = match_stash(
                    &stash,
                    pos,
                    self.cfg.stash_price_tolerance,
                    self.cfg.stash_time_tolerance,
                    now,
                );
                let Some(sid) = matched else {
                    // Truly external — it still owns its underlying.
                    if let (Some(u), Some(side)) = (underlying_of_symbol(&pos.symbol), pos.side()) {
                        tracker.set_position(u, side, "external");
                    }
                    continue;
                };
                let Some(ctx) = stash.remove(&sid) else { continue };

                // Promote the context back to active and relabel the position.
                pos.signal_id = Some(sid.clone());
                pos.strategy = Some(ctx.signal.strategy.clone());
                pos.externally_sourced = false;
                if pos.entry_price <= 0.0 {
                    if let Some(price) = ctx.signal.price {
                        info!(
                            "🔄 Repairing {} entry from stash: {:.2}",
                            pos.symbol, price
                        );
                        pos.entry_price = round_to_tick(price, tick);
                    }
                }
                pos.breakeven = pos.breakeven.take().or_else(|| {
                    breakeven_from(
                        ctx.signal.breakeven_trigger,
                        ctx.signal.breakeven_offset,
                        ctx.signal.stop_loss,
                        self.cfg.breakeven_defaults.get(&ctx.signal.strategy),
                    )
                });

                // Re-link bracket children by price proximity.
                let tol = self.cfg.bracket_price_tolerance;
                for order in working_orders.values_mut() {
                    if order.symbol != pos.symbol {
                        continue;
                    }
                    let stop_match = matches!(
                        (order.stop_price, ctx.signal.stop_loss),
                        (Some(a), Some(b)) if (a - b).abs() <= tol
                    );
                    let tp_match = matches!(
                        (order.price, ctx.signal.take_profit),
                        (Some(a), Some(b)) if (a - b).abs() <= tol
                    );
                    if stop_match {
                        order.role = OrderRole::StopLoss;
                        order.signal_id = Some(sid.clone());
                        pos.stop_loss_order_id = Some(order.order_id.clone());
                        registry.link_order(&sid, &order.order_id);
                    } else if tp_match {
                        order.role = OrderRole::TakeProfit;
                        order.signal_id = Some(sid.clone());
                        pos.take_profit_order_id = Some(order.order_id.clone());
                        registry.link_order(&sid, &order.order_id);
                    }
                }

                registry.insert_context(ctx);
                registry.link_position(&sid, &pos.symbol);
                if let (Some(u), Some(side)) = (underlying_of_symbol(&pos.symbol), pos.side()) {
                    tracker.set_position(u, side, pos.strategy.as_deref().unwrap_or("external"));
                }
                info!("🔄 Context {sid} re-matched to {}", pos.symbol);
            }

            // Orphans: the broker has nothing these contexts describe.
            if !stash.is_empty() {
                info!("🔄 Discarding {} orphaned stash contexts", stash.len());
                for sid in stash.keys() {
                    debug!("🔄   orphan {sid}");
                }
            }

            // Order links that survived the clear but point nowhere.
            let dangling: Vec<String> = registry
                .mappings_blob()
                .order_to_signal
                .keys()
                .filter(|oid| !working_orders.contains_key(*oid))
                .cloned()
                .collect();
            for oid in dangling {
                registry.unlink_order(&oid);
            }

            core.last_sync = Some(Instant::now());
            core.sync_degraded = false;
            fx.dirty.merge(Dirty::all());
            info!(
                "🔄 Full sync completed: {} positions, {} working orders",
                core.positions.len(),
                core.working_orders.len()
            );
            fx
        };
        self.apply_effects(fx).await;
        self.release_parked(false).await;
    }
}

// ─────────────────────────────────────────────────────────
// Stash matching
// ─────────────────────────────────────────────────────────

/// Find the stashed context for a rebuilt position: exact symbol plus either
/// price proximity or registration-time proximity.
fn match_stash(
    stash: &HashMap<String, SignalContext>,
    pos: &Position,
    price_tolerance: f64,
    time_tolerance: Duration,
    now: chrono::DateTime<Utc>,
) -> Option<String> {
    let time_tolerance =
        chrono::Duration::from_std(time_tolerance).unwrap_or(chrono::Duration::minutes(5));
    stash
        .iter()
        .find(|(_, ctx)| {
            if ctx.concrete_symbol.as_deref() != Some(pos.symbol.as_str()) {
                return false;
            }
            let price_ok = pos.entry_price > 0.0
                && ctx
                    .signal
                    .price
                    .is_some_and(|p| (p - pos.entry_price).abs() <= price_tolerance);
            let time_ok = (now - ctx.registered_at) <= time_tolerance;
            price_ok || time_ok
        })
        .map(|(sid, _)| sid.clone())
}

fn parse_order_id_set(value: &Value) -> HashSet<String> {
    let arr = value
        .get("workingOrderIds")
        .or_else(|| value.get("orderIds"))
        .and_then(|v| v.as_array());
    let mut set = HashSet::new();
    if let Some(arr) = arr {
        for item in arr {
            match item {
                Value::String(s) => {
                    set.insert(s.trim().to_string());
                }
                Value::Number(n) => {
                    set.insert(n.to_string());
                }
                _ => {}
            }
        }
    }
    set
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Side, Signal, SignalAction};
    use serde_json::json;

    fn ctx(id: &str, symbol: &str, price: Option<f64>) -> SignalContext {
        SignalContext::new(
            Signal {
                signal_id: id.to_string(),
                strategy: "IV_SKEW_GEX".to_string(),
                symbol: "NQ1!".to_string(),
                side: Side::Long,
                action: SignalAction::PlaceLimit,
                price,
                stop_loss: Some(20980.0),
                take_profit: Some(21060.0),
                trailing_trigger: None,
                trailing_offset: None,
                breakeven_trigger: Some(20.0),
                breakeven_offset: Some(5.0),
                quantity: Some(1.0),
                account_id: None,
                reason: None,
                received_at: Utc::now(),
            },
            Some(symbol.to_string()),
        )
    }

    fn pos(symbol: &str, entry: f64) -> Position {
        Position {
            symbol: symbol.to_string(),
            net_pos: 1,
            entry_price: entry,
            current_price: None,
            unrealized_pnl: 0.0,
            stop_loss_order_id: None,
            take_profit_order_id: None,
            signal_id: None,
            strategy: None,
            breakeven: None,
            externally_sourced: true,
            opened_at: Utc::now(),
        }
    }

    #[test]
    fn test_match_by_price_proximity() {
        let mut stash = HashMap::new();
        stash.insert("s1".to_string(), ctx("s1", "NQH6", Some(21000.0)));
        // Entry within 10 points.
        let m = match_stash(&stash, &pos("NQH6", 21004.0), 10.0, Duration::from_secs(0), Utc::now() + chrono::Duration::hours(1));
        assert_eq!(m, Some("s1".to_string()));
        // 11 points off, and time window exhausted → no match.
        let m = match_stash(&stash, &pos("NQH6", 21011.5), 10.0, Duration::from_secs(0), Utc::now() + chrono::Duration::hours(1));
        assert_eq!(m, None);
    }

    #[test]
    fn test_match_by_time_when_broker_entry_is_zero() {
        let mut stash = HashMap::new();
        stash.insert("s1".to_string(), ctx("s1", "NQH6", Some(21000.0)));
        // Broker reported entryPrice=0 — price match impossible, freshness
        // carries it.
        let m = match_stash(&stash, &pos("NQH6", 0.0), 10.0, Duration::from_secs(300), Utc::now());
        assert_eq!(m, Some("s1".to_string()));
    }

    #[test]
    fn test_match_requires_symbol() {
        let mut stash = HashMap::new();
        stash.insert("s1".to_string(), ctx("s1", "NQH6", Some(21000.0)));
        let m = match_stash(&stash, &pos("ESH6", 21000.0), 10.0, Duration::from_secs(300), Utc::now());
        assert_eq!(m, None);
    }

    #[test]
    fn test_parse_order_id_set_coerces_numbers() {
        let set = parse_order_id_set(&json!({"workingOrderIds": ["o1", 42, null]}));
        assert!(set.contains("o1"));
        assert!(set.contains("42"));
        assert_eq!(set.len(), 2);
    }
}
