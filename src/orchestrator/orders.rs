//! Order lifecycle — broker acks, fills, rejections, cancellations.
//!
//! The tricky part is attribution: bracket children arrive with no signal
//! correlation id, so `ORDER_PLACED` resolves the owning signal through a
//! fallback chain: explicit signalId → existing registry mapping → symbol +
//! recency + price proximity against active signals → the broker-side
//! strategy group of an already-attributed sibling.

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::bus::channels;
use crate::contracts::underlying_of_symbol;
use crate::events::{
    Order, OrderAction, OrderEvent, OrderRole, OrderStatus, OrderType, Side,
};
use crate::strategy::provisional_key;

use super::positions::{apply_fill, retire_position, FillAttach};
use super::{cancel_request, position_update, CoreState, Dirty, Effects, Orchestrator};

impl Orchestrator {
    // ─────────────────────────────────────────────────
    // ORDER_PLACED
    // ─────────────────────────────────────────────────

    pub(super) async fn handle_order_placed(&mut self, value: Value) {
        let ev = match OrderEvent::parse(&value) {
            Ok(ev) => ev,
            Err(err) => {
                warn!("📋 Bad ORDER_PLACED frame: {err}");
                return;
            }
        };

        let fx = {
            let mut core = self.state.write().await;
            if core.working_orders.contains_key(&ev.order_id) {
                debug!("📋 ORDER_PLACED redelivery for {} — no-op", ev.order_id);
                return;
            }

            let signal_id = attribute_order(&core, &ev, self.cfg.bracket_price_tolerance,
                self.cfg.stash_time_tolerance);
            let role = infer_role(&core, &ev, signal_id.as_deref());

            let symbol = ev
                .symbol
                .clone()
                .or_else(|| {
                    signal_id.as_deref().and_then(|sid| {
                        core.registry
                            .context(sid)
                            .and_then(|c| c.concrete_symbol.clone())
                    })
                })
                .unwrap_or_default();
            if symbol.is_empty() {
                warn!("📋 ORDER_PLACED {} without symbol — dropped", ev.order_id);
                return;
            }

            let action = ev
                .action
                .or_else(|| {
                    signal_id.as_deref().and_then(|sid| {
                        core.registry.context(sid).map(|c| match role {
                            OrderRole::Entry => OrderAction::from_side(c.signal.side),
                            _ => OrderAction::from_side(c.signal.side.flip()),
                        })
                    })
                })
                .unwrap_or(OrderAction::Buy);

            let order = Order {
                order_id: ev.order_id.clone(),
                strategy_id: ev.strategy_id.clone(),
                signal_id: signal_id.clone(),
                symbol: symbol.clone(),
                action,
                quantity: ev.quantity.unwrap_or(1.0),
                order_type: ev.order_type.unwrap_or(match role {
                    OrderRole::StopLoss => OrderType::Stop,
                    _ => OrderType::Limit,
                }),
                price: ev.price,
                stop_price: ev.stop_price,
                role,
                status: OrderStatus::Working,
                placed_at: Utc::now(),
            };
            core.working_orders.insert(ev.order_id.clone(), order);

            let mut fx = Effects::default();
            if let Some(group) = ev.strategy_id.clone() {
                core.order_strategy.insert(ev.order_id.clone(), group);
                fx.dirty.order_strategy = true;
            }

            if let Some(sid) = signal_id {
                core.registry.link_order(&sid, &ev.order_id);
                fx.dirty.merge(Dirty::registry());
                match role {
                    OrderRole::Entry => {
                        // Swap the provisional admission ref for the broker id.
                        core.tracker.promote_pending(&sid, &ev.order_id);
                        if !core.tracker.pending().contains_key(&ev.order_id) {
                            // Restart lost the provisional: rebuild from context.
                            if let Some(ctx) = core.registry.context(&sid) {
                                let strategy = ctx.signal.strategy.clone();
                                let direction = ctx.signal.side;
                                core.tracker.insert_pending(
                                    ev.order_id.clone(),
                                    crate::strategy::PendingOrderRef {
                                        strategy,
                                        direction,
                                        symbol: symbol.clone(),
                                        price: ev.price,
                                        quantity: ev.quantity.unwrap_or(1.0).round() as i64,
                                        created_at: Utc::now(),
                                    },
                                );
                            }
                        }
                        fx.dirty.strategy_state = true;
                    }
                    OrderRole::StopLoss => {
                        if let Some(pos) = core.positions.get_mut(&symbol) {
                            pos.stop_loss_order_id = Some(ev.order_id.clone());
                        }
                    }
                    OrderRole::TakeProfit => {
                        if let Some(pos) = core.positions.get_mut(&symbol) {
                            pos.take_profit_order_id = Some(ev.order_id.clone());
                        }
                    }
                }
                info!(
                    "📋 Order {} working ({:?} {symbol}) ← signal {sid}",
                    ev.order_id, role
                );
            } else {
                info!(
                    "📋 Order {} working ({:?} {symbol}) — unattributed",
                    ev.order_id, role
                );
            }
            fx
        };
        self.apply_effects(fx).await;
    }

    // ─────────────────────────────────────────────────
    // ORDER_FILLED
    // ─────────────────────────────────────────────────

    pub(super) async fn handle_order_filled(&mut self, value: Value) {
        let ev = match OrderEvent::parse(&value) {
            Ok(ev) => ev,
            Err(err) => {
                warn!("📋 Bad ORDER_FILLED frame: {err}");
                return;
            }
        };
        let Some(fill_price) = ev.fill_price.or(ev.price) else {
            warn!("📋 ORDER_FILLED {} without a price — dropped", ev.order_id);
            return;
        };
        let quantity = ev
            .fill_quantity
            .or(ev.quantity)
            .map(|q| q.round() as i64)
            .filter(|q| *q > 0)
            .unwrap_or(1);

        let fx = {
            let mut core = self.state.write().await;

            // At-least-once redelivery: a fill is identified by what it did.
            let fill_key = format!("{}:{}:{:.4}", ev.order_id, quantity, fill_price);
            if !core.seen_fills.insert(fill_key) {
                debug!("📋 Duplicate fill for {} — no-op", ev.order_id);
                return;
            }
            core.stats.fills_processed += 1;

            let order = core.working_orders.remove(&ev.order_id);
            let signal_id = ev
                .signal_id
                .clone()
                .or_else(|| order.as_ref().and_then(|o| o.signal_id.clone()))
                .or_else(|| core.registry.signal_for_order(&ev.order_id).cloned());

            let symbol = ev
                .symbol
                .clone()
                .or_else(|| order.as_ref().map(|o| o.symbol.clone()))
                .or_else(|| {
                    signal_id.as_deref().and_then(|sid| {
                        core.registry
                            .context(sid)
                            .and_then(|c| c.concrete_symbol.clone())
                    })
                });
            let Some(symbol) = symbol else {
                warn!("📋 Fill for {} with no resolvable symbol — dropped", ev.order_id);
                return;
            };

            let role = order
                .as_ref()
                .map(|o| o.role)
                .or(ev.role)
                .unwrap_or_else(|| {
                    if core.tracker.pending().contains_key(&ev.order_id) {
                        OrderRole::Entry
                    } else if core.positions.contains_key(&symbol) {
                        // A fill on a symbol we already hold, with no tracked
                        // order: treat as an exit-side adjustment.
                        OrderRole::StopLoss
                    } else {
                        OrderRole::Entry
                    }
                });

            let signal_side = signal_id
                .as_deref()
                .and_then(|sid| core.registry.context(sid).map(|c| c.signal.side));
            let action = resolve_fill_action(&ev, role, signal_side);

            // Entry fills carry signal context onto the position.
            let attach = if role == OrderRole::Entry {
                let ctx = signal_id
                    .as_deref()
                    .and_then(|sid| core.registry.context(sid).cloned());
                FillAttach {
                    signal_id: signal_id.clone(),
                    strategy: ctx.as_ref().map(|c| c.signal.strategy.clone()),
                    breakeven: ctx.as_ref().and_then(|c| {
                        breakeven_from(
                            c.signal.breakeven_trigger,
                            c.signal.breakeven_offset,
                            c.signal.stop_loss,
                            self.cfg.breakeven_defaults.get(&c.signal.strategy),
                        )
                    }),
                }
            } else {
                FillAttach::default()
            };

            let mut fx = Effects::default();
            let result = apply_fill(
                &mut core,
                &symbol,
                action,
                quantity,
                fill_price,
                attach,
                self.resolver.tick(),
            );

            if result.realized.abs() > f64::EPSILON {
                core.daily.add(Utc::now(), result.realized);
            }

            if let Some(after) = &result.after {
                let side = after
                    .side()
                    .map(|s| s.as_str())
                    .unwrap_or("flat");
                fx.publish(channels::POSITION_UPDATE, position_update(after, side));
            }

            // Entry fill: record the winning strategy and cancel the sibling
            // pending entries on the same underlying, atomically with this
            // step.
            if role == OrderRole::Entry {
                if result.created {
                    if let Some(sid) = signal_id.as_deref() {
                        core.registry.link_position(sid, &symbol);
                    }
                }
                if let (Some(underlying), Some(sid)) =
                    (underlying_of_symbol(&symbol), signal_id.as_deref())
                {
                    let strategy = core
                        .registry
                        .context(sid)
                        .map(|c| c.signal.strategy.clone())
                        .unwrap_or_else(|| "unknown".to_string());
                    let side = match action {
                        OrderAction::Buy => Side::Long,
                        OrderAction::Sell => Side::Short,
                    };
                    core.tracker.remove_pending(&provisional_key(sid));
                    let siblings =
                        core.tracker
                            .entry_filled(&ev.order_id, underlying, side, &strategy);
                    for sibling in siblings {
                        info!("📋 Sibling cancel: {sibling} loses {underlying} to {strategy}");
                        fx.publish(
                            channels::ORDER_CANCEL_REQUEST,
                            cancel_request(&sibling, "sibling entry filled"),
                        );
                    }
                }
            }

            // An exit-side fill that flips (or keeps) the position must leave
            // the ownership map agreeing with the position's actual sign.
            if role != OrderRole::Entry && !result.closed {
                if let Some(after) = &result.after {
                    if let (Some(underlying), Some(side)) =
                        (underlying_of_symbol(&symbol), after.side())
                    {
                        let source = after
                            .strategy
                            .clone()
                            .unwrap_or_else(|| "external".to_string());
                        core.tracker.set_position(underlying, side, &source);
                    }
                }
            }

            if result.closed {
                if let Some(closed) = &result.after {
                    retire_position(&mut core, &mut fx, closed, "closing fill");
                }
            }

            fx.dirty.merge(Dirty::all());
            info!(
                "📋 Fill {}: {:?} {}x{symbol} @ {fill_price:.2} ({:?})",
                ev.order_id, action, quantity, role
            );
            fx
        };
        self.apply_effects(fx).await;
    }

    // ─────────────────────────────────────────────────
    // ORDER_REJECTED / ORDER_CANCELLED
    // ─────────────────────────────────────────────────

    pub(super) async fn handle_order_terminal(&mut self, value: Value, cancelled: bool) {
        let ev = match OrderEvent::parse(&value) {
            Ok(ev) => ev,
            Err(err) => {
                warn!("📋 Bad terminal order frame: {err}");
                return;
            }
        };
        let verb = if cancelled { "cancelled" } else { "rejected" };

        let fx = {
            let mut core = self.state.write().await;
            let order = core.working_orders.remove(&ev.order_id);
            let signal_id = core
                .registry
                .unlink_order(&ev.order_id)
                .or_else(|| ev.signal_id.clone())
                .or_else(|| order.as_ref().and_then(|o| o.signal_id.clone()));
            core.order_strategy.remove(&ev.order_id);
            core.tracker.remove_pending(&ev.order_id);

            let Some(sid) = signal_id else {
                debug!("📋 {verb} for untracked order {} — nothing to do", ev.order_id);
                return;
            };
            // Redelivery: the order is gone and its signal already completed.
            if order.is_none() && core.registry.context(&sid).is_none() {
                debug!("📋 {verb} redelivery for {} — no-op", ev.order_id);
                return;
            }

            let mut fx = Effects::default();
            core.registry.append_lifecycle(
                &sid,
                if cancelled { "order_cancelled" } else { "order_rejected" },
                serde_json::json!({ "orderId": ev.order_id }),
            );
            let was_entry = order
                .as_ref()
                .map(|o| o.role == OrderRole::Entry)
                .unwrap_or(true);
            // An entry that dies without a fill ends its signal; a rejected
            // order is treated as never-placed for pending tracking.
            if was_entry && core.registry.position_for_signal(&sid).is_none() {
                core.tracker.remove_pending(&provisional_key(&sid));
                core.registry
                    .cleanup_signal(&sid, &format!("entry order {verb}"));
            }
            fx.dirty.merge(Dirty::all());
            info!("📋 Order {} {verb}", ev.order_id);
            fx
        };
        self.apply_effects(fx).await;
    }
}

// ─────────────────────────────────────────────────────────
// Attribution & normalization helpers
// ─────────────────────────────────────────────────────────

/// The four-step signal attribution chain for a broker order event.
fn attribute_order(
    core: &CoreState,
    ev: &OrderEvent,
    price_tolerance: f64,
    recency: std::time::Duration,
) -> Option<String> {
    // 1. Explicit correlation id on the message.
    if let Some(sid) = &ev.signal_id {
        return Some(sid.clone());
    }
    // 2. The registry already knows this order.
    if let Some(sid) = core.registry.signal_for_order(&ev.order_id) {
        return Some(sid.clone());
    }
    // 3. Symbol + recency + price proximity among active signals. Bracket
    //    children match on their stop/target prices.
    if let Some(symbol) = &ev.symbol {
        let now = Utc::now();
        let recency = chrono::Duration::from_std(recency).unwrap_or(chrono::Duration::minutes(5));
        let near = |a: Option<f64>, b: Option<f64>| match (a, b) {
            (Some(a), Some(b)) => (a - b).abs() <= price_tolerance,
            _ => false,
        };
        let found = core.registry.contexts().iter().find(|(_, ctx)| {
            ctx.concrete_symbol.as_deref() == Some(symbol.as_str())
                && now - ctx.registered_at <= recency
                && (near(ev.price, ctx.signal.price)
                    || near(ev.stop_price, ctx.signal.stop_loss)
                    || near(ev.price, ctx.signal.take_profit))
        });
        if let Some((sid, _)) = found {
            return Some(sid.clone());
        }
    }
    // 4. An attributed sibling in the same broker strategy group.
    if let Some(group) = &ev.strategy_id {
        let sibling = core
            .order_strategy
            .iter()
            .filter(|(oid, g)| g.as_str() == group && oid.as_str() != ev.order_id)
            .find_map(|(oid, _)| core.registry.signal_for_order(oid));
        if let Some(sid) = sibling {
            return Some(sid.clone());
        }
    }
    None
}

fn infer_role(core: &CoreState, ev: &OrderEvent, signal_id: Option<&str>) -> OrderRole {
    if let Some(role) = ev.role {
        return role;
    }
    if matches!(ev.order_type, Some(OrderType::Stop) | Some(OrderType::StopLimit))
        || ev.stop_price.is_some()
    {
        return OrderRole::StopLoss;
    }
    if let Some(sid) = signal_id {
        if let Some(ctx) = core.registry.context(sid) {
            if let (Some(price), Some(tp)) = (ev.price, ctx.signal.take_profit) {
                if (price - tp).abs() <= 1.0 {
                    return OrderRole::TakeProfit;
                }
            }
        }
    }
    OrderRole::Entry
}

/// Fill-action normalization. The signal context is authoritative: when the
/// broker's parsed action disagrees with the side the signal implies for
/// this role (entry = signal side, exits flipped), that's a known broker
/// quirk — warn and trust the signal. The broker's literal action only
/// stands when there is no signal context to check it against, and the last
/// resort is a loud Buy default.
fn resolve_fill_action(ev: &OrderEvent, role: OrderRole, signal_side: Option<Side>) -> OrderAction {
    let expected = signal_side.map(|side| match role {
        OrderRole::Entry => OrderAction::from_side(side),
        _ => OrderAction::from_side(side.flip()),
    });
    match (ev.action, expected) {
        (Some(action), Some(expected)) => {
            if action != expected {
                warn!(
                    "📋 ⚠️ Fill action {:?} disagrees with signal side {:?} for role {:?} — trusting signal context",
                    action,
                    signal_side,
                    role
                );
            }
            expected
        }
        (Some(action), None) => action,
        (None, Some(expected)) => expected,
        (None, None) => {
            warn!(
                "📋 ⚠️ Fill with UNKNOWN action ({:?}) and no signal context — defaulting to Buy",
                ev.action_raw
            );
            OrderAction::Buy
        }
    }
}

// ─────────────────────────────────────────────────────────
// Breakeven construction
// ─────────────────────────────────────────────────────────

pub(super) fn breakeven_from(
    trigger: Option<f64>,
    offset: Option<f64>,
    stop_loss: Option<f64>,
    defaults: Option<&(f64, f64)>,
) -> Option<crate::events::BreakevenConfig> {
    let (trigger, offset) = match (trigger, offset) {
        (Some(t), Some(o)) => (t, o),
        (Some(t), None) => (t, 0.0),
        _ => match defaults {
            Some((t, o)) => (*t, *o),
            None => return None,
        },
    };
    Some(crate::events::BreakevenConfig {
        trigger,
        offset,
        triggered: false,
        original_stop_price: stop_loss,
    })
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Signal, SignalAction, SignalContext};
    use serde_json::json;

    fn ctx(id: &str, symbol: &str) -> SignalContext {
        SignalContext::new(
            Signal {
                signal_id: id.to_string(),
                strategy: "IV_SKEW_GEX".to_string(),
                symbol: "NQ1!".to_string(),
                side: Side::Long,
                action: SignalAction::PlaceLimit,
                price: Some(21000.0),
                stop_loss: Some(20980.0),
                take_profit: Some(21060.0),
                trailing_trigger: None,
                trailing_offset: None,
                breakeven_trigger: None,
                breakeven_offset: None,
                quantity: Some(1.0),
                account_id: None,
                reason: None,
                received_at: Utc::now(),
            },
            Some(symbol.to_string()),
        )
    }

    fn ev(raw: Value) -> OrderEvent {
        OrderEvent::parse(&raw).unwrap()
    }

    #[test]
    fn test_attribution_explicit_id_wins() {
        let core = CoreState::new(true);
        let e = ev(json!({"orderId": "o1", "signalId": "s9"}));
        assert_eq!(
            attribute_order(&core, &e, 1.0, std::time::Duration::from_secs(300)),
            Some("s9".to_string())
        );
    }

    #[test]
    fn test_attribution_by_price_proximity() {
        let mut core = CoreState::new(true);
        core.registry.register_signal(ctx("s1", "NQH6"));

        // Entry price match.
        let e = ev(json!({"orderId": "o1", "symbol": "NQH6", "price": 21000.5}));
        assert_eq!(
            attribute_order(&core, &e, 1.0, std::time::Duration::from_secs(300)),
            Some("s1".to_string())
        );
        // Stop child matches by stopPrice.
        let e = ev(json!({"orderId": "o2", "symbol": "NQH6", "stopPrice": 20980.0}));
        assert_eq!(
            attribute_order(&core, &e, 1.0, std::time::Duration::from_secs(300)),
            Some("s1".to_string())
        );
        // Off-symbol never matches.
        let e = ev(json!({"orderId": "o3", "symbol": "ESH6", "price": 21000.0}));
        assert_eq!(
            attribute_order(&core, &e, 1.0, std::time::Duration::from_secs(300)),
            None
        );
    }

    #[test]
    fn test_attribution_via_strategy_group() {
        let mut core = CoreState::new(true);
        core.registry.register_signal(ctx("s1", "NQH6"));
        core.registry.link_order("s1", "o1");
        core.order_strategy.insert("o1".to_string(), "grp7".to_string());

        let e = ev(json!({"orderId": "o2", "strategyId": "grp7"}));
        assert_eq!(
            attribute_order(&core, &e, 1.0, std::time::Duration::from_secs(300)),
            Some("s1".to_string())
        );
    }

    #[test]
    fn test_role_inference() {
        let mut core = CoreState::new(true);
        core.registry.register_signal(ctx("s1", "NQH6"));

        let stop = ev(json!({"orderId": "o1", "stopPrice": 20980.0}));
        assert_eq!(infer_role(&core, &stop, Some("s1")), OrderRole::StopLoss);

        let tp = ev(json!({"orderId": "o2", "price": 21060.0, "orderType": "Limit"}));
        assert_eq!(infer_role(&core, &tp, Some("s1")), OrderRole::TakeProfit);

        let entry = ev(json!({"orderId": "o3", "price": 21000.0, "orderType": "Limit"}));
        assert_eq!(infer_role(&core, &entry, Some("s1")), OrderRole::Entry);
    }

    #[test]
    fn test_fill_action_fallback_chain() {
        // Agreement: broker action matches the signal side.
        let e = ev(json!({"orderId": "o1", "action": "B"}));
        assert_eq!(
            resolve_fill_action(&e, OrderRole::Entry, Some(Side::Long)),
            OrderAction::Buy
        );
        // Disagreement (broker quirk): the signal context wins.
        let e = ev(json!({"orderId": "o1", "action": "Buy"}));
        assert_eq!(
            resolve_fill_action(&e, OrderRole::Entry, Some(Side::Short)),
            OrderAction::Sell
        );
        // Exit roles expect the flipped side — an agreeing Sell stop on a
        // long passes through.
        let e = ev(json!({"orderId": "o1", "action": "S"}));
        assert_eq!(
            resolve_fill_action(&e, OrderRole::StopLoss, Some(Side::Long)),
            OrderAction::Sell
        );
        // No signal context: the broker's parsed action stands.
        assert_eq!(
            resolve_fill_action(&e, OrderRole::Entry, None),
            OrderAction::Sell
        );
        // Unknown action → signal side for entries…
        let e = ev(json!({"orderId": "o1", "action": "??"}));
        assert_eq!(
            resolve_fill_action(&e, OrderRole::Entry, Some(Side::Long)),
            OrderAction::Buy
        );
        // …and flipped for exits.
        assert_eq!(
            resolve_fill_action(&e, OrderRole::StopLoss, Some(Side::Long)),
            OrderAction::Sell
        );
        // Nothing at all → loud Buy default.
        assert_eq!(resolve_fill_action(&e, OrderRole::Entry, None), OrderAction::Buy);
    }

    #[test]
    fn test_breakeven_falls_back_to_strategy_defaults() {
        let be = breakeven_from(None, None, Some(20980.0), Some(&(20.0, 5.0))).unwrap();
        assert!((be.trigger - 20.0).abs() < 1e-9);
        assert!((be.offset - 5.0).abs() < 1e-9);
        assert!(!be.triggered);

        assert!(breakeven_from(None, None, None, None).is_none());

        let be = breakeven_from(Some(15.0), Some(3.0), None, Some(&(20.0, 5.0))).unwrap();
        assert!((be.trigger - 15.0).abs() < 1e-9);
    }
}
