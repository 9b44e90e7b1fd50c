//! Validation & admission — decides which signals become order requests.
//!
//! Check order: trading flag → parse → duplicate drop → business rules →
//! cross-strategy filter → broker-truth freshness → same-underlying mutual
//! exclusion → sizing. Acceptance registers the signal, records a
//! provisional pending entry (so two admitted signals can never race past
//! the exclusion check while the broker ack is in flight), and publishes
//! `ORDER_REQUEST`. Every rejection publishes `TRADE_REJECTED` with one
//! reason string and the rule name.

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::bus::channels;
use crate::contracts::{parse_logical, underlying_of_symbol, SizingError, SizingOutcome};
use crate::events::{Signal, SignalAction, SignalContext};
use crate::strategy::{evaluate_filter, provisional_key, PendingOrderRef};

use super::{cancel_request, order_request, trade_rejected, trade_validated, Dirty, Effects, Orchestrator};

impl Orchestrator {
    pub(super) async fn handle_signal(&mut self, value: Value) {
        {
            let mut core = self.state.write().await;
            core.stats.signals_received += 1;
        }

        let signal = match Signal::parse(&value) {
            Ok(signal) => signal,
            Err(err) => {
                warn!("🚦 Invalid signal dropped: {err}");
                self.reject(None, &err.to_string(), Some("invalid_signal")).await;
                return;
            }
        };

        match signal.action {
            SignalAction::PlaceMarket | SignalAction::PlaceLimit => {
                self.admit_entry(signal, false).await;
            }
            SignalAction::CancelLimit => self.cancel_limit(signal).await,
            SignalAction::UpdateLimit => self.update_limit(signal).await,
            SignalAction::ModifyStop => {
                // Breakeven output for the broker adapter — not ours to act on.
                debug!("🚦 Ignoring modify_stop signal {}", signal.signal_id);
            }
            SignalAction::PositionClosed => self.strategy_reported_close(signal).await,
        }
    }

    // ─────────────────────────────────────────────────
    // Entry admission
    // ─────────────────────────────────────────────────

    pub(super) async fn admit_entry(&mut self, signal: Signal, force: bool) {
        let sid = signal.signal_id.clone();

        // Phase A: all checks that read trading state, under one lock.
        let (qty_multiplier, existing_net) = {
            let core = self.state.read().await;

            if !core.trading_enabled {
                drop(core);
                self.reject(Some(&sid), "trading is disabled", Some("trading_disabled"))
                    .await;
                return;
            }

            // Redelivered signal id: at-least-once bus, drop silently.
            if core.registry.known(&sid) {
                info!("🚦 Duplicate signal {sid} — already processed, dropping");
                return;
            }

            let underlying = match parse_logical(&signal.symbol) {
                Ok(family) => family.underlying(),
                Err(err) => {
                    drop(core);
                    self.reject(Some(&sid), &err.to_string(), Some("unknown_symbol"))
                        .await;
                    return;
                }
            };

            // Daily loss limit on realized PnL.
            if self.cfg.daily_loss_limit > 0.0
                && core.daily.realized_today(Utc::now()) <= -self.cfg.daily_loss_limit
            {
                drop(core);
                self.reject(
                    Some(&sid),
                    "daily loss limit reached",
                    Some("daily_loss_limit"),
                )
                .await;
                return;
            }

            // Reversal policy (within the owning strategy; cross-strategy
            // contention is the filter's call).
            let owner = core.tracker.position(underlying).cloned();
            if let Some(ref owner) = owner {
                if owner.source == signal.strategy
                    && owner.state != signal.side
                    && !self.cfg.allow_reversals
                {
                    let reason = format!(
                        "{underlying} already in {} position from {} — reversals disabled",
                        owner.state.as_str(),
                        owner.source
                    );
                    drop(core);
                    self.reject(Some(&sid), &reason, Some("reversal_disallowed")).await;
                    return;
                }
            }

            // Cross-strategy filter (pure).
            let decision = evaluate_filter(
                &signal.strategy,
                underlying,
                signal.side,
                core.tracker.positions(),
                &self.cfg.rules,
            );
            if !decision.allowed {
                let reason = decision.reason.clone();
                drop(core);
                self.reject(Some(&sid), &reason, Some("cross_strategy")).await;
                return;
            }

            // Freshness: a new entry on stale broker truth waits for a sync.
            let stale = core
                .last_sync
                .map(|t| t.elapsed() > self.cfg.freshness)
                .unwrap_or(true);
            if stale && !force {
                drop(core);
                info!("🚦 Broker truth stale — parking {sid} pending sync");
                let displaced = self.park(signal);
                let mut fx = Effects::default();
                fx.publish(
                    channels::SYNC_REQUEST,
                    serde_json::json!({
                        "mode": "incremental",
                        "requestedAt": Utc::now().to_rfc3339(),
                    }),
                );
                self.apply_effects(fx).await;
                if let Some(old) = displaced {
                    self.reject(
                        Some(&old.signal_id),
                        "superseded by a newer signal while awaiting sync",
                        Some("superseded"),
                    )
                    .await;
                }
                return;
            }

            // Same-underlying mutual exclusion.
            if let Some(owner) = owner {
                if owner.state == signal.side {
                    if owner.source == signal.strategy {
                        let reason = format!(
                            "{underlying} already in {} position from {}",
                            owner.state.as_str(),
                            owner.source
                        );
                        drop(core);
                        self.reject(Some(&sid), &reason, Some("position_exists")).await;
                        return;
                    }
                    // Different strategy, same direction: the filter already
                    // vouched for this share.
                } else {
                    debug!("🚦 Reversal entry admitted for {underlying}");
                }
            }
            let mut conflicting_pending = false;
            for (_, pending) in core.tracker.pending_for(underlying) {
                if pending.direction != signal.side || !self.cfg.rules.allow_same_direction {
                    conflicting_pending = true;
                    break;
                }
            }
            if conflicting_pending {
                drop(core);
                self.reject(
                    Some(&sid),
                    &format!("pending entry order already exists for {underlying}"),
                    Some("pending_exists"),
                )
                .await;
                return;
            }

            let existing_net = core
                .positions
                .values()
                .filter(|p| underlying_of_symbol(&p.symbol) == Some(underlying))
                .map(|p| p.net_pos.abs())
                .sum::<i64>();
            (decision.qty_multiplier, existing_net)
        };

        // Phase B: sizing (suspends on the sizing backend; lock released).
        let requested = match (signal.quantity, qty_multiplier) {
            (Some(q), Some(m)) => Some((q * m).max(1.0)),
            (q, _) => q,
        };
        let sizing = match self
            .resolver
            .resolve(&signal.symbol, requested, signal.price, signal.stop_loss)
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                let rule = match err {
                    SizingError::UnknownSymbol(_) => "unknown_symbol",
                    SizingError::InsufficientInputs => "insufficient_inputs",
                };
                self.reject(Some(&sid), &err.to_string(), Some(rule)).await;
                return;
            }
        };

        if existing_net + sizing.quantity > self.cfg.max_position_size {
            self.reject(
                Some(&sid),
                &format!(
                    "position size {} would exceed limit {}",
                    existing_net + sizing.quantity,
                    self.cfg.max_position_size
                ),
                Some("max_position_size"),
            )
            .await;
            return;
        }

        // Phase C: commit — register, record the provisional pending entry.
        let fx = {
            let mut core = self.state.write().await;
            core.registry
                .register_signal(SignalContext::new(signal.clone(), Some(sizing.symbol.clone())));
            core.tracker.insert_pending(
                provisional_key(&sid),
                PendingOrderRef {
                    strategy: signal.strategy.clone(),
                    direction: signal.side,
                    symbol: sizing.symbol.clone(),
                    price: signal.price,
                    quantity: sizing.quantity,
                    created_at: Utc::now(),
                },
            );
            core.stats.signals_accepted += 1;

            let mut fx = Effects::default();
            fx.publish(channels::TRADE_VALIDATED, trade_validated(&signal, &sizing.symbol, sizing.quantity));
            fx.publish(channels::ORDER_REQUEST, order_request(&signal, &sizing));
            fx.dirty.merge(Dirty::registry());
            fx.dirty.strategy_state = true;
            fx
        };

        info!(
            "🚦 ✅ Signal {sid} accepted: {} {} {}x{}",
            signal.strategy,
            signal.side.as_str(),
            sizing.symbol,
            sizing.quantity,
        );
        self.apply_effects(fx).await;
    }

    // ─────────────────────────────────────────────────
    // Non-entry actions
    // ─────────────────────────────────────────────────

    async fn cancel_limit(&mut self, signal: Signal) {
        let fx = {
            let mut core = self.state.write().await;
            let mut fx = Effects::default();
            let entry_orders: Vec<String> = core
                .registry
                .orders_for_signal(&signal.signal_id)
                .iter()
                .filter(|oid| {
                    core.working_orders
                        .get(*oid)
                        .is_some_and(|o| o.role == crate::events::OrderRole::Entry)
                })
                .cloned()
                .collect();

            if entry_orders.is_empty() {
                // No broker order yet — retire the signal locally.
                core.tracker.remove_pending(&provisional_key(&signal.signal_id));
                core.registry.cleanup_signal(&signal.signal_id, "cancelled before placement");
                fx.dirty.merge(Dirty::all());
            } else {
                for oid in entry_orders {
                    fx.publish(
                        channels::ORDER_CANCEL_REQUEST,
                        cancel_request(&oid, "cancel_limit signal"),
                    );
                }
            }
            fx
        };
        info!("🚦 cancel_limit for {}", signal.signal_id);
        self.apply_effects(fx).await;
    }

    async fn update_limit(&mut self, signal: Signal) {
        let new_price = match signal.price {
            Some(p) => p,
            None => {
                self.reject(
                    Some(&signal.signal_id),
                    "update_limit without price",
                    Some("invalid_signal"),
                )
                .await;
                return;
            }
        };

        let fx = {
            let mut core = self.state.write().await;
            let Some(ctx) = core.registry.context_mut(&signal.signal_id) else {
                drop(core);
                self.reject(
                    Some(&signal.signal_id),
                    "update_limit for unknown signal",
                    Some("invalid_signal"),
                )
                .await;
                return;
            };
            ctx.signal.price = Some(new_price);
            if signal.stop_loss.is_some() {
                ctx.signal.stop_loss = signal.stop_loss;
            }
            if signal.take_profit.is_some() {
                ctx.signal.take_profit = signal.take_profit;
            }
            let updated = ctx.signal.clone();
            let symbol = ctx
                .concrete_symbol
                .clone()
                .unwrap_or_else(|| updated.symbol.clone());

            let mut fx = Effects::default();
            // Replace the working entry: cancel + re-request at the new price.
            let entry_orders: Vec<String> = core
                .registry
                .orders_for_signal(&signal.signal_id)
                .iter()
                .filter(|oid| {
                    core.working_orders
                        .get(*oid)
                        .is_some_and(|o| o.role == crate::events::OrderRole::Entry)
                })
                .cloned()
                .collect();
            for oid in entry_orders {
                fx.publish(
                    channels::ORDER_CANCEL_REQUEST,
                    cancel_request(&oid, "update_limit reprice"),
                );
            }
            let sizing = SizingOutcome {
                symbol,
                quantity: updated.quantity.map(|q| q.round() as i64).unwrap_or(1).max(1),
                converted: false,
                reason: "update_limit".to_string(),
                original_symbol: updated.symbol.clone(),
                original_quantity: updated.quantity,
            };
            fx.publish(channels::ORDER_REQUEST, order_request(&updated, &sizing));
            fx.dirty.contexts = true;
            fx
        };
        info!("🚦 update_limit for {} → {new_price}", signal.signal_id);
        self.apply_effects(fx).await;
    }

    /// A strategy announced its own exit. Broker events will confirm; we
    /// retire local state idempotently.
    async fn strategy_reported_close(&mut self, signal: Signal) {
        let symbol = {
            let core = self.state.read().await;
            core.registry
                .position_for_signal(&signal.signal_id)
                .cloned()
        };
        match symbol {
            Some(symbol) => self.close_position_locally(&symbol, "position_closed signal").await,
            None => debug!(
                "🚦 position_closed for {} but no linked position",
                signal.signal_id
            ),
        }
    }

    // ─────────────────────────────────────────────────
    // Rejection plumbing
    // ─────────────────────────────────────────────────

    pub(super) async fn reject(&self, signal_id: Option<&str>, reason: &str, rule: Option<&str>) {
        {
            let mut core = self.state.write().await;
            core.stats.signals_rejected += 1;
        }
        warn!(
            "🚦 ❌ Rejected{}: {reason}",
            signal_id.map(|s| format!(" {s}")).unwrap_or_default()
        );
        let payload = trade_rejected(signal_id, reason, rule);
        if let Err(err) = self.bus.publish(channels::TRADE_REJECTED, payload).await {
            warn!("🚦 Failed to publish rejection: {err}");
        }
    }
}
