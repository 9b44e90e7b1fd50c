//! Breakeven / exit controller — drives stop modifications off the price
//! stream.
//!
//! Every `PRICE_UPDATE` refreshes unrealized PnL for the positions on that
//! underlying (micros and standards share one stream: MNQ↔NQ, MES↔ES). When
//! a position's profit in points reaches its configured trigger, exactly one
//! `TRADE_SIGNAL action=modify_stop` goes out with the stop moved to
//! entry ± offset. A failed publish re-arms the trigger so the next tick
//! retries.

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::bus::channels;
use crate::contracts::{
    point_value_of_symbol, round_to_tick, underlying_of_symbol, Underlying,
};
use crate::events::{PriceUpdate, Side};

use super::Orchestrator;

/// One armed stop move, computed under the lock, published outside it.
struct StopMove {
    symbol: String,
    signal_id: Option<String>,
    strategy: Option<String>,
    side: Side,
    new_stop: f64,
    stop_order_id: Option<String>,
    strategy_group: Option<String>,
}

impl Orchestrator {
    pub(super) async fn handle_price_update(&mut self, value: Value) {
        let update = match PriceUpdate::parse(&value) {
            Ok(u) => u,
            Err(err) => {
                warn!("💹 Bad price update: {err}");
                return;
            }
        };
        let underlying = update
            .base_symbol
            .as_deref()
            .and_then(underlying_of_symbol)
            .or_else(|| underlying_of_symbol(&update.symbol));
        let Some(underlying) = underlying else {
            return; // not an instrument we trade
        };

        let tick = self.resolver.tick();
        let (realtime, moves) = {
            let mut guard = self.state.write().await;
            let core = &mut *guard;
            core.last_prices
                .insert(underlying.as_str().to_string(), update.close);

            let mut realtime = Vec::new();
            let mut moves = Vec::new();
            for pos in core.positions.values_mut() {
                if underlying_of_symbol(&pos.symbol) != Some(underlying) {
                    continue;
                }
                let Some(side) = pos.side() else { continue };

                pos.current_price = Some(update.close);
                pos.unrealized_pnl = (update.close - pos.entry_price)
                    * pos.net_pos as f64
                    * point_value_of_symbol(&pos.symbol);
                realtime.push(json!({
                    "source": "orchestrator",
                    "symbol": pos.symbol,
                    "netPos": pos.net_pos,
                    "side": side.as_str(),
                    "entryPrice": pos.entry_price,
                    "currentPrice": update.close,
                    "unrealizedPnl": pos.unrealized_pnl,
                }));

                // Breakeven arming — once per position.
                if pos.entry_price <= 0.0 {
                    continue; // entry not repaired yet (mid-reconciliation)
                }
                let Some(be) = pos.breakeven.as_mut() else { continue };
                if be.triggered {
                    continue;
                }
                let profit_pts = match side {
                    Side::Long => update.close - pos.entry_price,
                    Side::Short => pos.entry_price - update.close,
                };
                if profit_pts >= be.trigger {
                    be.triggered = true;
                    let new_stop = match side {
                        Side::Long => pos.entry_price + be.offset,
                        Side::Short => pos.entry_price - be.offset,
                    };
                    let stop_order_id = pos.stop_loss_order_id.clone();
                    let strategy_group = stop_order_id
                        .as_deref()
                        .and_then(|oid| core_order_group(&core.order_strategy, oid));
                    moves.push(StopMove {
                        symbol: pos.symbol.clone(),
                        signal_id: pos.signal_id.clone(),
                        strategy: pos.strategy.clone(),
                        side,
                        new_stop: round_to_tick(new_stop, tick),
                        stop_order_id,
                        strategy_group,
                    });
                }
            }
            (realtime, moves)
        };

        for payload in realtime {
            if let Err(err) = self
                .bus
                .publish(channels::POSITION_REALTIME_UPDATE, payload)
                .await
            {
                warn!("💹 Realtime update publish failed: {err}");
            }
        }

        for m in moves {
            self.publish_stop_move(underlying, m).await;
        }
    }

    async fn publish_stop_move(&self, underlying: Underlying, m: StopMove) {
        let payload = json!({
            "signalId": m.signal_id,
            "strategy": m.strategy,
            "symbol": m.symbol,
            "side": m.side.as_str(),
            "action": "modify_stop",
            "new_stop_price": m.new_stop,
            "stopOrderId": m.stop_order_id,
            "strategyId": m.strategy_group,
            "reason": "breakeven",
        });
        match self.bus.publish(channels::TRADE_SIGNAL, payload).await {
            Ok(()) => {
                info!(
                    "💹 🎯 Breakeven {underlying}: {} stop → {:.2}",
                    m.symbol, m.new_stop
                );
            }
            Err(err) => {
                // Re-arm so the next tick retries.
                warn!("💹 Breakeven publish failed for {} ({err}) — re-arming", m.symbol);
                let mut core = self.state.write().await;
                if let Some(be) = core
                    .positions
                    .get_mut(&m.symbol)
                    .and_then(|p| p.breakeven.as_mut())
                {
                    be.triggered = false;
                }
            }
        }
    }
}

fn core_order_group(
    order_strategy: &std::collections::HashMap<String, String>,
    order_id: &str,
) -> Option<String> {
    order_strategy.get(order_id).cloned()
}
