//! Signal registry — the canonical in-memory index of signal ↔ order ↔
//! position relationships, plus an append-only lifecycle log per signal.
//!
//! Invariant: `signal_to_orders` and `order_to_signal` are inverse on their
//! intersection. All ids are coerced to trimmed canonical strings on the way
//! in so equality holds across serialization boundaries (brokers love to
//! flip between numeric and string ids).

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::events::SignalContext;

/// Lifecycle log retention.
pub const LIFECYCLE_TTL_DAYS: i64 = 7;

// ─────────────────────────────────────────────────────────
// Entries
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleEntry {
    pub timestamp: DateTime<Utc>,
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

/// Persisted shape of `signal:mappings`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalMappings {
    #[serde(default)]
    pub signal_to_orders: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub order_to_signal: HashMap<String, String>,
    #[serde(default)]
    pub signal_to_position: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub active_signals: usize,
    pub linked_orders: usize,
    pub linked_positions: usize,
    pub lifecycles: usize,
}

// ─────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone)]
pub struct SignalRegistry {
    contexts: HashMap<String, SignalContext>,
    signal_to_orders: HashMap<String, Vec<String>>,
    order_to_signal: HashMap<String, String>,
    signal_to_position: HashMap<String, String>,
    lifecycles: HashMap<String, Vec<LifecycleEntry>>,
}

fn canon(id: &str) -> String {
    id.trim().to_string()
}

impl SignalRegistry {
    // ── Registration ──

    pub fn register_signal(&mut self, ctx: SignalContext) {
        let id = canon(&ctx.signal.signal_id);
        self.append_lifecycle(
            &id,
            "signal_received",
            serde_json::json!({
                "strategy": ctx.signal.strategy,
                "symbol": ctx.signal.symbol,
                "side": ctx.signal.side.as_str(),
            }),
        );
        self.contexts.insert(id, ctx);
    }

    /// Any record of this id — active context or retained lifecycle. Used to
    /// drop redelivered signals idempotently.
    pub fn known(&self, signal_id: &str) -> bool {
        let id = canon(signal_id);
        self.contexts.contains_key(&id) || self.lifecycles.contains_key(&id)
    }

    pub fn context(&self, signal_id: &str) -> Option<&SignalContext> {
        self.contexts.get(&canon(signal_id))
    }

    pub fn context_mut(&mut self, signal_id: &str) -> Option<&mut SignalContext> {
        self.contexts.get_mut(&canon(signal_id))
    }

    pub fn contexts(&self) -> &HashMap<String, SignalContext> {
        &self.contexts
    }

    /// Drain every active context (full-sync stash).
    pub fn take_contexts(&mut self) -> HashMap<String, SignalContext> {
        std::mem::take(&mut self.contexts)
    }

    pub fn insert_context(&mut self, ctx: SignalContext) {
        self.contexts.insert(canon(&ctx.signal.signal_id), ctx);
    }

    // ── Order links ──

    pub fn link_order(&mut self, signal_id: &str, order_id: &str) {
        let sid = canon(signal_id);
        let oid = canon(order_id);
        let orders = self.signal_to_orders.entry(sid.clone()).or_default();
        if !orders.contains(&oid) {
            orders.push(oid.clone());
        }
        self.order_to_signal.insert(oid.clone(), sid.clone());
        self.append_lifecycle(&sid, "order_linked", serde_json::json!({ "orderId": oid }));
    }

    pub fn unlink_order(&mut self, order_id: &str) -> Option<String> {
        let oid = canon(order_id);
        let sid = self.order_to_signal.remove(&oid)?;
        if let Some(orders) = self.signal_to_orders.get_mut(&sid) {
            orders.retain(|o| o != &oid);
            if orders.is_empty() {
                self.signal_to_orders.remove(&sid);
            }
        }
        Some(sid)
    }

    pub fn signal_for_order(&self, order_id: &str) -> Option<&String> {
        self.order_to_signal.get(&canon(order_id))
    }

    pub fn orders_for_signal(&self, signal_id: &str) -> &[String] {
        self.signal_to_orders
            .get(&canon(signal_id))
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    // ── Position links ──

    pub fn link_position(&mut self, signal_id: &str, symbol: &str) {
        let sid = canon(signal_id);
        self.signal_to_position.insert(sid.clone(), symbol.to_string());
        self.append_lifecycle(
            &sid,
            "position_created",
            serde_json::json!({ "symbol": symbol }),
        );
    }

    pub fn position_for_signal(&self, signal_id: &str) -> Option<&String> {
        self.signal_to_position.get(&canon(signal_id))
    }

    pub fn signal_for_position(&self, symbol: &str) -> Option<&String> {
        self.signal_to_position
            .iter()
            .find(|(_, s)| s.as_str() == symbol)
            .map(|(sid, _)| sid)
    }

    // ── Lifecycle ──

    pub fn append_lifecycle(&mut self, signal_id: &str, event: &str, data: Value) {
        self.lifecycles
            .entry(canon(signal_id))
            .or_default()
            .push(LifecycleEntry {
                timestamp: Utc::now(),
                event: event.to_string(),
                data,
            });
    }

    pub fn lifecycle(&self, signal_id: &str) -> &[LifecycleEntry] {
        self.lifecycles
            .get(&canon(signal_id))
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Drop lifecycle logs whose newest entry is older than the TTL.
    pub fn prune_lifecycles(&mut self, now: DateTime<Utc>) {
        let cutoff = now - ChronoDuration::days(LIFECYCLE_TTL_DAYS);
        self.lifecycles
            .retain(|_, entries| entries.last().is_some_and(|e| e.timestamp >= cutoff));
    }

    // ── Terminal cleanup ──

    /// Signal reached a terminal state: append `signal_completed`, drop the
    /// active mappings, keep the lifecycle log (subject to TTL).
    pub fn cleanup_signal(&mut self, signal_id: &str, reason: &str) {
        let sid = canon(signal_id);
        self.append_lifecycle(&sid, "signal_completed", serde_json::json!({ "reason": reason }));
        self.contexts.remove(&sid);
        if let Some(orders) = self.signal_to_orders.remove(&sid) {
            for oid in orders {
                self.order_to_signal.remove(&oid);
            }
        }
        self.signal_to_position.remove(&sid);
    }

    // ── Persistence ──

    pub fn mappings_blob(&self) -> SignalMappings {
        SignalMappings {
            signal_to_orders: self.signal_to_orders.clone(),
            order_to_signal: self.order_to_signal.clone(),
            signal_to_position: self.signal_to_position.clone(),
        }
    }

    pub fn restore(
        &mut self,
        contexts: HashMap<String, SignalContext>,
        mappings: SignalMappings,
        lifecycles: HashMap<String, Vec<LifecycleEntry>>,
    ) {
        self.contexts = contexts;
        self.signal_to_orders = mappings.signal_to_orders;
        self.order_to_signal = mappings.order_to_signal;
        self.signal_to_position = mappings.signal_to_position;
        self.lifecycles = lifecycles;
    }

    pub fn lifecycles_blob(&self) -> &HashMap<String, Vec<LifecycleEntry>> {
        &self.lifecycles
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            active_signals: self.contexts.len(),
            linked_orders: self.order_to_signal.len(),
            linked_positions: self.signal_to_position.len(),
            lifecycles: self.lifecycles.len(),
        }
    }
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────
