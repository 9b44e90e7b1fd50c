//! Per-underlying strategy state and the cross-strategy filter.
//!
//! The tracker answers one question for admission: "who owns this underlying
//! right now?" — either a filled position or pending entry orders. The filter
//! is a pure function over that state; it never mutates anything.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::contracts::{underlying_of_symbol, Underlying};
use crate::events::Side;

/// Blob version written to `multi-strategy:state`. Version 1 blobs (the old
/// single-global shape) are discarded on load; reconciliation repopulates.
pub const STRATEGY_STATE_VERSION: u32 = 2;

// ─────────────────────────────────────────────────────────
// State entries
// ─────────────────────────────────────────────────────────

/// Which strategy currently owns an underlying, and in which direction.
/// Exists iff a filled position exists for that underlying.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyStateEntry {
    pub state: Side,
    pub source: String,
}

/// A pending entry order, tracked for mutual-exclusion decisions. Keyed by
/// broker order id once acked; before the ack the key is the provisional
/// `signal:<signalId>` so two admitted signals can never race past each other.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOrderRef {
    pub strategy: String,
    pub direction: Side,
    pub symbol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    pub quantity: i64,
    pub created_at: DateTime<Utc>,
}

pub fn provisional_key(signal_id: &str) -> String {
    format!("signal:{signal_id}")
}

// ─────────────────────────────────────────────────────────
// Tracker
// ─────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone)]
pub struct StrategyTracker {
    /// underlying ("NQ") → owning entry.
    positions: HashMap<String, StrategyStateEntry>,
    /// order id (or provisional key) → pending entry.
    pending: HashMap<String, PendingOrderRef>,
}

impl StrategyTracker {
    pub fn position(&self, underlying: Underlying) -> Option<&StrategyStateEntry> {
        self.positions.get(underlying.as_str())
    }

    pub fn positions(&self) -> &HashMap<String, StrategyStateEntry> {
        &self.positions
    }

    pub fn pending(&self) -> &HashMap<String, PendingOrderRef> {
        &self.pending
    }

    pub fn pending_for(
        &self,
        underlying: Underlying,
    ) -> impl Iterator<Item = (&String, &PendingOrderRef)> {
        self.pending
            .iter()
            .filter(move |(_, p)| underlying_of_symbol(&p.symbol) == Some(underlying))
    }

    /// Any entry state (filled position or pending entry) for the underlying.
    pub fn has_entry_state(&self, underlying: Underlying) -> bool {
        self.position(underlying).is_some() || self.pending_for(underlying).next().is_some()
    }

    pub fn insert_pending(&mut self, key: String, entry: PendingOrderRef) {
        self.pending.insert(key, entry);
    }

    pub fn remove_pending(&mut self, key: &str) -> Option<PendingOrderRef> {
        self.pending.remove(key)
    }

    /// Swap a provisional `signal:<id>` ref to its broker order id once the
    /// placement is acked.
    pub fn promote_pending(&mut self, signal_id: &str, order_id: &str) {
        if let Some(entry) = self.pending.remove(&provisional_key(signal_id)) {
            self.pending.insert(order_id.to_string(), entry);
        }
    }

    /// An entry order filled: record the winning strategy and hand back the
    /// sibling pending entries on the same underlying so the caller can
    /// request their cancellation.
    pub fn entry_filled(
        &mut self,
        order_id: &str,
        underlying: Underlying,
        side: Side,
        strategy: &str,
    ) -> Vec<String> {
        self.pending.remove(order_id);
        self.positions.insert(
            underlying.as_str().to_string(),
            StrategyStateEntry {
                state: side,
                source: strategy.to_string(),
            },
        );
        self.pending_for(underlying)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn set_position(&mut self, underlying: Underlying, side: Side, strategy: &str) {
        self.positions.insert(
            underlying.as_str().to_string(),
            StrategyStateEntry {
                state: side,
                source: strategy.to_string(),
            },
        );
    }

    /// Position closed: drop the owning entry and any residual pending
    /// entries for that underlying; returns the removed pending keys.
    pub fn position_closed(&mut self, underlying: Underlying) -> Vec<String> {
        self.positions.remove(underlying.as_str());
        let stale: Vec<String> = self
            .pending_for(underlying)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            self.pending.remove(id);
        }
        stale
    }

    /// Keep only pending refs whose key passes `keep`. Used by the
    /// incremental sync to drop orders the broker no longer knows.
    pub fn retain_pending(&mut self, mut keep: impl FnMut(&str, &PendingOrderRef) -> bool) {
        self.pending.retain(|k, v| keep(k, v));
    }

    /// Drop strategy entries whose underlying has no concrete position.
    pub fn retain_positions(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.positions.retain(|u, _| keep(u));
    }

    pub fn clear(&mut self) {
        self.positions.clear();
        self.pending.clear();
    }

    pub fn to_blob(&self) -> StrategyStateBlob {
        StrategyStateBlob {
            positions: self.positions.clone(),
            pending_orders: self.pending.clone(),
            version: STRATEGY_STATE_VERSION,
        }
    }

    pub fn from_blob(blob: StrategyStateBlob) -> StrategyTracker {
        StrategyTracker {
            positions: blob.positions,
            pending: blob.pending_orders,
        }
    }
}

/// Persisted shape of `multi-strategy:state`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyStateBlob {
    #[serde(default)]
    pub positions: HashMap<String, StrategyStateEntry>,
    #[serde(default)]
    pub pending_orders: HashMap<String, PendingOrderRef>,
    #[serde(default)]
    pub version: u32,
}

// ─────────────────────────────────────────────────────────
// Cross-strategy filter
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct FilterRules {
    /// Permit two strategies to hold the same direction on one underlying.
    pub allow_same_direction: bool,
    /// Optional per-strategy quantity multipliers applied on admission.
    pub qty_multipliers: HashMap<String, f64>,
}

impl Default for FilterRules {
    fn default() -> Self {
        Self {
            allow_same_direction: false,
            qty_multipliers: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FilterDecision {
    pub allowed: bool,
    pub reason: String,
    pub qty_multiplier: Option<f64>,
}

/// Pure cross-strategy check: may `strategy` open `direction` on
/// `underlying` given who currently owns it?
pub fn evaluate_filter(
    strategy: &str,
    underlying: Underlying,
    direction: Side,
    positions: &HashMap<String, StrategyStateEntry>,
    rules: &FilterRules,
) -> FilterDecision {
    let multiplier = rules.qty_multipliers.get(strategy).copied();
    match positions.get(underlying.as_str()) {
        Some(owner) if owner.source != strategy => {
            if owner.state == direction && rules.allow_same_direction {
                FilterDecision {
                    allowed: true,
                    reason: format!(
                        "{underlying} {} shared with {}",
                        direction.as_str(),
                        owner.source
                    ),
                    qty_multiplier: multiplier,
                }
            } else {
                FilterDecision {
                    allowed: false,
                    reason: format!(
                        "{underlying} already in {} position from {}",
                        owner.state.as_str(),
                        owner.source
                    ),
                    qty_multiplier: None,
                }
            }
        }
        _ => FilterDecision {
            allowed: true,
            reason: "no cross-strategy conflict".to_string(),
            qty_multiplier: multiplier,
        },
    }
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(strategy: &str, symbol: &str, side: Side) -> PendingOrderRef {
        PendingOrderRef {
            strategy: strategy.to_string(),
            direction: side,
            symbol: symbol.to_string(),
            price: Some(21000.0),
            quantity: 1,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_entry_state_per_underlying() {
        let mut t = StrategyTracker::default();
        assert!(!t.has_entry_state(Underlying::Nq));

        t.insert_pending("o1".into(), pending("A", "NQH6", Side::Long));
        assert!(t.has_entry_state(Underlying::Nq));
        assert!(!t.has_entry_state(Underlying::Es));

        // Micro counts against the same underlying.
        t.insert_pending("o2".into(), pending("B", "MNQH6", Side::Long));
        assert_eq!(t.pending_for(Underlying::Nq).count(), 2);
    }

    #[test]
    fn test_entry_fill_records_winner_and_returns_siblings() {
        let mut t = StrategyTracker::default();
        t.insert_pending("o1".into(), pending("A", "NQH6", Side::Long));
        t.insert_pending("o2".into(), pending("B", "NQH6", Side::Long));
        t.insert_pending("o3".into(), pending("C", "ESH6", Side::Short));

        let siblings = t.entry_filled("o1", Underlying::Nq, Side::Long, "A");
        assert_eq!(siblings, vec!["o2".to_string()]);
        let owner = t.position(Underlying::Nq).unwrap();
        assert_eq!(owner.source, "A");
        assert_eq!(owner.state, Side::Long);
        // ES pending untouched.
        assert!(t.pending().contains_key("o3"));
    }

    #[test]
    fn test_position_closed_drops_residuals() {
        let mut t = StrategyTracker::default();
        t.set_position(Underlying::Nq, Side::Long, "A");
        t.insert_pending("o9".into(), pending("B", "NQH6", Side::Long));

        let removed = t.position_closed(Underlying::Nq);
        assert_eq!(removed, vec!["o9".to_string()]);
        assert!(t.position(Underlying::Nq).is_none());
        assert!(t.pending().is_empty());
    }

    #[test]
    fn test_promote_pending() {
        let mut t = StrategyTracker::default();
        t.insert_pending(provisional_key("s1"), pending("A", "NQH6", Side::Long));
        t.promote_pending("s1", "o1");
        assert!(t.pending().contains_key("o1"));
        assert!(!t.pending().contains_key(&provisional_key("s1")));
    }

    #[test]
    fn test_filter_rejects_cross_strategy_conflict() {
        let mut positions = HashMap::new();
        positions.insert(
            "NQ".to_string(),
            StrategyStateEntry {
                state: Side::Long,
                source: "IV_SKEW_GEX".to_string(),
            },
        );
        let d = evaluate_filter(
            "GEX_SCALP",
            Underlying::Nq,
            Side::Short,
            &positions,
            &FilterRules::default(),
        );
        assert!(!d.allowed);
        assert!(d.reason.contains("NQ already in long position from IV_SKEW_GEX"));
    }

    #[test]
    fn test_filter_permissive_same_direction() {
        let mut positions = HashMap::new();
        positions.insert(
            "NQ".to_string(),
            StrategyStateEntry {
                state: Side::Long,
                source: "A".to_string(),
            },
        );
        let rules = FilterRules {
            allow_same_direction: true,
            ..FilterRules::default()
        };
        let d = evaluate_filter("B", Underlying::Nq, Side::Long, &positions, &rules);
        assert!(d.allowed);
        // Opposite direction still denied.
        let d = evaluate_filter("B", Underlying::Nq, Side::Short, &positions, &rules);
        assert!(!d.allowed);
    }

    #[test]
    fn test_filter_multiplier_applied() {
        let mut rules = FilterRules::default();
        rules.qty_multipliers.insert("SCALP".to_string(), 0.5);
        let d = evaluate_filter(
            "SCALP",
            Underlying::Nq,
            Side::Long,
            &HashMap::new(),
            &rules,
        );
        assert!(d.allowed);
        assert_eq!(d.qty_multiplier, Some(0.5));
    }

    #[test]
    fn test_v1_blob_shape_discarded_by_version() {
        let blob: StrategyStateBlob =
            serde_json::from_value(serde_json::json!({"version": 1, "positions": {}}))
                .unwrap();
        assert_eq!(blob.version, 1);
        assert_ne!(blob.version, STRATEGY_STATE_VERSION);
    }
}
