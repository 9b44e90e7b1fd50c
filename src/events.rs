//! Canonical message types for the orchestrator actor architecture.
//!
//! Everything that crosses the bus is parsed HERE, at the boundary, into a
//! tagged form. Downstream code never sees `Buy|B|1|buy|long` — only the
//! canonical variants.
//!
//! Flow:
//!   bus frame ──parse──→ InboundEvent ──→ Orchestrator (single in-box)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

// ─────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("invalid signal: {0}")]
    Invalid(String),
}

// ─────────────────────────────────────────────────────────
// Sides / actions / roles
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// Accepts the webhook aliases: long/buy → Long, short/sell → Short.
    pub fn parse(raw: &str) -> Option<Side> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "long" | "buy" => Some(Side::Long),
            "short" | "sell" => Some(Side::Short),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "long",
            Side::Short => "short",
        }
    }

    /// +1 for long, -1 for short.
    pub fn sign(&self) -> i64 {
        match self {
            Side::Long => 1,
            Side::Short => -1,
        }
    }

    pub fn flip(&self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalAction {
    PlaceMarket,
    PlaceLimit,
    UpdateLimit,
    CancelLimit,
    ModifyStop,
    PositionClosed,
}

impl SignalAction {
    pub fn parse(raw: &str) -> Option<SignalAction> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "place_market" | "market" => Some(SignalAction::PlaceMarket),
            "place_limit" | "limit" => Some(SignalAction::PlaceLimit),
            "update_limit" => Some(SignalAction::UpdateLimit),
            "cancel_limit" => Some(SignalAction::CancelLimit),
            "modify_stop" => Some(SignalAction::ModifyStop),
            "position_closed" => Some(SignalAction::PositionClosed),
            _ => None,
        }
    }
}

/// Broker order direction. The only two values downstream code ever sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderAction {
    Buy,
    Sell,
}

impl OrderAction {
    /// Normalize the zoo of broker encodings: `Buy|B|1|buy|long` → Buy,
    /// `Sell|S|2|sell|short` → Sell. Returns None for anything else —
    /// callers fall back to signal context per the lifecycle rules.
    pub fn normalize(value: &Value) -> Option<OrderAction> {
        if let Some(n) = value.as_i64() {
            return match n {
                1 => Some(OrderAction::Buy),
                2 => Some(OrderAction::Sell),
                _ => None,
            };
        }
        let raw = value.as_str()?;
        match raw.trim().to_ascii_lowercase().as_str() {
            "buy" | "b" | "1" | "long" => Some(OrderAction::Buy),
            "sell" | "s" | "2" | "short" => Some(OrderAction::Sell),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderAction::Buy => "Buy",
            OrderAction::Sell => "Sell",
        }
    }

    pub fn sign(&self) -> i64 {
        match self {
            OrderAction::Buy => 1,
            OrderAction::Sell => -1,
        }
    }

    pub fn from_side(side: Side) -> OrderAction {
        match side {
            Side::Long => OrderAction::Buy,
            Side::Short => OrderAction::Sell,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderRole {
    Entry,
    StopLoss,
    TakeProfit,
}

impl OrderRole {
    pub fn parse(raw: &str) -> Option<OrderRole> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "entry" => Some(OrderRole::Entry),
            "stop_loss" | "stop" | "sl" => Some(OrderRole::StopLoss),
            "take_profit" | "target" | "tp" => Some(OrderRole::TakeProfit),
            _ => None,
        }
    }

    pub fn is_bracket_child(&self) -> bool {
        matches!(self, OrderRole::StopLoss | OrderRole::TakeProfit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopLimit,
}

impl OrderType {
    pub fn parse(raw: &str) -> Option<OrderType> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "market" => Some(OrderType::Market),
            "limit" => Some(OrderType::Limit),
            "stop" => Some(OrderType::Stop),
            "stoplimit" | "stop_limit" => Some(OrderType::StopLimit),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Working,
    Filled,
    Cancelled,
    Rejected,
}

// ─────────────────────────────────────────────────────────
// Signal (canonical form after boundary parsing)
// ─────────────────────────────────────────────────────────

/// A request to enter (or manage) a trade, in canonical form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signal {
    pub signal_id: String,
    pub strategy: String,
    /// Logical symbol, e.g. `NQ1!`.
    pub symbol: String,
    pub side: Side,
    pub action: SignalAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trailing_trigger: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trailing_offset: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub breakeven_trigger: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub breakeven_offset: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl Signal {
    /// Parse an inbound signal envelope. Assigns a server-side id when the
    /// publisher did not provide one. Malformed payloads fail with
    /// [`SignalError::Invalid`] and must not mutate any state.
    pub fn parse(value: &Value) -> Result<Signal, SignalError> {
        if !value.is_object() {
            return Err(SignalError::Invalid("payload is not an object".into()));
        }

        let signal_id = field_str(value, &["signalId", "signal_id", "id"])
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let strategy = field_str(value, &["strategy", "strategyName"])
            .ok_or_else(|| SignalError::Invalid("missing strategy".into()))?;

        let symbol = field_str(value, &["symbol", "ticker"])
            .ok_or_else(|| SignalError::Invalid("missing symbol".into()))?;

        let side_raw = field_str(value, &["side", "direction"])
            .ok_or_else(|| SignalError::Invalid("missing side".into()))?;
        let side = Side::parse(&side_raw)
            .ok_or_else(|| SignalError::Invalid(format!("unknown side '{side_raw}'")))?;

        let action_raw = field_str(value, &["action"])
            .ok_or_else(|| SignalError::Invalid("missing action".into()))?;
        let action = SignalAction::parse(&action_raw)
            .ok_or_else(|| SignalError::Invalid(format!("unknown action '{action_raw}'")))?;

        // Limit entries need a price; market entries don't.
        let price = field_f64(value, &["price", "limitPrice", "limit_price"]);
        if action == SignalAction::PlaceLimit && price.is_none() {
            return Err(SignalError::Invalid("place_limit without price".into()));
        }

        Ok(Signal {
            signal_id,
            strategy,
            symbol,
            side,
            action,
            price,
            stop_loss: field_f64(value, &["stopLoss", "stop_loss", "sl"]),
            take_profit: field_f64(value, &["takeProfit", "take_profit", "tp"]),
            trailing_trigger: field_f64(value, &["trailingTrigger", "trailing_trigger"]),
            trailing_offset: field_f64(value, &["trailingOffset", "trailing_offset"]),
            breakeven_trigger: field_f64(value, &["breakevenTrigger", "breakeven_trigger"]),
            breakeven_offset: field_f64(value, &["breakevenOffset", "breakeven_offset"]),
            quantity: field_f64(value, &["quantity", "qty", "contracts"]),
            account_id: field_str(value, &["accountId", "account_id"]),
            reason: field_str(value, &["reason", "comment"]),
            received_at: Utc::now(),
        })
    }
}

/// Persisted per-signal context. This is what the reconciliation stash holds
/// and what full-sync re-matching runs against.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalContext {
    pub signal: Signal,
    /// Concrete contract symbol once sizing resolved it (e.g. `NQH6`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concrete_symbol: Option<String>,
    pub registered_at: DateTime<Utc>,
}

impl SignalContext {
    pub fn new(signal: Signal, concrete_symbol: Option<String>) -> SignalContext {
        SignalContext {
            signal,
            concrete_symbol,
            registered_at: Utc::now(),
        }
    }
}

// ─────────────────────────────────────────────────────────
// Orders
// ─────────────────────────────────────────────────────────

/// A broker-visible order as we track it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub order_id: String,
    /// Broker-side bracket group id, when the broker reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_id: Option<String>,
    /// Concrete contract symbol.
    pub symbol: String,
    pub action: OrderAction,
    pub quantity: f64,
    pub order_type: OrderType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_price: Option<f64>,
    pub role: OrderRole,
    pub status: OrderStatus,
    pub placed_at: DateTime<Utc>,
}

/// A broker order event, parsed from the bus frame.
#[derive(Debug, Clone)]
pub struct OrderEvent {
    pub order_id: String,
    pub strategy_id: Option<String>,
    pub signal_id: Option<String>,
    pub symbol: Option<String>,
    /// Canonical action if the broker encoding was recognized; the raw value
    /// is kept for the loud-warning path.
    pub action: Option<OrderAction>,
    pub action_raw: Option<Value>,
    pub quantity: Option<f64>,
    pub order_type: Option<OrderType>,
    pub price: Option<f64>,
    pub stop_price: Option<f64>,
    pub role: Option<OrderRole>,
    pub fill_price: Option<f64>,
    pub fill_quantity: Option<f64>,
}

impl OrderEvent {
    pub fn parse(value: &Value) -> Result<OrderEvent, SignalError> {
        let order_id = field_id(value, &["orderId", "order_id", "id"])
            .ok_or_else(|| SignalError::Invalid("order event without orderId".into()))?;

        let action_raw = value.get("action").cloned();
        let action = action_raw.as_ref().and_then(OrderAction::normalize);

        Ok(OrderEvent {
            order_id,
            strategy_id: field_id(value, &["strategyId", "strategy_id", "ocoGroupId"]),
            signal_id: field_id(value, &["signalId", "signal_id"]),
            symbol: field_str(value, &["symbol", "contractSymbol"]),
            action,
            action_raw,
            quantity: field_f64(value, &["quantity", "qty", "orderQty"]),
            order_type: field_str(value, &["orderType", "order_type"])
                .and_then(|s| OrderType::parse(&s)),
            price: field_f64(value, &["price", "limitPrice"]),
            stop_price: field_f64(value, &["stopPrice", "stop_price"]),
            role: field_str(value, &["role", "orderRole"]).and_then(|s| OrderRole::parse(&s)),
            fill_price: field_f64(value, &["fillPrice", "fill_price", "avgPrice"]),
            fill_quantity: field_f64(value, &["fillQuantity", "fill_quantity", "filledQty"]),
        })
    }
}

// ─────────────────────────────────────────────────────────
// Positions
// ─────────────────────────────────────────────────────────

/// Breakeven stop-move configuration attached to a position.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakevenConfig {
    /// Profit in points that arms the stop move.
    pub trigger: f64,
    /// Offset in points from entry for the new stop.
    pub offset: f64,
    pub triggered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_stop_price: Option<f64>,
}

/// One logical position per concrete contract symbol. `net_pos` is the one
/// canonical representation; side is derived from its sign.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub symbol: String,
    pub net_pos: i64,
    pub entry_price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_price: Option<f64>,
    #[serde(default)]
    pub unrealized_pnl: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss_order_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit_order_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub breakeven: Option<BreakevenConfig>,
    /// Broker pre-existed our process; no signal ever produced it.
    #[serde(default)]
    pub externally_sourced: bool,
    pub opened_at: DateTime<Utc>,
}

impl Position {
    pub fn side(&self) -> Option<Side> {
        if self.net_pos > 0 {
            Some(Side::Long)
        } else if self.net_pos < 0 {
            Some(Side::Short)
        } else {
            None
        }
    }
}

/// Broker position snapshot (authoritative). May carry only a contractId,
/// in which case the contracts module resolves the symbol.
#[derive(Debug, Clone)]
pub struct PositionSnapshot {
    pub symbol: Option<String>,
    pub contract_id: Option<String>,
    pub net_pos: i64,
    pub entry_price: Option<f64>,
    pub current_price: Option<f64>,
    pub source: Option<String>,
}

impl PositionSnapshot {
    pub fn parse(value: &Value) -> Result<PositionSnapshot, SignalError> {
        let symbol = field_str(value, &["symbol", "contractSymbol"]);
        let contract_id = field_id(value, &["contractId", "contract_id"]);
        if symbol.is_none() && contract_id.is_none() {
            return Err(SignalError::Invalid(
                "position snapshot without symbol or contractId".into(),
            ));
        }
        let net_pos = field_f64(value, &["netPos", "net_pos", "netPosition"])
            .map(|f| f.round() as i64)
            .ok_or_else(|| SignalError::Invalid("position snapshot without netPos".into()))?;
        Ok(PositionSnapshot {
            symbol,
            contract_id,
            net_pos,
            entry_price: field_f64(value, &["entryPrice", "entry_price", "avgPrice", "netPrice"]),
            current_price: field_f64(value, &["currentPrice", "current_price", "lastPrice"]),
            source: field_str(value, &["source"]),
        })
    }
}

// ─────────────────────────────────────────────────────────
// Prices / sync
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PriceUpdate {
    pub symbol: String,
    pub base_symbol: Option<String>,
    pub close: f64,
    pub source: Option<String>,
}

impl PriceUpdate {
    pub fn parse(value: &Value) -> Result<PriceUpdate, SignalError> {
        let symbol = field_str(value, &["symbol"])
            .ok_or_else(|| SignalError::Invalid("price update without symbol".into()))?;
        let close = field_f64(value, &["close", "price", "last"])
            .ok_or_else(|| SignalError::Invalid("price update without close".into()))?;
        Ok(PriceUpdate {
            symbol,
            base_symbol: field_str(value, &["baseSymbol", "base_symbol"]),
            close,
            source: field_str(value, &["source"]),
        })
    }
}

// ─────────────────────────────────────────────────────────
// Orchestrator in-box
// ─────────────────────────────────────────────────────────

/// Everything the orchestrator task can receive. One mutation step per event.
#[derive(Debug, Clone)]
pub enum InboundEvent {
    /// Raw signal envelope from WEBHOOK_RECEIVED / TRADE_SIGNAL.
    Signal(Value),
    OrderPlaced(Value),
    OrderFilled(Value),
    OrderRejected(Value),
    OrderCancelled(Value),
    PositionUpdate(Value),
    PositionClosed(Value),
    PriceUpdate(Value),
    /// Incremental sync completion: broker's current working-order id set.
    OrdersSynced(Value),
    FullSyncStarted,
    SyncCompleted,
    Shutdown,
}

// ─────────────────────────────────────────────────────────
// Boundary parsing helpers
// ─────────────────────────────────────────────────────────

/// Read an f64 field, accepting both number (0.5) and string ("0.5") forms.
pub fn field_f64(value: &Value, names: &[&str]) -> Option<f64> {
    for name in names {
        if let Some(v) = value.get(name) {
            if let Some(f) = v.as_f64() {
                return Some(f);
            }
            if let Some(f) = v.as_str().and_then(|s| s.trim().parse::<f64>().ok()) {
                return Some(f);
            }
        }
    }
    None
}

pub fn field_str(value: &Value, names: &[&str]) -> Option<String> {
    for name in names {
        if let Some(s) = value.get(name).and_then(|v| v.as_str()) {
            let t = s.trim();
            if !t.is_empty() {
                return Some(t.to_string());
            }
        }
    }
    None
}

/// Read an id field, coercing numbers to their canonical string form so
/// equality holds across serialization boundaries.
pub fn field_id(value: &Value, names: &[&str]) -> Option<String> {
    for name in names {
        match value.get(name) {
            Some(Value::String(s)) => {
                let t = s.trim();
                if !t.is_empty() {
                    return Some(t.to_string());
                }
            }
            Some(Value::Number(n)) => return Some(n.to_string()),
            _ => {}
        }
    }
    None
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_signal_parse_aliases() {
        let v = json!({
            "strategy": "IV_SKEW_GEX",
            "symbol": "NQ1!",
            "side": "buy",
            "action": "place_limit",
            "price": "21000",
            "stopLoss": 20980,
            "takeProfit": 21060,
            "quantity": 1
        });
        let s = Signal::parse(&v).unwrap();
        assert_eq!(s.side, Side::Long);
        assert_eq!(s.action, SignalAction::PlaceLimit);
        assert!((s.price.unwrap() - 21000.0).abs() < 1e-9);
        assert!((s.stop_loss.unwrap() - 20980.0).abs() < 1e-9);
        assert!(!s.signal_id.is_empty()); // server-assigned
    }

    #[test]
    fn test_signal_parse_rejects_garbage() {
        assert!(Signal::parse(&json!("nope")).is_err());
        assert!(Signal::parse(&json!({"strategy": "x"})).is_err());
        let no_price = json!({
            "strategy": "x", "symbol": "NQ1!", "side": "long", "action": "place_limit"
        });
        assert!(Signal::parse(&no_price).is_err());
    }

    #[test]
    fn test_action_normalization() {
        assert_eq!(OrderAction::normalize(&json!("Buy")), Some(OrderAction::Buy));
        assert_eq!(OrderAction::normalize(&json!("B")), Some(OrderAction::Buy));
        assert_eq!(OrderAction::normalize(&json!(1)), Some(OrderAction::Buy));
        assert_eq!(OrderAction::normalize(&json!("sell")), Some(OrderAction::Sell));
        assert_eq!(OrderAction::normalize(&json!("S")), Some(OrderAction::Sell));
        assert_eq!(OrderAction::normalize(&json!(2)), Some(OrderAction::Sell));
        assert_eq!(OrderAction::normalize(&json!("??")), None);
    }

    #[test]
    fn test_order_event_id_coercion() {
        // Broker sends numeric order ids; mappings must use canonical strings.
        let v = json!({"orderId": 123456, "role": "entry"});
        let ev = OrderEvent::parse(&v).unwrap();
        assert_eq!(ev.order_id, "123456");
        assert_eq!(ev.role, Some(OrderRole::Entry));
    }

    #[test]
    fn test_position_snapshot_contract_id_only() {
        let v = json!({"contractId": 991, "netPos": -2.0});
        let p = PositionSnapshot::parse(&v).unwrap();
        assert_eq!(p.contract_id.as_deref(), Some("991"));
        assert_eq!(p.net_pos, -2);
        assert!(p.symbol.is_none());
    }

    #[test]
    fn test_side_derivation() {
        let mut p = Position {
            symbol: "NQH6".into(),
            net_pos: 1,
            entry_price: 21000.0,
            current_price: None,
            unrealized_pnl: 0.0,
            stop_loss_order_id: None,
            take_profit_order_id: None,
            signal_id: None,
            strategy: None,
            breakeven: None,
            externally_sourced: false,
            opened_at: Utc::now(),
        };
        assert_eq!(p.side(), Some(Side::Long));
        p.net_pos = -3;
        assert_eq!(p.side(), Some(Side::Short));
        p.net_pos = 0;
        assert_eq!(p.side(), None);
    }
}
