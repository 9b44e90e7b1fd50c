//! Contract families, front-month resolution, and position sizing.
//!
//! Strategies speak logical symbols (`NQ1!`); the broker wants a concrete
//! front-month contract (`NQH6`) and a whole-contract quantity. This module
//! owns that conversion, including the risk-based full→micro downconversion.

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Default tick size for the index futures family.
pub const DEFAULT_TICK: f64 = 0.25;

// ─────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SizingError {
    #[error("unknown symbol '{0}'")]
    UnknownSymbol(String),
    #[error("risk-based sizing needs entry and stop prices")]
    InsufficientInputs,
}

// ─────────────────────────────────────────────────────────
// Families / underlyings
// ─────────────────────────────────────────────────────────

/// Product family, independent of contract month. Micros normalize into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Underlying {
    Nq,
    Es,
    Rty,
}

impl Underlying {
    pub fn as_str(&self) -> &'static str {
        match self {
            Underlying::Nq => "NQ",
            Underlying::Es => "ES",
            Underlying::Rty => "RTY",
        }
    }
}

impl std::fmt::Display for Underlying {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tradable contract family with its own point value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(clippy::upper_case_acronyms)]
pub enum ContractFamily {
    NQ,
    MNQ,
    ES,
    MES,
    RTY,
    M2K,
}

impl ContractFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContractFamily::NQ => "NQ",
            ContractFamily::MNQ => "MNQ",
            ContractFamily::ES => "ES",
            ContractFamily::MES => "MES",
            ContractFamily::RTY => "RTY",
            ContractFamily::M2K => "M2K",
        }
    }

    /// Dollars per index point per contract.
    pub fn point_value(&self) -> f64 {
        match self {
            ContractFamily::NQ => 20.0,
            ContractFamily::MNQ => 2.0,
            ContractFamily::ES => 50.0,
            ContractFamily::MES => 5.0,
            ContractFamily::RTY => 50.0,
            ContractFamily::M2K => 5.0,
        }
    }

    pub fn is_micro(&self) -> bool {
        matches!(
            self,
            ContractFamily::MNQ | ContractFamily::MES | ContractFamily::M2K
        )
    }

    pub fn micro(&self) -> ContractFamily {
        match self {
            ContractFamily::NQ | ContractFamily::MNQ => ContractFamily::MNQ,
            ContractFamily::ES | ContractFamily::MES => ContractFamily::MES,
            ContractFamily::RTY | ContractFamily::M2K => ContractFamily::M2K,
        }
    }

    pub fn full(&self) -> ContractFamily {
        match self {
            ContractFamily::NQ | ContractFamily::MNQ => ContractFamily::NQ,
            ContractFamily::ES | ContractFamily::MES => ContractFamily::ES,
            ContractFamily::RTY | ContractFamily::M2K => ContractFamily::RTY,
        }
    }

    pub fn underlying(&self) -> Underlying {
        match self {
            ContractFamily::NQ | ContractFamily::MNQ => Underlying::Nq,
            ContractFamily::ES | ContractFamily::MES => Underlying::Es,
            ContractFamily::RTY | ContractFamily::M2K => Underlying::Rty,
        }
    }

    fn parse_prefix(upper: &str) -> Option<(ContractFamily, usize)> {
        // Longest prefixes first so MNQ doesn't match as NQ.
        const FAMILIES: [ContractFamily; 6] = [
            ContractFamily::MNQ,
            ContractFamily::MES,
            ContractFamily::M2K,
            ContractFamily::NQ,
            ContractFamily::ES,
            ContractFamily::RTY,
        ];
        FAMILIES
            .iter()
            .find(|f| upper.starts_with(f.as_str()))
            .map(|f| (*f, f.as_str().len()))
    }
}

/// Parse a strategy's logical symbol (`NQ1!`, `MNQ1!`, `ES`) into its family.
pub fn parse_logical(symbol: &str) -> Result<ContractFamily, SizingError> {
    let upper = symbol.trim().to_ascii_uppercase();
    let (family, len) = ContractFamily::parse_prefix(&upper)
        .ok_or_else(|| SizingError::UnknownSymbol(symbol.to_string()))?;
    // Anything after the family must be a continuous-contract suffix ("1!",
    // "!") or empty; a month code here would be a concrete symbol, not a
    // logical one, and we accept it as-is.
    let rest = &upper[len..];
    if rest.is_empty() || rest.chars().all(|c| c.is_ascii_digit() || c == '!') {
        Ok(family)
    } else if rest.len() == 2 && rest.chars().next().is_some_and(|c| "FGHJKMNQUVXZ".contains(c)) {
        Ok(family)
    } else {
        Err(SizingError::UnknownSymbol(symbol.to_string()))
    }
}

/// Family of a concrete contract symbol (`NQH6` → NQ, `MNQZ5` → MNQ).
pub fn family_of_symbol(symbol: &str) -> Option<ContractFamily> {
    let upper = symbol.trim().to_ascii_uppercase();
    ContractFamily::parse_prefix(&upper).map(|(f, _)| f)
}

/// Underlying of any symbol spelling, with micro→standard normalization.
pub fn underlying_of_symbol(symbol: &str) -> Option<Underlying> {
    family_of_symbol(symbol).map(|f| f.underlying())
}

/// Dollars per point for a concrete symbol; falls back to NQ's when the
/// family is unknown (callers log the anomaly themselves).
pub fn point_value_of_symbol(symbol: &str) -> f64 {
    family_of_symbol(symbol)
        .map(|f| f.point_value())
        .unwrap_or(20.0)
}

/// Round a price to the instrument tick.
pub fn round_to_tick(price: f64, tick: f64) -> f64 {
    if tick <= 0.0 {
        return price;
    }
    (price / tick).round() * tick
}

// ─────────────────────────────────────────────────────────
// Front month
// ─────────────────────────────────────────────────────────

const QUARTERLY: [(u32, char); 4] = [(3, 'H'), (6, 'M'), (9, 'U'), (12, 'Z')];

/// Quarterly front-month contract for a family at `now` (e.g. `NQH6`).
/// Rolls mid-month of the contract month; the exact roll date is a broker
/// policy, so deployments override via `contracts:mappings`.
pub fn front_month(family: ContractFamily, now: DateTime<Utc>) -> String {
    let (code, year) = QUARTERLY
        .iter()
        .find(|(m, _)| now.month() < *m || (now.month() == *m && now.day() < 15))
        .map(|(_, c)| (*c, now.year()))
        .unwrap_or(('H', now.year() + 1));
    format!("{}{}{}", family.as_str(), code, year.rem_euclid(10))
}

// ─────────────────────────────────────────────────────────
// Persisted contract mappings (`contracts:mappings`)
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractMappings {
    /// Per-family front-month overrides (family → concrete symbol).
    #[serde(default)]
    pub front_months: HashMap<String, String>,
    /// Broker contractId → concrete symbol, for snapshots that carry only ids.
    #[serde(default)]
    pub contract_ids: HashMap<String, String>,
    #[serde(default = "default_tick")]
    pub tick_size: f64,
}

fn default_tick() -> f64 {
    DEFAULT_TICK
}

impl ContractMappings {
    pub fn resolve_front_month(&self, family: ContractFamily, now: DateTime<Utc>) -> String {
        self.front_months
            .get(family.as_str())
            .cloned()
            .unwrap_or_else(|| front_month(family, now))
    }

    pub fn symbol_for_contract_id(&self, contract_id: &str) -> Option<String> {
        self.contract_ids.get(contract_id).cloned()
    }
}

// ─────────────────────────────────────────────────────────
// Sizing
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizingMethod {
    Fixed,
    RiskBased,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractPreference {
    /// Keep the family the signal asked for.
    Auto,
    Micro,
    Full,
}

#[derive(Debug, Clone)]
pub struct SizingConfig {
    pub method: SizingMethod,
    pub preference: ContractPreference,
    pub default_quantity: i64,
    pub risk_pct: f64,
    pub max_contracts: i64,
    pub default_balance: f64,
    /// Sizing backend endpoint returning `{"balance": 52340.0}`. Optional —
    /// without it the default balance applies.
    pub balance_url: Option<String>,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            method: SizingMethod::Fixed,
            preference: ContractPreference::Auto,
            default_quantity: 1,
            risk_pct: 0.01,
            max_contracts: 5,
            default_balance: 50_000.0,
            balance_url: None,
        }
    }
}

/// Result of one logical→concrete conversion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SizingOutcome {
    pub symbol: String,
    pub quantity: i64,
    /// True when the family changed (full→micro or preference override).
    pub converted: bool,
    pub reason: String,
    pub original_symbol: String,
    pub original_quantity: Option<f64>,
}

/// Converts logical symbols and quantities into broker-ready ones.
///
/// The account balance comes from an HTTP sizing backend with a 5 s timeout;
/// on failure the last fetched value is reused, then the configured default.
/// Sizing never blocks signal processing indefinitely.
pub struct SymbolResolver {
    cfg: SizingConfig,
    mappings: ContractMappings,
    http: reqwest::Client,
    cached_balance: Option<f64>,
}

impl SymbolResolver {
    pub fn new(cfg: SizingConfig, mappings: ContractMappings) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            cfg,
            mappings,
            http,
            cached_balance: None,
        }
    }

    pub fn mappings(&self) -> &ContractMappings {
        &self.mappings
    }

    pub fn set_mappings(&mut self, mappings: ContractMappings) {
        self.mappings = mappings;
    }

    pub fn tick(&self) -> f64 {
        self.mappings.tick_size
    }

    /// Resolve a signal's logical symbol + quantity to a concrete contract
    /// and whole-contract count.
    pub async fn resolve(
        &mut self,
        logical: &str,
        requested_qty: Option<f64>,
        entry_price: Option<f64>,
        stop_price: Option<f64>,
    ) -> Result<SizingOutcome, SizingError> {
        let asked = parse_logical(logical)?;
        let preferred = match self.cfg.preference {
            ContractPreference::Auto => asked,
            ContractPreference::Micro => asked.micro(),
            ContractPreference::Full => asked.full(),
        };

        let now = Utc::now();
        match self.cfg.method {
            SizingMethod::Fixed => {
                let quantity = requested_qty
                    .map(|q| q.round() as i64)
                    .filter(|q| *q > 0)
                    .unwrap_or(self.cfg.default_quantity)
                    .clamp(1, self.cfg.max_contracts);
                Ok(SizingOutcome {
                    symbol: self.mappings.resolve_front_month(preferred, now),
                    quantity,
                    converted: preferred != asked,
                    reason: "fixed".to_string(),
                    original_symbol: logical.to_string(),
                    original_quantity: requested_qty,
                })
            }
            SizingMethod::RiskBased => {
                let (entry, stop) = match (entry_price, stop_price) {
                    (Some(e), Some(s)) => (e, s),
                    _ => return Err(SizingError::InsufficientInputs),
                };
                let stop_distance = (entry - stop).abs();
                if stop_distance <= f64::EPSILON {
                    return Err(SizingError::InsufficientInputs);
                }

                let balance = self.account_balance().await;
                let risk_budget = balance * self.cfg.risk_pct;

                // Full contracts first; downconvert to micros when one full
                // contract already blows the budget.
                let mut family = preferred.full();
                let mut risk_per_contract = stop_distance * family.point_value();
                let mut converted = preferred != asked;
                let mut reason = format!(
                    "risk: budget ${risk_budget:.0} @ {stop_distance:.2}pt stop"
                );
                if risk_per_contract > risk_budget {
                    family = family.micro();
                    risk_per_contract = stop_distance * family.point_value();
                    converted = true;
                    reason.push_str(" → micro");
                }

                let quantity = ((risk_budget / risk_per_contract).floor() as i64)
                    .clamp(1, self.cfg.max_contracts);
                Ok(SizingOutcome {
                    symbol: self.mappings.resolve_front_month(family, now),
                    quantity,
                    converted,
                    reason,
                    original_symbol: logical.to_string(),
                    original_quantity: requested_qty,
                })
            }
        }
    }

    /// Account balance with cached / default fallbacks.
    async fn account_balance(&mut self) -> f64 {
        let url = match &self.cfg.balance_url {
            Some(u) => u.clone(),
            None => return self.cached_balance.unwrap_or(self.cfg.default_balance),
        };
        match self.fetch_balance(&url).await {
            Ok(balance) => {
                self.cached_balance = Some(balance);
                balance
            }
            Err(err) => {
                let fallback = self.cached_balance.unwrap_or(self.cfg.default_balance);
                warn!(
                    "💰 Sizing backend unreachable ({err:#}) — using ${fallback:.0}"
                );
                fallback
            }
        }
    }

    async fn fetch_balance(&self, url: &str) -> anyhow::Result<f64> {
        let resp: serde_json::Value = self.http.get(url).send().await?.json().await?;
        let balance = crate::events::field_f64(&resp, &["balance", "accountBalance"])
            .ok_or_else(|| anyhow::anyhow!("sizing response without balance"))?;
        info!("💰 Account balance refreshed: ${balance:.0}");
        Ok(balance)
    }
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn resolver(cfg: SizingConfig) -> SymbolResolver {
        SymbolResolver::new(cfg, ContractMappings::default())
    }

    #[test]
    fn test_parse_logical() {
        assert_eq!(parse_logical("NQ1!").unwrap(), ContractFamily::NQ);
        assert_eq!(parse_logical("MNQ1!").unwrap(), ContractFamily::MNQ);
        assert_eq!(parse_logical("es").unwrap(), ContractFamily::ES);
        assert_eq!(parse_logical("M2K1!").unwrap(), ContractFamily::M2K);
        assert!(parse_logical("CL1!").is_err());
        assert!(parse_logical("").is_err());
    }

    #[test]
    fn test_micro_normalization() {
        assert_eq!(underlying_of_symbol("MNQZ5"), Some(Underlying::Nq));
        assert_eq!(underlying_of_symbol("NQH6"), Some(Underlying::Nq));
        assert_eq!(underlying_of_symbol("MESH6"), Some(Underlying::Es));
        assert_eq!(underlying_of_symbol("XYZ"), None);
    }

    #[test]
    fn test_front_month_quarters() {
        let jan = Utc.with_ymd_and_hms(2026, 1, 10, 0, 0, 0).unwrap();
        assert_eq!(front_month(ContractFamily::NQ, jan), "NQH6");

        // Past the mid-March roll → June.
        let late_mar = Utc.with_ymd_and_hms(2026, 3, 20, 0, 0, 0).unwrap();
        assert_eq!(front_month(ContractFamily::NQ, late_mar), "NQM6");

        // Past the December roll → next year's March.
        let late_dec = Utc.with_ymd_and_hms(2026, 12, 20, 0, 0, 0).unwrap();
        assert_eq!(front_month(ContractFamily::ES, late_dec), "ESH7");
    }

    #[test]
    fn test_front_month_override() {
        let mut m = ContractMappings::default();
        m.front_months.insert("NQ".into(), "NQM6".into());
        let jan = Utc.with_ymd_and_hms(2026, 1, 10, 0, 0, 0).unwrap();
        assert_eq!(m.resolve_front_month(ContractFamily::NQ, jan), "NQM6");
        assert_eq!(m.resolve_front_month(ContractFamily::ES, jan), "ESH6");
    }

    #[test]
    fn test_round_to_tick() {
        assert!((round_to_tick(21000.13, 0.25) - 21000.25).abs() < 1e-9);
        assert!((round_to_tick(21000.10, 0.25) - 21000.0).abs() < 1e-9);
        assert!((round_to_tick(20990.0, 0.25) - 20990.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_fixed_sizing_keeps_family() {
        let mut r = resolver(SizingConfig::default());
        let out = r.resolve("NQ1!", Some(2.0), None, None).await.unwrap();
        assert!(out.symbol.starts_with("NQ"));
        assert!(!out.symbol.starts_with("MNQ"));
        assert_eq!(out.quantity, 2);
        assert!(!out.converted);
    }

    #[tokio::test]
    async fn test_fixed_sizing_micro_preference() {
        let cfg = SizingConfig {
            preference: ContractPreference::Micro,
            ..SizingConfig::default()
        };
        let mut r = resolver(cfg);
        let out = r.resolve("NQ1!", None, None, None).await.unwrap();
        assert!(out.symbol.starts_with("MNQ"));
        assert!(out.converted);
    }

    #[tokio::test]
    async fn test_risk_sizing_full_fits() {
        // $50k × 1% = $500 budget; 20pt stop on NQ = $400/contract → 1 full.
        let cfg = SizingConfig {
            method: SizingMethod::RiskBased,
            ..SizingConfig::default()
        };
        let mut r = resolver(cfg);
        let out = r
            .resolve("NQ1!", None, Some(21000.0), Some(20980.0))
            .await
            .unwrap();
        assert!(out.symbol.starts_with("NQ") && !out.symbol.starts_with("MNQ"));
        assert_eq!(out.quantity, 1);
        assert!(!out.converted);
    }

    #[tokio::test]
    async fn test_risk_sizing_downconverts_to_micro() {
        // 40pt stop on NQ = $800/contract > $500 budget → MNQ at $80 → 6,
        // clamped to max_contracts.
        let cfg = SizingConfig {
            method: SizingMethod::RiskBased,
            max_contracts: 10,
            ..SizingConfig::default()
        };
        let mut r = resolver(cfg);
        let out = r
            .resolve("NQ1!", None, Some(21000.0), Some(20960.0))
            .await
            .unwrap();
        assert!(out.symbol.starts_with("MNQ"));
        assert_eq!(out.quantity, 6);
        assert!(out.converted);
    }

    #[tokio::test]
    async fn test_risk_sizing_needs_inputs() {
        let cfg = SizingConfig {
            method: SizingMethod::RiskBased,
            ..SizingConfig::default()
        };
        let mut r = resolver(cfg);
        let err = r.resolve("NQ1!", None, Some(21000.0), None).await;
        assert!(matches!(err, Err(SizingError::InsufficientInputs)));
    }
}
