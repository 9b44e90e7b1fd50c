//! Environment-driven configuration. Every knob has a default good enough
//! for a dry local run; `.env` / environment variables override.

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use crate::contracts::{ContractPreference, SizingConfig, SizingMethod};
use crate::strategy::FilterRules;

// ─────────────────────────────────────────────────────────
// Env helpers
// ─────────────────────────────────────────────────────────

fn env_str(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_f64(name: &str, default: f64) -> f64 {
    env_str(name)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_i64(name: &str, default: i64) -> i64 {
    env_str(name)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    env_str(name)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    match env_str(name) {
        Some(v) => v != "0" && v.to_lowercase() != "false",
        None => default,
    }
}

// ─────────────────────────────────────────────────────────
// Settings
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusMode {
    Ws,
    Memory,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub bus_mode: BusMode,
    pub bus_url: String,
    pub http_addr: String,
    pub log_dir: Option<String>,
    pub orchestrator: OrchestratorConfig,
    pub sizing: SizingConfig,
}

impl Settings {
    pub fn from_env() -> Settings {
        Settings {
            bus_mode: match env_str("ORCH_BUS_MODE").as_deref() {
                Some("memory") => BusMode::Memory,
                _ => BusMode::Ws,
            },
            bus_url: env_str("ORCH_BUS_URL")
                .unwrap_or_else(|| "ws://127.0.0.1:6789/bus".to_string()),
            http_addr: env_str("ORCH_HTTP_ADDR").unwrap_or_else(|| "0.0.0.0:8090".to_string()),
            log_dir: env_str("ORCH_LOG_DIR"),
            orchestrator: OrchestratorConfig::from_env(),
            sizing: sizing_from_env(),
        }
    }
}

// ─────────────────────────────────────────────────────────
// Orchestrator knobs
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Global trading flag at startup; flippable via the HTTP surface.
    pub trading_enabled: bool,
    /// Max absolute contracts per underlying.
    pub max_position_size: i64,
    /// Daily realized-loss cutoff in dollars; 0 disables.
    pub daily_loss_limit: f64,
    pub allow_reversals: bool,
    /// Broker-truth staleness beyond which a new entry forces a sync.
    pub freshness: Duration,
    /// How long to hold a parked signal waiting for that sync.
    pub sync_timeout: Duration,
    /// Full-sync stash matching: price proximity in points.
    pub stash_price_tolerance: f64,
    /// Full-sync stash matching: timestamp proximity.
    pub stash_time_tolerance: Duration,
    /// Bracket re-linking: stop/target price proximity in points.
    pub bracket_price_tolerance: f64,
    pub rules: FilterRules,
    /// Strategy → (breakeven trigger, offset) defaults, used when a restored
    /// context lacks its own.
    pub breakeven_defaults: HashMap<String, (f64, f64)>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            trading_enabled: true,
            max_position_size: 5,
            daily_loss_limit: 0.0,
            allow_reversals: false,
            freshness: Duration::from_secs(30),
            sync_timeout: Duration::from_secs(10),
            stash_price_tolerance: 10.0,
            stash_time_tolerance: Duration::from_secs(300),
            bracket_price_tolerance: 1.0,
            rules: FilterRules::default(),
            breakeven_defaults: HashMap::new(),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.trading_enabled = env_bool("ORCH_TRADING_ENABLED", cfg.trading_enabled);
        cfg.max_position_size = env_i64("ORCH_MAX_POSITION_SIZE", cfg.max_position_size);
        cfg.daily_loss_limit = env_f64("ORCH_DAILY_LOSS_LIMIT", cfg.daily_loss_limit);
        cfg.allow_reversals = env_bool("ORCH_ALLOW_REVERSALS", cfg.allow_reversals);
        cfg.freshness = Duration::from_secs(env_u64("ORCH_FRESHNESS_SECS", 30));
        cfg.sync_timeout = Duration::from_secs(env_u64("ORCH_SYNC_TIMEOUT_SECS", 10));
        cfg.stash_price_tolerance =
            env_f64("ORCH_STASH_PRICE_TOLERANCE", cfg.stash_price_tolerance);
        cfg.stash_time_tolerance =
            Duration::from_secs(env_u64("ORCH_STASH_TIME_TOLERANCE_SECS", 300));
        cfg.bracket_price_tolerance =
            env_f64("ORCH_BRACKET_PRICE_TOLERANCE", cfg.bracket_price_tolerance);
        cfg.rules.allow_same_direction =
            env_bool("ORCH_ALLOW_SAME_DIRECTION", cfg.rules.allow_same_direction);
        if let Some(raw) = env_str("ORCH_QTY_MULTIPLIERS") {
            // "GEX_SCALP:0.5,IV_SKEW_GEX:2"
            for part in raw.split(',') {
                if let Some((name, mult)) = part.split_once(':') {
                    if let Ok(m) = mult.trim().parse::<f64>() {
                        cfg.rules
                            .qty_multipliers
                            .insert(name.trim().to_string(), m);
                    }
                }
            }
        }
        if let Some(raw) = env_str("ORCH_BREAKEVEN_DEFAULTS") {
            // "IV_SKEW_GEX:20:5,GEX_SCALP:10:2"
            for part in raw.split(',') {
                let fields: Vec<&str> = part.split(':').collect();
                if fields.len() == 3 {
                    if let (Ok(trigger), Ok(offset)) =
                        (fields[1].trim().parse::<f64>(), fields[2].trim().parse::<f64>())
                    {
                        cfg.breakeven_defaults
                            .insert(fields[0].trim().to_string(), (trigger, offset));
                    }
                }
            }
        }
        cfg
    }
}

fn sizing_from_env() -> SizingConfig {
    let mut cfg = SizingConfig::default();
    cfg.method = match env_str("ORCH_SIZING_METHOD").as_deref() {
        Some("risk") | Some("risk_based") => SizingMethod::RiskBased,
        _ => SizingMethod::Fixed,
    };
    cfg.preference = match env_str("ORCH_CONTRACT_PREFERENCE").as_deref() {
        Some("micro") => ContractPreference::Micro,
        Some("full") => ContractPreference::Full,
        _ => ContractPreference::Auto,
    };
    cfg.default_quantity = env_i64("ORCH_DEFAULT_QUANTITY", cfg.default_quantity);
    cfg.risk_pct = env_f64("ORCH_RISK_PCT", cfg.risk_pct);
    cfg.max_contracts = env_i64("ORCH_MAX_CONTRACTS", cfg.max_contracts);
    cfg.default_balance = env_f64("ORCH_DEFAULT_BALANCE", cfg.default_balance);
    cfg.balance_url = env_str("ORCH_BALANCE_URL");
    cfg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = OrchestratorConfig::default();
        assert!(cfg.trading_enabled);
        assert_eq!(cfg.freshness, Duration::from_secs(30));
        assert_eq!(cfg.sync_timeout, Duration::from_secs(10));
        assert!((cfg.stash_price_tolerance - 10.0).abs() < 1e-9);
        assert_eq!(cfg.stash_time_tolerance, Duration::from_secs(300));
        assert!((cfg.bracket_price_tolerance - 1.0).abs() < 1e-9);
    }
}
