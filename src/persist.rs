//! Persistent state store — a fixed set of named keys on the bus KV
//! side-channel, each holding one JSON blob. Writes are whole-key replaces.
//!
//! Load paths tolerate a missing key (first boot). A failed save is logged
//! and absorbed: the in-memory maps stay authoritative and the next
//! whole-key write repairs the KV.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::bus::{BusError, MessageBus};
use crate::contracts::ContractMappings;
use crate::events::SignalContext;
use crate::registry::{LifecycleEntry, SignalMappings, SignalRegistry, LIFECYCLE_TTL_DAYS};
use crate::strategy::{StrategyStateBlob, StrategyTracker, STRATEGY_STATE_VERSION};

pub mod keys {
    pub const SIGNAL_CONTEXT: &str = "signal:context";
    pub const SIGNAL_MAPPINGS: &str = "signal:mappings";
    pub const SIGNAL_LIFECYCLES: &str = "signal:lifecycles";
    pub const ORDER_STRATEGY: &str = "orders:strategy-mapping";
    pub const STRATEGY_STATE: &str = "multi-strategy:state";
    pub const CONTRACT_MAPPINGS: &str = "contracts:mappings";
}

#[derive(Clone)]
pub struct StateStore {
    bus: Arc<dyn MessageBus>,
}

impl StateStore {
    pub fn new(bus: Arc<dyn MessageBus>) -> StateStore {
        StateStore { bus }
    }

    // ── Generic plumbing ──

    async fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, BusError> {
        match self.bus.get(key).await? {
            None => Ok(None),
            Some(raw) => match serde_json::from_value::<T>(raw) {
                Ok(v) => Ok(Some(v)),
                Err(err) => {
                    // A corrupt blob is treated like a missing key — broker
                    // reconciliation rebuilds what matters.
                    warn!("💾 Discarding corrupt blob at '{key}': {err}");
                    Ok(None)
                }
            },
        }
    }

    async fn save<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) {
        let raw = match serde_json::to_value(value) {
            Ok(v) => v,
            Err(err) => {
                warn!("💾 Failed to serialize '{key}': {err}");
                return;
            }
        };
        if let Err(err) = self.bus.set(key, raw, ttl).await {
            warn!("💾 Failed to persist '{key}' ({err}) — retrying at next write");
        }
    }

    // ── signal:context ──

    pub async fn load_contexts(&self) -> Result<HashMap<String, SignalContext>, BusError> {
        Ok(self.load(keys::SIGNAL_CONTEXT).await?.unwrap_or_default())
    }

    pub async fn save_contexts(&self, contexts: &HashMap<String, SignalContext>) {
        self.save(keys::SIGNAL_CONTEXT, contexts, None).await;
    }

    // ── signal:mappings ──

    pub async fn load_mappings(&self) -> Result<SignalMappings, BusError> {
        Ok(self.load(keys::SIGNAL_MAPPINGS).await?.unwrap_or_default())
    }

    pub async fn save_mappings(&self, mappings: &SignalMappings) {
        self.save(keys::SIGNAL_MAPPINGS, mappings, None).await;
    }

    // ── signal:lifecycles (TTL) ──

    pub async fn load_lifecycles(
        &self,
    ) -> Result<HashMap<String, Vec<LifecycleEntry>>, BusError> {
        Ok(self.load(keys::SIGNAL_LIFECYCLES).await?.unwrap_or_default())
    }

    pub async fn save_lifecycles(&self, lifecycles: &HashMap<String, Vec<LifecycleEntry>>) {
        let ttl = Duration::from_secs(60 * 60 * 24 * LIFECYCLE_TTL_DAYS as u64);
        self.save(keys::SIGNAL_LIFECYCLES, lifecycles, Some(ttl)).await;
    }

    // ── orders:strategy-mapping ──

    pub async fn load_order_strategy(&self) -> Result<HashMap<String, String>, BusError> {
        Ok(self.load(keys::ORDER_STRATEGY).await?.unwrap_or_default())
    }

    pub async fn save_order_strategy(&self, map: &HashMap<String, String>) {
        self.save(keys::ORDER_STRATEGY, map, None).await;
    }

    // ── multi-strategy:state (versioned) ──

    pub async fn load_strategy_state(&self) -> Result<Option<StrategyTracker>, BusError> {
        let blob: Option<StrategyStateBlob> = self.load(keys::STRATEGY_STATE).await?;
        match blob {
            Some(blob) if blob.version == STRATEGY_STATE_VERSION => {
                Ok(Some(StrategyTracker::from_blob(blob)))
            }
            Some(blob) => {
                // The v1 single-global shape is not migrated; reconciliation
                // rebuilds the per-underlying state from broker truth.
                warn!(
                    "💾 Discarding multi-strategy:state v{} blob — awaiting reconciliation",
                    blob.version
                );
                Ok(None)
            }
            None => Ok(None),
        }
    }

    pub async fn save_strategy_state(&self, tracker: &StrategyTracker) {
        self.save(keys::STRATEGY_STATE, &tracker.to_blob(), None).await;
    }

    // ── contracts:mappings ──

    pub async fn load_contract_mappings(&self) -> Result<ContractMappings, BusError> {
        Ok(self.load(keys::CONTRACT_MAPPINGS).await?.unwrap_or_default())
    }

    // ── Composite flush ──

    /// Persist everything the registry and tracker own. Used on shutdown and
    /// after reconciliation.
    pub async fn flush_all(
        &self,
        registry: &SignalRegistry,
        tracker: &StrategyTracker,
        order_strategy: &HashMap<String, String>,
    ) {
        self.save_contexts(registry.contexts()).await;
        self.save_mappings(&registry.mappings_blob()).await;
        self.save_lifecycles(registry.lifecycles_blob()).await;
        self.save_order_strategy(order_strategy).await;
        self.save_strategy_state(tracker).await;
    }
}
