//! Two-level circuit breaker state, persisted in the shared store.
//!
//! The provider-level breaker runs the full closed/open/half-open machine.
//! The vendor-type breaker is a coarser two-state guard over a whole vendor
//! and protocol family; it closes directly once its open window elapses and
//! the next probe succeeds.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::{CircuitConfig, VendorCircuitConfig};
use crate::error::Result;
use crate::store::CoordStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Persisted per-provider breaker record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CircuitRecord {
    pub state: CircuitState,
    pub failure_count: u32,
    pub opened_until_ms: u64,
    pub half_open_successes: u32,
    pub manual_override: bool,
    #[serde(default)]
    pub last_failure_ms: u64,
}

impl Default for CircuitRecord {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            opened_until_ms: 0,
            half_open_successes: 0,
            manual_override: false,
            last_failure_ms: 0,
        }
    }
}

/// State transition worth notifying about.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitTransition {
    Opened,
    Closed,
}

impl CircuitRecord {
    /// Effective state at `now_ms`. An elapsed open window reads as
    /// half-open without a store write; the transition is persisted by the
    /// next recorded outcome.
    pub fn effective_state(&self, now_ms: u64) -> CircuitState {
        if self.manual_override {
            return CircuitState::Open;
        }
        match self.state {
            CircuitState::Open if now_ms >= self.opened_until_ms => CircuitState::HalfOpen,
            other => other,
        }
    }

    pub fn is_open(&self, now_ms: u64) -> bool {
        self.effective_state(now_ms) == CircuitState::Open
    }

    pub(crate) fn on_failure(
        &mut self,
        now_ms: u64,
        config: &CircuitConfig,
    ) -> Option<CircuitTransition> {
        self.last_failure_ms = now_ms;
        match self.effective_state(now_ms) {
            CircuitState::HalfOpen => {
                // A half-open trial failed: re-open for a fresh window.
                self.state = CircuitState::Open;
                self.opened_until_ms = now_ms + config.open_seconds * 1000;
                self.half_open_successes = 0;
                self.failure_count = self.failure_count.saturating_add(1);
                Some(CircuitTransition::Opened)
            }
            CircuitState::Closed => {
                self.failure_count = self.failure_count.saturating_add(1);
                if self.failure_count >= config.failure_threshold {
                    self.state = CircuitState::Open;
                    self.opened_until_ms = now_ms + config.open_seconds * 1000;
                    self.half_open_successes = 0;
                    Some(CircuitTransition::Opened)
                } else {
                    None
                }
            }
            CircuitState::Open => {
                self.failure_count = self.failure_count.saturating_add(1);
                None
            }
        }
    }

    pub(crate) fn on_success(
        &mut self,
        now_ms: u64,
        config: &CircuitConfig,
    ) -> Option<CircuitTransition> {
        match self.effective_state(now_ms) {
            CircuitState::HalfOpen => {
                self.state = CircuitState::HalfOpen;
                self.half_open_successes = self.half_open_successes.saturating_add(1);
                if self.half_open_successes >= config.half_open_success_threshold {
                    self.state = CircuitState::Closed;
                    self.failure_count = 0;
                    self.half_open_successes = 0;
                    self.opened_until_ms = 0;
                    Some(CircuitTransition::Closed)
                } else {
                    None
                }
            }
            CircuitState::Closed => {
                self.failure_count = 0;
                None
            }
            // Still inside the open window: nothing should be routed here,
            // so a stray success does not move the machine.
            CircuitState::Open => None,
        }
    }
}

/// Persisted vendor-type breaker record. Two states only.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct VendorCircuitRecord {
    #[serde(default)]
    pub open: bool,
    pub open_until_ms: u64,
    pub last_failure_ms: u64,
    pub failure_count: u32,
    pub manual_open: bool,
}

impl VendorCircuitRecord {
    pub fn is_open(&self, now_ms: u64) -> bool {
        self.manual_open || (self.open && now_ms < self.open_until_ms)
    }

    pub(crate) fn on_failure(&mut self, now_ms: u64, config: &VendorCircuitConfig) -> bool {
        self.last_failure_ms = now_ms;
        self.failure_count = self.failure_count.saturating_add(1);
        if !self.is_open(now_ms) && self.failure_count >= config.failure_threshold {
            self.open = true;
            self.open_until_ms = now_ms + config.open_seconds * 1000;
            return true;
        }
        false
    }

    pub(crate) fn on_success(&mut self, now_ms: u64) -> bool {
        if self.open && now_ms >= self.open_until_ms {
            self.open = false;
            self.open_until_ms = 0;
            self.failure_count = 0;
            return true;
        }
        if !self.open {
            self.failure_count = 0;
        }
        false
    }
}

/// Notification channel invoked on breaker transitions. The gateway wires
/// this to its alerting pipeline; the default does nothing.
#[async_trait]
pub trait CircuitAlerts: Send + Sync {
    async fn circuit_opened(&self, provider_id: &str, record: &CircuitRecord);
    async fn circuit_closed(&self, provider_id: &str);
}

#[derive(Debug, Default)]
pub struct NoopAlerts;

#[async_trait]
impl CircuitAlerts for NoopAlerts {
    async fn circuit_opened(&self, _provider_id: &str, _record: &CircuitRecord) {}
    async fn circuit_closed(&self, _provider_id: &str) {}
}

#[derive(Clone)]
pub struct CircuitStore {
    store: CoordStore,
    config: CircuitConfig,
    vendor_config: VendorCircuitConfig,
    clock: Arc<dyn Clock>,
    alerts: Arc<dyn CircuitAlerts>,
}

impl CircuitStore {
    pub fn new(
        store: CoordStore,
        config: CircuitConfig,
        vendor_config: VendorCircuitConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            config,
            vendor_config,
            clock,
            alerts: Arc::new(NoopAlerts),
        }
    }

    pub fn with_alerts(mut self, alerts: Arc<dyn CircuitAlerts>) -> Self {
        self.alerts = alerts;
        self
    }

    /// Whether the request-dispatch path should skip this provider. Reports
    /// closed on store failure so an outage never blocks traffic.
    pub async fn is_open(&self, provider_id: &str) -> bool {
        match self.load(provider_id).await {
            Ok(record) => record.is_open(self.clock.now_epoch_ms()),
            Err(err) => {
                warn!(provider_id, error = %err, "circuit read failed, reporting closed");
                false
            }
        }
    }

    /// Effective three-state view for routing decisions and dashboards.
    pub async fn evaluate(&self, provider_id: &str) -> CircuitState {
        match self.load(provider_id).await {
            Ok(record) => record.effective_state(self.clock.now_epoch_ms()),
            Err(err) => {
                warn!(provider_id, error = %err, "circuit read failed, reporting closed");
                CircuitState::Closed
            }
        }
    }

    pub async fn snapshot(&self, provider_id: &str) -> Option<CircuitRecord> {
        match self.load_optional(provider_id).await {
            Ok(record) => record,
            Err(err) => {
                warn!(provider_id, error = %err, "circuit snapshot read failed");
                None
            }
        }
    }

    pub async fn record_failure(&self, provider_id: &str) {
        let now_ms = self.clock.now_epoch_ms();
        let result = self
            .mutate(provider_id, |record| record.on_failure(now_ms, &self.config))
            .await;
        match result {
            Ok((record, Some(CircuitTransition::Opened))) => {
                warn!(
                    provider_id,
                    failure_count = record.failure_count,
                    opened_until_ms = record.opened_until_ms,
                    "circuit opened"
                );
                self.alerts.circuit_opened(provider_id, &record).await;
            }
            Ok(_) => {}
            Err(err) => warn!(provider_id, error = %err, "circuit failure write dropped"),
        }
    }

    pub async fn record_success(&self, provider_id: &str) {
        let now_ms = self.clock.now_epoch_ms();
        let result = self
            .mutate(provider_id, |record| record.on_success(now_ms, &self.config))
            .await;
        match result {
            Ok((_, Some(CircuitTransition::Closed))) => {
                info!(provider_id, "circuit closed");
                self.alerts.circuit_closed(provider_id).await;
            }
            Ok(_) => {}
            Err(err) => warn!(provider_id, error = %err, "circuit success write dropped"),
        }
    }

    /// Force the breaker open (or clear the override) regardless of counters.
    pub async fn set_manual_override(&self, provider_id: &str, on: bool) {
        let result = self
            .mutate(provider_id, |record| {
                record.manual_override = on;
                None::<CircuitTransition>
            })
            .await;
        if let Err(err) = result {
            warn!(provider_id, on, error = %err, "manual override write dropped");
        }
    }

    pub async fn is_vendor_open(&self, vendor_id: &str, provider_type: &str) -> bool {
        match self.load_vendor(vendor_id, provider_type).await {
            Ok(record) => record.is_open(self.clock.now_epoch_ms()),
            Err(err) => {
                warn!(vendor_id, provider_type, error = %err, "vendor circuit read failed, reporting closed");
                false
            }
        }
    }

    pub async fn record_vendor_failure(&self, vendor_id: &str, provider_type: &str) {
        let now_ms = self.clock.now_epoch_ms();
        let result = self
            .mutate_vendor(vendor_id, provider_type, |record| {
                record.on_failure(now_ms, &self.vendor_config)
            })
            .await;
        match result {
            Ok((record, true)) => {
                warn!(
                    vendor_id,
                    provider_type,
                    open_until_ms = record.open_until_ms,
                    "vendor-type circuit opened"
                );
            }
            Ok(_) => {}
            Err(err) => {
                warn!(vendor_id, provider_type, error = %err, "vendor circuit failure write dropped");
            }
        }
    }

    pub async fn record_vendor_success(&self, vendor_id: &str, provider_type: &str) {
        let now_ms = self.clock.now_epoch_ms();
        let result = self
            .mutate_vendor(vendor_id, provider_type, |record| record.on_success(now_ms))
            .await;
        match result {
            Ok((_, true)) => info!(vendor_id, provider_type, "vendor-type circuit closed"),
            Ok(_) => {}
            Err(err) => {
                warn!(vendor_id, provider_type, error = %err, "vendor circuit success write dropped");
            }
        }
    }

    pub async fn set_vendor_manual_open(&self, vendor_id: &str, provider_type: &str, on: bool) {
        let result = self
            .mutate_vendor(vendor_id, provider_type, |record| {
                record.manual_open = on;
                false
            })
            .await;
        if let Err(err) = result {
            warn!(vendor_id, provider_type, on, error = %err, "vendor manual open write dropped");
        }
    }

    async fn load(&self, provider_id: &str) -> Result<CircuitRecord> {
        Ok(self.load_optional(provider_id).await?.unwrap_or_default())
    }

    async fn load_optional(&self, provider_id: &str) -> Result<Option<CircuitRecord>> {
        let mut conn = self.store.connection().await?;
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.store.key_circuit(provider_id))
            .query_async(&mut conn)
            .await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn mutate<T>(
        &self,
        provider_id: &str,
        apply: impl FnOnce(&mut CircuitRecord) -> T,
    ) -> Result<(CircuitRecord, T)> {
        let mut record = self.load(provider_id).await?;
        let outcome = apply(&mut record);
        let mut conn = self.store.connection().await?;
        let _: () = redis::cmd("SET")
            .arg(self.store.key_circuit(provider_id))
            .arg(serde_json::to_string(&record)?)
            .arg("EX")
            .arg(self.config.idle_ttl_seconds)
            .query_async(&mut conn)
            .await?;
        Ok((record, outcome))
    }

    async fn load_vendor(&self, vendor_id: &str, provider_type: &str) -> Result<VendorCircuitRecord> {
        let mut conn = self.store.connection().await?;
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.store.key_vendor_type_circuit(vendor_id, provider_type))
            .query_async(&mut conn)
            .await?;
        match raw {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(VendorCircuitRecord::default()),
        }
    }

    async fn mutate_vendor<T>(
        &self,
        vendor_id: &str,
        provider_type: &str,
        apply: impl FnOnce(&mut VendorCircuitRecord) -> T,
    ) -> Result<(VendorCircuitRecord, T)> {
        let mut record = self.load_vendor(vendor_id, provider_type).await?;
        let outcome = apply(&mut record);
        let mut conn = self.store.connection().await?;
        let _: () = redis::cmd("SET")
            .arg(self.store.key_vendor_type_circuit(vendor_id, provider_type))
            .arg(serde_json::to_string(&record)?)
            .arg("EX")
            .arg(self.vendor_config.idle_ttl_seconds)
            .query_async(&mut conn)
            .await?;
        Ok((record, outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CircuitConfig {
        CircuitConfig {
            failure_threshold: 3,
            open_seconds: 60,
            half_open_success_threshold: 2,
            idle_ttl_seconds: 60,
        }
    }

    #[test]
    fn failures_at_threshold_open_the_circuit() {
        let config = config();
        let mut record = CircuitRecord::default();

        assert_eq!(record.on_failure(1_000, &config), None);
        assert_eq!(record.on_failure(2_000, &config), None);
        assert_eq!(
            record.on_failure(3_000, &config),
            Some(CircuitTransition::Opened)
        );
        assert_eq!(record.state, CircuitState::Open);
        assert_eq!(record.opened_until_ms, 63_000);
        assert!(record.is_open(3_001));
    }

    #[test]
    fn elapsed_open_window_reads_half_open() {
        let config = config();
        let mut record = CircuitRecord::default();
        for ts in [1_000, 2_000, 3_000] {
            record.on_failure(ts, &config);
        }

        assert_eq!(record.effective_state(62_999), CircuitState::Open);
        assert_eq!(record.effective_state(63_000), CircuitState::HalfOpen);
        assert!(!record.is_open(63_000));
    }

    #[test]
    fn half_open_successes_close_the_circuit() {
        let config = config();
        let mut record = CircuitRecord::default();
        for ts in [1_000, 2_000, 3_000] {
            record.on_failure(ts, &config);
        }

        assert_eq!(record.on_success(63_000, &config), None);
        assert_eq!(
            record.on_success(64_000, &config),
            Some(CircuitTransition::Closed)
        );
        assert_eq!(record.state, CircuitState::Closed);
        assert_eq!(record.failure_count, 0);
    }

    #[test]
    fn half_open_failure_reopens_with_fresh_window() {
        let config = config();
        let mut record = CircuitRecord::default();
        for ts in [1_000, 2_000, 3_000] {
            record.on_failure(ts, &config);
        }

        assert_eq!(
            record.on_failure(70_000, &config),
            Some(CircuitTransition::Opened)
        );
        assert_eq!(record.state, CircuitState::Open);
        assert_eq!(record.opened_until_ms, 130_000);
        assert_eq!(record.half_open_successes, 0);
    }

    #[test]
    fn manual_override_forces_open_until_cleared() {
        let mut record = CircuitRecord::default();
        record.manual_override = true;
        assert!(record.is_open(0));

        record.manual_override = false;
        assert!(!record.is_open(0));
    }

    #[test]
    fn closed_success_resets_failure_count() {
        let config = config();
        let mut record = CircuitRecord::default();
        record.on_failure(1_000, &config);
        record.on_failure(2_000, &config);
        assert_eq!(record.failure_count, 2);

        record.on_success(3_000, &config);
        assert_eq!(record.failure_count, 0);
        assert_eq!(record.state, CircuitState::Closed);
    }

    #[test]
    fn vendor_breaker_opens_and_closes_without_half_open() {
        let config = VendorCircuitConfig {
            failure_threshold: 2,
            open_seconds: 10,
            idle_ttl_seconds: 60,
        };
        let mut record = VendorCircuitRecord::default();

        assert!(!record.on_failure(1_000, &config));
        assert!(record.on_failure(2_000, &config));
        assert!(record.is_open(2_001));
        assert!(record.is_open(11_999));

        // Window elapsed: not open any more, but only a success resets it.
        assert!(!record.is_open(12_000));
        assert!(record.on_success(12_000));
        assert_eq!(record.failure_count, 0);
        assert!(!record.open);
    }

    #[test]
    fn vendor_manual_open_wins_over_elapsed_window() {
        let mut record = VendorCircuitRecord {
            manual_open: true,
            ..VendorCircuitRecord::default()
        };
        assert!(record.is_open(u64::MAX));
        record.manual_open = false;
        assert!(!record.is_open(0));
    }
}
