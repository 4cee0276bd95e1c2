use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CoordinationConfig {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub circuit: CircuitConfig,
    #[serde(default)]
    pub vendor_circuit: VendorCircuitConfig,
    #[serde(default)]
    pub prober: ProberConfig,
}

impl CoordinationConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Sliding TTL applied to every session-adjacent key.
    #[serde(default = "default_session_ttl_seconds")]
    pub ttl_seconds: u64,
    /// Conversations at or under this many messages are treated as "short"
    /// for the concurrent-sibling identity guard.
    #[serde(default = "default_short_message_threshold")]
    pub short_message_threshold: u32,
    /// How many leading messages feed the content-hash fallback.
    #[serde(default = "default_hash_message_count")]
    pub hash_message_count: usize,
}

fn default_session_ttl_seconds() -> u64 {
    300
}

fn default_short_message_threshold() -> u32 {
    2
}

fn default_hash_message_count() -> usize {
    3
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_session_ttl_seconds(),
            short_message_threshold: default_short_message_threshold(),
            hash_message_count: default_hash_message_count(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// Activity window: set entries older than this are pruned before any
    /// count is trusted.
    #[serde(default = "default_concurrency_window_seconds")]
    pub window_seconds: u64,
}

fn default_concurrency_window_seconds() -> u64 {
    300
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            window_seconds: default_concurrency_window_seconds(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CircuitConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_open_seconds")]
    pub open_seconds: u64,
    #[serde(default = "default_half_open_success_threshold")]
    pub half_open_success_threshold: u32,
    /// Idle expiry for persisted breaker records; fixed, not session-scoped.
    #[serde(default = "default_circuit_idle_ttl_seconds")]
    pub idle_ttl_seconds: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_open_seconds() -> u64 {
    60
}

fn default_half_open_success_threshold() -> u32 {
    2
}

fn default_circuit_idle_ttl_seconds() -> u64 {
    30 * 24 * 60 * 60
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            open_seconds: default_open_seconds(),
            half_open_success_threshold: default_half_open_success_threshold(),
            idle_ttl_seconds: default_circuit_idle_ttl_seconds(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VendorCircuitConfig {
    #[serde(default = "default_vendor_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_vendor_open_seconds")]
    pub open_seconds: u64,
    #[serde(default = "default_circuit_idle_ttl_seconds")]
    pub idle_ttl_seconds: u64,
}

fn default_vendor_failure_threshold() -> u32 {
    3
}

fn default_vendor_open_seconds() -> u64 {
    300
}

impl Default for VendorCircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_vendor_failure_threshold(),
            open_seconds: default_vendor_open_seconds(),
            idle_ttl_seconds: default_circuit_idle_ttl_seconds(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProberConfig {
    #[serde(default = "default_probe_interval_seconds")]
    pub interval_seconds: u64,
    #[serde(default = "default_probe_timeout_seconds")]
    pub probe_timeout_seconds: u64,
    /// Worker pool width for one probe cycle.
    #[serde(default = "default_probe_concurrency")]
    pub concurrency: usize,
    /// Upper bound on the random pre-cycle delay that desynchronizes
    /// replicas racing into leadership.
    #[serde(default = "default_jitter_max_ms")]
    pub jitter_max_ms: u64,
    #[serde(default = "default_lease_ttl_seconds")]
    pub lease_ttl_seconds: u64,
    #[serde(default = "default_history_retention_seconds")]
    pub history_retention_seconds: u64,
    #[serde(default = "default_cleanup_interval_seconds")]
    pub cleanup_interval_seconds: u64,
}

fn default_probe_interval_seconds() -> u64 {
    60
}

fn default_probe_timeout_seconds() -> u64 {
    5
}

fn default_probe_concurrency() -> usize {
    4
}

fn default_jitter_max_ms() -> u64 {
    1500
}

fn default_lease_ttl_seconds() -> u64 {
    30
}

fn default_history_retention_seconds() -> u64 {
    7 * 24 * 60 * 60
}

fn default_cleanup_interval_seconds() -> u64 {
    3600
}

impl Default for ProberConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_probe_interval_seconds(),
            probe_timeout_seconds: default_probe_timeout_seconds(),
            concurrency: default_probe_concurrency(),
            jitter_max_ms: default_jitter_max_ms(),
            lease_ttl_seconds: default_lease_ttl_seconds(),
            history_retention_seconds: default_history_retention_seconds(),
            cleanup_interval_seconds: default_cleanup_interval_seconds(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config = CoordinationConfig::from_toml_str("").unwrap();
        assert_eq!(config.session.ttl_seconds, 300);
        assert_eq!(config.concurrency.window_seconds, 300);
        assert_eq!(config.circuit.failure_threshold, 5);
        assert_eq!(config.prober.concurrency, 4);
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let raw = r#"
[circuit]
failure_threshold = 2
open_seconds = 10

[prober]
interval_seconds = 5
"#;
        let config = CoordinationConfig::from_toml_str(raw).unwrap();
        assert_eq!(config.circuit.failure_threshold, 2);
        assert_eq!(config.circuit.open_seconds, 10);
        assert_eq!(config.circuit.half_open_success_threshold, 2);
        assert_eq!(config.prober.interval_seconds, 5);
        assert_eq!(config.prober.lease_ttl_seconds, 30);
    }
}
