//! Tunable node parameters.

use serde::{Deserialize, Serialize};
use tokio::time::Duration;

/// Default bucket size and replication factor.
pub const DEFAULT_K: usize = 20;
/// Default parallelism for concurrent lookups.
pub const DEFAULT_ALPHA: usize = 3;

const HOUR: Duration = Duration::from_secs(60 * 60);

/// Parameters shared by the routing table, lookup engine, stores and
/// maintenance loops of a single node.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtConfig {
    /// Bucket capacity and replication factor.
    pub k: usize,
    /// Number of RPCs launched per lookup round.
    pub alpha: usize,
    /// Budget for a single RPC, including the liveness probe on eviction.
    pub rpc_timeout: Duration,
    /// Wall-clock budget for a whole iterative lookup.
    pub lookup_timeout: Duration,
    /// Lifetime of a value record unless republished.
    pub record_ttl: Duration,
    /// Lifetime of a provider record unless refreshed.
    pub provider_ttl: Duration,
    /// Period of the self-lookup and stale bucket refresh.
    pub refresh_interval: Duration,
    /// A bucket untouched for this long is refreshed with a random lookup.
    pub bucket_stale_threshold: Duration,
    /// Period of the value/provider expiry sweep.
    pub expiry_interval: Duration,
    /// Period of republishing locally-originated records.
    pub republish_interval: Duration,
    /// Attempts per replica for STORE and ADD_PROVIDER replication.
    pub replication_attempts: usize,
    /// Upper bound on stored value records.
    pub max_records: usize,
    /// Upper bound on keys with provider records.
    pub max_provider_keys: usize,
    /// Upper bound on provider records per key.
    pub max_providers_per_key: usize,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            rpc_timeout: Duration::from_secs(10),
            lookup_timeout: Duration::from_secs(60),
            record_ttl: 24 * HOUR,
            provider_ttl: 24 * HOUR,
            refresh_interval: HOUR,
            bucket_stale_threshold: HOUR,
            expiry_interval: HOUR,
            // Ahead of the TTL so replicas never lapse between republishes.
            republish_interval: 22 * HOUR,
            replication_attempts: 3,
            max_records: 100_000,
            max_provider_keys: 100_000,
            max_providers_per_key: 64,
        }
    }
}

impl DhtConfig {
    /// Default configuration with the given replication factor and concurrency.
    pub fn with_params(k: usize, alpha: usize) -> Self {
        Self {
            k: k.max(1),
            alpha: alpha.max(1),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn republish_runs_before_records_expire() {
        let config = DhtConfig::default();
        assert!(config.republish_interval < config.record_ttl);
        assert!(config.republish_interval < config.provider_ttl);
        assert!(config.rpc_timeout < config.lookup_timeout);
    }

    #[test]
    fn with_params_clamps_degenerate_values() {
        let config = DhtConfig::with_params(0, 0);
        assert_eq!(config.k, 1);
        assert_eq!(config.alpha, 1);
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = DhtConfig::with_params(8, 2);
        let json = serde_json::to_string(&config).expect("serialize");
        let parsed: DhtConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed.k, 8);
        assert_eq!(parsed.record_ttl, config.record_ttl);
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let parsed: DhtConfig = serde_json::from_str(r#"{"k": 4}"#).expect("deserialize");
        assert_eq!(parsed.k, 4);
        assert_eq!(parsed.alpha, DEFAULT_ALPHA);
        assert_eq!(parsed.replication_attempts, 3);
    }
}
