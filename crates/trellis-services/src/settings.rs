//! Runtime settings derived from config.
//!
//! These are the Duration-typed views the services work with. Both live
//! behind an `Arc<RwLock<_>>` so an operator can change them while the node
//! runs; daemons and the connector copy a snapshot at the top of each
//! iteration or connection and never observe a change mid-way.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use trellis_core::config::{ConnectionType, RoutingConfig, TransportConfig};

use crate::transport::RetryBudget;

#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub connection_type: ConnectionType,
    pub socket_cache_capacity: usize,
    pub socket_idle_timeout: Duration,
    pub max_inbound_connections: usize,
    pub connection_idle_timeout: Duration,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub retry: RetryBudget,
    pub max_frame_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct RoutingSettings {
    pub introduction_ceiling: Duration,
    pub introduction_floor: Duration,
    pub reunion_interval: Duration,
    pub dossier_ttl: Duration,
}

pub type SharedTransportSettings = Arc<RwLock<TransportSettings>>;
pub type SharedRoutingSettings = Arc<RwLock<RoutingSettings>>;

fn nonzero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

impl From<&TransportConfig> for TransportSettings {
    fn from(c: &TransportConfig) -> Self {
        Self {
            connection_type: c.connection_type,
            socket_cache_capacity: c.socket_cache_capacity.max(1),
            socket_idle_timeout: Duration::from_secs(c.socket_idle_timeout_secs),
            max_inbound_connections: c.max_inbound_connections.max(1),
            connection_idle_timeout: Duration::from_secs(c.connection_idle_timeout_secs),
            connect_timeout: Duration::from_secs(c.connect_timeout_secs),
            request_timeout: Duration::from_secs(c.request_timeout_secs),
            retry: RetryBudget {
                max_attempts: (c.transmit_max_attempts > 0).then_some(c.transmit_max_attempts),
                max_elapsed: nonzero_secs(c.transmit_max_elapsed_secs),
            },
            max_frame_bytes: c.max_frame_bytes,
        }
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self::from(&TransportConfig::default())
    }
}

impl From<&RoutingConfig> for RoutingSettings {
    fn from(c: &RoutingConfig) -> Self {
        Self {
            introduction_ceiling: Duration::from_secs(c.introduction_rate_secs),
            introduction_floor: Duration::from_secs(c.introduction_floor_secs),
            reunion_interval: Duration::from_secs(c.reunion_interval_secs),
            dossier_ttl: Duration::from_secs(c.dossier_ttl_secs),
        }
    }
}

impl Default for RoutingSettings {
    fn default() -> Self {
        Self::from(&RoutingConfig::default())
    }
}

/// Copy the current value out of a shared settings lock.
pub fn snapshot<T: Clone>(shared: &RwLock<T>) -> T {
    match shared.read() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_budget_fields_mean_unbounded() {
        let config = TransportConfig {
            transmit_max_attempts: 0,
            transmit_max_elapsed_secs: 0,
            ..Default::default()
        };
        let settings = TransportSettings::from(&config);
        assert_eq!(settings.retry, RetryBudget::unbounded());
    }

    #[test]
    fn default_budget_is_finite() {
        let settings = TransportSettings::default();
        assert_eq!(settings.retry.max_attempts, Some(8));
        assert_eq!(settings.retry.max_elapsed, Some(Duration::from_secs(30)));
    }

    #[test]
    fn routing_defaults() {
        let settings = RoutingSettings::default();
        assert_eq!(settings.introduction_ceiling, Duration::from_secs(600));
        assert_eq!(settings.reunion_interval, Duration::from_secs(3600));
        assert_eq!(settings.dossier_ttl, Duration::from_secs(30 * 24 * 3600));
    }
}
