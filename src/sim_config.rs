// Simulation Configuration

use std::path::Path;

use serde::Deserialize;

use crate::sim_error::SimError;
use crate::sim_interface::Tick;

// ============================================================================
// Configuration
// ============================================================================

/// Named values consumed by the engine, nodes and links.
///
/// Every field has a default, so a YAML file only needs the values it changes.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    // ===== Global =====
    /// Seconds of simulated time per tick (default: 0.001)
    pub tick_seconds: f64,

    // ===== Nodes =====
    /// Number of nodes the driver creates at start (default: 10)
    pub nodes: u64,

    /// Outgoing links a node tries to maintain (default: 4)
    pub node_links_outgoing: u64,

    /// Incoming links a node accepts before refusing new ones (default: 16)
    pub node_links_incoming_max: u64,

    /// Base verification time for one block in milliseconds (default: 10)
    pub block_processing_time_ms: u64,

    /// Processing-speed multiplier range (default: 0.2 - 2.0)
    pub node_processing_speed_min: f64,
    pub node_processing_speed_max: f64,

    /// Blocks retained by a pruning node (default: 40320, 14 days)
    pub redacted_window_size: u64,

    /// Share of live nodes that must sign a block before it is accepted (default: 0.5)
    pub consensus_fraction: f64,

    // ===== Sync =====
    /// Requests of each kind issued per retry round (default: 10)
    pub max_requests: u64,

    /// Ticks between retry rounds (default: 100)
    pub request_delay: Tick,

    // ===== Links =====
    /// Latency range in milliseconds (default: 5 - 200)
    pub link_latency_ms_min: f64,
    pub link_latency_ms_max: f64,

    /// Reliability range, 1.0 = no loss (default: 0.95 - 1.0)
    pub link_reliability_min: f64,
    pub link_reliability_max: f64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            tick_seconds: 0.001,

            nodes: 10,
            node_links_outgoing: 4,
            node_links_incoming_max: 16,
            block_processing_time_ms: 10,
            node_processing_speed_min: 0.2,
            node_processing_speed_max: 2.0,
            redacted_window_size: 40320,
            consensus_fraction: 0.5,

            max_requests: 10,
            request_delay: 100,

            link_latency_ms_min: 5.0,
            link_latency_ms_max: 200.0,
            link_reliability_min: 0.95,
            link_reliability_max: 1.0,
        }
    }
}

impl SimConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self, SimError> {
        let config: SimConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, SimError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    pub fn validate(&self) -> Result<(), SimError> {
        if !(self.tick_seconds > 0.0) {
            return Err(invalid("tick_seconds must be positive"));
        }
        if self.node_links_outgoing == 0 {
            return Err(invalid("node_links_outgoing must be at least 1"));
        }
        if self.node_processing_speed_min < 0.0
            || self.node_processing_speed_min > self.node_processing_speed_max
        {
            return Err(invalid("node processing speed range is invalid"));
        }
        if self.link_latency_ms_min < 0.0 || self.link_latency_ms_min > self.link_latency_ms_max {
            return Err(invalid("link latency range is invalid"));
        }
        if self.link_reliability_min < 0.0
            || self.link_reliability_max > 1.0
            || self.link_reliability_min > self.link_reliability_max
        {
            return Err(invalid("link reliability range must lie within [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.consensus_fraction) {
            return Err(invalid("consensus_fraction must lie within [0, 1]"));
        }
        if self.max_requests == 0 {
            return Err(invalid("max_requests must be at least 1"));
        }
        Ok(())
    }

    pub fn seconds_to_ticks(&self, seconds: f64) -> Tick {
        (seconds / self.tick_seconds) as Tick
    }

    pub fn ticks_to_seconds(&self, ticks: Tick) -> f64 {
        ticks as f64 * self.tick_seconds
    }

    pub fn ms_to_ticks(&self, ms: f64) -> Tick {
        self.seconds_to_ticks(ms / 1000.0)
    }

    /// Base verification time converted to ticks, before the speed multiplier.
    pub fn block_processing_ticks(&self) -> Tick {
        self.ms_to_ticks(self.block_processing_time_ms as f64)
    }
}

fn invalid(reason: &str) -> SimError {
    SimError::InvalidConfig(reason.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(SimConfig::default().validate().is_ok());
    }

    #[test]
    fn test_yaml_overrides_subset() {
        let config = SimConfig::from_yaml_str(
            "nodes: 25\nredacted_window_size: 40\nlink_reliability_min: 0.5\n",
        )
        .unwrap();

        assert_eq!(config.nodes, 25);
        assert_eq!(config.redacted_window_size, 40);
        assert_eq!(config.link_reliability_min, 0.5);
        // untouched values keep their defaults
        assert_eq!(config.node_links_outgoing, 4);
        assert_eq!(config.request_delay, 100);
    }

    #[test]
    fn test_inverted_range_rejected() {
        let result = SimConfig::from_yaml_str("link_latency_ms_min: 300\nlink_latency_ms_max: 10\n");
        assert!(matches!(result, Err(SimError::InvalidConfig(_))));
    }

    #[test]
    fn test_tick_conversions() {
        let config = SimConfig::default();

        assert_eq!(config.seconds_to_ticks(1.0), 1000);
        assert_eq!(config.ms_to_ticks(200.0), 200);
        assert_eq!(config.block_processing_ticks(), 10);
        assert!((config.ticks_to_seconds(250) - 0.25).abs() < 1e-9);
    }
}
