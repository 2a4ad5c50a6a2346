//! Tracker configuration.

use serde::{Deserialize, Serialize};

/// Settings captured once when a tracker is constructed.
///
/// The seed ratio is read at seed-phase entry; changing the configuration a
/// tracker was built with has no effect on a tracker already running.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct TrackerConfig {
    /// Upload/download ratio that ends the seed phase.
    ///
    /// Values at or below zero disable seed tracking: `SeedingDone` fires
    /// immediately after the download completes.
    #[serde(default)]
    pub seed_ratio: f64,
}

impl TrackerConfig {
    /// Configuration with the given seed ratio target.
    #[must_use]
    pub fn with_seed_ratio(seed_ratio: f64) -> Self {
        Self { seed_ratio }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_default_to_no_seed_tracking() {
        let config: TrackerConfig = serde_json::from_str("{}").expect("config deserializes");
        assert_eq!(config, TrackerConfig::default());
        assert!(config.seed_ratio <= 0.0);
    }

    #[test]
    fn seed_ratio_round_trips() {
        let config = TrackerConfig::with_seed_ratio(1.5);
        let json = serde_json::to_string(&config).expect("config serializes");
        let back: TrackerConfig = serde_json::from_str(&json).expect("config deserializes");
        assert_eq!(back, config);
    }
}
