// ── Runtime configuration ──
//
// Tuning knobs for one `Hub`. The host builds a `HubConfig` (usually from
// its own settings file) and hands it in -- core never reads config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for a [`Hub`](crate::Hub).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Minimum interval between two reloads of the same registry.
    #[serde(with = "duration_secs")]
    pub registry_throttle: Duration,
    /// How long `shutdown` waits for background work before abandoning it.
    #[serde(with = "duration_secs")]
    pub shutdown_timeout: Duration,
    /// Queue bound of each stream handed out by `Feed::into_stream`.
    pub stream_capacity: usize,
    /// Capacity of the command processor channel.
    pub command_channel_size: usize,
    /// Upper bound on the snapshot and registry loads of `connect`.
    #[serde(with = "duration_secs")]
    pub initialize_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            registry_throttle: Duration::from_secs(300),
            shutdown_timeout: Duration::from_secs(5),
            stream_capacity: 1024,
            command_channel_size: 64,
            initialize_timeout: Duration::from_secs(30),
        }
    }
}

/// Durations travel as (fractional) seconds.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
