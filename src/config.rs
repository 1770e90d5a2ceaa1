//! Tracker configuration.
//!
//! Every default reproduces the reference game rules and timings. Hosts can
//! override any subset from a JSON document; missing fields keep their default.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::eligibility::EligibilityConfig;
use crate::error::{Result, TrackerError};

/// Public OSRM demo server.
pub const DEFAULT_OSRM_BASE_URL: &str = "https://router.project-osrm.org";

/// Map-matching configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapConfig {
    /// Number of most recent fixes sent per map-matching request.
    /// Default: 5
    pub batch_size: usize,

    /// Preferred profile for walk/run sessions, tried before the generic ones.
    pub walking_profile: Option<String>,

    /// Preferred profile for cycling sessions, tried before the generic ones.
    pub cycling_profile: Option<String>,

    /// Base URL of the map-matching service.
    pub base_url: String,

    /// Timeout for a single profile attempt.
    /// Default: 10 seconds
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,
}

impl Default for SnapConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            walking_profile: None,
            cycling_profile: None,
            base_url: DEFAULT_OSRM_BASE_URL.to_string(),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl SnapConfig {
    /// Defaults overridden by `OSRM_BASE_URL`, `OSRM_WALKING_PROFILE` and
    /// `OSRM_CYCLING_PROFILE` when set and non-empty.
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        let defaults = Self::default();
        Self {
            base_url: var("OSRM_BASE_URL").unwrap_or(defaults.base_url),
            walking_profile: var("OSRM_WALKING_PROFILE"),
            cycling_profile: var("OSRM_CYCLING_PROFILE"),
            ..defaults
        }
    }
}

/// Live broadcast configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    /// Minimum spacing between publishes. Default: 2 seconds
    #[serde(with = "duration_ms")]
    pub min_interval: Duration,

    /// Number of trailing best-estimate points published. Default: 50
    pub trail_len: usize,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(2),
            trail_len: 50,
        }
    }
}

/// Local track buffer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Key under which the track is stored.
    pub storage_key: String,

    /// How often the in-memory track is written to the store while tracking.
    /// Default: 3 seconds
    #[serde(with = "duration_ms")]
    pub persist_interval: Duration,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            storage_key: "territoryrun_session_buffer".to_string(),
            persist_interval: Duration::from_secs(3),
        }
    }
}

/// Everything a session controller needs to know.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub eligibility: EligibilityConfig,
    pub snap: SnapConfig,
    pub live: LiveConfig,
    pub buffer: BufferConfig,
}

impl TrackerConfig {
    /// Parse a (possibly partial) JSON configuration document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| TrackerError::Config {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall a session.
    pub fn validate(&self) -> Result<()> {
        if self.snap.batch_size == 0 {
            return Err(TrackerError::Config {
                message: "snap.batch_size must be at least 1".to_string(),
            });
        }
        if self.buffer.persist_interval.is_zero() {
            return Err(TrackerError::Config {
                message: "buffer.persist_interval must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// Durations travel as integer milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
