//! # Territory Tracker
//!
//! Tracking sessions for a territory game: record a GPS track, snap it onto the
//! path network, decide when it forms a claimable loop, and submit the loop as a
//! territory claim.
//!
//! This library provides:
//! - A position source with wake-lock and visibility handling
//! - A durable, timestamp-keyed track buffer
//! - Best-effort snapping through a map-matching service with a profile fallback ladder
//! - Loop-closure and claim eligibility evaluation
//! - A throttled live-position broadcaster
//! - A per-session controller that ties them together and talks to the storage service
//!
//! ## Features
//!
//! - **`http`** (default) - OSRM map matching and the REST storage client
//! - **`persistence`** - SQLite-backed track buffer store
//! - **`env-logger`** - let [`init_logging`] install `env_logger`
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use territory_tracker::{evaluate, EligibilityConfig, Fix, TrackingMode};
//! use chrono::{Duration, TimeZone, Utc};
//!
//! let start = Utc.with_ymd_and_hms(2024, 5, 1, 7, 0, 0).unwrap();
//! let track: Vec<Fix> = (0..3)
//!     .map(|i| Fix::new(51.5074 + i as f64 * 0.001, -0.1278, start + Duration::seconds(i * 10)))
//!     .collect();
//!
//! let snapshot = evaluate(&track, TrackingMode::WalkRun, &EligibilityConfig::default());
//! assert_eq!(snapshot.point_count, 3);
//! assert!(!snapshot.claimable);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{OptionExt, Result, TrackerError};

// Geographic utilities (distance, WKT)
pub mod geo_utils;

// Configuration
pub mod config;
pub use config::{BufferConfig, LiveConfig, SnapConfig, TrackerConfig};

// Continuous location sampling
pub mod position;
pub use position::{
    LocationProvider, NoWakeLock, PositionEvent, PositionSink, PositionSource, PositionStream,
    ProviderError, ProviderErrorCode, RawPosition, TrackingStatus, WakeLock, WatchId,
};

// Durable track buffer
pub mod track;
#[cfg(feature = "persistence")]
pub use track::SqliteStore;
pub use track::{FileStore, MemoryStore, TrackBuffer, TrackStore};

// Map-matching reconciliation
pub mod snap;
pub use snap::{
    profile_candidates, snap_window, DisabledMatcher, MapMatcher, SnapBatch, SnapReconciler,
};

// OSRM map-matching client
#[cfg(feature = "http")]
pub mod osrm;
#[cfg(feature = "http")]
pub use osrm::OsrmMatcher;

// Loop closure and claim rules
pub mod eligibility;
pub use eligibility::{evaluate, EligibilityConfig, EligibilitySnapshot};

// Live position broadcast
pub mod live;
pub use live::LiveBroadcaster;

// External collaborators (storage/claim, identity)
pub mod collaborator;
pub use collaborator::{
    ClaimRequest, ClaimResponse, IdentityProvider, LiveUpdate, NewSession, PointRecord,
    SessionSummary, TerritoryStore,
};

// REST storage/claim client
#[cfg(feature = "http")]
pub mod rest;
#[cfg(feature = "http")]
pub use rest::RestTerritoryStore;

// Local identity record
pub mod profile;
pub use profile::{LocalProfile, LocalProfileStore, PROFILE_STORAGE_KEY};

// Fire-and-forget remote calls
pub mod supervisor;
pub use supervisor::{TaskFailure, TaskKind, TaskSupervisor};

// Session lifecycle
pub mod session;
pub use session::{
    ClaimOutcome, Collaborators, SessionController, SessionHandle, SessionState, SessionView,
    StopReport,
};

/// Install a logger for hosts that don't bring their own.
///
/// The library only logs through the `log` facade.
#[cfg(feature = "env-logger")]
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}

#[cfg(not(feature = "env-logger"))]
pub fn init_logging() {
    // No-op: the host is expected to install a `log` implementation
}

// ============================================================================
// Core Types
// ============================================================================

/// A GPS coordinate with latitude and longitude.
///
/// # Example
/// ```
/// use territory_tracker::GpsPoint;
/// let point = GpsPoint::new(51.5074, -0.1278); // London
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GpsPoint {
    /// Create a new GPS point.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }
}

/// Movement mode of a session. Selects claim thresholds and snapping profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingMode {
    WalkRun,
    Cycle,
}

impl TrackingMode {
    /// Wire name used by the storage service.
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackingMode::WalkRun => "walk_run",
            TrackingMode::Cycle => "cycle",
        }
    }
}

impl std::fmt::Display for TrackingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One GPS sample.
///
/// The raw coordinate never changes once recorded. Snapping only fills in the
/// `snapped_*` fields. The timestamp is the sample's identity within a track.
///
/// Serialized field names match the buffer format written by earlier clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fix {
    pub lat: f64,
    pub lng: f64,
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    /// Speed in m/s, when the provider reports one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(default)]
    pub snapped: bool,
    #[serde(rename = "snappedLat", default, skip_serializing_if = "Option::is_none")]
    pub snapped_lat: Option<f64>,
    #[serde(rename = "snappedLng", default, skip_serializing_if = "Option::is_none")]
    pub snapped_lng: Option<f64>,
}

impl Fix {
    /// Create an unsnapped fix.
    pub fn new(lat: f64, lng: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            lat,
            lng,
            timestamp,
            accuracy: None,
            speed: None,
            snapped: false,
            snapped_lat: None,
            snapped_lng: None,
        }
    }

    /// The raw coordinate as reported by the provider.
    pub fn raw(&self) -> GpsPoint {
        GpsPoint::new(self.lat, self.lng)
    }

    /// The snapped coordinate, if one has been merged.
    pub fn snapped_point(&self) -> Option<GpsPoint> {
        match (self.snapped_lat, self.snapped_lng) {
            (Some(lat), Some(lng)) => Some(GpsPoint::new(lat, lng)),
            _ => None,
        }
    }

    /// Snapped coordinate when available, else raw.
    pub fn best_estimate(&self) -> GpsPoint {
        self.snapped_point().unwrap_or_else(|| self.raw())
    }

    /// Record a snapped coordinate. Raw fields are untouched.
    pub fn set_snapped(&mut self, point: GpsPoint) {
        self.snapped = true;
        self.snapped_lat = Some(point.latitude);
        self.snapped_lng = Some(point.longitude);
    }
}

/// Best-estimate coordinates of a track, in order.
pub fn best_estimate_track(fixes: &[Fix]) -> Vec<GpsPoint> {
    fixes.iter().map(Fix::best_estimate).collect()
}

/// The participant a session belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub display_name: String,
}

/// The city a session is played in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct City {
    pub id: String,
    pub name: String,
}

/// A tracking session record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub participant_id: String,
    pub city_id: String,
    pub mode: TrackingMode,
    pub live_mode: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Tests
// ============================================================================
