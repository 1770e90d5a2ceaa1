//! Contracts with the services a session depends on.
//!
//! The storage/claim service is authoritative for session records, stored
//! points, live positions and territory ownership. Polygon validation and
//! overlap resolution happen there; the tracker only submits.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::geo_utils::{ewkt, linestring_wkt, point_wkt};
use crate::{Fix, GpsPoint, Participant, TrackingMode};

/// Resolves who is playing.
pub trait IdentityProvider: Send + Sync {
    fn current_participant(&self) -> Option<Participant>;
}

/// Fixed identity, for hosts that resolve the participant themselves.
impl IdentityProvider for Participant {
    fn current_participant(&self) -> Option<Participant> {
        Some(self.clone())
    }
}

/// Request to open a session record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSession {
    pub participant_id: String,
    pub city_id: String,
    pub mode: TrackingMode,
    pub live_mode: bool,
    pub started_at: DateTime<Utc>,
}

/// One stored point, keyed by `(session_id, timestamp)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointRecord {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub raw: GpsPoint,
    pub snapped: Option<GpsPoint>,
    pub accuracy: Option<f64>,
    pub speed: Option<f64>,
}

impl PointRecord {
    pub fn from_fix(session_id: &str, fix: &Fix) -> Self {
        Self {
            session_id: session_id.to_string(),
            timestamp: fix.timestamp,
            raw: fix.raw(),
            snapped: fix.snapped_point(),
            accuracy: fix.accuracy,
            speed: fix.speed,
        }
    }
}

/// Territory claim submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimRequest {
    pub participant_id: String,
    pub city_id: String,
    pub session_id: String,
    /// Closed `MULTIPOLYGON` in WKT, lng/lat order
    pub polygon_wkt: String,
}

/// The service's answer to an accepted claim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClaimResponse {
    pub message: Option<String>,
    pub data: Option<serde_json::Value>,
}

/// Final numbers for a session record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub ended_at: DateTime<Utc>,
    pub closed_loop: bool,
    pub distance_m: f64,
    pub perimeter_m: f64,
}

/// A live-position publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveUpdate {
    pub participant_id: String,
    pub city_id: String,
    pub display_name: String,
    /// Latest position; absent on the offline signal
    pub point: Option<GpsPoint>,
    /// Recent best-estimate trail, oldest first
    pub trail: Vec<GpsPoint>,
    pub is_live: bool,
    pub timestamp: DateTime<Utc>,
}

impl LiveUpdate {
    /// `SRID=4326;POINT(...)` for the latest position.
    pub fn point_ewkt(&self) -> Option<String> {
        self.point.as_ref().map(|p| ewkt(&point_wkt(p)))
    }

    /// `SRID=4326;LINESTRING(...)` for the trail, if there is one.
    pub fn trail_ewkt(&self) -> Option<String> {
        linestring_wkt(&self.trail).map(|wkt| ewkt(&wkt))
    }
}

/// The storage/claim service.
///
/// Calls are asynchronous and may fail; the session treats every failure
/// outside `create_session` as non-fatal.
pub trait TerritoryStore: Send + Sync {
    /// Open a session record. Fails when policy forbids the session.
    fn create_session<'a>(&'a self, request: &'a NewSession) -> BoxFuture<'a, Result<String>>;

    /// Insert or replace one point. Idempotent by `(session_id, timestamp)`.
    fn upsert_point<'a>(&'a self, point: &'a PointRecord) -> BoxFuture<'a, Result<()>>;

    /// Insert or replace several points at once.
    fn upsert_points<'a>(&'a self, points: &'a [PointRecord]) -> BoxFuture<'a, Result<()>>;

    /// Submit a closed polygon. Rejections carry the service's message.
    fn claim_territory<'a>(&'a self, claim: &'a ClaimRequest)
        -> BoxFuture<'a, Result<ClaimResponse>>;

    fn finalize_session<'a>(&'a self, summary: &'a SessionSummary) -> BoxFuture<'a, Result<()>>;

    fn publish_live_position<'a>(&'a self, update: &'a LiveUpdate) -> BoxFuture<'a, Result<()>>;
}
