//! In-memory fakes of every collaborator a session talks to.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, TimeZone, Utc};
use futures::future::BoxFuture;
use tokio::sync::Notify;

use territory_tracker::geo_utils::offset_meters;
use territory_tracker::{
    City, ClaimRequest, ClaimResponse, Collaborators, DisabledMatcher, GpsPoint,
    IdentityProvider, LiveUpdate, LocationProvider, MapMatcher, MemoryStore, NewSession,
    NoWakeLock, Participant, PointRecord, PositionSink, ProviderError, RawPosition, Result,
    SessionController, SessionSummary, TerritoryStore, TrackStore, TrackerConfig, TrackerError,
    WatchId,
};

/// Opt-in log output: `RUST_LOG=debug cargo test -- --nocapture`.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 7, 0, 0).unwrap()
}

pub fn participant() -> Participant {
    Participant {
        id: "player-1".to_string(),
        display_name: "Runner".to_string(),
    }
}

pub fn city() -> City {
    City {
        id: "city-1".to_string(),
        name: "London".to_string(),
    }
}

/// `count` positions walking a 250 m square, 12 s apart. The last one stops
/// `gap_m` short of the start.
pub fn square_loop(count: usize, gap_m: f64) -> Vec<RawPosition> {
    let origin = GpsPoint::new(51.5074, -0.1278);
    let side = 250.0;
    let total = 4.0 * side - gap_m;
    (0..count)
        .map(|i| {
            let d = total * i as f64 / (count - 1) as f64;
            let (north, east) = if d <= side {
                (0.0, d)
            } else if d <= 2.0 * side {
                (d - side, side)
            } else if d <= 3.0 * side {
                (side, side - (d - 2.0 * side))
            } else {
                (side - (d - 3.0 * side), 0.0)
            };
            let p = offset_meters(&origin, north, east);
            RawPosition {
                latitude: p.latitude,
                longitude: p.longitude,
                timestamp: start_time() + Duration::seconds(12 * i as i64),
                accuracy: Some(5.0),
                speed: Some(1.4),
            }
        })
        .collect()
}

// =============================================================================
// Storage / claim service
// =============================================================================

#[derive(Debug, Default)]
pub struct Calls {
    /// Call names in order
    pub log: Vec<&'static str>,
    pub sessions: Vec<NewSession>,
    pub points: Vec<PointRecord>,
    pub batches: Vec<Vec<PointRecord>>,
    pub claims: Vec<ClaimRequest>,
    pub finalized: Vec<SessionSummary>,
    pub live: Vec<LiveUpdate>,
}

#[derive(Default)]
pub struct FakeTerritory {
    pub calls: Mutex<Calls>,
    pub reject_session: Option<String>,
    pub reject_claim: Option<String>,
    pub claim_message: Option<String>,
    pub fail_finalize: Option<String>,
    pub fail_live: Option<String>,
}

impl FakeTerritory {
    pub fn calls(&self) -> std::sync::MutexGuard<'_, Calls> {
        self.calls.lock().unwrap()
    }
}

fn answer<T: Send + 'static>(failure: Option<String>, ok: T) -> BoxFuture<'static, Result<T>> {
    Box::pin(async move {
        match failure {
            Some(message) => Err(TrackerError::Storage { message }),
            None => Ok(ok),
        }
    })
}

impl TerritoryStore for FakeTerritory {
    fn create_session<'a>(&'a self, request: &'a NewSession) -> BoxFuture<'a, Result<String>> {
        let mut calls = self.calls();
        calls.log.push("create_session");
        calls.sessions.push(request.clone());
        let id = format!("session-{}", calls.sessions.len());
        answer(self.reject_session.clone(), id)
    }

    fn upsert_point<'a>(&'a self, point: &'a PointRecord) -> BoxFuture<'a, Result<()>> {
        self.calls().points.push(point.clone());
        answer(None, ())
    }

    fn upsert_points<'a>(&'a self, points: &'a [PointRecord]) -> BoxFuture<'a, Result<()>> {
        self.calls().batches.push(points.to_vec());
        answer(None, ())
    }

    fn claim_territory<'a>(
        &'a self,
        claim: &'a ClaimRequest,
    ) -> BoxFuture<'a, Result<ClaimResponse>> {
        let mut calls = self.calls();
        calls.log.push("claim_territory");
        calls.claims.push(claim.clone());
        let response = ClaimResponse {
            message: self.claim_message.clone(),
            data: None,
        };
        answer(self.reject_claim.clone(), response)
    }

    fn finalize_session<'a>(&'a self, summary: &'a SessionSummary) -> BoxFuture<'a, Result<()>> {
        let mut calls = self.calls();
        calls.log.push("finalize_session");
        calls.finalized.push(summary.clone());
        answer(self.fail_finalize.clone(), ())
    }

    fn publish_live_position<'a>(&'a self, update: &'a LiveUpdate) -> BoxFuture<'a, Result<()>> {
        let mut calls = self.calls();
        calls.log.push(if update.is_live {
            "publish_live"
        } else {
            "publish_offline"
        });
        calls.live.push(update.clone());
        answer(self.fail_live.clone(), ())
    }
}

// =============================================================================
// Location provider
// =============================================================================

#[derive(Default)]
pub struct ProviderState {
    pub sinks: Vec<PositionSink>,
    pub open: Vec<WatchId>,
    pub fail_with: Option<ProviderError>,
}

/// Provider whose watches are driven by the test through their sinks.
#[derive(Clone, Default)]
pub struct FakeProvider(pub Arc<Mutex<ProviderState>>);

impl FakeProvider {
    /// Sink of the most recent watch.
    pub fn sink(&self) -> PositionSink {
        self.0
            .lock()
            .unwrap()
            .sinks
            .last()
            .cloned()
            .expect("no watch opened")
    }

    pub fn open_watches(&self) -> usize {
        self.0.lock().unwrap().open.len()
    }

    pub fn feed(&self, positions: &[RawPosition]) {
        let sink = self.sink();
        for p in positions {
            sink.position(p.clone());
        }
    }
}

impl LocationProvider for FakeProvider {
    fn watch_position(
        &mut self,
        sink: PositionSink,
    ) -> std::result::Result<WatchId, ProviderError> {
        let mut state = self.0.lock().unwrap();
        if let Some(err) = state.fail_with.clone() {
            return Err(err);
        }
        let id = WatchId(state.sinks.len() as u64 + 1);
        state.sinks.push(sink);
        state.open.push(id);
        Ok(id)
    }

    fn clear_watch(&mut self, id: WatchId) {
        self.0.lock().unwrap().open.retain(|w| *w != id);
    }
}

// =============================================================================
// Map matching
// =============================================================================

/// Matcher that places every point `north_m` meters north of where it was
/// recorded, answering only for `profile`. With a gate it waits to be
/// released first.
pub struct ShiftMatcher {
    pub profile: String,
    pub north_m: f64,
    pub gate: Option<Arc<Notify>>,
    pub calls: Mutex<usize>,
}

impl ShiftMatcher {
    pub fn new(profile: &str, north_m: f64) -> Self {
        Self {
            profile: profile.to_string(),
            north_m,
            gate: None,
            calls: Mutex::new(0),
        }
    }

    pub fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }
}

impl MapMatcher for ShiftMatcher {
    fn match_trace<'a>(
        &'a self,
        profile: &'a str,
        points: &'a [GpsPoint],
    ) -> BoxFuture<'a, Result<Vec<Option<GpsPoint>>>> {
        *self.calls.lock().unwrap() += 1;
        Box::pin(async move {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if profile != self.profile {
                return Err(TrackerError::Http {
                    message: format!("OSRM failed ({})", profile),
                    status_code: Some(500),
                });
            }
            Ok(points
                .iter()
                .map(|p| Some(offset_meters(p, self.north_m, 0.0)))
                .collect())
        })
    }
}

// =============================================================================
// Assembly
// =============================================================================

pub struct Harness {
    pub controller: SessionController,
    pub territory: Arc<FakeTerritory>,
    pub provider: FakeProvider,
    pub buffer: Arc<dyn TrackStore>,
}

pub struct HarnessBuilder {
    territory: FakeTerritory,
    matcher: Arc<dyn MapMatcher>,
    buffer: Arc<dyn TrackStore>,
    identity: Arc<dyn IdentityProvider>,
    config: TrackerConfig,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self {
            territory: FakeTerritory::default(),
            matcher: Arc::new(DisabledMatcher),
            buffer: Arc::new(MemoryStore::new()),
            identity: Arc::new(participant()),
            config: TrackerConfig::default(),
        }
    }

    pub fn territory(mut self, territory: FakeTerritory) -> Self {
        self.territory = territory;
        self
    }

    pub fn matcher(mut self, matcher: Arc<dyn MapMatcher>) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn buffer(mut self, buffer: Arc<dyn TrackStore>) -> Self {
        self.buffer = buffer;
        self
    }

    pub fn identity(mut self, identity: Arc<dyn IdentityProvider>) -> Self {
        self.identity = identity;
        self
    }

    pub fn config(mut self, config: TrackerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Harness {
        let territory = Arc::new(self.territory);
        let provider = FakeProvider::default();
        let mut controller = SessionController::new(
            self.config,
            Collaborators {
                territory: territory.clone(),
                identity: self.identity,
                matcher: self.matcher,
                buffer_store: self.buffer.clone(),
            },
            Box::new(provider.clone()),
            Box::new(NoWakeLock),
        );
        controller.select_city(city());
        Harness {
            controller,
            territory,
            provider,
            buffer: self.buffer,
        }
    }
}
