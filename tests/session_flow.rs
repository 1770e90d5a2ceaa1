//! End-to-end session tests against in-memory collaborators.
//!
//! Covers the full lifecycle: start, ingestion, snapping, live publishing,
//! pause/resume, restart recovery and the stop/claim/finalize sequence.

mod common;

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Notify;

use common::{square_loop, FakeTerritory, HarnessBuilder, ShiftMatcher};
use territory_tracker::{
    ClaimOutcome, FileStore, GpsPoint, LocalProfileStore, MemoryStore, ProviderError,
    ProviderErrorCode, SessionHandle, SessionState, SessionView, SnapBatch, TrackerError,
    TrackingMode,
};

async fn wait_for_points(handle: &SessionHandle, n: usize) -> SessionView {
    for _ in 0..10_000 {
        let view = handle.view().await.unwrap();
        if view.point_count == n {
            return view;
        }
        tokio::task::yield_now().await;
    }
    panic!("session never reached {} points", n);
}

// =============================================================================
// Claim flow
// =============================================================================

#[tokio::test]
async fn test_square_loop_is_claimed() {
    common::init_logging();
    let mut h = HarnessBuilder::new().build();
    let session = h.controller.start(TrackingMode::WalkRun, false).await.unwrap();
    assert_eq!(session.id, "session-1");

    let provider = h.provider.clone();
    let handle = SessionHandle::spawn(h.controller);
    provider.feed(&square_loop(60, 0.0));

    let view = wait_for_points(&handle, 60).await;
    assert_eq!(view.state, SessionState::Tracking);
    assert!(view.snapshot.claimable);
    assert_eq!(view.snapshot.elapsed_seconds, 708);
    // No map matching configured: the track stays raw and says so.
    let mut snap_error = view.snap_error;
    for _ in 0..10_000 {
        if snap_error.is_some() {
            break;
        }
        tokio::task::yield_now().await;
        snap_error = handle.view().await.unwrap().snap_error;
    }
    assert!(snap_error.unwrap().starts_with("Snap failed"));

    let report = handle.stop().await.unwrap();
    assert_eq!(
        report.outcome,
        ClaimOutcome::Claimed {
            message: "Territory claimed! Check the map for updates.".to_string()
        }
    );
    assert!(report.finalize_error.is_none());
    assert_eq!(provider.open_watches(), 0);

    let calls = h.territory.calls();
    assert_eq!(calls.claims.len(), 1);
    let claim = &calls.claims[0];
    assert_eq!(claim.session_id, "session-1");
    assert_eq!(claim.participant_id, "player-1");
    assert!(claim.polygon_wkt.starts_with("MULTIPOLYGON((("));

    let finalized = &calls.finalized[0];
    assert!(finalized.closed_loop);
    assert!(finalized.perimeter_m >= finalized.distance_m);
    assert!(finalized.perimeter_m > 900.0);
    assert_eq!(calls.points.len(), 60);
}

#[tokio::test]
async fn test_claim_message_from_service_is_shown() {
    let territory = FakeTerritory {
        claim_message: Some("You now own 4 blocks".to_string()),
        ..FakeTerritory::default()
    };
    let mut h = HarnessBuilder::new().territory(territory).build();
    h.controller.start(TrackingMode::WalkRun, false).await.unwrap();
    h.provider.feed(&square_loop(60, 0.0));
    h.controller.process_pending();

    let report = h.controller.stop().await;
    assert_eq!(report.outcome.message(), "You now own 4 blocks");
    assert_eq!(
        h.controller.view(Utc::now()).status_message.as_deref(),
        Some("You now own 4 blocks")
    );
}

#[tokio::test]
async fn test_rejected_claim_still_finalizes() {
    let territory = FakeTerritory {
        reject_claim: Some("Polygon overlaps protected area".to_string()),
        ..FakeTerritory::default()
    };
    let mut h = HarnessBuilder::new().territory(territory).build();
    h.controller.start(TrackingMode::WalkRun, true).await.unwrap();
    h.provider.feed(&square_loop(60, 0.0));
    assert_eq!(h.controller.process_pending(), 60);

    let report = h.controller.stop().await;
    assert_eq!(
        report.outcome,
        ClaimOutcome::Rejected {
            message: "Polygon overlaps protected area".to_string()
        }
    );
    assert_eq!(
        h.controller.view(Utc::now()).status_message.as_deref(),
        Some("Polygon overlaps protected area")
    );

    let calls = h.territory.calls();
    let order: Vec<_> = calls
        .log
        .iter()
        .copied()
        .filter(|c| *c != "publish_live")
        .collect();
    assert_eq!(
        order,
        vec![
            "create_session",
            "publish_offline",
            "claim_territory",
            "finalize_session"
        ]
    );
    assert!(!calls.finalized[0].closed_loop);
}

#[tokio::test]
async fn test_teardown_survives_every_failure() {
    let territory = FakeTerritory {
        reject_claim: Some("Invalid geometry".to_string()),
        fail_finalize: Some("connection reset".to_string()),
        fail_live: Some("permission denied for table live_players".to_string()),
        ..FakeTerritory::default()
    };
    let mut h = HarnessBuilder::new().territory(territory).build();
    h.controller.start(TrackingMode::WalkRun, true).await.unwrap();
    h.provider.feed(&square_loop(60, 0.0));
    h.controller.process_pending();

    let report = h.controller.stop().await;
    assert_eq!(report.outcome.message(), "Invalid geometry");
    assert_eq!(report.finalize_error.as_deref(), Some("connection reset"));
    assert_eq!(
        report.offline_error.as_deref(),
        Some("permission denied for table live_players")
    );
    assert_eq!(h.controller.state(), SessionState::Stopped);
    assert_eq!(h.territory.calls().finalized.len(), 1);
}

#[tokio::test]
async fn test_open_loop_is_not_submitted() {
    let mut h = HarnessBuilder::new().build();
    h.controller.start(TrackingMode::WalkRun, false).await.unwrap();
    h.provider.feed(&square_loop(60, 25.0));
    h.controller.process_pending();

    let report = h.controller.stop().await;
    assert!(!report.snapshot.close_enough);
    assert_eq!(report.outcome, ClaimOutcome::RequirementsUnmet);
    assert_eq!(
        report.outcome.message(),
        "Loop not closed or requirements unmet."
    );
    let calls = h.territory.calls();
    assert!(calls.claims.is_empty());
    assert_eq!(calls.finalized[0].perimeter_m, calls.finalized[0].distance_m);
}

#[tokio::test]
async fn test_stop_with_zero_points_via_handle() {
    let mut h = HarnessBuilder::new().build();
    h.controller.start(TrackingMode::Cycle, false).await.unwrap();
    let handle = SessionHandle::spawn(h.controller);

    let report = handle.stop().await.unwrap();
    assert_eq!(report.outcome, ClaimOutcome::RequirementsUnmet);
    assert_eq!(report.snapshot.point_count, 0);
    let calls = h.territory.calls();
    assert!(calls.claims.is_empty());
    assert_eq!(calls.finalized.len(), 1);
}

#[tokio::test]
async fn test_dropping_handle_stops_session() {
    let mut h = HarnessBuilder::new().build();
    h.controller.start(TrackingMode::WalkRun, false).await.unwrap();
    drop(SessionHandle::spawn(h.controller));

    for _ in 0..10_000 {
        if !h.territory.calls().finalized.is_empty() {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(h.territory.calls().finalized.len(), 1);
    assert_eq!(h.provider.open_watches(), 0);
}

// =============================================================================
// Start failures
// =============================================================================

#[tokio::test]
async fn test_missing_profile_blocks_start() {
    let profiles = LocalProfileStore::new(Arc::new(MemoryStore::new()));
    let mut h = HarnessBuilder::new().identity(Arc::new(profiles)).build();

    let err = h.controller.start(TrackingMode::WalkRun, false).await.unwrap_err();
    assert_eq!(err, TrackerError::MissingIdentity);
    assert_eq!(
        h.controller.view(Utc::now()).status_message.as_deref(),
        Some("Missing player profile. Please set a username.")
    );
    assert!(h.territory.calls().sessions.is_empty());
}

#[tokio::test]
async fn test_local_profile_identifies_participant() {
    let profiles = LocalProfileStore::new(Arc::new(MemoryStore::new()));
    let profile = profiles.load_or_create("Runner").unwrap();
    let mut h = HarnessBuilder::new().identity(Arc::new(profiles)).build();

    let session = h.controller.start(TrackingMode::WalkRun, false).await.unwrap();
    assert_eq!(session.participant_id, profile.id);
    assert_eq!(h.territory.calls().sessions[0].participant_id, profile.id);
}

#[tokio::test]
async fn test_policy_rejection_surfaces_message() {
    let territory = FakeTerritory {
        reject_session: Some("Start point outside city boundary".to_string()),
        ..FakeTerritory::default()
    };
    let mut h = HarnessBuilder::new().territory(territory).build();

    let err = h.controller.start(TrackingMode::WalkRun, false).await.unwrap_err();
    assert_eq!(err.message(), "Start point outside city boundary");
    assert_eq!(h.controller.state(), SessionState::Idle);
    assert_eq!(h.provider.open_watches(), 0);
}

#[tokio::test]
async fn test_provider_failure_is_reported_as_status() {
    let mut h = HarnessBuilder::new().build();
    h.provider.0.lock().unwrap().fail_with = Some(ProviderError::new(
        ProviderErrorCode::Unsupported,
        "Geolocation not supported.",
    ));

    h.controller.start(TrackingMode::WalkRun, false).await.unwrap();
    let view = h.controller.view(Utc::now());
    assert_eq!(view.state, SessionState::Tracking);
    assert_eq!(
        view.tracking.error.as_deref(),
        Some("Geolocation not supported.")
    );
}

// =============================================================================
// Snapping
// =============================================================================

#[tokio::test]
async fn test_snap_results_merge_and_reupsert() {
    let matcher = Arc::new(ShiftMatcher::new("foot", 3.0));
    let mut h = HarnessBuilder::new().matcher(matcher.clone()).build();
    h.controller.start(TrackingMode::WalkRun, false).await.unwrap();

    let positions = square_loop(60, 0.0);
    h.provider.feed(&positions[..5]);
    h.controller.process_pending();
    h.controller.wait_for_snaps().await;
    h.controller.wait_for_tasks().await;

    // walking fails, foot answers
    assert_eq!(*matcher.calls.lock().unwrap(), 2);
    for (fix, raw) in h.controller.track().fixes().iter().zip(&positions) {
        assert!(fix.snapped);
        assert_eq!(fix.raw(), GpsPoint::new(raw.latitude, raw.longitude));
        assert!(fix.snapped_lat.unwrap() > raw.latitude);
    }

    let view = h.controller.view(Utc::now());
    assert_eq!(view.snapped_points, 5);
    assert_eq!(view.unsnapped_points, 0);
    assert!(view.snap_error.is_none());

    let calls = h.territory.calls();
    assert_eq!(calls.batches.len(), 1);
    assert!(calls.batches[0].iter().all(|p| p.snapped.is_some()));
}

#[tokio::test]
async fn test_late_snap_results_are_discarded() {
    let gate = Arc::new(Notify::new());
    let matcher = Arc::new(ShiftMatcher::new("walking", 3.0).gated(gate.clone()));
    let mut h = HarnessBuilder::new().matcher(matcher).build();
    h.controller.start(TrackingMode::WalkRun, false).await.unwrap();

    h.provider.feed(&square_loop(60, 0.0)[..5]);
    h.controller.process_pending();
    tokio::task::yield_now().await;

    h.controller.stop().await;
    gate.notify_waiters();

    // A result delivered after stop is not merged either.
    let mut late: Vec<_> = h.controller.track().fixes().to_vec();
    for fix in &mut late {
        fix.set_snapped(GpsPoint::new(0.0, 0.0));
    }
    h.controller.apply_snap(SnapBatch {
        fixes: late,
        profile: Some("walking".to_string()),
        failures: Vec::new(),
    });

    assert!(h.controller.track().fixes().iter().all(|f| !f.snapped));
    assert!(h.territory.calls().batches.is_empty());
}

#[tokio::test]
async fn test_stalled_snap_does_not_hold_up_ingestion() {
    let gate = Arc::new(Notify::new());
    let matcher = Arc::new(ShiftMatcher::new("walking", 3.0).gated(gate.clone()));
    let mut h = HarnessBuilder::new().matcher(matcher.clone()).build();
    h.controller.start(TrackingMode::WalkRun, true).await.unwrap();
    let provider = h.provider.clone();
    let territory = h.territory.clone();
    let handle = SessionHandle::spawn(h.controller);

    let positions = square_loop(60, 0.0);
    provider.feed(&positions[..5]);
    wait_for_points(&handle, 5).await;
    // The first window is now waiting on the matcher.
    for _ in 0..10_000 {
        if *matcher.calls.lock().unwrap() > 0 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(*matcher.calls.lock().unwrap(), 1);

    provider.feed(&positions[5..8]);
    let view = wait_for_points(&handle, 8).await;
    assert_eq!(view.snapped_points, 0);
    for _ in 0..10_000 {
        if territory.calls().points.len() == 8 {
            break;
        }
        tokio::task::yield_now().await;
    }
    {
        let calls = territory.calls();
        assert_eq!(calls.points.len(), 8);
        assert!(!calls.live.is_empty());
        assert!(calls.live.iter().all(|u| u.is_live));
        assert!(calls.batches.is_empty());
    }

    let report = handle.stop().await.unwrap();
    assert_eq!(report.outcome, ClaimOutcome::RequirementsUnmet);
    assert_eq!(report.snapshot.point_count, 8);
    gate.notify_waiters();

    let calls = territory.calls();
    assert_eq!(calls.finalized.len(), 1);
    assert!(!calls.live.last().unwrap().is_live);
    assert!(calls.batches.is_empty());
}

// =============================================================================
// Live mode, pause and recovery
// =============================================================================

#[tokio::test]
async fn test_live_publish_is_throttled_and_goes_offline() {
    let mut h = HarnessBuilder::new().build();
    h.controller.start(TrackingMode::WalkRun, true).await.unwrap();
    h.provider.feed(&square_loop(60, 0.0)[..3]);
    h.controller.process_pending();
    h.controller.wait_for_tasks().await;

    {
        let calls = h.territory.calls();
        assert_eq!(calls.live.len(), 1);
        assert!(calls.live[0].is_live);
        assert_eq!(calls.live[0].trail.len(), 1);
        assert_eq!(calls.live[0].display_name, "Runner");
    }

    h.controller.stop().await;
    let calls = h.territory.calls();
    assert_eq!(calls.live.len(), 2);
    assert!(!calls.live[1].is_live);
    assert!(calls.live[1].point.is_none());
}

#[tokio::test]
async fn test_pause_and_resume_through_handle() {
    let mut h = HarnessBuilder::new().build();
    h.controller.start(TrackingMode::WalkRun, false).await.unwrap();
    let provider = h.provider.clone();
    let handle = SessionHandle::spawn(h.controller);

    let positions = square_loop(60, 0.0);
    provider.feed(&positions[..3]);
    wait_for_points(&handle, 3).await;

    handle.visibility_changed(true).unwrap();
    let view = handle.view().await.unwrap();
    assert_eq!(view.state, SessionState::Paused);
    assert!(view.tracking.paused);
    assert_eq!(provider.open_watches(), 0);

    handle.resume().unwrap();
    let view = handle.view().await.unwrap();
    assert_eq!(view.state, SessionState::Tracking);
    assert_eq!(provider.open_watches(), 1);

    provider.feed(&positions[3..6]);
    let view = wait_for_points(&handle, 6).await;
    assert_eq!(view.last_point_age_seconds.map(|age| age > 0), Some(true));

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_resume_after_restart_keeps_track() {
    let dir = tempfile::tempdir().unwrap();
    let positions = square_loop(60, 0.0);

    let session = {
        let store = Arc::new(FileStore::new(dir.path()).unwrap());
        let mut h = HarnessBuilder::new().buffer(store).build();
        h.controller.start(TrackingMode::WalkRun, false).await.unwrap();
        h.provider.feed(&positions[..10]);
        h.controller.process_pending();
        h.controller.persist_tick();
        h.controller.session().cloned().unwrap()
    };

    let store = Arc::new(FileStore::new(dir.path()).unwrap());
    let mut h = HarnessBuilder::new().buffer(store).build();
    h.controller.resume_session(session.clone()).unwrap();

    assert_eq!(h.controller.state(), SessionState::Tracking);
    assert_eq!(h.controller.track().len(), 10);
    assert_eq!(h.controller.snapshot().point_count, 10);
    assert!(h.territory.calls().sessions.is_empty());

    h.provider.feed(&positions[10..12]);
    h.controller.process_pending();
    assert_eq!(h.controller.track().len(), 12);
    h.controller.wait_for_tasks().await;
    assert!(h
        .territory
        .calls()
        .points
        .iter()
        .all(|p| p.session_id == session.id));

    let mut foreign = session.clone();
    foreign.participant_id = "player-2".to_string();
    let mut other = HarnessBuilder::new().build();
    assert!(matches!(
        other.controller.resume_session(foreign),
        Err(TrackerError::InvalidState { .. })
    ));
    assert_eq!(other.controller.state(), SessionState::Idle);
    assert_eq!(other.provider.open_watches(), 0);

    let mut ended = session;
    ended.ended_at = Some(Utc::now());
    assert!(matches!(
        other.controller.resume_session(ended),
        Err(TrackerError::InvalidState { .. })
    ));
}
