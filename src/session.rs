//! # Session Controller
//!
//! Owns everything a tracking session touches and runs its lifecycle:
//!
//! ```text
//! Idle --start--> Tracking <--pause/resume--> Paused
//!                    |                           |
//!                    +----------stop-------------+--> Stopped
//! ```
//!
//! The controller is single-writer. [`SessionHandle::spawn`] moves it into one
//! driver task that multiplexes host commands, provider events, snap
//! completions, background-call completions and the persistence timer. Hosts
//! that drive the loop themselves can call the controller methods directly.
//!
//! Only [`SessionController::start`] and [`SessionController::resume_session`]
//! return errors. Anything that goes wrong while tracking ends up in
//! [`SessionView`] or [`StopReport`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};

use crate::collaborator::{
    ClaimRequest, IdentityProvider, LiveUpdate, NewSession, PointRecord, SessionSummary,
    TerritoryStore,
};
use crate::config::TrackerConfig;
use crate::eligibility::{evaluate, rounded_seconds, EligibilitySnapshot};
use crate::error::{OptionExt, Result, TrackerError};
use crate::geo_utils::{closed_polygon, multipolygon_wkt};
use crate::live::LiveBroadcaster;
use crate::position::{LocationProvider, PositionSource, PositionStream, TrackingStatus, WakeLock};
use crate::snap::{MapMatcher, SnapBatch, SnapReconciler};
use crate::supervisor::{TaskFailure, TaskKind, TaskSupervisor};
use crate::track::{TrackBuffer, TrackStore};
use crate::{City, Fix, GpsPoint, Participant, Session, TrackingMode};

/// How long background calls may keep running once a session has stopped.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Trailing points kept in the view for display.
const DISPLAY_TRAIL_LEN: usize = 500;

const MISSING_PROFILE_MESSAGE: &str = "Missing player profile. Please set a username.";
const CLAIMED_MESSAGE: &str = "Territory claimed! Check the map for updates.";
const REQUIREMENTS_UNMET_MESSAGE: &str = "Loop not closed or requirements unmet.";
const NOT_ENOUGH_POINTS_MESSAGE: &str = "Need at least 3 points to claim.";
const BOUNDARY_MARKER: &str = "Point outside city boundary";

/// Lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Tracking,
    Paused,
    Stopped,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Tracking => "tracking",
            SessionState::Paused => "paused",
            SessionState::Stopped => "stopped",
        }
    }

    /// Tracking or paused.
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Tracking | SessionState::Paused)
    }
}

/// What happened to the claim when the session stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClaimOutcome {
    /// The service accepted the polygon
    Claimed { message: String },
    /// The service refused the polygon; its message is kept verbatim
    Rejected { message: String },
    /// Claimable by the rules, but no ring could be formed
    NotEnoughPoints,
    /// The loop did not meet the claim rules; nothing was submitted
    RequirementsUnmet,
    /// `stop` was called without an active session
    NoActiveSession,
}

impl ClaimOutcome {
    /// Text shown to the participant.
    pub fn message(&self) -> &str {
        match self {
            ClaimOutcome::Claimed { message } | ClaimOutcome::Rejected { message } => message,
            ClaimOutcome::NotEnoughPoints => NOT_ENOUGH_POINTS_MESSAGE,
            ClaimOutcome::RequirementsUnmet => REQUIREMENTS_UNMET_MESSAGE,
            ClaimOutcome::NoActiveSession => "No active session.",
        }
    }

    pub fn is_claimed(&self) -> bool {
        matches!(self, ClaimOutcome::Claimed { .. })
    }
}

/// Result of stopping a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopReport {
    /// The finished session, with `ended_at` set
    pub session: Option<Session>,
    pub outcome: ClaimOutcome,
    /// Eligibility at the moment of stopping
    pub snapshot: EligibilitySnapshot,
    pub finalize_error: Option<String>,
    pub offline_error: Option<String>,
    /// Background-call failures observed while shutting down
    pub late_failures: Vec<String>,
}

/// Everything a host shows while a session runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionView {
    pub state: SessionState,
    pub session_id: Option<String>,
    pub mode: TrackingMode,
    pub live_mode: bool,
    pub tracking: TrackingStatus,
    pub snapshot: EligibilitySnapshot,
    pub point_count: usize,
    pub status_message: Option<String>,
    pub snap_error: Option<String>,
    pub point_save_error: Option<String>,
    pub snapped_points: usize,
    pub unsnapped_points: usize,
    pub last_point_age_seconds: Option<i64>,
    /// Recent best-estimate trail, oldest first
    pub trail: Vec<GpsPoint>,
}

/// The services a controller talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub territory: Arc<dyn TerritoryStore>,
    pub identity: Arc<dyn IdentityProvider>,
    pub matcher: Arc<dyn MapMatcher>,
    /// Local key-value store for the track buffer
    pub buffer_store: Arc<dyn TrackStore>,
}

pub struct SessionController {
    config: TrackerConfig,
    territory: Arc<dyn TerritoryStore>,
    identity: Arc<dyn IdentityProvider>,
    matcher: Arc<dyn MapMatcher>,

    source: PositionSource,
    stream: PositionStream,
    track: TrackBuffer,
    snapper: SnapReconciler,
    live: LiveBroadcaster,
    supervisor: TaskSupervisor,
    snaps: JoinSet<SnapBatch>,

    state: SessionState,
    mode: TrackingMode,
    city: Option<City>,
    participant: Option<Participant>,
    session: Option<Session>,
    snapshot: EligibilitySnapshot,
    status_message: Option<String>,
    point_save_error: Option<String>,
}

impl SessionController {
    pub fn new(
        config: TrackerConfig,
        collaborators: Collaborators,
        provider: Box<dyn LocationProvider>,
        wake_lock: Box<dyn WakeLock>,
    ) -> Self {
        let (source, stream) = PositionSource::new(provider, wake_lock);
        let track = TrackBuffer::new(collaborators.buffer_store, config.buffer.storage_key.clone());
        let mode = TrackingMode::WalkRun;
        Self {
            snapper: SnapReconciler::new(mode, &config.snap),
            live: LiveBroadcaster::new(false, &config.live),
            territory: collaborators.territory,
            identity: collaborators.identity,
            matcher: collaborators.matcher,
            source,
            stream,
            track,
            supervisor: TaskSupervisor::new(),
            snaps: JoinSet::new(),
            state: SessionState::Idle,
            mode,
            city: None,
            participant: None,
            session: None,
            snapshot: EligibilitySnapshot::default(),
            status_message: None,
            point_save_error: None,
            config,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn track(&self) -> &TrackBuffer {
        &self.track
    }

    pub fn snapshot(&self) -> &EligibilitySnapshot {
        &self.snapshot
    }

    /// Background-call failures, oldest first.
    pub fn task_failures(&self) -> impl Iterator<Item = &TaskFailure> {
        self.supervisor.failures()
    }

    /// Choose the city the next session is played in.
    pub fn select_city(&mut self, city: City) {
        self.city = Some(city);
    }

    /// Open a session record and begin tracking.
    ///
    /// Nothing starts unless identity and city resolve and the storage
    /// service accepts the session. A stale local track is cleared only
    /// after that.
    pub async fn start(&mut self, mode: TrackingMode, live_mode: bool) -> Result<Session> {
        self.ensure_startable()?;
        self.status_message = None;

        let (participant, city) = self.resolve_participant_and_city()?;
        let request = NewSession {
            participant_id: participant.id.clone(),
            city_id: city.id.clone(),
            mode,
            live_mode,
            started_at: Utc::now(),
        };

        let session_id = match self.territory.create_session(&request).await {
            Ok(id) => id,
            Err(e) => {
                let message = e.message();
                warn!("[SessionController] Session start failed: {}", message);
                self.status_message = Some(message.clone());
                return Err(TrackerError::SessionStart { message });
            }
        };

        if let Err(e) = self.track.clear() {
            warn!("[SessionController] Could not clear stored track: {}", e);
        }

        let session = Session {
            id: session_id,
            participant_id: participant.id.clone(),
            city_id: city.id.clone(),
            mode,
            live_mode,
            started_at: request.started_at,
            ended_at: None,
        };
        self.begin(session.clone(), participant);
        info!(
            "[SessionController] Started session {} ({}, live={})",
            session.id, mode, live_mode
        );
        Ok(session)
    }

    /// Pick up a session that was already created, e.g. after a restart.
    ///
    /// The stored track is rehydrated rather than cleared and no new session
    /// record is created.
    pub fn resume_session(&mut self, session: Session) -> Result<()> {
        self.ensure_startable()?;
        if session.ended_at.is_some() {
            return Err(TrackerError::InvalidState {
                expected: "open session",
                actual: "ended session",
            });
        }
        let participant = self.identity.current_participant().ok_or_missing_identity()?;
        if participant.id != session.participant_id {
            warn!(
                "[SessionController] Session {} belongs to another participant",
                session.id
            );
            return Err(TrackerError::InvalidState {
                expected: "session of the current participant",
                actual: "session of another participant",
            });
        }
        if self.city.as_ref().map(|c| c.id.as_str()) != Some(session.city_id.as_str()) {
            self.city = Some(City {
                id: session.city_id.clone(),
                name: String::new(),
            });
        }

        let restored = self.track.rehydrate()?;
        info!(
            "[SessionController] Resuming session {} with {} fixes",
            session.id, restored
        );
        self.begin(session, participant);
        // Old windows are not re-requested.
        self.snapper.mark_submitted(restored);
        Ok(())
    }

    fn ensure_startable(&self) -> Result<()> {
        if self.state.is_active() {
            return Err(TrackerError::InvalidState {
                expected: "idle or stopped",
                actual: self.state.as_str(),
            });
        }
        Ok(())
    }

    fn resolve_participant_and_city(&mut self) -> Result<(Participant, City)> {
        let participant = match self.identity.current_participant() {
            Some(p) => p,
            None => {
                self.status_message = Some(MISSING_PROFILE_MESSAGE.to_string());
                return Err(TrackerError::MissingIdentity);
            }
        };
        let city = match &self.city {
            Some(c) => c.clone(),
            None => {
                self.status_message = Some(MISSING_PROFILE_MESSAGE.to_string());
                return Err(TrackerError::MissingCity);
            }
        };
        Ok((participant, city))
    }

    fn begin(&mut self, session: Session, participant: Participant) {
        self.mode = session.mode;
        self.snapper = SnapReconciler::new(session.mode, &self.config.snap);
        self.live = LiveBroadcaster::new(session.live_mode, &self.config.live);
        self.snapshot = evaluate(self.track.fixes(), self.mode, &self.config.eligibility);
        self.point_save_error = None;
        self.participant = Some(participant);
        self.session = Some(session);
        self.state = SessionState::Tracking;
        self.source.start();
    }

    /// Take a fix from the position source.
    ///
    /// Appends it, recomputes eligibility, and fires off the per-point upsert,
    /// a live publish when due, and a snap request when the track has grown by
    /// a full batch.
    pub fn handle_fix(&mut self, fix: Fix, now: Instant) {
        if self.state != SessionState::Tracking {
            debug!("[SessionController] Ignoring fix while {}", self.state.as_str());
            return;
        }
        let Some(session_id) = self.session.as_ref().map(|s| s.id.clone()) else {
            return;
        };
        if !self.track.append(fix.clone()) {
            return;
        }
        self.snapshot = evaluate(self.track.fixes(), self.mode, &self.config.eligibility);

        let record = PointRecord::from_fix(&session_id, &fix);
        let territory = Arc::clone(&self.territory);
        self.supervisor.spawn(TaskKind::PointUpsert, async move {
            territory.upsert_point(&record).await
        });

        if let (Some(participant), Some(city)) = (&self.participant, &self.city) {
            if let Some(update) = self.live.prepare(now, participant, &city.id, &self.track) {
                let territory = Arc::clone(&self.territory);
                self.supervisor.spawn(TaskKind::LivePublish, async move {
                    territory.publish_live_position(&update).await
                });
            }
        }

        if let Some(window) = self.snapper.next_window(&self.track) {
            debug!("[SessionController] Submitting snap window of {}", window.len());
            self.snaps
                .spawn(self.snapper.request(Arc::clone(&self.matcher), window));
        }
    }

    /// Drain every position event already queued. Returns the number of fixes
    /// accepted.
    pub fn process_pending(&mut self) -> usize {
        let mut accepted = 0;
        while let Some((generation, event)) = self.stream.try_recv() {
            if let Some(fix) = self.source.accept(generation, event) {
                self.handle_fix(fix, Instant::now());
                accepted += 1;
            }
        }
        accepted
    }

    /// Merge a finished snap batch. Results arriving after stop are dropped.
    pub fn apply_snap(&mut self, batch: SnapBatch) {
        if !self.state.is_active() {
            debug!("[SessionController] Discarding late snap result");
            return;
        }
        let Some(session_id) = self.session.as_ref().map(|s| s.id.clone()) else {
            return;
        };
        self.snapper.record(&batch);
        let changed = self.track.merge_snapped(&batch.fixes);
        if changed.is_empty() {
            return;
        }
        self.snapshot = evaluate(self.track.fixes(), self.mode, &self.config.eligibility);

        let records: Vec<PointRecord> = changed
            .iter()
            .map(|fix| PointRecord::from_fix(&session_id, fix))
            .collect();
        let territory = Arc::clone(&self.territory);
        self.supervisor.spawn(TaskKind::SnappedPointUpsert, async move {
            territory.upsert_points(&records).await
        });
    }

    /// Wait for every in-flight snap request and merge the results.
    pub async fn wait_for_snaps(&mut self) {
        while let Some(joined) = self.snaps.join_next().await {
            self.on_snap_joined(joined);
        }
    }

    /// Wait for every in-flight background call and record its outcome.
    pub async fn wait_for_tasks(&mut self) {
        while let Some(outcome) = self.supervisor.next_completion().await {
            if let Err(failure) = outcome {
                self.on_task_failure(&failure);
            }
        }
    }

    fn on_snap_joined(&mut self, joined: std::result::Result<SnapBatch, tokio::task::JoinError>) {
        match joined {
            Ok(batch) => self.apply_snap(batch),
            Err(e) if e.is_cancelled() => {}
            Err(e) => warn!("[SessionController] Snap task failed: {}", e),
        }
    }

    fn on_task_failure(&mut self, failure: &TaskFailure) {
        match failure.kind {
            TaskKind::PointUpsert => {
                self.point_save_error = Some(failure.message.clone());
                self.status_message = Some(if failure.message.contains(BOUNDARY_MARKER) {
                    format!("{}. Ignored.", BOUNDARY_MARKER)
                } else {
                    format!("Point save failed: {}", failure.message)
                });
            }
            TaskKind::SnappedPointUpsert => {
                self.point_save_error = Some(failure.message.clone());
            }
            TaskKind::LivePublish => {}
        }
    }

    /// Write the track to local storage if it changed.
    pub fn persist_tick(&mut self) {
        if !self.track.is_dirty() {
            return;
        }
        if let Err(e) = self.track.persist() {
            warn!("[SessionController] Persist failed: {}", e);
        }
    }

    pub fn pause(&mut self) {
        if self.state != SessionState::Tracking {
            return;
        }
        self.source.pause();
        self.sync_state();
    }

    pub fn resume(&mut self) {
        if self.state != SessionState::Paused {
            return;
        }
        self.source.resume();
        self.sync_state();
    }

    /// The host view was hidden (`true`) or shown again.
    pub fn visibility_changed(&mut self, hidden: bool) {
        if !self.state.is_active() {
            return;
        }
        self.source.visibility_changed(hidden);
        self.sync_state();
    }

    fn sync_state(&mut self) {
        self.state = if self.source.status().paused {
            SessionState::Paused
        } else {
            SessionState::Tracking
        };
        if self.state == SessionState::Paused {
            // Keep what was recorded so far.
            self.persist_tick();
        }
    }

    pub fn view(&self, now: DateTime<Utc>) -> SessionView {
        let last_point_age_seconds = self
            .track
            .last()
            .map(|fix| rounded_seconds(now - fix.timestamp));
        SessionView {
            state: self.state,
            session_id: self.session.as_ref().map(|s| s.id.clone()),
            mode: self.mode,
            live_mode: self.live.is_enabled(),
            tracking: self.source.status().clone(),
            snapshot: self.snapshot.clone(),
            point_count: self.track.len(),
            status_message: self.status_message.clone(),
            snap_error: self.snapper.last_error().map(str::to_string),
            point_save_error: self.point_save_error.clone(),
            snapped_points: self.snapper.snapped_total(),
            unsnapped_points: self.snapper.unsnapped_total(),
            last_point_age_seconds,
            trail: self.track.best_estimate_tail(DISPLAY_TRAIL_LEN),
        }
    }

    /// End the session.
    ///
    /// Sampling stops first and in-flight snaps are abandoned. Then the
    /// offline signal, the claim (only when the loop qualifies) and the
    /// session finalize run in that order. A failure in any of them does not
    /// skip the ones after it.
    pub async fn stop(&mut self) -> StopReport {
        self.source.stop();
        if !self.state.is_active() || self.session.is_none() {
            return StopReport {
                session: self.session.clone(),
                outcome: ClaimOutcome::NoActiveSession,
                snapshot: self.snapshot.clone(),
                finalize_error: None,
                offline_error: None,
                late_failures: Vec::new(),
            };
        }

        self.state = SessionState::Stopped;
        self.snaps.shutdown().await;

        let snapshot = evaluate(self.track.fixes(), self.mode, &self.config.eligibility);
        self.snapshot = snapshot.clone();
        self.persist_tick();

        // Only the store handle and owned requests are held across the awaits
        // below; the controller itself is not Sync.
        let territory = Arc::clone(&self.territory);

        let offline = self.offline_update();
        let offline_error = match offline {
            Some(update) => {
                report("Offline signal", territory.publish_live_position(&update).await)
            }
            None => None,
        };

        let claim = self.claim_request(&snapshot);
        let outcome = match claim {
            Ok(request) => match territory.claim_territory(&request).await {
                Ok(response) => ClaimOutcome::Claimed {
                    message: response
                        .message
                        .unwrap_or_else(|| CLAIMED_MESSAGE.to_string()),
                },
                Err(e) => {
                    let message = e.message();
                    warn!("[SessionController] Claim rejected: {}", message);
                    ClaimOutcome::Rejected { message }
                }
            },
            Err(outcome) => outcome,
        };
        self.status_message = Some(outcome.message().to_string());

        let ended_at = Utc::now();
        let summary = self.summary(&snapshot, &outcome, ended_at);
        let finalize_error = match summary {
            Some(summary) => report("Finalize", territory.finalize_session(&summary).await),
            None => None,
        };
        if let Some(session) = self.session.as_mut() {
            session.ended_at = Some(ended_at);
        }

        let mut late_failures = Vec::new();
        for failure in self.supervisor.drain(SHUTDOWN_GRACE).await {
            self.on_task_failure(&failure);
            late_failures.push(failure.message);
        }

        info!(
            "[SessionController] Stopped with {} fixes: {}",
            self.track.len(),
            outcome.message()
        );
        StopReport {
            session: self.session.clone(),
            outcome,
            snapshot,
            finalize_error,
            offline_error,
            late_failures,
        }
    }

    fn offline_update(&self) -> Option<LiveUpdate> {
        let (participant, city) = (self.participant.as_ref()?, self.city.as_ref()?);
        self.live.offline(participant, &city.id)
    }

    /// The claim to submit, or the outcome when there is nothing to submit.
    fn claim_request(
        &self,
        snapshot: &EligibilitySnapshot,
    ) -> std::result::Result<ClaimRequest, ClaimOutcome> {
        if !snapshot.claimable {
            return Err(ClaimOutcome::RequirementsUnmet);
        }
        let Some(polygon) = closed_polygon(&self.track.best_estimate()) else {
            warn!("[SessionController] Claimable track has fewer than 3 distinct points");
            return Err(ClaimOutcome::NotEnoughPoints);
        };
        let Some(session) = self.session.as_ref() else {
            return Err(ClaimOutcome::Rejected {
                message: "No active session.".to_string(),
            });
        };
        let Some(participant) = self.participant.as_ref() else {
            return Err(ClaimOutcome::Rejected {
                message: MISSING_PROFILE_MESSAGE.to_string(),
            });
        };
        Ok(ClaimRequest {
            participant_id: participant.id.clone(),
            city_id: session.city_id.clone(),
            session_id: session.id.clone(),
            polygon_wkt: multipolygon_wkt(&polygon),
        })
    }

    fn summary(
        &self,
        snapshot: &EligibilitySnapshot,
        outcome: &ClaimOutcome,
        ended_at: DateTime<Utc>,
    ) -> Option<SessionSummary> {
        let session = self.session.as_ref()?;
        Some(SessionSummary {
            session_id: session.id.clone(),
            ended_at,
            closed_loop: outcome.is_claimed(),
            distance_m: snapshot.path_length_m,
            perimeter_m: snapshot.perimeter_estimate_m,
        })
    }

    /// Driver loop; runs until a stop command arrives or every handle is gone.
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        // interval() panics on a zero period.
        let period = self.config.buffer.persist_interval.max(Duration::from_millis(1));
        let mut persist = tokio::time::interval(period);
        persist.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Pause) => self.pause(),
                    Some(Command::Resume) => self.resume(),
                    Some(Command::Visibility { hidden }) => self.visibility_changed(hidden),
                    Some(Command::View(reply)) => {
                        let _ = reply.send(self.view(Utc::now()));
                    }
                    Some(Command::Stop(reply)) => {
                        let report = self.stop().await;
                        let _ = reply.send(report);
                        return;
                    }
                    None => {
                        debug!("[SessionController] All handles dropped, stopping");
                        self.stop().await;
                        return;
                    }
                },
                Some((generation, event)) = self.stream.recv() => {
                    if let Some(fix) = self.source.accept(generation, event) {
                        self.handle_fix(fix, Instant::now());
                    }
                }
                Some(joined) = self.snaps.join_next(), if !self.snaps.is_empty() => {
                    self.on_snap_joined(joined);
                }
                Some(outcome) = self.supervisor.next_completion(),
                    if !self.supervisor.is_idle() =>
                {
                    if let Err(failure) = outcome {
                        self.on_task_failure(&failure);
                    }
                }
                _ = persist.tick() => self.persist_tick(),
            }
        }
    }
}

enum Command {
    Pause,
    Resume,
    Visibility { hidden: bool },
    View(oneshot::Sender<SessionView>),
    Stop(oneshot::Sender<StopReport>),
}

/// Handle to a session running in its own task.
///
/// Dropping the handle stops the session.
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// Move a started (or resumed) controller into a driver task.
    pub fn spawn(controller: SessionController) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(controller.run(rx));
        Self { commands, task }
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| driver_gone())
    }

    pub fn pause(&self) -> Result<()> {
        self.send(Command::Pause)
    }

    pub fn resume(&self) -> Result<()> {
        self.send(Command::Resume)
    }

    pub fn visibility_changed(&self, hidden: bool) -> Result<()> {
        self.send(Command::Visibility { hidden })
    }

    pub async fn view(&self) -> Result<SessionView> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::View(tx))?;
        rx.await.map_err(|_| driver_gone())
    }

    /// Stop the session and wait for teardown to finish.
    pub async fn stop(self) -> Result<StopReport> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Stop(tx))?;
        let report = rx.await.map_err(|_| driver_gone())?;
        if let Err(e) = self.task.await {
            warn!("[SessionHandle] Driver task ended abnormally: {}", e);
        }
        Ok(report)
    }
}

/// Log a failed teardown call and keep its message.
fn report(what: &str, result: Result<()>) -> Option<String> {
    match result {
        Ok(()) => None,
        Err(e) => {
            warn!("[SessionController] {} failed: {}", what, e);
            Some(e.message())
        }
    }
}

fn driver_gone() -> TrackerError {
    TrackerError::Internal {
        message: "session driver has stopped".to_string(),
    }
}
