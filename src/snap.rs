//! # Snap Reconciler
//!
//! Best-effort alignment of raw fixes onto the path network.
//!
//! ## Profile ladder
//!
//! Each window is offered to the map-matching service once per movement
//! profile, in order, until one returns a usable alignment:
//!
//! - cycling: configured profile, `cycling`, `bike`, `driving`
//! - walk/run: configured profile, `walking`, `foot`, `driving`
//!
//! Semantic profiles come first; `driving` is last because nearly every
//! backend serves it. Duplicates are removed keeping the first occurrence.
//!
//! ## Merge
//!
//! The service answers with one entry per request coordinate, possibly null.
//! Entries are matched back to fixes by position in the request window. A
//! failed attempt contributes nothing to the result.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use log::{debug, info, warn};

use crate::config::SnapConfig;
use crate::error::{Result, TrackerError};
use crate::track::TrackBuffer;
use crate::{Fix, GpsPoint, TrackingMode};

/// A map-matching backend.
pub trait MapMatcher: Send + Sync {
    /// Align `points` using `profile`.
    ///
    /// The returned list is index-aligned with `points`; `None` marks a point
    /// the service could not place.
    fn match_trace<'a>(
        &'a self,
        profile: &'a str,
        points: &'a [GpsPoint],
    ) -> BoxFuture<'a, Result<Vec<Option<GpsPoint>>>>;
}

/// Ordered, de-duplicated profile candidates for a mode.
pub fn profile_candidates(mode: TrackingMode, config: &SnapConfig) -> Vec<String> {
    let (preferred, generic): (&Option<String>, [&str; 3]) = match mode {
        TrackingMode::Cycle => (&config.cycling_profile, ["cycling", "bike", "driving"]),
        TrackingMode::WalkRun => (&config.walking_profile, ["walking", "foot", "driving"]),
    };

    let mut profiles: Vec<String> = Vec::with_capacity(4);
    let candidates = preferred
        .iter()
        .map(|p| p.trim())
        .chain(generic.iter().copied());
    for candidate in candidates {
        if !candidate.is_empty() && !profiles.iter().any(|p| p == candidate) {
            profiles.push(candidate.to_string());
        }
    }
    profiles
}

/// Outcome of snapping one window.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapBatch {
    /// The window, with snapped fields set where the service placed a point
    pub fixes: Vec<Fix>,
    /// Profile that produced the alignment; `None` when every profile failed
    pub profile: Option<String>,
    /// One entry per failed profile attempt
    pub failures: Vec<String>,
}

impl SnapBatch {
    /// Whether any profile produced an alignment.
    pub fn is_snapped(&self) -> bool {
        self.profile.is_some()
    }

    pub fn snapped_count(&self) -> usize {
        self.fixes.iter().filter(|f| f.snapped).count()
    }

    pub fn unsnapped_count(&self) -> usize {
        self.fixes.len() - self.snapped_count()
    }

    /// Summary of why the batch could not be snapped.
    pub fn error(&self) -> Option<String> {
        if self.is_snapped() {
            None
        } else {
            Some(format!("Snap failed: {}", self.failures.join("; ")))
        }
    }
}

/// Apply an index-aligned alignment to a copy of the window.
fn apply_alignment(window: &[Fix], alignment: &[Option<GpsPoint>]) -> Vec<Fix> {
    window
        .iter()
        .enumerate()
        .map(|(i, fix)| {
            let mut out = fix.clone();
            if let Some(Some(point)) = alignment.get(i) {
                if point.is_valid() {
                    out.set_snapped(*point);
                }
            }
            out
        })
        .collect()
}

/// Walk the profile ladder for one window.
///
/// Every profile is tried at most once, each attempt bounded by `timeout`.
/// If all fail the window comes back unchanged.
pub async fn snap_window(
    matcher: &dyn MapMatcher,
    profiles: &[String],
    window: Vec<Fix>,
    timeout: Duration,
) -> SnapBatch {
    let window: Vec<Fix> = window.into_iter().map(unsnapped).collect();
    let coords: Vec<GpsPoint> = window.iter().map(Fix::raw).collect();
    let mut failures = Vec::new();

    for profile in profiles {
        let attempt = tokio::time::timeout(timeout, matcher.match_trace(profile, &coords)).await;
        let alignment = match attempt {
            Ok(Ok(alignment)) => alignment,
            Ok(Err(e)) => {
                warn!("[SnapReconciler] Profile '{}' failed: {}", profile, e);
                failures.push(format!("{}: {}", profile, e));
                continue;
            }
            Err(_) => {
                warn!("[SnapReconciler] Profile '{}' timed out after {:?}", profile, timeout);
                failures.push(format!("{}: timed out", profile));
                continue;
            }
        };

        if alignment.len() != coords.len() {
            // Positional merge relies on index alignment with the request.
            warn!(
                "[SnapReconciler] Profile '{}' returned {} entries for {} points",
                profile,
                alignment.len(),
                coords.len()
            );
        }

        let fixes = apply_alignment(&window, &alignment);
        if !fixes.iter().any(|f| f.snapped) {
            debug!("[SnapReconciler] Profile '{}' returned no match", profile);
            failures.push(format!("{}: no match", profile));
            continue;
        }

        debug!(
            "[SnapReconciler] Profile '{}' snapped {}/{} points",
            profile,
            fixes.iter().filter(|f| f.snapped).count(),
            fixes.len()
        );
        return SnapBatch {
            fixes,
            profile: Some(profile.clone()),
            failures,
        };
    }

    SnapBatch {
        fixes: window,
        profile: None,
        failures,
    }
}

fn unsnapped(mut fix: Fix) -> Fix {
    fix.snapped = false;
    fix.snapped_lat = None;
    fix.snapped_lng = None;
    fix
}

/// Per-session snapping state: which windows were already submitted and how
/// the batches went.
#[derive(Debug, Clone)]
pub struct SnapReconciler {
    profiles: Vec<String>,
    batch_size: usize,
    timeout: Duration,
    last_submitted: usize,
    last_error: Option<String>,
    snapped_total: usize,
    unsnapped_total: usize,
}

impl SnapReconciler {
    pub fn new(mode: TrackingMode, config: &SnapConfig) -> Self {
        let profiles = profile_candidates(mode, config);
        info!("[SnapReconciler] Profiles for {}: {:?}", mode, profiles);
        Self {
            profiles,
            batch_size: config.batch_size.max(1),
            timeout: config.request_timeout,
            last_submitted: 0,
            last_error: None,
            snapped_total: 0,
            unsnapped_total: 0,
        }
    }

    pub fn profiles(&self) -> &[String] {
        &self.profiles
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn snapped_total(&self) -> usize {
        self.snapped_total
    }

    pub fn unsnapped_total(&self) -> usize {
        self.unsnapped_total
    }

    /// Highest point count already submitted.
    pub fn last_submitted(&self) -> usize {
        self.last_submitted
    }

    /// The window to submit next, if the track has grown by a full batch
    /// since the last submission.
    pub fn next_window(&mut self, track: &TrackBuffer) -> Option<Vec<Fix>> {
        let len = track.len();
        if len < self.batch_size || len < self.last_submitted + self.batch_size {
            return None;
        }
        self.last_submitted = len;
        Some(track.window(self.batch_size))
    }

    /// Prime the submission guard after a rehydrate so old windows are not
    /// re-requested.
    pub fn mark_submitted(&mut self, len: usize) {
        self.last_submitted = self.last_submitted.max(len);
    }

    /// A `'static` future snapping `window`, suitable for spawning.
    pub fn request(
        &self,
        matcher: Arc<dyn MapMatcher>,
        window: Vec<Fix>,
    ) -> impl std::future::Future<Output = SnapBatch> + Send + 'static {
        let profiles = self.profiles.clone();
        let timeout = self.timeout;
        async move { snap_window(matcher.as_ref(), &profiles, window, timeout).await }
    }

    /// Fold a finished batch into the diagnostics.
    pub fn record(&mut self, batch: &SnapBatch) {
        self.snapped_total += batch.snapped_count();
        self.unsnapped_total += batch.unsnapped_count();
        self.last_error = batch.error();
        if let Some(err) = &self.last_error {
            warn!("[SnapReconciler] {}", err);
        }
    }
}

/// Matcher used when no backend is configured: every attempt fails, so the
/// track is kept unsnapped.
#[derive(Debug, Default, Clone)]
pub struct DisabledMatcher;

impl MapMatcher for DisabledMatcher {
    fn match_trace<'a>(
        &'a self,
        _profile: &'a str,
        _points: &'a [GpsPoint],
    ) -> BoxFuture<'a, Result<Vec<Option<GpsPoint>>>> {
        Box::pin(async {
            Err(TrackerError::Config {
                message: "map matching disabled".to_string(),
            })
        })
    }
}
