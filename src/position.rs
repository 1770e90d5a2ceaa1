//! # Position Source
//!
//! Wraps a continuous location provider and a screen wake-lock.
//!
//! Every watch the source opens is tagged with a generation number. Events are
//! delivered on a single channel together with the generation that produced
//! them, and [`PositionSource::accept`] drops anything from a watch that has
//! since been cleared. After `stop()` or `pause()` returns, no further fix is
//! accepted even if the provider still has callbacks in flight.
//!
//! Provider errors never unwind: they land in [`TrackingStatus::error`] and
//! tracking stays active so the caller can decide whether to stop.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::Fix;

/// Opaque handle returned by a provider for an active watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(pub u64);

/// One position report from the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPosition {
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: DateTime<Utc>,
    pub accuracy: Option<f64>,
    pub speed: Option<f64>,
}

impl From<RawPosition> for Fix {
    fn from(p: RawPosition) -> Self {
        let mut fix = Fix::new(p.latitude, p.longitude, p.timestamp);
        fix.accuracy = p.accuracy;
        fix.speed = p.speed;
        fix
    }
}

/// Error classes a location provider can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorCode {
    PermissionDenied,
    PositionUnavailable,
    Timeout,
    Unsupported,
}

/// Provider error as `{code, message}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderError {
    pub code: ProviderErrorCode,
    pub message: String,
}

impl ProviderError {
    pub fn new(code: ProviderErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Something a watch produced.
#[derive(Debug, Clone, PartialEq)]
pub enum PositionEvent {
    Position(RawPosition),
    Error(ProviderError),
}

type Tagged = (u64, PositionEvent);

/// Where a provider delivers events for one watch.
#[derive(Debug, Clone)]
pub struct PositionSink {
    generation: u64,
    tx: mpsc::UnboundedSender<Tagged>,
}

impl PositionSink {
    /// Deliver an event. Returns `false` once the session side has gone away.
    pub fn send(&self, event: PositionEvent) -> bool {
        self.tx.send((self.generation, event)).is_ok()
    }

    pub fn position(&self, position: RawPosition) -> bool {
        self.send(PositionEvent::Position(position))
    }

    pub fn error(&self, error: ProviderError) -> bool {
        self.send(PositionEvent::Error(error))
    }
}

/// Receiving half of the position channel, owned by the session driver.
#[derive(Debug)]
pub struct PositionStream {
    rx: mpsc::UnboundedReceiver<Tagged>,
}

impl PositionStream {
    /// Next tagged event. `None` when every sink has been dropped.
    pub async fn recv(&mut self) -> Option<(u64, PositionEvent)> {
        self.rx.recv().await
    }

    /// Non-blocking variant for polling hosts and tests.
    pub fn try_recv(&mut self) -> Option<(u64, PositionEvent)> {
        self.rx.try_recv().ok()
    }
}

/// A continuous location provider (GPS chipset, OS location service, replay file).
pub trait LocationProvider: Send {
    /// Begin continuous sampling, delivering every update to `sink`.
    fn watch_position(&mut self, sink: PositionSink) -> Result<WatchId, ProviderError>;

    /// Stop the given watch. Must be idempotent.
    fn clear_watch(&mut self, id: WatchId);
}

/// A screen/display wake-lock.
pub trait WakeLock: Send {
    fn is_supported(&self) -> bool;

    /// Acquire the lock. Errors are reported, never fatal.
    fn acquire(&mut self) -> Result<(), String>;

    /// Release the lock if held. Must be idempotent.
    fn release(&mut self);
}

/// Wake-lock for hosts without one.
#[derive(Debug, Default)]
pub struct NoWakeLock;

impl WakeLock for NoWakeLock {
    fn is_supported(&self) -> bool {
        false
    }

    fn acquire(&mut self) -> Result<(), String> {
        Err("Wake lock not supported".to_string())
    }

    fn release(&mut self) {}
}

/// Observable sampling state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackingStatus {
    pub is_tracking: bool,
    pub paused: bool,
    pub error: Option<String>,
    pub wake_lock_supported: bool,
    pub wake_lock_active: bool,
}

/// Continuous sampling with pause/resume and wake-lock management.
pub struct PositionSource {
    provider: Box<dyn LocationProvider>,
    wake_lock: Box<dyn WakeLock>,
    tx: mpsc::UnboundedSender<Tagged>,
    watch: Option<WatchId>,
    generation: u64,
    status: TrackingStatus,
}

impl PositionSource {
    /// Create a source and the stream its events arrive on.
    pub fn new(
        provider: Box<dyn LocationProvider>,
        wake_lock: Box<dyn WakeLock>,
    ) -> (Self, PositionStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        let status = TrackingStatus {
            wake_lock_supported: wake_lock.is_supported(),
            ..TrackingStatus::default()
        };
        (
            Self {
                provider,
                wake_lock,
                tx,
                watch: None,
                generation: 0,
                status,
            },
            PositionStream { rx },
        )
    }

    pub fn status(&self) -> &TrackingStatus {
        &self.status
    }

    /// Whether a provider watch is currently open.
    pub fn is_sampling(&self) -> bool {
        self.watch.is_some()
    }

    /// Begin sampling.
    ///
    /// Calling `start` while already sampling is a no-op, so at most one watch
    /// is ever open.
    pub fn start(&mut self) {
        self.status.is_tracking = true;
        self.status.paused = false;
        self.status.error = None;
        self.open_watch();
    }

    /// Stop sampling and release the wake-lock.
    pub fn stop(&mut self) {
        self.close_watch();
        self.release_wake_lock();
        self.status.is_tracking = false;
        self.status.paused = false;
        info!("[PositionSource] Stopped");
    }

    /// Stop sampling but keep the session active.
    pub fn pause(&mut self) {
        if !self.status.is_tracking || self.status.paused {
            return;
        }
        self.close_watch();
        self.release_wake_lock();
        self.status.paused = true;
        info!("[PositionSource] Paused");
    }

    /// Restart sampling after a pause, through the same path as `start`.
    pub fn resume(&mut self) {
        if !self.status.is_tracking {
            return;
        }
        info!("[PositionSource] Resuming");
        self.start();
    }

    /// React to the host view being hidden or shown.
    ///
    /// Hidden pauses an active session; shown resumes one that was paused.
    /// Repeated notifications in the same direction are ignored.
    pub fn visibility_changed(&mut self, hidden: bool) {
        if !self.status.is_tracking {
            return;
        }
        match (hidden, self.status.paused) {
            (true, false) => self.pause(),
            (false, true) => self.resume(),
            _ => debug!("[PositionSource] Visibility unchanged (hidden={})", hidden),
        }
    }

    /// Filter a tagged event from the stream.
    ///
    /// Returns a fix for positions from the current watch. Errors from the
    /// current watch are recorded in the status. Anything from a cleared watch
    /// is dropped.
    pub fn accept(&mut self, generation: u64, event: PositionEvent) -> Option<Fix> {
        if self.watch.is_none() || generation != self.generation {
            debug!(
                "[PositionSource] Dropping event from stale watch {} (current {})",
                generation, self.generation
            );
            return None;
        }
        match event {
            PositionEvent::Position(position) => {
                if !crate::GpsPoint::new(position.latitude, position.longitude).is_valid() {
                    warn!("[PositionSource] Ignoring invalid coordinate");
                    return None;
                }
                Some(position.into())
            }
            PositionEvent::Error(error) => {
                warn!("[PositionSource] Provider error {:?}: {}", error.code, error.message);
                self.status.error = Some(error.message);
                None
            }
        }
    }

    fn open_watch(&mut self) {
        if self.watch.is_some() {
            debug!("[PositionSource] Watch already open");
            return;
        }
        self.acquire_wake_lock();
        self.generation += 1;
        let sink = PositionSink {
            generation: self.generation,
            tx: self.tx.clone(),
        };
        match self.provider.watch_position(sink) {
            Ok(id) => {
                debug!("[PositionSource] Watch {:?} open (generation {})", id, self.generation);
                self.watch = Some(id);
            }
            Err(e) => {
                warn!("[PositionSource] Could not start watch: {}", e.message);
                self.status.error = Some(e.message);
                self.release_wake_lock();
            }
        }
    }

    fn close_watch(&mut self) {
        if let Some(id) = self.watch.take() {
            self.provider.clear_watch(id);
            debug!("[PositionSource] Watch {:?} cleared", id);
        }
    }

    fn acquire_wake_lock(&mut self) {
        if !self.wake_lock.is_supported() {
            return;
        }
        match self.wake_lock.acquire() {
            Ok(()) => self.status.wake_lock_active = true,
            Err(e) => {
                warn!("[PositionSource] Wake lock unavailable: {}", e);
                self.status.wake_lock_active = false;
            }
        }
    }

    fn release_wake_lock(&mut self) {
        if self.status.wake_lock_active {
            self.wake_lock.release();
        }
        self.status.wake_lock_active = false;
    }
}

impl Drop for PositionSource {
    fn drop(&mut self) {
        self.close_watch();
        self.release_wake_lock();
    }
}
