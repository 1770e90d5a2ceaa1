//! Rate-limited live position broadcast.
//!
//! At most one publish per window; calls inside the window are dropped, not
//! queued. The broadcaster only decides what to send. The session sends it.

use std::time::Duration;

use chrono::Utc;
use log::debug;
use tokio::time::Instant;

use crate::collaborator::LiveUpdate;
use crate::config::LiveConfig;
use crate::track::TrackBuffer;
use crate::Participant;

#[derive(Debug, Clone)]
pub struct LiveBroadcaster {
    enabled: bool,
    min_interval: Duration,
    trail_len: usize,
    last_sent: Option<Instant>,
}

impl LiveBroadcaster {
    pub fn new(enabled: bool, config: &LiveConfig) -> Self {
        Self {
            enabled,
            min_interval: config.min_interval,
            trail_len: config.trail_len,
            last_sent: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// The update to publish at `now`, or `None` if live mode is off, there is
    /// nothing to show yet, or the last publish was too recent.
    pub fn prepare(
        &mut self,
        now: Instant,
        participant: &Participant,
        city_id: &str,
        track: &TrackBuffer,
    ) -> Option<LiveUpdate> {
        if !self.enabled {
            return None;
        }
        let last = track.last()?;
        if let Some(sent) = self.last_sent {
            if now.saturating_duration_since(sent) < self.min_interval {
                debug!("[LiveBroadcaster] Throttled");
                return None;
            }
        }
        self.last_sent = Some(now);

        Some(LiveUpdate {
            participant_id: participant.id.clone(),
            city_id: city_id.to_string(),
            display_name: participant.display_name.clone(),
            point: Some(last.best_estimate()),
            trail: track.best_estimate_tail(self.trail_len),
            is_live: true,
            timestamp: Utc::now(),
        })
    }

    /// The one-time "went offline" signal sent when a live session stops.
    pub fn offline(&self, participant: &Participant, city_id: &str) -> Option<LiveUpdate> {
        if !self.enabled {
            return None;
        }
        Some(LiveUpdate {
            participant_id: participant.id.clone(),
            city_id: city_id.to_string(),
            display_name: participant.display_name.clone(),
            point: None,
            trail: Vec::new(),
            is_live: false,
            timestamp: Utc::now(),
        })
    }
}
