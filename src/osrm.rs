//! HTTP client for an OSRM-compatible map-matching service.
//!
//! Uses the `match` service and reads the `tracepoints` array, which the
//! service returns index-aligned with the request coordinates (null where a
//! coordinate could not be matched). No retries: the reconciler moves on to the
//! next profile instead.

use std::time::Duration;

use futures::future::BoxFuture;
use log::debug;
use reqwest::Client;
use serde::Deserialize;

use crate::config::SnapConfig;
use crate::error::{Result, TrackerError};
use crate::snap::MapMatcher;
use crate::GpsPoint;

/// Match service response. Only the fields the tracker reads.
#[derive(Debug, Deserialize)]
struct MatchResponse {
    code: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    tracepoints: Vec<Option<Tracepoint>>,
}

#[derive(Debug, Deserialize)]
struct Tracepoint {
    /// [lng, lat]
    location: [f64; 2],
}

/// OSRM `match` client.
pub struct OsrmMatcher {
    client: Client,
    base_url: String,
}

impl OsrmMatcher {
    /// Create a matcher for `base_url` with a per-request timeout.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TrackerError::Http {
                message: format!("Failed to create HTTP client: {}", e),
                status_code: None,
            })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(config: &SnapConfig) -> Result<Self> {
        Self::new(&config.base_url, config.request_timeout)
    }

    /// Request URL for a trace. Coordinates are `lng,lat` pairs joined by `;`.
    pub fn match_url(&self, profile: &str, points: &[GpsPoint]) -> String {
        let coords = points
            .iter()
            .map(|p| format!("{},{}", p.longitude, p.latitude))
            .collect::<Vec<_>>()
            .join(";");
        format!(
            "{}/match/v1/{}/{}?geometries=geojson&overview=full&tidy=true",
            self.base_url, profile, coords
        )
    }

    async fn fetch(&self, profile: &str, points: &[GpsPoint]) -> Result<Vec<Option<GpsPoint>>> {
        if points.is_empty() {
            return Ok(Vec::new());
        }
        let url = self.match_url(profile, points);
        debug!("[OsrmMatcher] {} points via '{}'", points.len(), profile);

        let resp = self.client.get(&url).send().await.map_err(|e| TrackerError::Http {
            message: format!("Request error: {}", e),
            status_code: e.status().map(|s| s.as_u16()),
        })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(TrackerError::Http {
                message: format!("OSRM failed ({})", profile),
                status_code: Some(status.as_u16()),
            });
        }

        let body: MatchResponse = resp.json().await.map_err(|e| TrackerError::Decode {
            message: format!("Parse error: {}", e),
        })?;
        parse_tracepoints(body)
    }
}

fn parse_tracepoints(body: MatchResponse) -> Result<Vec<Option<GpsPoint>>> {
    if body.code != "Ok" {
        return Err(TrackerError::Http {
            message: body.message.unwrap_or(body.code),
            status_code: None,
        });
    }
    Ok(body
        .tracepoints
        .into_iter()
        .map(|tp| tp.map(|t| GpsPoint::new(t.location[1], t.location[0])))
        .collect())
}

impl MapMatcher for OsrmMatcher {
    fn match_trace<'a>(
        &'a self,
        profile: &'a str,
        points: &'a [GpsPoint],
    ) -> BoxFuture<'a, Result<Vec<Option<GpsPoint>>>> {
        Box::pin(self.fetch(profile, points))
    }
}
