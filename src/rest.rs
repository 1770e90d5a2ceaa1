//! PostgREST-style client for the storage/claim service.
//!
//! Geometries go over the wire as EWKT strings. Error bodies carry a `message`
//! field that is passed through untouched so claim rejections reach the
//! participant as the service worded them.

use std::time::Duration;

use chrono::SecondsFormat;
use futures::future::BoxFuture;
use log::{debug, warn};
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::collaborator::{
    ClaimRequest, ClaimResponse, LiveUpdate, NewSession, PointRecord, SessionSummary,
    TerritoryStore,
};
use crate::error::{Result, TrackerError};
use crate::geo_utils::{ewkt, point_wkt};

/// Storage service client.
pub struct RestTerritoryStore {
    client: Client,
    base_url: String,
    api_key: String,
    access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreatedRow {
    id: Value,
}

impl RestTerritoryStore {
    /// Client for the service at `base_url`, authenticated with the project
    /// `api_key`. Requests run as the anonymous role until
    /// [`with_access_token`](Self::with_access_token) is called.
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self> {
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
            api_key: api_key.to_string(),
            access_token: None,
        })
    }

    /// Act as the signed-in participant.
    pub fn with_access_token(mut self, token: &str) -> Self {
        self.access_token = Some(token.to_string());
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, path)
    }

    fn authorized(&self, req: RequestBuilder) -> RequestBuilder {
        let bearer = self.access_token.as_deref().unwrap_or(&self.api_key);
        req.header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", bearer))
    }

    async fn send(&self, req: RequestBuilder) -> Result<Response> {
        let resp = self
            .authorized(req)
            .send()
            .await
            .map_err(|e| TrackerError::Http {
                message: format!("Request error: {}", e),
                status_code: e.status().map(|s| s.as_u16()),
            })?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let text = resp.text().await.unwrap_or_default();
        let message = service_message(&text)
            .unwrap_or_else(|| format!("Request failed with status {}", status));
        warn!("[RestTerritoryStore] {} {}", status, message);
        Err(TrackerError::Http {
            message,
            status_code: Some(status.as_u16()),
        })
    }

    async fn insert_session(&self, request: &NewSession) -> Result<String> {
        let req = self
            .client
            .post(self.url("sessions"))
            .header("Prefer", "return=representation")
            .json(&session_payload(request));
        let rows: Vec<CreatedRow> = self.send(req).await?.json().await.map_err(decode)?;
        let row = rows.into_iter().next().ok_or_else(|| TrackerError::Decode {
            message: "Session insert returned no rows".to_string(),
        })?;
        let id = match row.id {
            Value::String(s) => s,
            other => other.to_string(),
        };
        debug!("[RestTerritoryStore] Created session {}", id);
        Ok(id)
    }

    async fn upsert_rows(&self, rows: Value) -> Result<()> {
        let req = self
            .client
            .post(self.url("session_points?on_conflict=session_id,ts"))
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&rows);
        self.send(req).await?;
        Ok(())
    }

    async fn claim(&self, claim: &ClaimRequest) -> Result<ClaimResponse> {
        let req = self
            .client
            .post(self.url("rpc/claim_territory"))
            .json(&claim_payload(claim));
        let text = self.send(req).await?.text().await.map_err(decode)?;
        Ok(claim_response(&text))
    }

    async fn finalize(&self, summary: &SessionSummary) -> Result<()> {
        let req = self
            .client
            .patch(self.url(&format!("sessions?id=eq.{}", summary.session_id)))
            .header("Prefer", "return=minimal")
            .json(&json!({
                "ended_at": summary.ended_at.to_rfc3339(),
                "closed_loop": summary.closed_loop,
                "distance_m": summary.distance_m,
                "perimeter_m": summary.perimeter_m,
            }));
        self.send(req).await?;
        Ok(())
    }

    async fn publish(&self, update: &LiveUpdate) -> Result<()> {
        let req = self
            .client
            .post(self.url("live_players?on_conflict=user_id,city_id"))
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&live_payload(update));
        self.send(req).await?;
        Ok(())
    }
}

fn decode(e: reqwest::Error) -> TrackerError {
    TrackerError::Decode {
        message: format!("Parse error: {}", e),
    }
}

/// The `message` field of an error body, if there is one.
fn service_message(body: &str) -> Option<String> {
    serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|b| b.message)
        .filter(|m| !m.is_empty())
}

fn session_payload(request: &NewSession) -> Value {
    json!({
        "user_id": request.participant_id,
        "city_id": request.city_id,
        "mode": request.mode.as_str(),
        "live_mode": request.live_mode,
        "started_at": request.started_at.to_rfc3339(),
    })
}

fn point_row(point: &PointRecord) -> Value {
    json!({
        "session_id": point.session_id,
        "ts": point.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        "raw_geom": ewkt(&point_wkt(&point.raw)),
        "snapped_geom": point.snapped.as_ref().map(|p| ewkt(&point_wkt(p))),
        "snapped": point.snapped.is_some(),
        "accuracy_m": point.accuracy,
        "speed_mps": point.speed,
    })
}

fn claim_payload(claim: &ClaimRequest) -> Value {
    json!({
        "p_user_id": claim.participant_id,
        "p_city_id": claim.city_id,
        "p_session_id": claim.session_id,
        "p_polygon": ewkt(&claim.polygon_wkt),
    })
}

/// The RPC may answer with an object carrying a `message`, any other JSON
/// value, or nothing.
fn claim_response(body: &str) -> ClaimResponse {
    let data = serde_json::from_str::<Value>(body)
        .ok()
        .filter(|v| !v.is_null());
    let message = data
        .as_ref()
        .and_then(|v| v.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string);
    ClaimResponse { message, data }
}

/// Live row. The offline signal only flips `is_live` and leaves the last
/// known geometry in place.
fn live_payload(update: &LiveUpdate) -> Value {
    let mut row = json!({
        "user_id": update.participant_id,
        "city_id": update.city_id,
        "username": update.display_name,
        "is_live": update.is_live,
        "last_ts": update.timestamp.to_rfc3339(),
    });
    if update.is_live {
        row["last_point"] = json!(update.point_ewkt());
        row["last_trail"] = json!(update.trail_ewkt());
    } else {
        row["updated_at"] = json!(update.timestamp.to_rfc3339());
    }
    row
}

impl TerritoryStore for RestTerritoryStore {
    fn create_session<'a>(&'a self, request: &'a NewSession) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            self.insert_session(request)
                .await
                .map_err(|e| TrackerError::SessionStart {
                    message: e.message(),
                })
        })
    }

    fn upsert_point<'a>(&'a self, point: &'a PointRecord) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.upsert_rows(point_row(point)))
    }

    fn upsert_points<'a>(&'a self, points: &'a [PointRecord]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if points.is_empty() {
                return Ok(());
            }
            let rows = Value::Array(points.iter().map(point_row).collect());
            self.upsert_rows(rows).await
        })
    }

    fn claim_territory<'a>(
        &'a self,
        claim: &'a ClaimRequest,
    ) -> BoxFuture<'a, Result<ClaimResponse>> {
        Box::pin(self.claim(claim))
    }

    fn finalize_session<'a>(&'a self, summary: &'a SessionSummary) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.finalize(summary))
    }

    fn publish_live_position<'a>(&'a self, update: &'a LiveUpdate) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.publish(update))
    }
}
