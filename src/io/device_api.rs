//! Device-facing HTTP endpoint
//!
//! Thin mapping from requests to engine operations. Routes:
//! - `POST /api/doors/access?side=inside|outside` body = frame, `X-Api-Key` header
//! - `POST /api/devices/{id}/verify` JSON challenge response
//! - `POST /api/devices/{id}/locations` JSON array of samples
//! - `POST /api/devices/{id}/geofence-events` JSON array of crossings
//! - `GET /api/geofences/sync?owner=&since=`
//! - `GET /api/devices/{id}/firmware?current=` update check
//! - `GET /api/devices/{id}/firmware/download` newest image as octet-stream
//!
//! Business outcomes are always 200 with the structured body. Uploads from an
//! unknown device are 404. Owner and firmware management routes live in
//! `owner_api`.

use crate::domain::device::SampleInput;
use crate::domain::geofence::CrossingInput;
use crate::domain::types::{DoorSide, OwnerId};
use crate::infra::clock::Clock;
use crate::infra::store::{DeviceDirectory, PreferenceStore, StoreError};
use crate::io::owner_api;
use crate::services::admission::AdmissionEngine;
use crate::services::animal_registry::AnimalRegistry;
use crate::services::device_trust::{DeviceTrustVerifier, VerifyRequest};
use crate::services::error::EngineError;
use crate::services::firmware::FirmwareCatalog;
use crate::services::geofence_sync::GeofencePolicySync;
use crate::services::telemetry::TelemetryIngest;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::convert::Infallible;
use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Frames larger than this are rejected before reaching the engine
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

const API_KEY_HEADER: &str = "x-api-key";

/// Engine handles shared by every connection
pub struct ApiState {
    pub admission: Arc<AdmissionEngine>,
    pub trust: Arc<DeviceTrustVerifier>,
    pub telemetry: Arc<TelemetryIngest>,
    pub geofences: Arc<GeofencePolicySync>,
    pub registry: Arc<AnimalRegistry>,
    pub firmware: Arc<FirmwareCatalog>,
    pub devices: Arc<dyn DeviceDirectory>,
    pub preferences: Arc<dyn PreferenceStore>,
    pub clock: Arc<dyn Clock>,
    /// Enables the management routes when set
    pub admin_token: Option<String>,
}

pub(crate) type ApiResponse = Response<Full<Bytes>>;

pub(crate) fn json_response<T: Serialize>(status: StatusCode, value: &T) -> ApiResponse {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut response = Response::new(Full::new(Bytes::from(body)));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

pub(crate) fn error_response(status: StatusCode, error: impl Display) -> ApiResponse {
    let body = serde_json::json!({ "error": error.to_string() }).to_string();
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn internal_error(route: &str, e: impl Display) -> ApiResponse {
    error!(route, error = %e, "device_api_internal_error");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
}

/// Caller mistakes become 4xx; everything else is logged as a 500
pub(crate) fn store_error(route: &str, e: StoreError) -> ApiResponse {
    match e {
        StoreError::Invalid(msg) => error_response(StatusCode::BAD_REQUEST, msg),
        StoreError::Conflict(msg) => error_response(StatusCode::CONFLICT, msg),
        other => internal_error(route, other),
    }
}

pub(crate) fn engine_error(route: &str, e: EngineError) -> ApiResponse {
    match e {
        EngineError::Store(e) => store_error(route, e),
        other => internal_error(route, other),
    }
}

pub(crate) fn parse_json<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiResponse> {
    serde_json::from_slice(body)
        .map_err(|e| error_response(StatusCode::BAD_REQUEST, format!("invalid body: {e}")))
}

pub(crate) fn query_param<'a>(query: Option<&'a str>, name: &str) -> Option<&'a str> {
    query?.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        (key == name).then_some(value)
    })
}

/// Dispatch one buffered request
pub async fn route(
    state: &ApiState,
    method: &Method,
    path: &str,
    query: Option<&str>,
    headers: &HeaderMap,
    body: Bytes,
) -> ApiResponse {
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    match (method, segments.as_slice()) {
        (&Method::POST, ["api", "doors", "access"]) => door_access(state, query, headers, body).await,
        (&Method::POST, ["api", "devices", id, "verify"]) => verify(state, id, &body),
        (&Method::POST, ["api", "devices", id, "locations"]) => locations(state, id, &body),
        (&Method::POST, ["api", "devices", id, "geofence-events"]) => {
            geofence_events(state, id, &body)
        }
        (&Method::GET, ["api", "geofences", "sync"]) => geofence_sync(state, query),
        (&Method::GET, ["api", "devices", id, "firmware"]) => firmware_check(state, id, query),
        (&Method::GET, ["api", "devices", id, "firmware", "download"]) => {
            firmware_download(state, id).await
        }
        (_, ["api", "owners", ..]) | (_, ["api", "firmware"]) => {
            owner_api::route(state, method, &segments, query, headers, body).await
        }
        (&Method::GET, ["health"]) => json_response(StatusCode::OK, &serde_json::json!({"ok": true})),
        _ => error_response(StatusCode::NOT_FOUND, "not found"),
    }
}

async fn door_access(
    state: &ApiState,
    query: Option<&str>,
    headers: &HeaderMap,
    body: Bytes,
) -> ApiResponse {
    let side = match query_param(query, "side").filter(|s| !s.is_empty()) {
        Some(raw) => match raw.parse::<DoorSide>() {
            Ok(side) => Some(side),
            Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
        },
        None => None,
    };
    let api_key = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|k| !k.is_empty());

    match state.admission.process_access(body.to_vec(), api_key, side).await {
        Ok(decision) => json_response(StatusCode::OK, &decision),
        Err(e) => internal_error("door_access", e),
    }
}

fn verify(state: &ApiState, external_id: &str, body: &[u8]) -> ApiResponse {
    let request: VerifyRequest = match parse_json(body) {
        Ok(r) => r,
        Err(response) => return response,
    };
    match state.trust.verify(external_id, &request) {
        Ok(result) => json_response(StatusCode::OK, &result),
        Err(e) => internal_error("verify", e),
    }
}

/// 404 when nothing was stored because the device does not exist
fn upload_response(state: &ApiState, external_id: &str, stored: usize) -> ApiResponse {
    if stored == 0 {
        match state.devices.device_by_external_id(external_id) {
            Ok(Some(_)) => {}
            Ok(None) => return error_response(StatusCode::NOT_FOUND, "device not found"),
            Err(e) => return internal_error("upload", e),
        }
    }
    json_response(StatusCode::OK, &serde_json::json!({ "stored": stored }))
}

fn locations(state: &ApiState, external_id: &str, body: &[u8]) -> ApiResponse {
    let batch: Vec<SampleInput> = match parse_json(body) {
        Ok(b) => b,
        Err(response) => return response,
    };
    match state.telemetry.upload_batch(external_id, &batch) {
        Ok(stored) => upload_response(state, external_id, stored),
        Err(e) => internal_error("locations", e),
    }
}

fn geofence_events(state: &ApiState, external_id: &str, body: &[u8]) -> ApiResponse {
    let crossings: Vec<CrossingInput> = match parse_json(body) {
        Ok(c) => c,
        Err(response) => return response,
    };
    match state.geofences.record_events(external_id, &crossings) {
        Ok(stored) => upload_response(state, external_id, stored),
        Err(e) => internal_error("geofence_events", e),
    }
}

fn geofence_sync(state: &ApiState, query: Option<&str>) -> ApiResponse {
    let Some(owner) = query_param(query, "owner").and_then(|v| v.parse::<i64>().ok()) else {
        return error_response(StatusCode::BAD_REQUEST, "owner is required");
    };
    let since = match query_param(query, "since").filter(|s| !s.is_empty()) {
        Some(raw) => match raw.parse::<u64>() {
            Ok(v) => v,
            Err(e) => return error_response(StatusCode::BAD_REQUEST, format!("since: {e}")),
        },
        None => 0,
    };
    match state.geofences.sync(OwnerId(owner), since) {
        Ok(result) => json_response(StatusCode::OK, &result),
        Err(e) => internal_error("geofence_sync", e),
    }
}

fn firmware_check(state: &ApiState, external_id: &str, query: Option<&str>) -> ApiResponse {
    let Some(current) = query_param(query, "current").filter(|v| !v.is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "current is required");
    };
    match state.firmware.check(external_id, current) {
        Ok(check) => json_response(StatusCode::OK, &check),
        Err(e) => store_error("firmware_check", e),
    }
}

async fn firmware_download(state: &ApiState, external_id: &str) -> ApiResponse {
    let image = match state.firmware.download(external_id).await {
        Ok(Some(image)) => image,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "no firmware available"),
        Err(e) => return engine_error("firmware_download", e),
    };

    let length = image.bytes.len();
    let mut response = Response::new(Full::new(Bytes::from(image.bytes)));
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
    if let Ok(version) = HeaderValue::from_str(&image.release.version) {
        headers.insert("x-firmware-version", version);
    }
    if let Ok(digest) = HeaderValue::from_str(&image.release.sha256) {
        headers.insert("x-firmware-sha256", digest);
    }
    response
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<ApiState>,
) -> Result<ApiResponse, Infallible> {
    let (parts, body) = req.into_parts();
    let body = match Limited::new(body, MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(path = %parts.uri.path(), error = %e, "device_api_body_rejected");
            return Ok(error_response(StatusCode::PAYLOAD_TOO_LARGE, "body too large or unreadable"));
        }
    };

    debug!(method = %parts.method, path = %parts.uri.path(), bytes = body.len(), "device_api_request");
    Ok(route(&state, &parts.method, parts.uri.path(), parts.uri.query(), &parts.headers, body).await)
}

/// Start the device API server
pub async fn start_device_api(
    port: u16,
    state: Arc<ApiState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    info!(port = %port, "device_api_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let state = state.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let state = state.clone();
                                async move { handle_request(req, state).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                debug!(error = %e, "device_api_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "device_api_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("device_api_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
