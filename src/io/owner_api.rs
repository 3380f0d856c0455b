//! Owner and firmware management routes
//!
//! Served by the device API listener and guarded by the configured admin
//! token (`Authorization: Bearer <token>`). Without a token the routes do not
//! exist. Routes, all relative to `/api/owners/{owner}`:
//! - `GET|PUT door-policy`
//! - `GET access-logs?page=&page_size=&kind=`, `GET access-logs/{id}`
//! - `GET animals`, `PUT animals/{id}`, `POST animals/{id}/fingerprints` body = photo
//! - `GET|POST devices`, `GET|PATCH|DELETE devices/{id}`
//! - `GET devices/{id}/locations?from=&to=`, `GET devices/{id}/location`,
//!   `GET devices/{id}/activity?from=&to=`
//! - `GET|POST geofences`, `GET|PATCH|DELETE geofences/{id}`
//! - `GET geofence-events?fence=&from=&to=`
//! - `GET|PUT notification-preferences`
//!
//! plus `GET /api/firmware` and `POST /api/firmware?version=&notes=` with the
//! image as body. Times are RFC 3339 or epoch seconds.

use crate::domain::device::DevicePatch;
use crate::domain::door::DoorPolicyPatch;
use crate::domain::geofence::{GeofencePatch, NewGeofence};
use crate::domain::notification::NotificationPreferences;
use crate::domain::types::{from_epoch_secs, AnimalId, DeviceId, EventKind, GeofenceId, OwnerId};
use crate::infra::clock::Clock;
use crate::infra::store::StoreResult;
use crate::io::device_api::{
    engine_error, error_response, json_response, parse_json, query_param, store_error, ApiResponse,
    ApiState,
};
use crate::services::animal_registry::AnimalInput;
use crate::services::geofence_sync::EventQuery;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use hyper::header::{HeaderMap, AUTHORIZATION};
use hyper::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::warn;

/// Access log page size when the query names none
const DEFAULT_PAGE_SIZE: usize = 20;

/// Location and activity queries default to this much history
const DEFAULT_HISTORY_HOURS: i64 = 24;

#[derive(Debug, Deserialize)]
struct DeviceInput {
    name: String,
    #[serde(default)]
    animal_id: Option<AnimalId>,
}

fn authorize(state: &ApiState, headers: &HeaderMap) -> Result<(), ApiResponse> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Err(error_response(StatusCode::NOT_FOUND, "not found"));
    };
    let presented = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);

    match presented {
        None => Err(error_response(StatusCode::UNAUTHORIZED, "bearer token required")),
        Some(token) if bool::from(token.as_bytes().ct_eq(expected.as_bytes())) => Ok(()),
        Some(_) => {
            warn!("owner_api_token_rejected");
            Err(error_response(StatusCode::FORBIDDEN, "invalid token"))
        }
    }
}

/// Dispatch a management request. `segments` is the whole path.
pub(crate) async fn route(
    state: &ApiState,
    method: &Method,
    segments: &[&str],
    query: Option<&str>,
    headers: &HeaderMap,
    body: Bytes,
) -> ApiResponse {
    if let Err(denied) = authorize(state, headers) {
        return denied;
    }

    match (method, segments) {
        (&Method::GET, ["api", "firmware"]) => respond("firmware_releases", state.firmware.releases()),
        (&Method::POST, ["api", "firmware"]) => firmware_upload(state, query, body).await,
        (_, ["api", "owners", owner, rest @ ..]) => match owner.parse::<i64>() {
            Ok(owner) => owner_route(state, method, OwnerId(owner), rest, query, body).await,
            Err(_) => error_response(StatusCode::BAD_REQUEST, "owner must be an integer"),
        },
        _ => error_response(StatusCode::NOT_FOUND, "not found"),
    }
}

async fn owner_route(
    state: &ApiState,
    method: &Method,
    owner: OwnerId,
    rest: &[&str],
    query: Option<&str>,
    body: Bytes,
) -> ApiResponse {
    match (method, rest) {
        (&Method::GET, ["door-policy"]) => respond("get_policy", state.admission.get_policy(owner)),
        (&Method::PUT, ["door-policy"]) => match parse_json::<DoorPolicyPatch>(&body) {
            Ok(patch) => respond("update_policy", state.admission.update_policy(owner, &patch)),
            Err(response) => response,
        },
        (&Method::GET, ["access-logs"]) => access_logs(state, owner, query),
        (&Method::GET, ["access-logs", id]) => match id.parse::<u64>() {
            Ok(id) => found("access_event", state.admission.access_event(owner, id)),
            Err(_) => bad_id(),
        },

        (&Method::GET, ["animals"]) => respond("animals", state.registry.animals(owner)),
        (&Method::PUT, ["animals", id]) => {
            let Some(id) = parse_id(id).map(AnimalId) else { return bad_id() };
            match parse_json::<AnimalInput>(&body) {
                Ok(input) => respond("put_animal", state.registry.put_animal(owner, id, &input)),
                Err(response) => response,
            }
        }
        (&Method::POST, ["animals", id, "fingerprints"]) => {
            let Some(id) = parse_id(id).map(AnimalId) else { return bad_id() };
            match state.registry.enroll(owner, id, body.to_vec()).await {
                Ok(Some(record)) => json_response(StatusCode::CREATED, &record),
                Ok(None) => not_found(),
                Err(e) => engine_error("enroll", e),
            }
        }

        (&Method::GET, ["devices"]) => respond("list_devices", state.trust.list_devices(owner)),
        (&Method::POST, ["devices"]) => register_device(state, owner, &body),
        (_, ["devices", id, tail @ ..]) => {
            let Some(id) = parse_id(id).map(DeviceId) else { return bad_id() };
            device_route(state, method, owner, id, tail, query, &body)
        }

        (&Method::GET, ["geofences"]) => respond("list_geofences", state.geofences.list(owner)),
        (&Method::POST, ["geofences"]) => match parse_json::<NewGeofence>(&body) {
            Ok(fence) => match state.geofences.create(owner, &fence) {
                Ok(created) => json_response(StatusCode::CREATED, &created),
                Err(e) => store_error("create_geofence", e),
            },
            Err(response) => response,
        },
        (_, ["geofences", id]) => {
            let Some(id) = parse_id(id).map(GeofenceId) else { return bad_id() };
            geofence_route(state, method, owner, id, &body)
        }
        (&Method::GET, ["geofence-events"]) => geofence_events(state, owner, query),

        (&Method::GET, ["notification-preferences"]) => {
            let prefs = state.preferences.notification_preferences(owner).map(|stored| {
                stored.unwrap_or(NotificationPreferences { owner, ..Default::default() })
            });
            respond("get_preferences", prefs)
        }
        (&Method::PUT, ["notification-preferences"]) => {
            match parse_json::<NotificationPreferences>(&body) {
                Ok(mut prefs) => {
                    prefs.owner = owner;
                    let saved = state.preferences.save_preferences(prefs.clone()).map(|_| prefs);
                    respond("save_preferences", saved)
                }
                Err(response) => response,
            }
        }
        _ => not_found(),
    }
}

fn device_route(
    state: &ApiState,
    method: &Method,
    owner: OwnerId,
    id: DeviceId,
    tail: &[&str],
    query: Option<&str>,
    body: &[u8],
) -> ApiResponse {
    match (method, tail) {
        (&Method::GET, []) => found("device", state.trust.device(owner, id)),
        (&Method::PATCH, []) => match parse_json::<DevicePatch>(body) {
            Ok(patch) => found("update_device", state.trust.update_device(owner, id, &patch)),
            Err(response) => response,
        },
        (&Method::DELETE, []) => deleted("remove_device", state.trust.remove_device(owner, id)),
        (&Method::GET, ["location"]) => found("current_location", state.telemetry.current_location(owner, id)),
        (&Method::GET, ["locations"]) => match history_range(state, query) {
            Ok((from, to)) => found("location_history", state.telemetry.location_history(owner, id, from, to)),
            Err(response) => response,
        },
        (&Method::GET, ["activity"]) => match history_range(state, query) {
            Ok((from, to)) => found("activity", state.telemetry.activity_summary(owner, id, from, to)),
            Err(response) => response,
        },
        _ => not_found(),
    }
}

fn geofence_route(
    state: &ApiState,
    method: &Method,
    owner: OwnerId,
    id: GeofenceId,
    body: &[u8],
) -> ApiResponse {
    match method {
        &Method::GET => found("geofence", state.geofences.get(owner, id)),
        &Method::PATCH => match parse_json::<GeofencePatch>(body) {
            Ok(patch) => found("update_geofence", state.geofences.update(owner, id, &patch)),
            Err(response) => response,
        },
        &Method::DELETE => deleted("delete_geofence", state.geofences.delete(owner, id)),
        _ => not_found(),
    }
}

fn register_device(state: &ApiState, owner: OwnerId, body: &[u8]) -> ApiResponse {
    let input: DeviceInput = match parse_json(body) {
        Ok(input) => input,
        Err(response) => return response,
    };
    let name = input.name.trim();
    if name.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "device name is required");
    }
    match state.trust.register_device(owner, name, input.animal_id) {
        Ok(pairing) => json_response(StatusCode::CREATED, &pairing),
        Err(e) => store_error("register_device", e),
    }
}

fn access_logs(state: &ApiState, owner: OwnerId, query: Option<&str>) -> ApiResponse {
    let page = query_param(query, "page").and_then(|v| v.parse().ok()).unwrap_or(1);
    let page_size =
        query_param(query, "page_size").and_then(|v| v.parse().ok()).unwrap_or(DEFAULT_PAGE_SIZE);
    let kind = match query_param(query, "kind").filter(|k| !k.is_empty()) {
        Some(raw) => match raw.parse::<EventKind>() {
            Ok(kind) => Some(kind),
            Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
        },
        None => None,
    };
    respond("access_log", state.admission.access_log(owner, page, page_size, kind))
}

fn geofence_events(state: &ApiState, owner: OwnerId, query: Option<&str>) -> ApiResponse {
    let fence = match query_param(query, "fence").filter(|f| !f.is_empty()) {
        Some(raw) => match parse_id(raw) {
            Some(id) => Some(GeofenceId(id)),
            None => return bad_id(),
        },
        None => None,
    };
    let (from, to) = match (time_param(query, "from"), time_param(query, "to")) {
        (Ok(from), Ok(to)) => (from, to),
        (Err(e), _) | (_, Err(e)) => return error_response(StatusCode::BAD_REQUEST, e),
    };
    respond("geofence_events", state.geofences.events(owner, &EventQuery { fence, from, to }))
}

async fn firmware_upload(state: &ApiState, query: Option<&str>, body: Bytes) -> ApiResponse {
    let Some(version) = query_param(query, "version").filter(|v| !v.is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "version is required");
    };
    let notes = query_param(query, "notes").map(decode_query_value);
    match state.firmware.upload(version, notes.as_deref(), body.to_vec()).await {
        Ok(release) => json_response(StatusCode::CREATED, &release),
        Err(e) => engine_error("firmware_upload", e),
    }
}

/// `from`/`to` with the default window ending now
fn history_range(
    state: &ApiState,
    query: Option<&str>,
) -> Result<(DateTime<Utc>, DateTime<Utc>), ApiResponse> {
    let now = state.clock.now();
    let from = time_param(query, "from").map_err(|e| error_response(StatusCode::BAD_REQUEST, e))?;
    let to = time_param(query, "to").map_err(|e| error_response(StatusCode::BAD_REQUEST, e))?;
    Ok((from.unwrap_or(now - Duration::hours(DEFAULT_HISTORY_HOURS)), to.unwrap_or(now)))
}

fn time_param(query: Option<&str>, name: &str) -> Result<Option<DateTime<Utc>>, String> {
    let Some(raw) = query_param(query, name).filter(|v| !v.is_empty()) else {
        return Ok(None);
    };
    if let Ok(secs) = raw.parse::<i64>() {
        return Ok(Some(from_epoch_secs(secs)));
    }
    DateTime::parse_from_rfc3339(&decode_query_value(raw))
        .map(|t| Some(t.with_timezone(&Utc)))
        .map_err(|e| format!("{name}: {e}"))
}

/// Undo the form encoding browsers and curl apply to query values
fn decode_query_value(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => match hex::decode(&bytes[i + 1..i + 3]) {
                Ok(decoded) => {
                    out.extend(decoded);
                    i += 2;
                }
                Err(_) => out.push(b'%'),
            },
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn parse_id(raw: &str) -> Option<i64> {
    raw.parse::<i64>().ok()
}

fn respond<T: Serialize>(route: &str, result: StoreResult<T>) -> ApiResponse {
    match result {
        Ok(value) => json_response(StatusCode::OK, &value),
        Err(e) => store_error(route, e),
    }
}

fn found<T: Serialize>(route: &str, result: StoreResult<Option<T>>) -> ApiResponse {
    match result {
        Ok(Some(value)) => json_response(StatusCode::OK, &value),
        Ok(None) => not_found(),
        Err(e) => store_error(route, e),
    }
}

fn deleted(route: &str, result: StoreResult<bool>) -> ApiResponse {
    match result {
        Ok(true) => json_response(StatusCode::OK, &serde_json::json!({ "deleted": true })),
        Ok(false) => not_found(),
        Err(e) => store_error(route, e),
    }
}

fn not_found() -> ApiResponse {
    error_response(StatusCode::NOT_FOUND, "not found")
}

fn bad_id() -> ApiResponse {
    error_response(StatusCode::BAD_REQUEST, "id must be an integer")
}
