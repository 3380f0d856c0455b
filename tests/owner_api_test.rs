//! Provisioning a fresh install over HTTP: door credential, animal,
//! reference photo and collar, then the door and collar traffic that depends
//! on them

use bytes::Bytes;
use chrono::{TimeZone, Utc};
use http_body_util::BodyExt;
use hyper::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use hyper::{Method, StatusCode};
use image::{ImageBuffer, ImageFormat, Luma};
use petgate::infra::{FixedClock, MemoryStore, Metrics};
use petgate::io::device_api::route;
use petgate::io::{ApiState, EventJournal, FirmwareFiles, ImageStore};
use petgate::services::device_trust::compute_response;
use petgate::services::notifier::RecordingNotifier;
use petgate::services::{
    AdmissionEngine, AnimalRegistry, DeviceTrustVerifier, FirmwareCatalog, GeofencePolicySync,
    TelemetryIngest,
};
use std::io::Cursor;
use std::sync::Arc;
use tempfile::TempDir;

const TOKEN: &str = "install-token";

struct Site {
    _dir: TempDir,
    state: ApiState,
}

fn site() -> Site {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let journal = Arc::new(EventJournal::open(dir.path().join("events.jsonl")).unwrap());
    let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 7, 1, 10, 0, 0).unwrap()));
    let metrics = Arc::new(Metrics::new());
    let notifier = Arc::new(RecordingNotifier::new());

    let state = ApiState {
        admission: Arc::new(AdmissionEngine::new(
            store.clone(),
            journal.clone(),
            store.clone(),
            Arc::new(ImageStore::new(dir.path())),
            notifier.clone(),
            clock.clone(),
            metrics.clone(),
        )),
        trust: Arc::new(DeviceTrustVerifier::new(
            store.clone(),
            store.clone(),
            clock.clone(),
            metrics.clone(),
            30,
        )),
        telemetry: Arc::new(TelemetryIngest::new(
            store.clone(),
            store.clone(),
            clock.clone(),
            metrics.clone(),
        )),
        geofences: Arc::new(GeofencePolicySync::new(
            store.clone(),
            store.clone(),
            store.clone(),
            journal,
            notifier,
            clock.clone(),
            metrics,
        )),
        registry: Arc::new(AnimalRegistry::new(store.clone(), store.clone())),
        firmware: Arc::new(FirmwareCatalog::new(
            store.clone(),
            store.clone(),
            Arc::new(FirmwareFiles::new(dir.path())),
            clock.clone(),
        )),
        devices: store.clone(),
        preferences: store,
        clock,
        admin_token: Some(TOKEN.to_string()),
    };
    Site { _dir: dir, state }
}

fn photo() -> Vec<u8> {
    let img = ImageBuffer::from_fn(64, 64, |x, _| Luma([255 - (x * 4) as u8]));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png).unwrap();
    out.into_inner()
}

fn admin() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {TOKEN}")).unwrap());
    headers
}

async fn call(
    site: &Site,
    method: Method,
    path: &str,
    query: Option<&str>,
    headers: &HeaderMap,
    body: impl Into<Bytes>,
) -> (StatusCode, serde_json::Value) {
    let response = route(&site.state, &method, path, query, headers, body.into()).await;
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null))
}

#[tokio::test]
async fn fresh_install_admits_enrolled_pet() {
    let site = site();
    let admin = admin();

    let (status, policy) = call(
        &site,
        Method::PUT,
        "/api/owners/1/door-policy",
        None,
        &admin,
        r#"{"api_key":"front-door","min_confidence":0.9}"#,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(policy["api_key"], "front-door");

    let (status, _) = call(
        &site,
        Method::PUT,
        "/api/owners/1/animals/12",
        None,
        &admin,
        r#"{"name":"Buddy"}"#,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, record) =
        call(&site, Method::POST, "/api/owners/1/animals/12/fingerprints", None, &admin, photo()).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(record["animal_id"], 12);

    let mut door = HeaderMap::new();
    door.insert("x-api-key", HeaderValue::from_static("front-door"));
    let (status, decision) =
        call(&site, Method::POST, "/api/doors/access", Some("side=outside"), &door, photo()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(decision["granted"], true);
    assert_eq!(decision["animal_name"], "Buddy");

    let (_, log) = call(
        &site,
        Method::GET,
        "/api/owners/1/access-logs",
        Some("kind=EntryGranted"),
        &admin,
        Bytes::new(),
    )
    .await;
    assert_eq!(log.as_array().unwrap().len(), 1);
    let path = format!("/api/owners/1/access-logs/{}", decision["event_id"]);
    let (status, _) = call(&site, Method::GET, &path, None, &admin, Bytes::new()).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) =
        call(&site, Method::GET, &path.replace("/owners/1/", "/owners/2/"), None, &admin, Bytes::new())
            .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn paired_collar_verifies_and_reports() {
    let site = site();
    let admin = admin();
    call(&site, Method::PUT, "/api/owners/1/animals/12", None, &admin, r#"{"name":"Buddy"}"#).await;

    let (status, pairing) = call(
        &site,
        Method::POST,
        "/api/owners/1/devices",
        None,
        &admin,
        r#"{"name":"Buddy's collar","animal_id":12}"#,
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let external_id = pairing["external_id"].as_str().unwrap().to_string();
    let secret = pairing["shared_secret"].as_str().unwrap().to_string();
    let device_id = pairing["id"].as_i64().unwrap();

    let ts = Utc.with_ymd_and_hms(2024, 7, 1, 10, 0, 3).unwrap().timestamp();
    let response = compute_response(&secret, &[0x01, 0x02, 0x03], ts).unwrap();
    let body = format!(r#"{{"challenge":"010203","response":"{response}","timestamp":{ts}}}"#);
    let (_, result) = call(
        &site,
        Method::POST,
        &format!("/api/devices/{external_id}/verify"),
        None,
        &HeaderMap::new(),
        body,
    )
    .await;
    assert_eq!(result["verified"], true);
    assert_eq!(result["animal"]["name"], "Buddy");

    let samples = format!(r#"[{{"lat":59.33,"lng":18.06,"ts":{ts}}},{{"lat":59.34,"lng":18.06,"ts":{}}}]"#, ts + 60);
    let (status, _) = call(
        &site,
        Method::POST,
        &format!("/api/devices/{external_id}/locations"),
        None,
        &HeaderMap::new(),
        samples,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let base = format!("/api/owners/1/devices/{device_id}");
    let (_, history) = call(
        &site,
        Method::GET,
        &format!("{base}/locations"),
        Some("from=2024-07-01T09:00:00Z&to=2024-07-01T11:00:00Z"),
        &admin,
        Bytes::new(),
    )
    .await;
    assert_eq!(history.as_array().unwrap().len(), 2);
    let (_, current) =
        call(&site, Method::GET, &format!("{base}/location"), None, &admin, Bytes::new()).await;
    assert_eq!(current["latitude"], 59.34);

    // the secret is never listed
    let (_, listed) = call(&site, Method::GET, "/api/owners/1/devices", None, &admin, Bytes::new()).await;
    assert!(!listed.to_string().contains(&secret));

    let (status, _) = call(&site, Method::DELETE, &base, None, &admin, Bytes::new()).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = call(&site, Method::GET, &base, None, &admin, Bytes::new()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn preferences_and_geofences_round_out_setup() {
    let site = site();
    let admin = admin();

    let (_, prefs) =
        call(&site, Method::GET, "/api/owners/5/notification-preferences", None, &admin, Bytes::new()).await;
    assert_eq!(prefs["owner"], 5);
    assert_eq!(prefs["geofence_breach"], false);

    let (status, saved) = call(
        &site,
        Method::PUT,
        "/api/owners/5/notification-preferences",
        None,
        &admin,
        r#"{"owner":99,"email_enabled":true,"geofence_breach":true}"#,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(saved["owner"], 5);
    assert_eq!(saved["email_enabled"], true);

    let fence = r#"{"name":"Garden","shape":"polygon","rule":"allow","boundary":"[[0,0],[0,1],[1,1]]"}"#;
    let (status, created) =
        call(&site, Method::POST, "/api/owners/5/geofences", None, &admin, fence).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["version"], 1);

    let path = format!("/api/owners/5/geofences/{}", created["id"]);
    let (_, updated) =
        call(&site, Method::PATCH, &path, None, &admin, r#"{"name":"Back garden"}"#).await;
    assert_eq!(updated["version"], 2);

    let (_, sync) = call(
        &site,
        Method::GET,
        "/api/geofences/sync",
        Some("owner=5&since=1"),
        &HeaderMap::new(),
        Bytes::new(),
    )
    .await;
    assert_eq!(sync["fences"][0]["name"], "Back garden");

    let (status, _) = call(&site, Method::DELETE, &path, None, &admin, Bytes::new()).await;
    assert_eq!(status, StatusCode::OK);
    let (_, listed) = call(&site, Method::GET, "/api/owners/5/geofences", None, &admin, Bytes::new()).await;
    assert!(listed.as_array().unwrap().is_empty());
}
