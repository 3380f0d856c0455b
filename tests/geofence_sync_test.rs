//! Geofence versioning, incremental sync and crossing uploads

use chrono::{TimeZone, Utc};
use petgate::domain::geofence::{
    AlertPattern, CrossingInput, CrossingKind, FenceRule, FenceShape, GeofencePatch, NewGeofence,
};
use petgate::domain::types::{AnimalId, EventKind, GeofenceId, Individual, OwnerId};
use petgate::infra::{FixedClock, MemoryStore, Metrics};
use petgate::io::EventJournal;
use petgate::services::geofence_sync::EventQuery;
use petgate::services::notifier::RecordingNotifier;
use petgate::services::{DeviceTrustVerifier, GeofencePolicySync};
use std::sync::Arc;
use tempfile::TempDir;

const OWNER: OwnerId = OwnerId(7);

struct Yard {
    _dir: TempDir,
    store: Arc<MemoryStore>,
    notifier: Arc<RecordingNotifier>,
    trust: DeviceTrustVerifier,
    sync: Arc<GeofencePolicySync>,
}

fn yard() -> Yard {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let journal = Arc::new(EventJournal::open(dir.path().join("events.jsonl")).unwrap());
    let notifier = Arc::new(RecordingNotifier::new());
    let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()));
    let metrics = Arc::new(Metrics::new());

    let trust =
        DeviceTrustVerifier::new(store.clone(), store.clone(), clock.clone(), metrics.clone(), 30);
    let sync = Arc::new(GeofencePolicySync::new(
        store.clone(),
        store.clone(),
        store.clone(),
        journal,
        notifier.clone(),
        clock,
        metrics,
    ));
    Yard { _dir: dir, store, notifier, trust, sync }
}

fn fence(name: &str) -> NewGeofence {
    NewGeofence {
        name: name.to_string(),
        shape: FenceShape::Polygon,
        rule: FenceRule::Allow,
        boundary: r#"[[59.0,18.0],[59.1,18.0],[59.1,18.1]]"#.to_string(),
        alert: AlertPattern::Long,
    }
}

fn crossing(fence: GeofenceId, kind: CrossingKind, ts: i64) -> CrossingInput {
    CrossingInput { fence_id: fence, kind, lat: 59.05, lng: 18.05, ts }
}

#[test]
fn version_counts_every_update() {
    let y = yard();
    let garden = y.sync.create(OWNER, &fence("Garden")).unwrap();
    assert_eq!(garden.version, 1);

    for _ in 0..3 {
        y.sync.update(OWNER, garden.id, &GeofencePatch::default()).unwrap();
    }
    assert_eq!(y.sync.get(OWNER, garden.id).unwrap().unwrap().version, 4);
}

#[test]
fn sync_resumes_from_cursor() {
    let y = yard();
    let garden = y.sync.create(OWNER, &fence("Garden")).unwrap();
    let field = y.sync.create(OWNER, &fence("Field")).unwrap();
    y.sync.create(OwnerId(99), &fence("Elsewhere")).unwrap();

    let first = y.sync.sync(OWNER, 0).unwrap();
    assert_eq!(first.version, 1);
    assert_eq!(first.fences.iter().map(|f| f.id).collect::<Vec<_>>(), vec![garden.id, field.id]);

    // nothing new: cursor comes back unchanged
    let idle = y.sync.sync(OWNER, first.version).unwrap();
    assert!(idle.fences.is_empty());
    assert_eq!(idle.version, first.version);

    let patch = GeofencePatch { name: Some("Big field".to_string()), ..Default::default() };
    y.sync.update(OWNER, field.id, &patch).unwrap();
    let next = y.sync.sync(OWNER, first.version).unwrap();
    assert_eq!(next.version, 2);
    assert_eq!(next.fences.len(), 1);
    assert_eq!(next.fences[0].name, "Big field");
    assert!(next.fences.iter().all(|f| f.version > first.version));
}

#[test]
fn deactivated_fence_drops_out_of_sync() {
    let y = yard();
    let garden = y.sync.create(OWNER, &fence("Garden")).unwrap();
    let patch = GeofencePatch { is_active: Some(false), ..Default::default() };
    y.sync.update(OWNER, garden.id, &patch).unwrap();

    assert!(y.sync.sync(OWNER, 0).unwrap().fences.is_empty());
    assert_eq!(y.sync.list(OWNER).unwrap().len(), 1);
}

#[test]
fn breach_notifies_with_fence_name() {
    let y = yard();
    y.store.put_individual(Individual {
        id: AnimalId(3),
        owner: OWNER,
        name: "Buddy".to_string(),
        is_allowed: true,
    });
    let pairing = y.trust.register_device(OWNER, "Collar", Some(AnimalId(3))).unwrap();
    let garden = y.sync.create(OWNER, &fence("Garden")).unwrap();

    let stored = y
        .sync
        .record_events(
            &pairing.external_id,
            &[
                crossing(garden.id, CrossingKind::Exited, 1_717_243_000),
                crossing(garden.id, CrossingKind::Breach, 1_717_243_060),
                crossing(garden.id, CrossingKind::Entered, 1_717_243_120),
            ],
        )
        .unwrap();
    assert_eq!(stored, 3);

    let sent = y.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind, EventKind::GeofenceBreach);
    assert_eq!(sent[0].subject_name.as_deref(), Some("Buddy"));
    assert_eq!(sent[0].note.as_deref(), Some("Garden"));

    let events = y.sync.events(OWNER, &EventQuery::default()).unwrap();
    assert_eq!(events.len(), 3);
    assert_eq!(events[0].kind, CrossingKind::Entered);
}

#[test]
fn unknown_device_and_foreign_fence_store_nothing() {
    let y = yard();
    let theirs = y.sync.create(OwnerId(99), &fence("Not yours")).unwrap();
    let pairing = y.trust.register_device(OWNER, "Collar", None).unwrap();

    let from_nobody = y
        .sync
        .record_events("feedface", &[crossing(theirs.id, CrossingKind::Breach, 1_717_243_000)])
        .unwrap();
    let foreign = y
        .sync
        .record_events(
            &pairing.external_id,
            &[crossing(theirs.id, CrossingKind::Breach, 1_717_243_000)],
        )
        .unwrap();

    assert_eq!(from_nobody, 0);
    assert_eq!(foreign, 0);
    assert!(y.notifier.sent().is_empty());
    assert!(y.sync.events(OwnerId(99), &EventQuery::default()).unwrap().is_empty());
}

#[test]
fn concurrent_updates_never_lose_versions() {
    let y = yard();
    let garden = y.sync.create(OWNER, &fence("Garden")).unwrap();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let sync = y.sync.clone();
            std::thread::spawn(move || {
                for _ in 0..50 {
                    sync.update(OWNER, garden.id, &GeofencePatch::default()).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(y.sync.get(OWNER, garden.id).unwrap().unwrap().version, 1 + 4 * 50);
}

#[test]
fn recreated_fence_does_not_inherit_crossings() {
    let y = yard();
    let pairing = y.trust.register_device(OWNER, "Collar", None).unwrap();
    let garden = y.sync.create(OWNER, &fence("Garden")).unwrap();
    y.sync
        .record_events(&pairing.external_id, &[crossing(garden.id, CrossingKind::Exited, 1_717_243_000)])
        .unwrap();
    assert!(y.sync.delete(OWNER, garden.id).unwrap());

    let theirs = y.sync.create(OwnerId(99), &fence("Meadow")).unwrap();
    assert_ne!(theirs.id, garden.id);
    assert!(y.sync.events(OwnerId(99), &EventQuery::default()).unwrap().is_empty());
}

#[test]
fn restart_allocates_above_journaled_ids() {
    let y = yard();
    let pairing = y.trust.register_device(OWNER, "Collar", None).unwrap();
    let garden = y.sync.create(OWNER, &fence("Garden")).unwrap();
    y.sync
        .record_events(&pairing.external_id, &[crossing(garden.id, CrossingKind::Exited, 1_717_243_000)])
        .unwrap();

    // the tables are gone after a restart but the journal is not
    let journal = Arc::new(EventJournal::open(y._dir.path().join("events.jsonl")).unwrap());
    let store = Arc::new(MemoryStore::new().with_id_floor(journal.id_floor()));
    let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 6, 2, 12, 0, 0).unwrap()));
    let metrics = Arc::new(Metrics::new());
    let trust =
        DeviceTrustVerifier::new(store.clone(), store.clone(), clock.clone(), metrics.clone(), 30);
    let sync = GeofencePolicySync::new(
        store.clone(),
        store.clone(),
        store.clone(),
        journal,
        Arc::new(RecordingNotifier::new()),
        clock,
        metrics,
    );

    let meadow = sync.create(OwnerId(99), &fence("Meadow")).unwrap();
    let collar = trust.register_device(OwnerId(99), "Other collar", None).unwrap();
    assert!(meadow.id > garden.id);
    assert!(collar.id > pairing.id);
    assert!(sync.events(OwnerId(99), &EventQuery::default()).unwrap().is_empty());
}
