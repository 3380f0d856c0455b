//! Door admission pipeline
//!
//! One request runs these stages and stops at the first outcome:
//! 1. Resolve the door policy (by credential, or the single credential-less policy)
//! 2. Door enabled
//! 3. Outside the night window
//! 4. Save the frame and identify the animal (blocking pool)
//! 5. Confidence >= threshold and animal allowed
//!
//! Every request writes exactly one access event. Owners are notified of
//! every outcome except credential failures, which have no owner.

use crate::domain::door::{AccessEvent, DoorPolicy, DoorPolicyPatch};
use crate::domain::notification::Notification;
use crate::domain::types::{AnimalId, DoorSide, EventKind, OwnerId, TransitDirection};
use crate::infra::clock::Clock;
use crate::infra::metrics::Metrics;
use crate::infra::store::{EventLog, FingerprintStore, PolicyStore, StoreResult};
use crate::io::image_store::ImageStore;
use crate::services::error::EngineResult;
use crate::services::identity_matcher::{IdentityMatcher, Recognition};
use crate::services::notifier::Notifier;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

pub const REASON_INVALID_API_KEY: &str = "Invalid API key";
pub const REASON_API_KEY_REQUIRED: &str = "API key required";
pub const REASON_DOOR_DISABLED: &str = "Door is disabled";
pub const REASON_NIGHT_MODE: &str = "Night mode active";
pub const REASON_NOT_ALLOWED: &str = "Animal not allowed";
pub const REASON_NOT_RECOGNIZED: &str = "Animal not recognized";

/// Largest page the access log query will return
pub const MAX_PAGE_SIZE: usize = 100;

/// Outcome returned to the door
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccessDecision {
    pub granted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub animal_id: Option<AnimalId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub animal_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<TransitDirection>,
    /// Id of the access event written for this request
    pub event_id: u64,
}

/// Everything needed to write the event, notify and answer
struct Outcome {
    kind: EventKind,
    animal_id: Option<AnimalId>,
    animal_name: Option<String>,
    confidence: Option<f64>,
    image_path: Option<String>,
    reason: Option<&'static str>,
}

impl Outcome {
    fn denied(reason: &'static str) -> Self {
        Self {
            kind: EventKind::AccessDenied,
            animal_id: None,
            animal_name: None,
            confidence: None,
            image_path: None,
            reason: Some(reason),
        }
    }
}

enum Resolved {
    Policy(DoorPolicy),
    Denied(&'static str),
}

pub struct AdmissionEngine {
    policies: Arc<dyn PolicyStore>,
    events: Arc<dyn EventLog>,
    individuals: Arc<dyn FingerprintStore>,
    matcher: Arc<IdentityMatcher>,
    images: Arc<ImageStore>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
}

impl AdmissionEngine {
    pub fn new(
        policies: Arc<dyn PolicyStore>,
        events: Arc<dyn EventLog>,
        individuals: Arc<dyn FingerprintStore>,
        images: Arc<ImageStore>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let matcher = Arc::new(IdentityMatcher::new(individuals.clone()));
        Self { policies, events, individuals, matcher, images, notifier, clock, metrics }
    }

    /// Decide one door request
    pub async fn process_access(
        &self,
        image: Vec<u8>,
        api_key: Option<&str>,
        side: Option<DoorSide>,
    ) -> EngineResult<AccessDecision> {
        let policy = match self.resolve_policy(api_key)? {
            Resolved::Policy(policy) => policy,
            Resolved::Denied(reason) => {
                return self.finish(None, side, Outcome::denied(reason));
            }
        };
        let owner = policy.owner;

        if !policy.enabled {
            return self.finish(Some(owner), side, Outcome::denied(REASON_DOOR_DISABLED));
        }

        if let Some(window) = policy.night_window() {
            let now = self.clock.now().time();
            if window.contains(now) {
                debug!(owner = %owner, now = %now, "admission_night_window");
                return self.finish(Some(owner), side, Outcome::denied(REASON_NIGHT_MODE));
            }
        }

        let start = Instant::now();
        let images = self.images.clone();
        let matcher = self.matcher.clone();
        let (image_path, recognition) =
            tokio::task::spawn_blocking(move || -> EngineResult<(String, Recognition)> {
                let path = images.save(&image)?;
                let recognition = matcher.identify(&image, owner)?;
                Ok((path, recognition))
            })
            .await??;
        self.metrics.record_recognition_latency(start.elapsed().as_micros() as u64);

        let outcome = self.decide(&policy, recognition, image_path)?;
        self.finish(Some(owner), side, outcome)
    }

    fn resolve_policy(&self, api_key: Option<&str>) -> StoreResult<Resolved> {
        if let Some(key) = api_key {
            return Ok(match self.policies.policy_by_api_key(key)? {
                Some(policy) => Resolved::Policy(policy),
                None => Resolved::Denied(REASON_INVALID_API_KEY),
            });
        }

        let mut open = self.policies.policies_without_api_key()?;
        match open.len() {
            0 => Ok(Resolved::Denied(REASON_API_KEY_REQUIRED)),
            1 => Ok(open.pop().map_or(Resolved::Denied(REASON_API_KEY_REQUIRED), Resolved::Policy)),
            n => {
                // refusing beats guessing which owner's door this is
                warn!(candidates = n, "admission_ambiguous_keyless_policy");
                Ok(Resolved::Denied(REASON_API_KEY_REQUIRED))
            }
        }
    }

    fn decide(
        &self,
        policy: &DoorPolicy,
        recognition: Recognition,
        image_path: String,
    ) -> StoreResult<Outcome> {
        let confidence = Some(recognition.confidence);
        let image_path = Some(image_path);

        let matched = recognition
            .animal_id
            .filter(|_| recognition.confidence >= policy.min_confidence);
        let Some(animal_id) = matched else {
            return Ok(Outcome {
                kind: EventKind::UnknownAnimal,
                animal_id: None,
                animal_name: None,
                confidence,
                image_path,
                reason: Some(REASON_NOT_RECOGNIZED),
            });
        };

        let individual = self.individuals.individual(policy.owner, animal_id)?;
        match individual {
            Some(individual) if individual.is_allowed => Ok(Outcome {
                kind: EventKind::AccessGranted,
                animal_id: Some(animal_id),
                animal_name: Some(individual.name),
                confidence,
                image_path,
                reason: None,
            }),
            other => Ok(Outcome {
                kind: EventKind::AccessDenied,
                animal_id: Some(animal_id),
                animal_name: other.map(|i| i.name).or(recognition.name),
                confidence,
                image_path,
                reason: Some(REASON_NOT_ALLOWED),
            }),
        }
    }

    /// Write the event, notify, and build the answer
    fn finish(
        &self,
        owner: Option<OwnerId>,
        side: Option<DoorSide>,
        outcome: Outcome,
    ) -> EngineResult<AccessDecision> {
        let granted = outcome.reason.is_none();
        let kind = if granted { EventKind::granted_for(side) } else { outcome.kind };
        let direction = side.map(|s| s.direction());

        let event = self.events.append_access_event(AccessEvent {
            id: 0,
            owner,
            timestamp: self.clock.now(),
            kind,
            animal_id: outcome.animal_id,
            confidence: outcome.confidence,
            image_path: outcome.image_path,
            reason: outcome.reason.map(str::to_string),
            side,
            direction,
        })?;

        self.metrics
            .record_admission(granted, granted || outcome.reason != Some(REASON_NOT_RECOGNIZED));

        info!(
            owner = ?owner.map(|o| o.0),
            event = event.id,
            kind = kind.as_str(),
            animal = ?outcome.animal_id.map(|a| a.0),
            confidence = ?outcome.confidence,
            reason = outcome.reason.unwrap_or(""),
            side = side.map(|s| s.as_str()).unwrap_or(""),
            "admission_decided"
        );

        if let Some(owner) = owner {
            let note = if granted { None } else { outcome.reason.map(str::to_string) };
            self.notifier.notify(
                Notification::new(owner, kind)
                    .with_subject(outcome.animal_name.clone())
                    .with_side(side)
                    .with_note(note),
            );
        }

        Ok(AccessDecision {
            granted,
            animal_id: outcome.animal_id,
            animal_name: outcome.animal_name,
            confidence: outcome.confidence,
            reason: outcome.reason.map(str::to_string),
            direction,
            event_id: event.id,
        })
    }

    /// Owner's policy, created with defaults on first read
    pub fn get_policy(&self, owner: OwnerId) -> StoreResult<DoorPolicy> {
        self.policies.policy_or_default(owner, self.clock.now())
    }

    pub fn update_policy(&self, owner: OwnerId, patch: &DoorPolicyPatch) -> StoreResult<DoorPolicy> {
        let policy = self.policies.update_policy(owner, patch, self.clock.now())?;
        info!(
            owner = %owner,
            enabled = policy.enabled,
            min_confidence = policy.min_confidence,
            night_mode = policy.night_mode_enabled,
            "door_policy_updated"
        );
        Ok(policy)
    }

    /// Newest-first page of the owner's access log. Pages start at 1.
    pub fn access_log(
        &self,
        owner: OwnerId,
        page: usize,
        page_size: usize,
        kind: Option<EventKind>,
    ) -> StoreResult<Vec<AccessEvent>> {
        let page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        let skip = page.max(1).saturating_sub(1).saturating_mul(page_size);
        Ok(self
            .events
            .access_events(owner)?
            .into_iter()
            .filter(|e| kind.map_or(true, |k| e.kind == k))
            .skip(skip)
            .take(page_size)
            .collect())
    }

    pub fn access_event(&self, owner: OwnerId, id: u64) -> StoreResult<Option<AccessEvent>> {
        Ok(self.events.access_events(owner)?.into_iter().find(|e| e.id == id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::Individual;
    use crate::infra::clock::FixedClock;
    use crate::infra::memory_store::MemoryStore;
    use crate::services::fingerprint;
    use crate::services::notifier::RecordingNotifier;
    use chrono::{DateTime, NaiveTime, TimeZone, Utc};
    use image::{ImageBuffer, ImageFormat, Luma};
    use std::io::Cursor;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: Arc<MemoryStore>,
        notifier: Arc<RecordingNotifier>,
        clock: Arc<FixedClock>,
        engine: AdmissionEngine,
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let clock = Arc::new(FixedClock::new(noon()));
        let engine = AdmissionEngine::new(
            store.clone(),
            store.clone(),
            store.clone(),
            Arc::new(ImageStore::new(dir.path())),
            notifier.clone(),
            clock.clone(),
            Arc::new(Metrics::new()),
        );
        Fixture { _dir: dir, store, notifier, clock, engine }
    }

    fn frame() -> Vec<u8> {
        let img = ImageBuffer::from_fn(64, 64, |x, _| Luma([255 - (x * 4) as u8]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    fn enroll(f: &Fixture, owner: OwnerId, animal: AnimalId, name: &str, allowed: bool) {
        f.store.put_individual(Individual { id: animal, owner, name: name.to_string(), is_allowed: allowed });
        f.store.add_fingerprint(owner, animal, &fingerprint::compute(&frame()));
    }

    fn keyed_policy(f: &Fixture, owner: OwnerId, key: &str) {
        let mut policy = DoorPolicy::with_defaults(owner, noon());
        policy.api_key = Some(key.to_string());
        f.store.put_policy(policy);
    }

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[tokio::test]
    async fn test_invalid_key_logged_without_owner() {
        let f = fixture();
        keyed_policy(&f, OwnerId(1), "secret");

        let decision = f.engine.process_access(frame(), Some("wrong"), None).await.unwrap();
        assert!(!decision.granted);
        assert_eq!(decision.reason.as_deref(), Some(REASON_INVALID_API_KEY));
        assert!(f.notifier.sent().is_empty());
        assert!(f.engine.access_log(OwnerId(1), 1, 10, None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_keyless_needs_exactly_one_open_policy() {
        let f = fixture();
        let decision = f.engine.process_access(frame(), None, None).await.unwrap();
        assert_eq!(decision.reason.as_deref(), Some(REASON_API_KEY_REQUIRED));

        f.store.put_policy(DoorPolicy::with_defaults(OwnerId(1), noon()));
        enroll(&f, OwnerId(1), AnimalId(1), "Buddy", true);
        let decision = f.engine.process_access(frame(), None, None).await.unwrap();
        assert!(decision.granted);
        assert_eq!(decision.direction, None);

        f.store.put_policy(DoorPolicy::with_defaults(OwnerId(2), noon()));
        let decision = f.engine.process_access(frame(), None, None).await.unwrap();
        assert_eq!(decision.reason.as_deref(), Some(REASON_API_KEY_REQUIRED));
    }

    #[tokio::test]
    async fn test_granted_entry_from_outside() {
        let f = fixture();
        keyed_policy(&f, OwnerId(1), "k1");
        enroll(&f, OwnerId(1), AnimalId(7), "Buddy", true);

        let decision =
            f.engine.process_access(frame(), Some("k1"), Some(DoorSide::Outside)).await.unwrap();
        assert!(decision.granted);
        assert_eq!(decision.animal_id, Some(AnimalId(7)));
        assert_eq!(decision.confidence, Some(1.0));
        assert_eq!(decision.direction, Some(TransitDirection::Entering));

        let log = f.engine.access_log(OwnerId(1), 1, 10, None).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].kind, EventKind::EntryGranted);
        assert!(log[0].image_path.is_some());

        let sent = f.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, EventKind::EntryGranted);
        assert_eq!(sent[0].subject_name.as_deref(), Some("Buddy"));
    }

    #[tokio::test]
    async fn test_disallowed_animal_reports_confidence() {
        let f = fixture();
        keyed_policy(&f, OwnerId(1), "k1");
        enroll(&f, OwnerId(1), AnimalId(7), "Rex", false);

        let decision =
            f.engine.process_access(frame(), Some("k1"), Some(DoorSide::Inside)).await.unwrap();
        assert!(!decision.granted);
        assert_eq!(decision.reason.as_deref(), Some(REASON_NOT_ALLOWED));
        assert_eq!(decision.confidence, Some(1.0));
        assert_eq!(decision.animal_id, Some(AnimalId(7)));

        let event = f.engine.access_event(OwnerId(1), decision.event_id).unwrap().unwrap();
        assert_eq!(event.kind, EventKind::AccessDenied);
        assert_eq!(event.direction, Some(TransitDirection::Exiting));
    }

    #[tokio::test]
    async fn test_threshold_is_inclusive() {
        let f = fixture();
        let mut policy = DoorPolicy::with_defaults(OwnerId(1), noon());
        policy.api_key = Some("k1".to_string());
        policy.min_confidence = 1.0;
        f.store.put_policy(policy);
        enroll(&f, OwnerId(1), AnimalId(7), "Buddy", true);

        let decision = f.engine.process_access(frame(), Some("k1"), None).await.unwrap();
        assert!(decision.granted);
    }

    #[tokio::test]
    async fn test_below_threshold_is_unknown_animal() {
        let f = fixture();
        keyed_policy(&f, OwnerId(1), "k1");
        f.store.put_individual(Individual {
            id: AnimalId(7),
            owner: OwnerId(1),
            name: "Buddy".to_string(),
            is_allowed: true,
        });
        f.store.add_fingerprint(OwnerId(1), AnimalId(7), "ffffffff00000000");

        let decision =
            f.engine.process_access(frame(), Some("k1"), Some(DoorSide::Outside)).await.unwrap();
        assert_eq!(decision.reason.as_deref(), Some(REASON_NOT_RECOGNIZED));
        assert_eq!(decision.confidence, Some(0.5));
        assert_eq!(decision.animal_id, None);

        let log = f.engine.access_log(OwnerId(1), 1, 10, Some(EventKind::UnknownAnimal)).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(f.notifier.sent()[0].side, Some(DoorSide::Outside));
    }

    #[tokio::test]
    async fn test_disabled_door_skips_matcher() {
        let f = fixture();
        let mut policy = DoorPolicy::with_defaults(OwnerId(1), noon());
        policy.api_key = Some("k1".to_string());
        policy.enabled = false;
        f.store.put_policy(policy);
        enroll(&f, OwnerId(1), AnimalId(7), "Buddy", true);

        let decision = f.engine.process_access(frame(), Some("k1"), None).await.unwrap();
        assert_eq!(decision.reason.as_deref(), Some(REASON_DOOR_DISABLED));
        assert_eq!(decision.confidence, None);

        let log = f.engine.access_log(OwnerId(1), 1, 10, None).unwrap();
        assert_eq!(log.len(), 1);
        assert!(log[0].image_path.is_none());
        assert_eq!(f.notifier.sent()[0].note.as_deref(), Some(REASON_DOOR_DISABLED));
    }

    #[tokio::test]
    async fn test_night_window_follows_clock() {
        let f = fixture();
        let mut policy = DoorPolicy::with_defaults(OwnerId(1), noon());
        policy.api_key = Some("k1".to_string());
        policy.night_mode_enabled = true;
        policy.night_start = Some(t(22, 0));
        policy.night_end = Some(t(6, 0));
        f.store.put_policy(policy);
        enroll(&f, OwnerId(1), AnimalId(7), "Buddy", true);

        assert!(f.engine.process_access(frame(), Some("k1"), None).await.unwrap().granted);

        f.clock.set(Utc.with_ymd_and_hms(2024, 5, 1, 23, 0, 0).unwrap());
        let late = f.engine.process_access(frame(), Some("k1"), None).await.unwrap();
        assert_eq!(late.reason.as_deref(), Some(REASON_NIGHT_MODE));

        f.clock.set(Utc.with_ymd_and_hms(2024, 5, 2, 2, 0, 0).unwrap());
        let early = f.engine.process_access(frame(), Some("k1"), None).await.unwrap();
        assert_eq!(early.reason.as_deref(), Some(REASON_NIGHT_MODE));
    }

    #[tokio::test]
    async fn test_access_log_paging() {
        let f = fixture();
        keyed_policy(&f, OwnerId(1), "k1");
        for _ in 0..5 {
            f.engine.process_access(b"junk".to_vec(), Some("k1"), None).await.unwrap();
        }

        let first = f.engine.access_log(OwnerId(1), 1, 2, None).unwrap();
        let third = f.engine.access_log(OwnerId(1), 3, 2, None).unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(third.len(), 1);
        assert!(first[0].id > first[1].id);
        assert_eq!(f.engine.access_log(OwnerId(1), 0, 2, None).unwrap(), first);
    }

    #[test]
    fn test_policy_defaults_and_update() {
        let f = fixture();
        let policy = f.engine.get_policy(OwnerId(9)).unwrap();
        assert!(policy.enabled);
        assert_eq!(policy.min_confidence, 0.7);
        assert_eq!(policy.auto_close_delay_secs, 10);

        let patch = DoorPolicyPatch { night_mode_enabled: Some(true), ..Default::default() };
        let updated = f.engine.update_policy(OwnerId(9), &patch).unwrap();
        assert!(updated.night_mode_enabled);
        assert!(updated.enabled);
    }
}
