//! Owner notifications: preferences, the request emitted by the engine, and
//! the rendered message handed to a transport

use crate::domain::types::{DoorSide, EventKind, OwnerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What the engine asks to be told to an owner. Rendering and preference
/// filtering happen later, in the notification worker.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub owner: OwnerId,
    pub kind: EventKind,
    /// Animal the event is about, when known
    pub subject_name: Option<String>,
    pub side: Option<DoorSide>,
    /// Free-form context, e.g. the geofence name
    pub note: Option<String>,
}

impl Notification {
    pub fn new(owner: OwnerId, kind: EventKind) -> Self {
        Self { owner, kind, subject_name: None, side: None, note: None }
    }

    pub fn with_subject(mut self, name: Option<String>) -> Self {
        self.subject_name = name;
        self
    }

    pub fn with_side(mut self, side: Option<DoorSide>) -> Self {
        self.side = side;
        self
    }

    pub fn with_note(mut self, note: Option<String>) -> Self {
        self.note = note;
        self
    }

    fn name_or(&self, fallback: &'static str) -> &str {
        self.subject_name.as_deref().unwrap_or(fallback)
    }

    fn zone_suffix(&self) -> String {
        match &self.note {
            Some(note) => format!(" Zone: {note}"),
            None => String::new(),
        }
    }

    pub fn subject(&self) -> String {
        match self.kind {
            EventKind::AccessGranted | EventKind::EntryGranted | EventKind::ExitGranted => {
                format!("Pet Door: {} used the door", self.name_or("Your pet"))
            }
            EventKind::AccessDenied => "Pet Door: Access denied".to_string(),
            EventKind::UnknownAnimal => "Pet Door: Unknown animal detected".to_string(),
            EventKind::GeofenceBreach => {
                format!("Collar: {} left a geofence!", self.name_or("Your pet"))
            }
            EventKind::GeofenceEntered => {
                format!("Collar: {} entered a geofence", self.name_or("Your pet"))
            }
            EventKind::GeofenceExited => {
                format!("Collar: {} left a geofence", self.name_or("Your pet"))
            }
        }
    }

    pub fn body(&self) -> String {
        let name = self.name_or("Your pet");
        match self.kind {
            EventKind::EntryGranted => format!("{name} entered through the pet door."),
            EventKind::ExitGranted => format!("{name} exited through the pet door."),
            EventKind::AccessGranted => match self.side {
                Some(side) => format!("{name} used the pet door ({}).", side.as_str()),
                None => format!("{name} used the pet door."),
            },
            EventKind::AccessDenied => match &self.note {
                Some(reason) => format!("The pet door refused entry: {reason}."),
                None => "The pet door refused entry.".to_string(),
            },
            EventKind::UnknownAnimal => format!(
                "An unrecognized animal was detected at the {} sensor.",
                self.side.map(|s| s.as_str()).unwrap_or("door")
            ),
            EventKind::GeofenceBreach => {
                format!("{name} has breached a geofence boundary.{}", self.zone_suffix())
            }
            EventKind::GeofenceEntered => {
                format!("{name} entered a geofence zone.{}", self.zone_suffix())
            }
            EventKind::GeofenceExited => {
                format!("{name} left a geofence zone.{}", self.zone_suffix())
            }
        }
    }
}

/// Per-owner opt-ins. An owner with no stored preferences receives nothing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationPreferences {
    pub owner: OwnerId,
    pub email_enabled: bool,
    pub sms_enabled: bool,
    pub animal_approach_inside: bool,
    pub animal_approach_outside: bool,
    pub unknown_animal_inside: bool,
    pub unknown_animal_outside: bool,
    pub access_denied: bool,
    pub geofence_breach: bool,
    pub geofence_entered_exited: bool,
}

impl NotificationPreferences {
    /// Whether the owner opted in to this kind of event from this side
    pub fn wants(&self, kind: EventKind, side: Option<DoorSide>) -> bool {
        match kind {
            EventKind::EntryGranted => self.animal_approach_outside,
            EventKind::ExitGranted => self.animal_approach_inside,
            EventKind::AccessGranted => match side {
                Some(DoorSide::Outside) => self.animal_approach_outside,
                Some(DoorSide::Inside) => self.animal_approach_inside,
                None => self.animal_approach_outside || self.animal_approach_inside,
            },
            EventKind::UnknownAnimal => match side {
                Some(DoorSide::Inside) => self.unknown_animal_inside,
                Some(DoorSide::Outside) => self.unknown_animal_outside,
                None => self.unknown_animal_inside || self.unknown_animal_outside,
            },
            EventKind::AccessDenied => self.access_denied,
            EventKind::GeofenceBreach => self.geofence_breach,
            EventKind::GeofenceEntered | EventKind::GeofenceExited => self.geofence_entered_exited,
        }
    }

    pub fn channels(&self) -> Vec<Channel> {
        let mut channels = Vec::with_capacity(2);
        if self.email_enabled {
            channels.push(Channel::Email);
        }
        if self.sms_enabled {
            channels.push(Channel::Sms);
        }
        channels
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Email,
    Sms,
}

/// Rendered message as published to the delivery transport
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundMessage {
    pub owner: OwnerId,
    pub kind: EventKind,
    pub channels: Vec<Channel>,
    pub subject: String,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub side: Option<DoorSide>,
    pub ts: DateTime<Utc>,
}

impl OutboundMessage {
    /// Render `notification` for `prefs`, or `None` when the owner opted out
    pub fn render(
        notification: &Notification,
        prefs: &NotificationPreferences,
        now: DateTime<Utc>,
    ) -> Option<Self> {
        if !prefs.wants(notification.kind, notification.side) {
            return None;
        }
        let channels = prefs.channels();
        if channels.is_empty() {
            return None;
        }
        Some(Self {
            owner: notification.owner,
            kind: notification.kind,
            channels,
            subject: notification.subject(),
            body: notification.body(),
            side: notification.side,
            ts: now,
        })
    }

    /// SMS text collapses subject and body
    pub fn sms_text(&self) -> String {
        format!("{}: {}", self.subject, self.body)
    }
}
