//! Append-only event journal
//!
//! Access decisions and geofence crossings are written as JSONL, one record
//! per line, tagged by `type`. Every append is written and flushed before it
//! returns. Ids continue from the highest id already in the file, and
//! listings read the file back. A torn final line left by a crash is
//! terminated before the next append so it cannot swallow a new record.

use crate::domain::door::AccessEvent;
use crate::domain::geofence::GeofenceEvent;
use crate::domain::types::{GeofenceId, OwnerId};
use crate::infra::store::{EventLog, IdFloor, StoreError, StoreResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum JournalRecord {
    Access(AccessEvent),
    Geofence(GeofenceEvent),
}

/// Write side of [`JournalRecord`]; same wire shape, borrowed
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum JournalEntry<'a> {
    Access(&'a AccessEvent),
    Geofence(&'a GeofenceEvent),
}

struct Cursor {
    next_access_id: u64,
    next_geofence_id: u64,
    /// File does not end in a newline
    torn_tail: bool,
}

pub struct EventJournal {
    path: PathBuf,
    floor: IdFloor,
    /// Serialises appends so ids and line order agree
    cursor: Mutex<Cursor>,
}

impl EventJournal {
    /// Open (or create on first append) the journal at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut cursor = Cursor {
            next_access_id: 1,
            next_geofence_id: 1,
            torn_tail: ends_mid_line(&path)?,
        };
        let mut floor = IdFloor::default();

        for record in read_records(&path)? {
            match record {
                JournalRecord::Access(e) => {
                    cursor.next_access_id = cursor.next_access_id.max(e.id + 1)
                }
                JournalRecord::Geofence(e) => {
                    cursor.next_geofence_id = cursor.next_geofence_id.max(e.id + 1);
                    floor.device = floor.device.max(e.device_id.0);
                    floor.geofence = floor.geofence.max(e.policy_id.0);
                }
            }
        }
        if cursor.torn_tail {
            warn!(file = %path.display(), "journal_torn_tail");
        }

        info!(
            file = %path.display(),
            next_access_id = cursor.next_access_id,
            next_geofence_id = cursor.next_geofence_id,
            "event_journal_opened"
        );
        Ok(Self { path, floor, cursor: Mutex::new(cursor) })
    }

    /// Highest device and geofence ids referenced by stored crossings.
    /// A fresh directory must allocate above these.
    pub fn id_floor(&self) -> IdFloor {
        self.floor
    }

    fn append_lines(&self, cursor: &mut Cursor, lines: &[String]) -> StoreResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        // whole batch in a single write
        let mut buf = String::new();
        if cursor.torn_tail {
            buf.push('\n');
        }
        for line in lines {
            buf.push_str(line);
            buf.push('\n');
        }
        file.write_all(buf.as_bytes())?;
        file.flush()?;
        cursor.torn_tail = false;

        debug!(file = %self.path.display(), records = lines.len(), "journal_written");
        Ok(())
    }
}

fn encode(entry: &JournalEntry<'_>) -> StoreResult<String> {
    serde_json::to_string(entry).map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn ends_mid_line(path: &Path) -> StoreResult<bool> {
    let mut file = match fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    if file.metadata()?.len() == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

fn read_records(path: &Path) -> StoreResult<Vec<JournalRecord>> {
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut records = Vec::new();
    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(record) => records.push(record),
            Err(e) => {
                // A torn final line after a crash is skipped, not fatal
                warn!(file = %path.display(), line = lineno + 1, error = %e, "journal_line_skipped");
            }
        }
    }
    Ok(records)
}

impl EventLog for EventJournal {
    fn append_access_event(&self, mut event: AccessEvent) -> StoreResult<AccessEvent> {
        let mut cursor = self.cursor.lock();
        event.id = cursor.next_access_id;
        self.append_lines(&mut cursor, &[encode(&JournalEntry::Access(&event))?])?;
        cursor.next_access_id += 1;
        Ok(event)
    }

    fn append_geofence_events(&self, events: Vec<GeofenceEvent>) -> StoreResult<usize> {
        if events.is_empty() {
            return Ok(0);
        }

        let mut cursor = self.cursor.lock();
        let mut next_id = cursor.next_geofence_id;
        let mut lines = Vec::with_capacity(events.len());
        for mut event in events {
            event.id = next_id;
            next_id += 1;
            lines.push(encode(&JournalEntry::Geofence(&event))?);
        }

        self.append_lines(&mut cursor, &lines)?;
        cursor.next_geofence_id = next_id;
        Ok(lines.len())
    }

    fn access_events(&self, owner: OwnerId) -> StoreResult<Vec<AccessEvent>> {
        let _guard = self.cursor.lock();
        let mut events: Vec<AccessEvent> = read_records(&self.path)?
            .into_iter()
            .filter_map(|r| match r {
                JournalRecord::Access(e) if e.owner == Some(owner) => Some(e),
                _ => None,
            })
            .collect();
        events.reverse();
        Ok(events)
    }

    fn geofence_events(&self, fences: &[GeofenceId]) -> StoreResult<Vec<GeofenceEvent>> {
        let _guard = self.cursor.lock();
        let mut events: Vec<GeofenceEvent> = read_records(&self.path)?
            .into_iter()
            .filter_map(|r| match r {
                JournalRecord::Geofence(e) if fences.contains(&e.policy_id) => Some(e),
                _ => None,
            })
            .collect();
        events.reverse();
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::geofence::CrossingKind;
    use crate::domain::types::{DeviceId, EventKind};
    use chrono::Utc;
    use tempfile::tempdir;

    fn access(owner: i64) -> AccessEvent {
        AccessEvent {
            id: 0,
            owner: Some(OwnerId(owner)),
            timestamp: Utc::now(),
            kind: EventKind::UnknownAnimal,
            animal_id: None,
            confidence: Some(0.4),
            image_path: None,
            reason: Some("Animal not recognized".to_string()),
            side: None,
            direction: None,
        }
    }

    fn crossing(fence: i64) -> GeofenceEvent {
        GeofenceEvent {
            id: 0,
            policy_id: GeofenceId(fence),
            device_id: DeviceId(1),
            kind: CrossingKind::Breach,
            latitude: 59.3,
            longitude: 18.0,
            timestamp: Utc::now(),
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn test_append_and_list_newest_first() {
        let dir = tempdir().unwrap();
        let journal = EventJournal::open(dir.path().join("nested/events.jsonl")).unwrap();

        let first = journal.append_access_event(access(1)).unwrap();
        let second = journal.append_access_event(access(1)).unwrap();
        journal.append_access_event(access(2)).unwrap();

        assert_eq!((first.id, second.id), (1, 2));
        let listed = journal.access_events(OwnerId(1)).unwrap();
        assert_eq!(listed.iter().map(|e| e.id).collect::<Vec<_>>(), vec![2, 1]);
    }

    #[test]
    fn test_ids_continue_after_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        {
            let journal = EventJournal::open(&path).unwrap();
            journal.append_access_event(access(1)).unwrap();
            journal.append_geofence_events(vec![crossing(3), crossing(4)]).unwrap();
        }

        let journal = EventJournal::open(&path).unwrap();
        assert_eq!(journal.append_access_event(access(1)).unwrap().id, 2);
        journal.append_geofence_events(vec![crossing(3)]).unwrap();

        let fence_three = journal.geofence_events(&[GeofenceId(3)]).unwrap();
        assert_eq!(fence_three.iter().map(|e| e.id).collect::<Vec<_>>(), vec![3, 1]);
    }

    #[test]
    fn test_torn_line_is_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let journal = EventJournal::open(&path).unwrap();
        journal.append_access_event(access(1)).unwrap();

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        write!(file, "{{\"type\":\"access\",\"id\":").unwrap();
        drop(file);

        let reopened = EventJournal::open(&path).unwrap();
        assert_eq!(reopened.access_events(OwnerId(1)).unwrap().len(), 1);

        // the next append lands on its own line
        let next = reopened.append_access_event(access(1)).unwrap();
        assert_eq!(next.id, 2);
        let listed = reopened.access_events(OwnerId(1)).unwrap();
        assert_eq!(listed.iter().map(|e| e.id).collect::<Vec<_>>(), vec![2, 1]);

        let again = EventJournal::open(&path).unwrap();
        assert_eq!(again.access_events(OwnerId(1)).unwrap().len(), 2);
    }

    #[test]
    fn test_id_floor_from_crossings() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        {
            let journal = EventJournal::open(&path).unwrap();
            journal.append_geofence_events(vec![crossing(3), crossing(7)]).unwrap();
        }

        let floor = EventJournal::open(&path).unwrap().id_floor();
        assert_eq!(floor, IdFloor { device: 1, geofence: 7 });
        assert_eq!(EventJournal::open(dir.path().join("empty.jsonl")).unwrap().id_floor(), IdFloor::default());
    }
}
