//! Event storage: loads a tabular event source, drops malformed rows and
//! keeps only users whose earliest event is a signup.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Read;
use std::path::Path;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{AnalyticsError, Result, RowParseError};
use crate::models::{Event, SIGNUP};

const REQUIRED_COLUMNS: [&str; 3] = ["user_id", "event_type", "timestamp"];

/// Dropped rows beyond this count are only logged at debug level.
const WARN_LIMIT: u64 = 5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadStats {
    pub rows_read: u64,
    pub rows_dropped: u64,
    pub users_seen: usize,
    pub users_excluded: usize,
}

/// The cleaned event set. Built once and read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct EventStore {
    events: Vec<Event>,
    stats: LoadStats,
}

impl EventStore {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let reader = csv::Reader::from_path(path).map_err(|source| AnalyticsError::DataLoad {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_csv(reader, &path.display().to_string())
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        Self::from_csv(csv::Reader::from_reader(reader), "<memory>")
    }

    fn from_csv<R: Read>(mut reader: csv::Reader<R>, label: &str) -> Result<Self> {
        let headers = reader
            .headers()
            .map_err(|source| AnalyticsError::DataLoad {
                path: label.to_string(),
                source,
            })?
            .clone();

        let mut index = [0usize; 3];
        for (slot, column) in index.iter_mut().zip(REQUIRED_COLUMNS) {
            *slot = headers
                .iter()
                .position(|h| h.trim() == column)
                .ok_or(AnalyticsError::MissingColumn(column))?;
        }

        let mut events = Vec::new();
        let mut rows_read = 0u64;
        let mut rows_dropped = 0u64;

        for (n, result) in reader.records().enumerate() {
            rows_read += 1;
            let line = n as u64 + 2;
            let parsed = match result {
                Ok(record) => parse_record(&record, index, line),
                Err(err) if err.is_io_error() => {
                    return Err(AnalyticsError::DataLoad {
                        path: label.to_string(),
                        source: err,
                    });
                }
                Err(err) => Err(RowParseError::Malformed {
                    line,
                    reason: err.to_string(),
                }),
            };

            match parsed {
                Ok(event) => events.push(event),
                Err(err) => {
                    rows_dropped += 1;
                    if rows_dropped <= WARN_LIMIT {
                        warn!(source = label, "dropping row: {}", err);
                    } else {
                        debug!(source = label, "dropping row: {}", err);
                    }
                }
            }
        }

        let mut store = Self::from_events(events);
        store.stats.rows_read = rows_read;
        store.stats.rows_dropped = rows_dropped;
        info!(
            source = label,
            rows = rows_read,
            dropped = rows_dropped,
            users = store.user_count(),
            excluded_users = store.stats.users_excluded,
            "loaded event source"
        );
        Ok(store)
    }

    pub fn from_events(events: Vec<Event>) -> Self {
        let rows_read = events.len() as u64;
        // earliest event per user; ties keep the first occurrence
        let mut first: HashMap<&str, (NaiveDateTime, &str)> = HashMap::new();
        for event in &events {
            first
                .entry(event.user_id.as_str())
                .and_modify(|slot| {
                    if event.timestamp < slot.0 {
                        *slot = (event.timestamp, event.event_type.as_str());
                    }
                })
                .or_insert((event.timestamp, event.event_type.as_str()));
        }

        let admitted: HashSet<String> = first
            .iter()
            .filter(|(_, (_, event_type))| *event_type == SIGNUP)
            .map(|(user, _)| user.to_string())
            .collect();
        let users_seen = first.len();

        let events: Vec<Event> = events
            .into_iter()
            .filter(|e| admitted.contains(&e.user_id))
            .collect();

        Self {
            stats: LoadStats {
                rows_read,
                rows_dropped: 0,
                users_seen,
                users_excluded: users_seen - admitted.len(),
            },
            events,
        }
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn stats(&self) -> &LoadStats {
        &self.stats
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Distinct user ids in order of first appearance.
    pub fn user_ids(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.events
            .iter()
            .map(|e| e.user_id.as_str())
            .filter(|id| seen.insert(*id))
            .collect()
    }

    pub fn user_count(&self) -> usize {
        self.view().distinct_users()
    }

    pub fn view(&self) -> EventSet<'_> {
        EventSet {
            events: self.events.iter().collect(),
        }
    }

    pub fn filter_by_type(&self, types: &[&str]) -> EventSet<'_> {
        self.view().filter_by_type(types)
    }

    pub fn group_count_distinct_users<K, F>(&self, key: F) -> BTreeMap<K, usize>
    where
        K: Ord,
        F: Fn(&Event) -> K,
    {
        self.view().group_count_distinct_users(key)
    }
}

#[derive(Debug, Clone)]
pub struct EventSet<'a> {
    events: Vec<&'a Event>,
}

impl<'a> EventSet<'a> {
    pub fn iter(&self) -> impl Iterator<Item = &'a Event> + '_ {
        self.events.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn filter_by_type(&self, types: &[&str]) -> EventSet<'a> {
        EventSet {
            events: self
                .events
                .iter()
                .copied()
                .filter(|e| types.contains(&e.event_type.as_str()))
                .collect(),
        }
    }

    pub fn distinct_users(&self) -> usize {
        self.events
            .iter()
            .map(|e| e.user_id.as_str())
            .collect::<HashSet<_>>()
            .len()
    }

    /// Distinct users per key, keys in ascending order.
    pub fn group_count_distinct_users<K, F>(&self, key: F) -> BTreeMap<K, usize>
    where
        K: Ord,
        F: Fn(&Event) -> K,
    {
        let mut groups: BTreeMap<K, HashSet<&str>> = BTreeMap::new();
        for event in self.events.iter().copied() {
            groups
                .entry(key(event))
                .or_default()
                .insert(event.user_id.as_str());
        }
        groups
            .into_iter()
            .map(|(k, users)| (k, users.len()))
            .collect()
    }
}

fn parse_record(
    record: &csv::StringRecord,
    index: [usize; 3],
    line: u64,
) -> std::result::Result<Event, RowParseError> {
    let field = |i: usize| record.get(index[i]).map(str::trim).unwrap_or("");

    let user_id = field(0);
    if user_id.is_empty() {
        return Err(RowParseError::MissingUserId { line });
    }
    let event_type = field(1);
    if event_type.is_empty() {
        return Err(RowParseError::MissingEventType { line });
    }
    let raw = field(2);
    let timestamp = parse_timestamp(raw).ok_or_else(|| RowParseError::BadTimestamp {
        line,
        value: raw.to_string(),
    })?;

    Ok(Event::new(user_id, event_type, timestamp))
}

/// Parse the timestamp formats an event source is expected to carry.
pub fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.naive_local());
    }
    for format in [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
    ] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, format) {
            return Some(dt);
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .map(|d| d.and_time(NaiveTime::MIN))
}
