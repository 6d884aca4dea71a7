//! Signup-date alignment, cohort tables and retention curves.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;

use crate::models::{ratio, round2, Event, SIGNUP};
use crate::store::EventStore;

pub const DEFAULT_RETENTION_OFFSETS: [i64; 3] = [1, 7, 30];

/// First signup date per user. Ties on the timestamp keep the first
/// occurrence in input order.
pub fn signup_dates(events: &[Event]) -> HashMap<&str, NaiveDate> {
    let mut first: HashMap<&str, NaiveDateTime> = HashMap::new();
    for event in events.iter().filter(|e| e.is(SIGNUP)) {
        first
            .entry(event.user_id.as_str())
            .and_modify(|ts| {
                if event.timestamp < *ts {
                    *ts = event.timestamp;
                }
            })
            .or_insert(event.timestamp);
    }
    first
        .into_iter()
        .map(|(user, ts)| (user, ts.date()))
        .collect()
}

/// Whole days between signup and the event. Undefined without a signup or
/// when the event precedes it.
pub fn day_offset(event: &Event, signup: Option<NaiveDate>) -> Option<i64> {
    let offset = (event.date() - signup?).num_days();
    (offset >= 0).then_some(offset)
}

#[derive(Debug, Clone, Copy)]
pub struct AlignedEvent<'a> {
    pub event: &'a Event,
    pub signup_date: Option<NaiveDate>,
    pub day_offset: Option<i64>,
}

pub fn align(events: &[Event]) -> Vec<AlignedEvent<'_>> {
    let signups = signup_dates(events);
    events
        .iter()
        .map(|event| {
            let signup_date = signups.get(event.user_id.as_str()).copied();
            AlignedEvent {
                event,
                signup_date,
                day_offset: day_offset(event, signup_date),
            }
        })
        .collect()
}

/// Distinct retained users per (signup date, day offset).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CohortTable {
    pub rows: BTreeMap<NaiveDate, BTreeMap<i64, usize>>,
}

impl CohortTable {
    pub fn build(aligned: &[AlignedEvent<'_>]) -> Self {
        let mut cells: BTreeMap<NaiveDate, BTreeMap<i64, HashSet<&str>>> = BTreeMap::new();
        for row in aligned {
            if let (Some(date), Some(offset)) = (row.signup_date, row.day_offset) {
                cells
                    .entry(date)
                    .or_default()
                    .entry(offset)
                    .or_default()
                    .insert(row.event.user_id.as_str());
            }
        }

        let rows = cells
            .into_iter()
            .map(|(date, columns)| {
                let mut counts: BTreeMap<i64, usize> = columns
                    .into_iter()
                    .map(|(offset, users)| (offset, users.len()))
                    .collect();
                if !counts.contains_key(&0) {
                    let max = counts.values().copied().max().unwrap_or(0);
                    counts.insert(0, max);
                }
                (date, counts)
            })
            .collect();

        Self { rows }
    }

    pub fn cohort_size(&self, signup_date: &NaiveDate) -> usize {
        self.rows
            .get(signup_date)
            .and_then(|row| row.get(&0))
            .copied()
            .unwrap_or(0)
    }

    pub fn offsets(&self) -> Vec<i64> {
        let mut offsets: Vec<i64> = self
            .rows
            .values()
            .flat_map(|row| row.keys().copied())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        offsets.sort_unstable();
        offsets
    }

    /// Each row as a percentage of its day-0 cohort size.
    pub fn retention(&self) -> RetentionTable {
        let rows = self
            .rows
            .iter()
            .map(|(date, row)| {
                let size = row.get(&0).copied().unwrap_or(0);
                let pct = row
                    .iter()
                    .map(|(offset, users)| (*offset, ratio(*users, size) * 100.0))
                    .collect();
                (*date, pct)
            })
            .collect();
        RetentionTable { rows }
    }
}

/// Retention percentages; absent cells mean the cohort has no data there.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetentionTable {
    pub rows: BTreeMap<NaiveDate, BTreeMap<i64, f64>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CurvePoint {
    pub day: i64,
    pub retention: f64,
}

impl RetentionTable {
    /// Mean retention per offset over the cohorts that have that offset.
    pub fn curve(&self) -> Vec<CurvePoint> {
        let mut sums: BTreeMap<i64, (f64, usize)> = BTreeMap::new();
        for row in self.rows.values() {
            for (offset, pct) in row {
                let slot = sums.entry(*offset).or_insert((0.0, 0));
                slot.0 += pct;
                slot.1 += 1;
            }
        }
        sums.into_iter()
            .map(|(day, (sum, n))| CurvePoint {
                day,
                retention: sum / n as f64,
            })
            .collect()
    }

    /// Dense matrix for heatmaps: missing cells are reported as 0.
    pub fn filled_matrix(&self) -> Heatmap {
        let mut offsets: Vec<i64> = self
            .rows
            .values()
            .flat_map(|row| row.keys().copied())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        offsets.sort_unstable();

        let cohorts: Vec<NaiveDate> = self.rows.keys().copied().collect();
        let values = self
            .rows
            .values()
            .map(|row| {
                offsets
                    .iter()
                    .map(|o| row.get(o).copied().unwrap_or(0.0))
                    .collect()
            })
            .collect();
        Heatmap {
            cohorts,
            offsets,
            values,
        }
    }
}

/// `values[i][j]` is the retention of `cohorts[i]` at `offsets[j]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Heatmap {
    pub cohorts: Vec<NaiveDate>,
    pub offsets: Vec<i64>,
    pub values: Vec<Vec<f64>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DailyRetention {
    pub offset: i64,
    pub rate: f64,
}

impl DailyRetention {
    pub fn label(&self) -> String {
        format!("D{}", self.offset)
    }
}

/// Share of all users with at least one event at exactly each offset.
///
/// The denominator is every distinct user, not the user's own cohort.
pub fn daily_retention(aligned: &[AlignedEvent<'_>], offsets: &[i64]) -> Vec<DailyRetention> {
    let total_users = aligned
        .iter()
        .map(|row| row.event.user_id.as_str())
        .collect::<HashSet<_>>()
        .len();

    offsets
        .iter()
        .map(|&offset| {
            let retained = aligned
                .iter()
                .filter(|row| row.day_offset == Some(offset))
                .map(|row| row.event.user_id.as_str())
                .collect::<HashSet<_>>()
                .len();
            DailyRetention {
                offset,
                rate: round2(ratio(retained, total_users) * 100.0),
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetentionReport {
    pub daily: Vec<DailyRetention>,
    pub cohorts: CohortTable,
    pub retention: RetentionTable,
    pub curve: Vec<CurvePoint>,
    pub heatmap: Heatmap,
}

impl RetentionReport {
    pub fn daily_rate(&self, offset: i64) -> Option<f64> {
        self.daily.iter().find(|d| d.offset == offset).map(|d| d.rate)
    }
}

pub struct CohortEngine<'a> {
    aligned: Vec<AlignedEvent<'a>>,
}

impl<'a> CohortEngine<'a> {
    pub fn new(store: &'a EventStore) -> Self {
        Self {
            aligned: align(store.events()),
        }
    }

    pub fn cohort_table(&self) -> CohortTable {
        CohortTable::build(&self.aligned)
    }

    pub fn daily_retention(&self, offsets: &[i64]) -> Vec<DailyRetention> {
        daily_retention(&self.aligned, offsets)
    }

    pub fn report(&self, offsets: &[i64]) -> RetentionReport {
        let cohorts = self.cohort_table();
        let retention = cohorts.retention();
        let curve = retention.curve();
        let heatmap = retention.filled_matrix();
        RetentionReport {
            daily: self.daily_retention(offsets),
            cohorts,
            retention,
            curve,
            heatmap,
        }
    }
}
