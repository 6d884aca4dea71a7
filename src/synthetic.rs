//! Seeded synthetic event log for demos, seeding the database and load tests.
//!
//! Users sign up across a date range and then come back with a return
//! probability that decays day by day. A small share of users is written
//! as if imported mid-funnel (no signup first), which the cleaning step
//! is expected to exclude.

use std::path::Path;

use chrono::{Duration, NaiveDate, NaiveDateTime};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use uuid::Uuid;

use crate::error::{AnalyticsError, Result};
use crate::models::{
    Event, LESSON_COMPLETE, LESSON_START, ONBOARDING_STEP, PRACTICE, SIGNUP, STREAK_UPDATE,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyntheticConfig {
    pub users: usize,
    pub start: NaiveDate,
    pub signup_days: i64,
    pub active_days: i64,
    pub seed: u64,
    pub return_rate: f64,
    pub decay: f64,
    pub imported_share: f64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            users: 1_000,
            start: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap_or_default(),
            signup_days: 30,
            active_days: 45,
            seed: 42,
            return_rate: 0.45,
            decay: 0.93,
            imported_share: 0.03,
        }
    }
}

fn at(date: NaiveDate, rng: &mut StdRng, after: Option<NaiveDateTime>) -> NaiveDateTime {
    let base = date.and_hms_opt(0, 0, 0).unwrap_or_default();
    let ts = base + Duration::seconds(rng.gen_range(0..86_400));
    match after {
        Some(floor) if ts <= floor => floor + Duration::seconds(rng.gen_range(1..600)),
        _ => ts,
    }
}

pub fn generate(config: &SyntheticConfig) -> Vec<Event> {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut events = Vec::new();

    for _ in 0..config.users {
        let user = Uuid::from_bytes(rng.gen()).to_string();
        let signup_day = config.start + Duration::days(rng.gen_range(0..config.signup_days.max(1)));
        let imported = rng.gen_bool(config.imported_share.clamp(0.0, 1.0));

        let mut last = at(signup_day, &mut rng, None);
        if imported {
            events.push(Event::new(&user, LESSON_START, last));
            last += Duration::minutes(5);
        }
        events.push(Event::new(&user, SIGNUP, last));

        let mut push = |kind: &str, p: f64, rng: &mut StdRng, last: &mut NaiveDateTime| {
            if rng.gen_bool(p) {
                *last += Duration::seconds(rng.gen_range(30..900));
                events.push(Event::new(&user, kind, *last));
                true
            } else {
                false
            }
        };

        if push(ONBOARDING_STEP, 0.85, &mut rng, &mut last) {
            push(ONBOARDING_STEP, 0.6, &mut rng, &mut last);
        }
        if push(LESSON_START, 0.7, &mut rng, &mut last) {
            push(LESSON_COMPLETE, 0.75, &mut rng, &mut last);
        }

        let mut p_return = config.return_rate;
        for offset in 1..=config.active_days {
            p_return *= config.decay;
            if !rng.gen_bool(p_return.clamp(0.0, 1.0)) {
                continue;
            }
            let day = signup_day + Duration::days(offset);
            last = at(day, &mut rng, Some(last));
            if push(LESSON_START, 0.8, &mut rng, &mut last) {
                push(LESSON_COMPLETE, 0.8, &mut rng, &mut last);
            }
            for _ in 0..rng.gen_range(0..4) {
                push(PRACTICE, 0.6, &mut rng, &mut last);
            }
            push(STREAK_UPDATE, 0.5, &mut rng, &mut last);
        }
    }

    events
}

pub fn write_csv(events: &[Event], path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let to_load_error = |source| AnalyticsError::DataLoad {
        path: path.display().to_string(),
        source,
    };
    let mut writer = csv::Writer::from_path(path).map_err(to_load_error)?;
    for event in events {
        writer.serialize(event).map_err(to_load_error)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EventStore;

    fn small() -> SyntheticConfig {
        SyntheticConfig {
            users: 200,
            imported_share: 0.1,
            ..Default::default()
        }
    }

    #[test]
    fn generation_is_reproducible() {
        assert_eq!(generate(&small()), generate(&small()));
    }

    #[test]
    fn imported_users_are_cleaned_out() {
        let store = EventStore::from_events(generate(&small()));
        let stats = *store.stats();
        assert_eq!(stats.users_seen, 200);
        assert!(stats.users_excluded > 0);
        assert_eq!(store.user_count(), 200 - stats.users_excluded);
    }

    #[test]
    fn csv_round_trip_through_the_loader() {
        let events = generate(&SyntheticConfig {
            users: 20,
            imported_share: 0.0,
            ..Default::default()
        });
        let file = tempfile::NamedTempFile::new().unwrap();
        write_csv(&events, file.path()).unwrap();

        let store = EventStore::load(file.path()).unwrap();
        assert_eq!(store.stats().rows_dropped, 0);
        assert_eq!(store.events().len(), events.len());
        assert_eq!(store.user_count(), 20);
    }
}
