//! Active users per period, lesson activity and practice frequency.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::models::{Period, Window, LESSON_COMPLETE, LESSON_START, PRACTICE};
use crate::stats::Describe;
use crate::store::EventStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ActivePeriod {
    pub period: Period,
    pub users: usize,
}

pub fn active_users(store: &EventStore, window: Window) -> Vec<ActivePeriod> {
    store
        .group_count_distinct_users(|e| window.period_of(&e.timestamp))
        .into_iter()
        .map(|(period, users)| ActivePeriod { period, users })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserLessonCounts {
    pub user_id: String,
    pub lesson_start: usize,
    pub lesson_complete: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LessonEngagement {
    pub users: Vec<UserLessonCounts>,
    pub lesson_start: Describe,
    pub lesson_complete: Describe,
}

pub fn lesson_engagement(store: &EventStore) -> LessonEngagement {
    let mut per_user: BTreeMap<&str, (usize, usize)> = BTreeMap::new();
    for event in store.filter_by_type(&[LESSON_START, LESSON_COMPLETE]).iter() {
        let slot = per_user.entry(event.user_id.as_str()).or_default();
        if event.is(LESSON_START) {
            slot.0 += 1;
        } else {
            slot.1 += 1;
        }
    }

    let starts: Vec<f64> = per_user.values().map(|c| c.0 as f64).collect();
    let completes: Vec<f64> = per_user.values().map(|c| c.1 as f64).collect();

    LessonEngagement {
        users: per_user
            .into_iter()
            .map(|(user, (start, complete))| UserLessonCounts {
                user_id: user.to_string(),
                lesson_start: start,
                lesson_complete: complete,
            })
            .collect(),
        lesson_start: Describe::of(&starts),
        lesson_complete: Describe::of(&completes),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PracticeBucket {
    pub practice_count: usize,
    pub users: usize,
}

/// Histogram of practice events per practicing user, ascending by count.
pub fn practice_distribution(store: &EventStore) -> Vec<PracticeBucket> {
    let mut per_user: BTreeMap<&str, usize> = BTreeMap::new();
    for event in store.filter_by_type(&[PRACTICE]).iter() {
        *per_user.entry(event.user_id.as_str()).or_default() += 1;
    }

    let mut histogram: BTreeMap<usize, usize> = BTreeMap::new();
    for count in per_user.into_values() {
        *histogram.entry(count).or_default() += 1;
    }

    histogram
        .into_iter()
        .map(|(practice_count, users)| PracticeBucket {
            practice_count,
            users,
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngagementReport {
    pub daily: Vec<ActivePeriod>,
    pub weekly: Vec<ActivePeriod>,
    pub monthly: Vec<ActivePeriod>,
    pub lessons: LessonEngagement,
    pub practice: Vec<PracticeBucket>,
}

pub fn engagement_report(store: &EventStore) -> EngagementReport {
    EngagementReport {
        daily: active_users(store, Window::Day),
        weekly: active_users(store, Window::Week),
        monthly: active_users(store, Window::Month),
        lessons: lesson_engagement(store),
        practice: practice_distribution(store),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Event, SIGNUP};
    use chrono::NaiveDate;

    fn ev(user: &str, kind: &str, m: u32, d: u32) -> Event {
        let ts = NaiveDate::from_ymd_opt(2024, m, d)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap();
        Event::new(user, kind, ts)
    }

    fn sample() -> EventStore {
        EventStore::from_events(vec![
            ev("a", SIGNUP, 1, 1),
            ev("a", LESSON_START, 1, 1),
            ev("a", LESSON_START, 1, 2),
            ev("a", LESSON_COMPLETE, 1, 2),
            ev("a", PRACTICE, 1, 2),
            ev("a", PRACTICE, 2, 5),
            ev("b", SIGNUP, 1, 2),
            ev("b", PRACTICE, 1, 2),
            ev("c", SIGNUP, 2, 5),
            ev("c", PRACTICE, 2, 6),
        ])
    }

    #[test]
    fn active_users_only_lists_periods_with_data() {
        let store = sample();
        let daily = active_users(&store, Window::Day);
        let days: Vec<(String, usize)> = daily
            .iter()
            .map(|p| (p.period.to_string(), p.users))
            .collect();
        assert_eq!(
            days,
            vec![
                ("2024-01-01".to_string(), 1),
                ("2024-01-02".to_string(), 2),
                ("2024-02-05".to_string(), 2),
                ("2024-02-06".to_string(), 1),
            ]
        );

        let monthly = active_users(&store, Window::Month);
        assert_eq!(monthly.len(), 2);
        assert_eq!(monthly[0].users, 2);
        assert_eq!(monthly[1].users, 2);

        let weekly = active_users(&store, Window::Week);
        assert_eq!(weekly[0].period, Period::Week { year: 2024, week: 1 });
        assert_eq!(weekly[0].users, 2);
    }

    #[test]
    fn lesson_summary_counts_per_user() {
        let summary = lesson_engagement(&sample());
        assert_eq!(
            summary.users,
            vec![UserLessonCounts {
                user_id: "a".to_string(),
                lesson_start: 2,
                lesson_complete: 1,
            }]
        );
        assert_eq!(summary.lesson_start.count, 1);
        assert_eq!(summary.lesson_start.mean, 2.0);
        assert_eq!(summary.lesson_complete.max, 1.0);
        assert_eq!(summary.lesson_start.std, 0.0);
    }

    #[test]
    fn practice_histogram_is_sorted() {
        let histogram = practice_distribution(&sample());
        assert_eq!(
            histogram,
            vec![
                PracticeBucket {
                    practice_count: 1,
                    users: 2
                },
                PracticeBucket {
                    practice_count: 2,
                    users: 1
                },
            ]
        );
    }

    #[test]
    fn empty_store_gives_empty_views() {
        let report = engagement_report(&EventStore::default());
        assert!(report.daily.is_empty());
        assert!(report.lessons.users.is_empty());
        assert_eq!(report.lessons.lesson_start, Describe::default());
        assert!(report.practice.is_empty());
    }
}
