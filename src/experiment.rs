//! Simulated A/B split: seeded group assignment, per-group rate metrics,
//! normal-approximation confidence intervals and chi-square significance.

use std::collections::{HashMap, HashSet};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::cohort::{align, AlignedEvent};
use crate::models::{ratio, LESSON_COMPLETE, LESSON_START};
use crate::stats::{chi_square_2x2, normal_quantile};
use crate::store::EventStore;

pub const DEFAULT_SEED: u64 = 42;
pub const DEFAULT_CONFIDENCE: f64 = 0.95;

/// Returned when the contingency table is degenerate.
pub const NO_EVIDENCE_P_VALUE: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Group {
    A,
    B,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GroupAssignment {
    groups: HashMap<String, Group>,
}

impl GroupAssignment {
    pub fn group_of(&self, user_id: &str) -> Option<Group> {
        self.groups.get(user_id).copied()
    }

    pub fn size(&self, group: Group) -> usize {
        self.groups.values().filter(|g| **g == group).count()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// Independent fair coin per user, drawn in input order from a seeded RNG.
///
/// The same ids in the same order with the same seed always give the same
/// assignment.
pub fn assign_groups<S: AsRef<str>>(user_ids: &[S], seed: u64) -> GroupAssignment {
    let mut rng = StdRng::seed_from_u64(seed);
    let groups = user_ids
        .iter()
        .map(|id| {
            let group = if rng.gen_bool(0.5) { Group::B } else { Group::A };
            (id.as_ref().to_string(), group)
        })
        .collect();
    GroupAssignment { groups }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct GroupMetrics {
    pub users: usize,
    pub activation_rate: f64,
    pub completion_rate: f64,
    pub d1_retention: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Activation,
    Completion,
    D1Retention,
}

impl Metric {
    pub const ALL: [Metric; 3] = [Metric::Activation, Metric::Completion, Metric::D1Retention];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Activation => "activation_rate",
            Self::Completion => "completion_rate",
            Self::D1Retention => "d1_retention",
        }
    }

    pub fn rate(&self, metrics: &GroupMetrics) -> f64 {
        match self {
            Self::Activation => metrics.activation_rate,
            Self::Completion => metrics.completion_rate,
            Self::D1Retention => metrics.d1_retention,
        }
    }
}

fn distinct_users<'a>(
    rows: &[AlignedEvent<'a>],
    pred: impl Fn(&AlignedEvent<'a>) -> bool,
) -> usize {
    rows.iter()
        .filter(|row| pred(*row))
        .map(|row| row.event.user_id.as_str())
        .collect::<HashSet<_>>()
        .len()
}

pub fn compute_metrics(rows: &[AlignedEvent<'_>]) -> GroupMetrics {
    let users = distinct_users(rows, |_| true);
    if users == 0 {
        return GroupMetrics::default();
    }

    GroupMetrics {
        users,
        activation_rate: ratio(distinct_users(rows, |r| r.event.is(LESSON_START)), users),
        completion_rate: ratio(distinct_users(rows, |r| r.event.is(LESSON_COMPLETE)), users),
        d1_retention: ratio(distinct_users(rows, |r| r.day_offset == Some(1)), users),
    }
}

/// Normal approximation to a binomial proportion: `rate ± z·sqrt(rate(1-rate)/n)`.
pub fn confidence_interval(rate: f64, n: usize, confidence_level: f64) -> (f64, f64) {
    if n == 0 {
        return (0.0, 0.0);
    }
    let z = normal_quantile(1.0 - (1.0 - confidence_level) / 2.0);
    let se = ((rate * (1.0 - rate)).max(0.0) / n as f64).sqrt();
    (rate - z * se, rate + z * se)
}

/// Chi-square p-value comparing a metric between two groups.
///
/// Successes are reconstructed as `floor(rate * users)`.
pub fn significance_test(a: &GroupMetrics, b: &GroupMetrics, metric: Metric) -> f64 {
    let successes = |m: &GroupMetrics| (metric.rate(m) * m.users as f64).floor();
    let (sa, sb) = (successes(a), successes(b));
    let table = [
        [sa, a.users as f64 - sa],
        [sb, b.users as f64 - sb],
    ];
    chi_square_2x2(table)
        .map(|result| result.p_value)
        .unwrap_or(NO_EVIDENCE_P_VALUE)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RateInterval {
    pub metric: Metric,
    pub rate: f64,
    pub low: f64,
    pub high: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupSummary {
    pub group: Group,
    pub metrics: GroupMetrics,
    pub intervals: Vec<RateInterval>,
}

impl GroupSummary {
    fn new(group: Group, metrics: GroupMetrics, confidence_level: f64) -> Self {
        let intervals = Metric::ALL
            .iter()
            .map(|metric| {
                let rate = metric.rate(&metrics);
                let (low, high) = confidence_interval(rate, metrics.users, confidence_level);
                RateInterval {
                    metric: *metric,
                    rate,
                    low,
                    high,
                }
            })
            .collect();
        Self {
            group,
            metrics,
            intervals,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricTest {
    pub metric: Metric,
    pub p_value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExperimentReport {
    pub seed: u64,
    pub confidence_level: f64,
    pub a: GroupSummary,
    pub b: GroupSummary,
    pub tests: Vec<MetricTest>,
}

impl ExperimentReport {
    pub fn p_value(&self, metric: Metric) -> Option<f64> {
        self.tests
            .iter()
            .find(|t| t.metric == metric)
            .map(|t| t.p_value)
    }
}

pub fn run_experiment(store: &EventStore, seed: u64, confidence_level: f64) -> ExperimentReport {
    let assignment = assign_groups(&store.user_ids(), seed);
    let aligned = align(store.events());

    let (rows_a, rows_b): (Vec<AlignedEvent<'_>>, Vec<AlignedEvent<'_>>) = aligned
        .into_iter()
        .partition(|row| assignment.group_of(&row.event.user_id) == Some(Group::A));

    let a = compute_metrics(&rows_a);
    let b = compute_metrics(&rows_b);
    let tests = Metric::ALL
        .iter()
        .map(|metric| MetricTest {
            metric: *metric,
            p_value: significance_test(&a, &b, *metric),
        })
        .collect();

    ExperimentReport {
        seed,
        confidence_level,
        a: GroupSummary::new(Group::A, a, confidence_level),
        b: GroupSummary::new(Group::B, b, confidence_level),
        tests,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Event, SIGNUP};
    use chrono::NaiveDate;

    fn ev(user: &str, kind: &str, day: u32) -> Event {
        let ts = NaiveDate::from_ymd_opt(2024, 4, day)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap();
        Event::new(user, kind, ts)
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn assignment_is_deterministic() {
        let users: Vec<String> = (0..200).map(|i| format!("user-{i}")).collect();
        let first = assign_groups(&users, 42);
        let second = assign_groups(&users, 42);
        assert_eq!(first, second);
        assert_eq!(first.len(), 200);
        assert_eq!(first.size(Group::A) + first.size(Group::B), 200);
        assert!(first.size(Group::A) > 50 && first.size(Group::B) > 50);

        let other = assign_groups(&users, 7);
        assert_ne!(first, other);
    }

    #[test]
    fn metrics_over_a_group() {
        let store = EventStore::from_events(vec![
            ev("a", SIGNUP, 1),
            ev("a", LESSON_START, 1),
            ev("a", LESSON_COMPLETE, 2),
            ev("b", SIGNUP, 1),
            ev("b", LESSON_START, 1),
            ev("c", SIGNUP, 1),
            ev("d", SIGNUP, 1),
            ev("d", "practice", 2),
        ]);
        let aligned = align(store.events());
        let metrics = compute_metrics(&aligned);
        assert_eq!(metrics.users, 4);
        assert_eq!(metrics.activation_rate, 0.5);
        assert_eq!(metrics.completion_rate, 0.25);
        assert_eq!(metrics.d1_retention, 0.5);
    }

    #[test]
    fn empty_group_is_all_zeros() {
        assert_eq!(compute_metrics(&[]), GroupMetrics::default());
    }

    #[test]
    fn confidence_interval_bounds() {
        assert_eq!(confidence_interval(0.3, 0, 0.95), (0.0, 0.0));

        let (low, high) = confidence_interval(0.5, 100, 0.95);
        assert!(close(low, 0.5 - 1.959_963_985 * 0.05));
        assert!(close(high, 0.5 + 1.959_963_985 * 0.05));

        let (low, high) = confidence_interval(1.0, 10, 0.95);
        assert_eq!((low, high), (1.0, 1.0));
    }

    #[test]
    fn confidence_level_sets_the_z_score() {
        let (low, high) = confidence_interval(0.5, 100, 0.90);
        assert!(close(low, 0.5 - 1.644_853_627 * 0.05));
        assert!(close(high, 0.5 + 1.644_853_627 * 0.05));

        let (wide_low, _) = confidence_interval(0.5, 100, 0.99);
        assert!(wide_low < low);
    }

    #[test]
    fn significance_uses_floored_successes() {
        let a = GroupMetrics {
            users: 30,
            activation_rate: 10.9 / 30.0,
            ..Default::default()
        };
        let b = GroupMetrics {
            users: 30,
            activation_rate: 20.0 / 30.0,
            ..Default::default()
        };
        // floors to [[10, 20], [20, 10]]
        let p = significance_test(&a, &b, Metric::Activation);
        assert!(close(p, 0.020_136_75));
    }

    #[test]
    fn degenerate_tables_return_sentinel() {
        let empty = GroupMetrics::default();
        assert_eq!(
            significance_test(&empty, &empty, Metric::Completion),
            NO_EVIDENCE_P_VALUE
        );

        let all = GroupMetrics {
            users: 10,
            activation_rate: 1.0,
            completion_rate: 1.0,
            d1_retention: 1.0,
        };
        assert_eq!(
            significance_test(&all, &all, Metric::D1Retention),
            NO_EVIDENCE_P_VALUE
        );
    }

    #[test]
    fn report_covers_every_user_once() {
        let mut events = Vec::new();
        for i in 0..40 {
            let user = format!("u{i}");
            events.push(ev(&user, SIGNUP, 1));
            if i % 2 == 0 {
                events.push(ev(&user, LESSON_START, 2));
            }
        }
        let store = EventStore::from_events(events);
        let report = run_experiment(&store, DEFAULT_SEED, DEFAULT_CONFIDENCE);
        assert_eq!(report.a.metrics.users + report.b.metrics.users, 40);
        assert_eq!(report.tests.len(), 3);
        for test in &report.tests {
            assert!((0.0..=1.0).contains(&test.p_value));
        }
        assert_eq!(report, run_experiment(&store, DEFAULT_SEED, DEFAULT_CONFIDENCE));
    }
}
