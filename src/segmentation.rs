//! Behavioral segmentation: per-user activity features, standardization,
//! seeded k-means clustering and rule-based segment labels.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::debug;

use crate::error::{AnalyticsError, Result};
use crate::models::{LESSON_COMPLETE, PRACTICE};
use crate::stats::{mean, population_std, Describe};
use crate::store::EventStore;

pub const MIN_CLUSTERS: usize = 2;
pub const MAX_CLUSTERS: usize = 8;
pub const DEFAULT_CLUSTERS: usize = 4;
pub const DEFAULT_SEED: u64 = 42;

const FEATURES: usize = 3;
type Vector = [f64; FEATURES];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserFeatures {
    pub user_id: String,
    pub total_events: usize,
    pub lessons_completed: usize,
    pub practice_events: usize,
}

impl UserFeatures {
    fn vector(&self) -> Vector {
        [
            self.total_events as f64,
            self.lessons_completed as f64,
            self.practice_events as f64,
        ]
    }
}

pub fn build_features(store: &EventStore) -> Vec<UserFeatures> {
    let mut per_user: BTreeMap<&str, UserFeatures> = BTreeMap::new();
    for event in store.events() {
        let row = per_user
            .entry(event.user_id.as_str())
            .or_insert_with(|| UserFeatures {
                user_id: event.user_id.clone(),
                total_events: 0,
                lessons_completed: 0,
                practice_events: 0,
            });
        row.total_events += 1;
        if event.is(LESSON_COMPLETE) {
            row.lessons_completed += 1;
        } else if event.is(PRACTICE) {
            row.practice_events += 1;
        }
    }
    per_user.into_values().collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct FeatureSummary {
    pub total_events: Describe,
    pub lessons_completed: Describe,
    pub practice_events: Describe,
}

impl FeatureSummary {
    pub fn of(features: &[UserFeatures]) -> Self {
        let column = |i: usize| -> Vec<f64> { features.iter().map(|f| f.vector()[i]).collect() };
        Self {
            total_events: Describe::of(&column(0)),
            lessons_completed: Describe::of(&column(1)),
            practice_events: Describe::of(&column(2)),
        }
    }
}

/// Zero-mean, unit-variance scaling that remembers how to undo itself.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StandardScaler {
    mean: Vector,
    scale: Vector,
}

impl StandardScaler {
    pub fn fit(rows: &[Vector]) -> Self {
        let mut mean_v = [0.0; FEATURES];
        let mut scale = [1.0; FEATURES];
        for i in 0..FEATURES {
            let column: Vec<f64> = rows.iter().map(|r| r[i]).collect();
            mean_v[i] = mean(&column);
            let std = population_std(&column);
            // constant columns are left unscaled
            if std > 0.0 {
                scale[i] = std;
            }
        }
        Self {
            mean: mean_v,
            scale,
        }
    }

    pub fn transform(&self, row: &Vector) -> Vector {
        let mut out = [0.0; FEATURES];
        for i in 0..FEATURES {
            out[i] = (row[i] - self.mean[i]) / self.scale[i];
        }
        out
    }

    pub fn inverse_transform(&self, row: &Vector) -> Vector {
        let mut out = [0.0; FEATURES];
        for i in 0..FEATURES {
            out[i] = row[i] * self.scale[i] + self.mean[i];
        }
        out
    }
}

fn squared_distance(a: &Vector, b: &Vector) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum()
}

fn nearest(centers: &[Vector], point: &Vector) -> (usize, f64) {
    centers
        .iter()
        .enumerate()
        .map(|(i, c)| (i, squared_distance(c, point)))
        .fold((0, f64::INFINITY), |best, cur| if cur.1 < best.1 { cur } else { best })
}

/// Lloyd's algorithm seeded with greedy k-means++.
#[derive(Debug, Clone, Copy)]
pub struct KMeans {
    pub k: usize,
    pub seed: u64,
    pub max_iter: usize,
    pub tol: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct KMeansFit {
    pub centers: Vec<Vector>,
    pub labels: Vec<usize>,
    pub inertia: f64,
    pub iterations: usize,
}

impl KMeans {
    pub fn new(k: usize, seed: u64) -> Self {
        Self {
            k,
            seed,
            max_iter: 300,
            tol: 1e-4,
        }
    }

    pub fn fit(&self, points: &[Vector]) -> KMeansFit {
        if points.is_empty() || self.k == 0 {
            return KMeansFit::default();
        }
        let k = self.k.min(points.len());
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut centers = self.init_centers(points, k, &mut rng);

        // shift tolerance relative to the data's mean per-feature variance
        let variance: f64 = (0..FEATURES)
            .map(|i| population_std(&points.iter().map(|p| p[i]).collect::<Vec<_>>()).powi(2))
            .sum::<f64>()
            / FEATURES as f64;
        let tol = self.tol * variance;

        let mut labels = vec![0usize; points.len()];
        let mut iterations = 0;
        while iterations < self.max_iter {
            iterations += 1;
            for (label, point) in labels.iter_mut().zip(points) {
                *label = nearest(&centers, point).0;
            }

            let mut sums = vec![[0.0; FEATURES]; k];
            let mut counts = vec![0usize; k];
            for (label, point) in labels.iter().zip(points) {
                counts[*label] += 1;
                for i in 0..FEATURES {
                    sums[*label][i] += point[i];
                }
            }

            let mut next = centers.clone();
            for c in 0..k {
                if counts[c] > 0 {
                    for i in 0..FEATURES {
                        next[c][i] = sums[c][i] / counts[c] as f64;
                    }
                } else if let Some(far) = Self::farthest_point(points, &labels, &centers, &counts)
                {
                    // relocate an empty cluster onto the worst-served point
                    counts[labels[far]] -= 1;
                    labels[far] = c;
                    counts[c] = 1;
                    next[c] = points[far];
                }
            }

            let shift: f64 = centers
                .iter()
                .zip(&next)
                .map(|(old, new)| squared_distance(old, new))
                .sum();
            centers = next;
            if shift <= tol {
                break;
            }
        }

        let mut inertia = 0.0;
        for (label, point) in labels.iter_mut().zip(points) {
            let (best, dist) = nearest(&centers, point);
            *label = best;
            inertia += dist;
        }
        debug!(k, iterations, inertia, "k-means converged");

        KMeansFit {
            centers,
            labels,
            inertia,
            iterations,
        }
    }

    fn init_centers(&self, points: &[Vector], k: usize, rng: &mut StdRng) -> Vec<Vector> {
        let trials = 2 + (k as f64).ln().floor() as usize;
        let mut centers = vec![points[rng.gen_range(0..points.len())]];
        let mut closest: Vec<f64> = points
            .iter()
            .map(|p| squared_distance(p, &centers[0]))
            .collect();

        while centers.len() < k {
            let potential: f64 = closest.iter().sum();
            let mut best: Option<(f64, usize, Vec<f64>)> = None;
            for _ in 0..trials {
                let candidate = if potential > 0.0 {
                    let target = rng.gen::<f64>() * potential;
                    let mut acc = 0.0;
                    closest
                        .iter()
                        .position(|d| {
                            acc += d;
                            acc > target
                        })
                        .unwrap_or(points.len() - 1)
                } else {
                    rng.gen_range(0..points.len())
                };
                let updated: Vec<f64> = points
                    .iter()
                    .zip(&closest)
                    .map(|(p, d)| d.min(squared_distance(p, &points[candidate])))
                    .collect();
                let pot: f64 = updated.iter().sum();
                if best.as_ref().map_or(true, |(b, _, _)| pot < *b) {
                    best = Some((pot, candidate, updated));
                }
            }
            if let Some((_, candidate, updated)) = best {
                centers.push(points[candidate]);
                closest = updated;
            }
        }
        centers
    }

    fn farthest_point(
        points: &[Vector],
        labels: &[usize],
        centers: &[Vector],
        counts: &[usize],
    ) -> Option<usize> {
        points
            .iter()
            .enumerate()
            .filter(|(i, _)| counts[labels[*i]] > 1)
            .map(|(i, p)| (i, squared_distance(p, &centers[labels[i]])))
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(i, _)| i)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Centroid {
    pub cluster: usize,
    pub total_events: f64,
    pub lessons_completed: f64,
    pub practice_events: f64,
}

/// Cluster ids per user (same order as the input) and centroids in the
/// original feature space.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Clustering {
    pub labels: Vec<usize>,
    pub centroids: Vec<Centroid>,
}

/// Standardize, cluster, and map the standardized centers back through the
/// scaler. Centroids are not raw per-cluster means.
pub fn cluster_features(features: &[UserFeatures], k: usize, seed: u64) -> Clustering {
    let raw: Vec<Vector> = features.iter().map(UserFeatures::vector).collect();
    let scaler = StandardScaler::fit(&raw);
    let scaled: Vec<Vector> = raw.iter().map(|r| scaler.transform(r)).collect();
    let fit = KMeans::new(k, seed).fit(&scaled);

    let centroids = fit
        .centers
        .iter()
        .enumerate()
        .map(|(cluster, center)| {
            let v = scaler.inverse_transform(center);
            Centroid {
                cluster,
                total_events: v[0],
                lessons_completed: v[1],
                practice_events: v[2],
            }
        })
        .collect();

    Clustering {
        labels: fit.labels,
        centroids,
    }
}

/// Feature means across centroids, the thresholds the label rules compare to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CentroidMeans {
    pub total_events: f64,
    pub lessons_completed: f64,
    pub practice_events: f64,
}

impl CentroidMeans {
    pub fn of(centroids: &[Centroid]) -> Self {
        let column = |f: fn(&Centroid) -> f64| mean(&centroids.iter().map(f).collect::<Vec<_>>());
        Self {
            total_events: column(|c| c.total_events),
            lessons_completed: column(|c| c.lessons_completed),
            practice_events: column(|c| c.practice_events),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Profile {
    pub total_events: f64,
    pub lessons_completed: f64,
    pub practice_events: f64,
}

impl From<&UserFeatures> for Profile {
    fn from(f: &UserFeatures) -> Self {
        Self {
            total_events: f.total_events as f64,
            lessons_completed: f.lessons_completed as f64,
            practice_events: f.practice_events as f64,
        }
    }
}

impl From<&Centroid> for Profile {
    fn from(c: &Centroid) -> Self {
        Self {
            total_events: c.total_events,
            lessons_completed: c.lessons_completed,
            practice_events: c.practice_events,
        }
    }
}

pub struct LabelRule {
    pub label: &'static str,
    pub applies: fn(&Profile, &CentroidMeans) -> bool,
}

pub const POWER_LEARNER: &str = "Power Learner";
pub const PRACTICE_FOCUSED: &str = "Practice Focused";
pub const LOW_ENGAGEMENT: &str = "Low Engagement";
pub const CASUAL_LEARNER: &str = "Casual Learner";

/// Evaluated in order; the first match wins.
pub const LABEL_RULES: [LabelRule; 3] = [
    LabelRule {
        label: POWER_LEARNER,
        applies: |p, m| p.lessons_completed > m.lessons_completed,
    },
    LabelRule {
        label: PRACTICE_FOCUSED,
        applies: |p, m| p.practice_events > m.practice_events,
    },
    LabelRule {
        label: LOW_ENGAGEMENT,
        applies: |p, m| p.total_events < 0.4 * m.total_events,
    },
];

pub fn label_with(rules: &[LabelRule], profile: &Profile, means: &CentroidMeans) -> &'static str {
    rules
        .iter()
        .find(|rule| (rule.applies)(profile, means))
        .map(|rule| rule.label)
        .unwrap_or(CASUAL_LEARNER)
}

pub fn label_cluster(profile: &Profile, centroids: &[Centroid]) -> &'static str {
    label_with(&LABEL_RULES, profile, &CentroidMeans::of(centroids))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserSegment {
    pub user_id: String,
    pub cluster: usize,
    pub segment: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterLabel {
    pub centroid: Centroid,
    pub segment: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentationReport {
    pub k: usize,
    pub seed: u64,
    pub summary: FeatureSummary,
    pub users: Vec<UserSegment>,
    pub clusters: Vec<ClusterLabel>,
    pub segment_counts: BTreeMap<&'static str, usize>,
}

pub fn validate_cluster_count(k: usize) -> Result<()> {
    if (MIN_CLUSTERS..=MAX_CLUSTERS).contains(&k) {
        Ok(())
    } else {
        Err(AnalyticsError::InvalidParameter(format!(
            "cluster count must be between {MIN_CLUSTERS} and {MAX_CLUSTERS}, got {k}"
        )))
    }
}

pub fn segment_users(store: &EventStore, k: usize, seed: u64) -> Result<SegmentationReport> {
    validate_cluster_count(k)?;
    Ok(build_segmentation(store, k, seed))
}

/// Segmentation without the cluster-count range check.
pub(crate) fn build_segmentation(store: &EventStore, k: usize, seed: u64) -> SegmentationReport {
    let features = build_features(store);
    let clustering = cluster_features(&features, k, seed);
    let means = CentroidMeans::of(&clustering.centroids);

    let users: Vec<UserSegment> = features
        .iter()
        .zip(&clustering.labels)
        .map(|(f, cluster)| UserSegment {
            user_id: f.user_id.clone(),
            cluster: *cluster,
            segment: label_with(&LABEL_RULES, &Profile::from(f), &means),
        })
        .collect();

    let mut segment_counts = BTreeMap::new();
    for user in &users {
        *segment_counts.entry(user.segment).or_insert(0) += 1;
    }

    let clusters = clustering
        .centroids
        .iter()
        .map(|c| ClusterLabel {
            centroid: *c,
            segment: label_with(&LABEL_RULES, &Profile::from(c), &means),
        })
        .collect();

    SegmentationReport {
        k,
        seed,
        summary: FeatureSummary::of(&features),
        users,
        clusters,
        segment_counts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Event, SIGNUP};
    use chrono::NaiveDate;

    fn features(id: &str, total: usize, lessons: usize, practice: usize) -> UserFeatures {
        UserFeatures {
            user_id: id.to_string(),
            total_events: total,
            lessons_completed: lessons,
            practice_events: practice,
        }
    }

    fn centroid(total: f64, lessons: f64, practice: f64) -> Centroid {
        Centroid {
            cluster: 0,
            total_events: total,
            lessons_completed: lessons,
            practice_events: practice,
        }
    }

    #[test]
    fn separates_low_and_high_activity_users() {
        let rows = vec![
            features("a", 1, 0, 0),
            features("b", 1, 0, 0),
            features("c", 50, 20, 30),
            features("d", 55, 22, 28),
        ];
        let clustering = cluster_features(&rows, 2, DEFAULT_SEED);
        let l = &clustering.labels;
        assert_eq!(l[0], l[1]);
        assert_eq!(l[2], l[3]);
        assert_ne!(l[0], l[2]);

        let low = &clustering.centroids[l[0]];
        assert!((low.total_events - 1.0).abs() < 1e-9);
        assert!(low.lessons_completed.abs() < 1e-9);
        let high = &clustering.centroids[l[2]];
        assert!((high.total_events - 52.5).abs() < 1e-9);
        assert!((high.practice_events - 29.0).abs() < 1e-9);
    }

    #[test]
    fn clustering_is_reproducible() {
        let rows: Vec<UserFeatures> = (0..30)
            .map(|i| features(&format!("u{i}"), i * 3 % 17, i % 5, i * 7 % 11))
            .collect();
        let first = cluster_features(&rows, 4, 42);
        let second = cluster_features(&rows, 4, 42);
        assert_eq!(first, second);
        assert!(first.labels.iter().all(|l| *l < 4));
        assert_eq!(first.centroids.len(), 4);
    }

    #[test]
    fn scaler_round_trips_and_handles_constant_columns() {
        let rows = vec![[1.0, 5.0, 2.0], [3.0, 5.0, 4.0]];
        let scaler = StandardScaler::fit(&rows);
        let scaled = scaler.transform(&rows[0]);
        assert_eq!(scaled, [-1.0, 0.0, -1.0]);
        assert_eq!(scaler.inverse_transform(&scaled), rows[0]);
    }

    #[test]
    fn label_rules_apply_in_priority_order() {
        let centroids = vec![centroid(10.0, 2.0, 4.0), centroid(30.0, 6.0, 8.0)];
        // means: total 20, lessons 4, practice 6
        let label = |t, l, p| {
            label_cluster(
                &Profile {
                    total_events: t,
                    lessons_completed: l,
                    practice_events: p,
                },
                &centroids,
            )
        };
        assert_eq!(label(100.0, 5.0, 50.0), POWER_LEARNER);
        assert_eq!(label(100.0, 4.0, 7.0), PRACTICE_FOCUSED);
        assert_eq!(label(7.0, 0.0, 0.0), LOW_ENGAGEMENT);
        assert_eq!(label(8.0, 4.0, 6.0), CASUAL_LEARNER);
    }

    #[test]
    fn custom_rules_are_data_driven() {
        let rules = [LabelRule {
            label: "Everyone",
            applies: |_, _| true,
        }];
        let profile = Profile::from(&features("x", 1, 0, 0));
        assert_eq!(
            label_with(&rules, &profile, &CentroidMeans::default()),
            "Everyone"
        );
        assert_eq!(
            label_with(&[], &profile, &CentroidMeans::default()),
            CASUAL_LEARNER
        );
    }

    #[test]
    fn builds_features_from_events() {
        let ts = |d| {
            NaiveDate::from_ymd_opt(2024, 1, d)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap()
        };
        let store = EventStore::from_events(vec![
            Event::new("b", SIGNUP, ts(1)),
            Event::new("a", SIGNUP, ts(1)),
            Event::new("a", LESSON_COMPLETE, ts(2)),
            Event::new("a", PRACTICE, ts(2)),
            Event::new("a", PRACTICE, ts(3)),
        ]);
        let rows = build_features(&store);
        assert_eq!(rows, vec![features("a", 4, 1, 2), features("b", 1, 0, 0)]);
    }

    #[test]
    fn rejects_out_of_range_cluster_count() {
        let store = EventStore::default();
        assert!(matches!(
            segment_users(&store, 1, 42),
            Err(AnalyticsError::InvalidParameter(_))
        ));
        assert!(segment_users(&store, 9, 42).is_err());
        let report = segment_users(&store, 3, 42).unwrap();
        assert!(report.users.is_empty());
        assert!(report.clusters.is_empty());
    }

    #[test]
    fn fewer_users_than_clusters() {
        let rows = vec![features("a", 1, 0, 0), features("b", 9, 3, 3)];
        let clustering = cluster_features(&rows, 5, 42);
        assert_eq!(clustering.centroids.len(), 2);
        assert_ne!(clustering.labels[0], clustering.labels[1]);
    }
}
