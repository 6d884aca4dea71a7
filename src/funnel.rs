//! Ordered-stage funnel counts and step conversion rates.

use serde::Serialize;

use crate::models::{round2, ratio};
use crate::store::EventStore;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunnelStage {
    pub name: String,
    pub users: usize,
    /// Percent of the previous stage's users; 100 for the first stage.
    pub conversion_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FunnelReport {
    pub stages: Vec<FunnelStage>,
}

impl FunnelReport {
    pub fn stage(&self, name: &str) -> Option<&FunnelStage> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn entry_users(&self) -> usize {
        self.stages.first().map(|s| s.users).unwrap_or(0)
    }

    pub fn final_users(&self) -> usize {
        self.stages.last().map(|s| s.users).unwrap_or(0)
    }

    /// Users lost between the first and last stage. Negative when noisy data
    /// has more users at the end than at the start.
    pub fn drop_off(&self) -> i64 {
        self.entry_users() as i64 - self.final_users() as i64
    }
}

/// Distinct users per stage in the given order, with step conversion.
///
/// Stages are not required to be monotonic: a stage may hold more users than
/// the one before it.
pub fn compute_funnel<S: AsRef<str>>(store: &EventStore, stages: &[S]) -> FunnelReport {
    let names: Vec<&str> = stages.iter().map(AsRef::as_ref).collect();
    let counts = store
        .filter_by_type(&names)
        .group_count_distinct_users(|e| e.event_type.clone());

    let mut previous: Option<usize> = None;
    let stages = names
        .iter()
        .map(|name| {
            let users = counts.get(*name).copied().unwrap_or(0);
            let conversion_rate = match previous {
                None => 100.0,
                Some(prev) => round2(ratio(users, prev) * 100.0),
            };
            previous = Some(users);
            FunnelStage {
                name: name.to_string(),
                users,
                conversion_rate,
            }
        })
        .collect();

    FunnelReport { stages }
}
