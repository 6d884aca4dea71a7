//! Shared, immutable event store plus memoized analytics views.
//!
//! Every view is cached under its name and its JSON-serialized parameters,
//! so two calls with the same parameters reuse one result. Swapping the
//! store through [`AnalyticsContext::reload`] clears the cache.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tracing::debug;

use crate::cohort::{CohortEngine, RetentionReport};
use crate::engagement::{self, ActivePeriod, EngagementReport};
use crate::error::{AnalyticsError, Result};
use crate::experiment::{self, ExperimentReport};
use crate::funnel::{self, FunnelReport};
use crate::models::Window;
use crate::segmentation::{self, SegmentationReport};
use crate::store::EventStore;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    view: &'static str,
    args: String,
}

type CachedValue = Arc<dyn Any + Send + Sync>;

pub struct AnalyticsContext {
    store: Arc<EventStore>,
    cache: Mutex<HashMap<CacheKey, CachedValue>>,
}

impl AnalyticsContext {
    pub fn new(store: EventStore) -> Self {
        Self {
            store: Arc::new(store),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &EventStore {
        &self.store
    }

    pub fn reload(&mut self, store: EventStore) {
        self.store = Arc::new(store);
        self.invalidate();
    }

    pub fn invalidate(&self) {
        self.lock().clear();
    }

    pub fn cached_views(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CacheKey, CachedValue>> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn memoize<T, A, F>(&self, view: &'static str, args: &A, compute: F) -> Result<Arc<T>>
    where
        T: Send + Sync + 'static,
        A: Serialize + ?Sized,
        F: FnOnce(&EventStore) -> T,
    {
        let key = CacheKey {
            view,
            args: serde_json::to_string(args)?,
        };

        if let Some(hit) = self.lock().get(&key).cloned() {
            if let Ok(value) = hit.downcast::<T>() {
                debug!(view, args = %key.args, "cache hit");
                return Ok(value);
            }
        }

        let value = Arc::new(compute(&self.store));
        self.lock().insert(key, Arc::clone(&value) as CachedValue);
        Ok(value)
    }

    pub fn funnel<S: AsRef<str> + Serialize>(&self, stages: &[S]) -> Result<Arc<FunnelReport>> {
        if stages.is_empty() {
            return Err(AnalyticsError::InvalidParameter(
                "funnel needs at least one stage".to_string(),
            ));
        }
        self.memoize("funnel", stages, |store| funnel::compute_funnel(store, stages))
    }

    pub fn retention(&self, offsets: &[i64]) -> Result<Arc<RetentionReport>> {
        self.memoize("retention", offsets, |store| CohortEngine::new(store).report(offsets))
    }

    pub fn active_users(&self, window: Window) -> Result<Arc<Vec<ActivePeriod>>> {
        self.memoize("active_users", &window, |store| engagement::active_users(store, window))
    }

    pub fn engagement(&self) -> Result<Arc<EngagementReport>> {
        self.memoize("engagement", &(), engagement::engagement_report)
    }

    pub fn experiment(&self, seed: u64, confidence_level: f64) -> Result<Arc<ExperimentReport>> {
        validate_confidence(confidence_level)?;
        self.memoize("experiment", &(seed, confidence_level), |store| {
            experiment::run_experiment(store, seed, confidence_level)
        })
    }

    pub fn segmentation(&self, k: usize, seed: u64) -> Result<Arc<SegmentationReport>> {
        segmentation::validate_cluster_count(k)?;
        self.memoize("segmentation", &(k, seed), |store| {
            segmentation::build_segmentation(store, k, seed)
        })
    }
}

pub fn validate_confidence(level: f64) -> Result<()> {
    if level > 0.0 && level < 1.0 {
        Ok(())
    } else {
        Err(AnalyticsError::InvalidParameter(format!(
            "confidence level must be in (0, 1), got {level}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Event, FUNNEL_STAGES, SIGNUP};
    use chrono::NaiveDate;

    fn store(users: usize) -> EventStore {
        let ts = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        EventStore::from_events(
            (0..users)
                .map(|i| Event::new(format!("u{i}"), SIGNUP, ts))
                .collect(),
        )
    }

    #[test]
    fn repeated_calls_hit_the_cache() {
        let ctx = AnalyticsContext::new(store(3));
        let first = ctx.funnel(&FUNNEL_STAGES).unwrap();
        let second = ctx.funnel(&FUNNEL_STAGES).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(ctx.cached_views(), 1);
    }

    #[test]
    fn parameters_are_part_of_the_key() {
        let ctx = AnalyticsContext::new(store(3));
        let a = ctx.experiment(1, 0.95).unwrap();
        let b = ctx.experiment(2, 0.95).unwrap();
        let c = ctx.experiment(1, 0.90).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(ctx.cached_views(), 3);

        ctx.segmentation(2, 42).unwrap();
        ctx.segmentation(3, 42).unwrap();
        assert_eq!(ctx.cached_views(), 5);
    }

    #[test]
    fn reload_invalidates() {
        let mut ctx = AnalyticsContext::new(store(2));
        assert_eq!(ctx.funnel(&[SIGNUP]).unwrap().entry_users(), 2);
        ctx.reload(store(5));
        assert_eq!(ctx.cached_views(), 0);
        assert_eq!(ctx.funnel(&[SIGNUP]).unwrap().entry_users(), 5);
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        let ctx = AnalyticsContext::new(store(1));
        assert!(ctx.experiment(42, 1.5).is_err());
        assert!(ctx.segmentation(12, 42).is_err());
        assert!(ctx.funnel::<&str>(&[]).is_err());
        assert_eq!(ctx.cached_views(), 0);
    }
}
