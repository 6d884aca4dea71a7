//! Product analytics for a learning app's event log.
//!
//! This library provides:
//! - Loading and cleaning event logs from CSV or Postgres
//! - Signup cohorts and day-offset retention
//! - Stage funnels with step conversion
//! - Daily, weekly and monthly active users plus lesson and practice activity
//! - Seeded A/B group assignment with confidence intervals and chi-square tests
//! - K-means user segmentation with rule-based segment labels

pub mod cohort;
pub mod config;
pub mod context;
pub mod db;
pub mod engagement;
pub mod error;
pub mod experiment;
pub mod funnel;
pub mod models;
pub mod report;
pub mod segmentation;
pub mod stats;
pub mod store;
pub mod synthetic;

// Re-export common types
pub use config::{load_config, AnalyticsConfig};
pub use context::AnalyticsContext;
pub use error::{AnalyticsError, Result};
pub use models::{Event, Window};
pub use store::EventStore;
