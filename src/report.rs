use std::fmt::Write;

use crate::cohort::RetentionReport;
use crate::config::AnalyticsConfig;
use crate::context::AnalyticsContext;
use crate::engagement::{ActivePeriod, EngagementReport};
use crate::error::Result;
use crate::experiment::{ExperimentReport, GroupSummary};
use crate::funnel::FunnelReport;
use crate::models::Window;
use crate::segmentation::SegmentationReport;
use crate::store::LoadStats;

const RECENT_PERIODS: usize = 14;

pub fn funnel_section(output: &mut String, funnel: &FunnelReport) {
    let _ = writeln!(output, "## Funnel");
    if funnel.entry_users() == 0 && funnel.final_users() == 0 {
        let _ = writeln!(output, "No users reached any funnel stage.");
    }
    for stage in &funnel.stages {
        let _ = writeln!(
            output,
            "- {}: {} users ({:.2}% of previous stage)",
            stage.name, stage.users, stage.conversion_rate
        );
    }
    let _ = writeln!(
        output,
        "- Total drop-off: {} users ({} entered, {} reached the final stage)",
        funnel.drop_off(),
        funnel.entry_users(),
        funnel.final_users()
    );
}

pub fn retention_section(output: &mut String, retention: &RetentionReport) {
    let _ = writeln!(output, "## Retention");
    for daily in &retention.daily {
        let _ = writeln!(output, "- {}: {:.2}%", daily.label(), daily.rate);
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "### Cohorts");
    if retention.cohorts.rows.is_empty() {
        let _ = writeln!(output, "No cohorts in this dataset.");
    } else {
        for (date, row) in &retention.retention.rows {
            let size = retention.cohorts.cohort_size(date);
            let cells: Vec<String> = row
                .iter()
                .filter(|(offset, _)| **offset > 0)
                .take(7)
                .map(|(offset, pct)| format!("D{offset} {pct:.1}%"))
                .collect();
            let _ = writeln!(output, "- {} ({} users): {}", date, size, cells.join(", "));
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "### Average Retention Curve");
    for point in retention.curve.iter().take(31) {
        let _ = writeln!(output, "- Day {}: {:.1}%", point.day, point.retention);
    }
}

fn active_line(output: &mut String, label: &str, periods: &[ActivePeriod]) {
    let peak = periods.iter().max_by_key(|p| p.users);
    let average = if periods.is_empty() {
        0.0
    } else {
        periods.iter().map(|p| p.users as f64).sum::<f64>() / periods.len() as f64
    };
    match peak {
        Some(peak) => {
            let _ = writeln!(
                output,
                "- {}: {:.1} on average across {} periods, peak {} on {}",
                label,
                average,
                periods.len(),
                peak.users,
                peak.period
            );
        }
        None => {
            let _ = writeln!(output, "- {}: no activity", label);
        }
    }
}

pub fn engagement_section(output: &mut String, engagement: &EngagementReport) {
    let _ = writeln!(output, "## Engagement");
    active_line(output, "DAU", &engagement.daily);
    active_line(output, "WAU", &engagement.weekly);
    active_line(output, "MAU", &engagement.monthly);

    let lessons = &engagement.lessons;
    let _ = writeln!(output);
    let _ = writeln!(output, "### Lesson Activity");
    let _ = writeln!(
        output,
        "- lesson_start per user: mean {:.2}, median {:.1}, max {:.0} ({} users)",
        lessons.lesson_start.mean,
        lessons.lesson_start.p50,
        lessons.lesson_start.max,
        lessons.lesson_start.count
    );
    let _ = writeln!(
        output,
        "- lesson_complete per user: mean {:.2}, median {:.1}, max {:.0}",
        lessons.lesson_complete.mean, lessons.lesson_complete.p50, lessons.lesson_complete.max
    );

    let _ = writeln!(output);
    let _ = writeln!(output, "### Practice Distribution");
    if engagement.practice.is_empty() {
        let _ = writeln!(output, "No practice events recorded.");
    }
    for bucket in &engagement.practice {
        let _ = writeln!(
            output,
            "- {} practice events: {} users",
            bucket.practice_count, bucket.users
        );
    }
}

pub fn active_users_section(output: &mut String, window: Window, periods: &[ActivePeriod]) {
    let _ = writeln!(output, "### Active Users ({})", window.name().to_uppercase());
    if periods.is_empty() {
        let _ = writeln!(output, "No activity.");
    }
    for period in periods {
        let _ = writeln!(output, "- {}: {}", period.period, period.users);
    }
}

fn group_lines(output: &mut String, summary: &GroupSummary) {
    let _ = writeln!(
        output,
        "- Group {:?}: {} users",
        summary.group, summary.metrics.users
    );
    for interval in &summary.intervals {
        let _ = writeln!(
            output,
            "  - {}: {:.3} ({:.3} - {:.3})",
            interval.metric.name(),
            interval.rate,
            interval.low,
            interval.high
        );
    }
}

pub fn experiment_section(output: &mut String, experiment: &ExperimentReport) {
    let _ = writeln!(output, "## A/B Test");
    let _ = writeln!(
        output,
        "Seed {}, {:.0}% confidence intervals",
        experiment.seed,
        experiment.confidence_level * 100.0
    );
    group_lines(output, &experiment.a);
    group_lines(output, &experiment.b);
    let _ = writeln!(output);
    let _ = writeln!(output, "### Chi-Square p-values");
    for test in &experiment.tests {
        let _ = writeln!(output, "- {}: {:.4}", test.metric.name(), test.p_value);
    }
}

pub fn segmentation_section(output: &mut String, segmentation: &SegmentationReport) {
    let _ = writeln!(output, "## Segmentation");
    let _ = writeln!(
        output,
        "{} clusters over {} users",
        segmentation.clusters.len(),
        segmentation.users.len()
    );
    for cluster in &segmentation.clusters {
        let c = &cluster.centroid;
        let _ = writeln!(
            output,
            "- Cluster {} ({}): {:.1} events, {:.1} lessons completed, {:.1} practice",
            c.cluster, cluster.segment, c.total_events, c.lessons_completed, c.practice_events
        );
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "### Segment Labels");
    let mut counts: Vec<(&str, usize)> = segmentation
        .segment_counts
        .iter()
        .map(|(label, count)| (*label, *count))
        .collect();
    counts.sort_by(|a, b| b.1.cmp(&a.1));
    for (label, count) in counts {
        let _ = writeln!(output, "- {}: {} users", label, count);
    }
}

pub fn load_section(output: &mut String, stats: &LoadStats) {
    let _ = writeln!(
        output,
        "Rows read: {}, dropped as malformed: {}, users excluded for not starting with a signup: {} of {}",
        stats.rows_read, stats.rows_dropped, stats.users_excluded, stats.users_seen
    );
}

/// Markdown report covering every analytics view.
pub fn build_report(ctx: &AnalyticsContext, config: &AnalyticsConfig) -> Result<String> {
    let mut output = String::new();

    let _ = writeln!(output, "# Learning Analytics Report");
    load_section(&mut output, ctx.store().stats());
    let _ = writeln!(output);

    funnel_section(&mut output, &*ctx.funnel(&config.funnel_stages)?);
    let _ = writeln!(output);
    retention_section(&mut output, &*ctx.retention(&config.retention_offsets)?);
    let _ = writeln!(output);
    engagement_section(&mut output, &*ctx.engagement()?);
    let _ = writeln!(output);
    let periods = ctx.active_users(config.active_window)?;
    let recent = periods.len().saturating_sub(RECENT_PERIODS);
    active_users_section(&mut output, config.active_window, &periods[recent..]);
    let _ = writeln!(output);
    experiment_section(
        &mut output,
        &*ctx.experiment(config.experiment_seed, config.confidence_level)?,
    );
    let _ = writeln!(output);
    segmentation_section(
        &mut output,
        &*ctx.segmentation(config.cluster_count, config.cluster_seed)?,
    );

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::{self, SyntheticConfig};
    use crate::store::EventStore;

    #[test]
    fn report_has_every_section() {
        let events = synthetic::generate(&SyntheticConfig {
            users: 120,
            ..Default::default()
        });
        let ctx = AnalyticsContext::new(EventStore::from_events(events));
        let report = build_report(&ctx, &AnalyticsConfig::default()).unwrap();

        for heading in [
            "# Learning Analytics Report",
            "## Funnel",
            "## Retention",
            "- D1:",
            "## Engagement",
            "### Active Users (DAU)",
            "## A/B Test",
            "## Segmentation",
        ] {
            assert!(report.contains(heading), "missing {heading}");
        }
        assert!(report.contains("- signup: "));
        assert!(report.contains("(100.00% of previous stage)"));
    }

    #[test]
    fn empty_dataset_still_renders() {
        let ctx = AnalyticsContext::new(EventStore::default());
        let report = build_report(&ctx, &AnalyticsConfig::default()).unwrap();
        assert!(report.contains("No users reached any funnel stage."));
        assert!(report.contains("No cohorts in this dataset."));
        assert!(report.contains("- DAU: no activity"));
        assert!(report.contains("No practice events recorded."));
    }
}
