use anyhow::Context;
use chrono::NaiveDateTime;
use sqlx::{PgPool, Row};
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::Event;
use crate::store::{parse_timestamp, EventStore};
use crate::synthetic::{self, SyntheticConfig};

// source_key breaks timestamp ties so same-instant events keep a stable order
const FETCH_EVENTS_SQL: &str = "SELECT user_id, event_type, occurred_at \
     FROM learning_analytics.events \
     ORDER BY occurred_at, source_key";

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

async fn insert_event(pool: &PgPool, event: &Event, source_key: &str) -> anyhow::Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO learning_analytics.events
        (id, user_id, event_type, occurred_at, source_key)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (source_key) DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&event.user_id)
    .bind(&event.event_type)
    .bind(event.timestamp)
    .bind(source_key)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Insert a reproducible synthetic event log.
pub async fn seed(pool: &PgPool, config: &SyntheticConfig) -> anyhow::Result<usize> {
    let events = synthetic::generate(config);
    let mut inserted = 0usize;

    for (n, event) in events.iter().enumerate() {
        let source_key = format!("seed-{}-{:07}", config.seed, n);
        if insert_event(pool, event, &source_key).await? {
            inserted += 1;
        }
    }

    info!(inserted, users = config.users, "seeded synthetic events");
    Ok(inserted)
}

pub async fn fetch_events(pool: &PgPool) -> anyhow::Result<EventStore> {
    let records = sqlx::query(FETCH_EVENTS_SQL)
        .fetch_all(pool)
        .await
        .context("failed to read events from Postgres")?;

    let mut events = Vec::with_capacity(records.len());
    for row in records {
        let occurred_at: NaiveDateTime = row.get("occurred_at");
        events.push(Event::new(
            row.get::<String, _>("user_id"),
            row.get::<String, _>("event_type"),
            occurred_at,
        ));
    }

    Ok(EventStore::from_events(events))
}

pub async fn import_csv(pool: &PgPool, csv_path: &std::path::Path) -> anyhow::Result<usize> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        user_id: String,
        event_type: String,
        timestamp: String,
        source_key: Option<String>,
    }

    let mut reader = csv::Reader::from_path(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    let mut inserted = 0usize;
    let mut skipped = 0usize;

    for result in reader.deserialize::<CsvRow>() {
        let row = match result {
            Ok(row) => row,
            Err(err) => {
                skipped += 1;
                warn!("skipping malformed row: {}", err);
                continue;
            }
        };
        let Some(timestamp) = parse_timestamp(&row.timestamp) else {
            skipped += 1;
            warn!(value = %row.timestamp, "skipping row with unparsable timestamp");
            continue;
        };
        if row.user_id.trim().is_empty() || row.event_type.trim().is_empty() {
            skipped += 1;
            continue;
        }

        let event = Event::new(row.user_id.trim(), row.event_type.trim(), timestamp);
        let source_key = row
            .source_key
            .unwrap_or_else(|| format!("import-{}", Uuid::new_v4()));

        if insert_event(pool, &event, &source_key).await? {
            inserted += 1;
        }
    }

    info!(inserted, skipped, path = %csv_path.display(), "imported events");
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_order_breaks_timestamp_ties() {
        assert!(FETCH_EVENTS_SQL.ends_with("ORDER BY occurred_at, source_key"));
    }
}
