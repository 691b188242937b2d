use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct WateringEvent {
    pub ts_start: i64,
    pub ts_end: i64,
    pub zone_id: String,
    pub outcome: String,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/home/pi/irrigation/irrigation.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        // Every connection to ":memory:" is a separate database, so tests
        // must stay on a single connection that never gets recycled.
        let in_memory = db_url.contains(":memory:");
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Program last-run dates
    // ----------------------------

    /// Raw stored value; the caller decides what to do with garbage.
    pub async fn load_last_run(&self, program_id: &str) -> Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT last_run FROM program_state WHERE program_id = ?")
                .bind(program_id)
                .fetch_optional(&self.pool)
                .await
                .context("load_last_run failed")?;
        Ok(row.map(|(d,)| d))
    }

    pub async fn save_last_run(&self, program_id: &str, day: NaiveDate) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO program_state (program_id, last_run)
            VALUES (?, ?)
            ON CONFLICT(program_id) DO UPDATE SET last_run = excluded.last_run
            "#,
        )
        .bind(program_id)
        .bind(day.format("%Y-%m-%d").to_string())
        .execute(&self.pool)
        .await
        .context("save_last_run failed")?;
        Ok(())
    }

    // ----------------------------
    // Watering history
    // ----------------------------

    pub async fn insert_watering_event(
        &self,
        started: DateTime<Utc>,
        ended: DateTime<Utc>,
        zone_id: &str,
        outcome: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO watering_events (ts_start, ts_end, zone_id, outcome)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(started.timestamp())
        .bind(ended.timestamp())
        .bind(zone_id)
        .bind(outcome)
        .execute(&self.pool)
        .await
        .context("insert_watering_event failed")?;
        Ok(())
    }

    /// Newest first.
    pub async fn recent_watering_events(&self, zone_id: &str, limit: i64) -> Result<Vec<WateringEvent>> {
        sqlx::query_as::<_, WateringEvent>(
            r#"
            SELECT ts_start, ts_end, zone_id, outcome
            FROM watering_events
            WHERE zone_id = ?
            ORDER BY ts_start DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(zone_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("recent_watering_events failed")
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn test_db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    #[tokio::test]
    async fn last_run_missing_is_none() {
        let db = test_db().await;
        assert_eq!(db.load_last_run("morning").await.unwrap(), None);
    }

    #[tokio::test]
    async fn last_run_upserts() {
        let db = test_db().await;
        let d1 = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let d2 = NaiveDate::from_ymd_opt(2024, 6, 2).unwrap();

        db.save_last_run("morning", d1).await.unwrap();
        assert_eq!(
            db.load_last_run("morning").await.unwrap().as_deref(),
            Some("2024-06-01")
        );

        db.save_last_run("morning", d2).await.unwrap();
        assert_eq!(
            db.load_last_run("morning").await.unwrap().as_deref(),
            Some("2024-06-02")
        );
        assert_eq!(db.load_last_run("evening").await.unwrap(), None);
    }

    #[tokio::test]
    async fn watering_events_newest_first_per_zone() {
        let db = test_db().await;
        let t0 = Utc::now() - Duration::hours(2);

        db.insert_watering_event(t0, t0 + Duration::minutes(5), "lawn", "completed")
            .await
            .unwrap();
        db.insert_watering_event(
            t0 + Duration::hours(1),
            t0 + Duration::hours(1) + Duration::minutes(1),
            "lawn",
            "stopped",
        )
        .await
        .unwrap();
        db.insert_watering_event(t0, t0, "beds", "failed").await.unwrap();

        let events = db.recent_watering_events("lawn", 10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].outcome, "stopped");
        assert_eq!(events[1].outcome, "completed");
        assert_eq!(events[1].ts_end - events[1].ts_start, 300);

        let limited = db.recent_watering_events("lawn", 1).await.unwrap();
        assert_eq!(limited.len(), 1);
    }
}
