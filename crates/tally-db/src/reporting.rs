//! Report schedules, their run leases and generated reports.

use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use sqlx::{sqlite::SqliteRow, Row};

use crate::{
    encode_timestamp, parse_datetime, parse_optional_datetime, CatalogError, Database,
    ReportRecord, ReportStatus, ReportType, ScheduleRecord,
};

#[derive(Debug, Clone)]
pub struct NewSchedule<'a> {
    pub user_id: i64,
    /// Whether the owner held the admin role when the schedule was created.
    pub owner_is_admin: bool,
    pub name: &'a str,
    pub report_type: ReportType,
    pub description: &'a str,
    pub query_ids: &'a [i64],
    pub chart_ids: &'a [i64],
    pub template_ids: &'a [i64],
    pub cron_pattern: &'a str,
    pub active: bool,
    pub next_run: Option<DateTime<Utc>>,
}

/// Full replacement of the mutable schedule fields, `next_run` included.
#[derive(Debug, Clone)]
pub struct ScheduleChanges<'a> {
    pub name: &'a str,
    pub report_type: ReportType,
    pub description: &'a str,
    pub query_ids: &'a [i64],
    pub chart_ids: &'a [i64],
    pub template_ids: &'a [i64],
    pub cron_pattern: &'a str,
    pub active: bool,
    pub next_run: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewReport<'a> {
    pub user_id: i64,
    pub schedule_id: Option<i64>,
    pub name: &'a str,
    pub report_type: ReportType,
    pub generated_at: DateTime<Utc>,
}

impl Database {
    pub async fn create_schedule(&self, data: NewSchedule<'_>) -> Result<ScheduleRecord> {
        let now = encode_timestamp(Utc::now());
        let result = sqlx::query(
            r#"
            INSERT INTO report_schedules (
                user_id, owner_is_admin, name, report_type, description, query_ids,
                chart_ids, template_ids, cron_pattern, active, next_run, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(data.user_id)
        .bind(data.owner_is_admin)
        .bind(data.name)
        .bind(data.report_type.as_str())
        .bind(data.description)
        .bind(serde_json::to_string(data.query_ids)?)
        .bind(serde_json::to_string(data.chart_ids)?)
        .bind(serde_json::to_string(data.template_ids)?)
        .bind(data.cron_pattern)
        .bind(data.active)
        .bind(data.next_run.map(encode_timestamp))
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        self.fetch_schedule(id)
            .await?
            .ok_or_else(|| anyhow!("schedule {} inserted but missing when reloaded", id))
    }

    pub async fn fetch_schedule(&self, id: i64) -> Result<Option<ScheduleRecord>> {
        let row = sqlx::query("SELECT * FROM report_schedules WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(map_schedule).transpose()
    }

    /// `owner: None` lists every schedule.
    pub async fn list_schedules(&self, owner: Option<i64>) -> Result<Vec<ScheduleRecord>> {
        let mut rows = sqlx::query(
            r#"
            SELECT * FROM report_schedules
            WHERE ?1 IS NULL OR user_id = ?1
            ORDER BY created_at DESC, id DESC
            "#,
        )
        .bind(owner)
        .fetch(&self.pool);

        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(map_schedule(row)?);
        }
        Ok(out)
    }

    pub async fn update_schedule(
        &self,
        id: i64,
        changes: ScheduleChanges<'_>,
    ) -> Result<ScheduleRecord> {
        let now = encode_timestamp(Utc::now());
        let result = sqlx::query(
            r#"
            UPDATE report_schedules
            SET name = ?, report_type = ?, description = ?, query_ids = ?, chart_ids = ?,
                template_ids = ?, cron_pattern = ?, active = ?, next_run = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(changes.name)
        .bind(changes.report_type.as_str())
        .bind(changes.description)
        .bind(serde_json::to_string(changes.query_ids)?)
        .bind(serde_json::to_string(changes.chart_ids)?)
        .bind(serde_json::to_string(changes.template_ids)?)
        .bind(changes.cron_pattern)
        .bind(changes.active)
        .bind(changes.next_run.map(encode_timestamp))
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CatalogError::NotFound {
                kind: "report schedule",
                id,
            }
            .into());
        }

        self.fetch_schedule(id)
            .await?
            .ok_or_else(|| anyhow!("schedule {} updated but missing when reloaded", id))
    }

    pub async fn delete_schedule(&self, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM report_schedules WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CatalogError::NotFound {
                kind: "report schedule",
                id,
            }
            .into());
        }
        Ok(())
    }

    /// Ids of schedules whose query list contains `query_id`.
    pub async fn schedules_referencing_query(&self, query_id: i64) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar(
            r#"
            SELECT DISTINCT s.id
            FROM report_schedules AS s, json_each(s.query_ids) AS j
            WHERE j.value = ?
            ORDER BY s.id
            "#,
        )
        .bind(query_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    /// Active schedules whose `next_run` has passed and that hold no live lease.
    pub async fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleRecord>> {
        let now = encode_timestamp(now);
        let mut rows = sqlx::query(
            r#"
            SELECT * FROM report_schedules
            WHERE active = 1
              AND next_run IS NOT NULL
              AND next_run <= ?1
              AND (lease_until IS NULL OR lease_until <= ?1)
            ORDER BY next_run ASC, id ASC
            "#,
        )
        .bind(&now)
        .fetch(&self.pool);

        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(map_schedule(row)?);
        }
        Ok(out)
    }

    /// Takes the run lease for one firing of a schedule. The update only applies
    /// while `next_run` still equals the value the caller observed and no other
    /// lease is live, so exactly one claimant wins per firing.
    pub async fn claim_schedule(
        &self,
        id: i64,
        expected_next_run: DateTime<Utc>,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<bool> {
        let now = encode_timestamp(now);
        let result = sqlx::query(
            r#"
            UPDATE report_schedules
            SET lease_until = ?, updated_at = ?
            WHERE id = ?
              AND active = 1
              AND next_run = ?
              AND (lease_until IS NULL OR lease_until <= ?)
            "#,
        )
        .bind(encode_timestamp(lease_until))
        .bind(&now)
        .bind(id)
        .bind(encode_timestamp(expected_next_run))
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Records a finished run and releases the lease. `next_run: None`
    /// deactivates the schedule.
    pub async fn complete_schedule_run(
        &self,
        id: i64,
        last_run: DateTime<Utc>,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE report_schedules
            SET last_run = ?1,
                next_run = ?2,
                active = CASE WHEN ?2 IS NULL THEN 0 ELSE active END,
                lease_until = NULL,
                updated_at = ?3
            WHERE id = ?4
            "#,
        )
        .bind(encode_timestamp(last_run))
        .bind(next_run.map(encode_timestamp))
        .bind(encode_timestamp(Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn create_pending_report(&self, data: NewReport<'_>) -> Result<ReportRecord> {
        let now = encode_timestamp(Utc::now());
        let result = sqlx::query(
            r#"
            INSERT INTO reports (
                user_id, schedule_id, name, report_type, generated_at, status,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(data.user_id)
        .bind(data.schedule_id)
        .bind(data.name)
        .bind(data.report_type.as_str())
        .bind(encode_timestamp(data.generated_at))
        .bind(ReportStatus::Pending.as_str())
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        self.fetch_report(id)
            .await?
            .ok_or_else(|| anyhow!("report {} inserted but missing when reloaded", id))
    }

    /// Finalizes a pending report. Returns `false` when the report had
    /// already left `pending`.
    pub async fn mark_report_succeeded(&self, id: i64, content: &[u8]) -> Result<bool> {
        self.finish_report(id, ReportStatus::Success, None, Some(content))
            .await
    }

    /// Fails a pending report. A report that already finished is left as is
    /// and `false` is returned.
    pub async fn mark_report_failed(&self, id: i64, error: &str) -> Result<bool> {
        self.finish_report(id, ReportStatus::Failed, Some(error), None)
            .await
    }

    async fn finish_report(
        &self,
        id: i64,
        status: ReportStatus,
        error: Option<&str>,
        content: Option<&[u8]>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE reports
            SET status = ?, error = ?, content = ?, updated_at = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(status.as_str())
        .bind(error)
        .bind(content)
        .bind(encode_timestamp(Utc::now()))
        .bind(id)
        .bind(ReportStatus::Pending.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        if self.fetch_report_status(id).await?.is_none() {
            return Err(CatalogError::NotFound { kind: "report", id }.into());
        }
        Ok(false)
    }

    async fn fetch_report_status(&self, id: i64) -> Result<Option<ReportStatus>> {
        let status: Option<String> = sqlx::query_scalar("SELECT status FROM reports WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        status.map(|raw| ReportStatus::from_str(&raw)).transpose()
    }

    /// Loads one report including its binary content.
    pub async fn fetch_report(&self, id: i64) -> Result<Option<ReportRecord>> {
        let row = sqlx::query("SELECT * FROM reports WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(map_report).transpose()
    }

    /// Lists reports newest first without their content. `owner: None` lists all.
    pub async fn list_reports(&self, owner: Option<i64>) -> Result<Vec<ReportRecord>> {
        let mut rows = sqlx::query(
            r#"
            SELECT id, user_id, schedule_id, name, report_type, generated_at, status,
                   error, NULL AS content, created_at, updated_at
            FROM reports
            WHERE ?1 IS NULL OR user_id = ?1
            ORDER BY generated_at DESC, id DESC
            "#,
        )
        .bind(owner)
        .fetch(&self.pool);

        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(map_report(row)?);
        }
        Ok(out)
    }
}

fn decode_ids(row: &SqliteRow, column: &str) -> Result<Vec<i64>> {
    let raw: String = row.try_get(column)?;
    serde_json::from_str(&raw).with_context(|| format!("failed to deserialize {column} JSON"))
}

fn map_schedule(row: SqliteRow) -> Result<ScheduleRecord> {
    let report_type: String = row.try_get("report_type")?;

    Ok(ScheduleRecord {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        owner_is_admin: row.try_get("owner_is_admin")?,
        name: row.try_get("name")?,
        report_type: ReportType::from_str(&report_type)?,
        description: row.try_get("description")?,
        query_ids: decode_ids(&row, "query_ids")?,
        chart_ids: decode_ids(&row, "chart_ids")?,
        template_ids: decode_ids(&row, "template_ids")?,
        cron_pattern: row.try_get("cron_pattern")?,
        active: row.try_get("active")?,
        last_run: parse_optional_datetime(row.try_get("last_run")?)?,
        next_run: parse_optional_datetime(row.try_get("next_run")?)?,
        lease_until: parse_optional_datetime(row.try_get("lease_until")?)?,
        created_at: parse_datetime(row.try_get("created_at")?)?,
        updated_at: parse_datetime(row.try_get("updated_at")?)?,
    })
}

fn map_report(row: SqliteRow) -> Result<ReportRecord> {
    let report_type: String = row.try_get("report_type")?;
    let status: String = row.try_get("status")?;

    Ok(ReportRecord {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        schedule_id: row.try_get("schedule_id")?,
        name: row.try_get("name")?,
        report_type: ReportType::from_str(&report_type)?,
        generated_at: parse_datetime(row.try_get("generated_at")?)?,
        status: ReportStatus::from_str(&status)?,
        error: row.try_get("error")?,
        content: row.try_get("content")?,
        created_at: parse_datetime(row.try_get("created_at")?)?,
        updated_at: parse_datetime(row.try_get("updated_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::setup_db;
    use chrono::{Duration, TimeZone};

    fn every_minute(next_run: DateTime<Utc>, query_ids: &[i64]) -> NewSchedule<'_> {
        NewSchedule {
            user_id: 7,
            owner_is_admin: false,
            name: "ops",
            report_type: ReportType::Daily,
            description: "",
            query_ids,
            chart_ids: &[],
            template_ids: &[],
            cron_pattern: "* * * * *",
            active: true,
            next_run: Some(next_run),
        }
    }

    #[tokio::test]
    async fn due_schedules_respect_active_flag_and_next_run() {
        let (db, _tmp) = setup_db().await;
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();

        let due = db.create_schedule(every_minute(now, &[1])).await.unwrap();
        db.create_schedule(every_minute(now + Duration::minutes(5), &[1]))
            .await
            .unwrap();
        let mut inactive = every_minute(now, &[1]);
        inactive.active = false;
        db.create_schedule(inactive).await.unwrap();

        let found = db.due_schedules(now).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, due.id);
        assert_eq!(found[0].query_ids, vec![1]);
    }

    #[tokio::test]
    async fn claim_is_exclusive_per_firing() {
        let (db, _tmp) = setup_db().await;
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let schedule = db.create_schedule(every_minute(now, &[])).await.unwrap();
        let lease = now + Duration::minutes(30);

        assert!(db.claim_schedule(schedule.id, now, now, lease).await.unwrap());
        assert!(!db.claim_schedule(schedule.id, now, now, lease).await.unwrap());
        assert!(db.due_schedules(now).await.unwrap().is_empty());

        let next = now + Duration::minutes(1);
        db.complete_schedule_run(schedule.id, now, Some(next))
            .await
            .unwrap();
        let reloaded = db.fetch_schedule(schedule.id).await.unwrap().unwrap();
        assert_eq!(reloaded.last_run, Some(now));
        assert_eq!(reloaded.next_run, Some(next));
        assert!(reloaded.lease_until.is_none());
        assert!(db.claim_schedule(schedule.id, next, next, lease).await.unwrap());
    }

    #[tokio::test]
    async fn completing_without_next_run_deactivates() {
        let (db, _tmp) = setup_db().await;
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let schedule = db.create_schedule(every_minute(now, &[])).await.unwrap();

        db.complete_schedule_run(schedule.id, now, None).await.unwrap();
        let reloaded = db.fetch_schedule(schedule.id).await.unwrap().unwrap();
        assert!(!reloaded.active);
        assert!(reloaded.next_run.is_none());
    }

    #[tokio::test]
    async fn schedules_referencing_query_reads_json_lists() {
        let (db, _tmp) = setup_db().await;
        let now = Utc::now();
        let first = db.create_schedule(every_minute(now, &[3, 4])).await.unwrap();
        db.create_schedule(every_minute(now, &[5])).await.unwrap();

        assert_eq!(db.schedules_referencing_query(4).await.unwrap(), vec![first.id]);
        assert!(db.schedules_referencing_query(9).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn report_lifecycle_updates_in_place() {
        let (db, _tmp) = setup_db().await;
        let generated_at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let pending = db
            .create_pending_report(NewReport {
                user_id: 7,
                schedule_id: None,
                name: "ops",
                report_type: ReportType::Weekly,
                generated_at,
            })
            .await
            .unwrap();
        assert_eq!(pending.status, ReportStatus::Pending);

        assert!(db.mark_report_succeeded(pending.id, b"PK\x03\x04").await.unwrap());
        let stored = db.fetch_report(pending.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ReportStatus::Success);
        assert_eq!(stored.content.as_deref(), Some(&b"PK\x03\x04"[..]));

        // A finished report is never rewritten by a late failure.
        assert!(!db.mark_report_failed(pending.id, "late failure").await.unwrap());
        let kept = db.fetch_report(pending.id).await.unwrap().unwrap();
        assert_eq!(kept.status, ReportStatus::Success);
        assert!(kept.error.is_none());
        assert_eq!(kept.content.as_deref(), Some(&b"PK\x03\x04"[..]));

        let missing = db.mark_report_failed(pending.id + 100, "gone").await.unwrap_err();
        assert!(matches!(
            missing.downcast_ref::<CatalogError>(),
            Some(CatalogError::NotFound { kind: "report", .. })
        ));

        let listed = db.list_reports(Some(7)).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].content.is_none());
        assert!(db.list_reports(Some(8)).await.unwrap().is_empty());
    }
}
