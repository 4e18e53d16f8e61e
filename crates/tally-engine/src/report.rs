//! Spreadsheet generation for report schedules.

use chrono::{DateTime, Utc};
use rust_xlsxwriter::{Workbook, XlsxError};
use serde_json::Value;
use tally_db::{Database, NewReport, ReportRecord, ReportStatus, ReportType, ScheduleRecord};
use tracing::{error, info, instrument, warn};

use crate::{
    executor::{QueryExecutor, Record},
    identity::{Actor, Role},
    schedule::CronSchedule,
};

/// Result of one generation run.
#[derive(Debug, Clone)]
pub struct ReportOutcome {
    pub report: ReportRecord,
    pub sheet_names: Vec<String>,
}

/// One worksheet worth of query output.
#[derive(Debug, Clone, PartialEq)]
pub struct SheetData {
    pub name: String,
    pub records: Vec<Record>,
}

/// Executes a schedule's queries and stores the workbook as a report.
#[derive(Debug, Clone)]
pub struct ReportBuilder {
    db: Database,
    executor: QueryExecutor,
}

impl ReportBuilder {
    pub fn new(db: Database, executor: QueryExecutor) -> Self {
        Self { db, executor }
    }

    /// Inserts the `pending` report row for a firing.
    pub async fn begin(
        &self,
        schedule: &ScheduleRecord,
        generated_at: DateTime<Utc>,
    ) -> anyhow::Result<ReportRecord> {
        self.db
            .create_pending_report(NewReport {
                user_id: schedule.user_id,
                schedule_id: Some(schedule.id),
                name: &schedule.name,
                report_type: schedule.report_type,
                generated_at,
            })
            .await
    }

    /// Fills a pending report and advances the schedule. Per-query failures
    /// only drop that query's sheet; a workbook failure marks the report failed.
    /// Once the report is finalized the run no longer fails.
    #[instrument(
        skip(self, schedule, report),
        fields(schedule_id = schedule.id, report_id = report.id)
    )]
    pub async fn complete(
        &self,
        schedule: &ScheduleRecord,
        report: &ReportRecord,
    ) -> anyhow::Result<ReportOutcome> {
        let sheets = self.collect_sheets(schedule).await;
        let mut sheet_names: Vec<String> = sheets.iter().map(|sheet| sheet.name.clone()).collect();

        let rendered = tokio::task::spawn_blocking(move || render_workbook(&sheets))
            .await
            .map_err(|err| err.to_string())
            .and_then(|result| result.map_err(|err| err.to_string()));

        let mut finished = report.clone();
        let transitioned = match rendered {
            Ok(content) => {
                let transitioned = self.db.mark_report_succeeded(report.id, &content).await?;
                info!(sheets = sheet_names.len(), bytes = content.len(), "report generated");
                finished.status = ReportStatus::Success;
                finished.content = Some(content);
                transitioned
            }
            Err(message) => {
                warn!(error = %message, "workbook generation failed");
                let error = format!("failed to generate workbook: {message}");
                let transitioned = self.db.mark_report_failed(report.id, &error).await?;
                finished.status = ReportStatus::Failed;
                finished.error = Some(error);
                sheet_names.clear();
                transitioned
            }
        };
        if !transitioned {
            warn!("report was already finalized; keeping the stored result");
        }

        // The lease is left to expire when this fails; the report is kept.
        if let Err(err) = self.advance(schedule).await {
            error!(error = %err, "failed to advance schedule after report run");
        }

        Ok(ReportOutcome {
            report: finished,
            sheet_names,
        })
    }

    pub async fn generate(&self, schedule: &ScheduleRecord) -> anyhow::Result<ReportOutcome> {
        let report = self.begin(schedule, Utc::now()).await?;
        self.complete(schedule, &report).await
    }

    /// Records an aborted run as failed and still advances the schedule. A
    /// report that already finished keeps its stored result.
    pub async fn abandon(
        &self,
        schedule: &ScheduleRecord,
        report_id: i64,
        reason: &str,
    ) -> anyhow::Result<()> {
        if !self.db.mark_report_failed(report_id, reason).await? {
            info!(report_id, "abandoned run had already finalized its report");
        }
        self.advance(schedule).await
    }

    /// Sets `last_run` to now and `next_run` to the next firing after now,
    /// releasing the run lease. A pattern that no longer parses deactivates
    /// the schedule.
    pub async fn advance(&self, schedule: &ScheduleRecord) -> anyhow::Result<()> {
        let now = Utc::now();
        let next_run = match CronSchedule::parse(&schedule.cron_pattern) {
            Ok(cron) => cron.next_after(now),
            Err(err) => {
                warn!(
                    schedule_id = schedule.id,
                    error = %err,
                    "stored cron pattern invalid; deactivating schedule"
                );
                None
            }
        };
        self.db.complete_schedule_run(schedule.id, now, next_run).await
    }

    async fn collect_sheets(&self, schedule: &ScheduleRecord) -> Vec<SheetData> {
        let owner = schedule_owner(schedule);
        let mut sheets = Vec::with_capacity(schedule.query_ids.len());
        for (position, query_id) in schedule.query_ids.iter().copied().enumerate() {
            match self.run_query(&owner, query_id).await {
                Ok(records) => sheets.push(SheetData {
                    name: format!("Query_{}", position + 1),
                    records,
                }),
                Err(err) => {
                    warn!(query_id, error = %err, "skipping query in report");
                }
            }
        }
        sheets
    }

    async fn run_query(&self, owner: &Actor, query_id: i64) -> anyhow::Result<Vec<Record>> {
        let query = self
            .db
            .fetch_query(query_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("query {} not found", query_id))?;
        if !owner.can_manage(query.user_id) {
            anyhow::bail!("query {} is not executable by the schedule owner", query_id);
        }
        let source = self
            .db
            .fetch_data_source(query.data_source_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("data source {} not found", query.data_source_id))?;
        Ok(self.executor.execute(&source, &query.sql_text).await?)
    }
}

/// The identity a schedule runs as: its owner, with the role held when the
/// schedule was created.
pub(crate) fn schedule_owner(schedule: &ScheduleRecord) -> Actor {
    let role = if schedule.owner_is_admin {
        Role::Admin
    } else {
        Role::User
    };
    Actor::new(schedule.user_id, role)
}

/// Serialises sheets into an xlsx container. The header row is the first
/// record's column names; `NULL` cells are left blank.
pub fn render_workbook(sheets: &[SheetData]) -> Result<Vec<u8>, XlsxError> {
    let mut workbook = Workbook::new();

    for sheet in sheets {
        let worksheet = workbook.add_worksheet();
        worksheet.set_name(sheet.name.as_str())?;

        let Some(first) = sheet.records.first() else {
            continue;
        };
        let columns: Vec<&String> = first.keys().collect();

        for (col, name) in columns.iter().enumerate() {
            worksheet.write_string(0, col as u16, name.as_str())?;
        }

        for (index, record) in sheet.records.iter().enumerate() {
            let row = index as u32 + 1;
            for (col, name) in columns.iter().enumerate() {
                let col = col as u16;
                match record.get(*name) {
                    None | Some(Value::Null) => {}
                    Some(Value::Bool(flag)) => {
                        worksheet.write_boolean(row, col, *flag)?;
                    }
                    Some(Value::Number(number)) => match number.as_f64() {
                        Some(value) => {
                            worksheet.write_number(row, col, value)?;
                        }
                        None => {
                            worksheet.write_string(row, col, number.to_string())?;
                        }
                    },
                    Some(Value::String(text)) => {
                        worksheet.write_string(row, col, text.as_str())?;
                    }
                    Some(other) => {
                        worksheet.write_string(row, col, other.to_string())?;
                    }
                }
            }
        }
    }

    workbook.save_to_buffer()
}

/// Download file name for a generated report.
pub fn report_file_name(
    name: &str,
    report_type: ReportType,
    generated_at: DateTime<Utc>,
) -> String {
    match report_type {
        ReportType::Daily => format!("{}_{}.xlsx", name, generated_at.format("%Y-%m-%d")),
        ReportType::Weekly => format!("{}_week_{}.xlsx", name, generated_at.format("%Y-%m-%d")),
        ReportType::Monthly => format!("{}_{}.xlsx", name, generated_at.format("%Y-%m")),
    }
}
