//! Tally query execution and report pipeline.
//!
//! [`TallyEngine`] is the service object the HTTP layer talks to. It owns the
//! credential vault, the transient-connection executor and the result cache,
//! and applies ownership and visibility rules on top of the `tally-db`
//! catalog. Background work (cache sweeping, scheduled report generation) is
//! exposed as [`BackgroundWorker`]s sharing the same state.

pub mod cache;
pub mod connector;
pub mod executor;
pub mod identity;
pub mod report;
pub mod schedule;
pub mod scheduler;
pub mod vault;
pub mod worker;

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tally_db::{
    CatalogError, DataSourceChanges, DataSourceRecord, Database, NewDataSource, NewQuery,
    NewSchedule, QueryChanges, QueryRecord, ReportRecord, ReportStatus, ReportType,
    ScheduleChanges, ScheduleRecord,
};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::report::schedule_owner;

pub use cache::{CacheConfig, CacheKey, CacheSweeper, ClearScope, ResultCache};
pub use connector::{ConnectionResolver, ConnectorError, EngineKind};
pub use executor::{ExecutionError, QueryExecutor, Record};
pub use identity::{Actor, Role};
pub use report::{report_file_name, ReportBuilder, ReportOutcome};
pub use schedule::{CronError, CronSchedule};
pub use scheduler::{ReportScheduler, SchedulerConfig};
pub use vault::{CredentialVault, VaultError};
pub use worker::{BackgroundWorker, WorkerRegistry};

/// Logical configuration driving the engine behaviour.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineConfig {
    pub cache: CacheConfig,
    pub scheduler: SchedulerConfig,
    /// Deadline for one query execution; `None` waits indefinitely.
    pub query_timeout: Option<Duration>,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: i64 },
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    Invalid(String),
    #[error("{0}")]
    InUse(String),
    #[error("report {0} is not ready for download")]
    NotReady(i64),
    #[error("could not decrypt data source password")]
    Credential(#[source] VaultError),
    #[error(transparent)]
    Execution(ExecutionError),
    #[error(transparent)]
    Storage(anyhow::Error),
}

impl From<anyhow::Error> for EngineError {
    fn from(value: anyhow::Error) -> Self {
        match value.downcast::<CatalogError>() {
            Ok(CatalogError::NotFound { kind, id }) => EngineError::NotFound { kind, id },
            Err(other) => EngineError::Storage(other),
        }
    }
}

impl From<ExecutionError> for EngineError {
    fn from(value: ExecutionError) -> Self {
        match value {
            ExecutionError::Connector(ConnectorError::Credential(err)) => {
                EngineError::Credential(err)
            }
            other => EngineError::Execution(other),
        }
    }
}

/// Data source fields supplied by a caller. `secret` is plaintext and is
/// encrypted before it reaches storage.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DataSourceInput {
    pub name: String,
    pub engine: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub database_name: String,
    #[serde(default)]
    pub username: String,
    /// On update, `None` or an empty string keeps the stored secret.
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_public: bool,
}

/// Outward representation of a data source. It carries no secret material,
/// only whether one is stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSourceView {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub engine: String,
    pub host: String,
    pub port: u16,
    pub database_name: String,
    pub username: String,
    pub has_secret: bool,
    pub description: String,
    pub is_public: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<DataSourceRecord> for DataSourceView {
    fn from(record: DataSourceRecord) -> Self {
        Self {
            id: record.id,
            user_id: record.user_id,
            name: record.name,
            engine: record.engine,
            host: record.host,
            port: record.port,
            database_name: record.database_name,
            username: record.username,
            has_secret: !record.encrypted_secret.is_empty(),
            description: record.description,
            is_public: record.is_public,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryInput {
    pub data_source_id: i64,
    pub name: String,
    pub sql_text: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_public: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleInput {
    pub name: String,
    pub report_type: ReportType,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub query_ids: Vec<i64>,
    #[serde(default)]
    pub chart_ids: Vec<i64>,
    #[serde(default)]
    pub template_ids: Vec<i64>,
    pub cron_pattern: String,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

/// Binary report content with its download name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportDownload {
    pub file_name: String,
    pub content: Vec<u8>,
}

/// High-level API exposed by the engine.
#[derive(Clone)]
pub struct TallyEngine {
    db: Database,
    vault: CredentialVault,
    executor: QueryExecutor,
    cache: Arc<ResultCache>,
    config: EngineConfig,
}

impl TallyEngine {
    pub fn new(db: Database, vault: CredentialVault, config: EngineConfig) -> Self {
        let executor =
            QueryExecutor::new(ConnectionResolver::new(vault.clone()), config.query_timeout);
        Self {
            db,
            vault,
            executor,
            cache: Arc::new(ResultCache::new(config.cache)),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    pub fn report_builder(&self) -> ReportBuilder {
        ReportBuilder::new(self.db.clone(), self.executor.clone())
    }

    pub fn scheduler(&self) -> ReportScheduler {
        ReportScheduler::new(self.db.clone(), self.report_builder(), self.config.scheduler)
    }

    pub fn cache_sweeper(&self) -> CacheSweeper {
        CacheSweeper::new(self.cache.clone())
    }

    /// Runs a stored query on demand. Only the owner or an admin may execute,
    /// even when the query is public.
    #[instrument(skip(self), fields(user_id = actor.user_id))]
    pub async fn execute_query(
        &self,
        actor: &Actor,
        query_id: i64,
    ) -> Result<Vec<Record>, EngineError> {
        let query = self.load_query(query_id).await?;
        if !actor.can_manage(query.user_id) {
            return Err(EngineError::Forbidden(
                "only the query owner or an admin may execute it".into(),
            ));
        }
        let source = self.load_data_source(query.data_source_id).await?;

        let records = self.executor.execute(&source, &query.sql_text).await?;
        self.db.increment_exec_count(query.id).await?;
        self.cache.invalidate(ClearScope::Query(query.id));
        self.cache.invalidate(ClearScope::List);

        info!(query_id, rows = records.len(), "query executed");
        Ok(records)
    }

    #[instrument(skip(self, input), fields(user_id = actor.user_id))]
    pub async fn create_data_source(
        &self,
        actor: &Actor,
        input: DataSourceInput,
    ) -> Result<DataSourceView, EngineError> {
        validate_data_source(&input)?;
        let encrypted = self.seal(input.secret.as_deref().unwrap_or_default())?;

        let record = self
            .db
            .create_data_source(NewDataSource {
                user_id: actor.user_id,
                name: input.name.trim(),
                engine: input.engine.trim(),
                host: input.host.trim(),
                port: input.port,
                database_name: input.database_name.trim(),
                username: &input.username,
                encrypted_secret: &encrypted,
                description: &input.description,
                is_public: input.is_public,
            })
            .await?;
        self.cache.flush();

        info!(data_source_id = record.id, engine = %record.engine, "data source created");
        Ok(record.into())
    }

    #[instrument(skip(self, input), fields(user_id = actor.user_id))]
    pub async fn update_data_source(
        &self,
        actor: &Actor,
        id: i64,
        input: DataSourceInput,
    ) -> Result<DataSourceView, EngineError> {
        let existing = self.load_data_source(id).await?;
        if !actor.can_manage(existing.user_id) {
            return Err(EngineError::Forbidden(
                "only the owner or an admin may modify this data source".into(),
            ));
        }
        validate_data_source(&input)?;

        let encrypted = match input.secret.as_deref() {
            Some(secret) if !secret.is_empty() => Some(self.seal(secret)?),
            _ => None,
        };

        let record = self
            .db
            .update_data_source(
                id,
                DataSourceChanges {
                    name: input.name.trim(),
                    engine: input.engine.trim(),
                    host: input.host.trim(),
                    port: input.port,
                    database_name: input.database_name.trim(),
                    username: &input.username,
                    encrypted_secret: encrypted.as_deref(),
                    description: &input.description,
                    is_public: input.is_public,
                },
            )
            .await?;
        self.cache.flush();

        info!(data_source_id = id, "data source updated");
        Ok(record.into())
    }

    #[instrument(skip(self), fields(user_id = actor.user_id))]
    pub async fn delete_data_source(&self, actor: &Actor, id: i64) -> Result<(), EngineError> {
        let existing = self.load_data_source(id).await?;
        if !actor.can_manage(existing.user_id) {
            return Err(EngineError::Forbidden(
                "only the owner or an admin may delete this data source".into(),
            ));
        }
        let in_use = self.db.count_queries_for_data_source(id).await?;
        if in_use > 0 {
            return Err(EngineError::InUse(format!(
                "cannot delete data source {id}: {in_use} queries still use it"
            )));
        }

        self.db.delete_data_source(id).await?;
        self.cache.flush();
        info!(data_source_id = id, "data source deleted");
        Ok(())
    }

    pub async fn get_data_source(
        &self,
        actor: &Actor,
        id: i64,
    ) -> Result<DataSourceView, EngineError> {
        let record = self.load_data_source(id).await?;
        if !actor.can_view(record.user_id, record.is_public) {
            return Err(EngineError::Forbidden(
                "data source is not visible to this user".into(),
            ));
        }
        Ok(record.into())
    }

    pub async fn list_data_sources(
        &self,
        actor: &Actor,
    ) -> Result<Vec<DataSourceView>, EngineError> {
        let records = self.db.list_data_sources(actor.scope()).await?;
        Ok(records.into_iter().map(DataSourceView::from).collect())
    }

    #[instrument(skip(self, input), fields(user_id = actor.user_id))]
    pub async fn create_query(
        &self,
        actor: &Actor,
        input: QueryInput,
    ) -> Result<QueryRecord, EngineError> {
        validate_query(&input)?;
        self.check_data_source_usable(actor, input.data_source_id)
            .await?;

        let record = self
            .db
            .create_query(NewQuery {
                user_id: actor.user_id,
                data_source_id: input.data_source_id,
                name: input.name.trim(),
                sql_text: &input.sql_text,
                description: &input.description,
                is_public: input.is_public,
            })
            .await?;
        self.cache.flush();

        info!(query_id = record.id, "query created");
        Ok(record)
    }

    #[instrument(skip(self, input), fields(user_id = actor.user_id))]
    pub async fn update_query(
        &self,
        actor: &Actor,
        id: i64,
        input: QueryInput,
    ) -> Result<QueryRecord, EngineError> {
        let existing = self.load_query(id).await?;
        if !actor.can_manage(existing.user_id) {
            return Err(EngineError::Forbidden(
                "only the owner or an admin may modify this query".into(),
            ));
        }
        validate_query(&input)?;
        if input.data_source_id != existing.data_source_id {
            self.check_data_source_usable(actor, input.data_source_id)
                .await?;
        }

        let record = self
            .db
            .update_query(
                id,
                QueryChanges {
                    data_source_id: input.data_source_id,
                    name: input.name.trim(),
                    sql_text: &input.sql_text,
                    description: &input.description,
                    is_public: input.is_public,
                },
            )
            .await?;
        self.cache.flush();

        info!(query_id = id, "query updated");
        Ok(record)
    }

    #[instrument(skip(self), fields(user_id = actor.user_id))]
    pub async fn delete_query(&self, actor: &Actor, id: i64) -> Result<(), EngineError> {
        let existing = self.load_query(id).await?;
        if !actor.can_manage(existing.user_id) {
            return Err(EngineError::Forbidden(
                "only the owner or an admin may delete this query".into(),
            ));
        }
        let schedules = self.db.schedules_referencing_query(id).await?;
        if !schedules.is_empty() {
            return Err(EngineError::InUse(format!(
                "cannot delete query {id}: referenced by report schedules {schedules:?}"
            )));
        }

        self.db.delete_query(id).await?;
        self.cache.flush();
        info!(query_id = id, "query deleted");
        Ok(())
    }

    /// Cached single-query read honouring owner/public/admin visibility.
    pub async fn get_query(&self, actor: &Actor, id: i64) -> Result<QueryRecord, EngineError> {
        let key = CacheKey::get_query(id, *actor);
        if let Some(hit) = self.cached::<QueryRecord>(&key) {
            return Ok(hit);
        }

        let record = self.load_query(id).await?;
        if !actor.can_view(record.user_id, record.is_public) {
            return Err(EngineError::Forbidden(
                "query is not visible to this user".into(),
            ));
        }
        self.store_cached(key, &record);
        Ok(record)
    }

    /// Cached list of the queries visible to `actor`.
    pub async fn list_queries(&self, actor: &Actor) -> Result<Vec<QueryRecord>, EngineError> {
        let key = CacheKey::list_queries(*actor);
        if let Some(hit) = self.cached::<Vec<QueryRecord>>(&key) {
            return Ok(hit);
        }

        let records = self.db.list_queries(actor.scope()).await?;
        self.store_cached(key, &records);
        Ok(records)
    }

    pub fn get_query_cache(&self, key: &CacheKey) -> Option<serde_json::Value> {
        self.cache.get(key)
    }

    pub fn set_query_cache(&self, key: CacheKey, value: serde_json::Value) {
        self.cache.insert(key, value);
    }

    /// Administrative invalidation; returns the number of entries dropped.
    #[instrument(skip(self), fields(user_id = actor.user_id))]
    pub fn clear_cache(&self, actor: &Actor, scope: ClearScope) -> Result<usize, EngineError> {
        if !actor.is_admin() {
            return Err(EngineError::Forbidden(
                "only admins may clear the cache".into(),
            ));
        }
        let removed = self.cache.invalidate(scope);
        info!(?scope, removed, "cache cleared");
        Ok(removed)
    }

    #[instrument(skip(self, input), fields(user_id = actor.user_id))]
    pub async fn create_schedule(
        &self,
        actor: &Actor,
        input: ScheduleInput,
    ) -> Result<ScheduleRecord, EngineError> {
        let cron = validate_schedule(&input)?;
        self.check_queries_runnable(actor, &input.query_ids).await?;
        let next_run = cron.next_after(Utc::now());

        let record = self
            .db
            .create_schedule(NewSchedule {
                user_id: actor.user_id,
                owner_is_admin: actor.is_admin(),
                name: input.name.trim(),
                report_type: input.report_type,
                description: &input.description,
                query_ids: &input.query_ids,
                chart_ids: &input.chart_ids,
                template_ids: &input.template_ids,
                cron_pattern: cron.expression(),
                active: input.active,
                next_run,
            })
            .await?;

        info!(schedule_id = record.id, cron = %record.cron_pattern, "report schedule created");
        Ok(record)
    }

    #[instrument(skip(self, input), fields(user_id = actor.user_id))]
    pub async fn update_schedule(
        &self,
        actor: &Actor,
        id: i64,
        input: ScheduleInput,
    ) -> Result<ScheduleRecord, EngineError> {
        let existing = self.load_schedule(id).await?;
        if !actor.can_manage(existing.user_id) {
            return Err(EngineError::Forbidden(
                "only the owner or an admin may modify this schedule".into(),
            ));
        }
        let cron = validate_schedule(&input)?;
        self.check_queries_runnable(&schedule_owner(&existing), &input.query_ids)
            .await?;

        let reschedule = cron.expression() != existing.cron_pattern
            || (input.active && !existing.active)
            || existing.next_run.is_none();
        let next_run = if reschedule {
            cron.next_after(Utc::now())
        } else {
            existing.next_run
        };

        let record = self
            .db
            .update_schedule(
                id,
                ScheduleChanges {
                    name: input.name.trim(),
                    report_type: input.report_type,
                    description: &input.description,
                    query_ids: &input.query_ids,
                    chart_ids: &input.chart_ids,
                    template_ids: &input.template_ids,
                    cron_pattern: cron.expression(),
                    active: input.active,
                    next_run,
                },
            )
            .await?;

        info!(schedule_id = id, rescheduled = reschedule, "report schedule updated");
        Ok(record)
    }

    pub async fn get_schedule(
        &self,
        actor: &Actor,
        id: i64,
    ) -> Result<ScheduleRecord, EngineError> {
        let record = self.load_schedule(id).await?;
        if !actor.can_manage(record.user_id) {
            return Err(EngineError::Forbidden(
                "report schedule is not visible to this user".into(),
            ));
        }
        Ok(record)
    }

    pub async fn list_schedules(&self, actor: &Actor) -> Result<Vec<ScheduleRecord>, EngineError> {
        Ok(self.db.list_schedules(actor.scope()).await?)
    }

    #[instrument(skip(self), fields(user_id = actor.user_id))]
    pub async fn delete_schedule(&self, actor: &Actor, id: i64) -> Result<(), EngineError> {
        let existing = self.load_schedule(id).await?;
        if !actor.can_manage(existing.user_id) {
            return Err(EngineError::Forbidden(
                "only the owner or an admin may delete this schedule".into(),
            ));
        }
        self.db.delete_schedule(id).await?;
        info!(schedule_id = id, "report schedule deleted");
        Ok(())
    }

    pub async fn list_reports(&self, actor: &Actor) -> Result<Vec<ReportRecord>, EngineError> {
        Ok(self.db.list_reports(actor.scope()).await?)
    }

    /// Returns the stored workbook of a successful report.
    #[instrument(skip(self), fields(user_id = actor.user_id))]
    pub async fn download_report(
        &self,
        actor: &Actor,
        report_id: i64,
    ) -> Result<ReportDownload, EngineError> {
        let report = self
            .db
            .fetch_report(report_id)
            .await?
            .ok_or(EngineError::NotFound {
                kind: "report",
                id: report_id,
            })?;
        if !actor.can_manage(report.user_id) {
            return Err(EngineError::Forbidden(
                "report is not visible to this user".into(),
            ));
        }
        if report.status != ReportStatus::Success {
            return Err(EngineError::NotReady(report_id));
        }
        let content = report.content.ok_or(EngineError::NotReady(report_id))?;

        Ok(ReportDownload {
            file_name: report_file_name(&report.name, report.report_type, report.generated_at),
            content,
        })
    }

    fn seal(&self, plaintext: &str) -> Result<String, EngineError> {
        self.vault.encrypt(plaintext).map_err(|err| {
            EngineError::Storage(anyhow::anyhow!(
                "failed to encrypt data source password: {err}"
            ))
        })
    }

    fn cached<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        let value = self.get_query_cache(key)?;
        match serde_json::from_value(value) {
            Ok(hit) => {
                debug!(key = %key.fingerprint(), "cache hit");
                Some(hit)
            }
            Err(err) => {
                warn!(key = %key.fingerprint(), error = %err, "discarding undecodable cache entry");
                self.cache.delete(key);
                None
            }
        }
    }

    fn store_cached<T: Serialize>(&self, key: CacheKey, value: &T) {
        match serde_json::to_value(value) {
            Ok(json) => self.set_query_cache(key, json),
            Err(err) => warn!(error = %err, "failed to serialise cache entry"),
        }
    }

    async fn load_query(&self, id: i64) -> Result<QueryRecord, EngineError> {
        self.db
            .fetch_query(id)
            .await?
            .ok_or(EngineError::NotFound { kind: "query", id })
    }

    async fn load_data_source(&self, id: i64) -> Result<DataSourceRecord, EngineError> {
        self.db
            .fetch_data_source(id)
            .await?
            .ok_or(EngineError::NotFound {
                kind: "data source",
                id,
            })
    }

    async fn load_schedule(&self, id: i64) -> Result<ScheduleRecord, EngineError> {
        self.db
            .fetch_schedule(id)
            .await?
            .ok_or(EngineError::NotFound {
                kind: "report schedule",
                id,
            })
    }

    async fn check_data_source_usable(&self, actor: &Actor, id: i64) -> Result<(), EngineError> {
        let source = self.load_data_source(id).await?;
        if !actor.can_view(source.user_id, source.is_public) {
            return Err(EngineError::Forbidden(
                "data source is not visible to this user".into(),
            ));
        }
        Ok(())
    }

    /// A schedule runs its queries as its owner, so every referenced query
    /// must be one the owner may execute.
    async fn check_queries_runnable(&self, owner: &Actor, ids: &[i64]) -> Result<(), EngineError> {
        for id in ids {
            let query = self
                .db
                .fetch_query(*id)
                .await?
                .ok_or_else(|| EngineError::Invalid(format!("query {id} does not exist")))?;
            if !owner.can_manage(query.user_id) {
                return Err(EngineError::Invalid(format!(
                    "query {id} may only be scheduled by its owner or an admin"
                )));
            }
        }
        Ok(())
    }
}

fn validate_data_source(input: &DataSourceInput) -> Result<(), EngineError> {
    if input.name.trim().is_empty() {
        return Err(EngineError::Invalid("data source name is required".into()));
    }
    let engine: EngineKind = input
        .engine
        .parse()
        .map_err(|err: ConnectorError| EngineError::Invalid(err.to_string()))?;
    if input.database_name.trim().is_empty() {
        return Err(EngineError::Invalid(format!(
            "database name is required for {engine} data sources"
        )));
    }
    Ok(())
}

fn validate_query(input: &QueryInput) -> Result<(), EngineError> {
    if input.name.trim().is_empty() {
        return Err(EngineError::Invalid("query name is required".into()));
    }
    if input.sql_text.trim().is_empty() {
        return Err(EngineError::Invalid("query SQL is required".into()));
    }
    Ok(())
}

fn validate_schedule(input: &ScheduleInput) -> Result<CronSchedule, EngineError> {
    if input.name.trim().is_empty() {
        return Err(EngineError::Invalid("schedule name is required".into()));
    }
    let cron = CronSchedule::parse(&input.cron_pattern)
        .map_err(|err| EngineError::Invalid(err.to_string()))?;
    if cron.next_after(Utc::now()).is_none() {
        return Err(EngineError::Invalid(format!(
            "cron expression '{}' never fires",
            cron.expression()
        )));
    }
    Ok(cron)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn setup_engine() -> (TallyEngine, TempDir) {
        let temp = TempDir::new().unwrap();
        let db = Database::connect_file(&temp.path().join("catalog.sqlite"))
            .await
            .unwrap();
        let vault = CredentialVault::new(&[5u8; 32]).unwrap();
        (TallyEngine::new(db, vault, EngineConfig::default()), temp)
    }

    fn sqlite_input(path: &str, is_public: bool) -> DataSourceInput {
        DataSourceInput {
            name: "local".into(),
            engine: "sqlite".into(),
            database_name: path.into(),
            is_public,
            ..DataSourceInput::default()
        }
    }

    fn query_input(data_source_id: i64, is_public: bool) -> QueryInput {
        QueryInput {
            data_source_id,
            name: "answer".into(),
            sql_text: "SELECT 42 AS answer".into(),
            description: String::new(),
            is_public,
        }
    }

    fn schedule_input(query_ids: Vec<i64>, cron_pattern: &str) -> ScheduleInput {
        ScheduleInput {
            name: "weekly ops".into(),
            report_type: ReportType::Weekly,
            description: String::new(),
            query_ids,
            chart_ids: Vec::new(),
            template_ids: Vec::new(),
            cron_pattern: cron_pattern.into(),
            active: true,
        }
    }

    #[tokio::test]
    async fn unsupported_engine_is_rejected_at_create() {
        let (engine, _tmp) = setup_engine().await;
        let mut input = sqlite_input("/tmp/x.db", false);
        input.engine = "oracle".into();

        let err = engine
            .create_data_source(&Actor::user(1), input)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Invalid(message) if message.contains("oracle")));
    }

    #[tokio::test]
    async fn private_data_sources_are_hidden_from_strangers() {
        let (engine, tmp) = setup_engine().await;
        let path = tmp.path().join("x.db").display().to_string();
        let owner = Actor::user(1);
        let created = engine
            .create_data_source(&owner, sqlite_input(&path, false))
            .await
            .unwrap();

        assert!(engine.get_data_source(&owner, created.id).await.is_ok());
        assert!(engine.get_data_source(&Actor::admin(9), created.id).await.is_ok());
        assert!(matches!(
            engine.get_data_source(&Actor::user(2), created.id).await,
            Err(EngineError::Forbidden(_))
        ));
        assert!(engine.list_data_sources(&Actor::user(2)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn data_source_in_use_cannot_be_deleted() {
        let (engine, tmp) = setup_engine().await;
        let path = tmp.path().join("x.db").display().to_string();
        let owner = Actor::user(1);
        let source = engine
            .create_data_source(&owner, sqlite_input(&path, false))
            .await
            .unwrap();
        let query = engine
            .create_query(&owner, query_input(source.id, false))
            .await
            .unwrap();

        assert!(matches!(
            engine.delete_data_source(&owner, source.id).await,
            Err(EngineError::InUse(_))
        ));
        engine.delete_query(&owner, query.id).await.unwrap();
        engine.delete_data_source(&owner, source.id).await.unwrap();
        assert!(matches!(
            engine.get_data_source(&owner, source.id).await,
            Err(EngineError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn query_referenced_by_schedule_cannot_be_deleted() {
        let (engine, tmp) = setup_engine().await;
        let path = tmp.path().join("x.db").display().to_string();
        let owner = Actor::user(1);
        let source = engine
            .create_data_source(&owner, sqlite_input(&path, false))
            .await
            .unwrap();
        let query = engine
            .create_query(&owner, query_input(source.id, false))
            .await
            .unwrap();
        engine
            .create_schedule(&owner, schedule_input(vec![query.id], "0 9 * * 1"))
            .await
            .unwrap();

        assert!(matches!(
            engine.delete_query(&owner, query.id).await,
            Err(EngineError::InUse(_))
        ));
    }

    #[tokio::test]
    async fn public_query_is_readable_but_not_executable_by_others() {
        let (engine, tmp) = setup_engine().await;
        let path = tmp.path().join("x.db").display().to_string();
        let owner = Actor::user(1);
        let source = engine
            .create_data_source(&owner, sqlite_input(&path, true))
            .await
            .unwrap();
        let query = engine
            .create_query(&owner, query_input(source.id, true))
            .await
            .unwrap();

        let stranger = Actor::user(2);
        assert_eq!(engine.get_query(&stranger, query.id).await.unwrap().id, query.id);
        assert!(matches!(
            engine.execute_query(&stranger, query.id).await,
            Err(EngineError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn writes_flush_cached_reads() {
        let (engine, tmp) = setup_engine().await;
        let path = tmp.path().join("x.db").display().to_string();
        let owner = Actor::user(1);
        let source = engine
            .create_data_source(&owner, sqlite_input(&path, false))
            .await
            .unwrap();
        engine
            .create_query(&owner, query_input(source.id, false))
            .await
            .unwrap();

        assert_eq!(engine.list_queries(&owner).await.unwrap().len(), 1);
        assert!(engine
            .get_query_cache(&CacheKey::list_queries(owner))
            .is_some());

        engine
            .create_query(&owner, query_input(source.id, false))
            .await
            .unwrap();
        assert!(engine.cache().is_empty());
        assert_eq!(engine.list_queries(&owner).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn execution_increments_counter_and_refreshes_cache() {
        let (engine, tmp) = setup_engine().await;
        let file = tmp.path().join("exec.db");
        // The executor never creates files; materialise one first.
        Database::connect_file(&file).await.unwrap();
        let path = file.display().to_string();
        let owner = Actor::user(1);
        let source = engine
            .create_data_source(&owner, sqlite_input(&path, false))
            .await
            .unwrap();
        let query = engine
            .create_query(&owner, query_input(source.id, false))
            .await
            .unwrap();

        assert_eq!(engine.get_query(&owner, query.id).await.unwrap().exec_count, 0);
        let rows = engine.execute_query(&owner, query.id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["answer"], serde_json::json!(42));
        assert_eq!(engine.get_query(&owner, query.id).await.unwrap().exec_count, 1);
    }

    #[tokio::test]
    async fn clear_cache_requires_admin() {
        let (engine, _tmp) = setup_engine().await;
        engine.set_query_cache(CacheKey::list_queries(Actor::user(1)), serde_json::json!([]));

        assert!(matches!(
            engine.clear_cache(&Actor::user(1), ClearScope::All),
            Err(EngineError::Forbidden(_))
        ));
        assert_eq!(engine.clear_cache(&Actor::admin(2), ClearScope::List).unwrap(), 1);
    }

    #[tokio::test]
    async fn malformed_cron_is_rejected_synchronously() {
        let (engine, _tmp) = setup_engine().await;
        let err = engine
            .create_schedule(&Actor::user(1), schedule_input(Vec::new(), "every day"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Invalid(_)));

        let created = engine
            .create_schedule(&Actor::user(1), schedule_input(Vec::new(), "*/5 * * * *"))
            .await
            .unwrap();
        assert!(created.next_run.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn cron_that_never_fires_is_rejected() {
        let (engine, _tmp) = setup_engine().await;
        let err = engine
            .create_schedule(&Actor::user(1), schedule_input(Vec::new(), "0 0 30 2 *"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Invalid(message) if message.contains("never fires")));
    }

    #[tokio::test]
    async fn public_queries_cannot_be_scheduled_by_strangers() {
        let (engine, tmp) = setup_engine().await;
        let path = tmp.path().join("x.db").display().to_string();
        let owner = Actor::user(1);
        let source = engine
            .create_data_source(&owner, sqlite_input(&path, true))
            .await
            .unwrap();
        let query = engine
            .create_query(&owner, query_input(source.id, true))
            .await
            .unwrap();

        let err = engine
            .create_schedule(&Actor::user(2), schedule_input(vec![query.id], "0 9 * * 1"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Invalid(message) if message.contains("owner")));

        let stranger_schedule = engine
            .create_schedule(&Actor::user(2), schedule_input(Vec::new(), "0 9 * * 1"))
            .await
            .unwrap();
        // An admin editing someone else's schedule is still bound by that owner's rights.
        assert!(matches!(
            engine
                .update_schedule(
                    &Actor::admin(9),
                    stranger_schedule.id,
                    schedule_input(vec![query.id], "0 9 * * 1"),
                )
                .await,
            Err(EngineError::Invalid(_))
        ));

        let admin_schedule = engine
            .create_schedule(&Actor::admin(9), schedule_input(vec![query.id], "0 9 * * 1"))
            .await
            .unwrap();
        assert!(admin_schedule.owner_is_admin);
        assert!(!stranger_schedule.owner_is_admin);
    }

    #[tokio::test]
    async fn schedule_update_recomputes_next_run_on_cron_change() {
        let (engine, _tmp) = setup_engine().await;
        let owner = Actor::user(1);
        let created = engine
            .create_schedule(&owner, schedule_input(Vec::new(), "0 0 1 1 *"))
            .await
            .unwrap();

        let updated = engine
            .update_schedule(&owner, created.id, schedule_input(Vec::new(), "* * * * *"))
            .await
            .unwrap();
        assert!(updated.next_run.unwrap() < created.next_run.unwrap());
        assert!(matches!(
            engine
                .update_schedule(
                    &Actor::user(2),
                    created.id,
                    schedule_input(Vec::new(), "* * * * *")
                )
                .await,
            Err(EngineError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn pending_report_is_not_downloadable() {
        let (engine, _tmp) = setup_engine().await;
        let owner = Actor::user(1);
        let schedule = engine
            .create_schedule(&owner, schedule_input(Vec::new(), "* * * * *"))
            .await
            .unwrap();
        let report = engine
            .report_builder()
            .begin(&schedule, Utc::now())
            .await
            .unwrap();

        assert!(matches!(
            engine.download_report(&owner, report.id).await,
            Err(EngineError::NotReady(_))
        ));
        assert!(matches!(
            engine.download_report(&owner, report.id + 100).await,
            Err(EngineError::NotFound { .. })
        ));
    }
}
