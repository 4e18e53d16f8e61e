use std::{env, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tally_db::{Database, QueryRecord, ReportRecord, ReportType, ScheduleRecord};
use tally_engine::{
    Actor, CacheConfig, ClearScope, CredentialVault, DataSourceInput, DataSourceView,
    EngineConfig, EngineError, QueryInput, Role, ScheduleInput, SchedulerConfig, TallyEngine,
    WorkerRegistry,
};
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{error, info, warn};
use utoipa::{Modify, OpenApi, ToSchema};

const USER_HEADER: &str = "x-tally-user";
const ROLE_HEADER: &str = "x-tally-role";
const XLSX_CONTENT_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

pub async fn run() -> Result<()> {
    let config = AppConfig::from_env()?;

    let db = Database::connect(&config.db_url)
        .await
        .context("failed to open catalog database")?;
    let vault = CredentialVault::from_config_value(&config.data_source_key)
        .context("invalid TALLY_DATA_SOURCE_KEY")?;
    let engine = TallyEngine::new(db, vault, config.engine);

    let workers = WorkerRegistry::default();
    workers.spawn(Arc::new(engine.cache_sweeper()));
    if config.scheduler_enabled {
        workers.spawn(Arc::new(engine.scheduler()));
    } else {
        warn!("report scheduler disabled via TALLY_SCHEDULER_DISABLED");
    }

    let state = Arc::new(AppState { engine });
    let app = build_router(state)
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listen socket")?;

    info!(addr = %config.listen_addr, workers = workers.len(), "tally-daemon listening");
    let served = axum::serve(listener, app).await;
    workers.abort_all();
    served.context("HTTP server exited")?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route(
            "/api/v1/datasources",
            post(create_data_source).get(list_data_sources),
        )
        .route(
            "/api/v1/datasources/:id",
            get(get_data_source)
                .put(update_data_source)
                .delete(delete_data_source),
        )
        .route("/api/v1/queries", post(create_query).get(list_queries))
        .route(
            "/api/v1/queries/:id",
            get(get_query).put(update_query).delete(delete_query),
        )
        .route("/api/v1/queries/:id/execute", post(execute_query))
        .route("/api/v1/cache/clear", post(clear_cache))
        .route(
            "/api/v1/report-schedules",
            post(create_schedule).get(list_schedules),
        )
        .route(
            "/api/v1/report-schedules/:id",
            get(get_schedule).put(update_schedule).delete(delete_schedule),
        )
        .route("/api/v1/reports", get(list_reports))
        .route("/api/v1/reports/:id/download", get(download_report))
        .with_state(state)
}

#[derive(Clone)]
struct AppState {
    engine: TallyEngine,
}

#[derive(Debug, Clone)]
struct AppConfig {
    listen_addr: SocketAddr,
    db_url: String,
    data_source_key: String,
    engine: EngineConfig,
    scheduler_enabled: bool,
}

type EnvLookup<'a> = &'a dyn Fn(&str) -> Option<String>;

impl AppConfig {
    fn from_env() -> Result<Self> {
        Self::from_lookup(&|key| env::var(key).ok())
    }

    fn from_lookup(lookup: EnvLookup<'_>) -> Result<Self> {
        let listen_addr = lookup("TALLY_API_ADDR")
            .unwrap_or_else(|| "127.0.0.1:8080".to_string())
            .parse()
            .context("invalid TALLY_API_ADDR")?;

        let db_url = lookup("TALLY_DB_DSN")
            .or_else(|| lookup("DATABASE_URL"))
            .context("TALLY_DB_DSN or DATABASE_URL must be configured")?;

        let data_source_key = lookup("TALLY_DATA_SOURCE_KEY")
            .filter(|value| !value.trim().is_empty())
            .context("TALLY_DATA_SOURCE_KEY must be configured")?;

        let cache_defaults = CacheConfig::default();
        let cache = CacheConfig {
            default_ttl: secs_var(lookup, "TALLY_CACHE_TTL_SECONDS")?
                .unwrap_or(cache_defaults.default_ttl),
            cleanup_interval: secs_var(lookup, "TALLY_CACHE_CLEANUP_SECONDS")?
                .unwrap_or(cache_defaults.cleanup_interval),
        };

        let scheduler_defaults = SchedulerConfig::default();
        let scheduler = SchedulerConfig {
            tick_interval: secs_var(lookup, "TALLY_SCHEDULER_TICK_SECONDS")?
                .unwrap_or(scheduler_defaults.tick_interval),
            max_concurrent_runs: u64_var(lookup, "TALLY_REPORT_WORKERS")?
                .map(|value| value as usize)
                .unwrap_or(scheduler_defaults.max_concurrent_runs),
            lease_duration: secs_var(lookup, "TALLY_SCHEDULE_LEASE_SECONDS")?
                .unwrap_or(scheduler_defaults.lease_duration),
        };

        // Zero disables the deadline.
        let query_timeout = match u64_var(lookup, "TALLY_QUERY_TIMEOUT_SECONDS")? {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => Some(Duration::from_secs(30)),
        };

        Ok(Self {
            listen_addr,
            db_url,
            data_source_key,
            engine: EngineConfig {
                cache,
                scheduler,
                query_timeout,
            },
            scheduler_enabled: !bool_var(lookup, "TALLY_SCHEDULER_DISABLED")?.unwrap_or(false),
        })
    }
}

#[utoipa::path(
    get,
    path = "/healthz",
    responses((status = 200, description = "Service is healthy"))
)]
async fn healthz() -> StatusCode {
    StatusCode::OK
}

#[utoipa::path(
    post,
    path = "/api/v1/datasources",
    request_body = DataSourceBody,
    responses(
        (status = 201, description = "Data source created", body = DataSourceResponse),
        (status = 400, description = "Invalid request or unsupported engine", body = ErrorBody),
        (status = 401, description = "Missing or invalid identity", body = ErrorBody)
    ),
    security(("tallyIdentity" = []))
)]
async fn create_data_source(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<DataSourceBody>,
) -> Result<(StatusCode, Json<DataSourceResponse>), ApiError> {
    let actor = require_actor(&headers)?;
    let view = state
        .engine
        .create_data_source(&actor, payload.into())
        .await?;
    Ok((StatusCode::CREATED, Json(DataSourceResponse::from(view))))
}

#[utoipa::path(
    get,
    path = "/api/v1/datasources",
    responses(
        (
            status = 200,
            description = "Data sources visible to the caller",
            body = [DataSourceResponse]
        ),
        (status = 401, description = "Missing or invalid identity", body = ErrorBody)
    ),
    security(("tallyIdentity" = []))
)]
async fn list_data_sources(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<DataSourceResponse>>, ApiError> {
    let actor = require_actor(&headers)?;
    let views = state.engine.list_data_sources(&actor).await?;
    Ok(Json(views.into_iter().map(DataSourceResponse::from).collect()))
}

#[utoipa::path(
    get,
    path = "/api/v1/datasources/{id}",
    params(("id" = i64, Path, description = "Data source identifier")),
    responses(
        (status = 200, description = "Data source details", body = DataSourceResponse),
        (status = 401, description = "Missing or invalid identity", body = ErrorBody),
        (status = 403, description = "Not visible to the caller", body = ErrorBody),
        (status = 404, description = "Data source not found", body = ErrorBody)
    ),
    security(("tallyIdentity" = []))
)]
async fn get_data_source(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<DataSourceResponse>, ApiError> {
    let actor = require_actor(&headers)?;
    let view = state.engine.get_data_source(&actor, id).await?;
    Ok(Json(DataSourceResponse::from(view)))
}

#[utoipa::path(
    put,
    path = "/api/v1/datasources/{id}",
    params(("id" = i64, Path, description = "Data source identifier")),
    request_body = DataSourceBody,
    responses(
        (status = 200, description = "Data source updated", body = DataSourceResponse),
        (status = 400, description = "Invalid request", body = ErrorBody),
        (status = 401, description = "Missing or invalid identity", body = ErrorBody),
        (status = 403, description = "Caller does not own the data source", body = ErrorBody),
        (status = 404, description = "Data source not found", body = ErrorBody)
    ),
    security(("tallyIdentity" = []))
)]
async fn update_data_source(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(payload): Json<DataSourceBody>,
) -> Result<Json<DataSourceResponse>, ApiError> {
    let actor = require_actor(&headers)?;
    let view = state
        .engine
        .update_data_source(&actor, id, payload.into())
        .await?;
    Ok(Json(DataSourceResponse::from(view)))
}

#[utoipa::path(
    delete,
    path = "/api/v1/datasources/{id}",
    params(("id" = i64, Path, description = "Data source identifier")),
    responses(
        (status = 204, description = "Data source deleted"),
        (status = 401, description = "Missing or invalid identity", body = ErrorBody),
        (status = 403, description = "Caller does not own the data source", body = ErrorBody),
        (status = 404, description = "Data source not found", body = ErrorBody),
        (status = 409, description = "Data source still used by queries", body = ErrorBody)
    ),
    security(("tallyIdentity" = []))
)]
async fn delete_data_source(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    let actor = require_actor(&headers)?;
    state.engine.delete_data_source(&actor, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/api/v1/queries",
    request_body = QueryBody,
    responses(
        (status = 201, description = "Query created", body = QueryResponse),
        (status = 400, description = "Invalid request", body = ErrorBody),
        (status = 401, description = "Missing or invalid identity", body = ErrorBody),
        (status = 403, description = "Data source not visible to the caller", body = ErrorBody),
        (status = 404, description = "Data source not found", body = ErrorBody)
    ),
    security(("tallyIdentity" = []))
)]
async fn create_query(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<QueryBody>,
) -> Result<(StatusCode, Json<QueryResponse>), ApiError> {
    let actor = require_actor(&headers)?;
    let record = state.engine.create_query(&actor, payload.into()).await?;
    Ok((StatusCode::CREATED, Json(QueryResponse::from(record))))
}

#[utoipa::path(
    get,
    path = "/api/v1/queries",
    responses(
        (status = 200, description = "Queries visible to the caller", body = [QueryResponse]),
        (status = 401, description = "Missing or invalid identity", body = ErrorBody)
    ),
    security(("tallyIdentity" = []))
)]
async fn list_queries(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<QueryResponse>>, ApiError> {
    let actor = require_actor(&headers)?;
    let records = state.engine.list_queries(&actor).await?;
    Ok(Json(records.into_iter().map(QueryResponse::from).collect()))
}

#[utoipa::path(
    get,
    path = "/api/v1/queries/{id}",
    params(("id" = i64, Path, description = "Query identifier")),
    responses(
        (status = 200, description = "Query details", body = QueryResponse),
        (status = 401, description = "Missing or invalid identity", body = ErrorBody),
        (status = 403, description = "Not visible to the caller", body = ErrorBody),
        (status = 404, description = "Query not found", body = ErrorBody)
    ),
    security(("tallyIdentity" = []))
)]
async fn get_query(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<QueryResponse>, ApiError> {
    let actor = require_actor(&headers)?;
    let record = state.engine.get_query(&actor, id).await?;
    Ok(Json(QueryResponse::from(record)))
}

#[utoipa::path(
    put,
    path = "/api/v1/queries/{id}",
    params(("id" = i64, Path, description = "Query identifier")),
    request_body = QueryBody,
    responses(
        (status = 200, description = "Query updated", body = QueryResponse),
        (status = 400, description = "Invalid request", body = ErrorBody),
        (status = 401, description = "Missing or invalid identity", body = ErrorBody),
        (status = 403, description = "Caller does not own the query", body = ErrorBody),
        (status = 404, description = "Query not found", body = ErrorBody)
    ),
    security(("tallyIdentity" = []))
)]
async fn update_query(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(payload): Json<QueryBody>,
) -> Result<Json<QueryResponse>, ApiError> {
    let actor = require_actor(&headers)?;
    let record = state
        .engine
        .update_query(&actor, id, payload.into())
        .await?;
    Ok(Json(QueryResponse::from(record)))
}

#[utoipa::path(
    delete,
    path = "/api/v1/queries/{id}",
    params(("id" = i64, Path, description = "Query identifier")),
    responses(
        (status = 204, description = "Query deleted"),
        (status = 401, description = "Missing or invalid identity", body = ErrorBody),
        (status = 403, description = "Caller does not own the query", body = ErrorBody),
        (status = 404, description = "Query not found", body = ErrorBody),
        (status = 409, description = "Query referenced by a report schedule", body = ErrorBody)
    ),
    security(("tallyIdentity" = []))
)]
async fn delete_query(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    let actor = require_actor(&headers)?;
    state.engine.delete_query(&actor, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/api/v1/queries/{id}/execute",
    params(("id" = i64, Path, description = "Query identifier")),
    responses(
        (status = 200, description = "Result rows", body = ExecuteResponse),
        (status = 400, description = "Unsupported database engine", body = ErrorBody),
        (status = 401, description = "Missing or invalid identity", body = ErrorBody),
        (status = 403, description = "Only the owner or an admin may execute", body = ErrorBody),
        (status = 404, description = "Query or data source not found", body = ErrorBody),
        (status = 500, description = "Stored credential could not be decrypted", body = ErrorBody),
        (
            status = 502,
            description = "Target database rejected the connection or query",
            body = ErrorBody
        )
    ),
    security(("tallyIdentity" = []))
)]
async fn execute_query(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<ExecuteResponse>, ApiError> {
    let actor = require_actor(&headers)?;
    let records = state.engine.execute_query(&actor, id).await?;
    let data = records
        .into_iter()
        .map(|record| Value::Object(record.into_iter().collect()))
        .collect();
    Ok(Json(ExecuteResponse { data }))
}

#[utoipa::path(
    post,
    path = "/api/v1/cache/clear",
    request_body = ClearCacheBody,
    responses(
        (status = 200, description = "Entries removed", body = ClearCacheResponse),
        (status = 400, description = "Unknown scope", body = ErrorBody),
        (status = 401, description = "Missing or invalid identity", body = ErrorBody),
        (status = 403, description = "Admin role required", body = ErrorBody)
    ),
    security(("tallyIdentity" = []))
)]
async fn clear_cache(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<ClearCacheBody>,
) -> Result<Json<ClearCacheResponse>, ApiError> {
    let actor = require_actor(&headers)?;
    let scope: ClearScope = payload
        .scope
        .as_deref()
        .unwrap_or("all")
        .parse()
        .map_err(ApiError::bad_request)?;
    let removed = state.engine.clear_cache(&actor, scope)?;
    Ok(Json(ClearCacheResponse { removed }))
}

#[utoipa::path(
    post,
    path = "/api/v1/report-schedules",
    request_body = ScheduleBody,
    responses(
        (status = 201, description = "Schedule created", body = ScheduleResponse),
        (status = 400, description = "Invalid cron pattern or request", body = ErrorBody),
        (status = 401, description = "Missing or invalid identity", body = ErrorBody)
    ),
    security(("tallyIdentity" = []))
)]
async fn create_schedule(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<ScheduleBody>,
) -> Result<(StatusCode, Json<ScheduleResponse>), ApiError> {
    let actor = require_actor(&headers)?;
    let record = state
        .engine
        .create_schedule(&actor, payload.into_input()?)
        .await?;
    Ok((StatusCode::CREATED, Json(ScheduleResponse::from(record))))
}

#[utoipa::path(
    get,
    path = "/api/v1/report-schedules",
    responses(
        (
            status = 200,
            description = "Schedules owned by the caller (all for admins)",
            body = [ScheduleResponse]
        ),
        (status = 401, description = "Missing or invalid identity", body = ErrorBody)
    ),
    security(("tallyIdentity" = []))
)]
async fn list_schedules(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<ScheduleResponse>>, ApiError> {
    let actor = require_actor(&headers)?;
    let records = state.engine.list_schedules(&actor).await?;
    Ok(Json(records.into_iter().map(ScheduleResponse::from).collect()))
}

#[utoipa::path(
    get,
    path = "/api/v1/report-schedules/{id}",
    params(("id" = i64, Path, description = "Schedule identifier")),
    responses(
        (status = 200, description = "Schedule details", body = ScheduleResponse),
        (status = 401, description = "Missing or invalid identity", body = ErrorBody),
        (status = 403, description = "Caller does not own the schedule", body = ErrorBody),
        (status = 404, description = "Schedule not found", body = ErrorBody)
    ),
    security(("tallyIdentity" = []))
)]
async fn get_schedule(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<ScheduleResponse>, ApiError> {
    let actor = require_actor(&headers)?;
    let record = state.engine.get_schedule(&actor, id).await?;
    Ok(Json(ScheduleResponse::from(record)))
}

#[utoipa::path(
    put,
    path = "/api/v1/report-schedules/{id}",
    params(("id" = i64, Path, description = "Schedule identifier")),
    request_body = ScheduleBody,
    responses(
        (status = 200, description = "Schedule updated", body = ScheduleResponse),
        (status = 400, description = "Invalid cron pattern or request", body = ErrorBody),
        (status = 401, description = "Missing or invalid identity", body = ErrorBody),
        (status = 403, description = "Caller does not own the schedule", body = ErrorBody),
        (status = 404, description = "Schedule not found", body = ErrorBody)
    ),
    security(("tallyIdentity" = []))
)]
async fn update_schedule(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(payload): Json<ScheduleBody>,
) -> Result<Json<ScheduleResponse>, ApiError> {
    let actor = require_actor(&headers)?;
    let record = state
        .engine
        .update_schedule(&actor, id, payload.into_input()?)
        .await?;
    Ok(Json(ScheduleResponse::from(record)))
}

#[utoipa::path(
    delete,
    path = "/api/v1/report-schedules/{id}",
    params(("id" = i64, Path, description = "Schedule identifier")),
    responses(
        (status = 204, description = "Schedule deleted"),
        (status = 401, description = "Missing or invalid identity", body = ErrorBody),
        (status = 403, description = "Caller does not own the schedule", body = ErrorBody),
        (status = 404, description = "Schedule not found", body = ErrorBody)
    ),
    security(("tallyIdentity" = []))
)]
async fn delete_schedule(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    let actor = require_actor(&headers)?;
    state.engine.delete_schedule(&actor, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    get,
    path = "/api/v1/reports",
    responses(
        (
            status = 200,
            description = "Reports owned by the caller (all for admins)",
            body = [ReportResponse]
        ),
        (status = 401, description = "Missing or invalid identity", body = ErrorBody)
    ),
    security(("tallyIdentity" = []))
)]
async fn list_reports(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<ReportResponse>>, ApiError> {
    let actor = require_actor(&headers)?;
    let records = state.engine.list_reports(&actor).await?;
    Ok(Json(records.into_iter().map(ReportResponse::from).collect()))
}

#[utoipa::path(
    get,
    path = "/api/v1/reports/{id}/download",
    params(("id" = i64, Path, description = "Report identifier")),
    responses(
        (
            status = 200,
            description = "Workbook bytes",
            body = String,
            content_type = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
        ),
        (status = 401, description = "Missing or invalid identity", body = ErrorBody),
        (status = 403, description = "Caller does not own the report", body = ErrorBody),
        (status = 404, description = "Report not found", body = ErrorBody),
        (status = 409, description = "Report has not completed successfully", body = ErrorBody)
    ),
    security(("tallyIdentity" = []))
)]
async fn download_report(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Response, ApiError> {
    let actor = require_actor(&headers)?;
    let download = state.engine.download_report(&actor, id).await?;
    let disposition = format!(
        "attachment; filename=\"{}\"",
        download.file_name.replace(['"', '\\'], "_")
    );
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, XLSX_CONTENT_TYPE.to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        download.content,
    )
        .into_response())
}

#[derive(Debug, Deserialize, ToSchema)]
struct DataSourceBody {
    name: String,
    /// One of `sqlite`, `mysql`, `postgres`.
    engine: String,
    #[serde(default)]
    host: String,
    #[serde(default)]
    port: u16,
    /// Database name, or the file path for sqlite.
    #[serde(default)]
    database_name: String,
    #[serde(default)]
    username: String,
    /// Plaintext password. Omitted or empty on update keeps the stored one.
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    is_public: bool,
}

impl From<DataSourceBody> for DataSourceInput {
    fn from(body: DataSourceBody) -> Self {
        Self {
            name: body.name,
            engine: body.engine,
            host: body.host,
            port: body.port,
            database_name: body.database_name,
            username: body.username,
            secret: body.password,
            description: body.description,
            is_public: body.is_public,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
struct DataSourceResponse {
    id: i64,
    user_id: i64,
    name: String,
    engine: String,
    host: String,
    port: u16,
    database_name: String,
    username: String,
    has_password: bool,
    description: String,
    is_public: bool,
    created_at: String,
    updated_at: String,
}

impl From<DataSourceView> for DataSourceResponse {
    fn from(view: DataSourceView) -> Self {
        Self {
            id: view.id,
            user_id: view.user_id,
            name: view.name,
            engine: view.engine,
            host: view.host,
            port: view.port,
            database_name: view.database_name,
            username: view.username,
            has_password: view.has_secret,
            description: view.description,
            is_public: view.is_public,
            created_at: view.created_at.to_rfc3339(),
            updated_at: view.updated_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
struct QueryBody {
    data_source_id: i64,
    name: String,
    sql_text: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    is_public: bool,
}

impl From<QueryBody> for QueryInput {
    fn from(body: QueryBody) -> Self {
        Self {
            data_source_id: body.data_source_id,
            name: body.name,
            sql_text: body.sql_text,
            description: body.description,
            is_public: body.is_public,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
struct QueryResponse {
    id: i64,
    user_id: i64,
    data_source_id: i64,
    name: String,
    sql_text: String,
    description: String,
    is_public: bool,
    exec_count: i64,
    created_at: String,
    updated_at: String,
}

impl From<QueryRecord> for QueryResponse {
    fn from(record: QueryRecord) -> Self {
        Self {
            id: record.id,
            user_id: record.user_id,
            data_source_id: record.data_source_id,
            name: record.name,
            sql_text: record.sql_text,
            description: record.description,
            is_public: record.is_public,
            exec_count: record.exec_count,
            created_at: record.created_at.to_rfc3339(),
            updated_at: record.updated_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
struct ExecuteResponse {
    /// One object per row, keyed by column name.
    #[schema(value_type = Vec<Object>)]
    data: Vec<Value>,
}

#[derive(Debug, Deserialize, ToSchema)]
struct ClearCacheBody {
    /// `all` (default), `list` or `query:<id>`.
    #[serde(default)]
    scope: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
struct ClearCacheResponse {
    removed: usize,
}

#[derive(Debug, Deserialize, ToSchema)]
struct ScheduleBody {
    name: String,
    /// `daily`, `weekly` or `monthly`.
    report_type: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    query_ids: Vec<i64>,
    #[serde(default)]
    chart_ids: Vec<i64>,
    #[serde(default)]
    template_ids: Vec<i64>,
    /// Five-field cron expression evaluated in UTC.
    cron_pattern: String,
    #[serde(default)]
    active: Option<bool>,
}

impl ScheduleBody {
    fn into_input(self) -> Result<ScheduleInput, ApiError> {
        let report_type: ReportType = self
            .report_type
            .trim()
            .to_ascii_lowercase()
            .parse()
            .map_err(|err: anyhow::Error| ApiError::bad_request(err.to_string()))?;
        Ok(ScheduleInput {
            name: self.name,
            report_type,
            description: self.description,
            query_ids: self.query_ids,
            chart_ids: self.chart_ids,
            template_ids: self.template_ids,
            cron_pattern: self.cron_pattern,
            active: self.active.unwrap_or(true),
        })
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
struct ScheduleResponse {
    id: i64,
    user_id: i64,
    name: String,
    report_type: String,
    description: String,
    query_ids: Vec<i64>,
    chart_ids: Vec<i64>,
    template_ids: Vec<i64>,
    cron_pattern: String,
    active: bool,
    last_run: Option<String>,
    next_run: Option<String>,
    created_at: String,
    updated_at: String,
}

impl From<ScheduleRecord> for ScheduleResponse {
    fn from(record: ScheduleRecord) -> Self {
        Self {
            id: record.id,
            user_id: record.user_id,
            name: record.name,
            report_type: record.report_type.as_str().to_string(),
            description: record.description,
            query_ids: record.query_ids,
            chart_ids: record.chart_ids,
            template_ids: record.template_ids,
            cron_pattern: record.cron_pattern,
            active: record.active,
            last_run: record.last_run.map(|ts| ts.to_rfc3339()),
            next_run: record.next_run.map(|ts| ts.to_rfc3339()),
            created_at: record.created_at.to_rfc3339(),
            updated_at: record.updated_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
struct ReportResponse {
    id: i64,
    user_id: i64,
    schedule_id: Option<i64>,
    name: String,
    report_type: String,
    generated_at: String,
    status: String,
    error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl From<ReportRecord> for ReportResponse {
    fn from(record: ReportRecord) -> Self {
        Self {
            id: record.id,
            user_id: record.user_id,
            schedule_id: record.schedule_id,
            name: record.name,
            report_type: record.report_type.as_str().to_string(),
            generated_at: record.generated_at.to_rfc3339(),
            status: record.status.as_str().to_string(),
            error: record.error,
            created_at: record.created_at.to_rfc3339(),
            updated_at: record.updated_at.to_rfc3339(),
        }
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn internal<E: std::fmt::Display>(err: E) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }

    fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::NotFound { .. } => ApiError::new(StatusCode::NOT_FOUND, err.to_string()),
            EngineError::Forbidden(message) => ApiError::new(StatusCode::FORBIDDEN, message),
            EngineError::Invalid(message) => ApiError::bad_request(message),
            EngineError::InUse(message) => ApiError::new(StatusCode::CONFLICT, message),
            EngineError::NotReady(_) => ApiError::new(StatusCode::CONFLICT, err.to_string()),
            EngineError::Credential(_) => ApiError::internal(err),
            EngineError::Execution(inner) if inner.is_unsupported_engine() => {
                ApiError::bad_request(inner.to_string())
            }
            EngineError::Execution(inner) => {
                ApiError::new(StatusCode::BAD_GATEWAY, inner.to_string())
            }
            EngineError::Storage(inner) => ApiError::internal(inner),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error!(status = %self.status, message = %self.message, "api error");
        let body = Json(ErrorBody {
            error: self.message,
        });
        (self.status, body).into_response()
    }
}

#[derive(Debug, Serialize, ToSchema)]
struct ErrorBody {
    error: String,
}

pub mod docs {
    use super::*;
    use utoipa::openapi::security::{ApiKey, ApiKeyValue, SecurityScheme};

    #[derive(OpenApi)]
    #[openapi(
        info(title = "Tally Daemon API", version = "0.1.0"),
        paths(
            healthz,
            create_data_source,
            list_data_sources,
            get_data_source,
            update_data_source,
            delete_data_source,
            create_query,
            list_queries,
            get_query,
            update_query,
            delete_query,
            execute_query,
            clear_cache,
            create_schedule,
            list_schedules,
            get_schedule,
            update_schedule,
            delete_schedule,
            list_reports,
            download_report
        ),
        components(schemas(
            DataSourceBody,
            DataSourceResponse,
            QueryBody,
            QueryResponse,
            ExecuteResponse,
            ClearCacheBody,
            ClearCacheResponse,
            ScheduleBody,
            ScheduleResponse,
            ReportResponse,
            ErrorBody
        )),
        modifiers(&IdentityAddon)
    )]
    pub struct ApiDoc;

    struct IdentityAddon;

    impl Modify for IdentityAddon {
        fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
            let components = openapi.components.get_or_insert_with(Default::default);
            components.add_security_scheme(
                "tallyIdentity",
                SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::with_description(
                    "X-Tally-User",
                    "Numeric user id set by the trusted gateway, paired with X-Tally-Role",
                ))),
            );
        }
    }
}

/// Reads the caller identity forwarded by the gateway.
fn require_actor(headers: &HeaderMap) -> Result<Actor, ApiError> {
    let user_id = header_str(headers, USER_HEADER)?
        .parse::<i64>()
        .map_err(|_| ApiError::unauthorized("X-Tally-User must be an integer user id"))?;
    let role = header_str(headers, ROLE_HEADER)?
        .parse::<Role>()
        .map_err(|_| ApiError::unauthorized("X-Tally-Role must be admin or user"))?;
    Ok(Actor::new(user_id, role))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, ApiError> {
    let value = headers
        .get(name)
        .ok_or_else(|| ApiError::unauthorized(format!("missing {name} header")))?;
    value
        .to_str()
        .map(str::trim)
        .map_err(|_| ApiError::unauthorized(format!("invalid {name} header encoding")))
}

fn present(lookup: EnvLookup<'_>, key: &str) -> Option<String> {
    lookup(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn bool_var(lookup: EnvLookup<'_>, key: &str) -> Result<Option<bool>> {
    let Some(value) = present(lookup, key) else {
        return Ok(None);
    };
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(anyhow!("invalid {key}: expected a boolean, got '{value}'")),
    }
}

fn u64_var(lookup: EnvLookup<'_>, key: &str) -> Result<Option<u64>> {
    present(lookup, key)
        .map(|value| {
            value
                .parse::<u64>()
                .with_context(|| format!("invalid {key}: '{value}' is not a non-negative integer"))
        })
        .transpose()
}

fn secs_var(lookup: EnvLookup<'_>, key: &str) -> Result<Option<Duration>> {
    Ok(u64_var(lookup, key)?.map(Duration::from_secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tempfile::TempDir;
    use tower::Service;

    fn config_from(pairs: &[(&str, &str)]) -> Result<AppConfig> {
        let mut vars: std::collections::HashMap<String, String> = [
            ("TALLY_DB_DSN", "sqlite://catalog.db"),
            ("TALLY_DATA_SOURCE_KEY", "0123456789abcdef0123456789abcdef"),
        ]
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();
        for (key, value) in pairs {
            vars.insert(key.to_string(), value.to_string());
        }
        AppConfig::from_lookup(&|key| vars.get(key).cloned())
    }

    #[test]
    fn config_defaults_and_overrides() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.engine.query_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.engine.scheduler.max_concurrent_runs, 4);
        assert!(config.scheduler_enabled);

        let config = config_from(&[
            ("TALLY_REPORT_WORKERS", "8"),
            ("TALLY_QUERY_TIMEOUT_SECONDS", "0"),
            ("TALLY_CACHE_TTL_SECONDS", " 120 "),
            ("TALLY_SCHEDULER_DISABLED", "yes"),
        ])
        .unwrap();
        assert_eq!(config.engine.scheduler.max_concurrent_runs, 8);
        assert_eq!(config.engine.query_timeout, None);
        assert_eq!(config.engine.cache.default_ttl, Duration::from_secs(120));
        assert!(!config.scheduler_enabled);
    }

    #[test]
    fn invalid_config_values_fail_startup() {
        for (key, value) in [
            ("TALLY_REPORT_WORKERS", "four"),
            ("TALLY_QUERY_TIMEOUT_SECONDS", "-5"),
            ("TALLY_CACHE_TTL_SECONDS", "1.5"),
            ("TALLY_SCHEDULER_DISABLED", "maybe"),
        ] {
            let err = config_from(&[(key, value)]).unwrap_err();
            assert!(
                format!("{err:#}").contains(key),
                "{key}={value} should name the variable: {err:#}"
            );
        }

        let err = config_from(&[("TALLY_DATA_SOURCE_KEY", "  ")]).unwrap_err();
        assert!(err.to_string().contains("TALLY_DATA_SOURCE_KEY"));
    }

    async fn setup_test_app() -> (Arc<AppState>, Router, TempDir) {
        let temp = TempDir::new().expect("tempdir");
        let db_path = temp.path().join("catalog.sqlite");
        let db = Database::connect(&format!("sqlite://{}", db_path.display()))
            .await
            .expect("db");
        let vault = CredentialVault::new(&[3u8; 32]).expect("vault");
        let engine = TallyEngine::new(db, vault, EngineConfig::default());
        let state = Arc::new(AppState { engine });
        let router = build_router(state.clone());
        (state, router, temp)
    }

    fn request(
        method: &str,
        uri: &str,
        identity: Option<(i64, &str)>,
        body: Option<Value>,
    ) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some((user, role)) = identity {
            builder = builder
                .header(USER_HEADER, user.to_string())
                .header(ROLE_HEADER, role);
        }
        match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .expect("request"),
            None => builder.body(Body::empty()).expect("request"),
        }
    }

    async fn send(router: &mut Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = router.call(request).await.expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        (status, bytes.to_vec())
    }

    async fn send_json(router: &mut Router, request: Request<Body>) -> (StatusCode, Value) {
        let (status, bytes) = send(router, request).await;
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("json body")
        };
        (status, value)
    }

    async fn create_sqlite_source(router: &mut Router, temp: &TempDir, user: i64) -> i64 {
        let path = temp.path().join(format!("source-{user}.db"));
        Database::connect_file(&path).await.expect("source db");
        let (status, body) = send_json(
            router,
            request(
                "POST",
                "/api/v1/datasources",
                Some((user, "user")),
                Some(json!({
                    "name": "local",
                    "engine": "sqlite",
                    "database_name": path.display().to_string(),
                    "is_public": true
                })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        body["id"].as_i64().expect("id")
    }

    async fn create_query(router: &mut Router, user: i64, data_source_id: i64) -> i64 {
        let (status, body) = send_json(
            router,
            request(
                "POST",
                "/api/v1/queries",
                Some((user, "user")),
                Some(json!({
                    "data_source_id": data_source_id,
                    "name": "answer",
                    "sql_text": "SELECT 42 AS answer, 'x' AS label",
                    "is_public": true
                })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        body["id"].as_i64().expect("id")
    }

    #[tokio::test]
    async fn missing_identity_is_unauthorized() {
        let (_state, mut router, _tmp) = setup_test_app().await;

        let (status, body) =
            send_json(&mut router, request("GET", "/api/v1/queries", None, None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body["error"].as_str().unwrap().contains("x-tally-user"));

        let (status, _) = send_json(
            &mut router,
            request("GET", "/api/v1/queries", Some((1, "superuser")), None),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = send_json(&mut router, request("GET", "/healthz", None, None)).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn data_source_responses_never_carry_passwords() {
        let (_state, mut router, _tmp) = setup_test_app().await;

        let (status, body) = send_json(
            &mut router,
            request(
                "POST",
                "/api/v1/datasources",
                Some((1, "user")),
                Some(json!({
                    "name": "warehouse",
                    "engine": "postgres",
                    "host": "db.internal",
                    "database_name": "sales",
                    "username": "report",
                    "password": "s3cret",
                    "is_public": true
                })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["has_password"], json!(true));
        assert!(body.get("password").is_none());

        let (status, body) = send_json(
            &mut router,
            request("GET", "/api/v1/datasources", Some((2, "user")), None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert!(!body.to_string().contains("s3cret"));
    }

    #[tokio::test]
    async fn unsupported_engine_is_bad_request() {
        let (_state, mut router, _tmp) = setup_test_app().await;
        let (status, body) = send_json(
            &mut router,
            request(
                "POST",
                "/api/v1/datasources",
                Some((1, "user")),
                Some(json!({"name": "legacy", "engine": "oracle", "database_name": "x"})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("oracle"));
    }

    #[tokio::test]
    async fn execute_returns_rows_for_owner_only() {
        let (_state, mut router, temp) = setup_test_app().await;
        let source = create_sqlite_source(&mut router, &temp, 1).await;
        let query = create_query(&mut router, 1, source).await;
        let uri = format!("/api/v1/queries/{query}/execute");

        let (status, body) =
            send_json(&mut router, request("POST", &uri, Some((1, "user")), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"data": [{"answer": 42, "label": "x"}]}));

        let (status, _) =
            send_json(&mut router, request("POST", &uri, Some((2, "user")), None)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) =
            send_json(&mut router, request("POST", &uri, Some((9, "admin")), None)).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send_json(
            &mut router,
            request("GET", &format!("/api/v1/queries/{query}"), Some((1, "user")), None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["exec_count"], json!(2));
    }

    #[tokio::test]
    async fn missing_target_database_is_bad_gateway() {
        let (_state, mut router, temp) = setup_test_app().await;
        let (status, body) = send_json(
            &mut router,
            request(
                "POST",
                "/api/v1/datasources",
                Some((1, "user")),
                Some(json!({
                    "name": "gone",
                    "engine": "sqlite",
                    "database_name": temp.path().join("missing.db").display().to_string()
                })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let query = create_query(&mut router, 1, body["id"].as_i64().unwrap()).await;

        let (status, _) = send_json(
            &mut router,
            request("POST", &format!("/api/v1/queries/{query}/execute"), Some((1, "user")), None),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn delete_guards_return_conflict() {
        let (_state, mut router, temp) = setup_test_app().await;
        let source = create_sqlite_source(&mut router, &temp, 1).await;
        let query = create_query(&mut router, 1, source).await;

        let (status, _) = send_json(
            &mut router,
            request(
                "POST",
                "/api/v1/report-schedules",
                Some((1, "user")),
                Some(json!({
                    "name": "daily",
                    "report_type": "daily",
                    "query_ids": [query],
                    "cron_pattern": "0 6 * * *"
                })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, _) = send_json(
            &mut router,
            request("DELETE", &format!("/api/v1/datasources/{source}"), Some((1, "user")), None),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = send_json(
            &mut router,
            request("DELETE", &format!("/api/v1/queries/{query}"), Some((1, "user")), None),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn schedule_validation_and_visibility() {
        let (_state, mut router, _tmp) = setup_test_app().await;

        let (status, body) = send_json(
            &mut router,
            request(
                "POST",
                "/api/v1/report-schedules",
                Some((1, "user")),
                Some(json!({
                    "name": "bad",
                    "report_type": "daily",
                    "cron_pattern": "every morning"
                })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("cron"));

        let (status, _) = send_json(
            &mut router,
            request(
                "POST",
                "/api/v1/report-schedules",
                Some((1, "user")),
                Some(json!({"name": "bad", "report_type": "hourly", "cron_pattern": "* * * * *"})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send_json(
            &mut router,
            request(
                "POST",
                "/api/v1/report-schedules",
                Some((1, "user")),
                Some(json!({
                    "name": "weekly",
                    "report_type": "weekly",
                    "cron_pattern": "0 9 * * 1"
                })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert!(body["next_run"].is_string());
        let id = body["id"].as_i64().unwrap();

        let (status, _) = send_json(
            &mut router,
            request("GET", &format!("/api/v1/report-schedules/{id}"), Some((2, "user")), None),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = send_json(
            &mut router,
            request("GET", "/api/v1/report-schedules", Some((9, "admin")), None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cache_clear_is_admin_only() {
        let (_state, mut router, _tmp) = setup_test_app().await;
        send_json(&mut router, request("GET", "/api/v1/queries", Some((1, "user")), None)).await;

        let (status, _) = send_json(
            &mut router,
            request("POST", "/api/v1/cache/clear", Some((1, "user")), Some(json!({}))),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = send_json(
            &mut router,
            request(
                "POST",
                "/api/v1/cache/clear",
                Some((9, "admin")),
                Some(json!({"scope": "bogus"})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send_json(
            &mut router,
            request(
                "POST",
                "/api/v1/cache/clear",
                Some((9, "admin")),
                Some(json!({"scope": "list"})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["removed"], json!(1));
    }

    #[tokio::test]
    async fn report_download_serves_workbook_with_file_name() {
        let (state, mut router, temp) = setup_test_app().await;
        let source = create_sqlite_source(&mut router, &temp, 1).await;
        let query = create_query(&mut router, 1, source).await;
        let (_, body) = send_json(
            &mut router,
            request(
                "POST",
                "/api/v1/report-schedules",
                Some((1, "user")),
                Some(json!({
                    "name": "kpi",
                    "report_type": "monthly",
                    "query_ids": [query],
                    "cron_pattern": "0 0 1 * *"
                })),
            ),
        )
        .await;
        let schedule_id = body["id"].as_i64().unwrap();

        let actor = Actor::user(1);
        let schedule = state.engine.get_schedule(&actor, schedule_id).await.unwrap();
        let pending = state
            .engine
            .report_builder()
            .begin(&schedule, chrono::Utc::now())
            .await
            .unwrap();
        let (status, _) = send_json(
            &mut router,
            request(
                "GET",
                &format!("/api/v1/reports/{}/download", pending.id),
                Some((1, "user")),
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let outcome = state.engine.report_builder().generate(&schedule).await.unwrap();
        let response = router
            .call(request(
                "GET",
                &format!("/api/v1/reports/{}/download", outcome.report.id),
                Some((1, "user")),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let disposition = response
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(disposition.starts_with("attachment; filename=\"kpi_"));
        assert!(disposition.ends_with(".xlsx\""));
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(bytes.starts_with(b"PK"));

        let (status, body) = send_json(
            &mut router,
            request("GET", "/api/v1/reports", Some((1, "user")), None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 2);

        let (status, _) = send_json(
            &mut router,
            request(
                "GET",
                &format!("/api/v1/reports/{}/download", outcome.report.id),
                Some((2, "user")),
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[test]
    fn openapi_document_lists_routes() {
        let doc = docs::ApiDoc::openapi();
        let yaml = doc.to_yaml().expect("yaml");
        assert!(yaml.contains("/api/v1/queries/{id}/execute"));
        assert!(yaml.contains("/api/v1/reports/{id}/download"));
        assert!(yaml.contains("tallyIdentity"));
    }
}
