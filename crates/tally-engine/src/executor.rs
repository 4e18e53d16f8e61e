//! On-demand execution of stored SQL against external databases.

use std::{collections::BTreeMap, time::Duration};

use futures::{Stream, TryStreamExt};
use serde_json::{Number, Value};
use sqlx::{
    mysql::MySqlRow, postgres::PgRow, sqlite::SqliteRow, ColumnIndex, Connection, Executor,
    MySqlConnection, PgConnection, Row, SqliteConnection, TypeInfo, ValueRef,
};
use tally_db::DataSourceRecord;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::connector::{ConnectionResolver, ConnectorError, EngineKind};

/// One result row keyed by column name.
pub type Record = BTreeMap<String, Value>;

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error(transparent)]
    Connector(#[from] ConnectorError),
    #[error("failed to connect to data source: {0}")]
    Connect(String),
    #[error("query failed: {0}")]
    Query(String),
    #[error("failed to read column '{column}': {message}")]
    Scan { column: String, message: String },
    #[error("query exceeded the {0:?} execution deadline")]
    Timeout(Duration),
}

impl ExecutionError {
    pub fn is_unsupported_engine(&self) -> bool {
        matches!(
            self,
            ExecutionError::Connector(ConnectorError::UnsupportedEngine(_))
        )
    }
}

/// Runs one SQL string per call over a transient connection.
#[derive(Debug, Clone)]
pub struct QueryExecutor {
    resolver: ConnectionResolver,
    timeout: Option<Duration>,
}

impl QueryExecutor {
    pub fn new(resolver: ConnectionResolver, timeout: Option<Duration>) -> Self {
        Self { resolver, timeout }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Executes `sql` verbatim against `source`. Zero rows is an empty vector.
    #[instrument(
        skip(self, source, sql),
        fields(data_source_id = source.id, engine = %source.engine)
    )]
    pub async fn execute(
        &self,
        source: &DataSourceRecord,
        sql: &str,
    ) -> Result<Vec<Record>, ExecutionError> {
        let descriptor = self.resolver.resolve(source)?;
        debug!(connection = %descriptor.redacted(), "opening transient connection");

        let run = async {
            match descriptor.engine() {
                EngineKind::Sqlite => run_sqlite(descriptor.url(), sql).await,
                EngineKind::Mysql => run_mysql(descriptor.url(), sql).await,
                EngineKind::Postgres => run_postgres(descriptor.url(), sql).await,
            }
        };
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, run)
                .await
                .map_err(|_| ExecutionError::Timeout(limit))?,
            None => run.await,
        }
    }
}

async fn run_sqlite(url: &str, sql: &str) -> Result<Vec<Record>, ExecutionError> {
    let mut conn = SqliteConnection::connect(url).await.map_err(connect_error)?;
    let outcome = collect_rows(conn.fetch(sql), decode_sqlite).await;
    close(conn).await;
    outcome
}

async fn run_mysql(url: &str, sql: &str) -> Result<Vec<Record>, ExecutionError> {
    let mut conn = MySqlConnection::connect(url).await.map_err(connect_error)?;
    let outcome = collect_rows(conn.fetch(sql), decode_mysql).await;
    close(conn).await;
    outcome
}

async fn run_postgres(url: &str, sql: &str) -> Result<Vec<Record>, ExecutionError> {
    let mut conn = PgConnection::connect(url).await.map_err(connect_error)?;
    let outcome = collect_rows(conn.fetch(sql), decode_postgres).await;
    close(conn).await;
    outcome
}

fn connect_error(err: sqlx::Error) -> ExecutionError {
    ExecutionError::Connect(err.to_string())
}

// Close on both paths; a close failure never masks the query result.
async fn close<C: Connection>(conn: C) {
    if let Err(err) = conn.close().await {
        debug!(error = %err, "failed to close transient connection");
    }
}

async fn collect_rows<R, S, F>(mut rows: S, decode: F) -> Result<Vec<Record>, ExecutionError>
where
    R: Row,
    usize: ColumnIndex<R>,
    S: Stream<Item = Result<R, sqlx::Error>> + Unpin,
    F: Fn(&R, usize, CellKind) -> Result<Value, sqlx::Error>,
{
    let mut out = Vec::new();
    while let Some(row) = rows
        .try_next()
        .await
        .map_err(|err| ExecutionError::Query(err.to_string()))?
    {
        out.push(normalize_row(&row, &decode)?);
    }
    Ok(out)
}

fn normalize_row<R, F>(row: &R, decode: &F) -> Result<Record, ExecutionError>
where
    R: Row,
    usize: ColumnIndex<R>,
    F: Fn(&R, usize, CellKind) -> Result<Value, sqlx::Error>,
{
    let mut record = Record::new();
    for (index, column) in row.columns().iter().enumerate() {
        let name = sqlx::Column::name(column).to_string();
        let value = decode_cell(row, index, decode).map_err(|err| ExecutionError::Scan {
            column: name.clone(),
            message: err.to_string(),
        })?;
        record.insert(name, value);
    }
    Ok(record)
}

fn decode_cell<R, F>(row: &R, index: usize, decode: &F) -> Result<Value, sqlx::Error>
where
    R: Row,
    usize: ColumnIndex<R>,
    F: Fn(&R, usize, CellKind) -> Result<Value, sqlx::Error>,
{
    let kind = {
        let raw = row.try_get_raw(index)?;
        if raw.is_null() {
            return Ok(Value::Null);
        }
        // SQLite reports the stored value's class here, the servers the column type.
        CellKind::classify(raw.type_info().name())
    };
    decode(row, index, kind)
}

/// How a cell is rendered in JSON. Anything without a native JSON shape
/// (decimals, dates, timestamps, uuids, json documents) is carried as text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CellKind {
    Bool,
    Int,
    Unsigned,
    Float,
    Bytes,
    Text,
}

impl CellKind {
    fn classify(type_name: &str) -> Self {
        let upper = type_name.to_ascii_uppercase();
        match upper.as_str() {
            "BOOL" | "BOOLEAN" => CellKind::Bool,
            "INT2" | "INT4" | "INT8" | "INTEGER" | "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT"
            | "BIGINT" | "YEAR" => CellKind::Int,
            "FLOAT4" | "FLOAT8" | "REAL" | "FLOAT" | "DOUBLE" => CellKind::Float,
            "BYTEA" | "BLOB" | "TINYBLOB" | "MEDIUMBLOB" | "LONGBLOB" | "BINARY"
            | "VARBINARY" => CellKind::Bytes,
            other if other.ends_with("INT UNSIGNED") => CellKind::Unsigned,
            _ => CellKind::Text,
        }
    }
}

fn float(v: f64) -> Value {
    Number::from_f64(v).map(Value::Number).unwrap_or(Value::Null)
}

fn lossy(bytes: &[u8]) -> Value {
    Value::String(String::from_utf8_lossy(bytes).into_owned())
}

fn decode_sqlite(row: &SqliteRow, index: usize, kind: CellKind) -> Result<Value, sqlx::Error> {
    Ok(match kind {
        CellKind::Bool => Value::Bool(row.try_get_unchecked::<bool, _>(index)?),
        CellKind::Int | CellKind::Unsigned => Value::from(row.try_get_unchecked::<i64, _>(index)?),
        CellKind::Float => float(row.try_get_unchecked::<f64, _>(index)?),
        CellKind::Bytes => lossy(&row.try_get_unchecked::<Vec<u8>, _>(index)?),
        CellKind::Text => Value::String(row.try_get_unchecked::<String, _>(index)?),
    })
}

// Unparameterized statements use the text protocol, so every server value
// arrives as its textual rendering and the unchecked string decode is exact.
fn decode_mysql(row: &MySqlRow, index: usize, kind: CellKind) -> Result<Value, sqlx::Error> {
    Ok(match kind {
        CellKind::Bool => Value::Bool(row.try_get_unchecked::<bool, _>(index)?),
        CellKind::Int => Value::from(row.try_get_unchecked::<i64, _>(index)?),
        CellKind::Unsigned => Value::from(row.try_get_unchecked::<u64, _>(index)?),
        CellKind::Float => float(row.try_get_unchecked::<f64, _>(index)?),
        CellKind::Bytes => lossy(&row.try_get_unchecked::<Vec<u8>, _>(index)?),
        CellKind::Text => text_or_bytes(row.try_get_unchecked::<String, _>(index), || {
            row.try_get_unchecked::<Vec<u8>, _>(index)
        })?,
    })
}

fn decode_postgres(row: &PgRow, index: usize, kind: CellKind) -> Result<Value, sqlx::Error> {
    Ok(match kind {
        CellKind::Bool => Value::Bool(row.try_get::<bool, _>(index)?),
        CellKind::Int | CellKind::Unsigned => {
            if let Ok(v) = row.try_get::<i64, _>(index) {
                Value::from(v)
            } else if let Ok(v) = row.try_get::<i32, _>(index) {
                Value::from(v)
            } else {
                Value::from(row.try_get::<i16, _>(index)?)
            }
        }
        CellKind::Float => match row.try_get::<f64, _>(index) {
            Ok(v) => float(v),
            Err(_) => float(f64::from(row.try_get::<f32, _>(index)?)),
        },
        CellKind::Bytes => lossy(&row.try_get::<Vec<u8>, _>(index)?),
        CellKind::Text => Value::String(row.try_get_unchecked::<String, _>(index)?),
    })
}

fn text_or_bytes(
    text: Result<String, sqlx::Error>,
    bytes: impl FnOnce() -> Result<Vec<u8>, sqlx::Error>,
) -> Result<Value, sqlx::Error> {
    match text {
        Ok(text) => Ok(Value::String(text)),
        Err(_) => Ok(lossy(&bytes()?)),
    }
}
