//! Data source and query rows.

use anyhow::{anyhow, Result};
use chrono::Utc;
use futures::TryStreamExt;
use sqlx::{sqlite::SqliteRow, Row};

use crate::{
    encode_timestamp, parse_datetime, CatalogError, DataSourceRecord, Database, QueryRecord,
};

/// Input payload for data source registration. The secret must already be
/// encrypted.
#[derive(Debug, Clone)]
pub struct NewDataSource<'a> {
    pub user_id: i64,
    pub name: &'a str,
    pub engine: &'a str,
    pub host: &'a str,
    pub port: u16,
    pub database_name: &'a str,
    pub username: &'a str,
    pub encrypted_secret: &'a str,
    pub description: &'a str,
    pub is_public: bool,
}

/// Full replacement of the mutable data source fields. `encrypted_secret: None`
/// keeps the stored ciphertext.
#[derive(Debug, Clone)]
pub struct DataSourceChanges<'a> {
    pub name: &'a str,
    pub engine: &'a str,
    pub host: &'a str,
    pub port: u16,
    pub database_name: &'a str,
    pub username: &'a str,
    pub encrypted_secret: Option<&'a str>,
    pub description: &'a str,
    pub is_public: bool,
}

#[derive(Debug, Clone)]
pub struct NewQuery<'a> {
    pub user_id: i64,
    pub data_source_id: i64,
    pub name: &'a str,
    pub sql_text: &'a str,
    pub description: &'a str,
    pub is_public: bool,
}

#[derive(Debug, Clone)]
pub struct QueryChanges<'a> {
    pub data_source_id: i64,
    pub name: &'a str,
    pub sql_text: &'a str,
    pub description: &'a str,
    pub is_public: bool,
}

impl Database {
    pub async fn create_data_source(&self, data: NewDataSource<'_>) -> Result<DataSourceRecord> {
        let now = encode_timestamp(Utc::now());
        let result = sqlx::query(
            r#"
            INSERT INTO data_sources (
                user_id, name, engine, host, port, database_name, username,
                encrypted_secret, description, is_public, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(data.user_id)
        .bind(data.name)
        .bind(data.engine)
        .bind(data.host)
        .bind(data.port as i64)
        .bind(data.database_name)
        .bind(data.username)
        .bind(data.encrypted_secret)
        .bind(data.description)
        .bind(data.is_public)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        self.fetch_data_source(id)
            .await?
            .ok_or_else(|| anyhow!("data source {} inserted but missing when reloaded", id))
    }

    pub async fn fetch_data_source(&self, id: i64) -> Result<Option<DataSourceRecord>> {
        let row = sqlx::query("SELECT * FROM data_sources WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(map_data_source).transpose()
    }

    /// Lists data sources newest first. `visible_to: None` is the unrestricted
    /// (admin) view; `Some(user)` limits rows to those owned by `user` or public.
    pub async fn list_data_sources(
        &self,
        visible_to: Option<i64>,
    ) -> Result<Vec<DataSourceRecord>> {
        let mut rows = sqlx::query(
            r#"
            SELECT * FROM data_sources
            WHERE ?1 IS NULL OR user_id = ?1 OR is_public = 1
            ORDER BY created_at DESC, id DESC
            "#,
        )
        .bind(visible_to)
        .fetch(&self.pool);

        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(map_data_source(row)?);
        }
        Ok(out)
    }

    pub async fn update_data_source(
        &self,
        id: i64,
        changes: DataSourceChanges<'_>,
    ) -> Result<DataSourceRecord> {
        let now = encode_timestamp(Utc::now());
        let result = sqlx::query(
            r#"
            UPDATE data_sources
            SET name = ?, engine = ?, host = ?, port = ?, database_name = ?, username = ?,
                encrypted_secret = COALESCE(?, encrypted_secret),
                description = ?, is_public = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(changes.name)
        .bind(changes.engine)
        .bind(changes.host)
        .bind(changes.port as i64)
        .bind(changes.database_name)
        .bind(changes.username)
        .bind(changes.encrypted_secret)
        .bind(changes.description)
        .bind(changes.is_public)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CatalogError::NotFound {
                kind: "data source",
                id,
            }
            .into());
        }

        self.fetch_data_source(id)
            .await?
            .ok_or_else(|| anyhow!("data source {} updated but missing when reloaded", id))
    }

    pub async fn delete_data_source(&self, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM data_sources WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CatalogError::NotFound {
                kind: "data source",
                id,
            }
            .into());
        }
        Ok(())
    }

    pub async fn count_queries_for_data_source(&self, data_source_id: i64) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queries WHERE data_source_id = ?")
            .bind(data_source_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn create_query(&self, data: NewQuery<'_>) -> Result<QueryRecord> {
        let now = encode_timestamp(Utc::now());
        let result = sqlx::query(
            r#"
            INSERT INTO queries (
                user_id, data_source_id, name, sql_text, description, is_public,
                exec_count, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?)
            "#,
        )
        .bind(data.user_id)
        .bind(data.data_source_id)
        .bind(data.name)
        .bind(data.sql_text)
        .bind(data.description)
        .bind(data.is_public)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        self.fetch_query(id)
            .await?
            .ok_or_else(|| anyhow!("query {} inserted but missing when reloaded", id))
    }

    pub async fn fetch_query(&self, id: i64) -> Result<Option<QueryRecord>> {
        let row = sqlx::query("SELECT * FROM queries WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(map_query).transpose()
    }

    /// Same visibility rules as [`Database::list_data_sources`].
    pub async fn list_queries(&self, visible_to: Option<i64>) -> Result<Vec<QueryRecord>> {
        let mut rows = sqlx::query(
            r#"
            SELECT * FROM queries
            WHERE ?1 IS NULL OR user_id = ?1 OR is_public = 1
            ORDER BY created_at DESC, id DESC
            "#,
        )
        .bind(visible_to)
        .fetch(&self.pool);

        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(map_query(row)?);
        }
        Ok(out)
    }

    pub async fn update_query(&self, id: i64, changes: QueryChanges<'_>) -> Result<QueryRecord> {
        let now = encode_timestamp(Utc::now());
        let result = sqlx::query(
            r#"
            UPDATE queries
            SET data_source_id = ?, name = ?, sql_text = ?, description = ?,
                is_public = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(changes.data_source_id)
        .bind(changes.name)
        .bind(changes.sql_text)
        .bind(changes.description)
        .bind(changes.is_public)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CatalogError::NotFound { kind: "query", id }.into());
        }

        self.fetch_query(id)
            .await?
            .ok_or_else(|| anyhow!("query {} updated but missing when reloaded", id))
    }

    pub async fn delete_query(&self, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM queries WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CatalogError::NotFound { kind: "query", id }.into());
        }
        Ok(())
    }

    pub async fn increment_exec_count(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE queries SET exec_count = exec_count + 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn map_data_source(row: SqliteRow) -> Result<DataSourceRecord> {
    let port: i64 = row.try_get("port")?;

    Ok(DataSourceRecord {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        name: row.try_get("name")?,
        engine: row.try_get("engine")?,
        host: row.try_get("host")?,
        port: u16::try_from(port).map_err(|_| anyhow!("stored port {} out of range", port))?,
        database_name: row.try_get("database_name")?,
        username: row.try_get("username")?,
        encrypted_secret: row.try_get("encrypted_secret")?,
        description: row.try_get("description")?,
        is_public: row.try_get("is_public")?,
        created_at: parse_datetime(row.try_get("created_at")?)?,
        updated_at: parse_datetime(row.try_get("updated_at")?)?,
    })
}

fn map_query(row: SqliteRow) -> Result<QueryRecord> {
    Ok(QueryRecord {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        data_source_id: row.try_get("data_source_id")?,
        name: row.try_get("name")?,
        sql_text: row.try_get("sql_text")?,
        description: row.try_get("description")?,
        is_public: row.try_get("is_public")?,
        exec_count: row.try_get("exec_count")?,
        created_at: parse_datetime(row.try_get("created_at")?)?,
        updated_at: parse_datetime(row.try_get("updated_at")?)?,
    })
}
