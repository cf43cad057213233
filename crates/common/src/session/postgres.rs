//! PostgreSQL-backed tenant connections over a sqlx pool

use super::{ensure_identifier, ConnectionPool, TenantConnection};
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};

/// Double-quote an identifier that already passed validation
fn quoted(name: &str) -> String {
    format!("\"{name}\"")
}

/// Session pool backed by the shared sqlx `PgPool`.
///
/// The pool itself is built with an `after_release` hook that restores the
/// neutral search_path (see [`crate::db::DbPool`]); sessions reset on release
/// as well.
#[derive(Clone)]
pub struct PgTenantPool {
    pool: PgPool,
}

impl PgTenantPool {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConnectionPool for PgTenantPool {
    async fn acquire(&self) -> Result<Box<dyn TenantConnection>> {
        let conn = self.pool.acquire().await.map_err(|e| match e {
            sqlx::Error::PoolTimedOut => AppError::DatabaseUnavailable {
                message: "timed out waiting for a pooled connection".to_string(),
            },
            sqlx::Error::PoolClosed => AppError::DatabaseUnavailable {
                message: "connection pool is closed".to_string(),
            },
            other => AppError::DatabaseUnavailable {
                message: format!("failed to open connection: {other}"),
            },
        })?;

        Ok(Box::new(PgTenantConnection { conn }))
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseUnavailable {
                message: format!("ping failed: {e}"),
            })?;
        Ok(())
    }
}

/// One checked-out PostgreSQL connection
pub struct PgTenantConnection {
    conn: PoolConnection<Postgres>,
}

#[async_trait]
impl TenantConnection for PgTenantConnection {
    async fn set_search_path(&mut self, schema: &str) -> Result<()> {
        ensure_identifier(schema)?;
        sqlx::query(&format!("SET search_path TO {}", quoted(schema)))
            .execute(&mut *self.conn)
            .await?;
        Ok(())
    }

    async fn search_path(&mut self) -> Result<String> {
        let path = sqlx::query_scalar::<_, String>("SELECT current_setting('search_path')")
            .fetch_one(&mut *self.conn)
            .await?;
        Ok(path)
    }

    async fn schema_exists(&mut self, schema: &str) -> Result<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM pg_catalog.pg_namespace WHERE nspname = $1)",
        )
        .bind(schema)
        .fetch_one(&mut *self.conn)
        .await?;
        Ok(exists)
    }

    async fn insert_row(&mut self, table: &str, row: &Map<String, Value>) -> Result<Value> {
        ensure_identifier(table)?;
        for column in row.keys() {
            ensure_identifier(column)?;
        }

        let table = quoted(table);
        let sql = if row.is_empty() {
            format!("INSERT INTO {table} AS t DEFAULT VALUES RETURNING row_to_json(t)")
        } else {
            let columns = row
                .keys()
                .map(|c| quoted(c))
                .collect::<Vec<_>>()
                .join(", ");
            // Omitted columns keep their defaults; listed ones are typed by the table's row type
            format!(
                "INSERT INTO {table} AS t ({columns}) \
                 SELECT {columns} FROM jsonb_populate_record(NULL::{table}, $1) \
                 RETURNING row_to_json(t)"
            )
        };

        let query = sqlx::query_scalar::<_, Value>(&sql);
        let query = if row.is_empty() {
            query
        } else {
            query.bind(Value::Object(row.clone()))
        };
        let inserted = query.fetch_one(&mut *self.conn).await?;
        Ok(inserted)
    }

    async fn fetch_rows(&mut self, table: &str) -> Result<Vec<Value>> {
        ensure_identifier(table)?;
        let rows = sqlx::query_scalar::<_, Value>(&format!(
            "SELECT row_to_json(t) FROM {} t",
            quoted(table)
        ))
        .fetch_all(&mut *self.conn)
        .await?;
        Ok(rows)
    }

    fn discard(self: Box<Self>) {
        // Detached connections close when dropped instead of rejoining the pool
        drop(self.conn.detach());
    }
}
