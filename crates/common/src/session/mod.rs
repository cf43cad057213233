//! Schema-bound database sessions
//!
//! Every pooled connection carries a session-level `search_path`, and that
//! setting outlives the request that set it. A connection handed back to the
//! pool while still pointing at tenant A's schema would let the next request,
//! possibly for tenant B, read or write A's rows before its own binding runs.
//!
//! The binding is therefore enforced on both sides:
//! - on acquire, the tenant schema is asserted and read back before the
//!   session is handed to anyone;
//! - on release, the neutral search_path is restored (and verified) before the
//!   connection goes back to the pool. A connection that cannot be reset is
//!   discarded instead.
//!
//! A [`TenantSession`] dropped without [`TenantSession::release`] (panic,
//! timeout, cancelled request future) still resets its connection on a
//! spawned task.

pub mod memory;
pub mod postgres;

use crate::db::models::Tenant;
use crate::errors::{AppError, Result};
use crate::metrics;
use async_trait::async_trait;
use axum::{extract::FromRequestParts, http::request::Parts};
use futures::future::BoxFuture;
use regex_lite::Regex;
use serde_json::{Map, Value};
use std::sync::{Arc, LazyLock};
use std::time::Instant;
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};
use tracing::{debug, error, warn};
use uuid::Uuid;

static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z_][a-z0-9_]{0,62}$").expect("identifier pattern is valid")
});

/// Lowercase SQL identifier, safe to interpolate once double-quoted
pub fn is_valid_identifier(name: &str) -> bool {
    IDENTIFIER.is_match(name)
}

pub(crate) fn ensure_identifier(name: &str) -> Result<()> {
    if is_valid_identifier(name) {
        Ok(())
    } else {
        Err(AppError::Validation {
            message: format!("invalid identifier: {name:?}"),
            field: None,
        })
    }
}

/// Canonical form of a search_path value: quotes and whitespace stripped
pub fn normalize_search_path(raw: &str) -> String {
    raw.split(',')
        .map(|part| part.trim().trim_matches('"'))
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}

/// A physical pooled connection.
///
/// Dropping the box returns the connection to its pool as-is; callers go
/// through [`TenantSession`], which resets it first.
#[async_trait]
pub trait TenantConnection: Send {
    /// Issue a session-scoped `SET search_path`
    async fn set_search_path(&mut self, schema: &str) -> Result<()>;

    /// Current session search_path as reported by the server
    async fn search_path(&mut self) -> Result<String>;

    async fn schema_exists(&mut self, schema: &str) -> Result<bool>;

    /// Insert one row into an unqualified table and return it as JSON
    async fn insert_row(&mut self, table: &str, row: &Map<String, Value>) -> Result<Value>;

    /// Read every row of an unqualified table as JSON
    async fn fetch_rows(&mut self, table: &str) -> Result<Vec<Value>>;

    /// Close the connection instead of returning it to the pool
    fn discard(self: Box<Self>);
}

/// Bounded pool of [`TenantConnection`]s shared by every tenant
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    /// Wait for a connection; a timeout maps to [`AppError::DatabaseUnavailable`]
    async fn acquire(&self) -> Result<Box<dyn TenantConnection>>;

    async fn ping(&self) -> Result<()>;
}

/// Hands out tenant-bound sessions over a shared pool
#[derive(Clone)]
pub struct SchemaSessionManager {
    pool: Arc<dyn ConnectionPool>,
    neutral_search_path: String,
}

impl SchemaSessionManager {
    pub fn new(pool: Arc<dyn ConnectionPool>, neutral_search_path: impl Into<String>) -> Self {
        Self {
            pool,
            neutral_search_path: neutral_search_path.into(),
        }
    }

    pub fn pool(&self) -> &Arc<dyn ConnectionPool> {
        &self.pool
    }

    /// Acquire a connection and bind it to the tenant's schema
    pub async fn acquire(&self, tenant: &Tenant) -> Result<TenantSession> {
        let schema = tenant.schema_name.clone();
        if !is_valid_identifier(&schema) {
            error!(tenant_id = %tenant.id, "Tenant schema name is not a valid identifier");
            return Err(AppError::TenantSchemaMissing {
                tenant_id: tenant.id,
                schema,
            });
        }

        let started = Instant::now();
        let conn = match self.pool.acquire().await {
            Ok(conn) => conn,
            Err(e) => {
                metrics::record_session_acquire(started.elapsed().as_secs_f64(), false);
                error!(tenant_id = %tenant.id, error = %e, "Failed to acquire pooled connection");
                return Err(e);
            }
        };

        // From here on the session owns the connection, so every early
        // return below still resets it through Drop.
        let mut session = TenantSession {
            conn: Some(conn),
            tenant_id: tenant.id,
            schema: schema.clone(),
            neutral_search_path: self.neutral_search_path.clone(),
        };

        if !session.connection()?.schema_exists(&schema).await? {
            metrics::record_session_acquire(started.elapsed().as_secs_f64(), false);
            error!(tenant_id = %tenant.id, "Tenant schema is not provisioned");
            return Err(AppError::TenantSchemaMissing {
                tenant_id: tenant.id,
                schema,
            });
        }

        session.bind().await?;

        metrics::record_session_acquire(started.elapsed().as_secs_f64(), true);
        debug!(tenant_id = %tenant.id, "Tenant session bound");
        Ok(session)
    }

    /// Run `f` against a bound session, releasing it on every exit path.
    ///
    /// The closure's result is returned unchanged; a failed reset is logged
    /// and the connection discarded.
    pub async fn with_session<T, F>(&self, tenant: &Tenant, f: F) -> Result<T>
    where
        F: for<'s> FnOnce(&'s mut TenantSession) -> BoxFuture<'s, Result<T>>,
    {
        let mut session = self.acquire(tenant).await?;
        let outcome = f(&mut session).await;
        if let Err(e) = session.release().await {
            error!(tenant_id = %tenant.id, error = %e, "Failed to reset tenant session");
        }
        outcome
    }
}

/// A pooled connection bound to one tenant's schema for one request
pub struct TenantSession {
    conn: Option<Box<dyn TenantConnection>>,
    tenant_id: Uuid,
    schema: String,
    neutral_search_path: String,
}

impl std::fmt::Debug for TenantSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantSession")
            .field("tenant_id", &self.tenant_id)
            .field("released", &self.conn.is_none())
            .finish()
    }
}

impl TenantSession {
    pub fn tenant_id(&self) -> Uuid {
        self.tenant_id
    }

    fn connection(&mut self) -> Result<&mut (dyn TenantConnection + 'static)> {
        self.conn.as_deref_mut().ok_or_else(|| AppError::Internal {
            message: "tenant session already released".to_string(),
        })
    }

    /// Assert the tenant binding and confirm the server reports it
    async fn bind(&mut self) -> Result<()> {
        let schema = self.schema.clone();
        let conn = self.connection()?;
        conn.set_search_path(&schema).await?;

        let active = conn.search_path().await?;
        if normalize_search_path(&active) != schema {
            return Err(AppError::Internal {
                message: format!("search_path is {active:?} after binding {schema:?}"),
            });
        }
        Ok(())
    }

    /// Insert a row into a table of the bound schema
    pub async fn insert_row(&mut self, table: &str, row: Map<String, Value>) -> Result<Value> {
        self.connection()?.insert_row(table, &row).await
    }

    /// Read all rows of a table of the bound schema
    pub async fn fetch_rows(&mut self, table: &str) -> Result<Vec<Value>> {
        self.connection()?.fetch_rows(table).await
    }

    pub async fn search_path(&mut self) -> Result<String> {
        self.connection()?.search_path().await
    }

    /// Reset the binding and return the connection to the pool
    pub async fn release(mut self) -> Result<()> {
        match self.conn.take() {
            Some(conn) => reset_connection(conn, &self.neutral_search_path, self.tenant_id).await,
            None => Ok(()),
        }
    }
}

impl Drop for TenantSession {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };

        let tenant_id = self.tenant_id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(tenant_id = %tenant_id, "Tenant session dropped without release, resetting in background");
                let neutral = self.neutral_search_path.clone();
                handle.spawn(async move {
                    if let Err(e) = reset_connection(conn, &neutral, tenant_id).await {
                        error!(tenant_id = %tenant_id, error = %e, "Background session reset failed");
                    }
                });
            }
            Err(_) => {
                warn!(tenant_id = %tenant_id, "No runtime to reset tenant session, discarding connection");
                metrics::record_session_release("discarded");
                conn.discard();
            }
        }
    }
}

/// Restore the neutral search_path; discard the connection if that fails
async fn reset_connection(
    mut conn: Box<dyn TenantConnection>,
    neutral: &str,
    tenant_id: Uuid,
) -> Result<()> {
    let outcome = async {
        conn.set_search_path(neutral).await?;
        let active = conn.search_path().await?;
        if normalize_search_path(&active) == neutral {
            Ok(())
        } else {
            Err(AppError::Internal {
                message: format!("search_path is {active:?} after reset"),
            })
        }
    }
    .await;

    match outcome {
        Ok(()) => {
            metrics::record_session_release("reset");
            drop(conn);
            Ok(())
        }
        Err(e) => {
            warn!(tenant_id = %tenant_id, error = %e, "Discarding connection that could not be reset");
            metrics::record_session_release("discarded");
            conn.discard();
            Err(e)
        }
    }
}

/// Request-scoped handle to the tenant session, shared through request extensions
#[derive(Clone)]
pub struct TenantDb {
    inner: Arc<Mutex<Option<TenantSession>>>,
}

impl TenantDb {
    pub fn new(session: TenantSession) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(session))),
        }
    }

    /// Lock the bound session for the duration of a query sequence
    pub async fn lock(&self) -> Result<MappedMutexGuard<'_, TenantSession>> {
        MutexGuard::try_map(self.inner.lock().await, |slot| slot.as_mut()).map_err(|_| {
            AppError::Internal {
                message: "tenant session already released".to_string(),
            }
        })
    }

    /// Take the session out so the pipeline can release it
    pub async fn take(&self) -> Option<TenantSession> {
        self.inner.lock().await.take()
    }

    /// Release the session if it is still held
    pub async fn release(&self) {
        if let Some(session) = self.take().await {
            let tenant_id = session.tenant_id();
            if let Err(e) = session.release().await {
                error!(tenant_id = %tenant_id, error = %e, "Failed to reset tenant session");
            }
        }
    }
}

impl<S> FromRequestParts<S> for TenantDb
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self> {
        parts
            .extensions
            .get::<TenantDb>()
            .cloned()
            .ok_or_else(|| AppError::Internal {
                message: "route has no tenant session".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::memory::{MemoryDatabase, MemoryPool, Statement};
    use super::*;
    use crate::db::models::TenantStatus;
    use serde_json::json;
    use std::time::Duration;
    use tokio_test::assert_err;

    fn tenant(subdomain: &str, schema: &str) -> Tenant {
        let now = chrono::Utc::now();
        Tenant {
            id: Uuid::new_v4(),
            name: subdomain.to_uppercase(),
            subdomain: subdomain.to_string(),
            schema_name: schema.to_string(),
            status: TenantStatus::Active.into(),
            created_at: now.into(),
            updated_at: now.into(),
        }
    }

    fn single_connection_setup() -> (Arc<MemoryDatabase>, Arc<MemoryPool>, SchemaSessionManager) {
        let db = MemoryDatabase::new();
        db.create_table("tenant_a", "beds");
        db.create_table("tenant_b", "beds");
        let pool = Arc::new(MemoryPool::new(db.clone(), 1, Duration::from_millis(200)));
        let manager = SchemaSessionManager::new(pool.clone(), "public");
        (db, pool, manager)
    }

    fn row(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_identifier_validation() {
        assert!(is_valid_identifier("tenant_42"));
        assert!(is_valid_identifier("_private"));
        assert!(!is_valid_identifier("Tenant"));
        assert!(!is_valid_identifier("tenant;drop"));
        assert!(!is_valid_identifier("a\"b"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("public.beds"));
    }

    #[test]
    fn test_normalize_search_path() {
        assert_eq!(normalize_search_path("\"tenant_42\""), "tenant_42");
        assert_eq!(normalize_search_path(" tenant_42 , public"), "tenant_42, public");
        assert_eq!(normalize_search_path("public"), "public");
    }

    #[tokio::test]
    async fn test_interleaved_tenants_never_see_each_other() {
        let (db, _pool, manager) = single_connection_setup();
        let a = tenant("a", "tenant_a");
        let b = tenant("b", "tenant_b");

        let mut session = manager.acquire(&a).await.unwrap();
        session.insert_row("beds", row(json!({ "label": "A-1" }))).await.unwrap();
        session.release().await.unwrap();

        let mut session = manager.acquire(&b).await.unwrap();
        let rows = session.fetch_rows("beds").await.unwrap();
        assert!(rows.is_empty(), "tenant B observed tenant A rows: {rows:?}");
        session.insert_row("beds", row(json!({ "label": "B-1" }))).await.unwrap();
        session.release().await.unwrap();

        let mut session = manager.acquire(&a).await.unwrap();
        let rows = session.fetch_rows("beds").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["label"], "A-1");
        session.release().await.unwrap();

        assert_eq!(db.rows("tenant_a", "beds").len(), 1);
        assert_eq!(db.rows("tenant_b", "beds").len(), 1);
    }

    #[tokio::test]
    async fn test_release_resets_before_returning_to_pool() {
        let (_db, pool, manager) = single_connection_setup();
        let session = manager.acquire(&tenant("a", "tenant_a")).await.unwrap();
        session.release().await.unwrap();

        assert_eq!(pool.idle_search_paths(), vec!["public".to_string()]);
    }

    #[tokio::test]
    async fn test_acquire_reasserts_binding_on_dirty_connection() {
        let (db, pool, manager) = single_connection_setup();

        // Simulate a faulty caller returning a connection still bound to A
        let mut raw = pool.acquire().await.unwrap();
        raw.set_search_path("tenant_a").await.unwrap();
        drop(raw);
        assert_eq!(pool.idle_search_paths(), vec!["tenant_a".to_string()]);
        db.clear_journal();

        let mut session = manager.acquire(&tenant("b", "tenant_b")).await.unwrap();
        session.insert_row("beds", row(json!({ "label": "B-1" }))).await.unwrap();
        session.release().await.unwrap();

        let statements: Vec<Statement> = db.journal().into_iter().map(|e| e.statement).collect();
        let bind = statements
            .iter()
            .position(|s| *s == Statement::SetSearchPath("tenant_b".into()))
            .expect("binding issued");
        let insert = statements
            .iter()
            .position(|s| matches!(s, Statement::Insert { .. }))
            .expect("insert issued");
        assert!(bind < insert);
        assert_eq!(
            statements[insert],
            Statement::Insert {
                schema: "tenant_b".into(),
                table: "beds".into()
            }
        );
        assert!(db.rows("tenant_a", "beds").is_empty());
    }

    #[tokio::test]
    async fn test_dropped_session_is_reset_in_background() {
        let (_db, pool, manager) = single_connection_setup();
        let session = manager.acquire(&tenant("a", "tenant_a")).await.unwrap();
        drop(session);

        // The pool has one connection; the next acquire waits for the reset task
        let mut next = manager.acquire(&tenant("b", "tenant_b")).await.unwrap();
        assert_eq!(normalize_search_path(&next.search_path().await.unwrap()), "tenant_b");
        next.release().await.unwrap();
        assert_eq!(pool.idle_search_paths(), vec!["public".to_string()]);
    }

    #[tokio::test]
    async fn test_pool_exhaustion_is_database_unavailable() {
        let (_db, _pool, manager) = single_connection_setup();
        let held = manager.acquire(&tenant("a", "tenant_a")).await.unwrap();

        let err = manager.acquire(&tenant("b", "tenant_b")).await.unwrap_err();
        assert!(matches!(err, AppError::DatabaseUnavailable { .. }));

        held.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_schema_is_fatal() {
        let (_db, pool, manager) = single_connection_setup();
        let err = manager.acquire(&tenant("c", "tenant_c")).await.unwrap_err();
        assert!(matches!(err, AppError::TenantSchemaMissing { .. }));

        // The connection still comes back, reset
        tokio::task::yield_now().await;
        let conn = tokio::time::timeout(Duration::from_secs(1), pool.acquire()).await;
        assert!(matches!(conn, Ok(Ok(_))));
    }

    #[tokio::test]
    async fn test_with_session_releases_on_error() {
        let (_db, pool, manager) = single_connection_setup();
        let a = tenant("a", "tenant_a");

        let result: Result<Vec<Value>> = manager
            .with_session(&a, |session| Box::pin(async move { session.fetch_rows("wards").await }))
            .await;
        assert_err!(result);
        assert_eq!(pool.idle_search_paths(), vec!["public".to_string()]);

        let count = manager
            .with_session(&a, |session| {
                Box::pin(async move { Ok(session.fetch_rows("beds").await?.len()) })
            })
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_tenant_db_release() {
        let (_db, pool, manager) = single_connection_setup();
        let db = TenantDb::new(manager.acquire(&tenant("a", "tenant_a")).await.unwrap());
        {
            let mut session = db.lock().await.unwrap();
            session.insert_row("beds", row(json!({ "label": "A-1" }))).await.unwrap();
        }
        db.release().await;
        assert_err!(db.lock().await);
        assert_eq!(pool.idle_search_paths(), vec!["public".to_string()]);
    }
}
