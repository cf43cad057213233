//! In-process connection pool
//!
//! Behaves like a server-side pool for the purposes of schema binding: each
//! connection keeps its own search_path across checkouts, unqualified tables
//! resolve through it, and checkouts are bounded and FIFO. Every statement is
//! journaled so tests can assert ordering. Used by tests and local development.

use super::{ensure_identifier, normalize_search_path, ConnectionPool, TenantConnection};
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use sea_orm::DbErr;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Statement kinds recorded in the journal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    SetSearchPath(String),
    ShowSearchPath,
    SchemaExists(String),
    Insert { schema: String, table: String },
    Select { schema: String, table: String },
}

#[derive(Debug, Clone)]
pub struct JournalEntry {
    pub connection_id: u64,
    pub statement: Statement,
}

#[derive(Default)]
struct DatabaseState {
    schemas: HashSet<String>,
    tables: HashMap<(String, String), Vec<Value>>,
    journal: Vec<JournalEntry>,
}

impl DatabaseState {
    /// First schema on the search_path that holds `table`
    fn resolve(&self, search_path: &str, table: &str) -> Option<String> {
        normalize_search_path(search_path)
            .split(", ")
            .find(|schema| self.tables.contains_key(&(schema.to_string(), table.to_string())))
            .map(str::to_string)
    }

    fn record(&mut self, connection_id: u64, statement: Statement) {
        self.journal.push(JournalEntry {
            connection_id,
            statement,
        });
    }
}

/// Schemas and tables shared by every connection of a [`MemoryPool`]
pub struct MemoryDatabase {
    state: Mutex<DatabaseState>,
}

impl MemoryDatabase {
    pub fn new() -> Arc<Self> {
        let mut state = DatabaseState::default();
        state.schemas.insert("public".to_string());
        Arc::new(Self {
            state: Mutex::new(state),
        })
    }

    fn lock(&self) -> MutexGuard<'_, DatabaseState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn create_schema(&self, schema: &str) {
        self.lock().schemas.insert(schema.to_string());
    }

    /// Create an empty table, creating its schema if needed
    pub fn create_table(&self, schema: &str, table: &str) {
        let mut state = self.lock();
        state.schemas.insert(schema.to_string());
        state
            .tables
            .entry((schema.to_string(), table.to_string()))
            .or_default();
    }

    /// Rows of a schema-qualified table
    pub fn rows(&self, schema: &str, table: &str) -> Vec<Value> {
        self.lock()
            .tables
            .get(&(schema.to_string(), table.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn journal(&self) -> Vec<JournalEntry> {
        self.lock().journal.clone()
    }

    pub fn clear_journal(&self) {
        self.lock().journal.clear();
    }
}

#[derive(Debug)]
struct IdleConnection {
    id: u64,
    search_path: String,
}

/// Bounded FIFO pool over a [`MemoryDatabase`].
///
/// Connections are returned with whatever search_path they carry, like a
/// server pool without reset hooks.
pub struct MemoryPool {
    db: Arc<MemoryDatabase>,
    idle: Arc<Mutex<VecDeque<IdleConnection>>>,
    permits: Arc<Semaphore>,
    acquire_timeout: Duration,
    next_id: AtomicU64,
}

impl MemoryPool {
    pub fn new(db: Arc<MemoryDatabase>, max_connections: usize, acquire_timeout: Duration) -> Self {
        Self {
            db,
            idle: Arc::new(Mutex::new(VecDeque::new())),
            permits: Arc::new(Semaphore::new(max_connections)),
            acquire_timeout,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn database(&self) -> &Arc<MemoryDatabase> {
        &self.db
    }

    /// search_path of every idle connection, oldest first
    pub fn idle_search_paths(&self) -> Vec<String> {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|conn| conn.search_path.clone())
            .collect()
    }
}

#[async_trait]
impl ConnectionPool for MemoryPool {
    async fn acquire(&self) -> Result<Box<dyn TenantConnection>> {
        let permit = tokio::time::timeout(self.acquire_timeout, self.permits.clone().acquire_owned())
            .await
            .map_err(|_| AppError::DatabaseUnavailable {
                message: "timed out waiting for a pooled connection".to_string(),
            })?
            .map_err(|_| AppError::DatabaseUnavailable {
                message: "connection pool is closed".to_string(),
            })?;

        let state = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| IdleConnection {
                id: self.next_id.fetch_add(1, Ordering::Relaxed),
                search_path: "public".to_string(),
            });

        Ok(Box::new(MemoryConnection {
            state: Some(state),
            db: self.db.clone(),
            idle: self.idle.clone(),
            _permit: permit,
        }))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// Checked-out connection; returns itself to the pool on drop
pub struct MemoryConnection {
    state: Option<IdleConnection>,
    db: Arc<MemoryDatabase>,
    idle: Arc<Mutex<VecDeque<IdleConnection>>>,
    _permit: OwnedSemaphorePermit,
}

impl MemoryConnection {
    fn state(&mut self) -> Result<&mut IdleConnection> {
        self.state.as_mut().ok_or_else(|| AppError::Internal {
            message: "connection already closed".to_string(),
        })
    }

    fn missing_relation(table: &str) -> AppError {
        AppError::Database(DbErr::Custom(format!("relation \"{table}\" does not exist")))
    }
}

#[async_trait]
impl TenantConnection for MemoryConnection {
    async fn set_search_path(&mut self, schema: &str) -> Result<()> {
        ensure_identifier(schema)?;
        let db = self.db.clone();
        let state = self.state()?;
        state.search_path = schema.to_string();
        db.lock()
            .record(state.id, Statement::SetSearchPath(schema.to_string()));
        Ok(())
    }

    async fn search_path(&mut self) -> Result<String> {
        let db = self.db.clone();
        let state = self.state()?;
        db.lock().record(state.id, Statement::ShowSearchPath);
        Ok(state.search_path.clone())
    }

    async fn schema_exists(&mut self, schema: &str) -> Result<bool> {
        let db = self.db.clone();
        let state = self.state()?;
        let mut guard = db.lock();
        guard.record(state.id, Statement::SchemaExists(schema.to_string()));
        Ok(guard.schemas.contains(schema))
    }

    async fn insert_row(&mut self, table: &str, row: &Map<String, Value>) -> Result<Value> {
        ensure_identifier(table)?;
        for column in row.keys() {
            ensure_identifier(column)?;
        }

        let db = self.db.clone();
        let state = self.state()?;
        let mut guard = db.lock();
        let schema = guard
            .resolve(&state.search_path, table)
            .ok_or_else(|| Self::missing_relation(table))?;

        let rows = guard
            .tables
            .entry((schema.clone(), table.to_string()))
            .or_default();
        let mut stored = row.clone();
        stored
            .entry("id")
            .or_insert_with(|| Value::from(rows.len() as i64 + 1));
        let stored = Value::Object(stored);
        rows.push(stored.clone());

        guard.record(
            state.id,
            Statement::Insert {
                schema,
                table: table.to_string(),
            },
        );
        Ok(stored)
    }

    async fn fetch_rows(&mut self, table: &str) -> Result<Vec<Value>> {
        ensure_identifier(table)?;

        let db = self.db.clone();
        let state = self.state()?;
        let mut guard = db.lock();
        let schema = guard
            .resolve(&state.search_path, table)
            .ok_or_else(|| Self::missing_relation(table))?;

        let rows = guard
            .tables
            .get(&(schema.clone(), table.to_string()))
            .cloned()
            .unwrap_or_default();
        guard.record(
            state.id,
            Statement::Select {
                schema,
                table: table.to_string(),
            },
        );
        Ok(rows)
    }

    fn discard(mut self: Box<Self>) {
        self.state = None;
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            self.idle
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push_back(state);
        }
    }
}
