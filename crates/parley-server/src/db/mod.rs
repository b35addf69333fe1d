//! libSQL storage for Parley Server.
//!
//! The relay keeps no chat history; the database only holds the user
//! directory consulted when a credential is verified.
//!
//! An in-memory database is private to the connection that created it, so
//! in-memory databases keep one persistent connection that every caller
//! shares. File databases hand out a fresh connection per use.

mod migrations;

use libsql::{Connection, Database as LibSqlDatabase};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

pub use migrations::MigrationRunner;

/// Database-specific errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Failed to connect to database: {0}")]
    ConnectionFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Internal database error: {0}")]
    Internal(#[from] libsql::Error),
}

/// Wrapper around a libsql database
#[derive(Clone)]
pub struct Database {
    db: Arc<LibSqlDatabase>,
    name: String,
    persistent: Option<Arc<Mutex<Connection>>>,
}

impl Database {
    /// Create a new in-memory database
    #[instrument(skip_all)]
    pub async fn in_memory(name: &str) -> Result<Self, DatabaseError> {
        debug!("Creating in-memory database: {}", name);
        let db = libsql::Builder::new_local(":memory:").build().await?;
        let conn = db.connect()?;

        Ok(Self {
            db: Arc::new(db),
            name: name.to_string(),
            persistent: Some(Arc::new(Mutex::new(conn))),
        })
    }

    /// Create or open a local file-based database
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub async fn open_local(name: &str, path: impl AsRef<Path>) -> Result<Self, DatabaseError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::ConnectionFailed(format!(
                    "Failed to create database directory: {}",
                    e
                ))
            })?;
        }

        let db = libsql::Builder::new_local(path).build().await?;

        info!("Opened database '{}' at {:?}", name, path);
        Ok(Self {
            db: Arc::new(db),
            name: name.to_string(),
            persistent: None,
        })
    }

    /// Open `path`, or an in-memory database when `path` is `None`.
    pub async fn open(name: &str, path: Option<&str>) -> Result<Self, DatabaseError> {
        match path {
            Some(path) => Self::open_local(name, path).await,
            None => Self::in_memory(name).await,
        }
    }

    /// Get a fresh connection to the database
    pub fn connect(&self) -> Result<Connection, DatabaseError> {
        Ok(self.db.connect()?)
    }

    /// Shared connection for in-memory databases
    pub fn persistent_connection(&self) -> Option<Arc<Mutex<Connection>>> {
        self.persistent.clone()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check if the database answers a trivial query
    #[instrument(skip_all, fields(name = %self.name))]
    pub async fn health_check(&self) -> Result<bool, DatabaseError> {
        let result = if let Some(persistent) = self.persistent_connection() {
            let conn = persistent.lock().await;
            conn.query("SELECT 1", ()).await.map(|_| ())
        } else {
            let conn = self.connect()?;
            conn.query("SELECT 1", ()).await.map(|_| ())
        };

        match result {
            Ok(()) => Ok(true),
            Err(e) => {
                tracing::warn!("Database health check failed: {}", e);
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_database() {
        let db = Database::in_memory("test").await.unwrap();
        assert_eq!(db.name(), "test");
        assert!(db.persistent_connection().is_some());
    }

    #[tokio::test]
    async fn test_health_check() {
        let db = Database::in_memory("test").await.unwrap();
        assert!(db.health_check().await.unwrap());
    }

    #[tokio::test]
    async fn test_open_local_file() {
        let dir = std::env::temp_dir().join(format!("parley-db-{}", std::process::id()));
        let path = dir.join("users.db");

        let db = Database::open("users", path.to_str()).await.unwrap();
        assert!(db.persistent_connection().is_none());
        assert!(db.health_check().await.unwrap());

        std::fs::remove_dir_all(dir).ok();
    }
}
