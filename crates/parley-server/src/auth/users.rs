//! User directory.
//!
//! Maps a token subject to a registered user. Subjects are user ids; a
//! subject that is not an integer is looked up by username instead.

use async_trait::async_trait;
use thiserror::Error;

use crate::db::{Database, DatabaseError};

/// A registered user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: i64,
    pub username: String,
}

/// User lookup errors
#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("User lookup failed: {0}")]
    Lookup(String),
}

/// Read access to registered users.
#[async_trait]
pub trait UserDirectory: Send + Sync + 'static {
    /// Find the user a token subject refers to.
    async fn find_by_subject(&self, subject: &str) -> Result<Option<UserRecord>, DirectoryError>;
}

/// User directory backed by the `users` table.
#[derive(Clone)]
pub struct LibSqlUserDirectory {
    db: Database,
}

impl LibSqlUserDirectory {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    async fn query_one(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Option<UserRecord>, DirectoryError> {
        let row = if let Some(persistent) = self.db.persistent_connection() {
            let conn = persistent.lock().await;
            let mut rows = conn
                .query(sql, params)
                .await
                .map_err(|e| DirectoryError::Lookup(format!("Failed to query user: {}", e)))?;
            rows.next()
                .await
                .map_err(|e| DirectoryError::Lookup(format!("Failed to read user row: {}", e)))?
        } else {
            let conn = self.db.connect()?;
            let mut rows = conn
                .query(sql, params)
                .await
                .map_err(|e| DirectoryError::Lookup(format!("Failed to query user: {}", e)))?;
            rows.next()
                .await
                .map_err(|e| DirectoryError::Lookup(format!("Failed to read user row: {}", e)))?
        };

        match row {
            Some(row) => Ok(Some(UserRecord {
                id: row
                    .get(0)
                    .map_err(|e| DirectoryError::Lookup(format!("Failed to get user id: {}", e)))?,
                username: row
                    .get(1)
                    .map_err(|e| DirectoryError::Lookup(format!("Failed to get username: {}", e)))?,
            })),
            None => Ok(None),
        }
    }

    /// Register a user directly. Account management is otherwise external.
    #[cfg(test)]
    pub async fn insert(&self, username: &str) -> Result<UserRecord, DirectoryError> {
        let sql = "INSERT INTO users (username) VALUES (?) RETURNING id, username";
        self.query_one(sql, libsql::params![username])
            .await?
            .ok_or_else(|| DirectoryError::Lookup("insert returned no row".to_string()))
    }
}

#[async_trait]
impl UserDirectory for LibSqlUserDirectory {
    async fn find_by_subject(&self, subject: &str) -> Result<Option<UserRecord>, DirectoryError> {
        match subject.parse::<i64>() {
            Ok(id) => {
                self.query_one(
                    "SELECT id, username FROM users WHERE id = ? LIMIT 1",
                    libsql::params![id],
                )
                .await
            }
            Err(_) => {
                self.query_one(
                    "SELECT id, username FROM users WHERE username = ? LIMIT 1",
                    libsql::params![subject],
                )
                .await
            }
        }
    }
}

/// Fixed user list for tests.
#[cfg(test)]
#[derive(Debug, Default, Clone)]
pub struct InMemoryUserDirectory {
    users: Vec<UserRecord>,
}

#[cfg(test)]
impl InMemoryUserDirectory {
    pub fn with_user(mut self, id: i64, username: &str) -> Self {
        self.users.push(UserRecord {
            id,
            username: username.to_string(),
        });
        self
    }
}

#[cfg(test)]
#[async_trait]
impl UserDirectory for InMemoryUserDirectory {
    async fn find_by_subject(&self, subject: &str) -> Result<Option<UserRecord>, DirectoryError> {
        let found = match subject.parse::<i64>() {
            Ok(id) => self.users.iter().find(|u| u.id == id),
            Err(_) => self.users.iter().find(|u| u.username == subject),
        };
        Ok(found.cloned())
    }
}
