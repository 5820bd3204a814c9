use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};

use crate::error::DealError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub display_name: Option<String>,
}

/// Lookup of known platform users. Deal creation resolves the counterparty
/// email through this seam.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn user_by_email(&self, email: &str) -> Result<Option<User>, DealError>;
    async fn user_by_id(&self, id: &str) -> Result<Option<User>, DealError>;
}

#[derive(Clone)]
pub struct UserService {
    pool: PgPool,
}

impl UserService {
    pub fn new(pool: PgPool) -> Self {
        UserService { pool }
    }
}

#[async_trait]
impl UserDirectory for UserService {
    async fn user_by_email(&self, email: &str) -> Result<Option<User>, DealError> {
        let row = sqlx::query("SELECT id, email, display_name FROM users WHERE email = $1")
            .bind(email)
            .fetch_optional(&self.pool)
            .await
            .context("fetching user by email")?;
        Ok(row.map(|row| User {
            id: row.get("id"),
            email: row.get("email"),
            display_name: row.get("display_name"),
        }))
    }

    async fn user_by_id(&self, id: &str) -> Result<Option<User>, DealError> {
        let row = sqlx::query("SELECT id, email, display_name FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("fetching user by id")?;
        Ok(row.map(|row| User {
            id: row.get("id"),
            email: row.get("email"),
            display_name: row.get("display_name"),
        }))
    }
}

/// Fixed user set for tests and offline runs.
#[derive(Default)]
pub struct StaticUserDirectory {
    users: Vec<User>,
}

impl StaticUserDirectory {
    pub fn new(users: Vec<User>) -> Self {
        StaticUserDirectory { users }
    }
}

#[async_trait]
impl UserDirectory for StaticUserDirectory {
    async fn user_by_email(&self, email: &str) -> Result<Option<User>, DealError> {
        Ok(self.users.iter().find(|u| u.email == email).cloned())
    }

    async fn user_by_id(&self, id: &str) -> Result<Option<User>, DealError> {
        Ok(self.users.iter().find(|u| u.id == id).cloned())
    }
}
