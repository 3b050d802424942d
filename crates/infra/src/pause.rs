//! Global pause flag shared by every worker.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;

use crate::jobs::postgres::map_sqlx_error;
use crate::jobs::JobStoreError;

const PAUSED_KEY: &str = "paused";

/// When set, background cycles skip dispatch (deferred callbacks still run).
#[async_trait]
pub trait PauseFlag: Send + Sync {
    async fn is_paused(&self) -> Result<bool, JobStoreError>;

    async fn set_paused(&self, paused: bool) -> Result<(), JobStoreError>;
}

/// Process-local flag.
#[derive(Debug, Default)]
pub struct InMemoryPauseFlag {
    paused: AtomicBool,
}

impl InMemoryPauseFlag {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PauseFlag for InMemoryPauseFlag {
    async fn is_paused(&self) -> Result<bool, JobStoreError> {
        Ok(self.paused.load(Ordering::SeqCst))
    }

    async fn set_paused(&self, paused: bool) -> Result<(), JobStoreError> {
        self.paused.store(paused, Ordering::SeqCst);
        Ok(())
    }
}

/// Flag stored in the `job_settings` table, visible to every process.
#[derive(Debug, Clone)]
pub struct PostgresPauseFlag {
    pool: Arc<PgPool>,
}

impl PostgresPauseFlag {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl PauseFlag for PostgresPauseFlag {
    async fn is_paused(&self) -> Result<bool, JobStoreError> {
        let value: Option<serde_json::Value> =
            sqlx::query_scalar("SELECT value FROM job_settings WHERE key = $1")
                .bind(PAUSED_KEY)
                .fetch_optional(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("is_paused", e))?;

        Ok(value.and_then(|v| v.as_bool()).unwrap_or(false))
    }

    async fn set_paused(&self, paused: bool) -> Result<(), JobStoreError> {
        sqlx::query(
            r#"
            INSERT INTO job_settings (key, value, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(PAUSED_KEY)
        .bind(serde_json::Value::Bool(paused))
        .bind(Utc::now())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("set_paused", e))?;

        Ok(())
    }
}

#[async_trait]
impl<P: PauseFlag + ?Sized> PauseFlag for Arc<P> {
    async fn is_paused(&self) -> Result<bool, JobStoreError> {
        (**self).is_paused().await
    }

    async fn set_paused(&self, paused: bool) -> Result<(), JobStoreError> {
        (**self).set_paused(paused).await
    }
}
