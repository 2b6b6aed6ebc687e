//! Singleton Resource Repository
//!
//! Records of resources that may exist at most once per key. A key is claimed
//! before anything is provisioned: the first claim wins, and only the winner
//! may settle the record as ready or conflicted.

use async_trait::async_trait;
use gantry_core::domain::singleton::{SingletonKey, SingletonRecord, SingletonState};
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::repository::RepositoryError;

#[async_trait]
pub trait SingletonStore: Send + Sync {
    async fn find(&self, key: &SingletonKey) -> Result<Option<SingletonRecord>, RepositoryError>;

    /// Records a claim on `key` for `owner` unless any record exists; true when this call won
    async fn claim(&self, key: &SingletonKey, owner: &str) -> Result<bool, RepositoryError>;

    /// Replaces the claim held by `owner` with `state`; false if that claim is gone
    async fn settle(
        &self,
        key: &SingletonKey,
        owner: &str,
        state: SingletonState,
    ) -> Result<bool, RepositoryError>;

    /// Drops the claim held by `owner` so a later caller may try again
    async fn release(&self, key: &SingletonKey, owner: &str) -> Result<(), RepositoryError>;
}

pub struct PgSingletonStore {
    pool: PgPool,
}

impl PgSingletonStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn state_json(state: &SingletonState) -> Result<JsonValue, RepositoryError> {
    serde_json::to_value(state).map_err(|e| RepositoryError::Corrupt(e.to_string()))
}

#[async_trait]
impl SingletonStore for PgSingletonStore {
    async fn find(&self, key: &SingletonKey) -> Result<Option<SingletonRecord>, RepositoryError> {
        let row = sqlx::query_as::<_, SingletonRow>(
            r#"
            SELECT kind, scope, state, updated_at
            FROM singleton_resources
            WHERE kind = $1 AND scope = $2
            "#,
        )
        .bind(&key.kind)
        .bind(&key.scope)
        .fetch_optional(&self.pool)
        .await?;

        row.map(SingletonRecord::try_from).transpose()
    }

    async fn claim(&self, key: &SingletonKey, owner: &str) -> Result<bool, RepositoryError> {
        let state = state_json(&SingletonState::Claimed {
            owner: owner.to_string(),
        })?;
        let result = sqlx::query(
            r#"
            INSERT INTO singleton_resources (kind, scope, state, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (kind, scope) DO NOTHING
            "#,
        )
        .bind(&key.kind)
        .bind(&key.scope)
        .bind(state)
        .bind(chrono::Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn settle(
        &self,
        key: &SingletonKey,
        owner: &str,
        state: SingletonState,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE singleton_resources
            SET state = $3, updated_at = $4
            WHERE kind = $1 AND scope = $2
              AND state->>'state' = 'claimed' AND state->>'owner' = $5
            "#,
        )
        .bind(&key.kind)
        .bind(&key.scope)
        .bind(state_json(&state)?)
        .bind(chrono::Utc::now())
        .bind(owner)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, key: &SingletonKey, owner: &str) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            DELETE FROM singleton_resources
            WHERE kind = $1 AND scope = $2
              AND state->>'state' = 'claimed' AND state->>'owner' = $3
            "#,
        )
        .bind(&key.kind)
        .bind(&key.scope)
        .bind(owner)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct SingletonRow {
    kind: String,
    scope: String,
    state: JsonValue,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl TryFrom<SingletonRow> for SingletonRecord {
    type Error = RepositoryError;

    fn try_from(row: SingletonRow) -> Result<Self, Self::Error> {
        let key = SingletonKey::new(row.kind, row.scope);
        let state = serde_json::from_value(row.state)
            .map_err(|e| RepositoryError::Corrupt(format!("singleton {}: {}", key, e)))?;
        Ok(SingletonRecord {
            key,
            state,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Default)]
pub struct InMemorySingletonStore {
    records: Mutex<HashMap<SingletonKey, SingletonRecord>>,
}

impl InMemorySingletonStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SingletonStore for InMemorySingletonStore {
    async fn find(&self, key: &SingletonKey) -> Result<Option<SingletonRecord>, RepositoryError> {
        Ok(self.records.lock().await.get(key).cloned())
    }

    async fn claim(&self, key: &SingletonKey, owner: &str) -> Result<bool, RepositoryError> {
        let mut records = self.records.lock().await;
        if records.contains_key(key) {
            return Ok(false);
        }
        records.insert(
            key.clone(),
            SingletonRecord::new(
                key.clone(),
                SingletonState::Claimed {
                    owner: owner.to_string(),
                },
            ),
        );
        Ok(true)
    }

    async fn settle(
        &self,
        key: &SingletonKey,
        owner: &str,
        state: SingletonState,
    ) -> Result<bool, RepositoryError> {
        let mut records = self.records.lock().await;
        match records.get_mut(key) {
            Some(record) if record.is_claimed_by(owner) => {
                *record = SingletonRecord::new(key.clone(), state);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, key: &SingletonKey, owner: &str) -> Result<(), RepositoryError> {
        let mut records = self.records.lock().await;
        if records.get(key).is_some_and(|record| record.is_claimed_by(owner)) {
            records.remove(key);
        }
        Ok(())
    }
}
