//! Saga persistence.
//!
//! `update` enforces optimistic concurrency: the caller passes the saga
//! as loaded, the store compares versions, and a mismatch fails with
//! `SagaConcurrency` leaving no visible mutation. On success the stored
//! version is incremented and `updated_at` stamped.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use qv_common::QuiverError;

use crate::Saga;

#[async_trait]
pub trait SagaRepository<S>: Send + Sync {
    async fn find(&self, correlation_id: &str) -> qv_common::Result<Option<Saga<S>>>;

    async fn find_by_state(&self, state: &str) -> qv_common::Result<Vec<Saga<S>>>;

    /// Insert a new saga. Fails when the correlation id already exists.
    async fn save(&self, saga: Saga<S>) -> qv_common::Result<Saga<S>>;

    /// Version-checked update; returns the stored saga with its new
    /// version.
    async fn update(&self, saga: Saga<S>) -> qv_common::Result<Saga<S>>;

    async fn delete(&self, correlation_id: &str) -> qv_common::Result<bool>;

    /// Non-completed sagas whose `updated_at` is older than `now -
    /// older_than`; feeds timeout sweeps.
    async fn find_stale(&self, older_than: Duration) -> qv_common::Result<Vec<Saga<S>>>;
}

pub struct InMemorySagaRepository<S> {
    sagas: DashMap<String, Saga<S>>,
}

impl<S> InMemorySagaRepository<S> {
    pub fn new() -> Self {
        Self {
            sagas: DashMap::new(),
        }
    }
}

impl<S> Default for InMemorySagaRepository<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<S: Clone + Send + Sync + 'static> SagaRepository<S> for InMemorySagaRepository<S> {
    async fn find(&self, correlation_id: &str) -> qv_common::Result<Option<Saga<S>>> {
        Ok(self.sagas.get(correlation_id).map(|saga| saga.clone()))
    }

    async fn find_by_state(&self, state: &str) -> qv_common::Result<Vec<Saga<S>>> {
        Ok(self
            .sagas
            .iter()
            .filter(|saga| saga.current_state == state)
            .map(|saga| saga.clone())
            .collect())
    }

    async fn save(&self, saga: Saga<S>) -> qv_common::Result<Saga<S>> {
        match self.sagas.entry(saga.correlation_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(QuiverError::storage(format!(
                "saga {} already exists",
                saga.correlation_id
            ))),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let mut saga = saga;
                saga.version = 1;
                saga.updated_at = Utc::now();
                vacant.insert(saga.clone());
                Ok(saga)
            }
        }
    }

    async fn update(&self, saga: Saga<S>) -> qv_common::Result<Saga<S>> {
        let mut stored = self
            .sagas
            .get_mut(&saga.correlation_id)
            .ok_or_else(|| QuiverError::storage(format!("unknown saga {}", saga.correlation_id)))?;

        if stored.version != saga.version {
            return Err(QuiverError::SagaConcurrency {
                correlation_id: saga.correlation_id.clone(),
                expected: saga.version,
                actual: stored.version,
            });
        }

        let mut updated = saga;
        updated.version += 1;
        updated.updated_at = Utc::now();
        *stored = updated.clone();
        Ok(updated)
    }

    async fn delete(&self, correlation_id: &str) -> qv_common::Result<bool> {
        Ok(self.sagas.remove(correlation_id).is_some())
    }

    async fn find_stale(&self, older_than: Duration) -> qv_common::Result<Vec<Saga<S>>> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than)
                .map_err(|e| QuiverError::storage(e.to_string()))?;
        Ok(self
            .sagas
            .iter()
            .filter(|saga| !saga.is_completed && saga.updated_at < cutoff)
            .map(|saga| saga.clone())
            .collect())
    }
}
