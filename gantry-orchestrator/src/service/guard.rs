//! Singleton Resource Guard
//!
//! Ensures a resource keyed by (kind, scope) is created at most once. A
//! per-key async mutex serializes callers inside this process; a claim row in
//! the store settles races with other processes before anything is
//! provisioned. A conflict is recorded and reported on every later acquire
//! without asking the provider again.

use async_trait::async_trait;
use gantry_core::PipelineError;
use gantry_core::domain::singleton::{SingletonKey, SingletonResource, SingletonState};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::repository::{RepositoryError, SingletonStore};

/// How long to wait for another orchestrator's claim to settle
const DEFAULT_CLAIM_WAIT: Duration = Duration::from_secs(30);
const CLAIM_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum ProvisionError {
    /// The external system already holds a registration this guard did not create
    #[error("already registered: {0}")]
    AlreadyExists(String),

    #[error("{0}")]
    Failed(String),
}

/// Creates the external resource behind a singleton key
#[async_trait]
pub trait SingletonProvisioner: Send + Sync {
    /// Returns the provider-side handle of the created resource
    async fn provision(&self, key: &SingletonKey) -> Result<String, ProvisionError>;
}

#[derive(Debug, Error)]
pub enum GuardError {
    #[error("singleton {key} already exists outside this orchestrator: {detail}")]
    Conflict { key: SingletonKey, detail: String },

    #[error("failed to provision singleton {key}: {detail}")]
    Provisioning { key: SingletonKey, detail: String },

    #[error("singleton {key} is still being provisioned by {owner}")]
    Contended { key: SingletonKey, owner: String },

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl From<GuardError> for PipelineError {
    fn from(err: GuardError) -> Self {
        match err {
            GuardError::Conflict { key, .. } => PipelineError::SingletonConflict {
                key: key.to_string(),
            },
            other => PipelineError::Internal(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquisition {
    Existing(SingletonResource),
    Created(SingletonResource),
}

impl Acquisition {
    pub fn resource(&self) -> &SingletonResource {
        match self {
            Acquisition::Existing(resource) | Acquisition::Created(resource) => resource,
        }
    }
}

pub struct SingletonGuard {
    store: Arc<dyn SingletonStore>,
    provisioner: Arc<dyn SingletonProvisioner>,
    /// Identifies this process's claims in a shared store
    owner: String,
    claim_wait: Duration,
    locks: Mutex<HashMap<SingletonKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl SingletonGuard {
    pub fn new(store: Arc<dyn SingletonStore>, provisioner: Arc<dyn SingletonProvisioner>) -> Self {
        Self {
            store,
            provisioner,
            owner: format!("orchestrator-{}", uuid::Uuid::new_v4()),
            claim_wait: DEFAULT_CLAIM_WAIT,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_claim_wait(mut self, claim_wait: Duration) -> Self {
        self.claim_wait = claim_wait;
        self
    }

    fn key_lock(&self, key: &SingletonKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(key.clone()).or_default().clone()
    }

    /// Returns the live resource for `key`, creating it if none exists
    pub async fn acquire(&self, key: &SingletonKey) -> Result<Acquisition, GuardError> {
        let lock = self.key_lock(key);
        let _held = lock.lock().await;

        let deadline = Instant::now() + self.claim_wait;
        loop {
            let Some(record) = self.store.find(key).await? else {
                if self.store.claim(key, &self.owner).await? {
                    return self.provision_claimed(key).await;
                }
                debug!("Lost the claim race for singleton {}", key);
                continue;
            };

            match record.state {
                SingletonState::Ready { handle } => {
                    return Ok(Acquisition::Existing(SingletonResource {
                        key: record.key,
                        handle,
                        created_at: record.updated_at,
                    }));
                }
                SingletonState::Conflict { detail } => {
                    return Err(GuardError::Conflict {
                        key: key.clone(),
                        detail,
                    });
                }
                SingletonState::Claimed { owner } => {
                    if Instant::now() >= deadline {
                        return Err(GuardError::Contended {
                            key: key.clone(),
                            owner,
                        });
                    }
                    debug!("Singleton {} is claimed by {}, waiting", key, owner);
                    tokio::time::sleep(CLAIM_POLL_INTERVAL).await;
                }
            }
        }
    }

    /// Provisions a key this guard holds the claim on and settles the record
    async fn provision_claimed(&self, key: &SingletonKey) -> Result<Acquisition, GuardError> {
        match self.provisioner.provision(key).await {
            Ok(handle) => {
                let state = SingletonState::Ready {
                    handle: handle.clone(),
                };
                if !self.store.settle(key, &self.owner, state).await? {
                    return Err(RepositoryError::Corrupt(format!(
                        "claim on {} was lost; provisioned handle {} is unrecorded",
                        key, handle
                    ))
                    .into());
                }
                info!("Created singleton {} ({})", key, handle);
                Ok(Acquisition::Created(SingletonResource {
                    key: key.clone(),
                    handle,
                    created_at: chrono::Utc::now(),
                }))
            }
            Err(ProvisionError::AlreadyExists(detail)) => {
                warn!(
                    "Singleton {} is held outside this orchestrator; reconcile it manually: {}",
                    key, detail
                );
                let state = SingletonState::Conflict {
                    detail: detail.clone(),
                };
                self.store.settle(key, &self.owner, state).await?;
                Err(GuardError::Conflict {
                    key: key.clone(),
                    detail,
                })
            }
            Err(ProvisionError::Failed(detail)) => {
                self.store.release(key, &self.owner).await?;
                Err(GuardError::Provisioning {
                    key: key.clone(),
                    detail,
                })
            }
        }
    }
}
