// Lease Registry
// Tracks the agent work items handed out by the external scheduler, and
// which batch each one is bound to

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{ServiceError, ServiceResult};
use crate::jobs::{AgentId, JobId, LeaseId, SessionId, SubResourceId};

/// What a lease asks an agent to do
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LeasePayload {
    /// Bring the agent's environment up to date
    Conform,

    /// Execute one batch of a job
    ExecuteBatch {
        job_id: JobId,
        batch_id: SubResourceId,
    },
}

impl LeasePayload {
    /// Whether the server may cancel the lease directly. Batch execution is
    /// only ever stopped cooperatively through step abort flags.
    pub fn supports_cancellation(&self) -> bool {
        matches!(self, LeasePayload::Conform)
    }
}

/// Lifecycle state of a lease
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LeaseState {
    /// Issued, not picked up by the agent yet
    Pending,
    /// The agent is working on it
    Active,
    /// Cancelled before completion
    Cancelled,
    /// Finished
    Completed,
}

/// One unit of agent work
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub id: LeaseId,
    pub agent_id: AgentId,
    pub session_id: SessionId,
    pub payload: LeasePayload,
    pub state: LeaseState,
}

impl Lease {
    pub fn new(id: LeaseId, agent_id: AgentId, session_id: SessionId, payload: LeasePayload) -> Self {
        Self {
            id,
            agent_id,
            session_id,
            payload,
            state: LeaseState::Pending,
        }
    }
}

/// Storage for leases issued by the external scheduler
#[async_trait]
pub trait LeaseRegistry: Send + Sync {
    /// Record a newly issued lease
    async fn register(&self, lease: Lease) -> ServiceResult<()>;

    /// Resolve a lease by id
    async fn get(&self, id: &LeaseId) -> ServiceResult<Lease>;

    /// Move a lease to a new lifecycle state
    async fn set_state(&self, id: &LeaseId, state: LeaseState) -> ServiceResult<()>;
}

/// In-memory lease registry
#[derive(Default)]
pub struct InMemoryLeaseRegistry {
    leases: Arc<RwLock<HashMap<LeaseId, Lease>>>,
}

impl InMemoryLeaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LeaseRegistry for InMemoryLeaseRegistry {
    async fn register(&self, lease: Lease) -> ServiceResult<()> {
        let mut leases = self.leases.write().await;
        if leases.contains_key(&lease.id) {
            return Err(ServiceError::internal(format!(
                "lease {} is already registered",
                lease.id
            )));
        }
        leases.insert(lease.id.clone(), lease);
        Ok(())
    }

    async fn get(&self, id: &LeaseId) -> ServiceResult<Lease> {
        let leases = self.leases.read().await;
        leases
            .get(id)
            .cloned()
            .ok_or_else(|| ServiceError::not_found(format!("lease {}", id)))
    }

    async fn set_state(&self, id: &LeaseId, state: LeaseState) -> ServiceResult<()> {
        let mut leases = self.leases.write().await;
        match leases.get_mut(id) {
            Some(lease) => {
                lease.state = state;
                Ok(())
            }
            None => Err(ServiceError::not_found(format!("lease {}", id))),
        }
    }
}
