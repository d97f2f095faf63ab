//! Fleet state: the "before" side of the diff.
//!
//! The snapshot is fetched once at assembly time; `DeploymentLock`
//! guarantees nothing mutates it externally while a run is in progress.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use flotilla_core::VmHandle;

use crate::manifest::CloudConfig;

/// One existing VM and its job/pool assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmRecord {
    pub vm: VmHandle,
    pub pool: String,
    pub job: String,
    pub index: u32,
    /// Spec hash the VM was last configured with.
    pub spec_hash: String,
    /// Fingerprint of the template the VM was provisioned from.
    pub template_fingerprint: String,
}

/// Persisted record of what currently exists for a deployment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FleetState {
    pub deployment: String,
    pub vms: Vec<VmRecord>,
}

/// Boundary to the persistence layer holding fleet state.
#[async_trait]
pub trait FleetStateStore: Send + Sync {
    /// Fetch the current snapshot for a deployment. A deployment that has
    /// never been deployed yields an empty state, not an error.
    async fn fetch(&self, deployment: &str) -> anyhow::Result<FleetState>;
}

/// Boundary to the store of versioned cloud configs.
#[async_trait]
pub trait CloudConfigStore: Send + Sync {
    async fn fetch(&self, id: &str) -> anyhow::Result<Option<CloudConfig>>;
}
