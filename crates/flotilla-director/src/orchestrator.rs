//! The end-to-end update pipeline.
//!
//! One `run` call takes a deployment from uploaded manifest to converged
//! fleet: lock, assemble, diff, compile, reconcile pools, roll the update,
//! destroy retired VMs. The deployment lock is held for the whole run and
//! released on every exit path, as is removal of the uploaded manifest
//! file.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use flotilla_compile::Compiler;
use flotilla_core::{CancelToken, CloudDriver, DeploymentLocks};
use flotilla_plan::{
    Assembler, CloudConfig, CloudConfigStore, FleetStateStore, PlanError, RunOptions,
};
use flotilla_pool::ResourcePoolManager;
use flotilla_update::{InstanceUpdater, JobUpdater, MultiJobUpdater};

use crate::error::{DirectorError, DirectorResult};
use crate::notifier::Notifier;

/// One requested deployment update.
#[derive(Debug, Clone)]
pub struct UpdateRequest {
    /// Deployment name the caller claims to be updating. Checked against
    /// the manifest's own name after parsing.
    pub deployment: String,
    /// Uploaded manifest file; removed when the run finishes, whatever
    /// the outcome.
    pub manifest_path: PathBuf,
    /// Versioned cloud config to merge, if any.
    pub cloud_config_id: Option<String>,
    pub options: RunOptions,
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// How long to wait for the deployment lock before giving up.
    pub lock_wait: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            lock_wait: Duration::from_secs(10),
        }
    }
}

/// Wires the pipeline stages together and owns their shared services.
///
/// Pool inventory is deliberately not shared state: each run rebuilds it
/// from that deployment's fleet snapshot inside its own lock scope, so
/// runs on different deployments never see each other's inventories and
/// the end-of-run drain only destroys the run's own retired VMs.
pub struct UpdateOrchestrator {
    locks: DeploymentLocks,
    fleet: Arc<dyn FleetStateStore>,
    cloud_configs: Arc<dyn CloudConfigStore>,
    compiler: Compiler,
    driver: Arc<dyn CloudDriver>,
    notifier: Notifier,
    config: OrchestratorConfig,
}

impl UpdateOrchestrator {
    pub fn new(
        locks: DeploymentLocks,
        fleet: Arc<dyn FleetStateStore>,
        cloud_configs: Arc<dyn CloudConfigStore>,
        compiler: Compiler,
        driver: Arc<dyn CloudDriver>,
        notifier: Notifier,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            locks,
            fleet,
            cloud_configs,
            compiler,
            driver,
            notifier,
            config,
        }
    }

    /// Run one deployment update to completion.
    ///
    /// Returns the resource path of the deployment on success. The
    /// manifest file named by the request is removed before this returns,
    /// on success and on every failure path alike.
    pub async fn run(
        &self,
        request: &UpdateRequest,
        cancel: &CancelToken,
    ) -> DirectorResult<String> {
        let _lock = match self
            .locks
            .acquire(&request.deployment, self.config.lock_wait)
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                self.discard_manifest(&request.manifest_path).await;
                return Err(e.into());
            }
        };

        info!(deployment = %request.deployment, "deployment update started");
        self.notifier.deployment_started(&request.deployment).await;

        let result = self.execute(request, cancel).await;
        self.discard_manifest(&request.manifest_path).await;

        match &result {
            Ok(path) => {
                info!(deployment = %request.deployment, path = %path, "deployment update finished");
                self.notifier.deployment_finished(&request.deployment).await;
            }
            Err(e) => {
                warn!(deployment = %request.deployment, error = %e, "deployment update failed");
                self.notifier
                    .deployment_failed(&request.deployment, &e.to_string())
                    .await;
            }
        }
        result
    }

    async fn execute(
        &self,
        request: &UpdateRequest,
        cancel: &CancelToken,
    ) -> DirectorResult<String> {
        let manifest_text = tokio::fs::read_to_string(&request.manifest_path)
            .await
            .map_err(|source| DirectorError::ManifestRead {
                path: request.manifest_path.clone(),
                source,
            })?;

        let cloud_config = match &request.cloud_config_id {
            Some(id) => self
                .cloud_configs
                .fetch(id)
                .await
                .map_err(|source| DirectorError::CloudConfigFetch {
                    id: id.clone(),
                    source,
                })?
                .ok_or_else(|| DirectorError::CloudConfigMissing(id.clone()))?,
            None => CloudConfig::default(),
        };

        let plan = Assembler::assemble(&manifest_text, &cloud_config, &request.options)?;
        if plan.name != request.deployment {
            return Err(PlanError::ManifestSchema(format!(
                "manifest is for deployment '{}', not '{}'",
                plan.name, request.deployment
            ))
            .into());
        }

        let fleet = self
            .fleet
            .fetch(&plan.name)
            .await
            .map_err(|source| DirectorError::FleetState {
                deployment: plan.name.clone(),
                source,
            })?;

        let diff = Assembler::diff(&plan, &fleet, &request.options)?;
        if diff.is_noop() {
            info!(deployment = %plan.name, "fleet already matches the plan");
        }

        self.compiler.compile(&plan.packages, cancel).await?;

        // Per-run pool state, scoped to this deployment's lock.
        let pools = Arc::new(ResourcePoolManager::new(self.driver.clone()));
        pools.reconcile(&plan.pools, &fleet).await?;
        let updater = MultiJobUpdater::new(Arc::new(JobUpdater::new(Arc::new(
            InstanceUpdater::new(self.driver.clone(), pools.clone()),
        ))));
        updater.update(&plan, &diff, cancel).await?;
        let destroyed = pools.drain_retired().await?;
        if destroyed > 0 {
            info!(deployment = %plan.name, destroyed, "retired VMs destroyed");
        }

        Ok(format!("/deployments/{}", plan.name))
    }

    /// Remove the uploaded manifest. Best effort; a missing file is fine.
    async fn discard_manifest(&self, path: &Path) {
        if let Err(e) = tokio::fs::remove_file(path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "manifest cleanup failed");
            }
        }
    }
}
