//! Per-instance update execution.
//!
//! One instance moves Pending -> Updating -> Updated | Failed. Any
//! driver or pool failure along the way is the instance's failure; the
//! job-level policy decides what that means for the rollout.

use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;
use tracing::{debug, info};

use flotilla_core::{CloudDriver, VmHandle};
use flotilla_plan::{InstanceAction, InstancePlan};
use flotilla_pool::ResourcePoolManager;

/// Lifecycle state of one instance during the update phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Pending,
    Updating,
    Updated,
    /// Slot deleted: the VM was drained and retired.
    Removed,
    Failed,
}

/// Executes the VM operations for a single instance plan.
pub struct InstanceUpdater {
    driver: Arc<dyn CloudDriver>,
    pools: Arc<ResourcePoolManager>,
}

impl InstanceUpdater {
    pub fn new(driver: Arc<dyn CloudDriver>, pools: Arc<ResourcePoolManager>) -> Self {
        Self { driver, pools }
    }

    /// Apply one instance plan.
    ///
    /// `watch_ms` is the pause between post-start probes and `retries`
    /// the number of re-probes after the first failed one.
    pub async fn apply(
        &self,
        inst: &InstancePlan,
        watch_ms: u64,
        retries: u32,
    ) -> anyhow::Result<()> {
        match inst.action {
            InstanceAction::Keep => {
                // Matching instances never touch the machine.
                debug!(job = %inst.job, index = inst.index, "instance unchanged");
                Ok(())
            }
            InstanceAction::Delete => self.delete(inst).await,
            InstanceAction::Create => {
                let vm = self.pools.allocate(&inst.pool).await?;
                self.configure(inst, &vm.handle, watch_ms, retries).await
            }
            InstanceAction::Update => {
                let current = inst
                    .current_vm
                    .as_ref()
                    .context("update action without a current VM")?;
                if inst.replace_vm {
                    // Template drift: the old VM is never reconfigured.
                    self.drain(current).await?;
                    self.pools.retire(&inst.pool, current).await?;
                    let vm = self.pools.allocate(&inst.pool).await?;
                    self.configure(inst, &vm.handle, watch_ms, retries).await
                } else {
                    self.drain(current).await?;
                    self.configure(inst, current, watch_ms, retries).await
                }
            }
        }
    }

    async fn delete(&self, inst: &InstancePlan) -> anyhow::Result<()> {
        if let Some(vm) = &inst.current_vm {
            self.drain(vm).await?;
            self.pools.retire(&inst.pool, vm).await?;
            info!(job = %inst.job, index = inst.index, vm = %vm, "instance removed");
        }
        Ok(())
    }

    async fn drain(&self, vm: &VmHandle) -> anyhow::Result<()> {
        self.driver
            .run_script(vm, "drain")
            .await
            .context("drain hook failed")
    }

    /// Push the target spec and probe until healthy or out of retries.
    async fn configure(
        &self,
        inst: &InstancePlan,
        vm: &VmHandle,
        watch_ms: u64,
        retries: u32,
    ) -> anyhow::Result<()> {
        let spec = inst
            .target_spec
            .as_ref()
            .context("instance plan has no target spec")?;
        self.driver
            .apply_spec(vm, spec)
            .await
            .context("applying target spec failed")?;

        let mut attempt = 0;
        loop {
            match self.driver.run_script(vm, "post-start").await {
                Ok(()) => {
                    info!(job = %inst.job, index = inst.index, vm = %vm, "instance updated");
                    return Ok(());
                }
                Err(e) if attempt < retries => {
                    attempt += 1;
                    debug!(
                        job = %inst.job,
                        index = inst.index,
                        attempt,
                        error = %e,
                        "post-start probe failed, retrying"
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(watch_ms)).await;
                }
                Err(e) => {
                    return Err(e.context(format!(
                        "post-start health check failed after {} attempts",
                        attempt + 1
                    )));
                }
            }
        }
    }
}
