//! Pool inventory and reconciliation.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use flotilla_core::{CloudDriver, VmHandle};
use flotilla_plan::{FleetState, ResourcePoolSpec};

use crate::error::{PoolError, PoolResult};

/// A VM tracked by a pool, tagged with the template it was built from.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolVm {
    pub handle: VmHandle,
    pub template_fingerprint: String,
}

/// Per-pool inventory. Only ever touched under the pool's mutex.
struct Inventory {
    spec: ResourcePoolSpec,
    fingerprint: String,
    idle: Vec<PoolVm>,
    in_use: HashMap<String, PoolVm>,
    /// Marked for deletion once the update phase confirms they are
    /// unneeded.
    retired: Vec<PoolVm>,
}

impl Inventory {
    fn tracked(&self) -> u32 {
        (self.idle.len() + self.in_use.len()) as u32
    }
}

/// Outcome of reconciling one pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolReport {
    pub pool: String,
    pub desired: u32,
    /// Existing fleet VMs kept because their template still matches.
    pub reused: u32,
    /// Fresh VMs provisioned to cover the deficit.
    pub provisioned: u32,
    /// VMs marked for deletion (template drift or surplus).
    pub retired: u32,
}

/// Tracks and reconciles VM inventory for every pool in a plan.
pub struct ResourcePoolManager {
    driver: Arc<dyn CloudDriver>,
    pools: RwLock<HashMap<String, Arc<Mutex<Inventory>>>>,
}

impl ResourcePoolManager {
    pub fn new(driver: Arc<dyn CloudDriver>) -> Self {
        Self {
            driver,
            pools: RwLock::new(HashMap::new()),
        }
    }

    /// Rebuild inventories from the plan's pool specs and the fleet
    /// snapshot, provisioning any deficit up front.
    ///
    /// Fleet VMs whose template fingerprint no longer matches their pool
    /// are never reused: they are retired immediately and replaced.
    /// VMs in pools absent from the plan stay tracked (size 0) so the
    /// update phase can still retire them.
    pub async fn reconcile(
        &self,
        specs: &[ResourcePoolSpec],
        fleet: &FleetState,
    ) -> PoolResult<Vec<PoolReport>> {
        let mut inventories: HashMap<String, Inventory> = specs
            .iter()
            .map(|spec| {
                (
                    spec.name.clone(),
                    Inventory {
                        fingerprint: spec.template.fingerprint(),
                        spec: spec.clone(),
                        idle: Vec::new(),
                        in_use: HashMap::new(),
                        retired: Vec::new(),
                    },
                )
            })
            .collect();

        for rec in &fleet.vms {
            let inv = inventories.entry(rec.pool.clone()).or_insert_with(|| {
                // Pool removed from the plan; keep a zero-size inventory
                // so its VMs can be retired by delete actions.
                Inventory {
                    spec: ResourcePoolSpec {
                        name: rec.pool.clone(),
                        size: 0,
                        template: Default::default(),
                    },
                    fingerprint: String::new(),
                    idle: Vec::new(),
                    in_use: HashMap::new(),
                    retired: Vec::new(),
                }
            });
            let vm = PoolVm {
                handle: rec.vm.clone(),
                template_fingerprint: rec.template_fingerprint.clone(),
            };
            // Removed pools carry an empty sentinel fingerprint; their VMs
            // stay in use until delete actions retire them.
            if inv.fingerprint.is_empty() || rec.template_fingerprint == inv.fingerprint {
                inv.in_use.insert(rec.vm.id.clone(), vm);
            } else {
                debug!(pool = %rec.pool, vm = %rec.vm, "template drift, retiring VM");
                inv.retired.push(vm);
            }
        }

        let mut reports = Vec::new();
        for spec in specs {
            let inv = inventories
                .get_mut(&spec.name)
                .ok_or_else(|| PoolError::UnknownPool(spec.name.clone()))?;
            let reused = inv.in_use.len() as u32;
            let retired = inv.retired.len() as u32;
            let mut provisioned = 0;
            while inv.tracked() < spec.size {
                let handle = self
                    .driver
                    .provision(&spec.template)
                    .await
                    .map_err(|source| PoolError::Driver {
                        pool: spec.name.clone(),
                        source,
                    })?;
                inv.idle.push(PoolVm {
                    handle,
                    template_fingerprint: inv.fingerprint.clone(),
                });
                provisioned += 1;
            }
            info!(
                pool = %spec.name,
                desired = spec.size,
                reused,
                provisioned,
                retired,
                "pool reconciled"
            );
            reports.push(PoolReport {
                pool: spec.name.clone(),
                desired: spec.size,
                reused,
                provisioned,
                retired,
            });
        }

        let mut pools = self.pools.write().await;
        *pools = inventories
            .into_iter()
            .map(|(name, inv)| (name, Arc::new(Mutex::new(inv))))
            .collect();
        Ok(reports)
    }

    /// Hand an idle matching VM to the caller, provisioning on demand if
    /// the pool has spare capacity.
    pub async fn allocate(&self, pool: &str) -> PoolResult<PoolVm> {
        let inv = self.inventory(pool).await?;
        let mut inv = inv.lock().await;

        if !inv.idle.is_empty() {
            // Oldest idle VM first.
            let vm = inv.idle.remove(0);
            inv.in_use.insert(vm.handle.id.clone(), vm.clone());
            debug!(pool, vm = %vm.handle, "allocated idle VM");
            return Ok(vm);
        }
        if inv.tracked() < inv.spec.size {
            // Provision under the pool lock: allocation stays serialized
            // and the counters can never overshoot the size limit.
            let template = inv.spec.template.clone();
            let handle = self
                .driver
                .provision(&template)
                .await
                .map_err(|source| PoolError::Driver {
                    pool: pool.to_string(),
                    source,
                })?;
            let vm = PoolVm {
                handle,
                template_fingerprint: inv.fingerprint.clone(),
            };
            inv.in_use.insert(vm.handle.id.clone(), vm.clone());
            debug!(pool, vm = %vm.handle, "provisioned VM on demand");
            return Ok(vm);
        }
        Err(PoolError::PoolExhausted {
            pool: pool.to_string(),
            size: inv.spec.size,
        })
    }

    /// Return an in-use VM to the idle set.
    pub async fn release(&self, pool: &str, vm: &VmHandle) -> PoolResult<()> {
        let inv = self.inventory(pool).await?;
        let mut inv = inv.lock().await;
        match inv.in_use.remove(&vm.id) {
            Some(pool_vm) => inv.idle.push(pool_vm),
            None => warn!(pool, vm = %vm, "release of untracked VM ignored"),
        }
        Ok(())
    }

    /// Mark a VM for deletion. Idempotent: retiring an untracked VM still
    /// queues it for destruction.
    pub async fn retire(&self, pool: &str, vm: &VmHandle) -> PoolResult<()> {
        let inv = self.inventory(pool).await?;
        let mut inv = inv.lock().await;
        if inv.retired.iter().any(|v| v.handle.id == vm.id) {
            return Ok(());
        }
        let pool_vm = inv
            .in_use
            .remove(&vm.id)
            .or_else(|| {
                inv.idle
                    .iter()
                    .position(|v| v.handle.id == vm.id)
                    .map(|i| inv.idle.remove(i))
            })
            .unwrap_or_else(|| PoolVm {
                handle: vm.clone(),
                template_fingerprint: String::new(),
            });
        debug!(pool, vm = %vm, "VM retired");
        inv.retired.push(pool_vm);
        Ok(())
    }

    /// Destroy every retired VM. Called after the update phase confirms
    /// they are unneeded.
    pub async fn drain_retired(&self) -> PoolResult<u32> {
        let pools: Vec<(String, Arc<Mutex<Inventory>>)> = {
            let pools = self.pools.read().await;
            pools
                .iter()
                .map(|(name, inv)| (name.clone(), inv.clone()))
                .collect()
        };

        let mut destroyed = 0;
        for (name, inv) in pools {
            let mut inv = inv.lock().await;
            while let Some(vm) = inv.retired.pop() {
                self.driver
                    .destroy(&vm.handle)
                    .await
                    .map_err(|source| PoolError::Driver {
                        pool: name.clone(),
                        source,
                    })?;
                destroyed += 1;
            }
        }
        if destroyed > 0 {
            info!(destroyed, "retired VMs destroyed");
        }
        Ok(destroyed)
    }

    /// (idle, in_use, retired) counts for a pool.
    pub async fn counts(&self, pool: &str) -> Option<(usize, usize, usize)> {
        let inv = self.inventory(pool).await.ok()?;
        let inv = inv.lock().await;
        Some((inv.idle.len(), inv.in_use.len(), inv.retired.len()))
    }

    async fn inventory(&self, pool: &str) -> PoolResult<Arc<Mutex<Inventory>>> {
        let pools = self.pools.read().await;
        pools
            .get(pool)
            .cloned()
            .ok_or_else(|| PoolError::UnknownPool(pool.to_string()))
    }
}
