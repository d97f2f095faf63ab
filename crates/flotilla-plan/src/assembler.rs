//! Assembler: manifest + cloud config + run options -> plan -> diff.
//!
//! Assembly validates every cross-reference in the manifest up front so
//! later stages can index into the plan without re-checking. Diffing is a
//! pure function of (plan, fleet state, options); it performs no I/O and
//! is deterministic.

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::debug;

use flotilla_core::{VmHandle, VmTemplate};

use crate::error::{PlanError, PlanResult, RefKind};
use crate::fleet::{FleetState, VmRecord};
use crate::manifest::{CloudConfig, Manifest};
use crate::plan::{
    DeploymentPlan, JobLifecycle, JobSpec, NetworkSpec, PackageSpec, ResourcePoolSpec, UpdatePolicy,
};

/// Caller-supplied options for one run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Recreate every instance regardless of spec match.
    pub recreate: bool,
    /// Per-job desired lifecycle overrides.
    pub job_states: HashMap<String, JobLifecycle>,
    /// Old job name -> new job name, applied before diffing.
    pub job_rename: HashMap<String, String>,
}

/// What the update phase must do with one (job, index) slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceAction {
    /// No current VM; provision and configure one.
    Create,
    /// Current VM matches the target spec; leave it alone.
    Keep,
    /// Current VM exists but the spec differs (or recreate was forced).
    Update,
    /// Slot no longer exists; drain and destroy the VM.
    Delete,
}

/// Planned work for one instance slot.
#[derive(Debug, Clone, PartialEq)]
pub struct InstancePlan {
    pub job: String,
    pub index: u32,
    pub action: InstanceAction,
    pub pool: String,
    pub current_vm: Option<VmHandle>,
    /// The current VM's template no longer matches the pool; it must be
    /// retired and a fresh VM allocated instead of being reconfigured.
    pub replace_vm: bool,
    /// Target spec hash; absent for deletes.
    pub target_hash: Option<String>,
    /// Full target spec to push; absent for deletes.
    pub target_spec: Option<serde_json::Value>,
}

/// Per-job slice of the diff, in plan order. Jobs that exist only in the
/// fleet (removed from the manifest) appear after the plan's jobs.
#[derive(Debug, Clone, PartialEq)]
pub struct JobDiff {
    pub name: String,
    pub policy: UpdatePolicy,
    pub instances: Vec<InstancePlan>,
}

impl JobDiff {
    /// Count of instances with the given action.
    pub fn count(&self, action: InstanceAction) -> usize {
        self.instances.iter().filter(|i| i.action == action).count()
    }
}

/// The complete diff for one run: the sole input to the update phase.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DeploymentDiff {
    pub jobs: Vec<JobDiff>,
}

impl DeploymentDiff {
    pub fn job(&self, name: &str) -> Option<&JobDiff> {
        self.jobs.iter().find(|j| j.name == name)
    }

    /// True when no instance needs any VM operation.
    pub fn is_noop(&self) -> bool {
        self.jobs
            .iter()
            .all(|j| j.instances.iter().all(|i| i.action == InstanceAction::Keep))
    }
}

/// Stateless plan assembly and diffing.
pub struct Assembler;

impl Assembler {
    /// Parse and validate a manifest, merge the cloud config and run
    /// options, and produce an immutable plan.
    pub fn assemble(
        manifest_text: &str,
        cloud_config: &CloudConfig,
        options: &RunOptions,
    ) -> PlanResult<DeploymentPlan> {
        let manifest = Manifest::parse(manifest_text)?;

        reject_duplicates("resource pool", manifest.resource_pools.iter().map(|p| &p.name))?;
        reject_duplicates("network", manifest.networks.iter().map(|n| &n.name))?;
        reject_duplicates("job", manifest.jobs.iter().map(|j| &j.name))?;
        reject_duplicates("package", manifest.packages.iter().map(|p| &p.name))?;

        // Cloud-config networks first; a manifest network with the same
        // name replaces it.
        let mut networks: Vec<NetworkSpec> = Vec::new();
        for net in cloud_config.networks.iter().chain(manifest.networks.iter()) {
            let spec = NetworkSpec {
                name: net.name.clone(),
                properties: net.properties.clone(),
            };
            match networks.iter_mut().find(|n| n.name == spec.name) {
                Some(existing) => *existing = spec,
                None => networks.push(spec),
            }
        }
        let network_names: HashSet<&str> = networks.iter().map(|n| n.name.as_str()).collect();

        let mut pools = Vec::new();
        for pool in &manifest.resource_pools {
            if !network_names.contains(pool.network.as_str()) {
                return Err(unresolved(
                    RefKind::Network,
                    &pool.network,
                    format!("resource pool '{}'", pool.name),
                ));
            }
            // Cloud-config defaults seed the properties; manifest keys win.
            let mut cloud_properties: BTreeMap<String, serde_json::Value> =
                cloud_config.resource_pool_defaults.clone();
            cloud_properties.extend(pool.cloud_properties.clone());
            pools.push(ResourcePoolSpec {
                name: pool.name.clone(),
                size: pool.size,
                template: VmTemplate {
                    stemcell: pool.stemcell.clone(),
                    network: pool.network.clone(),
                    cloud_properties,
                },
            });
        }

        let package_names: HashSet<&str> =
            manifest.packages.iter().map(|p| p.name.as_str()).collect();
        let mut packages = Vec::new();
        for pkg in &manifest.packages {
            for dep in &pkg.dependencies {
                if !package_names.contains(dep.as_str()) {
                    return Err(unresolved(
                        RefKind::Package,
                        dep,
                        format!("package '{}'", pkg.name),
                    ));
                }
            }
            packages.push(PackageSpec {
                name: pkg.name.clone(),
                version: pkg.version.clone(),
                source_blob: pkg.blob.clone(),
                dependencies: pkg.dependencies.clone(),
            });
        }

        let global = UpdatePolicy::from_settings(&manifest.update);
        let pool_names: HashSet<&str> = pools.iter().map(|p| p.name.as_str()).collect();

        let mut jobs = Vec::new();
        for job in &manifest.jobs {
            if !pool_names.contains(job.resource_pool.as_str()) {
                return Err(unresolved(
                    RefKind::ResourcePool,
                    &job.resource_pool,
                    format!("job '{}'", job.name),
                ));
            }
            for net in &job.networks {
                if !network_names.contains(net.as_str()) {
                    return Err(unresolved(RefKind::Network, net, format!("job '{}'", job.name)));
                }
            }
            for template in &job.templates {
                if !package_names.contains(template.as_str()) {
                    return Err(unresolved(
                        RefKind::Package,
                        template,
                        format!("job '{}'", job.name),
                    ));
                }
            }
            let lifecycle = options
                .job_states
                .get(&job.name)
                .copied()
                .unwrap_or_default();
            jobs.push(JobSpec {
                name: job.name.clone(),
                templates: job.templates.clone(),
                instances: job.instances,
                resource_pool: job.resource_pool.clone(),
                networks: job.networks.clone(),
                lifecycle,
                update: global.merged(&job.update),
            });
        }

        for job_state in options.job_states.keys() {
            if !jobs.iter().any(|j| &j.name == job_state) {
                return Err(unresolved(RefKind::Job, job_state, "job_states option"));
            }
        }

        debug!(
            deployment = %manifest.name,
            jobs = jobs.len(),
            pools = pools.len(),
            packages = packages.len(),
            "plan assembled"
        );

        Ok(DeploymentPlan {
            name: manifest.name,
            pools,
            networks,
            jobs,
            packages,
            update: global,
        })
    }

    /// Compute per-instance actions for `plan` against a fleet snapshot.
    ///
    /// The rename map is applied to fleet records first so instances are
    /// matched by their new (job, index) identity.
    pub fn diff(
        plan: &DeploymentPlan,
        fleet: &FleetState,
        options: &RunOptions,
    ) -> PlanResult<DeploymentDiff> {
        validate_renames(plan, &options.job_rename)?;

        // Index fleet records by renamed (job, index).
        let mut current: HashMap<(String, u32), &VmRecord> = HashMap::new();
        for rec in &fleet.vms {
            let job = options
                .job_rename
                .get(&rec.job)
                .cloned()
                .unwrap_or_else(|| rec.job.clone());
            if current.insert((job.clone(), rec.index), rec).is_some() {
                return Err(PlanError::ManifestSchema(format!(
                    "fleet state contains duplicate instance {job}/{}",
                    rec.index
                )));
            }
        }

        let mut jobs = Vec::new();
        for job in &plan.jobs {
            let hash = plan.spec_hash(job);
            let spec = plan.target_spec(job);
            // Resource pool reference was validated during assembly.
            let pool_fingerprint = plan
                .pool(&job.resource_pool)
                .map(|p| p.template.fingerprint())
                .unwrap_or_default();

            let mut instances = Vec::new();
            for index in 0..job.instances {
                let plan_entry = match current.remove(&(job.name.clone(), index)) {
                    None => InstancePlan {
                        job: job.name.clone(),
                        index,
                        action: InstanceAction::Create,
                        pool: job.resource_pool.clone(),
                        current_vm: None,
                        replace_vm: false,
                        target_hash: Some(hash.clone()),
                        target_spec: Some(spec.clone()),
                    },
                    Some(rec) => {
                        let matches = rec.spec_hash == hash && !options.recreate;
                        InstancePlan {
                            job: job.name.clone(),
                            index,
                            action: if matches {
                                InstanceAction::Keep
                            } else {
                                InstanceAction::Update
                            },
                            pool: job.resource_pool.clone(),
                            current_vm: Some(rec.vm.clone()),
                            replace_vm: !matches
                                && rec.template_fingerprint != pool_fingerprint,
                            target_hash: Some(hash.clone()),
                            target_spec: Some(spec.clone()),
                        }
                    }
                };
                instances.push(plan_entry);
            }

            // Slots beyond the new job size.
            let mut surplus: Vec<u32> = current
                .keys()
                .filter(|(name, _)| name == &job.name)
                .map(|(_, index)| *index)
                .collect();
            surplus.sort_unstable();
            for index in surplus {
                if let Some(rec) = current.remove(&(job.name.clone(), index)) {
                    instances.push(delete_plan(&job.name, index, rec));
                }
            }

            jobs.push(JobDiff {
                name: job.name.clone(),
                policy: job.update.clone(),
                instances,
            });
        }

        // Jobs that exist only in the fleet: every instance is deleted.
        let mut removed: BTreeMap<String, Vec<(u32, &VmRecord)>> = BTreeMap::new();
        for ((job, index), rec) in current {
            removed.entry(job).or_default().push((index, rec));
        }
        for (job, mut records) in removed {
            records.sort_by_key(|(index, _)| *index);
            jobs.push(JobDiff {
                name: job.clone(),
                policy: plan.update.clone(),
                instances: records
                    .into_iter()
                    .map(|(index, rec)| delete_plan(&job, index, rec))
                    .collect(),
            });
        }

        Ok(DeploymentDiff { jobs })
    }
}

fn delete_plan(job: &str, index: u32, rec: &VmRecord) -> InstancePlan {
    InstancePlan {
        job: job.to_string(),
        index,
        action: InstanceAction::Delete,
        pool: rec.pool.clone(),
        current_vm: Some(rec.vm.clone()),
        replace_vm: false,
        target_hash: None,
        target_spec: None,
    }
}

fn unresolved(kind: RefKind, name: &str, referenced_by: impl Into<String>) -> PlanError {
    PlanError::UnresolvedReference {
        kind,
        name: name.to_string(),
        referenced_by: referenced_by.into(),
    }
}

fn reject_duplicates<'a>(
    kind: &str,
    names: impl Iterator<Item = &'a String>,
) -> PlanResult<()> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(PlanError::ManifestSchema(format!(
                "duplicate {kind} '{name}'"
            )));
        }
    }
    Ok(())
}

/// Reject ambiguous or unresolvable renames instead of guessing.
fn validate_renames(plan: &DeploymentPlan, renames: &HashMap<String, String>) -> PlanResult<()> {
    let mut targets = HashSet::new();
    for (old, new) in renames {
        if plan.job(new).is_none() {
            return Err(unresolved(RefKind::Rename, new, format!("rename of '{old}'")));
        }
        if plan.job(old).is_some() {
            // The old name still exists in the plan; matching would be
            // ambiguous.
            return Err(unresolved(RefKind::Rename, old, "job_rename option"));
        }
        if renames.contains_key(new) {
            // Rename chain (a -> b, b -> c).
            return Err(unresolved(RefKind::Rename, new, format!("rename of '{old}'")));
        }
        if !targets.insert(new) {
            // Two old names mapped onto the same new name.
            return Err(unresolved(RefKind::Rename, new, "job_rename option"));
        }
    }
    Ok(())
}
