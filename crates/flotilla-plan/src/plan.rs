//! The assembled deployment plan.
//!
//! A `DeploymentPlan` is built once per run and never mutated afterwards.
//! All update-phase decisions read from it or from the diff derived
//! from it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use flotilla_core::{VmTemplate, content_fingerprint};

use crate::manifest::UpdateSettings;

/// Desired lifecycle for a job's instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobLifecycle {
    #[default]
    Started,
    Stopped,
    Detached,
}

/// How jobs are ordered relative to each other during the update phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOrdering {
    Serial,
    Parallel { max_in_flight: u32 },
}

/// What to do when a non-canary instance fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchFailurePolicy {
    /// Stop scheduling new instances and fail the job. The default.
    AbortJob,
    /// Keep going until more than `max_failures` instances have failed.
    Tolerate { max_failures: u32 },
}

/// Resolved update policy for a job (or the plan-wide default).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdatePolicy {
    /// Leading instances updated before the batch.
    pub canaries: u32,
    /// Batch instances in flight at once.
    pub max_in_flight: u32,
    /// Pause between post-start probes of a canary instance.
    pub canary_watch_ms: u64,
    /// Pause between post-start probes of a batch instance.
    pub update_watch_ms: u64,
    /// Post-start probe attempts before an instance is marked failed.
    pub post_start_retries: u32,
    pub job_ordering: JobOrdering,
    pub on_batch_failure: BatchFailurePolicy,
}

impl Default for UpdatePolicy {
    fn default() -> Self {
        Self {
            canaries: 1,
            max_in_flight: 1,
            canary_watch_ms: 30_000,
            update_watch_ms: 15_000,
            post_start_retries: 2,
            job_ordering: JobOrdering::Serial,
            on_batch_failure: BatchFailurePolicy::AbortJob,
        }
    }
}

impl UpdatePolicy {
    /// Resolve the plan-wide policy from the manifest's global block.
    pub fn from_settings(settings: &UpdateSettings) -> Self {
        Self::default().merged(settings)
    }

    /// Apply a partial override on top of `self`, field by field.
    pub fn merged(&self, over: &UpdateSettings) -> Self {
        let job_ordering = match over.serial {
            Some(false) => JobOrdering::Parallel {
                max_in_flight: over.job_max_in_flight.unwrap_or(2),
            },
            Some(true) => JobOrdering::Serial,
            None => self.job_ordering,
        };
        let on_batch_failure = match over.max_tolerated_failures {
            Some(max_failures) => BatchFailurePolicy::Tolerate { max_failures },
            None => self.on_batch_failure,
        };
        Self {
            canaries: over.canaries.unwrap_or(self.canaries),
            max_in_flight: over.max_in_flight.unwrap_or(self.max_in_flight),
            canary_watch_ms: over.canary_watch_ms.unwrap_or(self.canary_watch_ms),
            update_watch_ms: over.update_watch_ms.unwrap_or(self.update_watch_ms),
            post_start_retries: over.post_start_retries.unwrap_or(self.post_start_retries),
            job_ordering,
            on_batch_failure,
        }
    }
}

/// Named group of VM slots sharing one infrastructure template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourcePoolSpec {
    pub name: String,
    pub size: u32,
    pub template: VmTemplate,
}

/// A network available to jobs, with its merged properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSpec {
    pub name: String,
    pub properties: BTreeMap<String, serde_json::Value>,
}

/// A release package and its dependency edges. The edges form a DAG;
/// cycle detection happens in the compiler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageSpec {
    pub name: String,
    pub version: String,
    pub source_blob: String,
    pub dependencies: Vec<String>,
}

/// A named role deployed as N identical instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    pub templates: Vec<String>,
    pub instances: u32,
    pub resource_pool: String,
    pub networks: Vec<String>,
    pub lifecycle: JobLifecycle,
    pub update: UpdatePolicy,
}

/// The full target topology for one deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentPlan {
    pub name: String,
    pub pools: Vec<ResourcePoolSpec>,
    pub networks: Vec<NetworkSpec>,
    /// Ordered: the update phase walks jobs in this order.
    pub jobs: Vec<JobSpec>,
    pub packages: Vec<PackageSpec>,
    pub update: UpdatePolicy,
}

impl DeploymentPlan {
    pub fn pool(&self, name: &str) -> Option<&ResourcePoolSpec> {
        self.pools.iter().find(|p| p.name == name)
    }

    pub fn job(&self, name: &str) -> Option<&JobSpec> {
        self.jobs.iter().find(|j| j.name == name)
    }

    /// The target configuration pushed to every instance of `job`.
    ///
    /// Deterministic: `serde_json` maps serialize in key order, so the
    /// same plan always yields byte-identical specs.
    pub fn target_spec(&self, job: &JobSpec) -> serde_json::Value {
        let pool = self.pool(&job.resource_pool);
        let packages: BTreeMap<&str, serde_json::Value> = self
            .packages
            .iter()
            .filter(|p| job.templates.contains(&p.name))
            .map(|p| {
                (
                    p.name.as_str(),
                    serde_json::json!({
                        "version": p.version,
                        "blob": p.source_blob,
                        "dependencies": p.dependencies,
                    }),
                )
            })
            .collect();
        let networks: BTreeMap<&str, &BTreeMap<String, serde_json::Value>> = self
            .networks
            .iter()
            .filter(|n| job.networks.contains(&n.name))
            .map(|n| (n.name.as_str(), &n.properties))
            .collect();

        // The job name is deliberately absent: a renamed but otherwise
        // unchanged job must hash identically so its instances diff as
        // Keep rather than Update.
        serde_json::json!({
            "deployment": self.name,
            "lifecycle": job.lifecycle,
            "templates": job.templates,
            "packages": packages,
            "resource_pool": {
                "name": job.resource_pool,
                "template": pool.map(|p| p.template.fingerprint()),
            },
            "networks": networks,
        })
    }

    /// Content hash of a job's target spec, the identity the diff
    /// compares against fleet state.
    pub fn spec_hash(&self, job: &JobSpec) -> String {
        let bytes = serde_json::to_vec(&self.target_spec(job)).unwrap_or_default();
        content_fingerprint(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> UpdateSettings {
        UpdateSettings {
            canaries: Some(2),
            serial: Some(false),
            job_max_in_flight: Some(3),
            max_tolerated_failures: Some(1),
            ..UpdateSettings::default()
        }
    }

    #[test]
    fn policy_defaults_are_conservative() {
        let p = UpdatePolicy::default();
        assert_eq!(p.canaries, 1);
        assert_eq!(p.max_in_flight, 1);
        assert_eq!(p.job_ordering, JobOrdering::Serial);
        assert_eq!(p.on_batch_failure, BatchFailurePolicy::AbortJob);
    }

    #[test]
    fn merge_overrides_only_named_fields() {
        let p = UpdatePolicy::from_settings(&settings());
        assert_eq!(p.canaries, 2);
        // Untouched fields keep defaults.
        assert_eq!(p.max_in_flight, 1);
        assert_eq!(p.job_ordering, JobOrdering::Parallel { max_in_flight: 3 });
        assert_eq!(
            p.on_batch_failure,
            BatchFailurePolicy::Tolerate { max_failures: 1 }
        );

        // A second-level override wins over the first.
        let job_level = p.merged(&UpdateSettings {
            canaries: Some(0),
            serial: Some(true),
            ..UpdateSettings::default()
        });
        assert_eq!(job_level.canaries, 0);
        assert_eq!(job_level.job_ordering, JobOrdering::Serial);
        // Inherited from the plan-level merge.
        assert_eq!(
            job_level.on_batch_failure,
            BatchFailurePolicy::Tolerate { max_failures: 1 }
        );
    }
}
