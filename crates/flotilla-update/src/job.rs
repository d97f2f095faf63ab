//! Per-job rolling update.
//!
//! Canaries go first, strictly sequentially; a canary failure aborts the
//! job before any batch instance leaves Pending. The batch then runs
//! with up to `max_in_flight` instances in flight, and deletes run last
//! once the surviving instances are confirmed healthy.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{info, warn};

use flotilla_core::CancelToken;
use flotilla_plan::{BatchFailurePolicy, InstanceAction, InstancePlan, JobDiff, UpdatePolicy};

use crate::error::{UpdateError, UpdateResult};
use crate::instance::{InstanceState, InstanceUpdater};

/// Final instance states for one job's update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobUpdateReport {
    pub job: String,
    pub states: BTreeMap<u32, InstanceState>,
    /// Batch failures absorbed by a tolerate policy.
    pub tolerated_failures: u32,
}

/// Rolls one job through its canary and batch phases.
pub struct JobUpdater {
    instances: Arc<InstanceUpdater>,
}

impl JobUpdater {
    pub fn new(instances: Arc<InstanceUpdater>) -> Self {
        Self { instances }
    }

    pub async fn update_job(
        &self,
        diff: &JobDiff,
        cancel: &CancelToken,
    ) -> UpdateResult<JobUpdateReport> {
        let policy = &diff.policy;
        let mut states: BTreeMap<u32, InstanceState> = diff
            .instances
            .iter()
            .map(|i| (i.index, InstanceState::Pending))
            .collect();

        // Keeps are terminal without any machine operation.
        for inst in &diff.instances {
            if inst.action == InstanceAction::Keep {
                states.insert(inst.index, InstanceState::Updated);
            }
        }

        let updates: Vec<&InstancePlan> = diff
            .instances
            .iter()
            .filter(|i| {
                matches!(i.action, InstanceAction::Create | InstanceAction::Update)
            })
            .collect();
        let deletes: Vec<&InstancePlan> = diff
            .instances
            .iter()
            .filter(|i| i.action == InstanceAction::Delete)
            .collect();

        // Canaries draw from the smallest indices of the actionable set.
        let canary_count = (policy.canaries as usize).min(updates.len());
        let (canaries, batch) = updates.split_at(canary_count);

        for inst in canaries {
            if cancel.is_cancelled() {
                return Err(UpdateError::Cancelled);
            }
            states.insert(inst.index, InstanceState::Updating);
            info!(job = %diff.name, index = inst.index, "updating canary instance");
            match self
                .instances
                .apply(inst, policy.canary_watch_ms, policy.post_start_retries)
                .await
            {
                Ok(()) => {
                    states.insert(inst.index, InstanceState::Updated);
                }
                Err(source) => {
                    states.insert(inst.index, InstanceState::Failed);
                    warn!(job = %diff.name, index = inst.index, "canary failed, aborting job");
                    return Err(UpdateError::CanaryFailure {
                        job: diff.name.clone(),
                        index: inst.index,
                        source,
                    });
                }
            }
        }

        let mut tolerated = 0;
        tolerated += self
            .run_batch(&diff.name, batch, policy, InstanceState::Updated, &mut states, cancel)
            .await?;
        tolerated += self
            .run_batch(&diff.name, &deletes, policy, InstanceState::Removed, &mut states, cancel)
            .await?;

        info!(job = %diff.name, tolerated, "job update finished");
        Ok(JobUpdateReport {
            job: diff.name.clone(),
            states,
            tolerated_failures: tolerated,
        })
    }

    /// Run a set of instances with bounded concurrency, honoring the
    /// batch failure policy. A successful instance lands in `done`
    /// (`Updated` for the batch, `Removed` for deletes). Returns the
    /// number of tolerated failures.
    async fn run_batch(
        &self,
        job: &str,
        work: &[&InstancePlan],
        policy: &UpdatePolicy,
        done: InstanceState,
        states: &mut BTreeMap<u32, InstanceState>,
        cancel: &CancelToken,
    ) -> UpdateResult<u32> {
        let allowed = match policy.on_batch_failure {
            BatchFailurePolicy::AbortJob => 0,
            BatchFailurePolicy::Tolerate { max_failures } => max_failures,
        };
        let max = policy.max_in_flight.max(1) as usize;
        let watch_ms = policy.update_watch_ms;
        let retries = policy.post_start_retries;

        let mut queue: VecDeque<InstancePlan> =
            work.iter().map(|i| (*i).clone()).collect();
        let mut in_flight: JoinSet<(u32, anyhow::Result<()>)> = JoinSet::new();
        let mut failures = 0u32;
        let mut fatal: Option<UpdateError> = None;

        loop {
            while fatal.is_none() && in_flight.len() < max {
                if cancel.is_cancelled() {
                    fatal = Some(UpdateError::Cancelled);
                    break;
                }
                let Some(inst) = queue.pop_front() else { break };
                states.insert(inst.index, InstanceState::Updating);
                let updater = self.instances.clone();
                in_flight.spawn(async move {
                    let result = updater.apply(&inst, watch_ms, retries).await;
                    (inst.index, result)
                });
            }

            match in_flight.join_next().await {
                None => break,
                Some(Ok((index, Ok(())))) => {
                    states.insert(index, done);
                }
                Some(Ok((index, Err(source)))) => {
                    states.insert(index, InstanceState::Failed);
                    failures += 1;
                    if failures > allowed {
                        if fatal.is_none() {
                            fatal = Some(UpdateError::UpdateFailure {
                                job: job.to_string(),
                                index,
                                source,
                            });
                        }
                    } else {
                        warn!(job, index, failures, allowed, "batch failure tolerated");
                    }
                }
                Some(Err(join_err)) => {
                    if fatal.is_none() {
                        fatal = Some(UpdateError::UpdateFailure {
                            job: job.to_string(),
                            index: 0,
                            source: anyhow::anyhow!(join_err),
                        });
                    }
                }
            }
        }

        match fatal {
            Some(e) => Err(e),
            None => Ok(failures),
        }
    }
}
