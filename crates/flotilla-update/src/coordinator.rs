//! Multi-job coordination.
//!
//! Runs job updates either fully serially or with bounded cross-job
//! concurrency, per the plan's update policy. The first unrecoverable
//! job failure aborts all remaining jobs; jobs that already finished
//! stay committed.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{info, warn};

use flotilla_core::CancelToken;
use flotilla_plan::{DeploymentDiff, DeploymentPlan, JobDiff, JobOrdering};

use crate::error::{UpdateError, UpdateResult};
use crate::job::{JobUpdateReport, JobUpdater};

/// Final per-job reports for a completed update phase.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UpdateReport {
    pub jobs: Vec<JobUpdateReport>,
}

/// Applies a full deployment diff job by job.
pub struct MultiJobUpdater {
    jobs: Arc<JobUpdater>,
}

impl MultiJobUpdater {
    pub fn new(jobs: Arc<JobUpdater>) -> Self {
        Self { jobs }
    }

    pub async fn update(
        &self,
        plan: &DeploymentPlan,
        diff: &DeploymentDiff,
        cancel: &CancelToken,
    ) -> UpdateResult<UpdateReport> {
        match plan.update.job_ordering {
            JobOrdering::Serial => self.update_serial(diff, cancel).await,
            JobOrdering::Parallel { max_in_flight } => {
                self.update_parallel(diff, max_in_flight.max(1) as usize, cancel)
                    .await
            }
        }
    }

    async fn update_serial(
        &self,
        diff: &DeploymentDiff,
        cancel: &CancelToken,
    ) -> UpdateResult<UpdateReport> {
        let mut report = UpdateReport::default();
        for job in &diff.jobs {
            if cancel.is_cancelled() {
                return Err(UpdateError::Cancelled);
            }
            info!(job = %job.name, "starting job update");
            report.jobs.push(self.jobs.update_job(job, cancel).await?);
        }
        Ok(report)
    }

    async fn update_parallel(
        &self,
        diff: &DeploymentDiff,
        max: usize,
        cancel: &CancelToken,
    ) -> UpdateResult<UpdateReport> {
        let mut queue: VecDeque<JobDiff> = diff.jobs.iter().cloned().collect();
        let mut in_flight: JoinSet<UpdateResult<JobUpdateReport>> = JoinSet::new();
        let mut report = UpdateReport::default();
        let mut fatal: Option<UpdateError> = None;

        loop {
            while fatal.is_none() && in_flight.len() < max {
                if cancel.is_cancelled() {
                    fatal = Some(UpdateError::Cancelled);
                    break;
                }
                let Some(job) = queue.pop_front() else { break };
                info!(job = %job.name, "starting job update");
                let jobs = self.jobs.clone();
                let cancel = cancel.clone();
                in_flight.spawn(async move { jobs.update_job(&job, &cancel).await });
            }

            match in_flight.join_next().await {
                None => break,
                Some(Ok(Ok(job_report))) => report.jobs.push(job_report),
                Some(Ok(Err(e))) => {
                    warn!(error = %e, "job update failed, aborting remaining jobs");
                    fatal.get_or_insert(e);
                }
                Some(Err(join_err)) => {
                    fatal.get_or_insert(UpdateError::UpdateFailure {
                        job: "unknown".into(),
                        index: 0,
                        source: anyhow::anyhow!(join_err),
                    });
                }
            }
        }

        match fatal {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use flotilla_core::{CloudDriver, VmHandle, VmTemplate};
    use flotilla_plan::{
        FleetState, InstanceAction, InstancePlan, ResourcePoolSpec, UpdatePolicy,
    };
    use flotilla_pool::ResourcePoolManager;
    use crate::instance::InstanceUpdater;

    #[derive(Default)]
    struct TrackingDriver {
        applies: Mutex<Vec<String>>,
        provisioned: AtomicU32,
        fail_vm: Option<String>,
    }

    #[async_trait]
    impl CloudDriver for TrackingDriver {
        async fn provision(&self, _template: &VmTemplate) -> anyhow::Result<VmHandle> {
            let n = self.provisioned.fetch_add(1, Ordering::SeqCst);
            Ok(VmHandle::new(format!("new-{n}")))
        }

        async fn destroy(&self, _vm: &VmHandle) -> anyhow::Result<()> {
            Ok(())
        }

        async fn apply_spec(
            &self,
            vm: &VmHandle,
            _spec: &serde_json::Value,
        ) -> anyhow::Result<()> {
            self.applies.lock().unwrap().push(vm.id.clone());
            Ok(())
        }

        async fn run_script(&self, vm: &VmHandle, name: &str) -> anyhow::Result<()> {
            if name == "post-start" && self.fail_vm.as_deref() == Some(&vm.id) {
                anyhow::bail!("unhealthy");
            }
            Ok(())
        }
    }

    fn policy(ordering: JobOrdering) -> UpdatePolicy {
        UpdatePolicy {
            canaries: 0,
            max_in_flight: 2,
            canary_watch_ms: 1,
            update_watch_ms: 1,
            post_start_retries: 0,
            job_ordering: ordering,
            ..UpdatePolicy::default()
        }
    }

    fn update_inst(job: &str, index: u32, vm: &str) -> InstancePlan {
        InstancePlan {
            job: job.into(),
            index,
            action: InstanceAction::Update,
            pool: "small".into(),
            current_vm: Some(VmHandle::new(vm)),
            replace_vm: false,
            target_hash: Some("h".into()),
            target_spec: Some(serde_json::json!({})),
        }
    }

    fn plan(ordering: JobOrdering) -> DeploymentPlan {
        DeploymentPlan {
            name: "prod".into(),
            pools: vec![],
            networks: vec![],
            jobs: vec![],
            packages: vec![],
            update: policy(ordering),
        }
    }

    fn two_job_diff(ordering: JobOrdering) -> DeploymentDiff {
        DeploymentDiff {
            jobs: vec![
                JobDiff {
                    name: "web".into(),
                    policy: policy(ordering),
                    instances: vec![update_inst("web", 0, "web-0")],
                },
                JobDiff {
                    name: "worker".into(),
                    policy: policy(ordering),
                    instances: vec![update_inst("worker", 0, "worker-0")],
                },
            ],
        }
    }

    async fn coordinator(driver: Arc<TrackingDriver>) -> MultiJobUpdater {
        let pools = Arc::new(ResourcePoolManager::new(driver.clone()));
        pools
            .reconcile(
                &[ResourcePoolSpec {
                    name: "small".into(),
                    size: 0,
                    template: VmTemplate::default(),
                }],
                &FleetState::default(),
            )
            .await
            .unwrap();
        MultiJobUpdater::new(Arc::new(JobUpdater::new(Arc::new(InstanceUpdater::new(
            driver, pools,
        )))))
    }

    #[tokio::test]
    async fn serial_updates_jobs_in_plan_order() {
        let driver = Arc::new(TrackingDriver::default());
        let coord = coordinator(driver.clone()).await;
        let diff = two_job_diff(JobOrdering::Serial);

        let report = coord
            .update(&plan(JobOrdering::Serial), &diff, &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(report.jobs.len(), 2);
        assert_eq!(driver.applies.lock().unwrap().clone(), vec!["web-0", "worker-0"]);
    }

    #[tokio::test]
    async fn serial_aborts_remaining_jobs_on_failure() {
        let driver = Arc::new(TrackingDriver {
            fail_vm: Some("web-0".into()),
            ..TrackingDriver::default()
        });
        let coord = coordinator(driver.clone()).await;
        let diff = two_job_diff(JobOrdering::Serial);

        let err = coord
            .update(&plan(JobOrdering::Serial), &diff, &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::UpdateFailure { .. }));
        // worker never touched.
        assert_eq!(driver.applies.lock().unwrap().clone(), vec!["web-0"]);
    }

    #[tokio::test]
    async fn parallel_updates_all_jobs() {
        let ordering = JobOrdering::Parallel { max_in_flight: 2 };
        let driver = Arc::new(TrackingDriver::default());
        let coord = coordinator(driver.clone()).await;
        let diff = two_job_diff(ordering);

        let report = coord
            .update(&plan(ordering), &diff, &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(report.jobs.len(), 2);
        let mut applies = driver.applies.lock().unwrap().clone();
        applies.sort();
        assert_eq!(applies, vec!["web-0", "worker-0"]);
    }

    #[tokio::test]
    async fn cancellation_stops_between_jobs() {
        let driver = Arc::new(TrackingDriver::default());
        let coord = coordinator(driver.clone()).await;
        let diff = two_job_diff(JobOrdering::Serial);
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = coord
            .update(&plan(JobOrdering::Serial), &diff, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::Cancelled));
        assert!(driver.applies.lock().unwrap().is_empty());
    }
}
