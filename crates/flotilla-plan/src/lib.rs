//! Deployment plans.
//!
//! Turns a YAML manifest plus a versioned cloud config into an immutable
//! `DeploymentPlan`, and diffs that plan against a `FleetState` snapshot
//! into per-instance create/keep/update/delete actions. Assembly and
//! diffing are pure: identical inputs always produce identical output.

pub mod assembler;
pub mod error;
pub mod fleet;
pub mod manifest;
pub mod plan;

pub use assembler::{Assembler, DeploymentDiff, InstanceAction, InstancePlan, JobDiff, RunOptions};
pub use error::{PlanError, PlanResult, RefKind};
pub use fleet::{CloudConfigStore, FleetState, FleetStateStore, VmRecord};
pub use manifest::CloudConfig;
pub use plan::{
    BatchFailurePolicy, DeploymentPlan, JobLifecycle, JobOrdering, JobSpec, NetworkSpec,
    PackageSpec, ResourcePoolSpec, UpdatePolicy,
};
