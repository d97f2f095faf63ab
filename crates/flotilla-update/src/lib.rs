//! The update engine.
//!
//! Applies a deployment diff to real instances. Within a job, canary
//! instances update first and strictly sequentially; only if every canary
//! succeeds does the remaining batch proceed, with up to `max_in_flight`
//! instances in flight. Across jobs, ordering follows the plan's
//! serial/parallel policy. A failed rollout leaves already-updated
//! instances committed; nothing is rolled back automatically.

pub mod coordinator;
pub mod error;
pub mod instance;
pub mod job;

pub use coordinator::{MultiJobUpdater, UpdateReport};
pub use error::{UpdateError, UpdateResult};
pub use instance::{InstanceState, InstanceUpdater};
pub use job::{JobUpdateReport, JobUpdater};
