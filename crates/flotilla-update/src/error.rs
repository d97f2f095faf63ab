//! Update engine error types.

use thiserror::Error;

use flotilla_pool::PoolError;

/// Errors from the rolling update phase.
#[derive(Debug, Error)]
pub enum UpdateError {
    /// A canary instance failed; the job's batch was never started.
    #[error("canary instance {job}/{index} failed")]
    CanaryFailure {
        job: String,
        index: u32,
        #[source]
        source: anyhow::Error,
    },

    /// A batch instance failed beyond what the policy tolerates.
    #[error("update of instance {job}/{index} failed")]
    UpdateFailure {
        job: String,
        index: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("update cancelled")]
    Cancelled,
}

pub type UpdateResult<T> = Result<T, UpdateError>;
