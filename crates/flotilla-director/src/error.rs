use std::path::PathBuf;

use thiserror::Error;

use flotilla_compile::CompileError;
use flotilla_core::LockError;
use flotilla_plan::PlanError;
use flotilla_pool::PoolError;
use flotilla_update::UpdateError;

/// Any failure of the update pipeline, by stage.
#[derive(Debug, Error)]
pub enum DirectorError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("reading manifest {path} failed")]
    ManifestRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cloud config '{0}' not found")]
    CloudConfigMissing(String),

    #[error("fetching cloud config '{id}' failed")]
    CloudConfigFetch {
        id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("fetching fleet state for deployment '{deployment}' failed")]
    FleetState {
        deployment: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Update(#[from] UpdateError),
}

pub type DirectorResult<T> = Result<T, DirectorError>;
