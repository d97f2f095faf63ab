//! Resource pool error types.

use thiserror::Error;

/// Errors from pool reconciliation and allocation.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("resource pool '{0}' is not declared in the plan")]
    UnknownPool(String),

    #[error("resource pool '{pool}' exhausted: {size} slots, none idle")]
    PoolExhausted { pool: String, size: u32 },

    #[error("VM driver error in pool '{pool}'")]
    Driver {
        pool: String,
        #[source]
        source: anyhow::Error,
    },
}

pub type PoolResult<T> = Result<T, PoolError>;
