//! Resource pool management.
//!
//! Tracks VM inventory per named pool and reconciles it against the
//! plan's desired sizes. All mutation of a single pool's inventory goes
//! through one async mutex, so allocation and retirement never race the
//! counters out of sync with reality.

pub mod error;
pub mod manager;

pub use error::{PoolError, PoolResult};
pub use manager::{PoolReport, PoolVm, ResourcePoolManager};
