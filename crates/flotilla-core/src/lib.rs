//! Shared primitives for the Flotilla deployment controller.
//!
//! This crate holds the pieces every pipeline stage needs: VM handle and
//! template types, the named deployment lock, the cancellation token, and
//! the boundary trait for the low-level VM-control driver.

pub mod cancel;
pub mod driver;
pub mod lock;
pub mod vm;

pub use cancel::CancelToken;
pub use driver::CloudDriver;
pub use lock::{DeploymentLockHandle, DeploymentLocks, LockError};
pub use vm::{VmHandle, VmTemplate};

/// Hex-encoded SHA-256 of a byte slice. The fingerprint primitive used for
/// spec hashes, template fingerprints, and package fingerprints.
pub fn content_fingerprint(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
