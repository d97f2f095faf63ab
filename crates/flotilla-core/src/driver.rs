//! VM driver boundary.
//!
//! The concrete driver (IaaS client) lives outside this workspace. The
//! pipeline only needs these four operations; driver-specific failures
//! cross the boundary as opaque `anyhow` errors and are wrapped by the
//! caller into its own error kind.

use async_trait::async_trait;

use crate::vm::{VmHandle, VmTemplate};

/// Low-level VM control operations.
///
/// All operations are slow, I/O-bound remote calls. Implementations are
/// expected to enforce their own per-call timeouts.
#[async_trait]
pub trait CloudDriver: Send + Sync {
    /// Create a VM from a pool template.
    async fn provision(&self, template: &VmTemplate) -> anyhow::Result<VmHandle>;

    /// Destroy a VM.
    async fn destroy(&self, vm: &VmHandle) -> anyhow::Result<()>;

    /// Push a target configuration to a VM.
    async fn apply_spec(&self, vm: &VmHandle, spec: &serde_json::Value) -> anyhow::Result<()>;

    /// Run a named lifecycle script (e.g. "drain", "post-start") on a VM.
    async fn run_script(&self, vm: &VmHandle, name: &str) -> anyhow::Result<()>;
}
