//! The Flotilla director.
//!
//! Top of the stack: accepts an update request, serializes it against
//! concurrent runs of the same deployment, and drives the full pipeline
//! of plan assembly, package compilation, pool reconciliation, and the
//! rolling update, emitting lifecycle events along the way.

pub mod error;
pub mod notifier;
pub mod orchestrator;

pub use error::{DirectorError, DirectorResult};
pub use notifier::{DeploymentEvent, EventKind, EventSink, Notifier};
pub use orchestrator::{OrchestratorConfig, UpdateOrchestrator, UpdateRequest};
