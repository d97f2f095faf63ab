//! Plan assembly error types.

use thiserror::Error;

/// What kind of declaration an unresolved reference points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    ResourcePool,
    Network,
    Package,
    Job,
    Rename,
}

impl std::fmt::Display for RefKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RefKind::ResourcePool => "resource pool",
            RefKind::Network => "network",
            RefKind::Package => "package",
            RefKind::Job => "job",
            RefKind::Rename => "rename",
        };
        f.write_str(s)
    }
}

/// Errors from manifest parsing, plan assembly, and diffing.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("failed to parse deployment manifest")]
    ManifestParse(#[from] serde_yaml::Error),

    #[error("invalid manifest: {0}")]
    ManifestSchema(String),

    #[error("{kind} '{name}' referenced by {referenced_by} is not declared")]
    UnresolvedReference {
        kind: RefKind,
        name: String,
        referenced_by: String,
    },
}

pub type PlanResult<T> = Result<T, PlanError>;
