//! Compilation error types.

use thiserror::Error;

/// Errors from graph construction and compilation.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("cyclic package dependency: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("package '{package}' depends on undeclared package '{dependency}'")]
    UnknownDependency { package: String, dependency: String },

    #[error("compilation of package '{package}' failed")]
    PackageCompilation {
        package: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("compilation cancelled")]
    Cancelled,
}

pub type CompileResult<T> = Result<T, CompileError>;
