//! Package compilation.
//!
//! Builds the package dependency DAG, fingerprints each package by its own
//! identity plus the fingerprints of everything it depends on, and drives
//! compilation of cache misses in dependency order with bounded
//! concurrency. Already-cached packages are never rebuilt.

pub mod cache;
pub mod compiler;
pub mod error;
pub mod graph;

pub use cache::{CacheKey, CompiledPackage, CompiledPackageCache};
pub use compiler::{BlobStore, CompilationBackend, Compiler};
pub use error::{CompileError, CompileResult};
pub use graph::PackageGraph;
