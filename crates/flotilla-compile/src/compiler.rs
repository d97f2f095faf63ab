//! Topological package compiler.
//!
//! A package becomes eligible once every dependency's compiled artifact
//! is in the cache under its exact fingerprint. Eligible packages compile
//! concurrently up to `max_in_flight`. Any single failure aborts the
//! deployment: no partial compile set is usable downstream.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::{debug, info};

use flotilla_core::CancelToken;
use flotilla_plan::PackageSpec;

use crate::cache::{CacheKey, CompiledPackage, CompiledPackageCache};
use crate::error::{CompileError, CompileResult};
use crate::graph::PackageGraph;

/// Blob/package store boundary: package sources in, compiled artifacts out.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn fetch(&self, blob: &str) -> anyhow::Result<Vec<u8>>;
    async fn store(&self, bytes: Vec<u8>) -> anyhow::Result<String>;
}

/// The build mechanics for one package.
///
/// The compiler owns ordering, caching, concurrency, and cancellation;
/// the backend only turns a source plus compiled dependencies into an
/// artifact.
#[async_trait]
pub trait CompilationBackend: Send + Sync {
    async fn build(
        &self,
        package: &PackageSpec,
        source: &[u8],
        dependencies: &[CompiledPackage],
    ) -> anyhow::Result<Vec<u8>>;
}

/// Drives compilation of a plan's package set.
pub struct Compiler {
    blobstore: Arc<dyn BlobStore>,
    backend: Arc<dyn CompilationBackend>,
    cache: CompiledPackageCache,
    max_in_flight: usize,
}

impl Compiler {
    pub fn new(
        blobstore: Arc<dyn BlobStore>,
        backend: Arc<dyn CompilationBackend>,
        cache: CompiledPackageCache,
        max_in_flight: usize,
    ) -> Self {
        Self {
            blobstore,
            backend,
            cache,
            max_in_flight: max_in_flight.max(1),
        }
    }

    pub fn cache(&self) -> &CompiledPackageCache {
        &self.cache
    }

    /// Compile every cache miss in `packages`, in dependency order.
    ///
    /// Returns the compiled package for every package in the set, cache
    /// hits included. On failure or cancellation, in-flight compiles run
    /// to completion before the error is returned.
    pub async fn compile(
        &self,
        packages: &[PackageSpec],
        cancel: &CancelToken,
    ) -> CompileResult<HashMap<String, CompiledPackage>> {
        let graph = PackageGraph::build(packages)?;

        let mut pending: Vec<String> = graph.order().to_vec();
        let mut completed: HashMap<String, CompiledPackage> = HashMap::new();
        let mut in_flight: JoinSet<CompileResult<CompiledPackage>> = JoinSet::new();
        let mut first_error: Option<CompileError> = None;

        loop {
            if first_error.is_none() {
                self.schedule_ready(
                    &graph,
                    &mut pending,
                    &mut completed,
                    &mut in_flight,
                    cancel,
                    &mut first_error,
                );
            }

            if in_flight.is_empty() {
                if first_error.is_some() || pending.is_empty() {
                    break;
                }
                // Topological order guarantees the scan above always finds
                // a ready package while anything is pending.
                debug_assert!(false, "pending packages with no ready candidate");
                break;
            }

            match in_flight.join_next().await {
                Some(Ok(Ok(compiled))) => {
                    self.cache.insert(compiled.clone());
                    completed.insert(compiled.package.clone(), compiled);
                }
                Some(Ok(Err(e))) => {
                    first_error.get_or_insert(e);
                }
                Some(Err(join_err)) => {
                    first_error.get_or_insert(CompileError::PackageCompilation {
                        package: "unknown".into(),
                        source: anyhow::anyhow!(join_err),
                    });
                }
                None => {}
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(completed),
        }
    }

    /// Move ready pending packages into flight, up to the concurrency
    /// limit. Cache hits complete immediately without a task.
    fn schedule_ready(
        &self,
        graph: &PackageGraph,
        pending: &mut Vec<String>,
        completed: &mut HashMap<String, CompiledPackage>,
        in_flight: &mut JoinSet<CompileResult<CompiledPackage>>,
        cancel: &CancelToken,
        first_error: &mut Option<CompileError>,
    ) {
        let mut i = 0;
        while i < pending.len() && in_flight.len() < self.max_in_flight {
            let name = pending[i].as_str();
            let Some(spec) = graph.spec(name) else {
                i += 1;
                continue;
            };
            if !spec
                .dependencies
                .iter()
                .all(|d| completed.contains_key(d))
            {
                i += 1;
                continue;
            }
            if cancel.is_cancelled() {
                *first_error = Some(CompileError::Cancelled);
                return;
            }

            let name = pending.remove(i);
            let fingerprint = graph.fingerprint(&name).unwrap_or_default().to_string();
            let key = CacheKey {
                package: spec.name.clone(),
                version: spec.version.clone(),
                fingerprint: fingerprint.clone(),
            };
            if let Some(hit) = self.cache.get(&key) {
                debug!(package = %name, "compiled package cache hit");
                completed.insert(name, hit);
                continue;
            }

            let dependencies: Vec<CompiledPackage> = spec
                .dependencies
                .iter()
                .map(|d| completed[d].clone())
                .collect();
            let blobstore = self.blobstore.clone();
            let backend = self.backend.clone();
            let spec = spec.clone();
            in_flight.spawn(async move {
                compile_one(blobstore, backend, spec, fingerprint, dependencies).await
            });
        }
    }
}

async fn compile_one(
    blobstore: Arc<dyn BlobStore>,
    backend: Arc<dyn CompilationBackend>,
    spec: PackageSpec,
    fingerprint: String,
    dependencies: Vec<CompiledPackage>,
) -> CompileResult<CompiledPackage> {
    let fail = |source: anyhow::Error| CompileError::PackageCompilation {
        package: spec.name.clone(),
        source,
    };

    let source = blobstore
        .fetch(&spec.source_blob)
        .await
        .map_err(|e| fail(e.context("fetching source blob")))?;
    let artifact = backend
        .build(&spec, &source, &dependencies)
        .await
        .map_err(&fail)?;
    let artifact_blob = blobstore
        .store(artifact)
        .await
        .map_err(|e| fail(e.context("storing compiled artifact")))?;

    info!(package = %spec.name, version = %spec.version, "package compiled");
    Ok(CompiledPackage {
        package: spec.name,
        version: spec.version,
        fingerprint,
        artifact_blob,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct MemoryBlobstore;

    #[async_trait]
    impl BlobStore for MemoryBlobstore {
        async fn fetch(&self, blob: &str) -> anyhow::Result<Vec<u8>> {
            Ok(blob.as_bytes().to_vec())
        }

        async fn store(&self, bytes: Vec<u8>) -> anyhow::Result<String> {
            Ok(format!("artifact-{}", bytes.len()))
        }
    }

    /// Records build order and concurrency; optionally fails one package.
    #[derive(Default)]
    struct RecordingBackend {
        builds: Mutex<Vec<String>>,
        fail_package: Option<String>,
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl CompilationBackend for RecordingBackend {
        async fn build(
            &self,
            package: &PackageSpec,
            _source: &[u8],
            _dependencies: &[CompiledPackage],
        ) -> anyhow::Result<Vec<u8>> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);

            self.builds.lock().unwrap().push(package.name.clone());
            if self.fail_package.as_deref() == Some(&package.name) {
                anyhow::bail!("exit status 1");
            }
            Ok(package.name.as_bytes().to_vec())
        }
    }

    fn pkg(name: &str, deps: &[&str]) -> PackageSpec {
        PackageSpec {
            name: name.into(),
            version: "1".into(),
            source_blob: format!("blob-{name}"),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
        }
    }

    fn compiler(backend: Arc<RecordingBackend>, max_in_flight: usize) -> Compiler {
        Compiler::new(
            Arc::new(MemoryBlobstore),
            backend,
            CompiledPackageCache::new(),
            max_in_flight,
        )
    }

    #[tokio::test]
    async fn compiles_in_dependency_order() {
        let backend = Arc::new(RecordingBackend::default());
        let c = compiler(backend.clone(), 1);
        let packages = [pkg("app", &["lib"]), pkg("lib", &["util"]), pkg("util", &[])];

        let compiled = c.compile(&packages, &CancelToken::new()).await.unwrap();
        assert_eq!(compiled.len(), 3);

        let builds = backend.builds.lock().unwrap().clone();
        let pos = |n: &str| builds.iter().position(|x| x == n).unwrap();
        assert!(pos("util") < pos("lib"));
        assert!(pos("lib") < pos("app"));
    }

    #[tokio::test]
    async fn cycle_fails_before_any_build() {
        let backend = Arc::new(RecordingBackend::default());
        let c = compiler(backend.clone(), 4);
        let packages = [pkg("a", &["b"]), pkg("b", &["a"])];

        let err = c.compile(&packages, &CancelToken::new()).await.unwrap_err();
        assert!(matches!(err, CompileError::CyclicDependency { .. }));
        assert!(backend.builds.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn second_run_hits_the_cache() {
        let backend = Arc::new(RecordingBackend::default());
        let c = compiler(backend.clone(), 2);
        let packages = [pkg("app", &["lib"]), pkg("lib", &[])];

        c.compile(&packages, &CancelToken::new()).await.unwrap();
        assert_eq!(backend.builds.lock().unwrap().len(), 2);

        let compiled = c.compile(&packages, &CancelToken::new()).await.unwrap();
        // No new builds, but the full compile set is still returned.
        assert_eq!(backend.builds.lock().unwrap().len(), 2);
        assert_eq!(compiled.len(), 2);
    }

    #[tokio::test]
    async fn changed_dependency_recompiles_dependents() {
        let backend = Arc::new(RecordingBackend::default());
        let c = compiler(backend.clone(), 2);

        c.compile(&[pkg("app", &["lib"]), pkg("lib", &[])], &CancelToken::new())
            .await
            .unwrap();

        let mut lib2 = pkg("lib", &[]);
        lib2.source_blob = "blob-lib-v2".into();
        c.compile(&[pkg("app", &["lib"]), lib2], &CancelToken::new())
            .await
            .unwrap();

        // Both packages rebuilt: lib changed, and app's dependency
        // fingerprint moved with it.
        assert_eq!(backend.builds.lock().unwrap().len(), 4);
        assert_eq!(c.cache().len(), 4);
    }

    #[tokio::test]
    async fn failure_aborts_dependents() {
        let backend = Arc::new(RecordingBackend {
            fail_package: Some("lib".into()),
            ..RecordingBackend::default()
        });
        let c = compiler(backend.clone(), 2);
        let packages = [pkg("app", &["lib"]), pkg("lib", &[])];

        let err = c.compile(&packages, &CancelToken::new()).await.unwrap_err();
        match err {
            CompileError::PackageCompilation { package, .. } => assert_eq!(package, "lib"),
            other => panic!("unexpected error: {other}"),
        }
        // app never built.
        let builds = backend.builds.lock().unwrap().clone();
        assert!(!builds.contains(&"app".to_string()));
    }

    #[tokio::test]
    async fn cancelled_token_compiles_nothing() {
        let backend = Arc::new(RecordingBackend::default());
        let c = compiler(backend.clone(), 2);
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = c
            .compile(&[pkg("lib", &[])], &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, CompileError::Cancelled));
        assert!(backend.builds.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrency_stays_within_limit() {
        let backend = Arc::new(RecordingBackend::default());
        let c = compiler(backend.clone(), 2);
        let packages = [
            pkg("a", &[]),
            pkg("b", &[]),
            pkg("c", &[]),
            pkg("d", &[]),
        ];

        c.compile(&packages, &CancelToken::new()).await.unwrap();
        assert!(backend.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(backend.builds.lock().unwrap().len(), 4);
    }
}
