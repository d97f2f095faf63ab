//! Manifest and cloud-config documents.
//!
//! These are the wire shapes as authored by operators. They are parsed
//! from YAML and folded into the typed `DeploymentPlan` by the assembler;
//! nothing downstream of assembly touches them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Top-level deployment manifest document.
#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    pub name: String,
    #[serde(default)]
    pub resource_pools: Vec<ManifestResourcePool>,
    #[serde(default)]
    pub networks: Vec<ManifestNetwork>,
    #[serde(default)]
    pub jobs: Vec<ManifestJob>,
    #[serde(default)]
    pub packages: Vec<ManifestPackage>,
    /// Global update policy defaults.
    #[serde(default)]
    pub update: UpdateSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestResourcePool {
    pub name: String,
    pub size: u32,
    pub stemcell: String,
    pub network: String,
    #[serde(default)]
    pub cloud_properties: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestNetwork {
    pub name: String,
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestJob {
    pub name: String,
    pub instances: u32,
    /// Software templates to run, by package name.
    pub templates: Vec<String>,
    pub resource_pool: String,
    #[serde(default)]
    pub networks: Vec<String>,
    /// Per-job override, merged field-by-field over the global policy.
    #[serde(default)]
    pub update: UpdateSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestPackage {
    pub name: String,
    pub version: String,
    /// Source blob reference in the package store.
    pub blob: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// Partial update policy as written in a manifest. Every field is
/// optional so a job-level block can override just what it names.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateSettings {
    pub canaries: Option<u32>,
    pub max_in_flight: Option<u32>,
    pub canary_watch_ms: Option<u64>,
    pub update_watch_ms: Option<u64>,
    pub post_start_retries: Option<u32>,
    /// `true` runs jobs one at a time (the default).
    pub serial: Option<bool>,
    /// Jobs in flight at once when `serial: false`.
    pub job_max_in_flight: Option<u32>,
    /// Batch failures tolerated before the job aborts. Absent means
    /// abort on the first failure.
    pub max_tolerated_failures: Option<u32>,
}

/// Shared infrastructure defaults, versioned and looked up by id.
///
/// Networks declared here are available to every deployment; a manifest
/// network with the same name wins. `resource_pool_defaults` seed each
/// pool's cloud properties (manifest properties win per key).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloudConfig {
    #[serde(default)]
    pub networks: Vec<ManifestNetwork>,
    #[serde(default)]
    pub resource_pool_defaults: BTreeMap<String, serde_json::Value>,
}

impl Manifest {
    pub fn parse(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }
}

impl CloudConfig {
    pub fn parse(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }
}
