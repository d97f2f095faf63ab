//! VM handles and templates.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::content_fingerprint;

/// Opaque reference to a VM managed by the cloud driver.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VmHandle {
    pub id: String,
}

impl VmHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl std::fmt::Display for VmHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.id)
    }
}

/// Infrastructure template shared by every VM in a resource pool.
///
/// A VM only ever matches the pool it was provisioned for if its template
/// fingerprint still equals the pool's. Any change to the stemcell, network,
/// or cloud properties produces a new fingerprint, which forces the VM to be
/// retired and replaced rather than reused.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmTemplate {
    /// Base OS image identifier.
    pub stemcell: String,
    /// Network the VM attaches to.
    pub network: String,
    /// Infrastructure-specific parameters (instance type, zone, ...).
    /// BTreeMap keeps serialization order deterministic for fingerprinting.
    #[serde(default)]
    pub cloud_properties: BTreeMap<String, serde_json::Value>,
}

impl VmTemplate {
    /// Content fingerprint of the template.
    pub fn fingerprint(&self) -> String {
        // Serialization cannot fail: the type is a closed set of
        // JSON-representable fields.
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        content_fingerprint(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> VmTemplate {
        VmTemplate {
            stemcell: "ubuntu-jammy/1.2".into(),
            network: "default".into(),
            cloud_properties: BTreeMap::from([(
                "instance_type".to_string(),
                serde_json::json!("m1.small"),
            )]),
        }
    }

    #[test]
    fn fingerprint_changes_with_any_field() {
        let base = template();
        assert_eq!(base.fingerprint(), template().fingerprint());

        let mut stemcell = template();
        stemcell.stemcell = "ubuntu-jammy/1.3".into();
        assert_ne!(base.fingerprint(), stemcell.fingerprint());

        let mut network = template();
        network.network = "dmz".into();
        assert_ne!(base.fingerprint(), network.fingerprint());

        let mut props = template();
        props
            .cloud_properties
            .insert("instance_type".into(), serde_json::json!("m1.large"));
        assert_ne!(base.fingerprint(), props.fingerprint());
    }
}
