//! Storage snapshot resources
//!
//! Each volume entry of a VM backup names a CSI `VolumeSnapshot`. Once bound,
//! the snapshot points at a `VolumeSnapshotContent`, and Longhorn keeps the
//! actual data in a `Snapshot` whose name is derived from the content name.
//! Cleanup needs to walk that chain, so only the fields on it are modelled.

use kube::api::{ApiResource, GroupVersionKind};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Source of a CSI VolumeSnapshot
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotSource {
    /// PVC the snapshot was taken from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim_name: Option<String>,
    /// Pre-provisioned content the snapshot binds to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_snapshot_content_name: Option<String>,
}

/// Specification for a CSI VolumeSnapshot
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "snapshot.storage.k8s.io",
    version = "v1",
    kind = "VolumeSnapshot",
    plural = "volumesnapshots",
    status = "VolumeSnapshotStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotSpec {
    /// Where the snapshot comes from
    pub source: VolumeSnapshotSource,
    /// Snapshot class
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_snapshot_class_name: Option<String>,
}

/// Status of a CSI VolumeSnapshot
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotStatus {
    /// Content this snapshot is bound to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bound_volume_snapshot_content_name: Option<String>,
    /// True once the snapshot can be restored from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_to_use: Option<bool>,
}

impl VolumeSnapshot {
    /// Name of the bound VolumeSnapshotContent, if binding has happened
    pub fn bound_content_name(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.bound_volume_snapshot_content_name.as_deref())
    }
}

/// Longhorn `Snapshot` resource (`longhorn.io/v1beta2`)
///
/// Only ever deleted by name, so no typed body is needed.
pub struct LonghornSnapshot;

impl LonghornSnapshot {
    /// API group
    pub const GROUP: &'static str = "longhorn.io";
    /// API version
    pub const VERSION: &'static str = "v1beta2";
    /// Resource kind
    pub const KIND: &'static str = "Snapshot";

    /// ApiResource for DynamicObject access
    pub fn api_resource() -> ApiResource {
        ApiResource::from_gvk_with_plural(
            &GroupVersionKind::gvk(Self::GROUP, Self::VERSION, Self::KIND),
            "snapshots",
        )
    }
}

/// Longhorn snapshot name for a bound VolumeSnapshotContent.
///
/// The CSI driver names content `snapcontent-<uuid>` and Longhorn names the
/// matching snapshot `snapshot-<uuid>`; only the first occurrence is replaced.
pub fn storage_snapshot_name(content_name: &str) -> String {
    content_name.replacen("snapcontent", "snapshot", 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_snapshot_name_replaces_first_occurrence() {
        assert_eq!(
            storage_snapshot_name("snapcontent-1b2c3d"),
            "snapshot-1b2c3d"
        );
        assert_eq!(
            storage_snapshot_name("snapcontent-snapcontent"),
            "snapshot-snapcontent"
        );
        assert_eq!(storage_snapshot_name("other-name"), "other-name");
    }

    #[test]
    fn longhorn_api_resource() {
        let ar = LonghornSnapshot::api_resource();
        assert_eq!(ar.api_version, "longhorn.io/v1beta2");
        assert_eq!(ar.kind, "Snapshot");
        assert_eq!(ar.plural, "snapshots");
    }

    #[test]
    fn unbound_snapshot_has_no_content_name() {
        let snap = VolumeSnapshot::new("vs1", VolumeSnapshotSpec::default());
        assert!(snap.bound_content_name().is_none());

        let mut bound = snap.clone();
        bound.status = Some(VolumeSnapshotStatus {
            bound_volume_snapshot_content_name: Some("snapcontent-abc".to_string()),
            ready_to_use: Some(true),
        });
        assert_eq!(bound.bound_content_name(), Some("snapcontent-abc"));
    }
}
