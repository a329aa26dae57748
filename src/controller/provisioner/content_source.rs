//! Resolves a claim's snapshot data source to a driver snapshot handle.

use crate::constants::{SNAPSHOT_API_GROUP, SNAPSHOT_KIND};
use crate::controller::store::ObjectStore;
use crate::driver::VolumeContentSource;
use crate::error::{Error, Result};
use k8s_openapi::api::core::v1::TypedLocalObjectReference;
use kube::ResourceExt;
use tracing::warn;

use super::quantity::parse_bytes;

const NOT_BOUND_OR_INVALID: &str = "snapshot in data source not bound or invalid";

/// Check the claim's data source and return the driver-level content source
///
/// Every problem with the snapshot or its content collapses into the same
/// user-facing error. The specific cause is only logged.
pub async fn resolve_content_source(
    store: &dyn ObjectStore,
    claim_namespace: &str,
    source: &TypedLocalObjectReference,
    requested_bytes: i64,
) -> Result<VolumeContentSource> {
    if source.kind != SNAPSHOT_KIND {
        return Err(Error::UnsupportedRequest(format!(
            "the PVC source is not the right type. Expected {SNAPSHOT_KIND}, Got {}",
            source.kind
        )));
    }
    let group = source.api_group.as_deref().unwrap_or_default();
    if group != SNAPSHOT_API_GROUP {
        return Err(Error::UnsupportedRequest(format!(
            "the PVC source does not belong to the right APIGroup. Expected {SNAPSHOT_API_GROUP}, Got {group}"
        )));
    }

    let invalid = |detail: String| {
        warn!(snapshot = %source.name, namespace = claim_namespace, "Rejecting data source: {}", detail);
        Error::InvalidContentSource {
            kind: source.kind.clone(),
            name: source.name.clone(),
            reason: NOT_BOUND_OR_INVALID.to_string(),
        }
    };

    let Some(snapshot) = store
        .get_volume_snapshot(claim_namespace, &source.name)
        .await?
    else {
        return Err(invalid("snapshot not found".to_string()));
    };
    if snapshot.metadata.deletion_timestamp.is_some() {
        return Err(invalid("snapshot is being deleted".to_string()));
    }
    let status = snapshot.status.clone().unwrap_or_default();
    if !status.ready {
        return Err(invalid("snapshot is not ready".to_string()));
    }
    let content_name = match snapshot.spec.snapshot_content_name.as_deref() {
        Some(name) if !name.is_empty() => name,
        _ => return Err(invalid("snapshot is not bound to any content".to_string())),
    };

    let Some(content) = store.get_volume_snapshot_content(content_name).await? else {
        return Err(invalid(format!("snapshot content {content_name} not found")));
    };
    let bound = content.spec.volume_snapshot_ref.as_ref().is_some_and(|r| {
        r.name.as_deref() == Some(snapshot.name_any().as_str())
            && r.namespace.as_deref() == snapshot.namespace().as_deref()
            && r.uid.is_some()
            && r.uid == snapshot.metadata.uid
    });
    if !bound {
        return Err(invalid(format!(
            "snapshot content {content_name} is not bound to this snapshot"
        )));
    }
    let handle = match content.spec.csi.as_ref() {
        Some(csi) if !csi.snapshot_handle.is_empty() => csi.snapshot_handle.clone(),
        _ => {
            return Err(invalid(format!(
                "snapshot content {content_name} has no CSI snapshot handle"
            )))
        }
    };

    if let Some(restore_size) = status.restore_size.as_ref() {
        let restore_bytes = parse_bytes(restore_size)?;
        if requested_bytes < restore_bytes {
            return Err(Error::UnsupportedRequest(format!(
                "requested volume size {requested_bytes} is less than the size {restore_bytes} for the source snapshot {}",
                source.name
            )));
        }
        if requested_bytes > restore_bytes {
            warn!(
                snapshot = %source.name,
                "requested volume size {} is greater than the size {} of the source snapshot; volume plugin needs to handle volume expansion",
                requested_bytes,
                restore_bytes
            );
        }
    }

    Ok(VolumeContentSource::Snapshot {
        snapshot_id: handle,
    })
}
