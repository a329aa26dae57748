//! # Attachment Reconciler
//!
//! Drives one `VolumeAttachment` through attach and detach.
//!
//! ```text
//! PendingAttach --attach ok--> Attached --deletion--> PendingDetach --detach ok--> finalizer removed
//!       \                                                  \
//!        `--attach failed--> attachError, requeue           `--detach failed--> detachError, requeue
//! ```
//!
//! The controller runtime never runs two reconciliations of the same object at
//! once, so attach and detach of one attachment are strictly sequential.

use crate::controller::backoff::BackoffRegistry;
use crate::controller::store::{AttachmentStatusUpdate, ObjectStore};
use crate::error::{Error, Result};
use crate::observability::metrics;
use crate::runtime::error_policy::{handle_reconciliation_error, resource_key};
use k8s_openapi::api::storage::v1::VolumeAttachment;
use kube::ResourceExt;
use kube_runtime::controller::Action;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn, Instrument};

use super::handler::Handler;

const CONTROLLER: &str = "attacher";

/// Shared state of the attachment loop
pub struct AttacherContext {
    /// Only attachments whose `spec.attacher` equals this name are handled
    pub driver_name: String,
    pub handler: Arc<dyn Handler>,
    pub store: Arc<dyn ObjectStore>,
    /// Periodic re-check interval for attachments that are in their desired state
    pub resync: Duration,
    pub backoff: BackoffRegistry,
}

impl std::fmt::Debug for AttacherContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttacherContext")
            .field("driver_name", &self.driver_name)
            .field("resync", &self.resync)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl AttacherContext {
    #[must_use]
    pub fn finalizer(&self) -> String {
        finalizer_name(&self.driver_name)
    }
}

/// Finalizer the attacher puts on attachments of `driver_name`
#[must_use]
pub fn finalizer_name(driver_name: &str) -> String {
    format!("external-attacher/{}", driver_name.replace('/', "-"))
}

pub async fn reconcile_attachment(
    attachment: Arc<VolumeAttachment>,
    ctx: Arc<AttacherContext>,
) -> Result<Action> {
    let started = Instant::now();
    let span = tracing::info_span!(
        "controller.attacher.reconcile",
        resource.name = %attachment.name_any(),
        node = %attachment.spec.node_name
    );
    metrics::increment_reconciliations(CONTROLLER);

    let result = sync_attachment(&attachment, &ctx).instrument(span).await;
    metrics::observe_reconciliation_duration(CONTROLLER, started.elapsed().as_secs_f64());
    if result.is_ok() {
        ctx.backoff.reset(&resource_key(attachment.as_ref()));
    }
    result
}

async fn sync_attachment(attachment: &VolumeAttachment, ctx: &AttacherContext) -> Result<Action> {
    if attachment.spec.attacher != ctx.driver_name {
        return Ok(Action::await_change());
    }

    if attachment.metadata.deletion_timestamp.is_some() {
        return sync_detach(attachment, ctx).await;
    }

    if ctx.handler.is_attached(attachment) {
        debug!("Attachment is already attached");
        return Ok(Action::requeue(ctx.resync));
    }

    let finalizer = ctx.finalizer();
    if !attachment.finalizers().contains(&finalizer) {
        let mut finalizers = attachment.finalizers().to_vec();
        finalizers.push(finalizer);
        ctx.store
            .set_attachment_finalizers(
                &attachment.name_any(),
                attachment.resource_version().as_deref(),
                finalizers,
            )
            .await?;
        debug!("Added finalizer");
    }

    match ctx.handler.attach(attachment).await {
        Ok(context) => {
            ctx.store
                .update_attachment_status(
                    &attachment.name_any(),
                    &AttachmentStatusUpdate::Attached(context),
                )
                .await?;
            info!("Attachment marked attached");
            Ok(Action::requeue(ctx.resync))
        }
        Err(e) => {
            let update = AttachmentStatusUpdate::AttachFailed(status_message(&e));
            record_failure(ctx, attachment, update).await;
            Err(e)
        }
    }
}

async fn sync_detach(attachment: &VolumeAttachment, ctx: &AttacherContext) -> Result<Action> {
    let finalizer = ctx.finalizer();
    if !attachment.finalizers().contains(&finalizer) {
        debug!("Attachment is being deleted and carries no finalizer of ours");
        return Ok(Action::await_change());
    }

    if let Err(e) = ctx.handler.detach(attachment).await {
        let update = AttachmentStatusUpdate::DetachFailed(status_message(&e));
        record_failure(ctx, attachment, update).await;
        return Err(e);
    }

    let name = attachment.name_any();
    // the status write bumps the resource version the finalizer removal is conditional on
    let resource_version = ctx
        .store
        .update_attachment_status(&name, &AttachmentStatusUpdate::Detached)
        .await?;
    let remaining: Vec<String> = attachment
        .finalizers()
        .iter()
        .filter(|f| **f != finalizer)
        .cloned()
        .collect();
    ctx.store
        .set_attachment_finalizers(&name, resource_version.as_deref(), remaining)
        .await?;
    info!("Attachment detached, finalizer removed");
    Ok(Action::await_change())
}

/// Status message of a failed attach or detach: `<kind>: <cause>`
fn status_message(error: &Error) -> String {
    format!("{}: {}", error.kind(), error)
}

/// Write an error into the attachment status; the reconcile error itself is what gets requeued
async fn record_failure(
    ctx: &AttacherContext,
    attachment: &VolumeAttachment,
    update: AttachmentStatusUpdate,
) {
    if let Err(e) = ctx
        .store
        .update_attachment_status(&attachment.name_any(), &update)
        .await
    {
        warn!("Failed to record attachment error in status: {}", e);
    }
}

pub fn error_policy(
    attachment: Arc<VolumeAttachment>,
    error: &Error,
    ctx: Arc<AttacherContext>,
) -> Action {
    handle_reconciliation_error(CONTROLLER, attachment.as_ref(), error, &ctx.backoff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{Code, RpcStatus};

    #[test]
    fn test_finalizer_sanitizes_driver_name() {
        assert_eq!(finalizer_name("csi/dummy"), "external-attacher/csi-dummy");
        assert_eq!(
            finalizer_name("hostpath.csi.k8s.io"),
            "external-attacher/hostpath.csi.k8s.io"
        );
    }

    #[test]
    fn test_status_message_carries_kind() {
        let error = Error::Operation(RpcStatus::new(Code::Internal, "disk busy"));
        assert_eq!(
            status_message(&error),
            "OperationError: rpc error: code = Internal desc = disk busy"
        );
    }
}
