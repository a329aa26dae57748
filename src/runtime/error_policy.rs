//! # Error Policy
//!
//! Requeue decisions for failed reconciliations, shared by every controller loop.
//! Backoff is tracked per resource so one failing object never slows down the rest.

use crate::controller::backoff::BackoffRegistry;
use crate::error::Error;
use crate::observability;
use kube::{Resource, ResourceExt};
use kube_runtime::controller::Action;
use tracing::{error, info};

/// Backoff key of an object: `namespace/name`, or `name` for cluster-scoped objects
pub fn resource_key<K: Resource>(obj: &K) -> String {
    match obj.namespace() {
        Some(namespace) => format!("{namespace}/{}", obj.name_any()),
        None => obj.name_any(),
    }
}

/// Record a failed reconciliation and schedule the next attempt
pub fn handle_reconciliation_error<K: Resource>(
    controller: &'static str,
    obj: &K,
    error: &Error,
    backoff: &BackoffRegistry,
) -> Action {
    let key = resource_key(obj);

    let error_span = tracing::span!(
        tracing::Level::ERROR,
        "controller.reconciliation_error",
        controller,
        resource.key = key.as_str(),
        error.kind = error.kind()
    );
    let _error_guard = error_span.enter();

    error!("Reconciliation error for {}: {}", key, error);
    observability::metrics::increment_reconciliation_errors(controller, error.kind());

    let delay = backoff.next_backoff(&key);
    let next_trigger_time = chrono::Utc::now()
        + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
    info!(
        "Next retry of {} scheduled: {} (in {})",
        key,
        next_trigger_time.to_rfc3339(),
        humantime::format_duration(delay)
    );

    observability::metrics::increment_requeues_total("error-backoff");
    Action::requeue(delay)
}
