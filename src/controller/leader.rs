//! # Leader Election
//!
//! Single active instance per driver, arbitrated through a
//! `coordination.k8s.io/v1` `Lease`.
//!
//! [`LeaderLock::acquire`] blocks until this instance holds the lock. The returned
//! [`Leadership`] keeps renewing in the background and resolves
//! [`Leadership::lost`] once a renewal could not be completed within the renew
//! deadline, at which point the caller must stop calling the driver.

use crate::constants::{DEFAULT_LEASE_DURATION, DEFAULT_RENEW_DEADLINE, DEFAULT_RETRY_PERIOD};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::coordination::v1::Lease;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use serde::Deserialize;
use serde_json::json;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Lock name prefix of the attacher
pub const ATTACHER_LOCK_PREFIX: &str = "external-attacher-leader";

/// Lock name prefix of the provisioner
pub const PROVISIONER_LOCK_PREFIX: &str = "external-provisioner-leader";

/// Lock name for `driver_name`: `<prefix>-<driver with '/' replaced by '-'>`
#[must_use]
pub fn lock_name(prefix: &str, driver_name: &str) -> String {
    format!("{prefix}-{}", driver_name.replace('/', "-"))
}

#[async_trait]
pub trait LeaderLock: Send + Sync {
    /// Block until `identity` holds the lock `name`
    async fn acquire(&self, name: &str, identity: &str) -> Result<Leadership>;
}

/// A held lock
#[derive(Debug)]
pub struct Leadership {
    held: watch::Receiver<bool>,
    task: Option<JoinHandle<()>>,
}

impl Leadership {
    /// Leadership tracked by `held`; dropping the sender counts as losing the lock
    #[must_use]
    pub fn new(held: watch::Receiver<bool>) -> Self {
        Self { held, task: None }
    }

    #[must_use]
    pub fn is_held(&self) -> bool {
        *self.held.borrow()
    }

    /// Resolves once the lock is lost
    pub async fn lost(&self) {
        self.lost_signal().await;
    }

    /// Owned future resolving once the lock is lost, for handing to a controller
    pub fn lost_signal(&self) -> impl std::future::Future<Output = ()> + Send + Sync + 'static {
        let mut held = self.held.clone();
        async move {
            while *held.borrow_and_update() {
                if held.changed().await.is_err() {
                    break;
                }
            }
        }
    }
}

impl Drop for Leadership {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Fields of the lease spec used for arbitration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseRecord {
    #[serde(default)]
    pub holder_identity: Option<String>,
    #[serde(default)]
    pub lease_duration_seconds: Option<i32>,
    #[serde(default)]
    pub acquire_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub renew_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub lease_transitions: Option<i32>,
}

impl LeaseRecord {
    fn from_lease(lease: &Lease) -> Result<Self> {
        let spec = serde_json::to_value(&lease.spec).map_err(|e| {
            Error::InvalidObject(format!("lease {} is not serializable: {e}", lease.name_any()))
        })?;
        if spec.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(spec).map_err(|e| {
            Error::InvalidObject(format!("lease {} has an invalid spec: {e}", lease.name_any()))
        })
    }
}

/// Whether `identity` may take or keep the lease described by `record` at `now`
#[must_use]
pub fn lease_is_available(
    record: &LeaseRecord,
    identity: &str,
    now: DateTime<Utc>,
    default_duration: Duration,
) -> bool {
    let holder = record.holder_identity.as_deref().unwrap_or_default();
    if holder.is_empty() || holder == identity {
        return true;
    }
    let Some(renewed) = record.renew_time else {
        return true;
    };
    let duration = record
        .lease_duration_seconds
        .map(|secs| chrono::Duration::seconds(i64::from(secs)))
        .or_else(|| chrono::Duration::from_std(default_duration).ok())
        .unwrap_or_else(chrono::Duration::zero);
    renewed + duration < now
}

/// [`LeaderLock`] over a `Lease` in one namespace
#[derive(Clone)]
pub struct LeaseLock {
    client: Client,
    namespace: String,
    pub lease_duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
}

impl std::fmt::Debug for LeaseLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseLock")
            .field("namespace", &self.namespace)
            .field("lease_duration", &self.lease_duration)
            .field("renew_deadline", &self.renew_deadline)
            .field("retry_period", &self.retry_period)
            .finish_non_exhaustive()
    }
}

impl LeaseLock {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            lease_duration: DEFAULT_LEASE_DURATION,
            renew_deadline: DEFAULT_RENEW_DEADLINE,
            retry_period: DEFAULT_RETRY_PERIOD,
        }
    }

    /// One acquire-or-renew round; `Ok(false)` when another holder owns the lease
    async fn try_acquire_or_renew(&self, name: &str, identity: &str) -> Result<bool> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);
        let now = Utc::now();
        let now_str = now.to_rfc3339_opts(SecondsFormat::Micros, true);
        let duration_secs = i32::try_from(self.lease_duration.as_secs()).unwrap_or(i32::MAX);

        let Some(lease) = api.get_opt(name).await? else {
            let lease: Lease = serde_json::from_value(json!({
                "apiVersion": "coordination.k8s.io/v1",
                "kind": "Lease",
                "metadata": {"name": name, "namespace": self.namespace},
                "spec": {
                    "holderIdentity": identity,
                    "leaseDurationSeconds": duration_secs,
                    "acquireTime": now_str,
                    "renewTime": now_str,
                    "leaseTransitions": 0,
                }
            }))
            .map_err(|e| Error::InvalidObject(format!("failed to build lease {name}: {e}")))?;
            return match api.create(&PostParams::default(), &lease).await {
                Ok(_) => Ok(true),
                Err(kube::Error::Api(api_err)) if api_err.code == 409 => Ok(false),
                Err(e) => Err(e.into()),
            };
        };

        let record = LeaseRecord::from_lease(&lease)?;
        if !lease_is_available(&record, identity, now, self.lease_duration) {
            debug!(
                holder = record.holder_identity.as_deref().unwrap_or_default(),
                "Lease is held by another instance"
            );
            return Ok(false);
        }

        let same_holder = record.holder_identity.as_deref() == Some(identity);
        let acquire_time = match (same_holder, record.acquire_time) {
            (true, Some(acquired)) => acquired.to_rfc3339_opts(SecondsFormat::Micros, true),
            _ => now_str.clone(),
        };
        let transitions =
            record.lease_transitions.unwrap_or(0) + if same_holder { 0 } else { 1 };
        let patch = json!({
            "metadata": {"resourceVersion": lease.resource_version()},
            "spec": {
                "holderIdentity": identity,
                "leaseDurationSeconds": duration_secs,
                "acquireTime": acquire_time,
                "renewTime": now_str,
                "leaseTransitions": transitions,
            }
        });
        match api
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(api_err)) if api_err.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn renew_until_lost(self, name: String, identity: String, held: watch::Sender<bool>) {
        let (lock, lock_name, identity) = (&self, name.as_str(), identity.as_str());
        keep_renewing(
            lock_name,
            self.retry_period,
            self.renew_deadline,
            move || lock.try_acquire_or_renew(lock_name, identity),
        )
        .await;
        let _ = held.send(false);
    }
}

/// Run `renew` every `retry_period` until the lock is lost.
///
/// Each round is bounded by what is left of `renew_deadline` since the last
/// successful renewal, so a hanging API call cannot keep the lock past it.
async fn keep_renewing<F, Fut>(
    lock: &str,
    retry_period: Duration,
    renew_deadline: Duration,
    mut renew: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let mut last_renewal = Instant::now();
    loop {
        tokio::time::sleep(retry_period).await;
        let remaining = renew_deadline.saturating_sub(last_renewal.elapsed());
        if remaining.is_zero() {
            error!(lock, "Leader lease not renewed within the renew deadline");
            return;
        }
        match tokio::time::timeout(remaining, renew()).await {
            Ok(Ok(true)) => last_renewal = Instant::now(),
            Ok(Ok(false)) => {
                error!(lock, "Leader lease was taken over by another instance");
                return;
            }
            Ok(Err(e)) => {
                warn!(lock, "Failed to renew leader lease: {}", e);
                if last_renewal.elapsed() >= renew_deadline {
                    error!(lock, "Leader lease not renewed within the renew deadline");
                    return;
                }
            }
            Err(_) => {
                error!(lock, ?renew_deadline, "Leader lease renewal timed out");
                return;
            }
        }
    }
}

#[async_trait]
impl LeaderLock for LeaseLock {
    async fn acquire(&self, name: &str, identity: &str) -> Result<Leadership> {
        info!(lock = name, namespace = %self.namespace, identity, "Waiting for leader lease");
        loop {
            match self.try_acquire_or_renew(name, identity).await {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => warn!(lock = name, "Failed to acquire leader lease: {}", e),
            }
            tokio::time::sleep(self.retry_period).await;
        }
        info!(lock = name, identity, "Became leader");

        let (tx, rx) = watch::channel(true);
        let task = tokio::spawn(self.clone().renew_until_lost(
            name.to_string(),
            identity.to_string(),
            tx,
        ));
        Ok(Leadership {
            held: rx,
            task: Some(task),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::{BoxFuture, FutureExt};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn record(holder: &str, renewed_secs_ago: i64) -> (LeaseRecord, DateTime<Utc>) {
        let now = Utc::now();
        let record = LeaseRecord {
            holder_identity: Some(holder.to_string()),
            lease_duration_seconds: Some(15),
            renew_time: Some(now - chrono::Duration::seconds(renewed_secs_ago)),
            ..Default::default()
        };
        (record, now)
    }

    #[test]
    fn test_lock_name_sanitizes_driver() {
        assert_eq!(
            lock_name(ATTACHER_LOCK_PREFIX, "csi/dummy"),
            "external-attacher-leader-csi-dummy"
        );
    }

    #[test]
    fn test_fresh_lease_of_other_holder_is_unavailable() {
        let (record, now) = record("other", 3);
        assert!(!lease_is_available(&record, "me", now, DEFAULT_LEASE_DURATION));
    }

    #[test]
    fn test_expired_lease_is_available() {
        let (record, now) = record("other", 20);
        assert!(lease_is_available(&record, "me", now, DEFAULT_LEASE_DURATION));
    }

    #[test]
    fn test_own_or_empty_lease_is_available() {
        let (record, now) = record("me", 1);
        assert!(lease_is_available(&record, "me", now, DEFAULT_LEASE_DURATION));
        assert!(lease_is_available(
            &LeaseRecord::default(),
            "me",
            now,
            DEFAULT_LEASE_DURATION
        ));
    }

    #[test]
    fn test_lease_spec_is_read_from_api_shape() {
        let lease: Lease = serde_json::from_value(json!({
            "metadata": {"name": "l"},
            "spec": {
                "holderIdentity": "node-a",
                "leaseDurationSeconds": 15,
                "renewTime": "2026-10-17T10:00:00.000000Z"
            }
        }))
        .unwrap();
        let record = LeaseRecord::from_lease(&lease).unwrap();
        assert_eq!(record.holder_identity.as_deref(), Some("node-a"));
        assert_eq!(record.lease_duration_seconds, Some(15));
        assert!(record.renew_time.is_some());
    }

    #[tokio::test]
    async fn test_leadership_lost_when_signal_drops() {
        let (tx, rx) = watch::channel(true);
        let leadership = Leadership::new(rx);
        assert!(leadership.is_held());
        let lost = leadership.lost_signal();
        tx.send(false).unwrap();
        lost.await;
        leadership.lost().await;
        assert!(!leadership.is_held());
    }

    fn renewals(
        outcomes: Vec<Option<Result<bool>>>,
    ) -> (Arc<AtomicUsize>, impl FnMut() -> BoxFuture<'static, Result<bool>>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let outcomes = Arc::new(std::sync::Mutex::new(outcomes.into_iter()));
        let renew = move || {
            counter.fetch_add(1, Ordering::SeqCst);
            let next = outcomes.lock().unwrap().next().flatten();
            async move {
                match next {
                    Some(outcome) => outcome,
                    None => std::future::pending().await,
                }
            }
            .boxed()
        };
        (calls, renew)
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_renewal_is_cut_off_before_lease_expires() {
        // renewed at 5s, the round started at 10s never answers
        let (calls, renew) = renewals(vec![Some(Ok(true))]);
        let started = Instant::now();

        keep_renewing("l", DEFAULT_RETRY_PERIOD, DEFAULT_RENEW_DEADLINE, renew).await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(15));
        assert!(elapsed < Duration::from_secs(5) + DEFAULT_LEASE_DURATION);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_renewals_give_up_at_renew_deadline() {
        let failure = || Some(Err(Error::InvalidObject("apiserver unavailable".into())));
        let (calls, renew) = renewals(vec![failure(), failure(), failure()]);
        let started = Instant::now();

        keep_renewing("l", DEFAULT_RETRY_PERIOD, DEFAULT_RENEW_DEADLINE, renew).await;

        // 5s fails, at 10s the deadline has passed without another attempt
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let elapsed = started.elapsed();
        assert!(elapsed >= DEFAULT_RENEW_DEADLINE && elapsed < DEFAULT_LEASE_DURATION);
    }

    #[tokio::test(start_paused = true)]
    async fn test_takeover_stops_renewing() {
        let (calls, renew) = renewals(vec![Some(Ok(true)), Some(Ok(false))]);

        keep_renewing("l", DEFAULT_RETRY_PERIOD, DEFAULT_RENEW_DEADLINE, renew).await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
