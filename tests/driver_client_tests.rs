//! # Driver Client Tests
//!
//! Timeouts, create-volume retry and readiness probing of [`DriverClient`].
//! Time is paused, so the backoff schedule runs instantly.

mod common;

use common::{FakeDriver, DRIVER};
use csi_sidecar::controller::backoff::BackoffPolicy;
use csi_sidecar::driver::{
    CapacityRange, Code, CreateVolumeRequest, DriverClient, RpcStatus, Volume,
};
use csi_sidecar::Error;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const TIMEOUT: Duration = Duration::from_secs(15);

fn request() -> CreateVolumeRequest {
    CreateVolumeRequest {
        name: "pvc-1".to_string(),
        capacity_range: Some(CapacityRange {
            required_bytes: 1 << 30,
            limit_bytes: 0,
        }),
        ..Default::default()
    }
}

fn deadline() -> Result<Volume, RpcStatus> {
    Err(RpcStatus::new(Code::DeadlineExceeded, "context deadline exceeded"))
}

#[tokio::test(start_paused = true)]
async fn test_create_retries_deadline_until_schedule_exhausted() {
    let driver = Arc::new(FakeDriver::new(DRIVER));
    let policy = BackoffPolicy::default();
    for _ in 0..policy.steps {
        driver.script_create(deadline());
    }
    let client = DriverClient::new(driver.clone(), TIMEOUT);

    let started = Instant::now();
    let err = client.create_volume(&request()).await.unwrap_err();

    assert!(matches!(err, Error::TransientDriver(_)), "got {err:?}");
    assert_eq!(err.driver_code(), Some(Code::DeadlineExceeded));
    assert_eq!(driver.create_calls(), 10);
    assert!(started.elapsed() >= policy.total_delay());
    assert!(started.elapsed() < Duration::from_secs(110));
}

#[tokio::test(start_paused = true)]
async fn test_create_succeeds_after_timeouts() {
    let driver = Arc::new(FakeDriver::new(DRIVER));
    driver.script_create(deadline());
    driver.script_create(deadline());
    let client = DriverClient::new(driver.clone(), TIMEOUT);

    let started = Instant::now();
    let volume = client.create_volume(&request()).await.unwrap();

    assert_eq!(volume.volume_id, "vol-pvc-1");
    assert_eq!(volume.capacity_bytes, 1 << 30);
    assert_eq!(driver.create_calls(), 3);
    // 5s + 6s
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(11) && elapsed < Duration::from_secs(12));
}

#[tokio::test(start_paused = true)]
async fn test_create_other_error_is_not_retried() {
    let driver = Arc::new(FakeDriver::new(DRIVER));
    driver.script_create(Err(RpcStatus::new(Code::InvalidArgument, "bad parameters")));
    let client = DriverClient::new(driver.clone(), TIMEOUT);

    let err = client.create_volume(&request()).await.unwrap_err();

    assert!(matches!(err, Error::Operation(_)), "got {err:?}");
    assert_eq!(err.driver_code(), Some(Code::InvalidArgument));
    assert_eq!(driver.create_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_hanging_call_times_out_as_deadline_exceeded() {
    let driver = Arc::new(FakeDriver::new(DRIVER));
    driver.hang_create.store(true, Ordering::SeqCst);
    let client = DriverClient::new(driver.clone(), Duration::from_secs(2))
        .with_create_backoff(BackoffPolicy::new(Duration::from_secs(1), 2.0, 2));

    let started = Instant::now();
    let err = client.create_volume(&request()).await.unwrap_err();

    assert!(matches!(err, Error::TransientDriver(_)), "got {err:?}");
    assert_eq!(driver.create_calls(), 2);
    // two 2s timeouts plus one 1s delay
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(5) && elapsed < Duration::from_secs(6));
}

#[tokio::test(start_paused = true)]
async fn test_wait_for_ready_retries_probe() {
    let driver = Arc::new(FakeDriver::new(DRIVER));
    driver.script_probe(Err(RpcStatus::new(Code::Unavailable, "starting")));
    driver.script_probe(Err(RpcStatus::new(Code::Unavailable, "starting")));
    let client = DriverClient::new(driver.clone(), TIMEOUT);

    client
        .wait_for_driver_ready(Duration::from_secs(60))
        .await
        .unwrap();

    assert_eq!(driver.probes.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_wait_for_ready_gives_up_after_deadline() {
    let driver = Arc::new(FakeDriver::new(DRIVER));
    driver.ready.store(false, Ordering::SeqCst);
    let client = DriverClient::new(driver.clone(), TIMEOUT);

    let started = Instant::now();
    let err = client
        .wait_for_driver_ready(Duration::from_secs(5))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::DriverUnavailable(_)), "got {err:?}");
    assert!(started.elapsed() <= Duration::from_secs(5));
    assert!(driver.probes.load(Ordering::SeqCst) >= 5);
}

#[tokio::test]
async fn test_driver_name_from_identity_call() {
    let client = DriverClient::new(Arc::new(FakeDriver::new(DRIVER)), TIMEOUT);
    assert_eq!(client.driver_name().await.unwrap(), DRIVER);

    let unnamed = DriverClient::new(Arc::new(FakeDriver::new("")), TIMEOUT);
    assert!(matches!(
        unnamed.driver_name().await,
        Err(Error::Configuration(_))
    ));
}

#[tokio::test]
async fn test_single_attempt_operations_surface_driver_status() {
    let driver = Arc::new(FakeDriver::new(DRIVER));
    driver.script_delete(Err(RpcStatus::new(Code::DeadlineExceeded, "slow delete")));
    let client = DriverClient::new(driver.clone(), TIMEOUT);

    let err = client
        .delete_volume(&Default::default())
        .await
        .unwrap_err();

    // delete is never retried by the client, even on a deadline
    assert!(matches!(err, Error::Operation(_)), "got {err:?}");
    assert_eq!(driver.delete_calls(), 1);
}
