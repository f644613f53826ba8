//! Returning drives to a safe state and releasing the transport.

use crate::drive::{Cia402State, DriveClient, TransportError};
use crate::error::{ExecutionError, Stage};
use crate::model::{DeviceRef, Phase, RunEvent};
use futures::future::join_all;
use std::future::Future;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};

/// Run `op` on every device concurrently. Failures are reported one by one
/// and never stop the other attempts. Returns the number of failures.
async fn tolerate_each<'d, F, Fut>(
    devices: &'d [DeviceRef],
    events: &UnboundedSender<RunEvent>,
    stage: Stage,
    op: F,
) -> usize
where
    F: Fn(&'d DeviceRef) -> Fut,
    Fut: Future<Output = Result<(), TransportError>>,
{
    let results = join_all(devices.iter().map(&op)).await;

    let mut failures = 0;
    for (device, result) in devices.iter().zip(results) {
        if let Err(source) = result {
            let error = ExecutionError::drive(device, stage, source).chain();
            warn!(%device, %error, "cleanup failed");
            let _ = events.send(RunEvent::CleanupFailed {
                device: device.clone(),
                error,
            });
            failures += 1;
        }
    }
    failures
}

/// Quick-stop every device.
pub(crate) async fn quick_stop_all(
    client: &dyn DriveClient,
    devices: &[DeviceRef],
    events: &UnboundedSender<RunEvent>,
) -> usize {
    let _ = events.send(RunEvent::PhaseStarted {
        phase: Phase::QuickStop,
        label: None,
    });
    tolerate_each(devices, events, Stage::QuickStop, |d| client.quick_stop(d)).await
}

/// Transition every device to `ReadyToSwitchOn`, then close the transport.
///
/// Never fails: per-device errors are logged and reported as
/// [`RunEvent::CleanupFailed`]. The transport is closed regardless.
pub(crate) async fn shutdown(
    client: &dyn DriveClient,
    devices: &[DeviceRef],
    events: &UnboundedSender<RunEvent>,
) -> usize {
    let _ = events.send(RunEvent::PhaseStarted {
        phase: Phase::Shutdown,
        label: None,
    });

    let safe = Cia402State::ReadyToSwitchOn;
    let failures = tolerate_each(devices, events, Stage::Transition(safe), |d| {
        client.transition_to_state(d, safe)
    })
    .await;

    client.close();
    let _ = events.send(RunEvent::TransportClosed);
    info!(devices = devices.len(), failures, "drives released");
    failures
}
