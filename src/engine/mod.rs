mod sequence;
mod step;

pub(crate) use sequence::SequenceReport;

use crate::drive::{objects, Cia402State, DriveClient};
use crate::error::{ExecutionError, Stage};
use crate::model::{DeviceRef, HoldReason, InfoEvent, MotionDefaults, RunEvent};
use futures::future::try_join_all;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;

/// Executes motion against a fixed device set through one shared client.
pub struct MotionEngine<'a> {
    client: &'a dyn DriveClient,
    devices: &'a [DeviceRef],
    defaults: MotionDefaults,
    arrival_timeout: Option<Duration>,
    event_tx: mpsc::UnboundedSender<RunEvent>,
}

impl<'a> MotionEngine<'a> {
    pub fn new(
        client: &'a dyn DriveClient,
        devices: &'a [DeviceRef],
        defaults: MotionDefaults,
        event_tx: mpsc::UnboundedSender<RunEvent>,
    ) -> Self {
        Self {
            client,
            devices,
            defaults,
            arrival_timeout: None,
            event_tx,
        }
    }

    /// Bound the target-reached wait. Without this a drive that never reports
    /// arrival blocks the run indefinitely.
    pub fn with_arrival_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.arrival_timeout = timeout;
        self
    }

    pub fn devices(&self) -> &'a [DeviceRef] {
        self.devices
    }

    pub fn client(&self) -> &'a dyn DriveClient {
        self.client
    }

    pub(crate) fn events(&self) -> &mpsc::UnboundedSender<RunEvent> {
        &self.event_tx
    }

    pub(crate) fn emit(&self, event: RunEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Wait for the transport, select profile position mode and enable every drive.
    pub async fn initialize(&self) -> Result<(), ExecutionError> {
        self.client
            .when_ready()
            .await
            .map_err(ExecutionError::NotReady)?;

        self.on_every_device(|device| async move {
            self.client
                .download(
                    device,
                    objects::MODES_OF_OPERATION,
                    0,
                    objects::PROFILE_POSITION_MODE,
                )
                .await
                .map_err(|e| ExecutionError::drive(device, Stage::SelectMode, e))
        })
        .await?;

        let enabled = Cia402State::OperationEnabled;
        self.on_every_device(|device| async move {
            self.client
                .transition_to_state(device, enabled)
                .await
                .map_err(|e| ExecutionError::drive(device, Stage::Transition(enabled), e))
        })
        .await?;

        self.emit(RunEvent::Info(InfoEvent::DrivesEnabled));
        Ok(())
    }

    /// Sleep for `duration` unless it is zero.
    pub async fn hold(&self, reason: HoldReason, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        self.emit(RunEvent::Hold { reason, duration });
        tokio::time::sleep(duration).await;
    }

    /// Run `op` for every device concurrently. The first failure ends the
    /// batch; drives still in flight are dropped.
    async fn on_every_device<'s, F, Fut>(&'s self, op: F) -> Result<(), ExecutionError>
    where
        F: Fn(&'a DeviceRef) -> Fut,
        Fut: Future<Output = Result<(), ExecutionError>> + 's,
    {
        try_join_all(self.devices.iter().map(op))
            .await
            .map_err(|e| self.report_failure(e))?;
        Ok(())
    }

    /// Emit `AxisFailed` for a drive-level error and hand it back.
    pub(crate) fn report_failure(&self, err: ExecutionError) -> ExecutionError {
        if let Some(device) = err.device() {
            self.emit(RunEvent::AxisFailed {
                device: device.clone(),
                error: err.chain(),
            });
        }
        err
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::drive::sim::{Fault, Op, SimBus};

    pub(crate) fn devices(ids: &[u32]) -> Vec<DeviceRef> {
        ids.iter().copied().map(DeviceRef::Index).collect()
    }

    #[tokio::test]
    async fn initialize_selects_mode_then_enables() {
        let devs = devices(&[1, 2]);
        let bus = SimBus::new(devs.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = MotionEngine::new(&bus, &devs, MotionDefaults::default(), tx);

        engine.initialize().await.unwrap();

        let journal = bus.journal();
        assert_eq!(journal.len(), 4);
        assert!(journal[..2].iter().all(|op| matches!(
            op,
            Op::Download(w) if w.index == objects::MODES_OF_OPERATION && w.value == 1
        )));
        assert!(journal[2..]
            .iter()
            .all(|op| matches!(op, Op::Transition(_, Cia402State::OperationEnabled))));
        assert!(matches!(
            rx.try_recv(),
            Ok(RunEvent::Info(InfoEvent::DrivesEnabled))
        ));
    }

    #[tokio::test]
    async fn initialize_fails_when_transport_not_ready() {
        let devs = devices(&[1]);
        let bus = SimBus::new(devs.clone()).with_fault(Fault::NotReady);
        let (tx, _rx) = mpsc::unbounded_channel();
        let engine = MotionEngine::new(&bus, &devs, MotionDefaults::default(), tx);

        let err = engine.initialize().await.unwrap_err();
        assert!(matches!(err, ExecutionError::NotReady(_)));
        assert!(bus.journal().is_empty());
    }

    #[tokio::test]
    async fn enable_failure_is_reported_once_and_ends_initialization() {
        let devs = devices(&[1, 2, 3]);
        let bus = SimBus::new(devs.clone()).with_fault(Fault::Transition {
            device: DeviceRef::Index(2),
            state: Cia402State::OperationEnabled,
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = MotionEngine::new(&bus, &devs, MotionDefaults::default(), tx);

        let err = engine.initialize().await.unwrap_err();
        assert_eq!(err.device(), Some(&DeviceRef::Index(2)));
        assert!(matches!(
            err,
            ExecutionError::Drive {
                stage: Stage::Transition(Cia402State::OperationEnabled),
                ..
            }
        ));
        assert_eq!(bus.state_of(&DeviceRef::Index(1)), Some(Cia402State::OperationEnabled));
        assert_ne!(bus.state_of(&DeviceRef::Index(2)), Some(Cia402State::OperationEnabled));

        let events: Vec<RunEvent> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        let failed = events
            .iter()
            .filter(|e| matches!(e, RunEvent::AxisFailed { device, .. } if *device == DeviceRef::Index(2)))
            .count();
        assert_eq!(failed, 1);
        assert!(!events
            .iter()
            .any(|e| matches!(e, RunEvent::Info(InfoEvent::DrivesEnabled))));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_hold_does_not_sleep_or_emit() {
        let devs = devices(&[1]);
        let bus = SimBus::new(devs.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = MotionEngine::new(&bus, &devs, MotionDefaults::default(), tx);

        let start = tokio::time::Instant::now();
        engine.hold(HoldReason::BetweenSteps, Duration::ZERO).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(rx.try_recv().is_err());

        engine.hold(HoldReason::BetweenCycles, Duration::from_secs(5)).await;
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert!(matches!(
            rx.try_recv(),
            Ok(RunEvent::Hold {
                reason: HoldReason::BetweenCycles,
                ..
            })
        ));
    }
}
