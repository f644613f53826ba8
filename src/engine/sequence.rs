use super::MotionEngine;
use crate::error::ExecutionError;
use crate::model::{HoldReason, RunEvent, Sequence};
use futures::future::try_join_all;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// What one sequence run did.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct SequenceReport {
    pub steps: usize,
    /// Individual axis moves issued.
    pub commands: usize,
    /// Time from first dispatch to the slowest arrival, per step.
    pub settle: Vec<Duration>,
}

impl SequenceReport {
    pub fn absorb(&mut self, other: SequenceReport) {
        self.steps += other.steps;
        self.commands += other.commands;
        self.settle.extend(other.settle);
    }
}

impl MotionEngine<'_> {
    /// Run every step of `sequence` in order.
    ///
    /// Within a step, each device that has an entry is moved concurrently and
    /// the step ends only once all of them have arrived. Devices without an
    /// entry are left alone. The first failure abandons the moves still in
    /// flight and aborts the remaining steps.
    pub async fn run_sequence(
        &self,
        sequence: &Sequence,
        inter_step_delay: Duration,
    ) -> Result<SequenceReport, ExecutionError> {
        let mut report = SequenceReport::default();
        let total = sequence.len();

        for (index, step) in sequence.steps.iter().enumerate() {
            self.emit(RunEvent::StepStarted {
                sequence: sequence.name.clone(),
                index,
                total,
            });

            let dispatched: Vec<_> = self
                .devices
                .iter()
                .filter_map(|device| step.get(device).map(|motion| (device, motion)))
                .collect();
            for (device, _) in step.iter().filter(|(d, _)| !self.devices.contains(*d)) {
                debug!(
                    %device,
                    sequence = %sequence.name,
                    step = index,
                    "not in the device set, skipped"
                );
            }
            for (device, motion) in &dispatched {
                self.emit(RunEvent::AxisCommanded {
                    device: (*device).clone(),
                    motion: **motion,
                });
            }

            let started = Instant::now();
            try_join_all(
                dispatched
                    .iter()
                    .map(|(device, motion)| self.execute_step(device, motion)),
            )
            .await
            .map_err(|e| self.report_failure(e))?;
            let elapsed = started.elapsed();

            report.steps += 1;
            report.commands += dispatched.len();
            report.settle.push(elapsed);
            self.emit(RunEvent::StepCompleted {
                sequence: sequence.name.clone(),
                index,
                total,
                elapsed,
            });

            self.hold(HoldReason::BetweenSteps, inter_step_delay).await;
        }

        Ok(report)
    }
}
