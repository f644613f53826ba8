use super::MotionEngine;
use crate::drive::{objects, ParamWrite};
use crate::error::{ExecutionError, Stage};
use crate::model::{DeviceRef, MotionStep, ResolvedMotion};

/// The batched download for one move. Target goes last so the profile is in
/// place before the new position lands.
pub(crate) fn parameter_batch(device: &DeviceRef, motion: &ResolvedMotion) -> [ParamWrite; 5] {
    [
        ParamWrite::new(device, objects::PROFILE_VELOCITY, motion.velocity.into()),
        ParamWrite::new(device, objects::PROFILE_ACCELERATION, motion.acceleration.into()),
        ParamWrite::new(device, objects::PROFILE_DECELERATION, motion.deceleration.into()),
        ParamWrite::new(device, objects::POSITION_WINDOW, motion.window.into()),
        ParamWrite::new(device, objects::TARGET_POSITION, motion.target.into()),
    ]
}

impl MotionEngine<'_> {
    /// Download the merged profile, commit it and wait for arrival.
    pub async fn execute_step(
        &self,
        device: &DeviceRef,
        motion: &MotionStep,
    ) -> Result<(), ExecutionError> {
        let resolved = motion.resolve(&self.defaults);

        self.client
            .download_many(&parameter_batch(device, &resolved))
            .await
            .map_err(|e| ExecutionError::drive(device, Stage::Download, e))?;

        self.client
            .apply_set_point(device)
            .await
            .map_err(|e| ExecutionError::drive(device, Stage::ApplySetPoint, e))?;

        let arrival = self.client.when_target_reached(device);
        let reached = match self.arrival_timeout {
            None => arrival.await,
            Some(after) => tokio::time::timeout(after, arrival)
                .await
                .map_err(|_| ExecutionError::ArrivalTimeout {
                    device: device.clone(),
                    after,
                })?,
        };
        reached.map_err(|e| ExecutionError::drive(device, Stage::AwaitTarget, e))
    }
}
