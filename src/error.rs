use crate::drive::{Cia402State, TransportError};
use crate::model::DeviceRef;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// What the engine was doing to a drive when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    SelectMode,
    Download,
    ApplySetPoint,
    AwaitTarget,
    Transition(Cia402State),
    QuickStop,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::SelectMode => f.write_str("mode selection"),
            Stage::Download => f.write_str("parameter download"),
            Stage::ApplySetPoint => f.write_str("setpoint commit"),
            Stage::AwaitTarget => f.write_str("target wait"),
            Stage::Transition(state) => write!(f, "transition to {state:?}"),
            Stage::QuickStop => f.write_str("quick stop"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("transport never became ready")]
    NotReady(#[source] TransportError),

    #[error("drive {device}: {stage} failed")]
    Drive {
        device: DeviceRef,
        stage: Stage,
        #[source]
        source: TransportError,
    },

    #[error("drive {device}: target not reached within {after:?}")]
    ArrivalTimeout { device: DeviceRef, after: Duration },

    #[error("run aborted by panic: {0}")]
    Panicked(String),
}

impl ExecutionError {
    pub fn drive(device: &DeviceRef, stage: Stage, source: TransportError) -> Self {
        ExecutionError::Drive {
            device: device.clone(),
            stage,
            source,
        }
    }

    /// The drive this failure is attributed to, if any.
    pub fn device(&self) -> Option<&DeviceRef> {
        match self {
            ExecutionError::Drive { device, .. } | ExecutionError::ArrivalTimeout { device, .. } => {
                Some(device)
            }
            ExecutionError::NotReady(_) | ExecutionError::Panicked(_) => None,
        }
    }

    /// Render the error followed by each of its sources.
    pub fn chain(&self) -> String {
        let mut text = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            text.push_str(": ");
            text.push_str(&cause.to_string());
            source = std::error::Error::source(cause);
        }
        text
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceListError {
    #[error("no device references given")]
    Empty,
    #[error("device reference {0:?} does not fit a 32-bit index")]
    OutOfRange(String),
    #[error("device {0} is listed more than once")]
    Duplicate(DeviceRef),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drive_error_names_device_and_stage() {
        let err = ExecutionError::drive(
            &DeviceRef::Index(2),
            Stage::Download,
            TransportError::Rejected("abort code 0x06090030".into()),
        );
        assert_eq!(err.to_string(), "drive 2: parameter download failed");
        assert_eq!(err.device(), Some(&DeviceRef::Index(2)));
        let source = std::error::Error::source(&err).map(ToString::to_string);
        assert_eq!(
            source.as_deref(),
            Some("request rejected by drive: abort code 0x06090030")
        );
        assert_eq!(
            err.chain(),
            "drive 2: parameter download failed: request rejected by drive: abort code 0x06090030"
        );
    }

    #[test]
    fn transition_stage_renders_target_state() {
        let stage = Stage::Transition(Cia402State::ReadyToSwitchOn);
        assert_eq!(stage.to_string(), "transition to ReadyToSwitchOn");
    }
}
