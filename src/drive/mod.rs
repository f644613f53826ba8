//! Drive communication seam.
//!
//! The engine only talks to drives through [`DriveClient`]. Connection setup,
//! request framing and the drive-side state machine live behind it.

pub mod sim;

use crate::model::DeviceRef;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// CiA 402 object dictionary entries used by the sequencer. All at subindex 0.
pub mod objects {
    pub const MODES_OF_OPERATION: u16 = 0x6060;
    pub const POSITION_WINDOW: u16 = 0x6067;
    pub const TARGET_POSITION: u16 = 0x607A;
    pub const PROFILE_VELOCITY: u16 = 0x6081;
    pub const PROFILE_ACCELERATION: u16 = 0x6083;
    pub const PROFILE_DECELERATION: u16 = 0x6084;

    /// Value of `MODES_OF_OPERATION` selecting profile position mode.
    pub const PROFILE_POSITION_MODE: i64 = 1;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Cia402State {
    NotReadyToSwitchOn,
    SwitchOnDisabled,
    ReadyToSwitchOn,
    SwitchedOn,
    OperationEnabled,
    QuickStopActive,
    FaultReactionActive,
    Fault,
}

/// One entry of a batched parameter download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParamWrite {
    pub device: DeviceRef,
    pub index: u16,
    pub subindex: u8,
    pub value: i64,
}

impl ParamWrite {
    pub fn new(device: &DeviceRef, index: u16, value: i64) -> Self {
        Self {
            device: device.clone(),
            index,
            subindex: 0,
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request rejected by drive: {0}")]
    Rejected(String),
    #[error("unknown device {0}")]
    UnknownDevice(DeviceRef),
    #[error("transport closed")]
    Closed,
    #[error("communication error: {0}")]
    Communication(String),
}

#[async_trait]
pub trait DriveClient: Send + Sync {
    /// Resolves once the transport can carry requests.
    async fn when_ready(&self) -> Result<(), TransportError>;

    async fn download(
        &self,
        device: &DeviceRef,
        index: u16,
        subindex: u8,
        value: i64,
    ) -> Result<(), TransportError>;

    /// Apply all writes together.
    async fn download_many(&self, writes: &[ParamWrite]) -> Result<(), TransportError>;

    /// Commit the downloaded setpoint so the drive starts moving.
    async fn apply_set_point(&self, device: &DeviceRef) -> Result<(), TransportError>;

    /// Resolves when the drive reports the target reached within its window.
    /// There is no timeout here; callers bound it if they need to.
    async fn when_target_reached(&self, device: &DeviceRef) -> Result<(), TransportError>;

    async fn transition_to_state(
        &self,
        device: &DeviceRef,
        state: Cia402State,
    ) -> Result<(), TransportError>;

    async fn quick_stop(&self, device: &DeviceRef) -> Result<(), TransportError>;

    /// Tear the connection down. Safe to call more than once.
    fn close(&self);
}
