//! In-process drive bus.
//!
//! Models each axis as a position plus its downloaded object values. A committed
//! setpoint arrives after the trapezoidal profile time for the requested move,
//! less the in-position window. Every request is journaled, and faults can be
//! injected per device, which is what the engine tests lean on.

use super::{objects, Cia402State, DriveClient, ParamWrite, TransportError};
use crate::model::DeviceRef;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(not(test), allow(dead_code))]
pub enum Fault {
    NotReady,
    /// The `nth` (1-based) batched download touching `device` is refused.
    Download { device: DeviceRef, nth: usize },
    /// The `nth` (1-based) setpoint commit for `device` is refused.
    ApplySetPoint { device: DeviceRef, nth: usize },
    Transition { device: DeviceRef, state: Cia402State },
    QuickStop { device: DeviceRef },
    /// The drive never reports its target reached.
    Stall { device: DeviceRef },
}

/// A request as the bus saw it, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Download(ParamWrite),
    DownloadMany(Vec<ParamWrite>),
    ApplySetPoint(DeviceRef),
    TargetReached(DeviceRef),
    Transition(DeviceRef, Cia402State),
    QuickStop(DeviceRef),
    Close,
}

#[cfg(test)]
impl Op {
    pub fn device(&self) -> Option<&DeviceRef> {
        match self {
            Op::Download(w) => Some(&w.device),
            Op::DownloadMany(writes) => writes.first().map(|w| &w.device),
            Op::ApplySetPoint(d)
            | Op::TargetReached(d)
            | Op::Transition(d, _)
            | Op::QuickStop(d) => Some(d),
            Op::Close => None,
        }
    }
}

#[derive(Debug)]
struct SimAxis {
    position: i64,
    params: HashMap<u16, i64>,
    state: Cia402State,
    downloads: usize,
    set_points: usize,
    arrival: Option<Instant>,
}

impl SimAxis {
    fn new() -> Self {
        Self {
            position: 0,
            params: HashMap::new(),
            state: Cia402State::SwitchOnDisabled,
            downloads: 0,
            set_points: 0,
            arrival: None,
        }
    }

    fn param_u32(&self, index: u16) -> u32 {
        self.params
            .get(&index)
            .and_then(|v| u32::try_from(*v).ok())
            .unwrap_or(0)
    }
}

#[derive(Debug, Default)]
struct SimState {
    axes: HashMap<DeviceRef, SimAxis>,
    journal: Vec<Op>,
}

impl SimState {
    fn axis(&mut self, device: &DeviceRef) -> Result<&mut SimAxis, TransportError> {
        self.axes
            .get_mut(device)
            .ok_or_else(|| TransportError::UnknownDevice(device.clone()))
    }
}

pub struct SimBus {
    state: Mutex<SimState>,
    faults: Vec<Fault>,
    time_scale: f64,
    closed: AtomicBool,
}

impl SimBus {
    pub fn new(devices: impl IntoIterator<Item = DeviceRef>) -> Self {
        let axes = devices.into_iter().map(|d| (d, SimAxis::new())).collect();
        Self {
            state: Mutex::new(SimState {
                axes,
                journal: Vec::new(),
            }),
            faults: Vec::new(),
            time_scale: 1.0,
            closed: AtomicBool::new(false),
        }
    }

    /// Values above 1.0 make simulated moves finish faster.
    pub fn with_time_scale(mut self, scale: f64) -> Self {
        self.time_scale = scale;
        self
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    fn has_fault(&self, pred: impl Fn(&Fault) -> bool) -> bool {
        self.faults.iter().any(pred)
    }

    fn scaled(&self, d: Duration) -> Duration {
        if self.time_scale.is_finite() && self.time_scale > 0.0 {
            d.div_f64(self.time_scale)
        } else {
            d
        }
    }
}

/// Inspection and fault injection for tests.
#[cfg(test)]
impl SimBus {
    pub fn with_fault(mut self, fault: Fault) -> Self {
        self.faults.push(fault);
        self
    }

    pub fn journal(&self) -> Vec<Op> {
        self.lock().journal.clone()
    }

    pub fn position(&self, device: &DeviceRef) -> Option<i64> {
        self.lock().axes.get(device).map(|a| a.position)
    }

    pub fn state_of(&self, device: &DeviceRef) -> Option<Cia402State> {
        self.lock().axes.get(device).map(|a| a.state)
    }

    pub fn param(&self, device: &DeviceRef, index: u16) -> Option<i64> {
        self.lock()
            .axes
            .get(device)
            .and_then(|a| a.params.get(&index).copied())
    }
}

/// Time for a trapezoidal (or, for short moves, triangular) profile to cover `distance`.
pub fn move_duration(distance: u64, velocity: u32, acceleration: u32, deceleration: u32) -> Duration {
    if distance == 0 || velocity == 0 || acceleration == 0 || deceleration == 0 {
        return Duration::ZERO;
    }
    let s = distance as f64;
    let v = f64::from(velocity);
    let a = f64::from(acceleration);
    let d = f64::from(deceleration);

    let ramp_distance = v * v / (2.0 * a) + v * v / (2.0 * d);
    let secs = if s >= ramp_distance {
        v / a + v / d + (s - ramp_distance) / v
    } else {
        let peak = (2.0 * s * a * d / (a + d)).sqrt();
        peak / a + peak / d
    };
    Duration::from_secs_f64(secs)
}

#[async_trait]
impl DriveClient for SimBus {
    async fn when_ready(&self) -> Result<(), TransportError> {
        if self.has_fault(|f| matches!(f, Fault::NotReady)) {
            return Err(TransportError::Communication("bus did not come up".into()));
        }
        self.ensure_open()
    }

    async fn download(
        &self,
        device: &DeviceRef,
        index: u16,
        subindex: u8,
        value: i64,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut state = self.lock();
        state.journal.push(Op::Download(ParamWrite {
            device: device.clone(),
            index,
            subindex,
            value,
        }));
        state.axis(device)?.params.insert(index, value);
        Ok(())
    }

    async fn download_many(&self, writes: &[ParamWrite]) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut state = self.lock();
        state.journal.push(Op::DownloadMany(writes.to_vec()));

        let mut touched: Vec<&DeviceRef> = Vec::new();
        for w in writes {
            if !touched.contains(&&w.device) {
                touched.push(&w.device);
            }
        }
        for device in touched {
            let axis = state.axis(device)?;
            axis.downloads += 1;
            let nth = axis.downloads;
            if self.has_fault(|f| matches!(f, Fault::Download { device: d, nth: n } if d == device && *n == nth))
            {
                return Err(TransportError::Rejected(format!(
                    "download #{nth} to drive {device} refused"
                )));
            }
        }
        // Applied together: nothing is written unless every device accepted the batch.
        for w in writes {
            state.axis(&w.device)?.params.insert(w.index, w.value);
        }
        Ok(())
    }

    async fn apply_set_point(&self, device: &DeviceRef) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut state = self.lock();
        state.journal.push(Op::ApplySetPoint(device.clone()));
        let axis = state.axis(device)?;
        axis.set_points += 1;
        let nth = axis.set_points;
        if self.has_fault(|f| matches!(f, Fault::ApplySetPoint { device: d, nth: n } if d == device && *n == nth))
        {
            return Err(TransportError::Rejected(format!(
                "setpoint #{nth} on drive {device} refused"
            )));
        }

        let target = axis
            .params
            .get(&objects::TARGET_POSITION)
            .copied()
            .unwrap_or(axis.position);
        let window = u64::from(axis.param_u32(objects::POSITION_WINDOW));
        let travel = target.abs_diff(axis.position).saturating_sub(window);
        let profile = move_duration(
            travel,
            axis.param_u32(objects::PROFILE_VELOCITY),
            axis.param_u32(objects::PROFILE_ACCELERATION),
            axis.param_u32(objects::PROFILE_DECELERATION),
        );
        let duration = self.scaled(profile);
        axis.position = target;
        axis.arrival = Some(Instant::now() + duration);
        debug!(device = %device, target, ?duration, "simulated move started");
        Ok(())
    }

    async fn when_target_reached(&self, device: &DeviceRef) -> Result<(), TransportError> {
        self.ensure_open()?;
        if self.has_fault(|f| matches!(f, Fault::Stall { device: d } if d == device)) {
            debug!(device = %device, "drive stalled, target never reported");
            return std::future::pending().await;
        }
        let arrival = self.lock().axis(device)?.arrival.take();
        if let Some(at) = arrival {
            tokio::time::sleep_until(at).await;
        }
        self.lock().journal.push(Op::TargetReached(device.clone()));
        Ok(())
    }

    async fn transition_to_state(
        &self,
        device: &DeviceRef,
        target: Cia402State,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut state = self.lock();
        state.journal.push(Op::Transition(device.clone(), target));
        if self.has_fault(|f| matches!(f, Fault::Transition { device: d, state: s } if d == device && *s == target))
        {
            return Err(TransportError::Rejected(format!(
                "drive {device} refused transition to {target:?}"
            )));
        }
        let axis = state.axis(device)?;
        debug!(device = %device, from = ?axis.state, to = ?target, "simulated state transition");
        axis.state = target;
        Ok(())
    }

    async fn quick_stop(&self, device: &DeviceRef) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut state = self.lock();
        state.journal.push(Op::QuickStop(device.clone()));
        if self.has_fault(|f| matches!(f, Fault::QuickStop { device: d } if d == device)) {
            return Err(TransportError::Rejected(format!(
                "drive {device} refused quick stop"
            )));
        }
        let axis = state.axis(device)?;
        axis.state = Cia402State::QuickStopActive;
        axis.arrival = None;
        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::Relaxed) {
            self.lock().journal.push(Op::Close);
        }
    }
}
