use crate::error::DeviceListError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Names one drive on the bus: either its position in the device list or an opaque id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DeviceRef {
    Index(u32),
    Name(String),
}

impl DeviceRef {
    /// Purely numeric input becomes an index, anything else is kept as a name.
    pub fn parse(raw: &str) -> Result<Self, DeviceListError> {
        if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) {
            raw.parse::<u32>()
                .map(DeviceRef::Index)
                .map_err(|_| DeviceListError::OutOfRange(raw.to_string()))
        } else {
            Ok(DeviceRef::Name(raw.to_string()))
        }
    }
}

impl fmt::Display for DeviceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceRef::Index(i) => write!(f, "{i}"),
            DeviceRef::Name(n) => f.write_str(n),
        }
    }
}

impl From<u32> for DeviceRef {
    fn from(index: u32) -> Self {
        DeviceRef::Index(index)
    }
}

impl From<&str> for DeviceRef {
    fn from(name: &str) -> Self {
        DeviceRef::Name(name.to_string())
    }
}

/// Parse the operator-supplied, comma-separated device list.
pub fn parse_device_list(raw: &str) -> Result<Vec<DeviceRef>, DeviceListError> {
    let mut devices: Vec<DeviceRef> = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let device = DeviceRef::parse(part)?;
        if devices.contains(&device) {
            return Err(DeviceListError::Duplicate(device));
        }
        devices.push(device);
    }
    if devices.is_empty() {
        return Err(DeviceListError::Empty);
    }
    Ok(devices)
}

/// One axis's move within one step. Anything left `None` falls back to
/// [`MotionDefaults`] when the step is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MotionStep {
    pub target: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub velocity: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acceleration: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deceleration: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<u32>,
}

impl MotionStep {
    pub fn to(target: i32) -> Self {
        Self {
            target,
            velocity: None,
            acceleration: None,
            deceleration: None,
            window: None,
        }
    }

    pub fn velocity(mut self, velocity: u32) -> Self {
        self.velocity = Some(velocity);
        self
    }

    pub fn acceleration(mut self, acceleration: u32) -> Self {
        self.acceleration = Some(acceleration);
        self
    }

    pub fn deceleration(mut self, deceleration: u32) -> Self {
        self.deceleration = Some(deceleration);
        self
    }

    /// Same value for acceleration and deceleration.
    pub fn ramps(self, rate: u32) -> Self {
        self.acceleration(rate).deceleration(rate)
    }

    #[cfg(test)]
    pub fn window(mut self, window: u32) -> Self {
        self.window = Some(window);
        self
    }

    pub fn resolve(&self, defaults: &MotionDefaults) -> ResolvedMotion {
        ResolvedMotion {
            target: self.target,
            velocity: self.velocity.unwrap_or(defaults.velocity),
            acceleration: self.acceleration.unwrap_or(defaults.acceleration),
            deceleration: self.deceleration.unwrap_or(defaults.deceleration),
            window: self.window.unwrap_or(defaults.window),
        }
    }
}

/// Process-wide fallback profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MotionDefaults {
    pub velocity: u32,
    pub acceleration: u32,
    pub deceleration: u32,
    pub window: u32,
}

impl Default for MotionDefaults {
    fn default() -> Self {
        Self {
            velocity: 100_000,
            acceleration: 120_000,
            deceleration: 120_000,
            window: 200_000,
        }
    }
}

/// A [`MotionStep`] with every field filled in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedMotion {
    pub target: i32,
    pub velocity: u32,
    pub acceleration: u32,
    pub deceleration: u32,
    pub window: u32,
}

/// Ordered device → motion association for one step. Keys are unique;
/// inserting an existing device replaces its entry in place.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SequenceStep {
    axes: Vec<(DeviceRef, MotionStep)>,
}

impl SequenceStep {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn axis(mut self, device: impl Into<DeviceRef>, motion: MotionStep) -> Self {
        self.insert(device.into(), motion);
        self
    }

    pub fn insert(&mut self, device: DeviceRef, motion: MotionStep) -> Option<MotionStep> {
        match self.axes.iter_mut().find(|(d, _)| *d == device) {
            Some((_, slot)) => Some(std::mem::replace(slot, motion)),
            None => {
                self.axes.push((device, motion));
                None
            }
        }
    }

    pub fn get(&self, device: &DeviceRef) -> Option<&MotionStep> {
        self.axes.iter().find(|(d, _)| d == device).map(|(_, m)| m)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DeviceRef, &MotionStep)> {
        self.axes.iter().map(|(d, m)| (d, m))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Sequence {
    pub name: String,
    pub steps: Vec<SequenceStep>,
}

impl Sequence {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    pub fn step(mut self, step: SequenceStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Pauses applied by the pass schedule. Zero means no pause.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoldTimes {
    #[serde(with = "humantime_serde")]
    pub start: Duration,
    #[serde(with = "humantime_serde")]
    pub at_start: Duration,
    #[serde(with = "humantime_serde")]
    pub between_steps: Duration,
    #[serde(with = "humantime_serde")]
    pub between_sequences: Duration,
    #[serde(with = "humantime_serde")]
    pub between_cycles: Duration,
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

/// Where the start-position move sits and what happens when the loop ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassLayout {
    /// Run the start positions at the top of every pass instead of once before the loop.
    pub start_positions_every_pass: bool,
    /// Quick-stop every drive once the loop exits normally.
    pub quick_stop_on_exit: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Program {
    pub name: String,
    pub defaults: MotionDefaults,
    pub holds: HoldTimes,
    pub start_positions: Sequence,
    pub sequences: Vec<Sequence>,
    pub stop_positions: Sequence,
    pub layout: PassLayout,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunConfig {
    pub devices: Vec<DeviceRef>,
    pub program: Program,
    #[serde(with = "humantime_serde")]
    pub arrival_timeout: Option<Duration>,
    pub max_passes: Option<u64>,
    pub sim_time_scale: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Initialize,
    StartPositions,
    Sequence,
    StopPositions,
    QuickStop,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HoldReason {
    Start,
    AtStart,
    BetweenSteps,
    BetweenSequences,
    BetweenCycles,
    ShutdownTimeout,
    IdlePass,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RunEvent {
    PhaseStarted {
        phase: Phase,
        label: Option<String>,
    },
    Hold {
        reason: HoldReason,
        #[serde(with = "humantime_serde")]
        duration: Duration,
    },
    StepStarted {
        sequence: String,
        index: usize,
        total: usize,
    },
    AxisCommanded {
        device: DeviceRef,
        motion: MotionStep,
    },
    AxisFailed {
        device: DeviceRef,
        error: String,
    },
    StepCompleted {
        sequence: String,
        index: usize,
        total: usize,
        #[serde(with = "humantime_serde")]
        elapsed: Duration,
    },
    PassCompleted {
        // Boxed to keep the common events small.
        report: Box<PassReport>,
    },
    Prompt {
        message: String,
    },
    StopRequested {
        passes: u64,
    },
    CleanupFailed {
        device: DeviceRef,
        error: String,
    },
    TransportClosed,
    Info(InfoEvent),
}

impl RunEvent {
    /// Render a human-readable progress line.
    pub fn to_message(&self) -> String {
        match self {
            RunEvent::PhaseStarted { phase, label } => match (phase, label) {
                (Phase::Sequence, Some(name)) => format!("== Sequence {name} =="),
                (phase, _) => format!("== {phase:?} =="),
            },
            RunEvent::Hold { reason, duration } => {
                format!(
                    "Holding {} ({reason:?})",
                    humantime::format_duration(*duration)
                )
            }
            RunEvent::StepStarted {
                sequence,
                index,
                total,
            } => format!("--- {sequence}: step {} / {total} ---", index + 1),
            RunEvent::AxisCommanded { device, motion } => {
                let opt = |v: Option<u32>| v.map_or_else(|| "default".to_string(), |v| v.to_string());
                format!(
                    "[Drive {device}] target {}, v={}, a={}, d={}",
                    motion.target,
                    opt(motion.velocity),
                    opt(motion.acceleration),
                    opt(motion.deceleration)
                )
            }
            RunEvent::AxisFailed { device, error } => format!("[Drive {device}] failed: {error}"),
            RunEvent::StepCompleted {
                sequence,
                index,
                elapsed,
                ..
            } => format!(
                "{sequence}: step {} done in {:.2} s",
                index + 1,
                elapsed.as_secs_f64()
            ),
            RunEvent::PassCompleted { report } => format!("Pass {} completed", report.pass),
            RunEvent::Prompt { message } => message.clone(),
            RunEvent::StopRequested { passes } => {
                format!("Stop requested, ending after {passes} pass(es)")
            }
            RunEvent::CleanupFailed { device, error } => {
                format!("[Drive {device}] could not be returned to a safe state: {error}")
            }
            RunEvent::TransportClosed => "Transport closed".to_string(),
            RunEvent::Info(info) => info.to_message(),
        }
    }
}

/// Free-form status emitted outside the step loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum InfoEvent {
    Message(String),
    Starting { program: String, devices: Vec<DeviceRef> },
    DrivesEnabled,
    RunFailed(String),
}

impl InfoEvent {
    pub fn to_message(&self) -> String {
        match self {
            InfoEvent::Message(msg) => msg.clone(),
            InfoEvent::Starting { program, devices } => {
                let list: Vec<String> = devices.iter().map(ToString::to_string).collect();
                format!("Starting program {program} for drives: {}", list.join(", "))
            }
            InfoEvent::DrivesEnabled => "All drives enabled".to_string(),
            InfoEvent::RunFailed(e) => format!("Run failed: {e}"),
        }
    }
}

/// Outcome of one completed pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassReport {
    pub pass: u64,
    pub started_utc: String,
    pub steps: usize,
    pub commands: usize,
    pub step_settle_ms: Vec<f64>,
    pub elapsed_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_list_parses_numbers_and_names() {
        let devices = parse_device_list(" 1, 2 ,,axis-x,0x12 ").unwrap();
        assert_eq!(
            devices,
            vec![
                DeviceRef::Index(1),
                DeviceRef::Index(2),
                DeviceRef::Name("axis-x".into()),
                DeviceRef::Name("0x12".into()),
            ]
        );
    }

    #[test]
    fn device_list_rejects_empty_duplicates_and_overflow() {
        assert_eq!(parse_device_list(" , ,"), Err(DeviceListError::Empty));
        assert_eq!(
            parse_device_list("1,2,1"),
            Err(DeviceListError::Duplicate(DeviceRef::Index(1)))
        );
        assert_eq!(
            parse_device_list("99999999999"),
            Err(DeviceListError::OutOfRange("99999999999".into()))
        );
    }

    #[test]
    fn resolve_prefers_step_values_over_defaults() {
        let defaults = MotionDefaults::default();
        let bare = MotionStep::to(100).resolve(&defaults);
        assert_eq!(
            bare,
            ResolvedMotion {
                target: 100,
                velocity: 100_000,
                acceleration: 120_000,
                deceleration: 120_000,
                window: 200_000,
            }
        );

        let full = MotionStep::to(-5)
            .velocity(1)
            .acceleration(2)
            .deceleration(3)
            .window(4)
            .resolve(&defaults);
        assert_eq!(
            full,
            ResolvedMotion {
                target: -5,
                velocity: 1,
                acceleration: 2,
                deceleration: 3,
                window: 4,
            }
        );
    }

    #[test]
    fn step_keys_stay_unique_and_ordered() {
        let mut step = SequenceStep::new()
            .axis(2, MotionStep::to(20))
            .axis("x", MotionStep::to(30));
        let old = step.insert(DeviceRef::Index(2), MotionStep::to(21));

        assert_eq!(old, Some(MotionStep::to(20)));
        assert_eq!(step.iter().count(), 2);
        let order: Vec<&DeviceRef> = step.iter().map(|(d, _)| d).collect();
        assert_eq!(order, vec![&DeviceRef::Index(2), &DeviceRef::from("x")]);
        assert_eq!(step.get(&DeviceRef::Index(2)).unwrap().target, 21);
        assert!(step.get(&DeviceRef::Index(1)).is_none());
    }

    #[test]
    fn axis_line_marks_defaulted_fields() {
        let ev = RunEvent::AxisCommanded {
            device: DeviceRef::Index(1),
            motion: MotionStep::to(-720_000).velocity(100_000),
        };
        assert_eq!(
            ev.to_message(),
            "[Drive 1] target -720000, v=100000, a=default, d=default"
        );
    }
}
