//! Compiled-in motion programs.
//!
//! Everything here is built fresh by pure functions. Positions are encoder
//! counts for the two-joint leg rig: axis 1 is the upper joint and axis 2 the
//! lower one. The lower joint has the longer travel, so its velocity is scaled
//! up to keep both joints arriving together.

use crate::model::{
    HoldTimes, MotionDefaults, MotionStep, PassLayout, Program, Sequence, SequenceStep,
};
use clap::ValueEnum;
use serde::Serialize;
use std::time::Duration;

pub const UPPER_JOINT: u32 = 1;
pub const LOWER_JOINT: u32 = 2;

/// (upper joint, lower joint) target pair.
type Pose = (i32, i32);

const LOWER: Pose = (-505_000, 300_000);
const UPPER: Pose = (1_030_000, 2_900_000);
const SWING_RIGHT: Pose = (20_000, 1_050_000);
const SWING_MIDDLE: Pose = (1_400_000, 3_600_000);
const SWING_LEFT: Pose = (2_000_000, 4_620_000);
const JOG_RIGHT: Pose = (600_000, 1_980_000);

const SWING_RAMP: u32 = 200_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
pub enum ProgramKind {
    /// Start positions, the selected sequences and stop positions every pass.
    Cycle,
    /// Start positions once, then idle until stopped; quick-stops on exit.
    AscDemo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
pub enum SequenceKind {
    SlowUpDown,
    FastUpDown,
    SwingThrough,
    EasyJogging,
}

impl SequenceKind {
    pub fn build(self, swing_iterations: usize) -> Sequence {
        match self {
            SequenceKind::SlowUpDown => slow_up_down(),
            SequenceKind::FastUpDown => fast_up_down(),
            SequenceKind::SwingThrough => swing_through(swing_iterations),
            SequenceKind::EasyJogging => easy_jogging(swing_iterations),
        }
    }
}

fn scaled(value: u32, factor: f64) -> u32 {
    (f64::from(value) * factor).round() as u32
}

fn pose(upper: MotionStep, lower: MotionStep) -> SequenceStep {
    SequenceStep::new()
        .axis(UPPER_JOINT, upper)
        .axis(LOWER_JOINT, lower)
}

/// Both joints with the same velocity and nothing else overridden.
fn pose_at(target: Pose, velocity: u32) -> SequenceStep {
    pose(
        MotionStep::to(target.0).velocity(velocity),
        MotionStep::to(target.1).velocity(velocity),
    )
}

pub fn start_positions(kind: ProgramKind) -> Sequence {
    let seq = Sequence::new("start-positions")
        // lift leg
        .step(pose_at((-720_000, -200_000), 100_000))
        // set it down
        .step(pose_at((-710_000, -34_000), 100_000));
    match kind {
        ProgramKind::Cycle => seq,
        ProgramKind::AscDemo => seq.step(pose_at((1_300_000, 2_900_000), 100_000)),
    }
}

pub fn stop_positions() -> Sequence {
    Sequence::new("stop-positions")
        .step(pose_at((-710_000, -34_000), 100_000))
        .step(pose_at((-126_000, -200_000), 50_000))
        .step(pose_at((-126_000, -21_000), 50_000))
}

pub fn slow_up_down() -> Sequence {
    const VELOCITY: u32 = 100_000;
    let follow = |target: i32| {
        MotionStep::to(target)
            .velocity(scaled(VELOCITY, 1.7))
            .ramps(200_000)
    };

    (0..4).fold(
        Sequence::new("slow-up-down").step(pose_at(LOWER, VELOCITY)),
        |seq, _| {
            seq.step(pose(MotionStep::to(UPPER.0).velocity(VELOCITY), follow(UPPER.1)))
                .step(pose(MotionStep::to(LOWER.0).velocity(VELOCITY), follow(LOWER.1)))
        },
    )
}

pub fn fast_up_down() -> Sequence {
    const VELOCITY: u32 = 150_000;
    const RAMP: u32 = 800_000;
    const SCALE: f64 = 1.8;
    let lead = |target: i32| MotionStep::to(target).velocity(VELOCITY).ramps(RAMP);
    let follow = |target: i32| {
        MotionStep::to(target)
            .velocity(scaled(VELOCITY, SCALE))
            .ramps(scaled(RAMP, SCALE))
    };

    (0..2).fold(
        Sequence::new("fast-up-down").step(pose(
            lead(LOWER.0),
            MotionStep::to(LOWER.1)
                .velocity(VELOCITY)
                .ramps(scaled(RAMP, SCALE)),
        )),
        |seq, _| {
            seq.step(pose(lead(UPPER.0), follow(UPPER.1)))
                .step(pose(lead(LOWER.0), follow(LOWER.1)))
        },
    )
}

/// Shared shape of the swing and jogging sequences: lower → right, a repeated
/// middle/…/right loop, then back to lower.
fn swing(
    name: &str,
    velocity: u32,
    scale: f64,
    right: Pose,
    loop_poses: &[Pose],
    iterations: usize,
) -> Sequence {
    let lead = |target: i32| MotionStep::to(target).velocity(velocity).ramps(SWING_RAMP);
    let follow = |target: i32| {
        MotionStep::to(target)
            .velocity(scaled(velocity, scale))
            .ramps(SWING_RAMP)
    };
    let at = |p: Pose| pose(lead(p.0), follow(p.1));

    let mut seq = Sequence::new(name)
        .step(pose(lead(LOWER.0), lead(LOWER.1)))
        .step(at(right));
    for _ in 0..iterations {
        for p in loop_poses {
            seq = seq.step(at(*p));
        }
    }
    seq.step(at(LOWER))
}

pub fn swing_through(iterations: usize) -> Sequence {
    swing(
        "swing-through",
        50_000,
        2.0,
        SWING_RIGHT,
        &[SWING_MIDDLE, SWING_LEFT, SWING_RIGHT],
        iterations,
    )
}

pub fn easy_jogging(iterations: usize) -> Sequence {
    swing(
        "easy-jogging",
        50_000,
        2.2,
        JOG_RIGHT,
        &[SWING_MIDDLE, JOG_RIGHT],
        iterations,
    )
}

/// Default pauses. Nothing is held after the start-position move unless
/// `at_start` is overridden.
pub fn hold_times(kind: ProgramKind) -> HoldTimes {
    let base = HoldTimes {
        start: Duration::from_secs(10),
        at_start: Duration::ZERO,
        between_steps: Duration::ZERO,
        between_sequences: Duration::from_secs(5),
        between_cycles: Duration::from_secs(5),
        shutdown_timeout: Duration::ZERO,
    };
    match kind {
        ProgramKind::Cycle => base,
        ProgramKind::AscDemo => HoldTimes {
            start: Duration::from_millis(100),
            shutdown_timeout: Duration::from_secs(5),
            ..base
        },
    }
}

/// Sequences a program runs each pass when the operator does not choose.
pub fn default_sequences(kind: ProgramKind) -> &'static [SequenceKind] {
    match kind {
        ProgramKind::Cycle => &[SequenceKind::SlowUpDown],
        ProgramKind::AscDemo => &[],
    }
}

pub fn program(kind: ProgramKind, sequences: &[SequenceKind], swing_iterations: usize) -> Program {
    let layout = match kind {
        ProgramKind::Cycle => PassLayout {
            start_positions_every_pass: true,
            quick_stop_on_exit: false,
        },
        ProgramKind::AscDemo => PassLayout {
            start_positions_every_pass: false,
            quick_stop_on_exit: true,
        },
    };
    let stop_positions = match kind {
        ProgramKind::Cycle => stop_positions(),
        ProgramKind::AscDemo => Sequence::new("stop-positions"),
    };

    Program {
        name: match kind {
            ProgramKind::Cycle => "cycle".to_string(),
            ProgramKind::AscDemo => "asc-demo".to_string(),
        },
        defaults: MotionDefaults::default(),
        holds: hold_times(kind),
        start_positions: start_positions(kind),
        sequences: sequences
            .iter()
            .map(|s| s.build(swing_iterations))
            .collect(),
        stop_positions,
        layout,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DeviceRef;

    fn motion(step: &SequenceStep, axis: u32) -> MotionStep {
        *step.get(&DeviceRef::Index(axis)).unwrap()
    }

    #[test]
    fn slow_sequence_shape() {
        let seq = slow_up_down();
        assert_eq!(seq.len(), 9);
        assert!(seq.steps.iter().all(|s| s.iter().count() == 2));

        let first = &seq.steps[0];
        assert_eq!(motion(first, LOWER_JOINT), MotionStep::to(300_000).velocity(100_000));

        let up = &seq.steps[1];
        assert_eq!(motion(up, UPPER_JOINT), MotionStep::to(1_030_000).velocity(100_000));
        assert_eq!(
            motion(up, LOWER_JOINT),
            MotionStep::to(2_900_000).velocity(170_000).ramps(200_000)
        );
        assert_eq!(seq.steps[8], seq.steps[2]);
    }

    #[test]
    fn fast_sequence_scales_lower_joint_ramps() {
        let seq = fast_up_down();
        assert_eq!(seq.len(), 5);
        let first = motion(&seq.steps[0], LOWER_JOINT);
        assert_eq!(first.velocity, Some(150_000));
        assert_eq!(first.acceleration, Some(1_440_000));

        let up = motion(&seq.steps[1], LOWER_JOINT);
        assert_eq!(up.velocity, Some(270_000));
        assert_eq!(up.deceleration, Some(1_440_000));
        assert_eq!(motion(&seq.steps[1], UPPER_JOINT).acceleration, Some(800_000));
    }

    #[test]
    fn swing_and_jog_repeat_their_loop() {
        let swing = swing_through(2);
        assert_eq!(swing.len(), 2 + 2 * 3 + 1);
        assert_eq!(motion(&swing.steps[3], UPPER_JOINT).target, SWING_LEFT.0);
        assert_eq!(motion(&swing.steps[1], LOWER_JOINT).velocity, Some(100_000));

        let jog = easy_jogging(3);
        assert_eq!(jog.len(), 2 + 3 * 2 + 1);
        assert_eq!(motion(&jog.steps[1], LOWER_JOINT).velocity, Some(110_000));
        assert_eq!(motion(jog.steps.last().unwrap(), UPPER_JOINT).target, LOWER.0);

        assert_eq!(swing_through(0).len(), 3);
    }

    #[test]
    fn programs_differ_in_layout_and_holds() {
        let cycle = program(ProgramKind::Cycle, default_sequences(ProgramKind::Cycle), 2);
        assert!(cycle.layout.start_positions_every_pass);
        assert!(!cycle.layout.quick_stop_on_exit);
        assert_eq!(cycle.start_positions.len(), 2);
        assert_eq!(cycle.stop_positions.len(), 3);
        assert_eq!(cycle.sequences.len(), 1);
        assert_eq!(cycle.holds.start, Duration::from_secs(10));
        assert_eq!(cycle.holds.at_start, Duration::ZERO);

        let demo = program(ProgramKind::AscDemo, default_sequences(ProgramKind::AscDemo), 2);
        assert!(!demo.layout.start_positions_every_pass);
        assert!(demo.layout.quick_stop_on_exit);
        assert_eq!(demo.start_positions.len(), 3);
        assert!(demo.stop_positions.is_empty());
        assert!(demo.sequences.is_empty());
        assert_eq!(demo.holds.shutdown_timeout, Duration::from_secs(5));
    }

    #[test]
    fn builders_are_pure() {
        assert_eq!(slow_up_down(), slow_up_down());
        assert_eq!(
            program(ProgramKind::Cycle, &[SequenceKind::SwingThrough], 1),
            program(ProgramKind::Cycle, &[SequenceKind::SwingThrough], 1)
        );
    }
}
