//! Run lifecycle: initialize, loop passes until the gate closes, always release the drives.

use super::gate::PassGate;
use super::shutdown;
use crate::drive::DriveClient;
use crate::engine::{MotionEngine, SequenceReport};
use crate::error::ExecutionError;
use crate::model::{
    HoldReason, InfoEvent, PassReport, Phase, Program, RunConfig, RunEvent, Sequence,
};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;
use tracing::{debug, error, info};

/// Minimum pause after a pass that moved nothing, so an empty program does not spin.
const IDLE_PASS_FLOOR: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoopEnd {
    /// The gate said stop.
    Stopped,
    /// `max_passes` was reached.
    PassLimit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SessionSummary {
    pub passes: u64,
    pub end: LoopEnd,
}

async fn run_phase(
    engine: &MotionEngine<'_>,
    phase: Phase,
    sequence: &Sequence,
    inter_step_delay: Duration,
) -> Result<SequenceReport, ExecutionError> {
    if sequence.is_empty() {
        return Ok(SequenceReport::default());
    }
    engine.emit(RunEvent::PhaseStarted {
        phase,
        label: matches!(phase, Phase::Sequence).then(|| sequence.name.clone()),
    });
    engine.run_sequence(sequence, inter_step_delay).await
}

async fn move_to_start(
    engine: &MotionEngine<'_>,
    program: &Program,
) -> Result<SequenceReport, ExecutionError> {
    let report = run_phase(
        engine,
        Phase::StartPositions,
        &program.start_positions,
        program.holds.between_steps,
    )
    .await?;
    engine.hold(HoldReason::AtStart, program.holds.at_start).await;
    Ok(report)
}

/// One pass: optional start positions, every configured sequence, stop positions.
async fn run_pass(
    engine: &MotionEngine<'_>,
    program: &Program,
) -> Result<SequenceReport, ExecutionError> {
    let holds = &program.holds;
    let mut report = SequenceReport::default();

    if program.layout.start_positions_every_pass {
        report.absorb(move_to_start(engine, program).await?);
    }

    for sequence in &program.sequences {
        report.absorb(run_phase(engine, Phase::Sequence, sequence, holds.between_steps).await?);
        engine
            .hold(HoldReason::BetweenSequences, holds.between_sequences)
            .await;
    }

    // Stop positions pace themselves with the cycle hold.
    report.absorb(
        run_phase(
            engine,
            Phase::StopPositions,
            &program.stop_positions,
            holds.between_cycles,
        )
        .await?,
    );
    Ok(report)
}

fn utc_now() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "now".into())
}

/// Everything between opening and releasing the drives.
pub(crate) async fn run_session(
    engine: &MotionEngine<'_>,
    program: &Program,
    gate: &mut dyn PassGate,
    max_passes: Option<u64>,
) -> Result<SessionSummary, ExecutionError> {
    let holds = &program.holds;

    engine.emit(RunEvent::PhaseStarted {
        phase: Phase::Initialize,
        label: None,
    });
    engine.initialize().await?;
    engine.hold(HoldReason::Start, holds.start).await;

    if !program.layout.start_positions_every_pass {
        move_to_start(engine, program).await?;
    }

    let mut passes = 0u64;
    let end = loop {
        passes += 1;
        let started_utc = utc_now();
        let started = Instant::now();
        let report = run_pass(engine, program).await?;
        let elapsed = started.elapsed();
        debug!(pass = passes, commands = report.commands, ?elapsed, "pass finished");

        let idle = report.commands == 0;
        engine.emit(RunEvent::PassCompleted {
            report: Box::new(PassReport {
                pass: passes,
                started_utc,
                steps: report.steps,
                commands: report.commands,
                step_settle_ms: report
                    .settle
                    .iter()
                    .map(|d| d.as_secs_f64() * 1000.0)
                    .collect(),
                elapsed_ms: elapsed.as_millis() as u64,
            }),
        });

        if max_passes.is_some_and(|max| passes >= max) {
            break LoopEnd::PassLimit;
        }
        if idle {
            engine
                .hold(HoldReason::IdlePass, holds.between_cycles.max(IDLE_PASS_FLOOR))
                .await;
        }

        if let Some(message) = gate.prompt() {
            engine.emit(RunEvent::Prompt {
                message: message.to_string(),
            });
        }
        if !gate.should_continue().await {
            engine.emit(RunEvent::StopRequested { passes });
            break LoopEnd::Stopped;
        }
    };

    if program.layout.quick_stop_on_exit {
        let events = engine.events();
        shutdown::quick_stop_all(engine.client(), engine.devices(), events).await;
        engine
            .hold(HoldReason::ShutdownTimeout, holds.shutdown_timeout)
            .await;
    }

    Ok(SessionSummary { passes, end })
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Run `cfg.program` against `client` and release every drive afterwards,
/// whatever the outcome. A panic inside the session is reported as
/// [`ExecutionError::Panicked`] after cleanup.
pub(crate) async fn run_program(
    client: &dyn DriveClient,
    cfg: &RunConfig,
    gate: &mut dyn PassGate,
    event_tx: UnboundedSender<RunEvent>,
) -> Result<SessionSummary, ExecutionError> {
    let program = &cfg.program;
    let engine = MotionEngine::new(client, &cfg.devices, program.defaults, event_tx.clone())
        .with_arrival_timeout(cfg.arrival_timeout);

    info!(program = %program.name, devices = cfg.devices.len(), "run starting");
    let _ = event_tx.send(RunEvent::Info(InfoEvent::Starting {
        program: program.name.clone(),
        devices: cfg.devices.clone(),
    }));

    let outcome = AssertUnwindSafe(run_session(&engine, program, gate, cfg.max_passes))
        .catch_unwind()
        .await
        .unwrap_or_else(|payload| Err(ExecutionError::Panicked(panic_message(payload.as_ref()))));

    if let Err(e) = &outcome {
        error!(error = %e.chain(), "run aborted");
        let _ = event_tx.send(RunEvent::Info(InfoEvent::RunFailed(e.chain())));
    }

    shutdown::shutdown(client, &cfg.devices, &event_tx).await;
    outcome
}
