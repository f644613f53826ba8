use crate::catalog::{self, ProgramKind, SequenceKind};
use crate::drive::sim::SimBus;
use crate::model::{parse_device_list, RunConfig, RunEvent};
use crate::orchestrator::{gate, run_program, LoopEnd};
use anyhow::{bail, Context, Result};
use clap::Parser;
use std::io::Write;
use tokio::sync::mpsc;

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
/// `raw` terminates lines with `\r\n` for a terminal in raw mode.
fn spawn_output_writer(
    raw: bool,
) -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let eol = if raw { "\r\n" } else { "\n" };
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = write!(out, "{msg}{eol}");
                }
                OutputLine::Stderr(msg) => {
                    let _ = write!(err, "{msg}{eol}");
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "drive-sequencer",
    version,
    about = "Run compiled-in multi-axis motion sequences on CiA 402 drives"
)]
pub struct Cli {
    /// Comma-separated drive references; numbers are bus indices, anything else a name
    #[arg(long)]
    pub devices: String,

    /// Compiled-in program to run
    #[arg(long, value_enum, default_value_t = ProgramKind::Cycle)]
    pub program: ProgramKind,

    /// Sequences to run each pass (comma-separated); defaults depend on the program
    #[arg(long, value_enum, value_delimiter = ',')]
    pub sequences: Vec<SequenceKind>,

    /// Loop repetitions inside the swing-through and easy-jogging sequences
    #[arg(long, default_value_t = 2)]
    pub swing_iterations: usize,

    /// Pause after the drives are enabled
    #[arg(long)]
    pub start_hold: Option<humantime::Duration>,

    /// Pause after the start-position move
    #[arg(long)]
    pub at_start_hold: Option<humantime::Duration>,

    /// Pause between steps of a sequence
    #[arg(long)]
    pub step_hold: Option<humantime::Duration>,

    /// Pause after each sequence
    #[arg(long)]
    pub sequence_hold: Option<humantime::Duration>,

    /// Pause between stop-position steps, and after a pass that moved nothing
    #[arg(long)]
    pub cycle_hold: Option<humantime::Duration>,

    /// Pause after the exit quick stop, before drives are released
    #[arg(long)]
    pub shutdown_hold: Option<humantime::Duration>,

    /// Give up on a drive that has not reported arrival within this time (default: wait forever)
    #[arg(long)]
    pub arrival_timeout: Option<humantime::Duration>,

    /// Speed factor for the simulated bus; 10 makes moves finish ten times faster
    #[arg(long, default_value_t = 1.0)]
    pub sim_time_scale: f64,

    /// Stop after this many passes even if nobody presses a key
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    pub max_passes: Option<u64>,

    /// Print the resolved run configuration as JSON and exit without touching drives
    #[arg(long)]
    pub print_plan: bool,

    /// Emit run events as JSON lines on stdout
    #[arg(long)]
    pub json: bool,

    /// Run silently: suppress all output except errors
    #[arg(long)]
    pub silent: bool,

    /// Debug-level diagnostics on stderr
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Text,
    Json,
    Silent,
}

impl OutputMode {
    fn from_args(args: &Cli) -> Self {
        if args.silent {
            OutputMode::Silent
        } else if args.json {
            OutputMode::Json
        } else {
            OutputMode::Text
        }
    }
}

/// Build a `RunConfig` from CLI arguments.
pub fn build_config(args: &Cli) -> Result<RunConfig> {
    let devices = parse_device_list(&args.devices).context("invalid --devices")?;

    if !(args.sim_time_scale.is_finite() && args.sim_time_scale > 0.0) {
        bail!(
            "--sim-time-scale must be a positive number, got {}",
            args.sim_time_scale
        );
    }

    let sequences = if args.sequences.is_empty() {
        catalog::default_sequences(args.program)
    } else {
        args.sequences.as_slice()
    };
    let mut program = catalog::program(args.program, sequences, args.swing_iterations);

    let holds = &mut program.holds;
    let overrides = [
        (&args.start_hold, &mut holds.start),
        (&args.at_start_hold, &mut holds.at_start),
        (&args.step_hold, &mut holds.between_steps),
        (&args.sequence_hold, &mut holds.between_sequences),
        (&args.cycle_hold, &mut holds.between_cycles),
        (&args.shutdown_hold, &mut holds.shutdown_timeout),
    ];
    for (flag, slot) in overrides {
        if let Some(d) = flag {
            *slot = **d;
        }
    }

    Ok(RunConfig {
        devices,
        program,
        arrival_timeout: args.arrival_timeout.as_deref().copied(),
        max_passes: args.max_passes,
        sim_time_scale: args.sim_time_scale,
    })
}

/// Turn run events into output lines for the selected mode.
async fn render_events(
    mut evt_rx: mpsc::UnboundedReceiver<RunEvent>,
    out_tx: mpsc::UnboundedSender<OutputLine>,
    mode: OutputMode,
) {
    while let Some(ev) = evt_rx.recv().await {
        match mode {
            // All events are silently consumed - no output
            OutputMode::Silent => {}
            OutputMode::Json => match serde_json::to_string(&ev) {
                Ok(line) => {
                    let _ = out_tx.send(OutputLine::Stdout(line));
                }
                Err(e) => tracing::warn!(error = %e, "event not serializable"),
            },
            OutputMode::Text => match &ev {
                RunEvent::PassCompleted { report } => {
                    let _ = out_tx.send(OutputLine::Stderr(ev.to_message()));
                    for line in crate::text_summary::build_pass_summary(report).lines {
                        let _ = out_tx.send(OutputLine::Stdout(line));
                    }
                }
                _ => {
                    let _ = out_tx.send(OutputLine::Stderr(ev.to_message()));
                }
            },
        }
    }
}

pub async fn run(args: Cli) -> Result<()> {
    if args.silent && args.json {
        bail!("--silent and --json cannot be used together");
    }

    let cfg = build_config(&args)?;

    if args.print_plan {
        let (out_tx, out_handle) = spawn_output_writer(false);
        let _ = out_tx.send(OutputLine::Stdout(serde_json::to_string_pretty(&cfg)?));
        drop(out_tx);
        let _ = out_handle.await;
        return Ok(());
    }

    let mode = OutputMode::from_args(&args);
    let bus = SimBus::new(cfg.devices.clone()).with_time_scale(cfg.sim_time_scale);
    let mut pass_gate = gate::open();

    let (out_tx, out_handle) = spawn_output_writer(pass_gate.uses_raw_terminal());
    let (evt_tx, evt_rx) = mpsc::unbounded_channel::<RunEvent>();
    let render = tokio::spawn(render_events(evt_rx, out_tx.clone(), mode));

    let outcome = run_program(&bus, &cfg, pass_gate.as_mut(), evt_tx).await;

    // The event channel closes once the run has dropped its senders.
    let _ = render.await;
    let summary = outcome.as_ref().ok().filter(|_| mode != OutputMode::Silent);
    if let Some(summary) = summary {
        let why = match summary.end {
            LoopEnd::Stopped => "stopped by operator",
            LoopEnd::PassLimit => "pass limit reached",
        };
        let _ = out_tx.send(OutputLine::Stderr(format!(
            "Finished after {} pass(es), {why}",
            summary.passes
        )));
    }
    drop(out_tx);
    let _ = out_handle.await;
    // Leave raw mode before anything else reaches the terminal.
    drop(pass_gate);

    outcome.context("motion run failed")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DeviceRef;
    use std::time::Duration;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("drive-sequencer").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn defaults_build_the_cycle_program() {
        let cfg = build_config(&parse(&["--devices", "1,2"])).unwrap();
        assert_eq!(cfg.devices, vec![DeviceRef::Index(1), DeviceRef::Index(2)]);
        assert_eq!(cfg.program.name, "cycle");
        assert_eq!(cfg.program.sequences.len(), 1);
        assert_eq!(cfg.program.sequences[0].name, "slow-up-down");
        assert_eq!(cfg.arrival_timeout, None);
        assert_eq!(cfg.max_passes, None);
        assert_eq!(cfg.program.holds.at_start, Duration::ZERO);

        let cfg = build_config(&parse(&["--devices", "1,2", "--at-start-hold", "5s"])).unwrap();
        assert_eq!(cfg.program.holds.at_start, Duration::from_secs(5));
    }

    #[test]
    fn sequence_list_and_hold_overrides() {
        let cli = parse(&[
            "--devices",
            "left,right",
            "--sequences",
            "fast-up-down,easy-jogging",
            "--swing-iterations",
            "1",
            "--step-hold",
            "250ms",
            "--cycle-hold",
            "1s",
            "--arrival-timeout",
            "30s",
        ]);
        let cfg = build_config(&cli).unwrap();
        let names: Vec<&str> = cfg.program.sequences.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["fast-up-down", "easy-jogging"]);
        assert_eq!(cfg.program.sequences[1].len(), 2 + 2 + 1);
        assert_eq!(cfg.program.holds.between_steps, Duration::from_millis(250));
        assert_eq!(cfg.program.holds.between_cycles, Duration::from_secs(1));
        // Untouched holds keep the program's values.
        assert_eq!(cfg.program.holds.start, Duration::from_secs(10));
        assert_eq!(cfg.arrival_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn bad_inputs_are_rejected() {
        assert!(build_config(&parse(&["--devices", " , "])).is_err());
        assert!(build_config(&parse(&["--devices", "1,1"])).is_err());
        assert!(build_config(&parse(&["--devices", "1", "--sim-time-scale", "0"])).is_err());
        assert!(Cli::try_parse_from(["drive-sequencer", "--devices", "1", "--max-passes", "0"]).is_err());
        assert!(Cli::try_parse_from(["drive-sequencer"]).is_err());
    }

    #[test]
    fn output_mode_follows_flags() {
        assert_eq!(OutputMode::from_args(&parse(&["--devices", "1"])), OutputMode::Text);
        assert_eq!(
            OutputMode::from_args(&parse(&["--devices", "1", "--json"])),
            OutputMode::Json
        );
        assert_eq!(
            OutputMode::from_args(&parse(&["--devices", "1", "--silent"])),
            OutputMode::Silent
        );
    }

    #[test]
    fn plan_serializes_holds_as_text() {
        let cfg = build_config(&parse(&["--devices", "1,2", "--program", "asc-demo"])).unwrap();
        let plan: serde_json::Value = serde_json::to_value(&cfg).unwrap();
        assert_eq!(plan["program"]["holds"]["shutdown_timeout"], "5s");
        assert_eq!(plan["program"]["holds"]["start"], "100ms");
        assert_eq!(plan["devices"][0], 1);
        assert_eq!(plan["arrival_timeout"], serde_json::Value::Null);
    }
}
