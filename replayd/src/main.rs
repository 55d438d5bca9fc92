//! replayd - run sleep-replay bouts from the command line.
//!
//! Examples:
//!   replayd init-config
//!   replayd run REM 20000 --trace rem.jsonl
//!   replayd schedule
//!   replayd analyze recorded.json SWS
//!   replayd paths
//!
//! Configuration is read from `--config <path>` or the default location shown
//! by `replayd paths`. Ctrl-C stops the running bout cleanly.

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::process;

use serde::{Deserialize, Serialize};
use sleep_replay::bout::{SleepBout, StopSignal};
use sleep_replay::config::{SleepConfig, Stage};
use sleep_replay::engine::EngineError;
use sleep_replay::error::{ConfigError, SleepError};
use sleep_replay::observer::{ChannelObserver, NoopObserver, TraceRecorder};
use sleep_replay::schedule::{ScheduleRunner, SleepSchedule};
use sleep_replay::scripted::ScriptedEngine;
use sleep_replay::substrate::{Network, NetworkConfig};
use thiserror::Error;
use tracing::{error, info, warn};

mod paths;
mod trace;

use paths::AppPaths;
use trace::{RecordedTrace, TraceSink};

#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    Usage(String),
    #[error("{0}")]
    Paths(String),
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Sleep(#[from] SleepError),
    #[error("network: {0}")]
    Engine(#[from] EngineError),
    #[error("bout task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Everything `replayd` reads from its configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct ReplaydConfig {
    network: NetworkConfig,
    sleep: SleepConfig,
    schedule: SleepSchedule,
}

#[derive(Debug)]
struct Args {
    config: Option<PathBuf>,
    trace: Option<PathBuf>,
    command: Vec<String>,
}

fn usage() -> ! {
    eprintln!("replayd (sleep-replay runner)");
    eprintln!("Usage: replayd [--config path] [--trace out.jsonl] <command> [args]\n");
    eprintln!("Commands:");
    eprintln!("  run <default|SWS|REM> <cycles>   Run one bout on the reference network");
    eprintln!("  schedule                         Run the configured sleep schedule");
    eprintln!("  analyze <trace.json> [stage]     Detect replay events in a recorded stability trace");
    eprintln!("  init-config                      Write the default configuration");
    eprintln!("  paths                            Show configuration and data paths");
    process::exit(1);
}

fn parse_args() -> Args {
    let mut args = Args {
        config: None,
        trace: None,
        command: Vec::new(),
    };
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--config" => match it.next() {
                Some(p) => args.config = Some(PathBuf::from(p)),
                None => usage(),
            },
            "--trace" => match it.next() {
                Some(p) => args.trace = Some(PathBuf::from(p)),
                None => usage(),
            },
            "-h" | "--help" => usage(),
            _ => args.command.push(arg),
        }
    }
    if args.command.is_empty() {
        usage();
    }
    args
}

fn load_config(path: &Path) -> Result<ReplaydConfig, CliError> {
    if !path.exists() {
        warn!("no configuration at {:?}, using defaults", path);
        return Ok(ReplaydConfig::default());
    }
    let text = fs::read_to_string(path).map_err(|source| CliError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| CliError::Json {
        path: path.to_path_buf(),
        source,
    })
}

fn write_json<T: Serialize>(value: &T) -> Result<(), CliError> {
    let text = serde_json::to_string_pretty(value).map_err(|source| CliError::Json {
        path: PathBuf::from("<stdout>"),
        source,
    })?;
    println!("{text}");
    Ok(())
}

/// Messages buffered between the bout and the trace writer thread.
const TRACE_QUEUE: usize = 16 * 1024;

type Trace = (ChannelObserver, TraceSink<BufWriter<File>>);

fn open_trace(path: &Path) -> Result<Trace, CliError> {
    let file = File::create(path).map_err(|source| CliError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    info!("writing telemetry to {:?}", path);
    Ok(TraceSink::spawn(BufWriter::new(file), TRACE_QUEUE))
}

fn finish_trace(trace: Option<Trace>) {
    let Some((obs, sink)) = trace else {
        return;
    };
    if obs.dropped() > 0 {
        warn!("{} telemetry messages dropped, trace writer fell behind", obs.dropped());
    }
    drop(obs);
    match sink.finish() {
        Some(writer) if writer.failures() > 0 => {
            warn!("{} telemetry lines could not be written", writer.failures());
        }
        Some(_) => {}
        None => error!("trace writer thread panicked"),
    }
}

/// Raise `stop` on Ctrl-C. The bout notices at its next cycle.
fn install_ctrl_c(stop: StopSignal) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C: stopping after the current cycle");
            stop.raise();
        }
    });
}

async fn cmd_run(
    cfg: ReplaydConfig,
    stage: Stage,
    cycles: u64,
    trace: Option<PathBuf>,
) -> Result<(), CliError> {
    let stop = StopSignal::new();
    install_ctrl_c(stop.clone());

    let result = tokio::task::spawn_blocking(move || -> Result<_, CliError> {
        let mut net = Network::new(cfg.network)?;
        let mut trace = trace.as_deref().map(open_trace).transpose()?;
        let bout = SleepBout::new(&cfg.sleep, stage, cycles)?.with_stop_signal(stop);
        let result = match trace.as_mut() {
            Some((obs, _)) => bout.with_observer(obs).run(&mut net),
            None => bout.with_observer(NoopObserver).run(&mut net),
        };
        finish_trace(trace);
        Ok(result?)
    })
    .await??;

    write_json(&result)
}

async fn cmd_schedule(cfg: ReplaydConfig, trace: Option<PathBuf>) -> Result<(), CliError> {
    let stop = StopSignal::new();
    install_ctrl_c(stop.clone());

    let report = tokio::task::spawn_blocking(move || -> Result<_, CliError> {
        let mut net = Network::new(cfg.network)?;
        let mut trace = trace.as_deref().map(open_trace).transpose()?;
        let mut runner = ScheduleRunner::new(&cfg.sleep, &cfg.schedule).with_stop_signal(stop);
        if let Some((obs, _)) = trace.as_mut() {
            runner = runner.with_observer(obs);
        }
        let report = runner.run(&mut net);
        finish_trace(trace);
        Ok(report?)
    })
    .await??;

    info!(
        "schedule: {} bouts, {} replay events",
        report.bouts.len(),
        report.total_replay_events()
    );
    write_json(&report)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeReport {
    result: sleep_replay::bout::BoutResult,
    summary: sleep_replay::observer::TraceSummary,
    events: Vec<sleep_replay::observer::PhaseEvent>,
}

/// Replay a recorded stability trace through the detector only.
fn cmd_analyze(cfg: ReplaydConfig, path: &Path, stage: Stage) -> Result<(), CliError> {
    let text = fs::read_to_string(path).map_err(|source| CliError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let trace: RecordedTrace = serde_json::from_str(&text).map_err(|source| CliError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    let values = trace.into_values();
    let cycles = values.len() as u64;

    let mut sleep = cfg.sleep;
    sleep.stability_layers = Some(vec!["trace".to_string()]);
    for over in sleep.stages.values_mut() {
        over.stability_layers = None;
    }
    sleep.oscillation.enabled = false;
    sleep.eligible_projections.clear();
    sleep.sleep_learning_rate.clear();
    sleep.lesioned_layers.clear();
    sleep.reignite = None;

    let mut engine = ScriptedEngine::builder()
        .layer("trace", 1)
        .stability(values)
        .build();
    let mut recorder = TraceRecorder::new(cycles.max(1) as usize);
    let result = SleepBout::new(&sleep, stage, cycles)?
        .with_observer(&mut recorder)
        .run(&mut engine)?;

    write_json(&AnalyzeReport {
        result,
        summary: recorder.summary(),
        events: recorder.events().to_vec(),
    })
}

fn cmd_init_config(path: &Path) -> Result<(), CliError> {
    if path.exists() {
        return Err(CliError::Usage(format!(
            "{path:?} already exists; remove it first"
        )));
    }
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|source| CliError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }
    let text =
        serde_json::to_string_pretty(&ReplaydConfig::default()).map_err(|source| CliError::Json {
            path: path.to_path_buf(),
            source,
        })?;
    fs::write(path, text).map_err(|source| CliError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    println!("wrote {}", path.display());
    Ok(())
}

fn parse_stage(s: &str) -> Result<Stage, CliError> {
    Ok(s.parse::<Stage>()?)
}

async fn dispatch(args: Args) -> Result<(), CliError> {
    let paths = AppPaths::new()?;
    let config_path = args.config.clone().unwrap_or_else(|| paths.config_file());
    let cmd = args.command[0].as_str();

    match cmd {
        "paths" => {
            println!("config dir: {}", paths.config_dir().display());
            println!("config file: {}", paths.config_file().display());
            println!("data dir: {}", paths.data_dir().display());
            println!("default trace: {}", paths.trace_file().display());
            Ok(())
        }
        "init-config" => {
            if args.config.is_none() {
                paths.ensure()?;
            }
            cmd_init_config(&config_path)
        }
        "run" => {
            let (Some(stage), Some(cycles)) = (args.command.get(1), args.command.get(2)) else {
                usage();
            };
            let stage = parse_stage(stage)?;
            let cycles: u64 = cycles
                .parse()
                .map_err(|_| CliError::Usage(format!("cycles must be a number, got '{cycles}'")))?;
            let cfg = load_config(&config_path)?;
            cmd_run(cfg, stage, cycles, args.trace).await
        }
        "schedule" => {
            let cfg = load_config(&config_path)?;
            cmd_schedule(cfg, args.trace).await
        }
        "analyze" => {
            let Some(trace_path) = args.command.get(1) else {
                usage();
            };
            let stage = match args.command.get(2) {
                Some(s) => parse_stage(s)?,
                None => Stage::Default,
            };
            let cfg = load_config(&config_path)?;
            cmd_analyze(cfg, Path::new(trace_path), stage)
        }
        other => Err(CliError::Usage(format!("unknown command '{other}'"))),
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let args = parse_args();
    if let Err(e) = dispatch(args).await {
        if let CliError::Sleep(SleepError::EngineUnavailable { replay_events, .. }) = &e {
            error!("bout aborted after {} replay events", replay_events);
        }
        eprintln!("replayd: {e}");
        process::exit(1);
    }
}
