use crate::engine::{
    EngineBridge, EngineTransport, ProcessConfig, ProcessTransport, SimulatedEngine,
};
use crate::model::{EngineSettings, Stage, WatermarkConfig, WatermarkPosition};
use crate::orchestrator::{EngineProgram, Orchestrator, OrchestratorConfig};
use crate::report::{RunRecorder, RunReport};
use anyhow::{bail, Context, Result};
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// How often text mode prints a progress line.
const PROGRESS_EVERY: Duration = Duration::from_millis(500);

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
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
    name = "particle-stage",
    version,
    about = "Run a particle animation engine through its stages and report on the run"
)]
pub struct Cli {
    /// Image to animate
    #[arg(long)]
    pub image: PathBuf,

    /// Engine executable speaking line-delimited JSON on stdio (simulated engine when omitted)
    #[arg(long)]
    pub engine: Option<PathBuf>,

    /// Extra argument passed to the engine executable (repeatable)
    #[arg(long = "engine-arg", allow_hyphen_values = true)]
    pub engine_args: Vec<String>,

    /// Watermark image overlaid on the animation
    #[arg(long)]
    pub watermark: Option<PathBuf>,

    /// Watermark corner: top-left, top-right, bottom-left, bottom-right, center
    #[arg(long, default_value = "bottom-right")]
    pub watermark_position: WatermarkPosition,

    /// Watermark opacity (0..=1)
    #[arg(long, default_value_t = 0.7)]
    pub watermark_opacity: f64,

    /// Watermark size relative to the canvas
    #[arg(long, default_value_t = 0.15)]
    pub watermark_scale: f64,

    /// Animation speed multiplier
    #[arg(long)]
    pub speed: Option<f64>,

    /// Number of particles
    #[arg(long)]
    pub particle_count: Option<u64>,

    /// How long to stay in the final stage before stopping
    #[arg(long, default_value = "3s")]
    pub hold: humantime::Duration,

    /// Skip to the final stage after this long
    #[arg(long)]
    pub skip_after: Option<humantime::Duration>,

    /// Give up if the final stage is not reached within this long
    #[arg(long, default_value = "2m")]
    pub timeout: humantime::Duration,

    /// Engine health poll interval (overrides the config file)
    #[arg(long)]
    pub health_interval: Option<humantime::Duration>,

    /// Use --auto-restart true or --auto-restart false to override the config file
    #[arg(long, action = clap::ArgAction::Set)]
    pub auto_restart: Option<bool>,

    /// Configuration file (JSON)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Print the JSON run report
    #[arg(long)]
    pub json: bool,

    /// Print a text summary (default)
    #[arg(long)]
    pub text: bool,

    /// Run silently: suppress all output except errors (for cron usage)
    #[arg(long)]
    pub silent: bool,

    /// Also write the JSON run report to this file
    #[arg(long)]
    pub export_json: Option<PathBuf>,

    /// Debug logging on stderr (RUST_LOG takes precedence)
    #[arg(short, long)]
    pub verbose: bool,
}

pub async fn run(args: Cli) -> Result<()> {
    if args.silent && !args.json {
        return Err(anyhow::anyhow!(
            "--silent can only be used with --json. Use --silent --json together."
        ));
    }
    if args.json && args.text {
        bail!("--json and --text are mutually exclusive");
    }
    run_session(args).await
}

/// Build the orchestrator configuration: defaults, then the config file, then flags.
pub fn build_config(args: &Cli) -> Result<OrchestratorConfig> {
    let mut cfg = OrchestratorConfig::load(args.config.as_deref())?;
    if let Some(auto_restart) = args.auto_restart {
        cfg.auto_restart = auto_restart;
    }
    if let Some(every) = args.health_interval {
        cfg.health_poll_interval = Duration::from(every);
    }
    if let Some(program) = args.engine.clone() {
        cfg.engine = Some(EngineProgram {
            program,
            args: args.engine_args.clone(),
        });
    }
    cfg.simulator.stage_durations = cfg.stage_durations;
    cfg.validate()?;
    Ok(cfg)
}

fn make_transport(cfg: &OrchestratorConfig) -> Arc<dyn EngineTransport> {
    match cfg.engine.as_ref() {
        Some(engine) => Arc::new(ProcessTransport::new(ProcessConfig {
            program: engine.program.clone(),
            args: engine.args.clone(),
            request_timeout: cfg.request_timeout,
            shutdown_grace: cfg.shutdown_grace,
        })),
        None => Arc::new(SimulatedEngine::new(cfg.simulator.clone())),
    }
}

fn watermark_from(args: &Cli) -> Option<WatermarkConfig> {
    args.watermark.as_ref().map(|path| WatermarkConfig {
        enabled: true,
        path: path.clone(),
        position: args.watermark_position,
        opacity: args.watermark_opacity,
        scale: args.watermark_scale,
    })
}

async fn run_session(args: Cli) -> Result<()> {
    let cfg = build_config(&args)?;
    let transport = make_transport(&cfg);
    let mut recorder = RunRecorder::new(transport.describe());
    let bridge = Arc::new(EngineBridge::new(transport, cfg.heartbeat_timeout));
    let orch = Orchestrator::new(bridge, cfg);
    orch.init();

    let (out_tx, out_handle) = if args.silent {
        (None, None)
    } else {
        let (tx, handle) = spawn_output_writer();
        (Some(tx), Some(handle))
    };
    let live = if args.json { None } else { out_tx.as_ref() };

    let outcome = drive(&orch, &args, &mut recorder, live).await;
    orch.shutdown().await;

    let report = recorder.finish(
        &orch.snapshot(),
        outcome.as_ref().err().map(|e| format!("{e:#}")),
    );
    if let Some(p) = args.export_json.as_deref() {
        export_json(p, &report)?;
    }

    if let Some(tx) = out_tx.as_ref() {
        if args.json {
            let out = serde_json::to_string_pretty(&report)?;
            let _ = tx.send(OutputLine::Stdout(out));
        } else {
            for line in crate::text_summary::build_text_summary(&report).lines {
                let _ = tx.send(OutputLine::Stdout(line));
            }
        }
    }
    if let Some(tx) = out_tx {
        drop(tx);
    }
    if let Some(handle) = out_handle {
        let _ = handle.await;
    }

    outcome
}

fn export_json(path: &std::path::Path, report: &RunReport) -> Result<()> {
    let body = serde_json::to_string_pretty(report)?;
    std::fs::write(path, body).with_context(|| format!("failed to write {}", path.display()))
}

/// Orchestrator state as a one-line failure reason.
fn last_error(orch: &Orchestrator, fallback: &str) -> String {
    orch.snapshot()
        .error
        .unwrap_or_else(|| fallback.to_string())
}

/// The scripted session: start, load content, play, follow, stop.
async fn drive(
    orch: &Orchestrator,
    args: &Cli,
    recorder: &mut RunRecorder,
    live: Option<&mpsc::UnboundedSender<OutputLine>>,
) -> Result<()> {
    let say = |msg: String| {
        if let Some(tx) = live {
            let _ = tx.send(OutputLine::Stderr(msg));
        }
    };

    let startup = orch.start_engine().await;
    recorder.engine_started(&startup);
    if !startup.success {
        bail!(
            "engine failed to start: {}",
            startup.error.unwrap_or_default()
        );
    }
    say(format!(
        "Engine up in {} ms",
        startup.startup_time.as_millis()
    ));

    if !orch.change_image(&args.image).await {
        bail!(last_error(orch, "image could not be loaded"));
    }
    if let Some(w) = watermark_from(args) {
        if !orch.change_watermark(Some(w)).await {
            bail!(last_error(orch, "watermark could not be applied"));
        }
    }
    let settings = EngineSettings {
        speed: args.speed,
        particle_count: args.particle_count,
        ..Default::default()
    };
    if !settings.is_empty() && !orch.update_settings(settings).await {
        bail!(last_error(orch, "settings were rejected"));
    }

    if !orch.play().await {
        bail!(last_error(orch, "animation did not start"));
    }
    let run_start = Instant::now();
    recorder.run_started(run_start);
    info!(image = %args.image.display(), "animation running");

    let result = follow(orch, args, recorder, run_start, &say).await;
    recorder.run_ended(Instant::now());
    if orch.capabilities().can_stop {
        orch.stop().await;
    }
    result
}

async fn follow(
    orch: &Orchestrator,
    args: &Cli,
    recorder: &mut RunRecorder,
    run_start: Instant,
    say: &impl Fn(String),
) -> Result<()> {
    let hold = Duration::from(args.hold);
    let deadline = tokio::time::Instant::from_std(run_start + Duration::from(args.timeout));
    let mut skip_at = args.skip_after.map(|d| run_start + Duration::from(d));
    let mut final_since: Option<Instant> = None;

    let mut rx = orch.subscribe();
    let mut ticker = tokio::time::interval(PROGRESS_EVERY);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        let now = Instant::now();
        let state = rx.borrow_and_update().clone();
        let observed = recorder.observe(&state, now);
        if let Some(stage) = observed.entered {
            say(format!("== {} ==", stage.as_str()));
        }
        for f in &observed.new_faults {
            say(format!("Engine fault [{}]: {}", f.code, f.message));
        }

        if !state.is_engine_running {
            bail!("engine stopped during the run");
        }
        if !state.is_animation_running {
            bail!(state
                .error
                .unwrap_or_else(|| "animation stopped unexpectedly".to_string()));
        }
        if state.current_stage == Some(Stage::FinalBreathing) {
            let since = *final_since.get_or_insert(now);
            if now.duration_since(since) >= hold {
                return Ok(());
            }
        }

        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    bail!("state store closed");
                }
            }
            _ = ticker.tick() => {
                if skip_at.is_some_and(|at| now >= at) && orch.capabilities().can_skip {
                    skip_at = None;
                    if orch.skip_to_end().await {
                        recorder.skipped();
                        say("Skipped to final stage".to_string());
                    }
                }
                let p = orch.progress();
                if let Some(stage) = p.stage {
                    let eta = p
                        .estimated_remaining
                        .map(|d| format!(", eta {}", humantime::format_duration(round_secs(d))))
                        .unwrap_or_default();
                    say(format!(
                        "{}: {:.0}% (total {:.0}%{eta})",
                        stage.as_str(),
                        p.stage_progress * 100.0,
                        p.total_progress * 100.0
                    ));
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                bail!(
                    "final stage not reached within {}",
                    humantime::format_duration(Duration::from(args.timeout))
                );
            }
            _ = &mut ctrl_c => {
                warn!("interrupted");
                bail!("interrupted");
            }
        }
    }
}

fn round_secs(d: Duration) -> Duration {
    Duration::from_secs(d.as_secs_f64().round() as u64)
}
