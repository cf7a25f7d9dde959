use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use camview::config::{AppConfig, ConfigStore};
use camview::video::{CaptureEngine, ControlKind, ControlName, PowerLineFrequency, Resolution};

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// A `NAME=VALUE` control assignment
#[derive(Debug, Clone, Copy)]
struct ControlAssignment {
    control: ControlName,
    value: i32,
}

fn parse_assignment(s: &str) -> Result<ControlAssignment, String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("Expected NAME=VALUE, got '{}'", s))?;
    Ok(ControlAssignment {
        control: name.trim().parse()?,
        value: value
            .trim()
            .parse()
            .map_err(|_| format!("Invalid control value in '{}'", s))?,
    })
}

/// camview command line arguments
#[derive(Parser, Debug)]
#[command(name = "camview")]
#[command(version, about = "Headless MJPEG webcam viewer for V4L2 devices", long_about = None)]
struct CliArgs {
    /// JSON settings file
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Video device (overrides settings file)
    #[arg(short = 'd', long, value_name = "PATH")]
    device: Option<PathBuf>,

    /// Capture size as WIDTHxHEIGHT (overrides settings file)
    #[arg(short = 's', long, value_name = "WxH")]
    size: Option<Resolution>,

    /// Frame rate (overrides settings file)
    #[arg(short = 'f', long, value_name = "FPS")]
    fps: Option<u32>,

    /// Wait for a frame this long before a dequeue fails, in milliseconds
    #[arg(long, value_name = "MS")]
    dequeue_timeout: Option<u64>,

    /// Stop after this many seconds (default: run until Ctrl-C)
    #[arg(long, value_name = "SECS")]
    duration: Option<u64>,

    /// Set a control, e.g. --set brightness=10 (repeatable)
    #[arg(long = "set", value_name = "NAME=VALUE", value_parser = parse_assignment)]
    set: Vec<ControlAssignment>,

    /// Raise a control by one step (repeatable)
    #[arg(long, value_name = "NAME")]
    increment: Vec<ControlName>,

    /// Lower a control by one step (repeatable)
    #[arg(long, value_name = "NAME")]
    decrement: Vec<ControlName>,

    /// Flip a boolean control (repeatable)
    #[arg(long, value_name = "NAME")]
    toggle: Vec<ControlName>,

    /// Restore a control to its default (repeatable)
    #[arg(long, value_name = "NAME")]
    reset: Vec<ControlName>,

    /// Power line frequency filter (off, 50hz, 60hz, auto)
    #[arg(long, value_name = "MODE")]
    power_line_frequency: Option<PowerLineFrequency>,

    /// Print the camera's controls and exit
    #[arg(long)]
    list_controls: bool,

    /// Save the last decoded frame as a PPM image on exit
    #[arg(long, value_name = "FILE")]
    snapshot: Option<PathBuf>,

    /// Write the effective settings to a JSON file
    #[arg(long, value_name = "FILE")]
    write_config: Option<PathBuf>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose, args.log_json);

    tracing::info!("Starting camview v{}", env!("CARGO_PKG_VERSION"));

    // Settings file first, then CLI overrides
    let store = ConfigStore::open(args.config.as_deref())?;
    store.update(|config| apply_overrides(config, &args))?;
    let config = store.get();
    if let Some(path) = &args.write_config {
        store.save_to(path)?;
        tracing::info!("Settings written to {}", path.display());
    }

    let engine = Arc::new(CaptureEngine::new(config.engine_options()));
    let descriptor = config.descriptor();
    let effective = {
        let engine = engine.clone();
        tokio::task::spawn_blocking(move || engine.init(descriptor)).await??
    };
    tracing::info!(
        "Capturing {} at {} @ {} fps",
        effective.device_path.display(),
        effective.resolution,
        effective.fps
    );

    if args.list_controls {
        list_controls(&engine);
        engine.close();
        return Ok(());
    }

    apply_controls(&engine, &config, &args);

    {
        let engine = engine.clone();
        tokio::task::spawn_blocking(move || engine.start()).await??;
    }

    // Stats reporting
    let stats_interval = config.capture.stats_interval_secs;
    let stats_task = (stats_interval > 0).then(|| {
        let engine = engine.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(stats_interval));
            interval.tick().await;
            loop {
                interval.tick().await;
                let stats = engine.stats();
                tracing::info!(
                    "fps={:.1} frames={} dropped={} dequeue_errors={} decode_errors={}",
                    stats.current_fps,
                    stats.frames_decoded,
                    stats.small_frames_dropped,
                    stats.dequeue_errors,
                    stats.decode_errors
                );
            }
        })
    });

    // First-frame notice
    let mut frames = engine.frame_watch();
    let first_frame = tokio::spawn(async move {
        if frames.changed().await.is_ok() {
            tracing::info!("First frame received");
        }
    });

    let deadline = async {
        match args.duration {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
        }
        _ = deadline => {
            tracing::info!("Capture duration elapsed");
        }
    }

    if let Some(task) = stats_task {
        task.abort();
    }
    first_frame.abort();

    {
        let engine = engine.clone();
        tokio::task::spawn_blocking(move || engine.stop()).await?;
    }

    if let Some(path) = &args.snapshot {
        match engine.latest_frame() {
            Some(frame) => {
                let file = std::io::BufWriter::new(std::fs::File::create(path)?);
                frame.write_ppm(file)?;
                tracing::info!(
                    "Saved frame {} ({}) to {}",
                    frame.sequence,
                    frame.resolution,
                    path.display()
                );
            }
            None => tracing::warn!("No frame captured, snapshot not written"),
        }
    }

    let stats = engine.stats();
    tracing::info!(
        "Captured {} frames ({} header-only dropped)",
        stats.frames_decoded,
        stats.small_frames_dropped
    );
    engine.close();
    Ok(())
}

fn apply_overrides(config: &mut AppConfig, args: &CliArgs) {
    if let Some(device) = &args.device {
        config.video.device = device.clone();
    }
    if let Some(size) = args.size {
        config.video.width = size.width;
        config.video.height = size.height;
    }
    if let Some(fps) = args.fps {
        config.video.fps = fps;
    }
    if let Some(timeout) = args.dequeue_timeout {
        config.capture.dequeue_timeout_ms = timeout;
    }
}

/// Control failures are reported and skipped; they never stop capture
fn apply_controls(engine: &CaptureEngine, config: &AppConfig, args: &CliArgs) {
    let from_file = match config.control_values() {
        Ok(values) => values,
        Err(e) => {
            tracing::warn!("{}", e);
            Vec::new()
        }
    };
    let assignments = from_file
        .into_iter()
        .chain(args.set.iter().map(|a| (a.control, a.value)));
    for (control, value) in assignments {
        match engine.set_control(control.id(), value) {
            Ok(()) => tracing::info!("{} <- {}", control, value),
            Err(e) => tracing::warn!("Failed to set {}: {}", control, e),
        }
    }

    let plf = args
        .power_line_frequency
        .or_else(|| config.power_line_frequency().ok().flatten());
    if let Some(mode) = plf {
        let result = engine
            .controls()
            .and_then(|controls| controls.set_power_line_frequency(mode));
        if let Err(e) = result {
            tracing::warn!("Failed to set power line frequency: {}", e);
        }
    }

    for control in &args.increment {
        report(*control, "increment", engine.increment_control(control.id()));
    }
    for control in &args.decrement {
        report(*control, "decrement", engine.decrement_control(control.id()));
    }
    for control in &args.toggle {
        report(*control, "toggle", engine.toggle_control(control.id()));
    }
    for control in &args.reset {
        report(*control, "reset", engine.reset_control(control.id()));
    }
}

fn report(control: ControlName, op: &str, result: camview::Result<i32>) {
    match result {
        Ok(value) => tracing::info!("{} {} -> {}", control, op, value),
        Err(e) => tracing::warn!("Failed to {} {}: {}", op, control, e),
    }
}

fn list_controls(engine: &CaptureEngine) {
    let controls = match engine.controls() {
        Ok(controls) => controls,
        Err(e) => {
            tracing::error!("{}", e);
            return;
        }
    };
    for name in ControlName::ALL {
        match controls.descriptor(name.id()) {
            Ok(desc) if desc.kind.is_usable() => {
                let value = controls
                    .get(name.id())
                    .map(|v| v.to_string())
                    .unwrap_or_else(|_| "?".to_string());
                let kind = if desc.kind == ControlKind::Boolean {
                    "bool"
                } else {
                    "int"
                };
                println!(
                    "{:<24} {:<4} value={:<6} min={} max={} step={} default={}",
                    name, kind, value, desc.minimum, desc.maximum, desc.step, desc.default
                );
            }
            Ok(desc) => println!("{:<24} {:?}", name, desc.kind),
            Err(_) => {}
        }
    }
}

fn init_logging(level: LogLevel, verbose_count: u8, json: bool) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "camview=error",
        LogLevel::Warn => "camview=warn",
        LogLevel::Info => "camview=info",
        LogLevel::Verbose => "camview=debug",
        LogLevel::Debug => "camview=debug,v4l=debug",
        LogLevel::Trace => "camview=trace,v4l=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
    if let Err(err) = result {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
