use anyhow::Result;
use clap::Parser;
use scanfield::{
    CameraDevice, EngineError, FieldSnapshot, FrameOutcome, ScanfieldConfig, ScannerController,
    SharedLibrary, SimulatedBackend,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "scanfield")]
#[command(about = "Barcode/QR scan field driven by a simulated decode engine")]
#[command(version)]
#[command(long_about = "Runs one scan through the scan-session controller against a scripted \
decode engine and prints the captured value. Useful for exercising camera acquisition, \
error reporting and value locking without hardware.")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "scanfield.toml", help = "Path to TOML configuration file")]
    config: String,

    /// Enable debug logging (most verbose)
    #[arg(short, long, help = "Enable debug level logging")]
    debug: bool,

    /// Enable verbose logging (info level)
    #[arg(short, long, help = "Enable verbose info level logging")]
    verbose: bool,

    /// Enable quiet mode (errors only)
    #[arg(short, long, help = "Enable quiet mode - only log errors")]
    quiet: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration file and exit")]
    validate_config: bool,

    /// Print the effective configuration and exit
    #[arg(long, help = "Print the effective configuration in TOML format and exit")]
    print_config: bool,

    /// Override log format (json, pretty, compact)
    #[arg(long, value_name = "FORMAT", help = "Log output format: json, pretty, or compact")]
    log_format: Option<String>,

    /// Symbols the simulated camera sees, in frame order
    #[arg(short, long = "symbol", value_name = "TEXT")]
    symbols: Vec<String>,

    /// Frames without a symbol before the first one
    #[arg(long, default_value_t = 3)]
    noise_frames: usize,

    /// Simulated cameras, named cam-0, cam-1, ...
    #[arg(long, default_value_t = 1)]
    cameras: usize,

    /// Camera to scan with instead of the default
    #[arg(long, value_name = "ID")]
    camera: Option<String>,

    /// Simulate the user refusing camera access
    #[arg(long)]
    deny_permission: bool,

    /// Give up waiting for a symbol after this many seconds
    #[arg(long, default_value_t = 5)]
    timeout_secs: u64,

    /// Print the final field state as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    let mut config = match ScanfieldConfig::load_from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    if args.debug {
        config.system.debug_events = true;
    }

    if args.print_config {
        println!("{}", config.to_toml()?);
        return Ok(());
    }

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        eprintln!("✗ Configuration validation failed: {}", e);
        std::process::exit(1);
    }

    if args.validate_config {
        println!("✓ Configuration is valid");
        return Ok(());
    }

    let backend = Arc::new(SimulatedBackend::new());
    script_engine(&backend, &args);

    let library = SharedLibrary::global(backend);
    let controller = ScannerController::new(&config, library);
    info!("Scanner {} ready ({})", controller.id(), controller.placeholder());

    if let Some(camera) = &args.camera {
        controller.devices().await;
        if !controller.select_device(camera) {
            warn!("Camera {} not available; using default", camera);
        }
    }

    let snapshot = run_scan(&controller, Duration::from_secs(args.timeout_secs)).await;
    controller.teardown().await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else if let Some(error) = &snapshot.error {
        eprintln!("✗ {}", error);
    } else if snapshot.locked {
        println!("{}", snapshot.value);
    } else {
        eprintln!("✗ No symbol captured");
    }

    let exit_code = if snapshot.locked { 0 } else { 1 };
    std::process::exit(exit_code);
}

fn script_engine(backend: &SimulatedBackend, args: &Args) {
    let engine = backend.engine();

    let devices = (0..args.cameras)
        .map(|index| {
            CameraDevice::new(format!("cam-{}", index), format!("Simulated camera {}", index))
        })
        .collect();
    engine.set_devices(devices);

    if args.deny_permission {
        engine.set_start_error(Some(EngineError::not_allowed("Permission denied")));
    }

    let noise = std::iter::repeat_with(|| {
        FrameOutcome::Failed("No MultiFormat Readers were able to detect the code.".to_string())
    })
    .take(args.noise_frames);
    let symbols = args.symbols.iter().cloned().map(FrameOutcome::Decoded);
    engine.set_frames(noise.chain(symbols).collect());
    engine.set_frame_interval(Duration::from_millis(100));
}

/// Toggle a scan on and wait until it captures, fails or times out
async fn run_scan(controller: &ScannerController, wait: Duration) -> FieldSnapshot {
    let mut events = controller.subscribe();
    controller.toggle_scan().await;

    let settled = |snapshot: &FieldSnapshot| !snapshot.scanning;
    if settled(&controller.snapshot()) {
        return controller.snapshot();
    }

    let outcome = tokio::time::timeout(wait, async {
        loop {
            match events.recv().await {
                Ok(_) | Err(RecvError::Lagged(_)) => {
                    if settled(&controller.snapshot()) {
                        break;
                    }
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
    .await;

    if outcome.is_err() {
        warn!("No symbol decoded within {:?}; closing scanner", wait);
        controller.toggle_scan().await;
    }

    controller.snapshot()
}

fn init_logging(args: &Args) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    let log_level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else if args.quiet {
        "error"
    } else {
        "warn"
    };

    let env_filter = EnvFilter::try_from_env("SCANFIELD_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(format!("scanfield={}", log_level)));

    let fmt_layer = match args.log_format.as_deref() {
        Some("json") => fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        Some("compact") => fmt::layer()
            .compact()
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .boxed(),
        Some("pretty") | None => fmt::layer()
            .pretty()
            .with_target(true)
            .with_thread_ids(args.debug)
            .with_file(args.debug)
            .with_line_number(args.debug)
            .boxed(),
        Some(format) => {
            eprintln!("Warning: Unknown log format '{}', using default", format);
            fmt::layer()
                .with_target(true)
                .with_thread_ids(args.debug)
                .with_file(args.debug)
                .with_line_number(args.debug)
                .boxed()
        }
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .init();

    Ok(())
}
