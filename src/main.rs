use anyhow::{bail, Context, Result};
use backdrop::background::BackgroundSelection;
use backdrop::capture::{CaptureRequest, FrameSource, WebcamCapture};
use backdrop::config::{PipelineConfig, SegmentationConfig};
use backdrop::control::{parse_command, Command, HELP};
use backdrop::output::{OutputSink, V4L2Output};
use backdrop::overlay::OverlayMetadata;
use backdrop::render::{BackendKind, RenderParams};
use backdrop::segmentation::{self, SegmentationModel};
use backdrop::session::{BusEvent, EventBus, SessionCoordinator, SessionIo, SessionSettings};
use clap::Parser;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input webcam device index
    #[arg(short, long, default_value_t = 0)]
    input_device: u32,

    /// Output v4l2loopback device path
    #[arg(short, long, default_value = "/dev/video10")]
    output_device: String,

    /// Requested capture width
    #[arg(long, default_value_t = 1280)]
    capture_width: u32,

    /// Requested capture height
    #[arg(long, default_value_t = 720)]
    capture_height: u32,

    /// Output resolution width
    #[arg(long, default_value_t = 1280)]
    output_width: u32,

    /// Output resolution height
    #[arg(long, default_value_t = 720)]
    output_height: u32,

    /// Render cadence in frames per second (overrides the config file)
    #[arg(long)]
    fps: Option<u32>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Path to segmentation model (ONNX file)
    /// If not provided, the raw mirrored video is passed through
    #[arg(long)]
    model: Option<String>,

    /// Rendering backend; falls back to software when no GPU is usable
    #[arg(long, value_enum, default_value_t = BackendKind::Accelerated)]
    backend: BackendKind,

    /// Background image as ID=PATH (repeatable, the first one is selected)
    #[arg(long, value_name = "ID=PATH")]
    background: Vec<String>,

    /// Background opacity 0-100
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=100))]
    opacity: Option<u8>,

    /// Mask feather radius in output pixels, 0-15
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=15))]
    feather: Option<u8>,

    /// Do not mirror the output horizontally
    #[arg(long)]
    no_mirror: bool,

    /// Overlay card metadata (JSON file)
    #[arg(long)]
    overlay: Option<PathBuf>,

    /// Pipeline configuration (TOML file)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Show matte visualization (grayscale silhouette) instead of the composite
    #[arg(long)]
    show_matte: bool,
}

/// Real devices behind the session coordinator.
struct DeviceIo {
    output_device: PathBuf,
    model_path: Option<String>,
    segmentation: SegmentationConfig,
}

impl SessionIo for DeviceIo {
    fn open_capture(&mut self, request: &CaptureRequest) -> Result<Box<dyn FrameSource>> {
        let capture = WebcamCapture::open(*request).context("Failed to initialize webcam capture")?;
        Ok(Box::new(capture))
    }

    fn open_sink(&mut self, (width, height): (u32, u32)) -> Result<Box<dyn OutputSink>> {
        let output = V4L2Output::new(&self.output_device, width, height)
            .context("Failed to initialize v4l2loopback output")?;
        Ok(Box::new(output))
    }

    fn load_model(&mut self) -> Result<Box<dyn SegmentationModel>> {
        let Some(path) = &self.model_path else {
            bail!("no model configured (--model)");
        };
        segmentation::create_default_model(path, &self.segmentation)
            .context("Failed to load segmentation model")
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let mut config = match &args.config {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    if let Some(fps) = args.fps {
        config.render.fps = fps;
    }
    if let Some(opacity) = args.opacity {
        config.render.opacity = opacity;
    }
    if let Some(feather) = args.feather {
        config.render.feather = feather;
    }
    if args.no_mirror {
        config.render.mirror = false;
    }
    config.validate().context("Invalid configuration")?;

    tracing::info!("backdrop starting");
    tracing::info!("Capture: {}x{}", args.capture_width, args.capture_height);
    tracing::info!("Output: {}x{}", args.output_width, args.output_height);
    tracing::info!("Target FPS: {}", config.render.fps);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build runtime")?;
    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, run(args, config))
}

async fn run(args: Args, config: PipelineConfig) -> Result<()> {
    let bus = EventBus::new();
    let mut events = bus.subscribe();

    let capture = CaptureRequest {
        device_index: args.input_device,
        width: args.capture_width,
        height: args.capture_height,
    };
    let mut settings =
        SessionSettings::from_config(&config, capture, (args.output_width, args.output_height));
    settings.show_matte = args.show_matte;

    if args.model.is_none() {
        tracing::info!("Running in passthrough mode (no segmentation)");
    }
    let io = DeviceIo {
        output_device: PathBuf::from(&args.output_device),
        model_path: args.model.clone(),
        segmentation: config.segmentation.clone(),
    };
    let mut coordinator = SessionCoordinator::new(
        io,
        settings,
        RenderParams::from_config(&config.render),
        config.refine.clone(),
        bus.clone(),
    );

    let catalogue: HashMap<String, BackgroundSelection> = args
        .background
        .iter()
        .map(|spec| {
            let selection = BackgroundSelection::parse(spec);
            (selection.id.clone(), selection)
        })
        .collect();
    if let Some(first) = args.background.first() {
        coordinator.handle(&BusEvent::BackgroundSelected(BackgroundSelection::parse(first)));
    }
    if let Some(path) = &args.overlay {
        match OverlayMetadata::load(path) {
            Ok(meta) => coordinator.handle(&BusEvent::OverlayUpdated(Some(meta))),
            Err(e) => tracing::warn!("Overlay ignored: {:#}", e),
        }
    }

    let mut backend = args.backend;
    coordinator
        .start(backend)
        .context("Failed to start session")?;

    let (line_tx, mut lines) = mpsc::unbounded_channel();
    tokio::task::spawn_local(read_lines(line_tx));
    tracing::info!("{}", HELP);
    tracing::info!("Press Ctrl+C to stop");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                tracing::info!("Interrupted");
                break;
            }
            line = lines.recv(), if stdin_open => {
                let Some(line) = line else {
                    stdin_open = false;
                    continue;
                };
                match parse_command(&line) {
                    Ok(Some(command)) => {
                        if !dispatch(&mut coordinator, &bus, &catalogue, &mut backend, command) {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => tracing::warn!("{}", e),
                }
            }
            event = events.recv() => match event {
                Ok(event) => coordinator.handle(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Dropped {} bus events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    coordinator.stop();
    tracing::info!("backdrop stopped");
    Ok(())
}

/// Act on one control command. Returns false on quit.
fn dispatch(
    coordinator: &mut SessionCoordinator<DeviceIo>,
    bus: &EventBus,
    catalogue: &HashMap<String, BackgroundSelection>,
    backend: &mut BackendKind,
    command: Command,
) -> bool {
    match command {
        Command::Start(requested) => {
            let requested = requested.unwrap_or(*backend);
            match coordinator.start(requested) {
                Ok(_) => *backend = requested,
                Err(e) => tracing::error!("{}", e),
            }
        }
        Command::Stop => {
            if !coordinator.stop() {
                tracing::info!("No session running");
            }
        }
        Command::Backend(requested) => {
            *backend = requested;
            match coordinator.switch_backend(requested) {
                Ok(Some(actual)) => tracing::info!("Switched to {} backend", actual),
                Ok(None) => tracing::info!("{} backend will be used on next start", requested),
                Err(e) => tracing::error!("{}", e),
            }
        }
        Command::LoadOverlay(path) => match OverlayMetadata::load(&path) {
            Ok(meta) => bus.publish(BusEvent::OverlayUpdated(Some(meta))),
            Err(e) => tracing::warn!("Overlay ignored: {:#}", e),
        },
        Command::Publish(BusEvent::BackgroundSelected(selection)) => {
            // A bare catalogue id picks the image registered on the command line
            let selection = match catalogue.get(&selection.id) {
                Some(known) if !selection.path.exists() => known.clone(),
                _ => selection,
            };
            bus.publish(BusEvent::BackgroundSelected(selection));
        }
        Command::Publish(event) => bus.publish(event),
        Command::Quit => return false,
    }
    true
}

async fn read_lines(tx: mpsc::UnboundedSender<String>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(line).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!("Failed to read stdin: {}", e);
                break;
            }
        }
    }
}
