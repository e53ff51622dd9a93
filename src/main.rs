//! Pi-cam-still binary: capture one JPEG still and save it.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use pi_cam_still::config::{
    CaptureConfig, DEFAULT_DEVICE_PATH, DEFAULT_HEIGHT, DEFAULT_OUTPUT_PATH, DEFAULT_WIDTH,
};
use pi_cam_still::{capture_still, logging, FileSink, V4L2Device, VideoControl};
use tracing::info;

#[derive(Parser)]
#[command(
    name = "pi-cam-still",
    about = "Capture a single MJPEG still from a V4L2 camera",
    version
)]
struct Cli {
    /// Camera device node
    #[arg(short, long, default_value = DEFAULT_DEVICE_PATH)]
    device: PathBuf,

    /// Output JPEG file
    #[arg(short, long, default_value = DEFAULT_OUTPUT_PATH)]
    output: PathBuf,

    /// Requested width in pixels
    #[arg(long, default_value_t = DEFAULT_WIDTH)]
    width: u32,

    /// Requested height in pixels
    #[arg(long, default_value_t = DEFAULT_HEIGHT)]
    height: u32,

    /// Give up waiting for a frame after this many milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl From<Cli> for CaptureConfig {
    fn from(cli: Cli) -> Self {
        Self {
            device: cli.device,
            output: cli.output,
            width: cli.width,
            height: cli.height,
            timeout: cli.timeout_ms.map(Duration::from_millis),
        }
    }
}

fn main() {
    let cli = Cli::parse();
    logging::init_logging(if cli.verbose { "debug" } else { "info" });

    let config = CaptureConfig::from(cli);
    if let Err(err) = run(&config) {
        eprintln!("Error: {err}");
        std::process::exit(err.exit_code());
    }
}

fn run(config: &CaptureConfig) -> pi_cam_still::Result<()> {
    let device = V4L2Device::open(&config.device)?;

    info!(
        card = %device.capabilities().card,
        driver = %device.capabilities().driver,
        bus = %device.capabilities().bus_info,
        "camera opened"
    );

    let mut sink = FileSink::new(&config.output);
    let summary = capture_still(device, &config.requested_format(), config.timeout, &mut sink)?;

    info!(
        format = %summary.format,
        sequence = summary.metadata.sequence,
        bytes = summary.bytes_written,
        buffer = summary.buffer_length,
        "frame captured"
    );
    println!("Image capture successful, saved to {}", sink.path().display());
    Ok(())
}
