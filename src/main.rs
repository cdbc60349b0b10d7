use std::path::PathBuf;
use std::time::Duration;

use btleplug::api::BDAddr;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use nrf_legacy_dfu::{
    find_device, provision_with, write_mode, DeviceFilter, DfuEvent, Diagnostics, FirmwareImage, ImageType,
    TransferOptions,
};

/// Time given to the application to reboot into its bootloader.
const REBOOT_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum ImageArg {
    Softdevice,
    Bootloader,
    Application,
}

impl From<ImageArg> for ImageType {
    fn from(arg: ImageArg) -> Self {
        match arg {
            ImageArg::Softdevice => ImageType::SoftDevice,
            ImageArg::Bootloader => ImageType::Bootloader,
            ImageArg::Application => ImageType::Application,
        }
    }
}

/// Update firmware on nRF targets running the legacy BLE DFU bootloader
#[derive(clap::Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// BLE DFU target name
    #[arg(short, long, default_value = "")]
    name: String,

    /// BLE Address
    #[arg(short, long, default_value = "")]
    addr: String,

    /// Firmware image (.bin) or legacy DFU package (.zip)
    #[arg(short, long)]
    pkg: PathBuf,

    /// Component contained in a raw image; packages carry their own
    #[arg(short, long, value_enum, default_value = "application")]
    image_type: ImageArg,

    /// Switch a running application into its bootloader first
    #[arg(long)]
    enter_dfu: bool,

    /// Seconds to wait for each device event before giving up
    #[arg(long)]
    timeout: Option<u64>,

    /// Seconds to scan for the target before giving up
    #[arg(long)]
    scan_timeout: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn init_tracing(verbose: bool) -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn progress_logger(diag: &Diagnostics, len: usize) -> Result<ProgressBar, Box<dyn std::error::Error>> {
    let bar = ProgressBar::new(len as u64);
    bar.set_style(ProgressStyle::with_template("{msg:30} [{bar:40}] {bytes}/{total_bytes}")?);
    let sink = bar.clone();
    diag.add_logger(move |event| match event {
        DfuEvent::Progress { sent, .. } => sink.set_position(*sent as u64),
        DfuEvent::Message(message) => sink.set_message(message.clone()),
        DfuEvent::Error(message) => sink.println(message),
    });
    Ok(bar)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing(args.verbose)?;

    let image = FirmwareImage::load(&args.pkg, args.image_type.into())?;
    tracing::info!(image_type = ?image.image_type(), len = image.len(), "Loaded firmware");

    let address = match args.addr.as_str() {
        "" => None,
        addr => Some(addr.parse::<BDAddr>()?),
    };
    let filter = DeviceFilter {
        name: Some(args.name).filter(|n| !n.is_empty()),
        address,
    };
    let device = find_device(&filter, args.scan_timeout.map(Duration::from_secs)).await?;

    let diag = Diagnostics::new();
    let bar = progress_logger(&diag, image.len())?;

    if args.enter_dfu {
        write_mode(&device, &diag).await?;
        tokio::time::sleep(REBOOT_DELAY).await;
    }

    let options = TransferOptions {
        event_timeout: args.timeout.map(Duration::from_secs),
        ..TransferOptions::default()
    };
    let result = provision_with(&device, &image, &options, &diag).await;
    match &result {
        Ok(()) => bar.finish_with_message("update complete"),
        Err(_) => bar.abandon(),
    }
    Ok(result?)
}
