use std::sync::Arc;

use ble_rgbw_controller::*;
use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, Result};
use tokio::time::Duration;
use tracing::{debug, error, info, instrument, trace};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Scan window in seconds
    #[arg(long, global = true, default_value_t = 5)]
    scan_secs: u64,
    /// Serialize color writes so the light always ends on the newest color
    #[arg(long, global = true)]
    latest_wins: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List nearby devices
    Scan {
        /// Include devices that advertise no name
        #[arg(short, long)]
        all: bool,
    },
    /// Connect and print firmware version and battery level
    Info {
        /// Device id or address
        id: String,
    },
    /// Set a custom RGBW color
    Color {
        /// Device id or address
        id: String,
        /// Red value (0-255)
        #[arg(short, long, default_value_t = 255)]
        red: u8,
        /// Green value (0-255)
        #[arg(short, long, default_value_t = 255)]
        green: u8,
        /// Blue value (0-255)
        #[arg(short, long, default_value_t = 255)]
        blue: u8,
        /// White value (0-255)
        #[arg(short, long, default_value_t = 0)]
        white: u8,
    },
    /// Set the color from a #RRGGBB string
    Hex {
        /// Device id or address
        id: String,
        /// Color as #RRGGBB
        hex: String,
        /// White value (0-255)
        #[arg(short, long, default_value_t = 0)]
        white: u8,
    },
    /// Cycle through the primaries
    Demo {
        /// Device id or address
        id: String,
        /// Duration of each demo step in seconds
        #[arg(short, long, default_value_t = 2)]
        duration: u64,
    },
}

#[tokio::main]
#[instrument]
async fn main() -> Result<()> {
    // Initialize tracing with pretty colors
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("RUST_LOG")
                .unwrap_or_else(|_| EnvFilter::new("ble_rgbw_controller=info")),
        )
        .compact()
        .init();

    // Initialize color-eyre for pretty error reporting
    color_eyre::install()?;

    let cli = Cli::parse();
    debug!("Parsed command line arguments");

    let config = SessionConfig {
        scan_timeout: Duration::from_secs(cli.scan_secs),
        write_ordering: if cli.latest_wins {
            WriteOrdering::LatestWins
        } else {
            WriteOrdering::Unordered
        },
    };

    let transport = match BtleTransport::new().await {
        Ok(transport) => Arc::new(transport),
        Err(e) => {
            error!("Failed to initialize Bluetooth: {}", e);
            return Err(e.into());
        }
    };

    match cli.command {
        Commands::Scan { all } => {
            let filter = if all { DeviceFilter::All } else { DeviceFilter::Named };
            for device in scan(transport, filter, config.scan_timeout).await? {
                println!(
                    "{}\t{}\t{}",
                    device.id,
                    device.display_name(),
                    device
                        .rssi
                        .map(|rssi| format!("{rssi} dBm"))
                        .unwrap_or_else(|| "-".into())
                );
            }
        }
        Commands::Info { id } => {
            let session = open_connected(transport, &id, config).await?;
            let status = session.status();
            println!("Name:     {}", status.name);
            println!("Id:       {}", status.id);
            println!(
                "Firmware: {}",
                status.firmware_version.as_deref().unwrap_or("unknown")
            );
            println!(
                "Battery:  {}",
                status
                    .battery_level
                    .map(|level| format!("{level}%"))
                    .unwrap_or_else(|| "unknown".into())
            );
            session.disconnect().await?;
        }
        Commands::Color {
            id,
            red,
            green,
            blue,
            white,
        } => {
            let session = open_connected(transport, &id, config).await?;
            let command = RgbwCommand::new(red, green, blue, white);
            set_color(&session, ColorChange::Rgbw(command)).await?;
            session.disconnect().await?;
        }
        Commands::Hex { id, hex, white } => {
            let session = open_connected(transport, &id, config).await?;
            let command = RgbwCommand::default()
                .with_rgb(decode_hex_color(&hex))
                .with_white(white);
            set_color(&session, ColorChange::Rgbw(command)).await?;
            session.disconnect().await?;
        }
        Commands::Demo { id, duration } => {
            let session = open_connected(transport, &id, config).await?;
            run_demo(&session, duration).await?;
            session.disconnect().await?;
        }
    }

    Ok(())
}

/// Runs one scan window and returns everything it surfaced
#[instrument(skip(transport))]
async fn scan(
    transport: Arc<BtleTransport>,
    filter: DeviceFilter,
    timeout: Duration,
) -> Result<Vec<Device>> {
    let mut scanner = Scanner::new(transport, timeout);
    let mut events = scanner.start_scan(filter).await?;
    while let Some(event) = events.recv().await {
        match event {
            ScanEvent::Discovered(device) => {
                info!("Found {} ({})", device.display_name(), device.id)
            }
            ScanEvent::Failed(e) => return Err(e.into()),
            ScanEvent::Stopped(reason) => debug!("Scan stopped: {:?}", reason),
        }
    }
    Ok(scanner.devices())
}

/// Scans until `id` shows up, then connects to it
#[instrument(skip(transport, config))]
async fn open_connected(
    transport: Arc<BtleTransport>,
    id: &str,
    config: SessionConfig,
) -> Result<DeviceSession<BtleTransport>> {
    let wanted = id.to_lowercase();
    let filter = DeviceFilter::custom(move |device| device.id.as_str().to_lowercase() == wanted);

    let mut scanner = Scanner::new(transport.clone(), config.scan_timeout);
    let mut events = scanner.start_scan(filter).await?;
    let device = loop {
        match events.recv().await {
            Some(ScanEvent::Discovered(device)) => break device,
            Some(ScanEvent::Failed(e)) => return Err(e.into()),
            Some(ScanEvent::Stopped(_)) | None => {
                return Err(eyre!("device {id} not found within {:?}", config.scan_timeout))
            }
        }
    };
    scanner.stop_scan().await?;

    let manager = Arc::new(ConnectionManager::new(transport));
    let counters = Arc::new(DebugCounters::default());
    let session = DeviceSession::open(device, manager, counters, config).await;
    if !session.status().connected {
        session.connect().await?;
    }
    Ok(session)
}

/// Writes a color and waits until the write went out
async fn set_color(session: &DeviceSession<BtleTransport>, change: ColorChange) -> Result<()> {
    let command = session.change_color(change);
    session.flush_writes().await;

    let debug = session.debug();
    if debug.errors > 0 {
        return Err(eyre!(
            "color write failed: {}",
            debug.last_error.unwrap_or_default()
        ));
    }
    info!("Color set to {} (white {})", command.hex(), command.white);
    Ok(())
}

/// Sleep for specified number of seconds
#[instrument]
async fn sleep(seconds: u64) {
    trace!("Sleeping for {}s", seconds);
    tokio::time::sleep(Duration::from_secs(seconds)).await;
    trace!("Sleep completed");
}

/// Run a demonstration of the color channels
#[instrument(skip(session))]
async fn run_demo(session: &DeviceSession<BtleTransport>, duration: u64) -> Result<()> {
    info!("Running RGBW demo with {}s intervals", duration);

    let steps = [
        ("red", RgbwCommand::new(255, 0, 0, 0)),
        ("green", RgbwCommand::new(0, 255, 0, 0)),
        ("blue", RgbwCommand::new(0, 0, 255, 0)),
        ("white", RgbwCommand::new(0, 0, 0, 255)),
        ("all channels", RgbwCommand::new(255, 255, 255, 255)),
    ];
    for (label, command) in steps {
        info!("Setting color to {}", label);
        set_color(session, ColorChange::Rgbw(command)).await?;
        sleep(duration).await;
    }

    info!("Turning all channels off to end demo");
    set_color(session, ColorChange::Rgbw(RgbwCommand::default())).await?;

    let stats = session.debug();
    info!(
        "Demo completed! {} write(s), {} error(s)",
        stats.successes, stats.errors
    );
    Ok(())
}
