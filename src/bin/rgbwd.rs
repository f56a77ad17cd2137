use std::collections::BTreeMap;
use std::sync::Arc;

use ble_rgbw_controller::*;
use color_eyre::eyre::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Screen the driver is on. Device-only commands are refused at home.
enum Route {
    Home,
    Device(Device),
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Scan,
    Open(DeviceId),
    Connect,
    Disconnect,
    Color(RgbwCommand),
    Hex(String),
    Channel(Channel, u8),
    Status,
    Debug,
    Back,
    Quit,
}

fn parse_command(line: &str) -> std::result::Result<Command, String> {
    let (name, args) = match line.split_once(':') {
        Some((name, args)) => (name.trim(), Some(args.trim())),
        None => (line.trim(), None),
    };
    let required = |what: &str| {
        args.filter(|a| !a.is_empty())
            .ok_or(format!("{name} needs {what}"))
    };

    match name {
        "scan" => Ok(Command::Scan),
        "open" => Ok(Command::Open(DeviceId::from(required("a device id")?))),
        "connect" => Ok(Command::Connect),
        "disconnect" => Ok(Command::Disconnect),
        "color" => {
            let values = required("R,G,B,W")?
                .split(',')
                .map(|v| v.trim().parse::<i64>().map_err(|e| format!("invalid value {v:?}: {e}")))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            let [red, green, blue, white] = values[..] else {
                return Err("Invalid color format. Use R,G,B,W (e.g., 255,0,0,0 for red)".into());
            };
            RgbwCommand::from_channels(red, green, blue, white)
                .map(Command::Color)
                .map_err(|e| e.to_string())
        }
        "hex" => Ok(Command::Hex(required("#RRGGBB")?.to_string())),
        "channel" => {
            let (channel, value) = required("<r|g|b|w>,<value>")?
                .split_once(',')
                .ok_or("Invalid channel format. Use <r|g|b|w>,<value>")?;
            let channel = match channel.trim() {
                "r" => Channel::Red,
                "g" => Channel::Green,
                "b" => Channel::Blue,
                "w" => Channel::White,
                other => return Err(format!("Unknown channel: {other}")),
            };
            let value = value
                .trim()
                .parse::<u8>()
                .map_err(|_| "Channel value must be between 0 and 255".to_string())?;
            Ok(Command::Channel(channel, value))
        }
        "status" => Ok(Command::Status),
        "debug" => Ok(Command::Debug),
        "back" => Ok(Command::Back),
        "quit" => Ok(Command::Quit),
        "" => Err("No command given".into()),
        other => Err(format!("Unknown command: {other}")),
    }
}

struct Driver {
    transport: Arc<BtleTransport>,
    manager: Arc<ConnectionManager<BtleTransport>>,
    counters: Arc<DebugCounters>,
    config: SessionConfig,
    known: BTreeMap<DeviceId, Device>,
    route: Route,
    session: Option<DeviceSession<BtleTransport>>,
}

impl Driver {
    fn new(transport: Arc<BtleTransport>, config: SessionConfig) -> Self {
        Self {
            manager: Arc::new(ConnectionManager::new(transport.clone())),
            transport,
            counters: Arc::new(DebugCounters::default()),
            config,
            known: BTreeMap::new(),
            route: Route::Home,
            session: None,
        }
    }

    async fn navigate(&mut self, route: Route) {
        // The old view unregisters its listener before the new one opens.
        self.session = None;
        if let Route::Device(device) = &route {
            let session = DeviceSession::open(
                device.clone(),
                self.manager.clone(),
                self.counters.clone(),
                self.config.clone(),
            )
            .await;
            self.session = Some(session);
        }
        self.route = route;
    }

    fn device_session(&self) -> std::result::Result<&DeviceSession<BtleTransport>, String> {
        match (&self.route, &self.session) {
            (Route::Device(_), Some(session)) => Ok(session),
            _ => Err("No device open, use open:<id> first".into()),
        }
    }

    /// Runs one command. `Ok(false)` ends the loop.
    async fn execute(&mut self, command: Command) -> std::result::Result<bool, String> {
        match command {
            Command::Scan => {
                if !matches!(self.route, Route::Home) {
                    return Err("scan is only available on the home screen".into());
                }
                let mut scanner = Scanner::new(self.transport.clone(), self.config.scan_timeout);
                let mut events = scanner
                    .start_scan(DeviceFilter::Named)
                    .await
                    .map_err(|e| e.to_string())?;
                while let Some(event) = events.recv().await {
                    match event {
                        ScanEvent::Discovered(device) => {
                            println!("DEVICE {} {}", device.id, device.display_name());
                        }
                        ScanEvent::Failed(e) => return Err(e.to_string()),
                        ScanEvent::Stopped(reason) => debug!("Scan stopped: {:?}", reason),
                    }
                }
                self.known = scanner
                    .devices()
                    .into_iter()
                    .map(|device| (device.id.clone(), device))
                    .collect();
            }
            Command::Open(id) => {
                let device = self
                    .known
                    .get(&id)
                    .cloned()
                    .ok_or(format!("Unknown device {id}, run scan first"))?;
                self.navigate(Route::Device(device)).await;
            }
            Command::Back => self.navigate(Route::Home).await,
            Command::Connect => {
                self.device_session()?
                    .connect()
                    .await
                    .map_err(|e| e.to_string())?;
            }
            Command::Disconnect => {
                self.device_session()?
                    .disconnect()
                    .await
                    .map_err(|e| e.to_string())?;
            }
            Command::Color(command) => {
                self.device_session()?.change_color(ColorChange::Rgbw(command));
            }
            Command::Hex(hex) => {
                self.device_session()?.change_color(ColorChange::Hex(hex));
            }
            Command::Channel(channel, value) => {
                self.device_session()?
                    .change_color(ColorChange::Channel(channel, value));
            }
            Command::Status => {
                let session = self.device_session()?;
                let status = session.status();
                let color = session.color();
                println!(
                    "STATUS id={} name={:?} connected={} connecting={} firmware={} battery={} color={} white={}{}",
                    status.id,
                    status.name,
                    status.connected,
                    status.connecting,
                    status.firmware_version.as_deref().unwrap_or("-"),
                    status
                        .battery_level
                        .map(|level| level.to_string())
                        .unwrap_or_else(|| "-".into()),
                    color.hex,
                    color.command.white,
                    status
                        .error
                        .map(|error| format!(" error={error:?}"))
                        .unwrap_or_default(),
                );
            }
            Command::Debug => {
                let debug = self.counters.snapshot();
                println!(
                    "DEBUG successes={} errors={} last_error={:?} at={}",
                    debug.successes,
                    debug.errors,
                    debug.last_error.unwrap_or_default(),
                    debug
                        .last_error_at
                        .map(|at| at.to_rfc3339())
                        .unwrap_or_else(|| "-".into()),
                );
            }
            Command::Quit => return Ok(false),
        }
        Ok(true)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("RUST_LOG")
                .unwrap_or_else(|_| EnvFilter::new("ble_rgbw_controller=info")),
        )
        .with_writer(std::io::stderr)
        .compact()
        .init();
    color_eyre::install()?;

    let config = SessionConfig {
        write_ordering: if std::env::args().any(|arg| arg == "--latest-wins") {
            WriteOrdering::LatestWins
        } else {
            WriteOrdering::Unordered
        },
        ..SessionConfig::default()
    };

    let transport = Arc::new(BtleTransport::new().await?);
    let mut driver = Driver::new(transport, config);

    // Inform about successful initialization
    println!("OK");

    // Mainloop: wait for user input, line by line
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                None
            }
        };
        let Some(line) = line else {
            break;
        };

        let outcome = match parse_command(&line) {
            Ok(command) => driver.execute(command).await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(true) => println!("OK"),
            Ok(false) => {
                println!("OK");
                break;
            }
            Err(e) => {
                warn!("Command {:?} failed: {}", line, e);
                eprintln!("ERR {e}");
            }
        }
    }

    if let Some(session) = driver.session.take() {
        session.flush_writes().await;
    }
    Ok(())
}
