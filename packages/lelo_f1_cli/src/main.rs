//! lelo-f1 - command line front-end for the F1s client
//!
//! Commands:
//! - scan: list nearby F1s devices
//! - info: print identity, battery and sensor readings
//! - read: read one feature by name
//! - motor: set both motor speeds (waits for the central button)
//! - stop: stop both motors
//! - shutdown: power the device off
//! - watch: stream notifications as JSON lines until Ctrl-C
//!
//! The address comes from `--address`, then the saved profile, then a scan.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use lelo_f1::ble::simulated::{SimCentral, SimulatedF1};
use lelo_f1::ble::transport::GattCentral;
use lelo_f1::{ClientConfig, F1Client, ProfileStore, Subscription};
use log::{info, warn};
use serde::Serialize;

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

const SIMULATED_ADDRESS: &str = "C4:64:E3:00:45:5B";

#[derive(Parser)]
#[command(name = "lelo-f1")]
#[command(about = "Inspect and drive a LELO F1s over BLE", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Device address; defaults to the saved profile, then a scan
    #[arg(short, long, global = true)]
    address: Option<String>,

    /// JSON client configuration
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Where the last connection profile is kept
    #[arg(long, global = true, default_value = ".")]
    profile_dir: PathBuf,

    /// Talk to an in-process simulated device instead of the radio
    #[arg(long, global = true)]
    simulate: bool,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// List nearby F1s devices
    Scan {
        /// Scan duration in seconds
        #[arg(short, long, default_value_t = 5)]
        duration: u64,
    },
    /// Print identity, battery and sensor readings
    Info,
    /// Read one feature by name (e.g. battery_level, motor_speed)
    Read { feature: String },
    /// Set main and vibration motor speeds, 0-100
    Motor {
        main: u8,
        vibration: u8,
        /// Seconds to wait for the central button press
        #[arg(long, default_value_t = 30)]
        wait: u64,
    },
    /// Stop both motors
    Stop,
    /// Power the device off
    Shutdown,
    /// Stream notifications until Ctrl-C
    Watch {
        #[arg(value_enum)]
        stream: Stream,
        /// Only print values that changed
        #[arg(long)]
        distinct: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Stream {
    KeyState,
    Buttons,
    Depth,
    Rotation,
    Accelerometer,
    Temperature,
}

#[tokio::main]
async fn main() -> CliResult<()> {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    let config = match &cli.config {
        Some(path) => ClientConfig::from_json_file(path)?,
        None => ClientConfig::default(),
    };
    let (central, simulated) = open_central(cli.simulate).await?;
    let client = Arc::new(F1Client::new(central, config));

    match cli.command {
        Commands::Scan { duration } => scan(&client, Duration::from_secs(duration)).await,
        ref command => {
            connect(&cli, &client, simulated.as_ref()).await?;
            let outcome = run(command, &client).await;
            if client.is_connected() {
                if let Err(e) = client.disconnect().await {
                    warn!("disconnect failed: {}", e);
                }
            }
            outcome
        }
    }
}

async fn open_central(
    simulate: bool,
) -> CliResult<(Arc<dyn GattCentral>, Option<SimulatedF1>)> {
    if simulate {
        let device = SimulatedF1::new(SIMULATED_ADDRESS);
        let central: Arc<dyn GattCentral> =
            Arc::new(SimCentral::with_devices(vec![device.clone()]));
        return Ok((central, Some(device)));
    }
    hardware_central().await.map(|central| (central, None))
}

#[cfg(feature = "ble-central")]
async fn hardware_central() -> CliResult<Arc<dyn GattCentral>> {
    let central = lelo_f1::ble::btleplug::BtleplugCentral::new().await?;
    Ok(Arc::new(central))
}

#[cfg(not(feature = "ble-central"))]
async fn hardware_central() -> CliResult<Arc<dyn GattCentral>> {
    Err("built without the ble-central feature; use --simulate or rebuild with --features ble-central".into())
}

async fn scan(client: &F1Client, duration: Duration) -> CliResult<()> {
    let found = client.discover(duration, None).await?;
    if found.is_empty() {
        println!("No F1s devices found");
    }
    for peripheral in found {
        println!(
            "{}  {}  rssi {}",
            peripheral.address,
            peripheral.name.as_deref().unwrap_or("?"),
            peripheral
                .rssi
                .map(|r| r.to_string())
                .unwrap_or_else(|| "?".into())
        );
    }
    Ok(())
}

async fn connect(cli: &Cli, client: &F1Client, simulated: Option<&SimulatedF1>) -> CliResult<()> {
    let store = ProfileStore::new(&cli.profile_dir);
    let config = client.config().clone();

    let profile = if let Some(address) = &cli.address {
        client.connect(address, config.connect_timeout).await?
    } else if let Some(saved) = store.load()?.filter(|_| simulated.is_none()) {
        info!("reconnecting to saved device {}", saved.address);
        client.connect_profile(&saved).await?
    } else {
        let found = client.discover(config.discover_timeout, None).await?;
        let Some(first) = found.first() else {
            return Err("no F1s devices found".into());
        };
        client.connect(&first.address, config.connect_timeout).await?
    };
    store.save(&profile)?;

    if let Some(device) = simulated {
        // Nobody is holding the simulated device; press the button for them.
        device.press_central_button();
    }
    Ok(())
}

async fn run(command: &Commands, client: &Arc<F1Client>) -> CliResult<()> {
    match command {
        Commands::Scan { .. } => Ok(()),
        Commands::Info => info_report(client).await,
        Commands::Read { feature } => {
            let value = client.read_by_name(feature).await?;
            println!("{}: {}", feature, value);
            Ok(())
        }
        Commands::Motor {
            main,
            vibration,
            wait,
        } => {
            wait_for_button(client, Duration::from_secs(*wait)).await?;
            client.set_motors_speed(*main, *vibration).await?;
            println!("Motors set to {} / {}", main, vibration);
            Ok(())
        }
        Commands::Stop => {
            client.stop_motors().await?;
            println!("Motors stopped");
            Ok(())
        }
        Commands::Shutdown => {
            wait_for_button(client, Duration::from_secs(30)).await?;
            client.shutdown().await?;
            println!("Device powered off");
            Ok(())
        }
        Commands::Watch { stream, distinct } => watch(client, *stream, *distinct).await,
    }
}

async fn info_report(client: &F1Client) -> CliResult<()> {
    println!("Manufacturer: {}", client.get_manufacturer_name().await?);
    println!("Model:        {}", client.get_model_number().await?);
    println!("Firmware:     {}", client.get_firmware_revision().await?);
    println!("Hardware:     {}", client.get_hardware_revision().await?);
    println!("MAC:          {}", client.get_mac_address().await?);
    println!("Battery:      {}%", client.get_battery_level().await?);

    if !client.get_key_state(false).await? {
        println!("Press the central button to read sensors");
        return Ok(());
    }
    let tp = client.get_temperature_and_pressure().await?;
    println!("Temperature:  {:.2} °C", tp.temperature);
    println!("Pressure:     {:.2} mbar", tp.pressure);
    let motors = client.get_motors_speed().await?;
    println!("Motors:       {} / {}", motors.main, motors.vibration);
    println!("Use count:    {}", client.get_use_count().await?);
    Ok(())
}

/// Poll the key state until the user presses the central button.
async fn wait_for_button(client: &F1Client, wait: Duration) -> CliResult<()> {
    let poll = async {
        loop {
            if client.get_key_state(false).await? {
                return Ok::<(), lelo_f1::F1Error>(());
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    };
    if !client.get_key_state(false).await? {
        println!("Press the central button on the device...");
    }
    match tokio::time::timeout(wait, poll).await {
        Ok(result) => Ok(result?),
        Err(_) => Err("central button was not pressed in time".into()),
    }
}

fn print_json<T: Serialize>(value: T) {
    match serde_json::to_string(&value) {
        Ok(line) => println!("{}", line),
        Err(e) => warn!("could not encode notification: {}", e),
    }
}

async fn watch(client: &F1Client, stream: Stream, distinct: bool) -> CliResult<()> {
    let subscription: Subscription = match stream {
        Stream::KeyState => client.notify_key_state(distinct, print_json).await?,
        Stream::Buttons => client.notify_buttons(distinct, print_json).await?,
        Stream::Depth => client.notify_depth(distinct, print_json).await?,
        Stream::Rotation => client.notify_rotation_speed(distinct, print_json).await?,
        Stream::Accelerometer => client.notify_accelerometer(distinct, print_json).await?,
        Stream::Temperature => {
            client
                .notify_temperature_and_pressure(distinct, print_json)
                .await?
        }
    };
    info!("watching {:?}; Ctrl-C to stop", stream);

    tokio::signal::ctrl_c().await?;
    client.unregister(&subscription).await?;
    Ok(())
}
