//! usb-explorer
//!
//! Command line front end for the `usb` transfer engine: list devices, dump
//! their descriptors and strings, issue control requests and run an
//! isochronous output stream.

mod config;
mod hexdump;
mod logging;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand, ValueEnum};
use config::Config;
use logging::setup_logging;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use usb::{
    Device, DeviceId, DeviceInfo, IsochronousStream, LibusbPlatform, Platform, Recipient,
    RequestType, StreamConfig, open_with,
};

#[derive(Parser, Debug)]
#[command(name = "usb-explorer")]
#[command(
    author,
    version,
    about = "USB Explorer - Inspect and talk to USB devices"
)]
#[command(long_about = "
Opens USB devices with every interface of their first configuration claimed
and performs control and isochronous transfers on them.

Devices are addressed by their bus location, e.g. 1-4.2 (bus 1, port 4, port 2).

EXAMPLES:
    # List attached devices
    usb-explorer list

    # Show the descriptor tree as JSON
    usb-explorer descriptors 1-4.2 --json

    # Read the device descriptor with a standard GET_DESCRIPTOR request
    usb-explorer control-in 1-4.2 --request 0x06 --value 0x0100 --length 18

    # Send a vendor request with a payload
    usb-explorer control-out 1-4.2 --type vendor --request 0x01 --data '01 02 03'

    # Stream silence to an isochronous endpoint until Ctrl+C
    usb-explorer stream 1-4.2 --interface 1 --alternate 1 --endpoint 0x01 --bytes-per-frame 192

    # Run with debug logging
    usb-explorer --log-level debug list

CONFIGURATION:
    usb-explorer looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usb-explorer/config.toml
    3. /etc/usb-explorer/config.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List attached devices that pass the configured filters
    List {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Print a device's descriptor tree
    Descriptors {
        id: String,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Issue a control IN request and hex dump the reply
    ControlIn {
        id: String,
        #[command(flatten)]
        request: RequestArgs,
        /// Bytes to request
        #[arg(long, value_parser = parse_u16, default_value = "64")]
        length: u16,
    },

    /// Issue a control OUT request
    ControlOut {
        id: String,
        #[command(flatten)]
        request: RequestArgs,
        /// Payload as hex, e.g. "01 02 ff"
        #[arg(long, default_value = "")]
        data: String,
    },

    /// Print supported languages and the identification strings
    Strings { id: String },

    /// Keep an isochronous OUT endpoint fed with silence until Ctrl+C
    Stream {
        id: String,
        /// Interface number owning the endpoint
        #[arg(long, value_parser = parse_u8)]
        interface: u8,
        /// Alternate setting to select first
        #[arg(long, value_parser = parse_u8)]
        alternate: Option<u8>,
        /// Endpoint address
        #[arg(long, value_parser = parse_u8)]
        endpoint: u8,
        /// Bytes sent in each bus frame
        #[arg(long)]
        bytes_per_frame: usize,
    },

    /// Save the default configuration to the default location and exit
    SaveConfig,
}

#[derive(clap::Args, Debug)]
struct RequestArgs {
    #[arg(long, value_enum, default_value_t = RecipientArg::Device)]
    recipient: RecipientArg,
    #[arg(long = "type", value_enum, default_value_t = TypeArg::Standard)]
    kind: TypeArg,
    /// bRequest
    #[arg(long, value_parser = parse_u8)]
    request: u8,
    /// wValue
    #[arg(long, value_parser = parse_u16, default_value = "0")]
    value: u16,
    /// wIndex
    #[arg(long, value_parser = parse_u16, default_value = "0")]
    index: u16,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum RecipientArg {
    Device,
    Interface,
    Endpoint,
    Other,
}

impl From<RecipientArg> for Recipient {
    fn from(arg: RecipientArg) -> Self {
        match arg {
            RecipientArg::Device => Recipient::Device,
            RecipientArg::Interface => Recipient::Interface,
            RecipientArg::Endpoint => Recipient::Endpoint,
            RecipientArg::Other => Recipient::Other,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum TypeArg {
    Standard,
    Class,
    Vendor,
}

impl From<TypeArg> for RequestType {
    fn from(arg: TypeArg) -> Self {
        match arg {
            TypeArg::Standard => RequestType::Standard,
            TypeArg::Class => RequestType::Class,
            TypeArg::Vendor => RequestType::Vendor,
        }
    }
}

/// Decimal or `0x` prefixed hex
fn parse_u16(s: &str) -> Result<u16, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid number '{}': {}", s, e))
}

fn parse_u8(s: &str) -> Result<u8, String> {
    let value = parse_u16(s)?;
    u8::try_from(value).map_err(|_| format!("'{}' does not fit in a byte", s))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Command::SaveConfig = args.command {
        let config = Config::default();
        let path = args.config.unwrap_or_else(Config::default_path);
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        Config::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        Config::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.general.log_level);

    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usb-explorer v{}", env!("CARGO_PKG_VERSION"));

    let platform = Arc::new(
        LibusbPlatform::new()
            .context("Failed to initialise libusb")?
            .with_timeout(config.usb.timeout()),
    );

    match args.command {
        Command::List { json } => {
            let filters = config.usb.clone();
            let devices = blocking(move || {
                let devices = platform.enumerate()?;
                Ok(devices
                    .into_iter()
                    .filter(|d| filters.allows(d.vendor_id, d.product_id))
                    .collect::<Vec<DeviceInfo>>())
            })
            .await?;
            print_devices(&devices, json)
        }
        Command::Descriptors { id, json } => {
            blocking(move || {
                let device = open_device(&platform, &id)?;
                let descriptors = device.descriptors()?;
                if json {
                    println!("{}", serde_json::to_string_pretty(descriptors)?);
                } else {
                    print!("{}", descriptors);
                }
                Ok(())
            })
            .await
        }
        Command::ControlIn {
            id,
            request,
            length,
        } => {
            blocking(move || {
                let device = open_device(&platform, &id)?;
                let data = device.control_in_sync(
                    request.recipient.into(),
                    request.kind.into(),
                    request.request,
                    request.value,
                    request.index,
                    length,
                )?;
                println!("{} of {} bytes", data.len(), length);
                print!("{}", hexdump::hexdump(&data));
                Ok(())
            })
            .await
        }
        Command::ControlOut { id, request, data } => {
            let payload = hexdump::parse_hex(&data).map_err(|e| anyhow!(e))?;
            blocking(move || {
                let device = open_device(&platform, &id)?;
                device.control_out_sync(
                    request.recipient.into(),
                    request.kind.into(),
                    request.request,
                    request.value,
                    request.index,
                    &payload,
                )?;
                println!("Sent {} bytes", payload.len());
                Ok(())
            })
            .await
        }
        Command::Strings { id } => {
            blocking(move || {
                let device = open_device(&platform, &id)?;
                print_strings(&device)
            })
            .await
        }
        Command::Stream {
            id,
            interface,
            alternate,
            endpoint,
            bytes_per_frame,
        } => {
            let stream_config = StreamConfig::from(&config.stream);
            run_stream(
                platform,
                id,
                interface,
                alternate,
                endpoint,
                bytes_per_frame,
                stream_config,
            )
            .await
        }
        Command::SaveConfig => Ok(()),
    }
}

/// Run device work off the async runtime
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .context("Device task panicked")?
}

fn open_device(platform: &LibusbPlatform, id: &str) -> Result<Device> {
    let id = DeviceId::new(id);
    open_with(platform, &id).with_context(|| format!("Failed to open device {}", id))
}

fn print_devices(devices: &[DeviceInfo], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(devices)?);
        return Ok(());
    }

    if devices.is_empty() {
        println!("No devices found");
        return Ok(());
    }

    for device in devices {
        println!("{}", device);
        if !device.serial.is_empty() {
            println!("    Serial: {}", device.serial);
        }
    }
    Ok(())
}

fn print_strings(device: &Device) -> Result<()> {
    let languages = device.language_ids()?;
    let list: Vec<String> = languages.iter().map(|l| format!("{:#06x}", l)).collect();
    println!("Languages:    {}", list.join(", "));

    let Some(&language) = languages.first() else {
        bail!("Device reports no string languages");
    };
    println!("Manufacturer: {}", device.manufacturer(language)?);
    println!("Product:      {}", device.product(language)?);
    println!("Serial:       {}", device.serial(language)?);
    Ok(())
}

async fn run_stream(
    platform: Arc<LibusbPlatform>,
    id: String,
    interface: u8,
    alternate: Option<u8>,
    endpoint: u8,
    bytes_per_frame: usize,
    config: StreamConfig,
) -> Result<()> {
    let stream = blocking(move || {
        let device = open_device(&platform, &id)?;
        if let Some(alternate) = alternate {
            device.set_alternate(interface, alternate)?;
        }
        let stream = IsochronousStream::start(
            Arc::new(device),
            interface,
            endpoint,
            bytes_per_frame,
            config,
        )?;
        Ok(stream)
    })
    .await?;

    info!(
        "Streaming {} bytes per frame to endpoint {:#04x}, press Ctrl+C to stop",
        bytes_per_frame, endpoint
    );

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            result = signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl+C")?;
                info!("Stopping stream");
                break;
            }
            _ = ticker.tick() => {
                if !stream.is_running() {
                    break;
                }
                info!(
                    "Frame {}, {} transfers submitted",
                    stream.current_frame_number().unwrap_or_default(),
                    stream.submitted_transfers()
                );
            }
        }
    }

    let failure = stream.failure();
    // Dropping waits for every queued transfer
    blocking(move || {
        drop(stream);
        Ok(())
    })
    .await?;

    if let Some(err) = failure {
        warn!("Stream ended early");
        return Err(err).context("Isochronous stream failed");
    }
    Ok(())
}
