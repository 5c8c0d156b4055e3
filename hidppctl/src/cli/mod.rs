mod features;
mod list;
mod monitor;
mod ping;
mod register;

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use features::FeaturesCommand;
use hidpp_core::{channel::UsbChannel, config::TransportConfig, transport::UsbContext};
use list::ListCommand;
use monitor::MonitorCommand;
use ping::PingCommand;
use register::{ReadRegisterCommand, WriteRegisterCommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    color: colorchoice_clap::Color,

    #[command(subcommand)]
    command: Commands,

    /// Output plain JSON without color and interactivity
    #[arg(short, long, global = true)]
    json: bool,

    /// Read the transport configuration from a TOML file
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// The device to talk to, either a reader name or `vid:pid` in hex
    #[arg(short, long, global = true, value_name = "DEVICE")]
    device: Option<String>,

    /// The HID++ device index, `0xff` for devices connected by cable
    #[arg(long, global = true, default_value = "0xff", value_parser = parse_u8)]
    device_index: u8,

    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    List(ListCommand),
    Features(FeaturesCommand),
    Ping(PingCommand),
    ReadRegister(ReadRegisterCommand),
    WriteRegister(WriteRegisterCommand),
    Monitor(MonitorCommand),
}

pub fn execute() -> Result<()> {
    let cli = Cli::parse();

    cli.color.write_global();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match &cli.command {
        Commands::List(cmd) => cmd.execute(&cli),
        Commands::Features(cmd) => cmd.execute(&cli),
        Commands::Ping(cmd) => cmd.execute(&cli),
        Commands::ReadRegister(cmd) => cmd.execute(&cli),
        Commands::WriteRegister(cmd) => cmd.execute(&cli),
        Commands::Monitor(cmd) => cmd.execute(&cli),
    }
}

impl Cli {
    /// Loads the configuration file, if any, and applies `--device` on top.
    fn transport_config(&self) -> Result<TransportConfig> {
        let mut config = match &self.config {
            Some(path) => TransportConfig::load_from(path)
                .with_context(|| format!("could not load {}", path.display()))?,
            None => TransportConfig::default(),
        };

        if let Some(device) = &self.device {
            match parse_vid_pid(device) {
                Some((vendor_id, product_id)) => {
                    config.vendor_id = Some(vendor_id);
                    config.product_id = Some(product_id);
                },
                None => config.reader_name = Some(device.clone()),
            }
        }

        Ok(config)
    }

    fn open_context(&self) -> Result<Arc<UsbContext>> {
        let context = UsbContext::with_libusb(self.transport_config()?)
            .context("could not initialize libusb")?;
        context.open().context("could not open the USB context")?;
        Ok(context)
    }

    /// Opens a channel to the selected device.
    fn open_channel(&self) -> Result<Arc<UsbChannel>> {
        let context = self.open_context()?;
        let record = context.select_device().context("no matching device")?;
        debug!(reader_name = record.reader_name(), "selected device");

        let channel = UsbChannel::new(context, &record, self.device_index);
        channel
            .open()
            .with_context(|| format!("could not open {}", record.reader_name()))?;
        Ok(channel)
    }
}

fn parse_vid_pid(device: &str) -> Option<(u16, u16)> {
    let (vendor_id, product_id) = device.split_once(':')?;
    Some((
        u16::from_str_radix(vendor_id, 16).ok()?,
        u16::from_str_radix(product_id, 16).ok()?,
    ))
}

/// Parses a decimal or `0x` prefixed hexadecimal number.
fn parse_number(value: &str) -> Result<u64, String> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|err| format!("invalid number `{value}`: {err}"))
}

fn parse_u8(value: &str) -> Result<u8, String> {
    u8::try_from(parse_number(value)?).map_err(|_| format!("`{value}` does not fit in a byte"))
}

fn parse_u16(value: &str) -> Result<u16, String> {
    u16::try_from(parse_number(value)?).map_err(|_| format!("`{value}` does not fit in 16 bits"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_selectors() {
        assert_eq!(parse_vid_pid("046d:c094"), Some((0x046d, 0xc094)));
        assert_eq!(parse_vid_pid("Bus 001 Device 1->4"), None);
        assert_eq!(parse_vid_pid("zz:c094"), None);
    }

    #[test]
    fn numbers() {
        assert_eq!(parse_u8("0x0a"), Ok(0x0a));
        assert_eq!(parse_u8("17"), Ok(17));
        assert!(parse_u8("0x100").is_err());
        assert_eq!(parse_u16("0xBEEF"), Ok(0xbeef));
    }

    #[test]
    fn cli_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
