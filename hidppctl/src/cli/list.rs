use std::io::{BufWriter, Write};

use anyhow::Result;
use clap::Args;
use hidpp_core::transport::device::DeviceState;
use itertools::Itertools;
use owo_colors::OwoColorize;
use serde::Serialize;
use serde_json::json;

use super::Cli;

/// List the USB devices matching the configured selector.
#[derive(Args)]
pub struct ListCommand {}

impl ListCommand {
    pub fn execute(&self, root: &Cli) -> Result<()> {
        let mut stdout = BufWriter::new(anstream::stdout());

        let context = root.open_context()?;
        let devices = context
            .devices()
            .into_iter()
            .map(|record| {
                let info = record.info();
                ListedDevice {
                    reader_name: record.reader_name().to_string(),
                    vendor_id: info.vendor_id,
                    product_id: info.product_id,
                    state: record.state(),
                    interfaces: info.interfaces.iter().map(|iface| iface.number).collect(),
                }
            })
            .collect::<Vec<_>>();
        context.close()?;

        if root.json {
            writeln!(stdout, "{}", json!(devices))?;
            return Ok(());
        }

        if devices.is_empty() {
            writeln!(stdout, "{}", "No matching USB devices were found.".bright_black())?;
            return Ok(());
        }

        for device in devices {
            writeln!(
                stdout,
                "{} ({:#06x}:{:#06x}) {:?} {}",
                device.reader_name.bright_blue(),
                device.vendor_id.bright_black(),
                device.product_id.bright_black(),
                device.state.green(),
                format!("interfaces {}", device.interfaces.iter().join(", ")).bright_black(),
            )?;
        }

        stdout.flush()?;

        Ok(())
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize)]
struct ListedDevice {
    reader_name: String,
    vendor_id: u16,
    product_id: u16,
    state: DeviceState,
    interfaces: Vec<u8>,
}
