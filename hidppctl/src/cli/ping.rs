use std::{
    io::{BufWriter, Write},
    time::Instant,
};

use anyhow::{Result, ensure};
use clap::Args;
use owo_colors::OwoColorize;
use serde_json::json;

use super::{Cli, parse_u8};

/// Ping a device through its Root feature.
#[derive(Args)]
pub struct PingCommand {
    /// The byte the device is expected to echo
    #[arg(default_value = "0x5a", value_parser = parse_u8)]
    data: u8,

    /// How many pings to send
    #[arg(short = 'n', long, default_value_t = 1)]
    count: u32,
}

impl PingCommand {
    pub fn execute(&self, root: &Cli) -> Result<()> {
        let mut stdout = BufWriter::new(anstream::stdout());

        let channel = root.open_channel()?;
        let feature = channel.root();

        for _ in 0..self.count {
            let started = Instant::now();
            let echoed = feature.ping(self.data)?;
            let elapsed = started.elapsed();
            ensure!(
                echoed == self.data,
                "device echoed {echoed:#04x} instead of {:#04x}",
                self.data
            );

            if root.json {
                writeln!(
                    stdout,
                    "{}",
                    json!({ "data": echoed, "elapsed_us": elapsed.as_micros() as u64 })
                )?;
            } else {
                writeln!(
                    stdout,
                    "{}: {} {}",
                    channel.reader_name(),
                    format!("{echoed:#04x}").green(),
                    format!("{:.2?}", elapsed).bright_black()
                )?;
            }
            stdout.flush()?;
        }

        channel.close()?;

        Ok(())
    }
}
