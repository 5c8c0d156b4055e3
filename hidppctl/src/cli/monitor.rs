use std::{
    io::{BufWriter, Write},
    time::Duration,
};

use anyhow::{Context, Result};
use clap::Args;
use hidpp_core::{
    channel::ChannelError,
    feature::mlx90393_multi_sensor::{Mlx90393MultiSensorFeature, MonitorReportEvent},
};
use owo_colors::OwoColorize;
use serde_json::json;

use super::{Cli, parse_u16, parse_u8};

/// Stream samples of an MLX90393 sensor.
#[derive(Args)]
pub struct MonitorCommand {
    #[arg(value_parser = parse_u8)]
    sensor_id: u8,

    /// How many samples the device should send
    #[arg(short = 'n', long, default_value = "16", value_parser = parse_u16)]
    count: u16,

    #[arg(short, long, default_value = "0", value_parser = parse_u8)]
    threshold: u8,

    /// Stop after this many milliseconds without a sample
    #[arg(long, default_value_t = 2000)]
    idle_ms: u64,
}

impl MonitorCommand {
    pub fn execute(&self, root: &Cli) -> Result<()> {
        let mut stdout = BufWriter::new(anstream::stdout());

        let channel = root.open_channel()?;
        let sensors = channel
            .feature::<Mlx90393MultiSensorFeature>()
            .context("the device has no MLX90393 sensors")?;

        sensors.monitor_test(self.sensor_id, self.count, self.threshold)?;

        let idle = Duration::from_millis(self.idle_ms);
        let mut received = 0;
        while received < self.count {
            let report = match sensors.next_monitor_report(idle) {
                Ok(report) => report,
                Err(ChannelError::Timeout) => break,
                Err(err) => return Err(err.into()),
            };
            received += 1;

            print_report(&mut stdout, root.json, &report)?;
            stdout.flush()?;
        }

        channel.close()?;

        if !root.json && received < self.count {
            writeln!(
                stdout,
                "{}",
                format!("received {received} of {} samples", self.count).bright_black()
            )?;
            stdout.flush()?;
        }

        Ok(())
    }
}

fn print_report(out: &mut impl Write, as_json: bool, report: &MonitorReportEvent) -> Result<()> {
    if as_json {
        writeln!(
            out,
            "{}",
            json!({
                "sensor_id": report.sensor_id,
                "x": report.axis_x,
                "y": report.axis_y,
                "z": report.axis_z,
                "temperature": report.temperature,
                "arc_tangent": report.arc_tangent,
                "counter": report.counter,
            })
        )?;
        return Ok(());
    }

    writeln!(
        out,
        "{} sensor {}: x {} y {} z {} t {} atan {}",
        format!("#{:<5}", report.counter).bright_black(),
        report.sensor_id.bright_blue(),
        report.axis_x,
        report.axis_y,
        report.axis_z,
        report.temperature,
        report.arc_tangent,
    )?;

    Ok(())
}
