use std::io::{BufWriter, Write};

use anyhow::{Context, Result};
use clap::Args;
use hidpp_core::feature::mlx90393_multi_sensor::Mlx90393MultiSensorFeature;
use owo_colors::OwoColorize;
use serde_json::json;

use super::{Cli, parse_u16, parse_u8};

/// Read a register of one of the MLX90393 sensors.
#[derive(Args)]
pub struct ReadRegisterCommand {
    #[arg(value_parser = parse_u8)]
    sensor_id: u8,

    #[arg(value_parser = parse_u8)]
    reg_addr: u8,
}

impl ReadRegisterCommand {
    pub fn execute(&self, root: &Cli) -> Result<()> {
        let channel = root.open_channel()?;
        let sensors = channel
            .feature::<Mlx90393MultiSensorFeature>()
            .context("the device has no MLX90393 sensors")?;

        let reg_value = sensors.read_sensor_register(self.sensor_id, self.reg_addr)?;
        channel.close()?;

        print_register(root, self.sensor_id, self.reg_addr, reg_value)
    }
}

/// Write a register of one of the MLX90393 sensors.
#[derive(Args)]
pub struct WriteRegisterCommand {
    #[arg(value_parser = parse_u8)]
    sensor_id: u8,

    #[arg(value_parser = parse_u8)]
    reg_addr: u8,

    #[arg(value_parser = parse_u16)]
    reg_value: u16,
}

impl WriteRegisterCommand {
    pub fn execute(&self, root: &Cli) -> Result<()> {
        let channel = root.open_channel()?;
        let sensors = channel
            .feature::<Mlx90393MultiSensorFeature>()
            .context("the device has no MLX90393 sensors")?;

        let response = sensors.write_sensor_register(self.sensor_id, self.reg_addr, self.reg_value)?;
        channel.close()?;

        print_register(root, response.sensor_id, response.reg_addr, response.reg_value)
    }
}

fn print_register(root: &Cli, sensor_id: u8, reg_addr: u8, reg_value: u16) -> Result<()> {
    let mut stdout = BufWriter::new(anstream::stdout());

    if root.json {
        writeln!(
            stdout,
            "{}",
            json!({ "sensor_id": sensor_id, "reg_addr": reg_addr, "reg_value": reg_value })
        )?;
    } else {
        writeln!(
            stdout,
            "sensor {} register {}: {}",
            sensor_id.bright_blue(),
            format!("{reg_addr:#04x}").bright_blue(),
            format!("{reg_value:#06x}").green()
        )?;
    }

    stdout.flush()?;

    Ok(())
}
