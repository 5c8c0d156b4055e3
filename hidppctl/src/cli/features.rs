use std::io::{BufWriter, Write};

use anyhow::{Context, Result};
use clap::Args;
use hidpp_core::{feature::registry, protocol::ProtocolVersion};
use owo_colors::OwoColorize;
use serde::Serialize;
use serde_json::json;

use super::Cli;

/// Enumerate the feature table of a device.
#[derive(Args)]
pub struct FeaturesCommand {}

impl FeaturesCommand {
    pub fn execute(&self, root: &Cli) -> Result<()> {
        let mut stdout = BufWriter::new(anstream::stdout());

        let channel = root.open_channel()?;
        let protocol = channel
            .root()
            .get_protocol_version()
            .context("could not read the protocol version")?;
        let features = channel
            .enumerate_features()
            .context("could not enumerate features")?
            .into_iter()
            .map(|(index, entry)| ListedFeature {
                index,
                feature_id: entry.feature_id,
                name: registry::name(entry.feature_id),
                version: entry.version,
            })
            .collect::<Vec<_>>();
        channel.close()?;

        if root.json {
            writeln!(stdout, "{}", json!({ "protocol": protocol, "features": features }))?;
            return Ok(());
        }

        if let ProtocolVersion::V20 {
            protocol_num,
            target_sw,
        } = protocol
        {
            writeln!(
                stdout,
                "{}: HID++{}.{}",
                channel.reader_name(),
                protocol_num.bright_blue(),
                target_sw.bright_blue()
            )?;
        }

        let features_len = features.len();
        for (i, feature) in features.into_iter().enumerate() {
            writeln!(
                stdout,
                "{} {:>3}: {:#06x} {} {}",
                if i == features_len - 1 { " ╰─" } else { " ├─" },
                feature.index.bright_blue(),
                feature.feature_id,
                match feature.name {
                    Some(name) => name.green().to_string(),
                    None => "unknown".bright_black().italic().to_string(),
                },
                format!("v{}", feature.version).bright_black(),
            )?;
        }

        stdout.flush()?;

        Ok(())
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize)]
struct ListedFeature {
    index: u8,
    feature_id: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'static str>,
    version: u8,
}
