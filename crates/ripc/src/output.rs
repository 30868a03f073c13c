use std::io::IsTerminal;

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use ripc_session::ChannelInfo;
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct InfoOutput<'a> {
    schema_id: &'static str,
    remote: String,
    ripc_version: u8,
    major_version: u8,
    minor_version: u8,
    compression: String,
    compression_level: u8,
    ping_timeout_secs: u8,
    max_fragment_size: usize,
    peer_component: Option<&'a str>,
}

pub fn print_channel_info(remote: &str, info: &ChannelInfo, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = InfoOutput {
                schema_id: "https://schemas.3leaps.dev/ripc/cli/v1/channel-info.schema.json",
                remote: remote.to_string(),
                ripc_version: info.version.number(),
                major_version: info.major_version,
                minor_version: info.minor_version,
                compression: info.compression.to_string(),
                compression_level: info.compression_level,
                ping_timeout_secs: info.ping_timeout,
                max_fragment_size: info.max_fragment_size,
                peer_component: info.peer_component_version.as_deref(),
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["FIELD", "VALUE"])
                .add_row(vec!["remote".to_string(), remote.to_string()])
                .add_row(vec![
                    "ripc version".to_string(),
                    info.version.number().to_string(),
                ])
                .add_row(vec![
                    "app protocol".to_string(),
                    format!("{}.{}", info.major_version, info.minor_version),
                ])
                .add_row(vec![
                    "compression".to_string(),
                    format!("{} (level {})", info.compression, info.compression_level),
                ])
                .add_row(vec![
                    "ping timeout".to_string(),
                    format!("{}s", info.ping_timeout),
                ])
                .add_row(vec![
                    "max fragment".to_string(),
                    info.max_fragment_size.to_string(),
                ])
                .add_row(vec![
                    "peer component".to_string(),
                    info.peer_component_version.clone().unwrap_or_default(),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "remote={} version={} app={}.{} compression={}/{} ping={}s fragment={} component={}",
                remote,
                info.version,
                info.major_version,
                info.minor_version,
                info.compression,
                info.compression_level,
                info.ping_timeout,
                info.max_fragment_size,
                info.peer_component_version.as_deref().unwrap_or("-"),
            );
        }
    }
}
