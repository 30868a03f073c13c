use ripc_frame::RipcVersion;
use serde::Serialize;

use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};
use crate::output::OutputFormat;

#[derive(Serialize)]
struct VersionOutput {
    name: &'static str,
    version: &'static str,
    current_wire_version: u8,
    supported_wire_versions: Option<Vec<u8>>,
}

pub fn run(args: VersionArgs, format: OutputFormat) -> CliResult<i32> {
    let out = VersionOutput {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        current_wire_version: RipcVersion::CURRENT.number(),
        supported_wire_versions: args.extended.then(|| {
            RipcVersion::ALL_DESCENDING
                .iter()
                .map(|v| v.number())
                .collect()
        }),
    };
    match format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
        ),
        _ => {
            println!("{} {}", out.name, out.version);
            println!("ripc wire version {}", out.current_wire_version);
            if let Some(supported) = out.supported_wire_versions {
                let list: Vec<String> = supported.iter().map(u8::to_string).collect();
                println!("supported wire versions: {}", list.join(", "));
            }
        }
    }
    Ok(SUCCESS)
}
