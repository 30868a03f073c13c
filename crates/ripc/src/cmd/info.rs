use ripc_session::{Channel, ConnectOptions};

use crate::cmd::InfoArgs;
use crate::exit::{session_error, CliError, CliResult, INTERNAL, SUCCESS};
use crate::output::{print_channel_info, OutputFormat};

pub fn run(args: InfoArgs, format: OutputFormat) -> CliResult<i32> {
    let options = ConnectOptions::new(args.address)
        .with_compression(args.compression.as_compression())
        .with_blocking(true);
    let mut channel =
        Channel::connect(options).map_err(|err| session_error("connect failed", err))?;
    let info = channel
        .info()
        .cloned()
        .ok_or_else(|| CliError::new(INTERNAL, "channel active without negotiated parameters"))?;
    print_channel_info(&args.address.to_string(), &info, format);
    channel.close();
    Ok(SUCCESS)
}
