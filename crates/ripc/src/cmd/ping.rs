use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ripc_session::{Channel, ConnectOptions, ReadEvent};
use tracing::{debug, info};

use crate::cmd::PingArgs;
use crate::exit::{session_error, CliError, CliResult, SUCCESS};
use crate::output::{print_channel_info, OutputFormat};

/// Connect, go Active, then idle on heartbeats until interrupted: a
/// liveness probe for a running provider.
pub fn run(args: PingArgs, format: OutputFormat) -> CliResult<i32> {
    let options = ConnectOptions::new(args.address)
        .with_ping_timeout(args.ping_timeout)
        .with_blocking(true);
    let mut channel =
        Channel::connect(options).map_err(|err| session_error("connect failed", err))?;
    let info = channel.info().cloned().ok_or_else(|| {
        CliError::new(
            crate::exit::INTERNAL,
            "channel active without negotiated parameters",
        )
    })?;
    print_channel_info(&args.address.to_string(), &info, format);
    info!(ping_timeout = info.ping_timeout, "channel active, idling on heartbeats");

    let running = Arc::new(AtomicBool::new(true));
    let handler_flag = running.clone();
    ctrlc::set_handler(move || handler_flag.store(false, Ordering::SeqCst)).map_err(|err| {
        CliError::new(
            crate::exit::INTERNAL,
            format!("signal handler setup failed: {err}"),
        )
    })?;

    let until = (args.duration > 0).then(|| Instant::now() + Duration::from_secs(args.duration));
    let mut pings_seen = 0u64;
    while running.load(Ordering::SeqCst) {
        if let Some(until) = until {
            if Instant::now() >= until {
                break;
            }
        }
        channel
            .check_ping(Instant::now())
            .map_err(|err| session_error("liveness lost", err))?;
        loop {
            match channel.read() {
                Ok(ReadEvent::Ping) => {
                    pings_seen += 1;
                    debug!(pings_seen, "heartbeat received");
                }
                Ok(ReadEvent::Message { payload, .. }) => {
                    debug!(bytes = payload.len(), "payload received while idling");
                }
                Ok(ReadEvent::WouldBlock) => break,
                Err(err) => return Err(session_error("read failed", err)),
            }
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    info!(pings_seen, "closing");
    channel.close();
    Ok(SUCCESS)
}
