use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ripc_session::{BindOptions, Server, WorkerConfig, WorkerPool};
use tracing::info;

use crate::cmd::ListenArgs;
use crate::exit::{session_error, CliError, CliResult, SUCCESS, USAGE};

pub fn run(args: ListenArgs) -> CliResult<i32> {
    let (min_ping, max_ping) = parse_ping_range(&args.ping_range)?;
    let options = BindOptions::new(args.address).with_ping_timeout_range(min_ping, max_ping);
    let server = Server::bind(options).map_err(|err| session_error("bind failed", err))?;
    info!(address = %server.local_addr(), workers = args.workers, role = ?args.role, "provider up");

    let pool = WorkerPool::start(
        args.workers,
        WorkerConfig {
            role: args.role.as_role(),
            ..WorkerConfig::default()
        },
    )
    .map_err(|err| session_error("worker start failed", err))?;

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let stats_every = (args.stats_interval > 0)
        .then(|| Duration::from_secs(args.stats_interval));
    let mut next_stats = stats_every.map(|d| Instant::now() + d);

    while running.load(Ordering::SeqCst) {
        match server.accept() {
            Ok(Some(channel)) => {
                pool.assign(channel);
            }
            Ok(None) => std::thread::sleep(Duration::from_millis(5)),
            Err(err) => {
                pool.shutdown();
                return Err(session_error("accept failed", err));
            }
        }
        if let (Some(every), Some(due)) = (stats_every, next_stats) {
            if Instant::now() >= due {
                let stats = pool.stats();
                info!(
                    channels = pool.total_load(),
                    received = stats.messages_received,
                    sent = stats.messages_sent,
                    starved = stats.buffer_starvation,
                    closed = stats.channels_closed,
                    "worker statistics"
                );
                next_stats = Some(Instant::now() + every);
            }
        }
    }

    info!("shutting down");
    pool.shutdown();
    Ok(SUCCESS)
}

fn parse_ping_range(raw: &str) -> CliResult<(u8, u8)> {
    let parse = |s: &str| {
        s.parse::<u8>()
            .map_err(|_| CliError::new(USAGE, format!("invalid ping range '{raw}'")))
    };
    let Some((min, max)) = raw.split_once(':') else {
        return Err(CliError::new(
            USAGE,
            format!("ping range must be min:max, got '{raw}'"),
        ));
    };
    let (min, max) = (parse(min)?, parse(max)?);
    if min == 0 || min > max {
        return Err(CliError::new(
            USAGE,
            format!("ping range must satisfy 0 < min <= max, got '{raw}'"),
        ));
    }
    Ok((min, max))
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| {
        CliError::new(
            crate::exit::INTERNAL,
            format!("signal handler setup failed: {err}"),
        )
    })
}
