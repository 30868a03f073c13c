mod cmd;
mod exit;
mod logging;
mod output;

use clap::Parser;

use crate::cmd::Command;
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "ripc", version, about = "RIPC transport CLI")]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    let result = cmd::run(cli.command, format);

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_listen_subcommand() {
        let cli = Cli::try_parse_from([
            "ripc",
            "listen",
            "0.0.0.0:14002",
            "--workers",
            "4",
            "--role",
            "reader",
        ])
        .expect("listen args should parse");
        assert!(matches!(cli.command, Command::Listen(_)));
    }

    #[test]
    fn parses_ping_subcommand_with_timeout() {
        let cli = Cli::try_parse_from([
            "ripc",
            "ping",
            "127.0.0.1:14002",
            "--ping-timeout",
            "30",
        ])
        .expect("ping args should parse");
        match cli.command {
            Command::Ping(args) => assert_eq!(args.ping_timeout, 30),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn rejects_bad_address() {
        assert!(Cli::try_parse_from(["ripc", "info", "not-an-address"]).is_err());
    }

    #[test]
    fn parses_version_extended() {
        let cli = Cli::try_parse_from(["ripc", "version", "--extended"])
            .expect("version args should parse");
        match cli.command {
            Command::Version(args) => assert!(args.extended),
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
