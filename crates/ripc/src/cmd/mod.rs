use std::net::SocketAddr;

use clap::{Args, Subcommand, ValueEnum};

use crate::exit::CliResult;
use crate::output::OutputFormat;

pub mod info;
pub mod listen;
pub mod ping;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a provider: accept connections and fan them out over workers.
    Listen(ListenArgs),
    /// Connect and keep the channel alive on heartbeats.
    Ping(PingArgs),
    /// Connect once and print the negotiated channel parameters.
    Info(InfoArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Listen(args) => listen::run(args),
        Command::Ping(args) => ping::run(args, format),
        Command::Info(args) => info::run(args, format),
        Command::Version(args) => version::run(args, format),
    }
}

/// Worker processing role for `listen`.
#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum RoleArg {
    Reader,
    Writer,
    Reflector,
}

impl RoleArg {
    pub fn as_role(self) -> ripc_session::Role {
        match self {
            RoleArg::Reader => ripc_session::Role::Reader,
            RoleArg::Writer => ripc_session::Role::Writer,
            RoleArg::Reflector => ripc_session::Role::Reflector,
        }
    }
}

#[derive(Args, Debug)]
pub struct ListenArgs {
    /// Address to bind, e.g. 0.0.0.0:14002.
    pub address: SocketAddr,
    /// Worker threads driving accepted channels.
    #[arg(long, default_value = "2")]
    pub workers: usize,
    /// How workers process channel traffic.
    #[arg(long, value_enum, default_value = "reflector")]
    pub role: RoleArg,
    /// Ping timeout range granted to clients, seconds (min:max).
    #[arg(long, default_value = "20:60")]
    pub ping_range: String,
    /// Print aggregate worker statistics every N seconds (0 disables).
    #[arg(long, default_value = "10")]
    pub stats_interval: u64,
}

#[derive(Args, Debug)]
pub struct PingArgs {
    /// Address to connect to, e.g. 127.0.0.1:14002.
    pub address: SocketAddr,
    /// Requested ping timeout, seconds.
    #[arg(long, default_value = "60")]
    pub ping_timeout: u8,
    /// Exit after this many seconds (0 = until interrupted).
    #[arg(long, default_value = "0")]
    pub duration: u64,
}

#[derive(Args, Debug)]
pub struct InfoArgs {
    /// Address to connect to.
    pub address: SocketAddr,
    /// Requested compression.
    #[arg(long, value_enum, default_value = "none")]
    pub compression: CompressionArg,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum CompressionArg {
    None,
    Zlib,
    Lz4,
}

impl CompressionArg {
    pub fn as_compression(self) -> ripc_frame::CompressionType {
        match self {
            CompressionArg::None => ripc_frame::CompressionType::None,
            CompressionArg::Zlib => ripc_frame::CompressionType::Zlib,
            CompressionArg::Lz4 => ripc_frame::CompressionType::Lz4,
        }
    }
}

#[derive(Args, Debug, Default)]
pub struct VersionArgs {
    /// Show supported wire versions as well.
    #[arg(long)]
    pub extended: bool,
}
