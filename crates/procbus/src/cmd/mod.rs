use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Subcommand};

use crate::exit::{CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod call;
pub mod methods;
pub mod relay;
pub mod routes;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a relay: accept connections and route frames between modules.
    Relay(RelayArgs),
    /// Register as a module and call another module, printing the response.
    Call(CallArgs),
    /// Print the reachable module names known to a relay.
    Routes(RoutesArgs),
    /// Query the method names a module has advertised.
    Methods(MethodsArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Relay(args) => relay::run(args, format),
        Command::Call(args) => call::run(args, format),
        Command::Routes(args) => routes::run(args, format),
        Command::Methods(args) => methods::run(args, format),
        Command::Version(args) => version::run(args, format),
    }
}

#[derive(Args, Debug)]
pub struct RelayArgs {
    /// Socket path to bind.
    pub path: PathBuf,
    /// Name the relay answers to on the bus.
    #[arg(long, default_value = "RELAY")]
    pub name: String,
}

#[derive(Args, Debug)]
pub struct CallArgs {
    /// Socket path to connect to.
    pub path: PathBuf,
    /// Target module name.
    #[arg(long, short = 'm')]
    pub module: String,
    /// Method name on the target module.
    #[arg(long)]
    pub method: String,
    /// JSON payload.
    #[arg(long, conflicts_with_all = ["data", "file"])]
    pub json: Option<String>,
    /// Raw string payload.
    #[arg(long, conflicts_with_all = ["json", "file"])]
    pub data: Option<String>,
    /// Read payload from file.
    #[arg(long, conflicts_with_all = ["json", "data"])]
    pub file: Option<PathBuf>,
    /// Module name to register the caller under.
    #[arg(long = "as", default_value = "CLI")]
    pub caller: String,
    /// Instance uuid for the caller registration.
    #[arg(long)]
    pub uuid: Option<String>,
    /// Maximum time to wait for the response (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct RoutesArgs {
    /// Socket path to connect to.
    pub path: PathBuf,
    /// Connection timeout (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct MethodsArgs {
    /// Socket path to connect to.
    pub path: PathBuf,
    /// Module whose advertised methods to query.
    #[arg(long, short = 'm')]
    pub module: String,
    /// Connection timeout (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug, Default)]
pub struct VersionArgs {}

/// Parse a human duration like `5s`, `500ms`, or `2m`.
pub fn parse_duration(text: &str) -> CliResult<Duration> {
    let text = text.trim();
    let (digits, unit) = match text.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => text.split_at(idx),
        None => (text, "s"),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration: {text}")))?;
    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        _ => Err(CliError::new(USAGE, format!("invalid duration unit: {unit}"))),
    }
}
