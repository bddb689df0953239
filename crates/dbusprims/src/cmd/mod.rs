use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Subcommand};

use crate::exit::{CliError, CliResult};
use crate::output::OutputFormat;

pub mod call;
pub mod decode;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a demo peer that authenticates clients and answers test methods.
    Serve(ServeArgs),
    /// Connect, authenticate, send one method call and print the reply.
    Call(CallArgs),
    /// Decode a marshalled message from a file or stdin.
    Decode(DecodeArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args, format),
        Command::Call(args) => call::run(args, format),
        Command::Decode(args) => decode::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// D-Bus address to listen on (e.g. unix:path=/tmp/test.sock, tcp:host=127.0.0.1,port=0).
    pub address: String,
    /// Skip the auth handshake; clients send binary messages immediately.
    #[arg(long)]
    pub no_auth: bool,
    /// Server GUID announced in OK (32 hex digits). Random when omitted.
    #[arg(long)]
    pub guid: Option<String>,
    /// Delay between SubscribeSignals signals (e.g. 500ms).
    #[arg(long, default_value = "500ms")]
    pub signal_interval: String,
}

#[derive(Args, Debug)]
pub struct CallArgs {
    /// D-Bus address to connect to.
    pub address: String,
    /// Destination bus name.
    #[arg(long)]
    pub dest: Option<String>,
    /// Object path.
    #[arg(long, default_value = "/")]
    pub path: String,
    /// Interface name.
    #[arg(long)]
    pub interface: Option<String>,
    /// Method name.
    #[arg(long)]
    pub member: String,
    /// Body signature describing the --arg values.
    #[arg(long, default_value = "")]
    pub signature: String,
    /// One argument per top-level type. Strings are taken verbatim, other
    /// types as JSON (e.g. 42, true, [1,2], {"k":1}).
    #[arg(long = "arg", value_name = "VALUE")]
    pub args: Vec<String>,
    /// Skip the Hello call after authenticating.
    #[arg(long)]
    pub no_hello: bool,
    /// Skip the auth handshake.
    #[arg(long)]
    pub no_auth: bool,
    /// How long to wait for the reply (e.g. 5s, 500ms).
    #[arg(long, default_value = "25s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct DecodeArgs {
    /// File holding the message. Reads stdin when omitted.
    pub file: Option<PathBuf>,
    /// Treat input as hex text instead of raw bytes.
    #[arg(long)]
    pub hex: bool,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::usage("duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::usage(format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::usage("duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}
