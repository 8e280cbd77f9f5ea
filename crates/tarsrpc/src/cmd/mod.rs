use std::time::Duration;

use clap::{Args, Subcommand};

use crate::exit::{CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod call;
pub mod ping;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Host the demo echo servant.
    Serve(ServeArgs),
    /// Invoke one method on a servant.
    Call(CallArgs),
    /// Check that a servant answers.
    Ping(PingArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args, format),
        Command::Call(args) => call::run(args, format),
        Command::Ping(args) => ping::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address to listen on.
    #[arg(default_value = "127.0.0.1:10000")]
    pub addr: String,
    /// Threads running servant methods.
    #[arg(long, default_value = "4")]
    pub workers: usize,
}

#[derive(Args, Debug)]
pub struct CallArgs {
    /// Servant object name with endpoints, e.g. "Demo.EchoServer.EchoObj@tcp -h 127.0.0.1 -p 10000".
    pub object: String,
    /// Method to invoke.
    pub method: String,
    /// Input arguments in declaration order.
    pub args: Vec<String>,
    /// Envelope version: 1 binary, 2 attribute, 3 compact attribute.
    #[arg(long, default_value = "1", value_parser = clap::value_parser!(i16).range(1..=3))]
    pub proto: i16,
    /// Call deadline (e.g. 3s, 500ms).
    #[arg(long, default_value = "3s")]
    pub timeout: String,
    /// Context entries sent with the call (KEY=VALUE, repeatable).
    #[arg(long = "context", value_name = "KEY=VALUE")]
    pub context: Vec<String>,
    /// Routing key; selects the consistent-hash balancer.
    #[arg(long)]
    pub hash: Option<u64>,
}

#[derive(Args, Debug)]
pub struct PingArgs {
    /// Servant object name with endpoints.
    pub object: String,
    /// Ping deadline (e.g. 3s, 500ms).
    #[arg(long, default_value = "3s")]
    pub timeout: String,
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
        return Err(CliError::new(USAGE, "duration must not be empty"));
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
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;
    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}
