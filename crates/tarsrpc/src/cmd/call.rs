use std::time::Instant;

use tarsrpc_codec::{CallArgs as Arguments, MethodDescriptor, ProtocolVersion};
use tarsrpc_peer::{
    split_object_name, BalanceStrategy, CallOptions, Communicator, CommunicatorConfig,
    ProxyOptions,
};
use tracing::debug;

use crate::cmd::{parse_duration, CallArgs};
use crate::demo;
use crate::exit::{codec_error, rpc_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::{print_reply, CallSummary, OutputFormat};

pub fn run(args: CallArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let version = ProtocolVersion::from_i16(args.proto)
        .map_err(|err| codec_error("invalid --proto", err))?;
    let interface = demo::interface();
    let method = interface
        .lookup(&args.method)
        .ok_or_else(|| CliError::new(USAGE, format!("unknown method: {}", args.method)))?;
    let arguments = build_arguments(&method, &args.args)?;

    let mut options = CallOptions::new().with_timeout(timeout);
    for entry in &args.context {
        let (key, value) = entry
            .split_once('=')
            .ok_or_else(|| CliError::new(USAGE, format!("--context expects KEY=VALUE: {entry}")))?;
        options = options.with_context(key, value);
    }
    let balance = match args.hash {
        Some(hash) => {
            options = options.with_hash(hash);
            BalanceStrategy::ConsistentHash
        }
        None => BalanceStrategy::RoundRobin,
    };

    let communicator = Communicator::new(CommunicatorConfig {
        sync_timeout: timeout,
        ..CommunicatorConfig::default()
    })
    .map_err(|err| rpc_error("communicator setup failed", err))?;
    let proxy = communicator
        .proxy_with(
            &args.object,
            interface,
            ProxyOptions {
                balance,
                version,
                ..ProxyOptions::default()
            },
        )
        .map_err(|err| rpc_error("endpoint resolution failed", err))?;

    let started = Instant::now();
    let reply = proxy
        .invoke_with(&args.method, arguments, &options)
        .map_err(|err| rpc_error("call failed", err))?;
    debug!(method = %args.method, elapsed = ?started.elapsed(), "call completed");

    let (servant, _) = split_object_name(&args.object);
    print_reply(
        &CallSummary {
            servant,
            method: &args.method,
            version: version.as_i16(),
            elapsed_ms: started.elapsed().as_millis(),
        },
        &reply,
        format,
    );
    Ok(SUCCESS)
}

/// Pair positional command-line values with the method's inputs.
fn build_arguments(method: &MethodDescriptor, values: &[String]) -> CliResult<Arguments> {
    let inputs: Vec<_> = method.inputs().collect();
    if inputs.len() != values.len() {
        let names: Vec<&str> = inputs.iter().map(|(param, _)| param.name.as_str()).collect();
        return Err(CliError::new(
            USAGE,
            format!(
                "{} expects {} argument(s) ({}), got {}",
                method.name,
                inputs.len(),
                names.join(", "),
                values.len()
            ),
        ));
    }

    let mut arguments = Arguments::new();
    for ((param, stamp), text) in inputs.into_iter().zip(values) {
        let value = demo::parse_arg(text, stamp)
            .map_err(|reason| CliError::new(USAGE, format!("{}: {reason}", param.name)))?;
        arguments = arguments.with_input(param.name.as_str(), value);
    }
    Ok(arguments)
}

#[cfg(test)]
mod tests {
    use tarsrpc_codec::Value;

    use super::*;

    #[test]
    fn arguments_follow_declaration_order() {
        let interface = demo::interface();
        let add = interface.lookup("add").expect("add is declared");
        let args = build_arguments(&add, &["2".to_string(), "40".to_string()])
            .expect("arguments should parse");
        assert_eq!(args.input("a"), Some(&Value::Int(2)));
        assert_eq!(args.input("b"), Some(&Value::Int(40)));
    }

    #[test]
    fn wrong_argument_count_is_a_usage_error() {
        let interface = demo::interface();
        let echo = interface.lookup("echo").expect("echo is declared");
        let err = build_arguments(&echo, &[]).expect_err("missing argument");
        assert_eq!(err.code, USAGE);
        assert!(err.message.contains("msg"));
    }

    #[test]
    fn unparsable_argument_is_a_usage_error() {
        let interface = demo::interface();
        let sleep = interface.lookup("sleep").expect("sleep is declared");
        let err = build_arguments(&sleep, &["soon".to_string()]).expect_err("not an int");
        assert_eq!(err.code, USAGE);
    }
}
