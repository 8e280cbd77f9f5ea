use std::time::Instant;

use serde_json::json;
use tarsrpc_peer::{Communicator, CommunicatorConfig};

use crate::cmd::{parse_duration, PingArgs};
use crate::demo;
use crate::exit::{rpc_error, CliResult, SUCCESS};
use crate::output::{print_event, OutputFormat};

pub fn run(args: PingArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let communicator = Communicator::new(CommunicatorConfig {
        sync_timeout: timeout,
        ..CommunicatorConfig::default()
    })
    .map_err(|err| rpc_error("communicator setup failed", err))?;
    let proxy = communicator
        .proxy(&args.object, demo::interface())
        .map_err(|err| rpc_error("endpoint resolution failed", err))?;

    let started = Instant::now();
    proxy.ping().map_err(|err| rpc_error("ping failed", err))?;

    print_event(
        "pong",
        json!({
            "object": proxy.config().simple_object_name,
            "endpoints": proxy.endpoints().len(),
            "elapsed_ms": started.elapsed().as_millis() as u64,
        }),
        format,
    );
    Ok(SUCCESS)
}
