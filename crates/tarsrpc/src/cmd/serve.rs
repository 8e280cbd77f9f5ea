use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde_json::json;
use tarsrpc_peer::{RpcServer, ServantHost, ServerConfig};
use tracing::info;

use crate::cmd::ServeArgs;
use crate::demo::{DemoServant, OBJECT_NAME};
use crate::exit::{rpc_error, CliError, CliResult, INTERNAL, SUCCESS, USAGE};
use crate::output::{print_event, OutputFormat};

pub fn run(args: ServeArgs, format: OutputFormat) -> CliResult<i32> {
    if args.workers == 0 {
        return Err(CliError::new(USAGE, "--workers must be at least 1"));
    }

    let host = Arc::new(ServantHost::new().with_servant(OBJECT_NAME, Arc::new(DemoServant)));
    let mut handle = RpcServer::bind(&args.addr, host)
        .map_err(|err| rpc_error("bind failed", err))?
        .with_config(ServerConfig {
            worker_threads: args.workers,
            ..ServerConfig::default()
        })
        .spawn()
        .map_err(|err| rpc_error("server start failed", err))?;

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(Arc::clone(&running))?;

    let endpoint = handle.endpoint();
    print_event(
        "listening",
        json!({
            "object": format!("{OBJECT_NAME}@{endpoint}"),
            "address": handle.local_addr().to_string(),
        }),
        format,
    );

    while running.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(100));
    }

    info!("interrupted, shutting down");
    handle
        .shutdown()
        .map_err(|err| rpc_error("shutdown failed", err))?;
    Ok(SUCCESS)
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
