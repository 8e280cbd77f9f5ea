use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::correlator::Correlator;
use crate::error::Result;

/// Background thread that expires overdue tickets on a fixed interval,
/// independent of any socket activity.
///
/// Stopped and joined on drop.
pub struct TimeoutSweeper {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl TimeoutSweeper {
    pub fn start(correlator: Arc<Correlator>, interval: Duration) -> Result<Self> {
        let (stop, stopped) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name("tarsrpc-sweeper".into())
            .spawn(move || {
                debug!(?interval, "timeout sweeper started");
                loop {
                    match stopped.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            let expired = correlator.sweep(Instant::now());
                            trace!(expired, pending = correlator.pending(), "sweep");
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("timeout sweeper stopped");
            })?;

        Ok(Self {
            stop: Some(stop),
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TimeoutSweeper {
    fn drop(&mut self) {
        self.stop();
    }
}
