use std::fmt;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, error};

use crate::error::{Result, RpcError};
use crate::sync::lock_ignore_poison;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed pool of threads for servant invocation and async completions, so
/// reactor threads never run user code.
pub struct WorkerPool {
    name: String,
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(name: &str, threads: usize) -> Result<Self> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..threads.max(1))
            .map(|index| {
                let receiver = Arc::clone(&receiver);
                thread::Builder::new()
                    .name(format!("{name}-{index}"))
                    .spawn(move || run_worker(&receiver))
            })
            .collect::<std::io::Result<Vec<_>>>()?;

        debug!(pool = name, threads = workers.len(), "worker pool started");
        Ok(Self {
            name: name.to_string(),
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        })
    }

    /// Queue `job`. Fails once the pool is shut down.
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) -> Result<()> {
        let sender = lock_ignore_poison(&self.sender);
        match sender.as_ref() {
            Some(sender) => sender.send(Box::new(job)).map_err(|_| RpcError::Shutdown),
            None => Err(RpcError::Shutdown),
        }
    }

    /// Stop accepting jobs, drain the queue and join every worker.
    pub fn shutdown(&self) {
        drop(lock_ignore_poison(&self.sender).take());
        let workers = std::mem::take(&mut *lock_ignore_poison(&self.workers));
        let current = thread::current().id();
        for worker in workers {
            // A job shutting down its own pool cannot join itself.
            if worker.thread().id() != current {
                let _ = worker.join();
            }
        }
        debug!(pool = %self.name, "worker pool stopped");
    }
}

fn run_worker(receiver: &Mutex<Receiver<Job>>) {
    loop {
        let job = lock_ignore_poison(receiver).recv();
        match job {
            Ok(job) => {
                if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)) {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    error!(panic = %message, "worker job panicked");
                }
            }
            Err(_) => break,
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("threads", &lock_ignore_poison(&self.workers).len())
            .finish()
    }
}
