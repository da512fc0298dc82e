//! Serial/Parallel scheduler for inbound handler work.
//!
//! The dispatcher hands every handler invocation to this scheduler as a
//! boxed job tagged `Serial` or `Parallel`. Parallel jobs start
//! immediately and may overlap each other; a serial job first waits for
//! every in-flight parallel job, runs alone to completion, and only then
//! is the next queue item consumed. For any two items A before B where
//! either is serial, all of A's side effects are therefore ordered before
//! B's.
//!
//! The scheduler owns a dedicated worker thread with its own runtime,
//! draining the job queue until shutdown.

use std::future::Future;
use std::pin::Pin;
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

/// Scheduling class of an inbound item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessType {
    /// Mutually exclusive with all prior work.
    Serial,
    /// May overlap with other parallel items.
    Parallel,
}

/// Pluggable method-name classifier used when a registration does not pick
/// a process type itself. The default is `Serial` for everything: safe for
/// state-changing notifications, and pure queries opt into `Parallel` at
/// registration time.
pub type ProcessClassifier = dyn Fn(&str) -> ProcessType + Send + Sync;

pub type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

pub struct ScheduledItem {
    pub process_type: ProcessType,
    pub job: Job,
}

/// Dedicated worker that drains the job queue.
pub struct Scheduler {
    queue: mpsc::UnboundedSender<ScheduledItem>,
    shutdown: std::sync::Mutex<Option<oneshot::Sender<()>>>,
    thread: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Start the worker. `grace` bounds how long shutdown waits for
    /// outstanding parallel jobs before abandoning them.
    pub fn new(grace: Duration) -> Self {
        let (queue, queue_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = oneshot::channel();

        let thread = std::thread::spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .expect("scheduler runtime");
            rt.block_on(run_loop(queue_rx, shutdown_rx, grace));
        });

        Self {
            queue,
            shutdown: std::sync::Mutex::new(Some(shutdown)),
            thread: std::sync::Mutex::new(Some(thread)),
        }
    }

    /// Enqueue a job. Returns false once the scheduler has shut down.
    pub fn enqueue(&self, process_type: ProcessType, job: Job) -> bool {
        self.queue
            .send(ScheduledItem { process_type, job })
            .is_ok()
    }

    /// Stop the worker and wait for it, honouring the grace period.
    /// Idempotent.
    pub fn shutdown(&self) {
        if let Some(shutdown) = self.shutdown.lock().unwrap().take() {
            let _ = shutdown.send(());
        }
        let thread = self.thread.lock().unwrap().take();
        if let Some(thread) = thread {
            let _ = thread.join();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_loop(
    mut queue: mpsc::UnboundedReceiver<ScheduledItem>,
    mut shutdown: oneshot::Receiver<()>,
    grace: Duration,
) {
    log::debug!("scheduler worker started");
    let mut running: Vec<tokio::task::JoinHandle<()>> = Vec::new();

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                log::debug!("scheduler received shutdown signal");
                break;
            }
            item = queue.recv() => {
                let Some(item) = item else {
                    log::debug!("scheduler queue closed");
                    break;
                };

                // Reap whatever finished since the last item.
                running.retain(|handle| !handle.is_finished());

                match item.process_type {
                    ProcessType::Parallel => {
                        running.push(tokio::spawn(item.job));
                    }
                    ProcessType::Serial => {
                        for handle in running.drain(..) {
                            let _ = handle.await;
                        }
                        item.job.await;
                    }
                }
            }
        }
    }

    // Give outstanding parallel jobs a bounded chance to finish.
    if !running.is_empty() {
        let drain = async {
            for handle in running.drain(..) {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            log::warn!("scheduler grace period elapsed, abandoning outstanding tasks");
        }
    }

    log::debug!("scheduler worker stopped");
}
