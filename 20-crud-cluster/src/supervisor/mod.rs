//! Supervisor process: forks the worker pool, keeps it alive, and relays
//! replication traffic between siblings.
//!
//! Everything that touches the worker table happens on the supervisor's
//! own event loop. Child processes report back through a single event
//! channel:
//!
//! - every line a worker writes to its stdout becomes a [`Event::Frame`],
//!   which the loop relays verbatim to every *other* worker;
//! - every child exit becomes an [`Event::Exited`], which the loop answers
//!   by forking a replacement with the same worker id (and therefore the
//!   same port).
//!
//! The reverse proxy runs beside the loop and never looks at the table:
//! worker ports are a pure function of the base port and the worker id.

pub mod proxy;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, error, info, warn};

use crate::config::{
    bind_listener, worker_port, SupervisorConfig, PORT_ENV, SHUTDOWN_GRACE, WORKER_ID_ENV,
};
use crate::error::StartupError;
use crate::link::{self, Link};
use crate::signal;

/// One live worker slot. There is exactly one record per worker id for the
/// lifetime of the supervisor; a restart swaps the record in place.
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    pub worker_id: u16,
    pub pid: u32,
    pub link: Link,
}

/// Worker records ordered by id (`1..=N`).
#[derive(Debug, Default)]
pub struct WorkerTable {
    records: Vec<WorkerRecord>,
}

impl WorkerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: WorkerRecord) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, worker_id: u16) -> Option<&WorkerRecord> {
        self.records.iter().find(|r| r.worker_id == worker_id)
    }

    /// Finds the slot currently held by a process.
    pub fn find_by_pid(&self, pid: u32) -> Option<&WorkerRecord> {
        self.records.iter().find(|r| r.pid == pid)
    }

    /// Swaps in a new record for the same worker id, returning the old one.
    pub fn replace(&mut self, record: WorkerRecord) -> Option<WorkerRecord> {
        let slot = self
            .records
            .iter_mut()
            .find(|r| r.worker_id == record.worker_id)?;
        Some(std::mem::replace(slot, record))
    }

    /// Sends `frame` to every worker except `from`. Returns how many
    /// workers accepted it. Nothing is acknowledged or retried.
    pub fn relay(&self, from: u16, frame: &str) -> usize {
        let mut delivered = 0;
        for record in self.records.iter().filter(|r| r.worker_id != from) {
            match record.link.send_frame(frame.to_owned()) {
                Ok(()) => delivered += 1,
                Err(err) => debug!(
                    from,
                    to = record.worker_id,
                    error = %err,
                    "relay target unavailable"
                ),
            }
        }
        delivered
    }

    /// Drops every record, closing each worker's link.
    pub fn clear(&mut self) {
        self.records.clear();
    }
}

/// What child processes report to the supervisor loop.
#[derive(Debug)]
pub enum Event {
    /// A replication frame written by a worker.
    Frame { worker_id: u16, frame: String },
    /// A worker process ended.
    Exited {
        worker_id: u16,
        pid: u32,
        status: io::Result<ExitStatus>,
    },
    /// Try forking a worker again.
    Respawn { worker_id: u16 },
}

pub struct Supervisor {
    config: SupervisorConfig,
    worker_bin: PathBuf,
    workers: WorkerTable,
    /// Exit watchers by pid. Each one owns its `Child`, which is killed if
    /// the watcher is dropped.
    children: HashMap<u32, JoinHandle<()>>,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    shutting_down: bool,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Result<Self, StartupError> {
        let worker_bin = config.worker_binary()?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Self {
            config,
            worker_bin,
            workers: WorkerTable::new(),
            children: HashMap::new(),
            events_tx,
            events_rx,
            shutting_down: false,
        })
    }

    pub async fn run_until_signal(self) -> Result<()> {
        self.run_until(async {
            let name = signal::terminated().await;
            info!(signal = name, "supervisor received shutdown signal");
        })
        .await
    }

    /// Forks the pool, serves the proxy, and supervises until `shutdown`
    /// resolves.
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send,
    {
        let count = self.config.worker_count();
        let count = u16::try_from(count).map_err(|_| StartupError::TooManyWorkers(count))?;
        let proxy_state = Arc::new(proxy::ProxyState::new(self.config.port, count)?);

        info!(pid = std::process::id(), workers = count, "supervisor starting");
        for worker_id in 1..=count {
            let record = self.fork(worker_id)?;
            self.workers.push(record);
        }

        let addr = self.config.listen_addr();
        let listener = bind_listener(addr).await?;
        info!(%addr, "load balancer listening");

        let (stop_proxy, proxy_stopped) = oneshot::channel::<()>();
        let proxy_task = tokio::spawn(async move {
            axum::serve(listener, proxy::router(proxy_state))
                .with_graceful_shutdown(async {
                    let _ = proxy_stopped.await;
                })
                .await
        });

        self.supervise(shutdown).await;

        self.shutting_down = true;
        let _ = stop_proxy.send(());
        match proxy_task.await {
            Ok(Ok(())) => info!("load balancer drained"),
            Ok(Err(err)) => warn!(error = ?err, "load balancer exited with error"),
            Err(err) => warn!(error = ?err, "load balancer task failed"),
        }

        self.stop_workers().await;
        info!("supervisor stopped");
        Ok(())
    }

    /// Handles child events until `shutdown` resolves.
    async fn supervise<F>(&mut self, shutdown: F)
    where
        F: std::future::Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                // Shutdown first, so exits caused by the same signal are not
                // answered with respawns.
                biased;
                _ = &mut shutdown => break,
                Some(event) = self.events_rx.recv() => self.handle(event),
            }
        }
    }

    fn handle(&mut self, event: Event) {
        match event {
            Event::Frame { worker_id, frame } => {
                let delivered = self.workers.relay(worker_id, &frame);
                debug!(from = worker_id, delivered, "relayed replication frame");
            }
            Event::Exited {
                worker_id,
                pid,
                status,
            } => {
                self.children.remove(&pid);
                log_exit(worker_id, pid, &status);
                if self.shutting_down || self.workers.find_by_pid(pid).is_none() {
                    return;
                }
                let delay = self.config.restart_delay();
                if delay.is_zero() {
                    self.restart(worker_id);
                } else {
                    self.schedule_respawn(worker_id, delay);
                }
            }
            Event::Respawn { worker_id } => {
                if !self.shutting_down {
                    self.restart(worker_id);
                }
            }
        }
    }

    fn restart(&mut self, worker_id: u16) {
        match self.fork(worker_id) {
            Ok(record) => {
                info!(worker_id, pid = record.pid, "worker restarted");
                self.workers.replace(record);
            }
            Err(err) => {
                error!(worker_id, error = ?err, "failed to restart worker, retrying");
                let delay = self.config.restart_delay().max(RESPAWN_RETRY);
                self.schedule_respawn(worker_id, delay);
            }
        }
    }

    fn schedule_respawn(&self, worker_id: u16, delay: std::time::Duration) {
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            let _ = events.send(Event::Respawn { worker_id });
        });
    }

    /// Starts one worker process and wires its stdio into a link.
    fn fork(&mut self, worker_id: u16) -> Result<WorkerRecord> {
        let port = worker_port(self.config.port, worker_id)?;
        let mut child = Command::new(&self.worker_bin)
            .env(WORKER_ID_ENV, worker_id.to_string())
            .env(PORT_ENV, self.config.port.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to fork worker {worker_id}"))?;

        let pid = child
            .id()
            .with_context(|| format!("worker {worker_id} exited before registration"))?;
        let stdin = child.stdin.take().context("worker stdin not piped")?;
        let stdout = child.stdout.take().context("worker stdout not piped")?;

        let (link, inbox) = link::open(stdout, stdin);
        let events = self.events_tx.clone();
        inbox.subscribe(move |frame| {
            let _ = events.send(Event::Frame { worker_id, frame });
        });

        let events = self.events_tx.clone();
        let watcher = tokio::spawn(async move {
            let status = child.wait().await;
            let _ = events.send(Event::Exited {
                worker_id,
                pid,
                status,
            });
        });
        self.children.insert(pid, watcher);

        info!(worker_id, pid, port, "forked worker");
        Ok(WorkerRecord {
            worker_id,
            pid,
            link,
        })
    }

    /// Closes every link so workers drain on their own, then kills whatever
    /// is still running once the grace period is over.
    async fn stop_workers(&mut self) {
        self.workers.clear();

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while !self.children.is_empty() {
            match timeout_at(deadline, self.events_rx.recv()).await {
                Ok(Some(Event::Exited {
                    worker_id,
                    pid,
                    status,
                })) => {
                    self.children.remove(&pid);
                    log_exit(worker_id, pid, &status);
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => break,
            }
        }

        for (pid, watcher) in self.children.drain() {
            warn!(pid, "worker did not exit in time, killing");
            watcher.abort();
            let _ = watcher.await;
        }
    }
}

/// Back-off between failed fork attempts.
const RESPAWN_RETRY: std::time::Duration = std::time::Duration::from_secs(1);

fn log_exit(worker_id: u16, pid: u32, status: &io::Result<ExitStatus>) {
    match status {
        Ok(status) => {
            #[cfg(unix)]
            let signal = std::os::unix::process::ExitStatusExt::signal(status);
            #[cfg(not(unix))]
            let signal: Option<i32> = None;
            warn!(
                worker_id,
                pid,
                code = ?status.code(),
                signal = ?signal,
                "worker exited"
            );
        }
        Err(err) => error!(worker_id, pid, error = ?err, "failed waiting on worker"),
    }
}

/// Runs the supervisor until SIGINT or SIGTERM.
pub async fn run(config: SupervisorConfig) -> Result<()> {
    Supervisor::new(config)?.run_until_signal().await
}
