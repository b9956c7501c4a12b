//! Process configuration and role bootstrap.
//!
//! The supervisor and the worker are separate executables. They share the
//! base port convention: the supervisor's proxy listens on `port`, and the
//! worker with id `k` listens on `port + k`. The supervisor passes
//! `WORKER_ID` and `PORT` to each child through its environment, which is
//! exactly where [`WorkerConfig`] reads them from.

use std::net::{Ipv4Addr, SocketAddr};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use sysinfo::System;
use tokio::net::TcpListener;

use crate::error::StartupError;

pub const DEFAULT_PORT: u16 = 4000;

/// How long either role waits for its listener to bind.
pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the supervisor waits for workers to drain before killing them.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Environment variable carrying a worker's identity.
pub const WORKER_ID_ENV: &str = "WORKER_ID";
/// Environment variable carrying the base port.
pub const PORT_ENV: &str = "PORT";

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Round-robin supervisor for a pool of CRUD workers")]
pub struct SupervisorConfig {
    /// Port the load balancer listens on. Worker k listens on port + k.
    #[arg(long, env = PORT_ENV, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Host the load balancer binds to.
    #[arg(long, env = "HOST", default_value_t = Ipv4Addr::UNSPECIFIED)]
    pub host: Ipv4Addr,

    /// Number of workers. Defaults to the logical core count minus one.
    #[arg(long, env = "WORKERS")]
    pub workers: Option<NonZeroUsize>,

    /// Worker executable. Defaults to `worker` next to this binary.
    #[arg(long, env = "WORKER_BIN")]
    pub worker_bin: Option<PathBuf>,

    /// Delay before a crashed worker is forked again.
    #[arg(long, default_value_t = 0)]
    pub restart_delay_ms: u64,
}

impl SupervisorConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from((self.host, self.port))
    }

    /// Worker count, either as configured or derived from the host.
    pub fn worker_count(&self) -> usize {
        match self.workers {
            Some(n) => n.get(),
            None => worker_count(logical_cores()),
        }
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    /// Resolves the worker executable path.
    pub fn worker_binary(&self) -> Result<PathBuf, StartupError> {
        if let Some(path) = &self.worker_bin {
            return Ok(path.clone());
        }
        let current = std::env::current_exe()
            .map_err(|err| StartupError::WorkerBinaryMissing(err.to_string()))?;
        let sibling = current.with_file_name(format!("worker{}", std::env::consts::EXE_SUFFIX));
        if sibling.exists() {
            Ok(sibling)
        } else {
            Err(StartupError::WorkerBinaryMissing(current.display().to_string()))
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "CRUD API worker, normally forked by the supervisor")]
pub struct WorkerConfig {
    /// Stable identity assigned by the supervisor (1..=N).
    #[arg(
        long,
        env = WORKER_ID_ENV,
        value_parser = clap::value_parser!(u16).range(1..),
        required_unless_present = "standalone"
    )]
    pub worker_id: Option<u16>,

    /// Base port shared with the supervisor, or the listening port when
    /// standalone.
    #[arg(long, env = PORT_ENV, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Serve the API alone on `0.0.0.0:port`, with no supervisor link and
    /// no replication.
    #[arg(long, conflicts_with = "worker_id")]
    pub standalone: bool,
}

impl WorkerConfig {
    /// Where this worker's API server listens: loopback `port + id` under a
    /// supervisor, every interface on `port` when standalone.
    pub fn listen_addr(&self) -> Result<SocketAddr, StartupError> {
        if self.standalone {
            return Ok(SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port)));
        }
        let port = worker_port(self.port, self.clustered_id()?)?;
        Ok(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
    }

    /// The supervisor-assigned id.
    pub fn clustered_id(&self) -> Result<u16, StartupError> {
        self.worker_id.ok_or(StartupError::MissingWorkerId)
    }
}

/// Port of the worker with the given id: `base + worker_id`.
pub fn worker_port(base: u16, worker_id: u16) -> Result<u16, StartupError> {
    base.checked_add(worker_id)
        .ok_or(StartupError::PortOverflow { base, worker_id })
}

/// Reserves one core for the supervisor, never going below one worker.
pub fn worker_count(cores: Option<usize>) -> usize {
    cores.unwrap_or(1).saturating_sub(1).max(1)
}

/// Logical cores as reported by the OS, if known.
pub fn logical_cores() -> Option<usize> {
    let mut sys = System::new();
    sys.refresh_cpu();
    match sys.cpus().len() {
        0 => None,
        n => Some(n),
    }
}

/// Binds a listener, failing if the OS does not answer within
/// [`STARTUP_TIMEOUT`].
pub async fn bind_listener(addr: SocketAddr) -> Result<TcpListener, StartupError> {
    match tokio::time::timeout(STARTUP_TIMEOUT, TcpListener::bind(addr)).await {
        Ok(Ok(listener)) => Ok(listener),
        Ok(Err(source)) => Err(StartupError::Bind { addr, source }),
        Err(_) => Err(StartupError::BindTimeout {
            addr,
            timeout: STARTUP_TIMEOUT,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserves_one_core_for_the_supervisor() {
        assert_eq!(worker_count(Some(8)), 7);
        assert_eq!(worker_count(Some(2)), 1);
    }

    #[test]
    fn never_fewer_than_one_worker() {
        assert_eq!(worker_count(Some(1)), 1);
        assert_eq!(worker_count(Some(0)), 1);
        assert_eq!(worker_count(None), 1);
    }

    #[test]
    fn worker_ports_are_offset_from_base() {
        assert_eq!(worker_port(4000, 1).unwrap(), 4001);
        assert_eq!(worker_port(4000, 7).unwrap(), 4007);
        assert!(matches!(
            worker_port(u16::MAX, 1),
            Err(StartupError::PortOverflow { .. })
        ));
    }

    #[test]
    fn worker_reads_identity_from_args() {
        let config = WorkerConfig::try_parse_from(["worker", "--worker-id", "3", "--port", "5000"])
            .expect("valid args");
        assert_eq!(config.worker_id, Some(3));
        assert_eq!(
            config.listen_addr().unwrap(),
            "127.0.0.1:5003".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn worker_id_zero_is_rejected() {
        assert!(WorkerConfig::try_parse_from(["worker", "--worker-id", "0"]).is_err());
    }

    #[test]
    fn explicit_worker_count_wins() {
        let config = SupervisorConfig::try_parse_from(["supervisor", "--workers", "3"])
            .expect("valid args");
        assert_eq!(config.worker_count(), 3);
        assert!(SupervisorConfig::try_parse_from(["supervisor", "--workers", "0"]).is_err());
    }

    #[test]
    fn standalone_needs_no_identity() {
        let config = WorkerConfig::try_parse_from(["worker", "--standalone", "--port", "4100"])
            .expect("valid args");
        assert!(config.standalone);
        assert_eq!(config.worker_id, None);
        assert_eq!(
            config.listen_addr().unwrap(),
            "0.0.0.0:4100".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn clustered_worker_requires_an_id() {
        assert!(WorkerConfig::try_parse_from(["worker", "--port", "4100"]).is_err());
    }
}
