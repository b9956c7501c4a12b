#![cfg(unix)]

use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};
use tokio::{
    process::{Child, Command},
    time::{sleep, timeout},
};

const STARTUP: Duration = Duration::from_secs(15);
const POLL: Duration = Duration::from_millis(50);

struct ClusterProcess {
    child: Child,
    base_port: u16,
    http: reqwest::Client,
}

impl ClusterProcess {
    async fn start(base_port: u16, workers: usize) -> Result<Self> {
        let child = Command::new(env!("CARGO_BIN_EXE_supervisor"))
            .arg("--host")
            .arg("127.0.0.1")
            .arg("--port")
            .arg(base_port.to_string())
            .arg("--workers")
            .arg(workers.to_string())
            .arg("--worker-bin")
            .arg(env!("CARGO_BIN_EXE_worker"))
            .env("RUST_LOG", "warn")
            .env("RUST_LOG_STYLE", "never")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .context("failed to spawn supervisor")?;

        let http = reqwest::Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(2))
            .build()?;
        let cluster = Self {
            child,
            base_port,
            http,
        };
        for worker_id in 1..=workers as u16 {
            cluster.wait_for_worker(worker_id).await?;
        }
        Ok(cluster)
    }

    fn url(&self, port: u16, path: &str) -> String {
        format!("http://127.0.0.1:{port}{path}")
    }

    fn worker_port(&self, worker_id: u16) -> u16 {
        self.base_port + worker_id
    }

    async fn health(&self, port: u16) -> Result<Value> {
        let response = self.http.get(self.url(port, "/")).send().await?;
        Ok(response.error_for_status()?.json().await?)
    }

    async fn wait_for_worker(&self, worker_id: u16) -> Result<Value> {
        let port = self.worker_port(worker_id);
        timeout(STARTUP, async {
            loop {
                if let Ok(health) = self.health(port).await {
                    return health;
                }
                sleep(POLL).await;
            }
        })
        .await
        .map_err(|_| anyhow!("worker {worker_id} never came up on port {port}"))
    }

    async fn stop(mut self) -> Result<()> {
        let pid = self.child.id().context("supervisor already reaped")?;
        signal(pid, "-TERM").await?;
        let status = timeout(Duration::from_secs(10), self.child.wait())
            .await
            .context("supervisor did not shut down")??;
        assert!(status.success(), "supervisor exited with {status}");
        Ok(())
    }
}

async fn signal(pid: u32, which: &str) -> Result<()> {
    let status = Command::new("kill")
        .arg(which)
        .arg(pid.to_string())
        .status()
        .await?;
    if !status.success() {
        return Err(anyhow!("kill {which} {pid} failed"));
    }
    Ok(())
}

#[tokio::test]
async fn write_on_one_worker_is_visible_on_another() -> Result<()> {
    let cluster = ClusterProcess::start(47310, 2).await?;

    let created: Value = cluster
        .http
        .post(cluster.url(cluster.worker_port(1), "/api/users"))
        .json(&json!({ "username": "ann", "age": 30, "hobbies": ["chess"] }))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    let id = created["id"].as_str().context("created user has an id")?.to_string();

    let listing_url = cluster.url(cluster.worker_port(2), "/api/users");
    let seen = timeout(Duration::from_secs(5), async {
        loop {
            let users: Vec<Value> = cluster.http.get(&listing_url).send().await?.json().await?;
            if let Some(user) = users.into_iter().find(|u| u["id"] == id.as_str()) {
                return Ok::<_, anyhow::Error>(user);
            }
            sleep(POLL).await;
        }
    })
    .await
    .context("worker 2 never saw the user")??;
    assert_eq!(seen, created);

    // The balancer alternates between the two workers.
    let mut ids = Vec::new();
    for _ in 0..4 {
        let health = cluster.health(cluster.base_port).await?;
        ids.push(health["workerId"].as_u64().context("workerId")?);
    }
    assert_ne!(ids[0], ids[1]);
    assert_eq!(ids[0], ids[2]);
    assert_eq!(ids[1], ids[3]);

    cluster.stop().await
}

#[tokio::test]
async fn crashed_worker_comes_back_with_the_same_identity() -> Result<()> {
    let cluster = ClusterProcess::start(47410, 2).await?;

    let before = cluster.wait_for_worker(2).await?;
    assert_eq!(before["workerId"], 2);
    let old_pid = before["pid"].as_u64().context("pid")? as u32;

    signal(old_pid, "-KILL").await?;

    // Until the replacement is up, the balancer may answer with 502s for
    // worker 2's slot. Nothing else is acceptable.
    let port = cluster.worker_port(2);
    let after = timeout(STARTUP, async {
        loop {
            let status = cluster
                .http
                .get(cluster.url(cluster.base_port, "/"))
                .send()
                .await?
                .status();
            assert!(
                status == reqwest::StatusCode::OK || status == reqwest::StatusCode::BAD_GATEWAY,
                "unexpected proxy status {status}"
            );

            if let Ok(health) = cluster.health(port).await {
                if health["pid"].as_u64() != Some(u64::from(old_pid)) {
                    return Ok::<_, anyhow::Error>(health);
                }
            }
            sleep(POLL).await;
        }
    })
    .await
    .context("worker 2 was never restarted")??;

    assert_eq!(after["workerId"], 2);
    assert_ne!(after["pid"], before["pid"]);

    // Once the replacement is up, both slots answer through the balancer.
    timeout(STARTUP, async {
        loop {
            let first = cluster.health(cluster.base_port).await;
            let second = cluster.health(cluster.base_port).await;
            if let (Ok(first), Ok(second)) = (first, second) {
                let mut ids = vec![first["workerId"].as_u64(), second["workerId"].as_u64()];
                ids.sort();
                assert_eq!(ids, vec![Some(1), Some(2)]);
                return;
            }
            sleep(POLL).await;
        }
    })
    .await
    .context("proxied requests never recovered after restart")?;

    cluster.stop().await
}

#[tokio::test]
async fn standalone_worker_serves_without_a_supervisor() -> Result<()> {
    let port = 47510;
    let mut child = Command::new(env!("CARGO_BIN_EXE_worker"))
        .arg("--standalone")
        .arg("--port")
        .arg(port.to_string())
        .env_remove("WORKER_ID")
        .env("RUST_LOG", "warn")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .context("failed to spawn standalone worker")?;

    let http = reqwest::Client::builder().no_proxy().build()?;
    let base = format!("http://127.0.0.1:{port}");
    let health: Value = timeout(STARTUP, async {
        loop {
            if let Ok(response) = http.get(format!("{base}/")).send().await {
                if let Ok(health) = response.json::<Value>().await {
                    return health;
                }
            }
            sleep(POLL).await;
        }
    })
    .await
    .context("standalone worker never came up")?;
    assert_eq!(health["status"], "OK");
    assert!(health.get("workerId").is_none());

    let status = http
        .post(format!("{base}/api/users"))
        .json(&json!({ "username": "solo", "age": 41, "hobbies": [] }))
        .send()
        .await?
        .status();
    assert_eq!(status, reqwest::StatusCode::CREATED);

    let pid = child.id().context("standalone worker already reaped")?;
    signal(pid, "-TERM").await?;
    let status = timeout(Duration::from_secs(10), child.wait())
        .await
        .context("standalone worker did not shut down")??;
    assert!(status.success(), "standalone worker exited with {status}");
    Ok(())
}
