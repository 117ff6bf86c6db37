//! Sidecar process supervisor.
//!
//! Spawns `tandem serve --announce-ready` on a free loopback port, waits for
//! the readiness line and hands out its base URL. The child is killed when the
//! supervisor is stopped or dropped.

use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::Mutex;

use crate::config::SidecarConfig;
use crate::error::{Result, TandemError};

use super::env::SidecarEnv;

/// Prefix of the line a server prints to stdout once it accepts connections.
pub const READY_PREFIX: &str = "TANDEM_READY";

/// Timeout for health checks.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

struct RunningSidecar {
    child: Child,
    base_url: String,
}

/// Owns the sidecar child process.
pub struct SidecarSupervisor {
    program: PathBuf,
    config_file: Option<PathBuf>,
    ready_timeout: Duration,
    env: SidecarEnv,
    client: reqwest::Client,
    running: Mutex<Option<RunningSidecar>>,
}

impl std::fmt::Debug for SidecarSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SidecarSupervisor")
            .field("program", &self.program)
            .field("ready_timeout", &self.ready_timeout)
            .finish_non_exhaustive()
    }
}

impl SidecarSupervisor {
    pub fn new(program: impl Into<PathBuf>, env: SidecarEnv, ready_timeout: Duration) -> Self {
        Self {
            program: program.into(),
            config_file: None,
            ready_timeout,
            env,
            client: reqwest::Client::new(),
            running: Mutex::new(None),
        }
    }

    /// Supervisor for the configured binary, defaulting to the running executable.
    pub fn from_config(config: &SidecarConfig) -> Result<Self> {
        let program = match config.binary.as_deref() {
            Some(binary) => PathBuf::from(binary),
            None => std::env::current_exe().map_err(|e| {
                TandemError::infrastructure(format!("cannot locate own executable: {e}"))
            })?,
        };
        Ok(Self::new(
            program,
            SidecarEnv::from_config(config),
            Duration::from_secs(config.ready_timeout_secs),
        ))
    }

    /// Pass `--config <path>` to the sidecar.
    pub fn with_config_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_file = Some(path.into());
        self
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Base URL of the sidecar, spawning it first if it is not running.
    pub async fn ensure_started(&self) -> Result<String> {
        let mut running = self.running.lock().await;
        if let Some(current) = running.as_mut() {
            match current.child.try_wait() {
                Ok(None) => return Ok(current.base_url.clone()),
                Ok(Some(status)) => warn!("Sidecar exited with {}, restarting", status),
                Err(e) => warn!("Cannot poll sidecar: {}, restarting", e),
            }
        }
        *running = None;

        let spawned = self.spawn().await?;
        let url = spawned.base_url.clone();
        *running = Some(spawned);
        Ok(url)
    }

    /// Base URL of the running sidecar, if any.
    pub async fn base_url(&self) -> Option<String> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|running| running.base_url.clone())
    }

    /// Whether the sidecar answers `/health`.
    pub async fn health(&self) -> bool {
        let Some(base_url) = self.base_url().await else {
            return false;
        };
        match self
            .client
            .get(format!("{base_url}/health"))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("Sidecar health check failed: {}", e);
                false
            }
        }
    }

    /// Kill the sidecar and start a fresh one.
    pub async fn restart(&self) -> Result<String> {
        self.stop().await;
        self.ensure_started().await
    }

    /// Kill the sidecar if it is running.
    pub async fn stop(&self) {
        let Some(mut running) = self.running.lock().await.take() else {
            return;
        };
        info!("Stopping sidecar at {}", running.base_url);
        if let Err(e) = running.child.kill().await {
            warn!("Failed to kill sidecar: {}", e);
        }
    }

    async fn spawn(&self) -> Result<RunningSidecar> {
        let port = free_port()?;
        let mut cmd = Command::new(&self.program);
        if let Some(config_file) = self.config_file.as_ref() {
            cmd.arg("--config").arg(config_file);
        }
        cmd.args(["serve", "--host", "127.0.0.1", "--port"])
            .arg(port.to_string())
            .arg("--announce-ready")
            .envs(self.env.vars())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        info!("Spawning sidecar {:?} on port {}", self.program, port);
        let mut child = cmd.spawn().map_err(|e| {
            TandemError::infrastructure(format!(
                "failed to spawn sidecar {}: {e}",
                self.program.display()
            ))
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TandemError::infrastructure("sidecar stdout not captured"))?;

        let fallback = format!("http://127.0.0.1:{port}");
        let mut lines = BufReader::new(stdout).lines();
        let base_url = match tokio::time::timeout(self.ready_timeout, wait_ready(&mut lines)).await
        {
            Ok(Ok(addr)) => format!("http://{addr}"),
            Ok(Err(e)) => {
                let _ = child.kill().await;
                return Err(e);
            }
            Err(_) => {
                warn!(
                    "Sidecar did not announce readiness within {:?}, proceeding",
                    self.ready_timeout
                );
                fallback
            }
        };
        tokio::spawn(drain_stdout(lines));
        info!("Sidecar ready at {}", base_url);

        Ok(RunningSidecar { child, base_url })
    }
}

type StdoutLines = tokio::io::Lines<BufReader<ChildStdout>>;

async fn wait_ready(lines: &mut StdoutLines) -> Result<SocketAddr> {
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if let Some(addr) = parse_ready_line(&line) {
                    return Ok(addr);
                }
                debug!("sidecar: {}", line);
            }
            Ok(None) => {
                return Err(TandemError::infrastructure(
                    "sidecar exited before announcing readiness",
                ));
            }
            Err(e) => {
                return Err(TandemError::infrastructure(format!(
                    "reading sidecar stdout: {e}"
                )));
            }
        }
    }
}

async fn drain_stdout(mut lines: StdoutLines) {
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("sidecar: {}", line);
    }
}

/// Parse `TANDEM_READY <addr>`.
pub fn parse_ready_line(line: &str) -> Option<SocketAddr> {
    line.trim()
        .strip_prefix(READY_PREFIX)?
        .trim()
        .parse()
        .ok()
}

/// Ask the OS for an unused loopback port.
fn free_port() -> Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0))
        .map_err(|e| TandemError::infrastructure(format!("no free port: {e}")))?;
    let port = listener
        .local_addr()
        .map_err(|e| TandemError::infrastructure(format!("no free port: {e}")))?
        .port();
    Ok(port)
}
