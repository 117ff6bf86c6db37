//! Line-delimited JSON subprocesses.
//!
//! Spawns a provider binary with piped stdio: a writer task feeds stdin from
//! a channel, a reader task forwards stdout lines, stderr is logged. The
//! child is killed when the returned guard is dropped.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

/// Buffer size for stdout lines and stdin commands.
const LINE_BUFFER_SIZE: usize = 256;

/// Last line the provider wrote to stderr, used to explain abnormal exits.
#[derive(Debug, Clone, Default)]
pub struct StderrTail(Arc<Mutex<Option<String>>>);

impl StderrTail {
    pub fn last(&self) -> Option<String> {
        match self.0.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn record(&self, line: String) {
        let mut guard = match self.0.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(line);
    }
}

/// How to launch a provider process.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    /// Short name used in logs.
    pub label: &'static str,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

/// A running line-protocol process.
#[derive(Debug)]
pub struct LineProcess {
    pub lines: mpsc::Receiver<String>,
    /// `None` when spawned without stdin.
    pub stdin: Option<mpsc::Sender<String>>,
    pub stderr: StderrTail,
    pub guard: DropGuard,
}

/// Spawn `spec`, wiring stdio to channels.
pub fn spawn_line_process(spec: ProcessSpec, with_stdin: bool) -> Result<LineProcess> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(if with_stdin {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = spec.cwd.as_ref() {
        cmd.current_dir(cwd);
    }

    info!(
        "Spawning {}: {} {}",
        spec.label,
        spec.program,
        spec.args.join(" ")
    );
    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawning {} ({})", spec.label, spec.program))?;

    let stdout = child
        .stdout
        .take()
        .with_context(|| format!("{} process has no stdout", spec.label))?;
    let (line_tx, line_rx) = mpsc::channel(LINE_BUFFER_SIZE);
    tokio::spawn(stdout_reader_task(spec.label, stdout, line_tx));

    let stderr_tail = StderrTail::default();
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(stderr_reader_task(spec.label, stderr, stderr_tail.clone()));
    }

    let stdin = if with_stdin {
        let stdin = child
            .stdin
            .take()
            .with_context(|| format!("{} process has no stdin", spec.label))?;
        let (stdin_tx, stdin_rx) = mpsc::channel(LINE_BUFFER_SIZE);
        tokio::spawn(stdin_writer_task(spec.label, stdin, stdin_rx));
        Some(stdin_tx)
    } else {
        None
    };

    let closed = CancellationToken::new();
    let guard = closed.clone().drop_guard();
    let label = spec.label;
    tokio::spawn(async move {
        tokio::select! {
            status = child.wait() => match status {
                Ok(status) => debug!("{} exited with {}", label, status),
                Err(e) => warn!("Failed to wait for {}: {:?}", label, e),
            },
            _ = closed.cancelled() => {
                debug!("Stopping {}", label);
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill {}: {:?}", label, e);
                }
            }
        }
    });

    Ok(LineProcess {
        lines: line_rx,
        stdin,
        stderr: stderr_tail,
        guard,
    })
}

async fn stdin_writer_task(label: &'static str, mut stdin: ChildStdin, mut rx: mpsc::Receiver<String>) {
    while let Some(line) = rx.recv().await {
        let display: String = line.chars().take(200).collect();
        debug!("Sending to {}: {}", label, display);
        if let Err(e) = stdin.write_all(format!("{line}\n").as_bytes()).await {
            error!("Failed to write to {} stdin: {:?}", label, e);
            break;
        }
        if let Err(e) = stdin.flush().await {
            error!("Failed to flush {} stdin: {:?}", label, e);
            break;
        }
    }
    debug!("{} stdin closed", label);
}

async fn stdout_reader_task(label: &'static str, stdout: ChildStdout, tx: mpsc::Sender<String>) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                let display: String = line.chars().take(200).collect();
                debug!("Received from {}: {}", label, display);
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                error!("Error reading {} stdout: {:?}", label, e);
                break;
            }
        }
    }
    debug!("{} stdout closed", label);
}

async fn stderr_reader_task(
    label: &'static str,
    stderr: tokio::process::ChildStderr,
    tail: StderrTail,
) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if !line.trim().is_empty() {
            warn!("{} stderr: {}", label, line);
            tail.record(line);
        }
    }
}
