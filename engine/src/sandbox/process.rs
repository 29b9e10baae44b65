//! Process sandbox
//!
//! Runs a program as a child process with:
//! - a cleared environment and a scratch working directory
//! - CPU-seconds and address-space ceilings (`ulimit -t` / `ulimit -v`)
//! - stdout/stderr capped at the output ceiling; overflowing terminates the child
//! - a wall-clock deadline and a cancellation token, both of which send
//!   SIGTERM, wait `kill_grace`, then force-kill
//!
//! The child is spawned with `kill_on_drop`, so dropping the invocation
//! never leaks a process.

use sdk::errors::EngineError;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SandboxConfig;
use sdk::types::ResourceLimits;

/// Shell prologue that applies the ceilings and then execs the program
const ULIMIT_PROLOGUE: &str =
    r#"ulimit -t "$1" 2>/dev/null; ulimit -v "$2" 2>/dev/null; shift 2; exec "$@""#;

/// Captured output of a finished child
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit code, or -1 when terminated by a signal
    pub return_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Spawns child processes under resource ceilings
#[derive(Debug, Clone)]
pub struct ProcessSandbox {
    kill_grace: Duration,
    python_bin: String,
}

impl ProcessSandbox {
    pub fn new(kill_grace: Duration, python_bin: impl Into<String>) -> Self {
        Self {
            kill_grace,
            python_bin: python_bin.into(),
        }
    }

    pub fn from_config(config: &SandboxConfig) -> Self {
        Self::new(
            Duration::from_millis(config.kill_grace_ms),
            config.python_bin.clone(),
        )
    }

    pub fn python_bin(&self) -> &str {
        &self.python_bin
    }

    /// Run `program args...` in `work_dir` under `limits`.
    ///
    /// Timeouts, cancellation and output overflow are errors; a non-zero exit
    /// code is not, it is reported in [`ProcessOutput::return_code`].
    pub async fn run(
        &self,
        program: &str,
        args: &[&str],
        work_dir: &Path,
        limits: &ResourceLimits,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput, EngineError> {
        let memory_kb = (limits.memory_bytes / 1024).max(1);

        let mut child = Command::new("/bin/sh")
            .arg("-c")
            .arg(ULIMIT_PROLOGUE)
            .arg("cairn-sandbox")
            .arg(limits.cpu_seconds.max(1).to_string())
            .arg(memory_kb.to_string())
            .arg(program)
            .args(args)
            .current_dir(work_dir)
            .env_clear()
            .env("PATH", "/usr/local/bin:/usr/bin:/bin")
            .env("HOME", work_dir)
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .env("PYTHONUNBUFFERED", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::Sandbox(format!("failed to start {}: {}", program, e)))?;

        info!(
            "Spawned sandboxed {} (pid {:?}, cpu {}s, mem {} KB)",
            program,
            child.id(),
            limits.cpu_seconds,
            memory_kb
        );

        let cap = limits.max_output_bytes;
        let (overflow_tx, mut overflow_rx) = mpsc::channel::<&'static str>(2);
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Sandbox("stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::Sandbox("stderr not captured".into()))?;
        let stdout_task = tokio::spawn(read_capped(stdout, cap, "stdout", overflow_tx.clone()));
        let stderr_task = tokio::spawn(read_capped(stderr, cap, "stderr", overflow_tx));

        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status?),
            _ = tokio::time::sleep(limits.timeout) => Outcome::TimedOut,
            _ = cancel.cancelled() => Outcome::Cancelled,
            Some(stream) = overflow_rx.recv() => Outcome::Overflowed(stream),
        };

        let finished = match outcome {
            Outcome::Exited(status) => Ok(status),
            Outcome::TimedOut => Err(EngineError::SandboxTimeout(
                limits.timeout.as_millis() as u64,
            )),
            Outcome::Cancelled => Err(EngineError::Cancelled),
            Outcome::Overflowed(stream) => Err(EngineError::ResourceLimitExceeded(format!(
                "{} exceeded the {} byte ceiling",
                stream, cap
            ))),
        };

        let status = match finished {
            Ok(status) => status,
            Err(err) => {
                self.terminate(&mut child).await;
                stdout_task.abort();
                stderr_task.abort();
                return Err(err);
            }
        };

        let stdout = join_reader(stdout_task).await?;
        let stderr = join_reader(stderr_task).await?;
        if stdout.len() > cap || stderr.len() > cap {
            return Err(EngineError::ResourceLimitExceeded(format!(
                "output exceeded the {} byte ceiling",
                cap
            )));
        }

        let return_code = exit_code(&status);
        debug!("Sandboxed {} exited with {}", program, return_code);

        Ok(ProcessOutput {
            return_code,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }

    /// SIGTERM, wait for the grace period, then SIGKILL
    async fn terminate(&self, child: &mut Child) {
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                warn!("Failed to send SIGTERM to {}: {}", pid, e);
            }
        }

        match tokio::time::timeout(self.kill_grace, child.wait()).await {
            Ok(_) => debug!("Sandboxed child exited after SIGTERM"),
            Err(_) => {
                warn!(
                    "Sandboxed child ignored SIGTERM for {:?}, killing",
                    self.kill_grace
                );
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill sandboxed child: {}", e);
                }
            }
        }
    }
}

enum Outcome {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
    Overflowed(&'static str),
}

/// Read up to `cap + 1` bytes; signal overflow instead of reading further
async fn read_capped<R>(
    mut reader: R,
    cap: usize,
    stream: &'static str,
    overflow: mpsc::Sender<&'static str>,
) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(buf);
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > cap {
            let _ = overflow.send(stream).await;
            return Ok(buf);
        }
    }
}

async fn join_reader(
    task: tokio::task::JoinHandle<std::io::Result<Vec<u8>>>,
) -> Result<Vec<u8>, EngineError> {
    task.await
        .map_err(|e| EngineError::Sandbox(format!("output reader failed: {}", e)))?
        .map_err(EngineError::from)
}

fn exit_code(status: &ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}
