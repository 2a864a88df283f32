use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tempfile::TempDir;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::config::{ExecutorConfig, SandboxConfig};
use crate::error::{HiveError, Result};

const CHANNEL_DEPTH: usize = 4;
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Private channel to the process (or function) that runs job payloads.
///
/// Payloads go in through [`ExecutionUnit::send`]; results come back, one per
/// payload and in order, on the receiver returned at construction. The
/// receiver closing means the unit has died.
pub struct ExecutionUnit {
    input: mpsc::Sender<Vec<u8>>,
    tasks: Vec<JoinHandle<()>>,
    child: Option<Child>,
    workdir: Option<TempDir>,
}

impl ExecutionUnit {
    /// Run `work` on the blocking pool, one payload at a time.
    pub fn from_fn<F>(work: F) -> (Self, mpsc::Receiver<Vec<u8>>)
    where
        F: Fn(Vec<u8>) -> Vec<u8> + Send + Sync + 'static,
    {
        let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_DEPTH);
        let (result_tx, result_rx) = mpsc::channel(CHANNEL_DEPTH);
        let work = Arc::new(work);

        let task = tokio::spawn(async move {
            while let Some(payload) = input_rx.recv().await {
                let work = work.clone();
                match tokio::task::spawn_blocking(move || work(payload)).await {
                    Ok(result) => {
                        if result_tx.send(result).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        // Dropping result_tx tells the worker the unit is gone
                        tracing::error!(error = %e, "Work function failed, stopping execution unit");
                        break;
                    }
                }
            }
        });

        let unit = Self {
            input: input_tx,
            tasks: vec![task],
            child: None,
            workdir: None,
        };
        (unit, result_rx)
    }

    /// Spawn the configured program in a private temp directory and speak
    /// length-delimited frames over its stdin/stdout.
    pub fn spawn_process(config: &ExecutorConfig) -> Result<(Self, mpsc::Receiver<Vec<u8>>)> {
        let workdir = tempfile::Builder::new().prefix("jobhive-").tempdir()?;
        let (program, args) = command_line(config);

        tracing::info!(
            program = %program,
            args = ?args,
            workdir = %workdir.path().display(),
            sandboxed = config.sandbox.is_some(),
            "Starting execution unit"
        );

        let mut child = Command::new(&program)
            .args(&args)
            .current_dir(workdir.path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| HiveError::Execution(format!("failed to start {program}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| HiveError::Execution("child stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HiveError::Execution("child stdout not captured".to_string()))?;

        let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_DEPTH);
        let (result_tx, result_rx) = mpsc::channel(CHANNEL_DEPTH);

        let writer = tokio::spawn(async move {
            let mut frames = FramedWrite::new(stdin, LengthDelimitedCodec::new());
            while let Some(payload) = input_rx.recv().await {
                if let Err(e) = frames.send(Bytes::from(payload)).await {
                    tracing::error!(error = %e, "Failed to write payload to execution unit");
                    break;
                }
            }
            // Dropping the sink closes stdin so the program can exit
        });

        let reader = tokio::spawn(async move {
            let mut frames = FramedRead::new(stdout, LengthDelimitedCodec::new());
            while let Some(frame) = frames.next().await {
                match frame {
                    Ok(bytes) => {
                        if result_tx.send(bytes.to_vec()).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Malformed frame from execution unit");
                        break;
                    }
                }
            }
            tracing::debug!("Execution unit output closed");
        });

        let unit = Self {
            input: input_tx,
            tasks: vec![writer, reader],
            child: Some(child),
            workdir: Some(workdir),
        };
        Ok((unit, result_rx))
    }

    pub async fn send(&self, payload: Vec<u8>) -> Result<()> {
        self.input
            .send(payload)
            .await
            .map_err(|_| HiveError::Execution("execution unit stopped".to_string()))
    }

    pub fn workdir(&self) -> Option<&Path> {
        self.workdir.as_ref().map(|d| d.path())
    }

    /// Stop the unit and release its process and temp directory.
    pub async fn terminate(self) {
        let Self {
            input,
            tasks,
            child,
            workdir,
        } = self;
        drop(input);

        if let Some(mut child) = child {
            match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
                Ok(Ok(status)) => tracing::debug!(%status, "Execution unit exited"),
                Ok(Err(e)) => tracing::warn!(error = %e, "Failed to wait for execution unit"),
                Err(_) => {
                    tracing::warn!("Execution unit did not exit after stdin closed, killing");
                    if let Err(e) = child.kill().await {
                        tracing::warn!(error = %e, "Failed to kill execution unit");
                    }
                }
            }
        }

        for task in tasks {
            task.abort();
        }

        if let Some(dir) = workdir {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove work directory");
            }
        }
    }
}

/// Program and arguments to launch, wrapped in `docker run -i` when a
/// sandbox is configured.
pub fn command_line(config: &ExecutorConfig) -> (String, Vec<String>) {
    match &config.sandbox {
        None => (config.program.clone(), config.args.clone()),
        Some(sandbox) => {
            let mut args = sandbox_args(sandbox);
            args.push(config.program.clone());
            args.extend(config.args.iter().cloned());
            ("docker".to_string(), args)
        }
    }
}

fn sandbox_args(sandbox: &SandboxConfig) -> Vec<String> {
    // -i keeps stdin attached; the execution channel runs over it
    let mut args = vec!["run".to_string(), "-i".to_string(), "--rm".to_string()];

    if sandbox.network_disabled {
        args.push("--network=none".to_string());
    }
    if let Some(ref limit) = sandbox.memory_limit {
        args.push(format!("--memory={}", limit));
    }
    if let Some(ref limit) = sandbox.cpu_limit {
        args.push(format!("--cpus={}", limit));
    }

    args.push("--cap-drop=ALL".to_string());
    args.push("--security-opt=no-new-privileges".to_string());
    args.push("--read-only".to_string());
    args.push(sandbox.image.clone());
    args
}
