/// Backend process management
///
/// Spawns the backend bridge and pumps its pipes: stdout arrives as raw
/// chunks, stderr line by line, and commands queued on the outbound
/// channel are written to stdin. Closing the outbound channel stops the
/// process.

use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::types::SessionParameters;

const READ_CHUNK: usize = 4096;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Failed to start backend process: {0}")]
    StartError(#[from] std::io::Error),
    #[error("Backend process has no {0} pipe")]
    MissingPipe(&'static str),
}

pub type Result<T> = std::result::Result<T, ProcessError>;

/// What the pipe tasks report back to the session loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    Output(Vec<u8>),
    Stderr(String),
    Exited(Option<i32>),
    Error(String),
}

pub struct BackendProcess {
    child: Child,
}

impl BackendProcess {
    /// Start `program` with piped stdio. The inferior's environment and
    /// working directory are handed to the bridge process.
    pub fn start(program: &str, args: &[String], params: &SessionParameters) -> Result<Self> {
        log::debug!("Starting backend process: {} {:?}", program, args);

        let mut command = Command::new(program);
        command
            .args(args)
            .envs(&params.environment)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &params.working_dir {
            command.current_dir(dir);
        }
        let child = command.spawn()?;

        log::debug!("Backend process started with PID: {:?}", child.id());
        Ok(Self { child })
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Hand the pipes to background tasks. Lines from `outbound` go to the
    /// backend's stdin; everything the backend produces lands on `events`.
    pub fn attach(
        mut self,
        mut outbound: mpsc::UnboundedReceiver<String>,
        events: mpsc::UnboundedSender<BackendEvent>,
    ) -> Result<()> {
        let mut stdin = self.child.stdin.take().ok_or(ProcessError::MissingPipe("stdin"))?;
        let mut stdout = self.child.stdout.take().ok_or(ProcessError::MissingPipe("stdout"))?;
        let stderr = self.child.stderr.take().ok_or(ProcessError::MissingPipe("stderr"))?;

        let output_events = events.clone();
        let stdout_reader = tokio::spawn(async move {
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) => break, // EOF
                    Ok(n) => {
                        if output_events.send(BackendEvent::Output(buf[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        log::error!("Error reading backend stdout: {}", e);
                        let _ = output_events.send(BackendEvent::Error(e.to_string()));
                        break;
                    }
                }
            }
            log::debug!("Backend stdout reader finished");
        });

        let stderr_events = events.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if !line.trim().is_empty() && stderr_events.send(BackendEvent::Stderr(line)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        log::debug!("Error reading backend stderr: {}", e);
                        break;
                    }
                }
            }
            log::debug!("Backend stderr reader finished");
        });

        let mut child = self.child;
        tokio::spawn(async move {
            let exited = loop {
                tokio::select! {
                    line = outbound.recv() => {
                        let Some(line) = line else {
                            break None;
                        };
                        let written = match stdin.write_all(line.as_bytes()).await {
                            Ok(()) => stdin.flush().await,
                            Err(e) => Err(e),
                        };
                        if let Err(e) = written {
                            log::error!("Failed to write to backend: {}", e);
                            let _ = events.send(BackendEvent::Error(e.to_string()));
                        }
                    }
                    status = child.wait() => break Some(status),
                }
            };
            drop(stdin);

            let status = match exited {
                Some(status) => status,
                None => {
                    log::debug!("Backend link closed, waiting for process exit");
                    match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                        Ok(status) => status,
                        Err(_) => {
                            log::warn!("Backend did not exit in time, killing it");
                            if let Err(e) = child.kill().await {
                                log::error!("Failed to kill backend: {}", e);
                            }
                            child.wait().await
                        }
                    }
                }
            };

            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    log::error!("Failed to collect backend exit status: {}", e);
                    None
                }
            };
            log::debug!("Backend process exited with code {:?}", code);

            // Exited must not overtake the last blocks still in the pipe.
            match tokio::time::timeout(SHUTDOWN_GRACE, stdout_reader).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::error!("Backend stdout reader failed: {}", e),
                Err(_) => log::warn!("Backend stdout still open after exit, not waiting for it"),
            }
            let _ = events.send(BackendEvent::Exited(code));
        });

        Ok(())
    }
}
