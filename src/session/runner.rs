use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::event::AppEvent;
use crate::protocol::parse::parse_line;

/// What to launch and where.
#[derive(Debug, Clone)]
pub struct AgentCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl AgentCommand {
    /// The stream-json agent CLI with permission prompts routed over stdio.
    pub fn claude(model: &str, resume: Option<&str>, extra_args: &[String]) -> Self {
        Self {
            program: "claude".to_string(),
            args: build_args(model, resume, extra_args),
            cwd: None,
        }
    }
}

pub fn build_args(model: &str, resume: Option<&str>, extra_args: &[String]) -> Vec<String> {
    let mut args: Vec<String> = [
        "-p",
        "--output-format",
        "stream-json",
        "--verbose",
        "--input-format",
        "stream-json",
        "--permission-prompt-tool",
        "stdio",
        "--model",
    ]
    .iter()
    .map(ToString::to_string)
    .collect();
    args.push(model.to_string());
    if let Some(id) = resume {
        args.push("--resume".to_string());
        args.push(id.to_string());
    }
    args.extend(extra_args.iter().cloned());
    args
}

/// A running agent process wired to channels.
///
/// Stdout lines become [`AppEvent`]s; strings sent on the outbound channel
/// become stdin lines. Dropping the runner kills the process.
pub struct AgentRunner {
    close_input: Option<oneshot::Sender<()>>,
    kill: Option<oneshot::Sender<()>>,
}

impl AgentRunner {
    /// Spawn the agent. Events arrive on `event_tx`, ending with exactly one
    /// [`AppEvent::ProcessExit`] once stdout has closed and the process has
    /// been reaped.
    pub fn spawn(
        command: &AgentCommand,
        outbound: mpsc::UnboundedReceiver<String>,
        event_tx: mpsc::UnboundedSender<AppEvent>,
    ) -> Result<Self> {
        let mut cmd = tokio::process::Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &command.cwd {
            cmd.current_dir(cwd);
        }
        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn {}", command.program))?;

        let stdout = child.stdout.take().context("agent stdout not piped")?;
        let stderr = child.stderr.take().context("agent stderr not piped")?;
        let stdin = child.stdin.take().context("agent stdin not piped")?;

        let (close_tx, close_rx) = oneshot::channel();
        let (kill_tx, kill_rx) = oneshot::channel();
        spawn_writer(stdin, outbound, close_rx);
        spawn_stderr_reader(stderr, event_tx.clone());
        let reader = spawn_reader(stdout, event_tx.clone());
        spawn_supervisor(child, reader, kill_rx, event_tx);

        Ok(Self {
            close_input: Some(close_tx),
            kill: Some(kill_tx),
        })
    }

    /// Close the agent's stdin, signalling it to finish.
    pub fn close_input(&mut self) {
        if let Some(tx) = self.close_input.take() {
            let _ = tx.send(());
        }
    }

    pub fn kill(&mut self) {
        if let Some(tx) = self.kill.take() {
            let _ = tx.send(());
        }
    }
}

fn spawn_supervisor(
    mut child: Child,
    reader: JoinHandle<()>,
    mut kill: oneshot::Receiver<()>,
    event_tx: mpsc::UnboundedSender<AppEvent>,
) {
    tokio::spawn(async move {
        let exited = tokio::select! {
            status = async {
                let _ = reader.await;
                child.wait().await
            } => Some(status),
            _ = &mut kill => None,
        };
        let code = match exited {
            Some(Ok(status)) => status.code(),
            Some(Err(e)) => {
                warn!(error = %e, "failed to wait for agent");
                None
            }
            None => {
                debug!("killing agent");
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "failed to kill agent");
                }
                None
            }
        };
        let _ = event_tx.send(AppEvent::ProcessExit(code));
    });
}

fn spawn_writer(
    mut stdin: ChildStdin,
    mut outbound: mpsc::UnboundedReceiver<String>,
    mut close: oneshot::Receiver<()>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                line = outbound.recv() => {
                    let Some(line) = line else { break };
                    let written = async {
                        stdin.write_all(line.as_bytes()).await?;
                        stdin.write_all(b"\n").await?;
                        stdin.flush().await
                    }
                    .await;
                    if let Err(e) = written {
                        warn!(error = %e, "failed to write to agent stdin");
                        break;
                    }
                }
                _ = &mut close => break,
            }
        }
        debug!("agent stdin closed");
    });
}

/// Parse stdout as NDJSON until it closes.
fn spawn_reader<R>(stdout: R, event_tx: mpsc::UnboundedSender<AppEvent>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let event = match parse_line(&line) {
                Ok(Some(event)) => AppEvent::Agent(Box::new(event)),
                Ok(None) => continue,
                Err(e) => AppEvent::ParseWarning(format!(
                    "failed to parse agent output: {e}\n  line: {line}"
                )),
            };
            if event_tx.send(event).is_err() {
                return;
            }
        }
    })
}

fn spawn_stderr_reader<R>(stderr: R, event_tx: mpsc::UnboundedSender<AppEvent>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if event_tx.send(AppEvent::Stderr(line)).is_err() {
                return;
            }
        }
    });
}
