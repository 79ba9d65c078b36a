//! Engine running as a child process, spoken to over stdio.
//!
//! Commands go out as one JSON [`RequestFrame`] per line on stdin. The engine
//! answers with `{"replyTo": id, "reply": ...}` lines and may interleave
//! `{"event": ...}` lines at any time. Engine stderr is forwarded to the log.

use super::error::BridgeError;
use super::events::EventHub;
use super::protocol::{parse_inbound, EngineCommand, EngineReply, InboundFrame, RequestFrame};
use super::transport::{EngineTransport, LaunchInfo};
use crate::model::EngineEvent;
use anyhow::{anyhow, Context, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<EngineReply>>>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessConfig {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// How long the engine gets to exit after `shutdown` before it is killed.
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

struct Link {
    child: Child,
    stdin: ChildStdin,
    reader: JoinHandle<()>,
    stderr: JoinHandle<()>,
}

pub struct ProcessTransport {
    cfg: ProcessConfig,
    link: tokio::sync::Mutex<Option<Link>>,
    pending: Pending,
    next_id: AtomicU64,
}

impl ProcessTransport {
    pub fn new(cfg: ProcessConfig) -> Self {
        Self {
            cfg,
            link: tokio::sync::Mutex::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    async fn spawn(&self, hub: Arc<EventHub>) -> Result<LaunchInfo> {
        self.close_link(Duration::ZERO).await;

        let mut cmd = Command::new(&self.cfg.program);
        cmd.args(&self.cfg.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn engine {}", self.cfg.program.display()))?;
        let pid = child.id();
        let stdin = child.stdin.take().context("engine stdin was not captured")?;
        let stdout = child.stdout.take().context("engine stdout was not captured")?;
        let stderr = child.stderr.take().context("engine stderr was not captured")?;

        let pending = self.pending.clone();
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => match parse_inbound(&line) {
                        Ok(Some(InboundFrame::Reply { reply_to, reply })) => {
                            let waiter = pending.lock().remove(&reply_to);
                            match waiter {
                                Some(tx) => {
                                    let _ = tx.send(reply);
                                }
                                None => debug!(reply_to, "reply for unknown or expired request"),
                            }
                        }
                        Ok(Some(InboundFrame::Event { event })) => hub.publish(event),
                        Ok(None) => {}
                        Err(e) => warn!(error = %e, line = %line, "unparseable engine output"),
                    },
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "engine stdout read failed");
                        break;
                    }
                }
            }
            // Dropping the senders fails every in-flight request.
            pending.lock().clear();
            hub.publish(EngineEvent::Exited { code: None });
        });
        let stderr = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "engine", "{line}");
            }
        });

        *self.link.lock().await = Some(Link {
            child,
            stdin,
            reader,
            stderr,
        });

        let version = match self.send(EngineCommand::Hello).await {
            Ok(EngineReply::Hello { version }) => Some(version),
            Ok(other) => {
                self.close_link(Duration::ZERO).await;
                return Err(anyhow!("engine answered hello with {other:?}"));
            }
            Err(e) => {
                self.close_link(Duration::ZERO).await;
                return Err(anyhow!(e).context("engine handshake failed"));
            }
        };
        info!(pid = ?pid, version = ?version, "engine process up");
        Ok(LaunchInfo {
            process_id: pid,
            version,
        })
    }

    async fn send(&self, command: EngineCommand) -> Result<EngineReply, BridgeError> {
        let name = command.name();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut line = serde_json::to_string(&RequestFrame { id, command })
            .map_err(|e| BridgeError::MalformedInput(format!("cannot encode {name}: {e}")))?;
        line.push('\n');

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        {
            let mut link = self.link.lock().await;
            let Some(link) = link.as_mut() else {
                self.pending.lock().remove(&id);
                return Err(BridgeError::Transport("engine process is not attached".into()));
            };
            if let Err(e) = link.stdin.write_all(line.as_bytes()).await {
                self.pending.lock().remove(&id);
                return Err(BridgeError::Transport(format!("write to engine failed: {e}")));
            }
            if let Err(e) = link.stdin.flush().await {
                self.pending.lock().remove(&id);
                return Err(BridgeError::Transport(format!("flush to engine failed: {e}")));
            }
        }

        match tokio::time::timeout(self.cfg.request_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(BridgeError::Transport(format!(
                "engine closed its output before answering {name}"
            ))),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(BridgeError::Timeout(name))
            }
        }
    }

    /// Ask the engine to exit, kill it after `grace`, and wait for the reader to drain.
    async fn close_link(&self, grace: Duration) {
        let Some(mut link) = self.link.lock().await.take() else {
            return;
        };
        if !grace.is_zero() {
            let frame = RequestFrame {
                id: self.next_id.fetch_add(1, Ordering::Relaxed),
                command: EngineCommand::Shutdown,
            };
            if let Ok(mut line) = serde_json::to_string(&frame) {
                line.push('\n');
                let _ = link.stdin.write_all(line.as_bytes()).await;
                let _ = link.stdin.flush().await;
            }
        }
        drop(link.stdin);

        match tokio::time::timeout(grace, link.child.wait()).await {
            Ok(Ok(status)) => debug!(%status, "engine process exited"),
            Ok(Err(e)) => warn!(error = %e, "waiting for engine process failed"),
            Err(_) => {
                warn!("engine did not exit in time, killing it");
                if let Err(e) = link.child.kill().await {
                    warn!(error = %e, "failed to kill engine process");
                }
            }
        }
        // The old reader must finish before a new link exists, or its exit
        // notice would be mistaken for the new process dying.
        if tokio::time::timeout(Duration::from_secs(1), &mut link.reader)
            .await
            .is_err()
        {
            link.reader.abort();
        }
        link.stderr.abort();
    }
}

impl EngineTransport for ProcessTransport {
    fn launch(&self, hub: Arc<EventHub>) -> BoxFuture<'_, Result<LaunchInfo>> {
        self.spawn(hub).boxed()
    }

    fn shutdown(&self) -> BoxFuture<'_, Result<()>> {
        async move {
            self.close_link(self.cfg.shutdown_grace).await;
            Ok(())
        }
        .boxed()
    }

    fn request(&self, command: EngineCommand) -> BoxFuture<'_, Result<EngineReply, BridgeError>> {
        self.send(command).boxed()
    }

    fn describe(&self) -> String {
        format!("engine process {}", self.cfg.program.display())
    }
}
