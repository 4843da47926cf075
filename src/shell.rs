//! Interactive shells multiplexed over one connection.
//!
//! Each shell is an id plus the sending half of its channel. A pump task per
//! shell drains remote output into the shell's history and the notifier; when
//! the channel ends it reports the id on a single "ended" queue, and one reaper
//! task per multiplexer removes the shell from the map. Removal is the only
//! place `ShellClosed` is emitted, so a shell closed from both sides at once is
//! reported exactly once.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::notify::{Notification, Notifier};
use crate::transport::{ShellInput, ShellOutput, TermSize, Transport};

/// Snapshot of a live shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellInfo {
    pub id: String,
    pub term: String,
    pub size: TermSize,
    pub created_at: DateTime<Utc>,
}

struct ShellSession {
    id: String,
    term: String,
    size: std::sync::Mutex<TermSize>,
    created_at: DateTime<Utc>,
    input: mpsc::Sender<ShellInput>,
    history: Arc<Mutex<Vec<u8>>>,
}

impl ShellSession {
    fn info(&self) -> ShellInfo {
        let size = match self.size.lock() {
            Ok(size) => *size,
            Err(poisoned) => *poisoned.into_inner(),
        };
        ShellInfo {
            id: self.id.clone(),
            term: self.term.clone(),
            size,
            created_at: self.created_at,
        }
    }

    async fn push(&self, input: ShellInput) -> Result<()> {
        self.input
            .send(input)
            .await
            .map_err(|_| AppError::TransportFailure(format!("shell {} is closed", self.id)))
    }
}

#[derive(Default)]
struct ShellTable {
    sessions: HashMap<String, Arc<ShellSession>>,
    /// Set by `close_all`; no shell opens afterwards.
    closed: bool,
}

type ShellMap = Arc<Mutex<ShellTable>>;

pub struct ShellMultiplexer {
    remote_id: String,
    shells: ShellMap,
    notifier: Arc<dyn Notifier>,
    ended_tx: mpsc::UnboundedSender<String>,
}

impl ShellMultiplexer {
    pub fn new(remote_id: impl Into<String>, notifier: Arc<dyn Notifier>) -> Self {
        let remote_id = remote_id.into();
        let shells: ShellMap = Arc::new(Mutex::new(ShellTable::default()));
        let (ended_tx, ended_rx) = mpsc::unbounded_channel();

        tokio::spawn(reap_ended(
            remote_id.clone(),
            shells.clone(),
            notifier.clone(),
            ended_rx,
        ));

        Self {
            remote_id,
            shells,
            notifier,
            ended_tx,
        }
    }

    /// Open a pty channel and start forwarding its output.
    ///
    /// A failure to write `initial_command` is logged; the shell stays open.
    /// Fails with [`AppError::NotConnected`] once [`close_all`](Self::close_all) ran.
    pub async fn create(
        &self,
        transport: &dyn Transport,
        term: &str,
        size: TermSize,
        initial_command: Option<&str>,
    ) -> Result<ShellInfo> {
        if self.shells.lock().await.closed {
            return Err(AppError::NotConnected(self.remote_id.clone()));
        }

        let channel = transport.open_shell(term, size).await?;
        let session = Arc::new(ShellSession {
            id: Uuid::new_v4().to_string(),
            term: term.to_string(),
            size: std::sync::Mutex::new(size),
            created_at: Utc::now(),
            input: channel.input,
            history: Arc::new(Mutex::new(Vec::new())),
        });

        {
            let mut shells = self.shells.lock().await;
            if shells.closed {
                drop(shells);
                let _ = session.push(ShellInput::Close).await;
                return Err(AppError::NotConnected(self.remote_id.clone()));
            }
            shells.sessions.insert(session.id.clone(), session.clone());
        }

        tokio::spawn(pump_output(
            self.remote_id.clone(),
            session.id.clone(),
            channel.output,
            session.history.clone(),
            self.notifier.clone(),
            self.ended_tx.clone(),
        ));
        info!("Opened shell {} on {}", session.id, self.remote_id);

        if let Some(command) = initial_command.filter(|c| !c.is_empty()) {
            let mut line = command.to_string();
            if !line.ends_with('\n') {
                line.push('\n');
            }
            if let Err(e) = session.push(ShellInput::Data(Bytes::from(line))).await {
                warn!("Initial command for shell {} not sent: {}", session.id, e);
            }
        }

        Ok(session.info())
    }

    async fn session(&self, shell_id: &str) -> Result<Arc<ShellSession>> {
        self.shells
            .lock()
            .await
            .sessions
            .get(shell_id)
            .cloned()
            .ok_or_else(|| AppError::not_found("shell", shell_id))
    }

    pub async fn send(&self, shell_id: &str, data: &[u8]) -> Result<()> {
        let session = self.session(shell_id).await?;
        session
            .push(ShellInput::Data(Bytes::copy_from_slice(data)))
            .await
    }

    pub async fn resize(&self, shell_id: &str, size: TermSize) -> Result<()> {
        let session = self.session(shell_id).await?;
        session.push(ShellInput::Resize(size)).await?;
        if let Ok(mut current) = session.size.lock() {
            *current = size;
        }
        Ok(())
    }

    /// Close a shell. Unknown ids are ignored.
    pub async fn destroy(&self, shell_id: &str) -> Result<()> {
        let Some(session) = self.shells.lock().await.sessions.remove(shell_id) else {
            return Ok(());
        };
        self.close(&session).await;
        Ok(())
    }

    async fn close(&self, session: &ShellSession) {
        if session.push(ShellInput::Close).await.is_err() {
            debug!("Shell {} channel already gone", session.id);
        }
        info!("Closed shell {} on {}", session.id, self.remote_id);
        self.notifier.notify(
            &self.remote_id,
            Notification::ShellClosed {
                shell_id: session.id.clone(),
            },
        );
    }

    /// Everything the remote has sent on this shell so far.
    pub async fn history(&self, shell_id: &str) -> Result<Vec<u8>> {
        let session = self.session(shell_id).await?;
        let history = session.history.lock().await;
        Ok(history.clone())
    }

    pub async fn list(&self) -> Vec<ShellInfo> {
        let mut shells: Vec<ShellInfo> = self
            .shells
            .lock()
            .await
            .sessions
            .values()
            .map(|s| s.info())
            .collect();
        shells.sort_by_key(|s| s.created_at);
        shells
    }

    /// Close every shell and refuse new ones from now on.
    pub async fn close_all(&self) {
        let drained: Vec<Arc<ShellSession>> = {
            let mut shells = self.shells.lock().await;
            shells.closed = true;
            shells.sessions.drain().map(|(_, session)| session).collect()
        };
        for session in drained {
            self.close(&session).await;
        }
    }
}

async fn pump_output(
    remote_id: String,
    shell_id: String,
    mut output: mpsc::Receiver<ShellOutput>,
    history: Arc<Mutex<Vec<u8>>>,
    notifier: Arc<dyn Notifier>,
    ended: mpsc::UnboundedSender<String>,
) {
    while let Some(msg) = output.recv().await {
        match msg {
            ShellOutput::Data(data) | ShellOutput::Stderr(data) => {
                history.lock().await.extend_from_slice(&data);
                notifier.notify(
                    &remote_id,
                    Notification::ShellData {
                        shell_id: shell_id.clone(),
                        text: String::from_utf8_lossy(&data).to_string(),
                    },
                );
            }
            ShellOutput::Exit(status) => {
                debug!("Shell {} exited with {:?}", shell_id, status);
                break;
            }
        }
    }
    let _ = ended.send(shell_id);
}

async fn reap_ended(
    remote_id: String,
    shells: ShellMap,
    notifier: Arc<dyn Notifier>,
    mut ended: mpsc::UnboundedReceiver<String>,
) {
    while let Some(shell_id) = ended.recv().await {
        let removed = shells.lock().await.sessions.remove(&shell_id);
        if removed.is_some() {
            info!("Shell {} on {} ended remotely", shell_id, remote_id);
            notifier.notify(&remote_id, Notification::ShellClosed { shell_id });
        }
    }
}
