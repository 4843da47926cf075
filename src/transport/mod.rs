//! Transport adapter: the capabilities one authenticated SSH connection
//! offers to the rest of the crate.
//!
//! The connection manager only ever talks to these traits. [`ssh`] provides
//! the real implementation on top of `russh`; tests use an in-memory one.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::error::{AppError, Result};

#[cfg(test)]
pub mod mock;
pub mod ssh;

pub use ssh::SshConnector;

/// Pseudo-terminal geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TermSize {
    pub cols: u32,
    pub rows: u32,
}

impl Default for TermSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// Messages written into an interactive shell channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellInput {
    Data(Bytes),
    Resize(TermSize),
    Close,
}

/// Messages read from an interactive shell channel. `Exit` is always last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellOutput {
    Data(Bytes),
    Stderr(Bytes),
    Exit(Option<u32>),
}

/// Both ends of an open pty channel, as seen by its owner.
pub struct ShellChannel {
    pub input: mpsc::Sender<ShellInput>,
    pub output: mpsc::Receiver<ShellOutput>,
}

/// Byte stream carried by a direct-tcpip channel.
pub trait TunnelStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> TunnelStream for T {}

/// Result of a remote command. A non-zero exit is an expected outcome, not an error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: u32,
}

impl CommandOutput {
    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    pub fn stderr_string(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    /// Turn a non-zero exit into [`AppError::RemoteCommand`].
    pub fn into_result(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(AppError::RemoteCommand {
                exit_code: self.exit_code,
                stderr: self.stderr_string().trim().to_string(),
            })
        }
    }
}

/// Raw attributes of a remote path as reported by the file-transfer channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileStat {
    pub mode: Option<u32>,
    pub size: Option<u64>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub mtime: Option<u32>,
}

/// Lifecycle events pushed by a live transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Disconnected { reason: String },
}

/// Where a private key comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    Inline(String),
    File(PathBuf),
}

/// One authentication attempt. Attempts run in order, each at most once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStep {
    PublicKey {
        key: KeySource,
        passphrase: Option<String>,
    },
    Password(String),
}

#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub auth: Vec<AuthStep>,
    pub connect_timeout: u64,
    pub keepalive_interval: u64,
}

impl ConnectParams {
    pub fn host_port(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A freshly authenticated transport and its lifecycle event stream.
pub struct Connected {
    pub transport: Arc<dyn Transport>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, params: &ConnectParams) -> Result<Connected>;
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn exec(&self, command: &str) -> Result<CommandOutput>;

    async fn open_shell(&self, term: &str, size: TermSize) -> Result<ShellChannel>;

    async fn open_sftp(&self) -> Result<Arc<dyn RemoteFs>>;

    /// Open a channel to `host:port` as seen from the remote side.
    async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u16,
        originator: SocketAddr,
    ) -> Result<Box<dyn TunnelStream>>;

    async fn close(&self) -> Result<()>;
}

/// File-transfer sub-channel operations.
#[async_trait]
pub trait RemoteFs: Send + Sync {
    /// Entries of a directory, without following symlinks.
    async fn read_dir(&self, path: &str) -> Result<Vec<(String, FileStat)>>;

    /// Attributes of a path, following symlinks.
    async fn stat(&self, path: &str) -> Result<FileStat>;

    /// Attributes of the path itself; a symlink is not followed.
    async fn symlink_stat(&self, path: &str) -> Result<FileStat>;

    async fn exists(&self, path: &str) -> Result<bool>;

    async fn canonicalize(&self, path: &str) -> Result<String>;

    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Create or truncate `path` with `data`.
    async fn write(&self, path: &str, data: &[u8]) -> Result<()>;

    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    async fn set_mode(&self, path: &str, mode: u32) -> Result<()>;

    async fn mkdir(&self, path: &str) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
