mod config;
mod error;
mod filesystem;
mod manager;
mod notify;
mod shell;
mod transport;
mod tunnel;
mod utils;

pub use config::encryption::SecretCipher;
pub use config::{
    AppSettings, AuthConfig, ConfigFile, RemoteIdentity, RemoteRegistry, Shortcut, TunnelConfig,
};
pub use error::{AppError, Result};
pub use filesystem::{
    ConflictDecision, DirectoryManifest, FileKind, ListOptions, OwnerTables, Permissions,
    RemoteFile, RemoteFiles, TransferOutcome, TransferReport,
};
pub use manager::{ConnectionManager, ConnectionState, OsFamily, RemoteConnection};
pub use notify::{ChannelNotifier, Notification, Notifier, NullNotifier};
pub use shell::{ShellInfo, ShellMultiplexer};
pub use transport::{
    AuthStep, CommandOutput, ConnectParams, Connected, Connector, FileStat, KeySource, RemoteFs,
    ShellChannel, ShellInput, ShellOutput, SshConnector, TermSize, Transport, TransportEvent,
    TunnelStream,
};
pub use tunnel::{TunnelManager, TunnelStatus};
pub use utils::{expand_tilde, init_tracing};
