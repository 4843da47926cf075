use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Remote '{0}' is not connected")]
    NotConnected(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Authentication error: {0}")]
    AuthFailure(String),

    #[error("SSH connection failed: {0}")]
    TransportFailure(String),

    #[error("Remote command exited with status {exit_code}: {stderr}")]
    RemoteCommand { exit_code: u32, stderr: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Russh error: {0}")]
    Russh(#[from] russh::Error),

    #[error("Russh Sftp error: {0}")]
    Sftp(#[from] russh_sftp::client::error::Error),
}

impl AppError {
    pub fn not_found(what: &str, id: &str) -> Self {
        AppError::NotFound(format!("{what} '{id}'"))
    }
}

/// Application result type alias
pub type Result<T> = std::result::Result<T, AppError>;
