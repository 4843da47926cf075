pub mod encryption;
pub mod manager;

pub use manager::{
    AppSettings, AuthConfig, ConfigFile, RemoteIdentity, RemoteRegistry, Shortcut, TunnelConfig,
};
