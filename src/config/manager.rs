use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
    sync::RwLock,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{AppError, Result};

/// Application settings
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct AppSettings {
    /// Seconds allowed for the TCP connect and SSH handshake.
    pub connection_timeout: u64,
    /// Seconds between keep-alive probes, `0` disables them.
    pub keepalive_interval: u64,
    pub default_term: String,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            connection_timeout: 20,
            keepalive_interval: 30,
            default_term: "xterm-256color".to_string(),
        }
    }
}

/// Credentials for one remote. Secrets are sealed on disk, and dropped from
/// the persisted form entirely when their `store_*` flag is off.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct AuthConfig {
    #[serde(with = "super::encryption::sealed", skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub store_password: bool,
    /// Inline private key (PEM / OpenSSH format).
    #[serde(with = "super::encryption::sealed", skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    pub store_private_key: bool,
    /// Path to a private key file, used when no inline key is set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key_file: Option<String>,
    #[serde(with = "super::encryption::sealed", skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
    pub store_passphrase: bool,
}

impl AuthConfig {
    pub fn password(password: impl Into<String>) -> Self {
        Self {
            password: Some(password.into()),
            store_password: true,
            ..Default::default()
        }
    }

    pub fn key_file(path: impl Into<String>, passphrase: Option<String>) -> Self {
        Self {
            private_key_file: Some(path.into()),
            store_passphrase: passphrase.is_some(),
            passphrase,
            ..Default::default()
        }
    }

    pub fn has_key(&self) -> bool {
        self.private_key.is_some() || self.private_key_file.is_some()
    }

    pub fn has_password(&self) -> bool {
        self.password.is_some()
    }

    /// Copy suitable for writing to disk.
    fn redacted(&self) -> Self {
        let mut out = self.clone();
        if !out.store_password {
            out.password = None;
        }
        if !out.store_private_key {
            out.private_key = None;
        }
        if !out.store_passphrase {
            out.passphrase = None;
        }
        out
    }
}

/// A saved local port forward.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TunnelConfig {
    pub id: String,
    pub name: String,
    pub local_port: u16,
    #[serde(default)]
    pub remote_address: String,
    #[serde(default)]
    pub remote_port: u16,
    /// Serve SOCKS5 on the local port instead of a fixed destination.
    #[serde(default)]
    pub socks: bool,
    #[serde(default)]
    pub auto_connect: bool,
}

impl TunnelConfig {
    pub fn new(
        name: impl Into<String>,
        local_port: u16,
        remote_address: impl Into<String>,
        remote_port: u16,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            local_port,
            remote_address: remote_address.into(),
            remote_port,
            socks: false,
            auto_connect: false,
        }
    }

    pub fn socks(name: impl Into<String>, local_port: u16) -> Self {
        Self {
            socks: true,
            ..Self::new(name, local_port, "", 0)
        }
    }

    /// A forward needs a local port and, unless it is SOCKS, a destination.
    pub fn can_start(&self) -> bool {
        if self.local_port == 0 {
            return false;
        }
        self.socks || (!self.remote_address.trim().is_empty() && self.remote_port > 0)
    }

    pub fn display_target(&self) -> String {
        if self.socks {
            "socks5".to_string()
        } else {
            format!("{}:{}", self.remote_address, self.remote_port)
        }
    }
}

/// A named command saved against a remote.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Shortcut {
    pub id: String,
    pub name: String,
    pub command: String,
}

impl Shortcut {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            command: command.into(),
        }
    }
}

/// Represents a configured remote host
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RemoteIdentity {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub revision: u64,
    #[serde(default)]
    pub tunnels: Vec<TunnelConfig>,
    #[serde(default)]
    pub shortcuts: Vec<Shortcut>,
    pub created_at: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
}

impl RemoteIdentity {
    pub fn new(host: impl Into<String>, port: u16, user: impl Into<String>, auth: AuthConfig) -> Self {
        let host = host.into();
        Self {
            id: Uuid::new_v4().to_string(),
            name: host.clone(),
            host,
            port,
            user: user.into(),
            auth,
            revision: 0,
            tunnels: Vec::new(),
            shortcuts: Vec::new(),
            created_at: Utc::now(),
            last_used: None,
        }
    }

    pub fn host_port(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(AppError::InvalidArgument("Host cannot be empty".to_string()));
        }
        if self.port == 0 {
            return Err(AppError::InvalidArgument(
                "Port must be greater than 0".to_string(),
            ));
        }
        if self.user.trim().is_empty() {
            return Err(AppError::InvalidArgument(
                "Username cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn tunnel(&self, tunnel_id: &str) -> Option<&TunnelConfig> {
        self.tunnels.iter().find(|t| t.id == tunnel_id)
    }

    fn redacted(&self) -> Self {
        Self {
            auth: self.auth.redacted(),
            ..self.clone()
        }
    }
}

/// On-disk configuration document
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct ConfigFile {
    pub settings: AppSettings,
    pub remotes: Vec<RemoteIdentity>,
    /// Ids of deleted remotes; never handed out again.
    pub retired_ids: Vec<String>,
}

struct RegistryState {
    config: ConfigFile,
    connected: HashSet<String>,
}

/// Durable list of remotes plus the in-memory set of connected ones.
pub struct RemoteRegistry {
    path: Option<PathBuf>,
    state: RwLock<RegistryState>,
}

impl RemoteRegistry {
    /// Registry backed by `~/.config/hostdeck/config.toml`.
    pub fn new() -> Result<Self> {
        Self::with_path(Self::default_config_path()?)
    }

    /// Registry backed by an explicit file (created on first save).
    pub fn with_path<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let config_path = config_path.as_ref().to_path_buf();
        let config = Self::load_config_from_path(&config_path)?;
        Ok(Self::from_parts(Some(config_path), config))
    }

    /// Registry that never touches disk.
    pub fn in_memory() -> Self {
        Self::from_parts(None, ConfigFile::default())
    }

    fn from_parts(path: Option<PathBuf>, config: ConfigFile) -> Self {
        Self {
            path,
            state: RwLock::new(RegistryState {
                config,
                connected: HashSet::new(),
            }),
        }
    }

    pub fn default_config_path() -> Result<PathBuf> {
        let home_dir = dirs::home_dir()
            .ok_or_else(|| AppError::Config("Cannot determine home directory".to_string()))?;
        Ok(home_dir.join(".config").join("hostdeck").join("config.toml"))
    }

    fn load_config_from_path(config_path: &Path) -> Result<ConfigFile> {
        if !config_path.exists() {
            return Ok(ConfigFile::default());
        }

        let content = fs::read_to_string(config_path)
            .map_err(|e| AppError::Config(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| AppError::Config(format!("Failed to parse config file: {}", e)))
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, RegistryState>> {
        self.state
            .read()
            .map_err(|_| AppError::Config("Registry lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, RegistryState>> {
        self.state
            .write()
            .map_err(|_| AppError::Config("Registry lock poisoned".to_string()))
    }

    fn save_locked(&self, state: &RegistryState) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let persisted = ConfigFile {
            settings: state.config.settings.clone(),
            remotes: state.config.remotes.iter().map(RemoteIdentity::redacted).collect(),
            retired_ids: state.config.retired_ids.clone(),
        };
        let toml = toml::to_string_pretty(&persisted)
            .map_err(|e| AppError::Config(format!("Failed to serialize config: {}", e)))?;

        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            fs::create_dir_all(dir).map_err(|e| {
                AppError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }
        fs::write(path, toml)
            .map_err(|e| AppError::Config(format!("Failed to write config: {}", e)))?;
        debug!("Config saved to {}", path.display());
        Ok(())
    }

    /// Persist current state to disk
    pub fn save(&self) -> Result<()> {
        let state = self.read()?;
        self.save_locked(&state)
    }

    pub fn settings(&self) -> Result<AppSettings> {
        Ok(self.read()?.config.settings.clone())
    }

    pub fn remotes(&self) -> Result<Vec<RemoteIdentity>> {
        Ok(self.read()?.config.remotes.clone())
    }

    pub fn remote(&self, id: &str) -> Result<RemoteIdentity> {
        self.read()?
            .config
            .remotes
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| AppError::not_found("remote", id))
    }

    /// Look a remote up by id, falling back to its display name.
    pub fn resolve(&self, id_or_name: &str) -> Result<RemoteIdentity> {
        let state = self.read()?;
        let remotes = &state.config.remotes;
        remotes
            .iter()
            .find(|r| r.id == id_or_name)
            .or_else(|| remotes.iter().find(|r| r.name == id_or_name))
            .cloned()
            .ok_or_else(|| AppError::not_found("remote", id_or_name))
    }

    /// Add a remote and persist it, returning its id.
    pub fn add_remote(&self, mut remote: RemoteIdentity) -> Result<String> {
        remote.validate()?;

        let mut state = self.write()?;
        let taken = |id: &str, s: &RegistryState| {
            s.config.remotes.iter().any(|r| r.id == id)
                || s.config.retired_ids.iter().any(|r| r == id)
        };
        if remote.id.is_empty() || taken(&remote.id, &*state) {
            remote.id = Uuid::new_v4().to_string();
        }
        let id = remote.id.clone();
        info!("Adding remote {} ({})", remote.name, remote.host_port());
        state.config.remotes.push(remote);
        self.save_locked(&state)?;
        Ok(id)
    }

    /// Replace a remote's fields and bump its revision. Returns the new revision.
    pub fn update_remote(&self, remote: RemoteIdentity) -> Result<u64> {
        remote.validate()?;

        let mut state = self.write()?;
        let existing = state
            .config
            .remotes
            .iter_mut()
            .find(|r| r.id == remote.id)
            .ok_or_else(|| AppError::not_found("remote", &remote.id))?;

        let revision = existing.revision + 1;
        *existing = RemoteIdentity {
            revision,
            created_at: existing.created_at,
            ..remote
        };
        self.save_locked(&state)?;
        Ok(revision)
    }

    pub fn remove_remote(&self, id: &str) -> Result<()> {
        let mut state = self.write()?;
        let before = state.config.remotes.len();
        state.config.remotes.retain(|r| r.id != id);
        if state.config.remotes.len() == before {
            return Err(AppError::not_found("remote", id));
        }
        state.config.retired_ids.push(id.to_string());
        state.connected.remove(id);
        self.save_locked(&state)
    }

    pub fn find_connection_state(&self, id: &str) -> bool {
        self.read().map(|s| s.connected.contains(id)).unwrap_or(false)
    }

    pub fn mark_connected(&self, id: &str) -> Result<()> {
        let mut state = self.write()?;
        state.connected.insert(id.to_string());
        if let Some(remote) = state.config.remotes.iter_mut().find(|r| r.id == id) {
            remote.last_used = Some(Utc::now());
        }
        Ok(())
    }

    pub fn mark_disconnected(&self, id: &str) -> Result<()> {
        self.write()?.connected.remove(id);
        Ok(())
    }

    pub fn tunnels(&self, id: &str) -> Result<Vec<TunnelConfig>> {
        Ok(self.remote(id)?.tunnels)
    }

    pub fn list_auto_connect_tunnels(&self, id: &str) -> Result<Vec<TunnelConfig>> {
        Ok(self
            .remote(id)?
            .tunnels
            .into_iter()
            .filter(|t| t.auto_connect)
            .collect())
    }

    /// Replace the saved tunnel list of a remote.
    pub fn persist_tunnel_change(&self, id: &str, tunnels: Vec<TunnelConfig>) -> Result<()> {
        self.modify(id, |remote| remote.tunnels = tunnels)
    }

    pub fn add_shortcut(&self, id: &str, shortcut: Shortcut) -> Result<()> {
        self.modify(id, |remote| remote.shortcuts.push(shortcut))
    }

    pub fn remove_shortcut(&self, id: &str, shortcut_id: &str) -> Result<()> {
        let remote = self.remote(id)?;
        if !remote.shortcuts.iter().any(|s| s.id == shortcut_id) {
            return Err(AppError::not_found("shortcut", shortcut_id));
        }
        self.modify(id, |remote| remote.shortcuts.retain(|s| s.id != shortcut_id))
    }

    fn modify(&self, id: &str, f: impl FnOnce(&mut RemoteIdentity)) -> Result<()> {
        let mut state = self.write()?;
        let remote = state
            .config
            .remotes
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| AppError::not_found("remote", id))?;
        f(remote);
        remote.revision += 1;
        self.save_locked(&state)
    }
}
