//! Local port forwards carried over a connection's direct-tcpip channels.

pub mod socks;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TunnelConfig;
use crate::error::{AppError, Result};
use crate::transport::Transport;

const BIND_HOST: &str = "127.0.0.1";

/// A saved tunnel together with its live state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelStatus {
    pub config: TunnelConfig,
    pub active: bool,
    pub local_addr: Option<SocketAddr>,
}

struct ActiveTunnel {
    name: String,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Forwards {
    running: HashMap<String, ActiveTunnel>,
    /// Set by `close_all`; no forward starts afterwards.
    closed: bool,
}

/// Live forwards of one connection, keyed by tunnel id.
pub struct TunnelManager {
    remote_id: String,
    active: Mutex<Forwards>,
}

impl TunnelManager {
    pub fn new(remote_id: impl Into<String>) -> Self {
        Self {
            remote_id: remote_id.into(),
            active: Mutex::new(Forwards::default()),
        }
    }

    /// Start listening for `config`, replacing any forward already running
    /// under the same id. Returns the bound address.
    ///
    /// Fails with [`AppError::NotConnected`] once [`close_all`](Self::close_all) ran.
    pub async fn connect(
        &self,
        transport: Arc<dyn Transport>,
        config: &TunnelConfig,
    ) -> Result<SocketAddr> {
        if !config.can_start() {
            return Err(AppError::InvalidArgument(format!(
                "tunnel '{}' needs a local port and a remote address/port",
                config.name
            )));
        }

        if self.active.lock().await.closed {
            return Err(AppError::NotConnected(self.remote_id.clone()));
        }
        self.disconnect(&config.id).await;

        let listener = TcpListener::bind((BIND_HOST, config.local_port))
            .await
            .map_err(|e| {
                AppError::TransportFailure(format!(
                    "cannot listen on {}:{}: {}",
                    BIND_HOST, config.local_port, e
                ))
            })?;
        // A listener without a usable address is torn down by dropping it.
        let local_addr = listener.local_addr().map_err(|e| {
            AppError::TransportFailure(format!("tunnel '{}' has no local address: {}", config.name, e))
        })?;

        // Checked again under the lock that `close_all` drains with.
        let mut active = self.active.lock().await;
        if active.closed {
            return Err(AppError::NotConnected(self.remote_id.clone()));
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(accept_loop(
            listener,
            transport,
            config.clone(),
            cancel.clone(),
        ));

        info!(
            "Tunnel {} on {}: {} -> {}",
            config.name,
            self.remote_id,
            local_addr,
            config.display_target()
        );
        let replaced = active.running.insert(
            config.id.clone(),
            ActiveTunnel {
                name: config.name.clone(),
                local_addr,
                cancel,
                task,
            },
        );
        // A concurrent connect for the same id won the race; stop its listener.
        if let Some(replaced) = replaced {
            replaced.cancel.cancel();
        }
        Ok(local_addr)
    }

    /// Stop a forward and close its socket. Returns whether one was running.
    pub async fn disconnect(&self, tunnel_id: &str) -> bool {
        let Some(tunnel) = self.active.lock().await.running.remove(tunnel_id) else {
            return false;
        };
        self.stop(tunnel).await;
        true
    }

    async fn stop(&self, tunnel: ActiveTunnel) {
        tunnel.cancel.cancel();
        if let Err(e) = tunnel.task.await {
            warn!("Tunnel {} task ended abnormally: {}", tunnel.name, e);
        }
        info!("Tunnel {} on {} stopped", tunnel.name, self.remote_id);
    }

    pub async fn is_active(&self, tunnel_id: &str) -> bool {
        self.active.lock().await.running.contains_key(tunnel_id)
    }

    pub async fn local_addr(&self, tunnel_id: &str) -> Option<SocketAddr> {
        self.active
            .lock()
            .await
            .running
            .get(tunnel_id)
            .map(|t| t.local_addr)
    }

    /// Pair each saved definition with its live state.
    pub async fn status(&self, configs: Vec<TunnelConfig>) -> Vec<TunnelStatus> {
        let active = self.active.lock().await;
        configs
            .into_iter()
            .map(|config| {
                let local_addr = active.running.get(&config.id).map(|t| t.local_addr);
                TunnelStatus {
                    active: local_addr.is_some(),
                    local_addr,
                    config,
                }
            })
            .collect()
    }

    /// Stop every forward and refuse new ones from now on.
    pub async fn close_all(&self) {
        let drained: Vec<ActiveTunnel> = {
            let mut active = self.active.lock().await;
            active.closed = true;
            active.running.drain().map(|(_, tunnel)| tunnel).collect()
        };
        for tunnel in drained {
            self.stop(tunnel).await;
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    transport: Arc<dyn Transport>,
    config: TunnelConfig,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                debug!("Tunnel {} accepted {}", config.name, peer);
                let transport = transport.clone();
                let config = config.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        result = forward(stream, peer, transport.as_ref(), &config) => {
                            if let Err(e) = result {
                                warn!("Tunnel {} connection from {} failed: {}", config.name, peer, e);
                            }
                        }
                    }
                });
            }
            Err(e) => {
                warn!("Tunnel {} accept failed: {}", config.name, e);
            }
        }
    }
}

async fn forward(
    mut stream: TcpStream,
    peer: SocketAddr,
    transport: &dyn Transport,
    config: &TunnelConfig,
) -> Result<()> {
    let (host, port) = if config.socks {
        socks::accept(&mut stream).await?
    } else {
        (config.remote_address.clone(), config.remote_port)
    };

    let mut channel = match transport.open_direct_tcpip(&host, port, peer).await {
        Ok(channel) => channel,
        Err(e) => {
            if config.socks {
                let _ = socks::reply(&mut stream, socks::REPLY_GENERAL_FAILURE).await;
            }
            return Err(e);
        }
    };
    if config.socks {
        socks::reply(&mut stream, socks::REPLY_SUCCEEDED).await?;
    }

    let (sent, received) = tokio::io::copy_bidirectional(&mut stream, &mut channel).await?;
    debug!(
        "Tunnel {} to {}:{} closed ({} bytes out, {} bytes in)",
        config.name, host, port, sent, received
    );
    Ok(())
}
