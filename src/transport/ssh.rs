use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use russh::client::{self, Msg};
use russh::keys::{self, PrivateKeyWithHashAlg, ssh_key};
use russh::{ChannelMsg, Disconnect, Sig};
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::FileAttributes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{
    AuthStep, CommandOutput, ConnectParams, Connected, Connector, FileStat, KeySource, RemoteFs,
    ShellChannel, ShellInput, ShellOutput, TermSize, Transport, TransportEvent, TunnelStream,
};
use crate::error::{AppError, Result};
use crate::utils::expand_tilde;

const SHELL_INPUT_CAPACITY: usize = 64;
const SHELL_OUTPUT_CAPACITY: usize = 256;

struct SshClient {
    host: String,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl client::Handler for SshClient {
    type Error = AppError;

    async fn check_server_key(
        &mut self,
        server_public_key: &ssh_key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        debug!(
            "Server key for {}: {} {}",
            self.host,
            server_public_key.algorithm(),
            server_public_key.fingerprint(ssh_key::HashAlg::Sha256)
        );
        Ok(true)
    }
}

// The handler lives inside the session task, so it is dropped exactly when
// the connection goes away, whoever closed it.
impl Drop for SshClient {
    fn drop(&mut self) {
        let _ = self.events.send(TransportEvent::Disconnected {
            reason: format!("connection to {} closed", self.host),
        });
    }
}

/// Opens `russh` connections.
#[derive(Debug, Default, Clone, Copy)]
pub struct SshConnector;

impl SshConnector {
    fn config(params: &ConnectParams) -> client::Config {
        let keepalive_interval = if params.keepalive_interval > 0 {
            Some(Duration::from_secs(params.keepalive_interval))
        } else {
            None
        };
        client::Config {
            keepalive_interval,
            keepalive_max: 3,
            ..Default::default()
        }
    }

    fn load_key(key: &KeySource, passphrase: Option<&str>) -> Result<keys::PrivateKey> {
        match key {
            KeySource::Inline(pem) => keys::decode_secret_key(pem, passphrase),
            KeySource::File(path) => {
                let path = expand_tilde(&path.to_string_lossy());
                keys::load_secret_key(path, passphrase)
            }
        }
        .map_err(|e| AppError::AuthFailure(format!("Failed to load private key: {e}")))
    }
}

/// The two offers an authentication plan can make against a server.
#[async_trait]
trait AuthSession: Send {
    /// Returns whether the server accepted the key outright.
    async fn offer_key(&mut self, user: &str, key: keys::PrivateKey) -> Result<bool>;

    async fn offer_password(&mut self, user: &str, password: &str) -> Result<bool>;
}

#[async_trait]
impl AuthSession for client::Handle<SshClient> {
    async fn offer_key(&mut self, user: &str, key: keys::PrivateKey) -> Result<bool> {
        let hash_alg = self
            .best_supported_rsa_hash()
            .await
            .map_err(|e| AppError::AuthFailure(e.to_string()))?
            .flatten();
        let result = self
            .authenticate_publickey(user, PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg))
            .await
            .map_err(|e| AppError::AuthFailure(e.to_string()))?;
        Ok(result.success())
    }

    async fn offer_password(&mut self, user: &str, password: &str) -> Result<bool> {
        let result = self
            .authenticate_password(user, password)
            .await
            .map_err(|e| AppError::AuthFailure(e.to_string()))?;
        Ok(result.success())
    }
}

/// Walk the plan in order, each step at most once. A key that cannot be
/// loaded is skipped so the password still gets its turn.
async fn authenticate(session: &mut dyn AuthSession, params: &ConnectParams) -> Result<()> {
    let mut failures = Vec::new();

    for step in &params.auth {
        let accepted = match step {
            AuthStep::PublicKey { key, passphrase } => {
                match SshConnector::load_key(key, passphrase.as_deref()) {
                    Ok(private_key) => {
                        debug!("Offering public key for {}", params.user);
                        session.offer_key(&params.user, private_key).await?
                    }
                    Err(e) => {
                        warn!("Skipping public key for {}: {}", params.user, e);
                        failures.push(e.to_string());
                        continue;
                    }
                }
            }
            AuthStep::Password(password) => {
                debug!("Offering password for {}", params.user);
                session.offer_password(&params.user, password).await?
            }
        };

        // A partial success falls through to the next step.
        if accepted {
            return Ok(());
        }
        failures.push(match step {
            AuthStep::PublicKey { .. } => "public key rejected".to_string(),
            AuthStep::Password(_) => "password rejected".to_string(),
        });
    }

    Err(AppError::AuthFailure(format!(
        "all authentication methods failed for {}: {}",
        params.user,
        failures.join("; ")
    )))
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, params: &ConnectParams) -> Result<Connected> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handler = SshClient {
            host: params.host.clone(),
            events: events_tx,
        };

        info!("Connecting to {}@{}", params.user, params.host_port());
        let connect = client::connect(Arc::new(Self::config(params)), params.host_port(), handler);
        let mut handle = tokio::time::timeout(Duration::from_secs(params.connect_timeout), connect)
            .await
            .map_err(|_| {
                AppError::TransportFailure(format!(
                    "timed out after {}s connecting to {}",
                    params.connect_timeout,
                    params.host_port()
                ))
            })?
            .map_err(|e| AppError::TransportFailure(e.to_string()))?;

        authenticate(&mut handle, params).await?;
        info!("Authenticated to {}", params.host_port());

        Ok(Connected {
            transport: Arc::new(SshTransport { handle }),
            events: events_rx,
        })
    }
}

pub struct SshTransport {
    handle: client::Handle<SshClient>,
}

impl SshTransport {
    async fn open_channel(&self) -> Result<russh::Channel<Msg>> {
        Ok(self.handle.channel_open_session().await?)
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn exec(&self, command: &str) -> Result<CommandOutput> {
        let mut channel = self.open_channel().await?;
        channel.exec(true, command).await?;

        let mut output = CommandOutput::default();
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => output.stdout.extend_from_slice(&data),
                ChannelMsg::ExtendedData { data, ext } if ext == 1 => {
                    output.stderr.extend_from_slice(&data)
                }
                ChannelMsg::ExitStatus { exit_status } => output.exit_code = exit_status,
                ChannelMsg::ExitSignal { signal_name, .. } => {
                    warn!("'{}' killed by signal {:?}", command, signal_name);
                    output.exit_code = signal_exit_code(&signal_name);
                }
                ChannelMsg::Close => break,
                _ => {}
            }
        }
        debug!("exec '{}' exited with {}", command, output.exit_code);
        Ok(output)
    }

    async fn open_shell(&self, term: &str, size: TermSize) -> Result<ShellChannel> {
        let channel = self.open_channel().await?;
        channel
            .request_pty(false, term, size.cols, size.rows, 0, 0, &[])
            .await?;
        channel.request_shell(false).await?;

        let (input_tx, input_rx) = mpsc::channel(SHELL_INPUT_CAPACITY);
        let (output_tx, output_rx) = mpsc::channel(SHELL_OUTPUT_CAPACITY);
        tokio::spawn(pump_shell(channel, input_rx, output_tx));

        Ok(ShellChannel {
            input: input_tx,
            output: output_rx,
        })
    }

    async fn open_sftp(&self) -> Result<Arc<dyn RemoteFs>> {
        let channel = self.open_channel().await?;
        channel.request_subsystem(true, "sftp").await?;
        let session = SftpSession::new(channel.into_stream()).await?;
        Ok(Arc::new(SftpFs { session }))
    }

    async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u16,
        originator: SocketAddr,
    ) -> Result<Box<dyn TunnelStream>> {
        let channel = self
            .handle
            .channel_open_direct_tcpip(
                host,
                port.into(),
                originator.ip().to_string(),
                originator.port().into(),
            )
            .await?;
        Ok(Box::new(channel.into_stream()))
    }

    async fn close(&self) -> Result<()> {
        self.handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await?;
        Ok(())
    }
}

/// Shell convention: a process killed by signal N exits with 128 + N.
fn signal_exit_code(signal: &Sig) -> u32 {
    let number = match signal {
        Sig::HUP => 1,
        Sig::INT => 2,
        Sig::QUIT => 3,
        Sig::ILL => 4,
        Sig::ABRT => 6,
        Sig::FPE => 8,
        Sig::KILL => 9,
        Sig::USR1 => 10,
        Sig::SEGV => 11,
        Sig::PIPE => 13,
        Sig::ALRM => 14,
        Sig::TERM => 15,
        Sig::Custom(_) => 0,
    };
    128 + number
}

/// Owns one pty channel: forwards input to the remote and output to the reader.
async fn pump_shell(
    mut channel: russh::Channel<Msg>,
    mut input: mpsc::Receiver<ShellInput>,
    output: mpsc::Sender<ShellOutput>,
) {
    let mut exit_status = None;

    loop {
        tokio::select! {
            cmd = input.recv() => match cmd {
                Some(ShellInput::Data(data)) => {
                    if let Err(e) = channel.data(&data[..]).await {
                        warn!("Failed to write to shell channel: {}", e);
                        break;
                    }
                }
                Some(ShellInput::Resize(size)) => {
                    if let Err(e) = channel.window_change(size.cols, size.rows, 0, 0).await {
                        warn!("Failed to resize shell channel: {}", e);
                    }
                }
                Some(ShellInput::Close) | None => {
                    let _ = channel.eof().await;
                    let _ = channel.close().await;
                    break;
                }
            },
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) => {
                    if output.send(ShellOutput::Data(Bytes::copy_from_slice(&data))).await.is_err() {
                        break;
                    }
                }
                Some(ChannelMsg::ExtendedData { data, .. }) => {
                    if output.send(ShellOutput::Stderr(Bytes::copy_from_slice(&data))).await.is_err() {
                        break;
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status: status }) => exit_status = Some(status),
                Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                    exit_status = Some(signal_exit_code(&signal_name))
                }
                Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            },
        }
    }

    let _ = output.send(ShellOutput::Exit(exit_status)).await;
}

/// [`RemoteFs`] on top of a `russh_sftp` session.
pub struct SftpFs {
    session: SftpSession,
}

fn to_stat(attrs: &FileAttributes) -> FileStat {
    FileStat {
        mode: attrs.permissions,
        size: attrs.size,
        uid: attrs.uid,
        gid: attrs.gid,
        mtime: attrs.mtime,
    }
}

#[async_trait]
impl RemoteFs for SftpFs {
    async fn read_dir(&self, path: &str) -> Result<Vec<(String, FileStat)>> {
        let entries = self.session.read_dir(path).await?;
        Ok(entries
            .map(|entry| (entry.file_name(), to_stat(&entry.metadata())))
            .collect())
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        Ok(to_stat(&self.session.metadata(path).await?))
    }

    async fn symlink_stat(&self, path: &str) -> Result<FileStat> {
        Ok(to_stat(&self.session.symlink_metadata(path).await?))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.session.symlink_metadata(path).await.is_ok())
    }

    async fn canonicalize(&self, path: &str) -> Result<String> {
        Ok(self.session.canonicalize(path).await?)
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let mut file = self.session.open(path).await?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await?;
        Ok(buf)
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        let mut file = self.session.create(path).await?;
        file.write_all(data).await?;
        file.shutdown().await?;
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        Ok(self.session.rename(from, to).await?)
    }

    async fn set_mode(&self, path: &str, mode: u32) -> Result<()> {
        let attrs = FileAttributes {
            permissions: Some(mode),
            ..FileAttributes::empty()
        };
        Ok(self.session.set_metadata(path, attrs).await?)
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        Ok(self.session.create_dir(path).await?)
    }

    async fn close(&self) -> Result<()> {
        Ok(self.session.close().await?)
    }
}
