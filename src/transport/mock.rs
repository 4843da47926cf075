//! In-memory transport used by the unit tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use super::{
    CommandOutput, ConnectParams, Connected, Connector, FileStat, RemoteFs, ShellChannel,
    ShellInput, ShellOutput, TermSize, Transport, TransportEvent, TunnelStream,
};
use crate::error::{AppError, Result};

pub const S_IFDIR: u32 = 0o040000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFLNK: u32 = 0o120000;

#[derive(Debug, Clone)]
pub struct MockNode {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub data: Vec<u8>,
}

/// Shared knobs and call log for one mock host.
#[derive(Default)]
pub struct MockHost {
    pub fail_connect: Mutex<Option<String>>,
    /// How long the handshake takes before the transport is handed out.
    pub connect_delay: Mutex<Option<Duration>>,
    pub fail_sftp: AtomicBool,
    pub commands: Mutex<HashMap<String, CommandOutput>>,
    /// Commands whose channel fails instead of returning an exit status.
    pub broken_commands: Mutex<HashSet<String>>,
    pub exec_log: Mutex<Vec<String>>,
    pub fs_log: Mutex<Vec<String>>,
    pub tree: Mutex<BTreeMap<String, MockNode>>,
    pub connects: AtomicUsize,
    pub closes: AtomicUsize,
    pub direct_tcpip: Mutex<Vec<(String, u16)>>,
    pub last_params: Mutex<Option<ConnectParams>>,
    events: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
}

impl MockHost {
    /// A Linux host with a small passwd/group table and an empty root.
    pub fn linux() -> Arc<Self> {
        let host = Arc::new(Self::default());
        host.script("uname -a", 0, "Linux box 6.1.0 #1 SMP x86_64 GNU/Linux\n");
        host.script("ver", 127, "");
        host.script("cat /etc/passwd", 0, "root:x:0:0:root:/root:/bin/bash\nalice:x:1000:1000::/home/alice:/bin/sh\n");
        host.script("cat /etc/group", 0, "root:x:0:\nstaff:x:1000:alice\n");
        host.add_dir("/", 0o755);
        host
    }

    pub fn script(&self, command: &str, exit_code: u32, stdout: &str) {
        self.commands.lock().unwrap().insert(
            command.to_string(),
            CommandOutput {
                stdout: stdout.as_bytes().to_vec(),
                stderr: Vec::new(),
                exit_code,
            },
        );
    }

    pub fn add_dir(&self, path: &str, perm: u32) {
        self.insert(path, S_IFDIR | perm, Vec::new());
    }

    pub fn add_file(&self, path: &str, perm: u32, data: &[u8]) {
        self.insert(path, S_IFREG | perm, data.to_vec());
    }

    pub fn add_symlink(&self, path: &str) {
        self.insert(path, S_IFLNK | 0o777, Vec::new());
    }

    /// A symlink whose target `stat` resolves.
    pub fn add_symlink_to(&self, path: &str, target: &str) {
        self.insert(path, S_IFLNK | 0o777, target.as_bytes().to_vec());
    }

    fn insert(&self, path: &str, mode: u32, data: Vec<u8>) {
        self.tree.lock().unwrap().insert(
            path.to_string(),
            MockNode {
                mode,
                uid: 1000,
                gid: 1000,
                data,
            },
        );
    }

    pub fn node(&self, path: &str) -> Option<MockNode> {
        self.tree.lock().unwrap().get(path).cloned()
    }

    pub fn fs_calls(&self) -> usize {
        self.fs_log.lock().unwrap().len()
    }

    pub fn exec_calls(&self) -> Vec<String> {
        self.exec_log.lock().unwrap().clone()
    }

    /// Simulate the remote end dropping the connection.
    pub fn drop_connection(&self) {
        if let Some(tx) = self.events.lock().unwrap().take() {
            let _ = tx.send(TransportEvent::Disconnected {
                reason: "connection reset by peer".to_string(),
            });
        }
    }
}

#[derive(Clone, Default)]
pub struct MockConnector {
    hosts: Arc<Mutex<HashMap<String, Arc<MockHost>>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_host(&self, host: &str, mock: Arc<MockHost>) {
        self.hosts.lock().unwrap().insert(host.to_string(), mock);
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, params: &ConnectParams) -> Result<Connected> {
        let host = self
            .hosts
            .lock()
            .unwrap()
            .get(&params.host)
            .cloned()
            .ok_or_else(|| AppError::TransportFailure(format!("no route to {}", params.host)))?;

        *host.last_params.lock().unwrap() = Some(params.clone());
        let delay = *host.connect_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(reason) = host.fail_connect.lock().unwrap().clone() {
            return Err(AppError::AuthFailure(reason));
        }
        host.connects.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = mpsc::unbounded_channel();
        *host.events.lock().unwrap() = Some(tx);
        Ok(Connected {
            transport: Arc::new(MockTransport { host }),
            events: rx,
        })
    }
}

pub struct MockTransport {
    host: Arc<MockHost>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn exec(&self, command: &str) -> Result<CommandOutput> {
        self.host.exec_log.lock().unwrap().push(command.to_string());
        if self.host.broken_commands.lock().unwrap().contains(command) {
            return Err(AppError::TransportFailure(format!("exec channel for '{command}' closed")));
        }

        if let Some(path) = command
            .strip_prefix("rm -rf -- '")
            .and_then(|rest| rest.strip_suffix('\''))
        {
            let prefix = format!("{}/", path.trim_end_matches('/'));
            self.host
                .tree
                .lock()
                .unwrap()
                .retain(|p, _| p != path && !p.starts_with(&prefix));
            return Ok(CommandOutput::default());
        }

        Ok(self
            .host
            .commands
            .lock()
            .unwrap()
            .get(command)
            .cloned()
            .unwrap_or(CommandOutput {
                stdout: Vec::new(),
                stderr: format!("{command}: command not found").into_bytes(),
                exit_code: 127,
            }))
    }

    async fn open_shell(&self, _term: &str, _size: TermSize) -> Result<ShellChannel> {
        let (input_tx, mut input_rx) = mpsc::channel::<ShellInput>(16);
        let (output_tx, output_rx) = mpsc::channel(16);

        // Echo every write back; "exit\n" ends the session from the remote side.
        tokio::spawn(async move {
            while let Some(input) = input_rx.recv().await {
                match input {
                    ShellInput::Data(data) if &data[..] == b"exit\n" => break,
                    ShellInput::Data(data) => {
                        if output_tx.send(ShellOutput::Data(data)).await.is_err() {
                            return;
                        }
                    }
                    ShellInput::Resize(_) => {}
                    ShellInput::Close => break,
                }
            }
            let _ = output_tx.send(ShellOutput::Exit(Some(0))).await;
        });

        Ok(ShellChannel {
            input: input_tx,
            output: output_rx,
        })
    }

    async fn open_sftp(&self) -> Result<Arc<dyn RemoteFs>> {
        if self.host.fail_sftp.load(Ordering::SeqCst) {
            return Err(AppError::TransportFailure("sftp subsystem refused".to_string()));
        }
        Ok(Arc::new(MockFs {
            host: self.host.clone(),
        }))
    }

    async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u16,
        _originator: SocketAddr,
    ) -> Result<Box<dyn TunnelStream>> {
        self.host
            .direct_tcpip
            .lock()
            .unwrap()
            .push((host.to_string(), port));

        let (local, mut remote) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            loop {
                match remote.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if remote.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        Ok(Box::new(local))
    }

    async fn close(&self) -> Result<()> {
        self.host.closes.fetch_add(1, Ordering::SeqCst);
        self.host.events.lock().unwrap().take();
        Ok(())
    }
}

pub struct MockFs {
    host: Arc<MockHost>,
}

impl MockFs {
    fn log(&self, op: &str, path: &str) {
        self.host.fs_log.lock().unwrap().push(format!("{op} {path}"));
    }

    fn lookup(&self, path: &str) -> Result<MockNode> {
        self.host
            .node(path)
            .ok_or_else(|| AppError::NotFound(format!("no such file: {path}")))
    }
}

fn stat_of(node: &MockNode) -> FileStat {
    FileStat {
        mode: Some(node.mode),
        size: Some(node.data.len() as u64),
        uid: Some(node.uid),
        gid: Some(node.gid),
        mtime: Some(0),
    }
}

#[async_trait]
impl RemoteFs for MockFs {
    async fn read_dir(&self, path: &str) -> Result<Vec<(String, FileStat)>> {
        self.log("read_dir", path);
        let dir = self.lookup(path)?;
        if dir.mode & S_IFDIR == 0 {
            return Err(AppError::InvalidArgument(format!("not a directory: {path}")));
        }

        let prefix = format!("{}/", path.trim_end_matches('/'));
        let tree = self.host.tree.lock().unwrap();
        Ok(tree
            .iter()
            .filter_map(|(p, node)| {
                let rest = p.strip_prefix(&prefix)?;
                (!rest.is_empty() && !rest.contains('/')).then(|| (rest.to_string(), stat_of(node)))
            })
            .collect())
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        self.log("stat", path);
        let node = self.lookup(path)?;
        if node.mode & 0o170000 == S_IFLNK && !node.data.is_empty() {
            let target = String::from_utf8_lossy(&node.data).to_string();
            return Ok(stat_of(&self.lookup(&target)?));
        }
        Ok(stat_of(&node))
    }

    async fn symlink_stat(&self, path: &str) -> Result<FileStat> {
        self.log("symlink_stat", path);
        Ok(stat_of(&self.lookup(path)?))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.log("exists", path);
        Ok(self.host.node(path).is_some())
    }

    async fn canonicalize(&self, path: &str) -> Result<String> {
        self.log("canonicalize", path);
        if path.starts_with('/') {
            Ok(path.to_string())
        } else {
            Ok(format!("/{path}"))
        }
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        self.log("read", path);
        Ok(self.lookup(path)?.data)
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        self.log("write", path);
        self.host.add_file(path, 0o644, data);
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.log("rename", from);
        let mut tree = self.host.tree.lock().unwrap();
        let node = tree
            .remove(from)
            .ok_or_else(|| AppError::NotFound(format!("no such file: {from}")))?;
        tree.insert(to.to_string(), node);
        Ok(())
    }

    async fn set_mode(&self, path: &str, mode: u32) -> Result<()> {
        self.log("set_mode", path);
        let mut tree = self.host.tree.lock().unwrap();
        let node = tree
            .get_mut(path)
            .ok_or_else(|| AppError::NotFound(format!("no such file: {path}")))?;
        node.mode = (node.mode & !0o7777) | (mode & 0o7777);
        Ok(())
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        self.log("mkdir", path);
        self.host.add_dir(path, 0o755);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
