//! Push notifications towards whatever presentation layer is attached.

use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// Output arrived on a shell.
    ShellData { shell_id: String, text: String },
    /// A shell ended, on either side.
    ShellClosed { shell_id: String },
    /// The remote's connection was torn down.
    ConnectionDisposed,
}

pub trait Notifier: Send + Sync {
    fn notify(&self, remote_id: &str, event: Notification);
}

/// Drops every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify(&self, _remote_id: &str, _event: Notification) {}
}

/// Forwards notifications into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<(String, Notification)>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(String, Notification)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, remote_id: &str, event: Notification) {
        // Nobody listening is fine.
        let _ = self.tx.send((remote_id.to_string(), event));
    }
}
