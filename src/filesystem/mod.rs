//! Remote file browsing and transfer over the SFTP sub-channel.

pub mod attrs;
pub mod dir_walker;
pub mod ops;

pub use attrs::{FileKind, OwnerTables, Permissions, RemoteFile};
pub use dir_walker::{DirectoryManifest, ListOptions};
pub use ops::{ConflictDecision, RemoteFiles, TransferOutcome, TransferReport};
