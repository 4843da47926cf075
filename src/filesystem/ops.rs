//! High level file operations for one connected remote.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::attrs::{FileKind, OwnerTables, RemoteFile};
use super::dir_walker::{DirectoryManifest, ListOptions, list_dir};
use crate::error::{AppError, Result};
use crate::manager::OsFamily;
use crate::transport::{RemoteFs, Transport};
use crate::utils::{is_root, shell_quote};

/// Answer to "the destination already exists".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictDecision {
    Skip,
    Overwrite,
    /// Skip this and every later conflict in the same operation.
    SkipAll,
    /// Overwrite this and every later conflict in the same operation.
    OverwriteAll,
}

/// Remembers an "all" answer so one bulk operation prompts at most until
/// the user picks a sticky choice.
struct ConflictPolicy<F> {
    decide: F,
    sticky: Option<bool>,
}

impl<F: FnMut(&str) -> ConflictDecision> ConflictPolicy<F> {
    fn new(decide: F) -> Self {
        Self {
            decide,
            sticky: None,
        }
    }

    fn overwrite(&mut self, path: &str) -> bool {
        if let Some(overwrite) = self.sticky {
            return overwrite;
        }
        match (self.decide)(path) {
            ConflictDecision::Skip => false,
            ConflictDecision::Overwrite => true,
            ConflictDecision::SkipAll => {
                self.sticky = Some(false);
                false
            }
            ConflictDecision::OverwriteAll => {
                self.sticky = Some(true);
                true
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    Transferred,
    Skipped,
}

#[derive(Debug, Default)]
pub struct TransferReport {
    pub downloaded: Vec<String>,
    pub skipped: Vec<String>,
    /// `(remote_path, error)` for files that failed individually.
    pub failed: Vec<(String, String)>,
}

/// Refuse paths that would make a destructive operation hit something it
/// should never touch.
pub fn ensure_safe_target(path: &str) -> Result<()> {
    let trimmed = path.trim();
    let unsafe_target = trimmed.is_empty()
        || is_root(trimmed)
        || trimmed == "."
        || trimmed == ".."
        || trimmed.ends_with("/.")
        || trimmed.ends_with("/..");
    if unsafe_target {
        return Err(AppError::InvalidArgument(format!(
            "refusing to operate on '{path}'"
        )));
    }
    Ok(())
}

/// File operations bound to one live connection.
#[derive(Clone)]
pub struct RemoteFiles {
    sftp: Arc<dyn RemoteFs>,
    transport: Arc<dyn Transport>,
    owners: Option<Arc<OwnerTables>>,
    os: OsFamily,
}

impl RemoteFiles {
    pub fn new(
        sftp: Arc<dyn RemoteFs>,
        transport: Arc<dyn Transport>,
        owners: Option<Arc<OwnerTables>>,
        os: OsFamily,
    ) -> Self {
        Self {
            sftp,
            transport,
            owners,
            os,
        }
    }

    fn owners(&self) -> Option<&OwnerTables> {
        self.owners.as_deref()
    }

    pub async fn list(&self, path: &str, options: ListOptions) -> Result<Vec<RemoteFile>> {
        debug!("list {} {:?}", path, options);
        list_dir(self.sftp.as_ref(), self.owners(), path, options).await
    }

    pub async fn stat(&self, path: &str) -> Result<RemoteFile> {
        let stat = self.sftp.stat(path).await?;
        let name = path
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|n| !n.is_empty())
            .unwrap_or("/");
        Ok(RemoteFile::from_stat(name, path, &stat, self.owners()))
    }

    pub async fn exists(&self, path: &str) -> Result<bool> {
        self.sftp.exists(path).await
    }

    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        self.sftp.read(path).await
    }

    pub async fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        self.sftp.write(path, data).await
    }

    pub async fn mkdir(&self, path: &str) -> Result<()> {
        self.sftp.mkdir(path).await
    }

    pub async fn rename(&self, from: &str, to: &str) -> Result<()> {
        ensure_safe_target(from)?;
        if to.trim().is_empty() {
            return Err(AppError::InvalidArgument("rename target is empty".to_string()));
        }
        self.sftp.rename(from, to).await
    }

    /// Remove a file or a whole tree with one remote `rm -rf`.
    pub async fn delete(&self, path: &str) -> Result<()> {
        ensure_safe_target(path)?;
        if self.os == OsFamily::Windows {
            return Err(AppError::InvalidArgument(
                "recursive delete needs a POSIX shell on the remote".to_string(),
            ));
        }

        info!("Deleting remote path {}", path);
        self.transport
            .exec(&format!("rm -rf -- {}", shell_quote(path)))
            .await?
            .into_result()?;
        Ok(())
    }

    /// Set permission bits on `path`, and on every descendant when
    /// `recursive` is set and `path` is a directory. Returns how many paths
    /// were changed; failures below the target are logged and skipped.
    /// A symlink is never descended into, not even as the target itself.
    pub async fn chmod(&self, path: &str, mode: u32, recursive: bool) -> Result<usize> {
        let mode = mode & 0o7777;
        self.sftp.set_mode(path, mode).await?;
        let mut changed = 1;

        if !recursive {
            return Ok(changed);
        }
        let own = self.sftp.symlink_stat(path).await?;
        if !own.mode.is_some_and(|mode| FileKind::from_mode(mode) == FileKind::Directory) {
            return Ok(changed);
        }

        for entry in self.list(path, ListOptions::recursive()).await? {
            if entry.is_symlink() {
                continue;
            }
            match self.sftp.set_mode(&entry.path, mode).await {
                Ok(()) => changed += 1,
                Err(e) => warn!("chmod {:o} failed for {}: {}", mode, entry.path, e),
            }
        }
        Ok(changed)
    }

    pub async fn upload_file<F>(&self, local: &Path, remote: &str, decide: F) -> Result<TransferOutcome>
    where
        F: FnMut(&str) -> ConflictDecision,
    {
        let meta = tokio::fs::metadata(local)
            .await
            .map_err(|_| AppError::NotFound(format!("local file '{}'", local.display())))?;
        if !meta.is_file() {
            return Err(AppError::InvalidArgument(format!(
                "'{}' is not a regular file",
                local.display()
            )));
        }

        let mut policy = ConflictPolicy::new(decide);
        if self.sftp.exists(remote).await? && !policy.overwrite(remote) {
            debug!("Skipping upload to existing {}", remote);
            return Ok(TransferOutcome::Skipped);
        }

        let data = tokio::fs::read(local).await?;
        self.sftp.write(remote, &data).await?;
        info!("Uploaded {} -> {} ({} bytes)", local.display(), remote, data.len());
        Ok(TransferOutcome::Transferred)
    }

    pub async fn download_file<F>(&self, remote: &str, local: &Path, decide: F) -> Result<TransferOutcome>
    where
        F: FnMut(&str) -> ConflictDecision,
    {
        if !self.sftp.exists(remote).await? {
            return Err(AppError::NotFound(format!("remote file '{remote}'")));
        }

        let mut policy = ConflictPolicy::new(decide);
        if tokio::fs::try_exists(local).await? && !policy.overwrite(&local.to_string_lossy()) {
            debug!("Skipping download over existing {}", local.display());
            return Ok(TransferOutcome::Skipped);
        }

        let data = self.sftp.read(remote).await?;
        tokio::fs::write(local, &data).await?;
        info!("Downloaded {} -> {} ({} bytes)", remote, local.display(), data.len());
        Ok(TransferOutcome::Transferred)
    }

    /// Copy a remote directory tree into `local_root`.
    ///
    /// All local directories are created before the first file is copied.
    /// `decide` is asked about each file that already exists locally until it
    /// answers with one of the "all" choices.
    pub async fn download_folder<F>(
        &self,
        remote_root: &str,
        local_root: &Path,
        decide: F,
    ) -> Result<TransferReport>
    where
        F: FnMut(&str) -> ConflictDecision,
    {
        if !self.stat(remote_root).await?.is_dir() {
            return Err(AppError::InvalidArgument(format!(
                "'{remote_root}' is not a directory"
            )));
        }

        let entries = self.list(remote_root, ListOptions::recursive()).await?;
        let manifest = DirectoryManifest::from_listing(&entries, remote_root, local_root);
        info!(
            "Downloading {}: {} directories, {} files",
            remote_root,
            manifest.directories.len(),
            manifest.files.len()
        );

        for dir in &manifest.directories {
            tokio::fs::create_dir_all(dir).await?;
        }

        let mut policy = ConflictPolicy::new(decide);
        let mut report = TransferReport::default();

        for (remote, local, _) in manifest.files {
            let local_display = local.to_string_lossy().to_string();
            let exists = tokio::fs::try_exists(&local).await.unwrap_or(false);
            if exists && !policy.overwrite(&local_display) {
                report.skipped.push(remote);
                continue;
            }

            let copied = match self.sftp.read(&remote).await {
                Ok(data) => tokio::fs::write(&local, data).await.map_err(AppError::from),
                Err(e) => Err(e),
            };
            match copied {
                Ok(()) => report.downloaded.push(remote),
                Err(e) => {
                    warn!("Failed to download {}: {}", remote, e);
                    report.failed.push((remote, e.to_string()));
                }
            }
        }

        Ok(report)
    }
}
