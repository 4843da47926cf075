//! Directory listing and recursive traversal over the file-transfer channel.
//!
//! [`list_dir`] produces a flat, depth-first sequence of [`RemoteFile`]s.
//! [`DirectoryManifest`] splits such a listing into the local directories to
//! create and the files to copy for a folder download.

use std::path::{Path, PathBuf};

use futures::future::BoxFuture;

use super::attrs::{OwnerTables, RemoteFile};
use crate::error::Result;
use crate::transport::RemoteFs;
use crate::utils::{is_root, join_remote, parent_of};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListOptions {
    /// Prepend `.` and, unless listing the root, `..`.
    pub add_dot_folders: bool,
    /// Descend into every child directory and flatten the results.
    pub recursive: bool,
}

impl ListOptions {
    pub fn recursive() -> Self {
        Self {
            add_dot_folders: false,
            recursive: true,
        }
    }
}

pub async fn list_dir(
    fs: &dyn RemoteFs,
    owners: Option<&OwnerTables>,
    path: &str,
    options: ListOptions,
) -> Result<Vec<RemoteFile>> {
    let path = if is_root(path) {
        "/"
    } else {
        path.trim_end_matches('/')
    };
    let mut out = Vec::new();

    if options.add_dot_folders {
        let absolute = if path.starts_with('/') {
            path.to_string()
        } else {
            fs.canonicalize(path).await?
        };

        let own = fs.stat(&absolute).await?;
        out.push(RemoteFile::from_stat(".", absolute.clone(), &own, owners));

        if !is_root(&absolute)
            && let Some(parent) = parent_of(&absolute)
        {
            let stat = fs.stat(&parent).await?;
            out.push(RemoteFile::from_stat("..", parent, &stat, owners));
        }
    }

    walk(fs, owners, path.to_string(), options.recursive, &mut out).await?;
    Ok(out)
}

fn walk<'a>(
    fs: &'a dyn RemoteFs,
    owners: Option<&'a OwnerTables>,
    dir: String,
    recursive: bool,
    out: &'a mut Vec<RemoteFile>,
) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        let mut entries = fs.read_dir(&dir).await?;
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        for (name, stat) in entries {
            if name.is_empty() || name == "." || name == ".." {
                continue;
            }
            let path = join_remote(&dir, &name);
            let file = RemoteFile::from_stat(name, path.clone(), &stat, owners);
            let descend = recursive && file.is_dir();
            out.push(file);
            if descend {
                walk(fs, owners, path, true, out).await?;
            }
        }
        Ok(())
    })
}

/// What a folder download has to do locally.
#[derive(Debug, Default)]
pub struct DirectoryManifest {
    /// Local directories to create, parents before children.
    pub directories: Vec<PathBuf>,
    /// `(remote_path, local_path, size)` for every regular file.
    pub files: Vec<(String, PathBuf, u64)>,
}

impl DirectoryManifest {
    /// Map a recursive listing of `remote_root` onto `local_root`.
    ///
    /// Symlinks, sockets and devices are left out.
    pub fn from_listing(entries: &[RemoteFile], remote_root: &str, local_root: &Path) -> Self {
        let remote_root = remote_root.trim_end_matches('/');
        let mut manifest = DirectoryManifest {
            directories: vec![local_root.to_path_buf()],
            files: Vec::new(),
        };

        for entry in entries {
            let Some(relative) = entry
                .path
                .strip_prefix(remote_root)
                .map(|r| r.trim_start_matches('/'))
                .filter(|r| !r.is_empty())
            else {
                continue;
            };
            let local = local_root.join(relative);

            if entry.is_dir() {
                manifest.directories.push(local);
            } else if entry.is_file() {
                manifest.files.push((entry.path.clone(), local, entry.size));
            }
        }

        manifest
    }
}
