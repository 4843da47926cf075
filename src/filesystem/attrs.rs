//! Metadata snapshots for remote paths.

use std::collections::HashMap;

use crate::transport::FileStat;

const S_IFMT: u32 = 0o170000;
const S_IFSOCK: u32 = 0o140000;
const S_IFLNK: u32 = 0o120000;
const S_IFREG: u32 = 0o100000;
const S_IFBLK: u32 = 0o060000;
const S_IFDIR: u32 = 0o040000;
const S_IFCHR: u32 = 0o020000;
const S_IFIFO: u32 = 0o010000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Directory,
    Symlink,
    Socket,
    BlockDevice,
    CharDevice,
    Fifo,
    Unknown,
}

impl FileKind {
    pub fn from_mode(mode: u32) -> Self {
        match mode & S_IFMT {
            S_IFREG => FileKind::File,
            S_IFDIR => FileKind::Directory,
            S_IFLNK => FileKind::Symlink,
            S_IFSOCK => FileKind::Socket,
            S_IFBLK => FileKind::BlockDevice,
            S_IFCHR => FileKind::CharDevice,
            S_IFIFO => FileKind::Fifo,
            _ => FileKind::Unknown,
        }
    }

    /// First character of an `ls -l` line.
    pub fn symbol(self) -> char {
        match self {
            FileKind::File => '-',
            FileKind::Directory => 'd',
            FileKind::Symlink => 'l',
            FileKind::Socket => 's',
            FileKind::BlockDevice => 'b',
            FileKind::CharDevice => 'c',
            FileKind::Fifo => 'p',
            FileKind::Unknown => '?',
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Permissions {
    pub owner_read: bool,
    pub owner_write: bool,
    pub owner_exec: bool,
    pub group_read: bool,
    pub group_write: bool,
    pub group_exec: bool,
    pub other_read: bool,
    pub other_write: bool,
    pub other_exec: bool,
}

impl Permissions {
    pub fn from_mode(mode: u32) -> Self {
        let bit = |b: u32| mode & b != 0;
        Self {
            owner_read: bit(0o400),
            owner_write: bit(0o200),
            owner_exec: bit(0o100),
            group_read: bit(0o040),
            group_write: bit(0o020),
            group_exec: bit(0o010),
            other_read: bit(0o004),
            other_write: bit(0o002),
            other_exec: bit(0o001),
        }
    }

    pub fn bits(&self) -> u32 {
        [
            (self.owner_read, 0o400),
            (self.owner_write, 0o200),
            (self.owner_exec, 0o100),
            (self.group_read, 0o040),
            (self.group_write, 0o020),
            (self.group_exec, 0o010),
            (self.other_read, 0o004),
            (self.other_write, 0o002),
            (self.other_exec, 0o001),
        ]
        .iter()
        .filter(|(set, _)| *set)
        .fold(0, |acc, (_, b)| acc | b)
    }

    /// `rwxr-xr-x` style rendering.
    pub fn symbolic(&self) -> String {
        let flag = |on: bool, c: char| if on { c } else { '-' };
        [
            flag(self.owner_read, 'r'),
            flag(self.owner_write, 'w'),
            flag(self.owner_exec, 'x'),
            flag(self.group_read, 'r'),
            flag(self.group_write, 'w'),
            flag(self.group_exec, 'x'),
            flag(self.other_read, 'r'),
            flag(self.other_write, 'w'),
            flag(self.other_exec, 'x'),
        ]
        .iter()
        .collect()
    }
}

/// uid/gid to name tables fetched once per connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OwnerTables {
    pub users: HashMap<u32, String>,
    pub groups: HashMap<u32, String>,
}

impl OwnerTables {
    pub fn from_passwd_group(passwd: &str, group: &str) -> Self {
        Self {
            users: parse_id_table(passwd),
            groups: parse_id_table(group),
        }
    }
}

/// Parse `name:x:id:...` lines (passwd and group formats) into id -> name.
pub fn parse_id_table(text: &str) -> HashMap<u32, String> {
    text.lines()
        .filter(|line| !line.trim().is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let mut fields = line.split(':');
            let name = fields.next()?.trim();
            let id = fields.nth(1)?.trim().parse::<u32>().ok()?;
            (!name.is_empty()).then(|| (id, name.to_string()))
        })
        .collect()
}

/// One path's metadata at the moment it was queried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub name: String,
    pub path: String,
    pub kind: FileKind,
    pub size: u64,
    pub mode: u32,
    pub permissions: Permissions,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub owner: Option<String>,
    pub group: Option<String>,
    pub mtime: Option<u32>,
}

impl RemoteFile {
    pub fn from_stat(
        name: impl Into<String>,
        path: impl Into<String>,
        stat: &FileStat,
        owners: Option<&OwnerTables>,
    ) -> Self {
        let mode = stat.mode.unwrap_or(0);
        let owner = owners.and_then(|t| stat.uid.and_then(|uid| t.users.get(&uid).cloned()));
        let group = owners.and_then(|t| stat.gid.and_then(|gid| t.groups.get(&gid).cloned()));
        Self {
            name: name.into(),
            path: path.into(),
            kind: FileKind::from_mode(mode),
            size: stat.size.unwrap_or(0),
            mode,
            permissions: Permissions::from_mode(mode),
            uid: stat.uid,
            gid: stat.gid,
            owner,
            group,
            mtime: stat.mtime,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }

    pub fn is_file(&self) -> bool {
        self.kind == FileKind::File
    }

    pub fn is_symlink(&self) -> bool {
        self.kind == FileKind::Symlink
    }

    /// `drwxr-xr-x` style rendering of kind and permission bits.
    pub fn mode_string(&self) -> String {
        format!("{}{}", self.kind.symbol(), self.permissions.symbolic())
    }

    /// Owner name, or the numeric uid when it could not be resolved.
    pub fn owner_display(&self) -> String {
        match (&self.owner, self.uid) {
            (Some(name), _) => name.clone(),
            (None, Some(uid)) => uid.to_string(),
            (None, None) => "?".to_string(),
        }
    }

    pub fn group_display(&self) -> String {
        match (&self.group, self.gid) {
            (Some(name), _) => name.clone(),
            (None, Some(gid)) => gid.to_string(),
            (None, None) => "?".to_string(),
        }
    }
}
