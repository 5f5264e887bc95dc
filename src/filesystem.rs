use std::{io, time::SystemTime};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::is_connection_loss;

/// A readable remote file, independent of the session lock once opened.
pub type RemoteReader = Box<dyn AsyncRead + Send + Unpin>;
pub type RemoteWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Dir,
    Symlink,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAttributes {
    pub kind: FileKind,
    pub size: u64,
    pub permissions: Option<u32>,
    pub modified: Option<SystemTime>,
}

impl FileAttributes {
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Dir
    }

    pub fn is_file(&self) -> bool {
        self.kind == FileKind::File
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub attributes: FileAttributes,
}

impl DirEntry {
    pub fn is_dir(&self) -> bool {
        self.attributes.is_dir()
    }

    pub fn size(&self) -> u64 {
        self.attributes.size
    }

    pub fn modified(&self) -> Option<SystemTime> {
        self.attributes.modified
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteMode {
    #[default]
    Truncate,
    Append,
}

/// The two path queries directory tracking needs.
#[async_trait]
pub trait PathProbe: Send + Sync {
    /// Resolves `path` against the session's home directory.
    async fn canonicalize(&self, path: &str) -> io::Result<String>;

    async fn metadata(&self, path: &str) -> io::Result<FileAttributes>;
}

/// File operations of a session. Paths use `/` separators and relative paths
/// resolve against the session's home directory.
#[async_trait]
pub trait RemoteFilesystem: PathProbe {
    async fn read_dir(&self, path: &str) -> io::Result<Vec<DirEntry>>;

    async fn open_read(&self, path: &str) -> io::Result<RemoteReader>;

    /// Opens for writing, creating the file when missing.
    async fn open_write(&self, path: &str, mode: WriteMode) -> io::Result<RemoteWriter>;

    async fn remove_file(&self, path: &str) -> io::Result<()>;

    async fn rename(&self, from: &str, to: &str) -> io::Result<()>;

    /// Creates a single directory, the parent must exist.
    async fn create_dir(&self, path: &str) -> io::Result<()>;

    async fn set_permissions(&self, path: &str, mode: u32) -> io::Result<()>;

    /// A missing or unreadable path is `Ok(false)`; a lost connection is an error.
    async fn exists(&self, path: &str) -> io::Result<bool> {
        match self.metadata(path).await {
            Ok(_) => Ok(true),
            Err(err) if is_connection_loss(&err) => Err(err),
            Err(_) => Ok(false),
        }
    }
}
