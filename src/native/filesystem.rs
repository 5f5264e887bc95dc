use std::{
    fs::Permissions,
    io,
    os::unix::fs::PermissionsExt,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use tokio::fs::{self, OpenOptions};

use super::LocalLink;
use crate::{
    filesystem::{DirEntry, FileAttributes, FileKind, PathProbe, RemoteFilesystem, RemoteReader, RemoteWriter, WriteMode},
    session::RemoteSession,
};

/// A directory served as if it were the remote filesystem. `/` maps to the
/// root directory, which is also the home directory.
#[derive(Debug)]
pub struct LocalFilesystem {
    root: PathBuf,
    link: Arc<LocalLink>,
    generation: usize,
    closed: AtomicBool,
}

impl LocalFilesystem {
    pub fn new(root: impl Into<PathBuf>) -> LocalFilesystem {
        LocalFilesystem::linked(root.into(), Arc::new(LocalLink::default()), 0)
    }

    pub(super) fn linked(root: PathBuf, link: Arc<LocalLink>, generation: usize) -> LocalFilesystem {
        LocalFilesystem {
            root,
            link,
            generation,
            closed: AtomicBool::new(false),
        }
    }

    fn check_open(&self) -> io::Result<()> {
        if self.is_open() && !self.link.is_dropped_unnoticed(self.generation) {
            Ok(())
        } else {
            Err(io::Error::new(io::ErrorKind::ConnectionAborted, "local session is closed"))
        }
    }

    /// Maps a session path to the local path, never escaping the root.
    fn local_path(&self, path: &str) -> io::Result<PathBuf> {
        self.check_open()?;
        let mut local = self.root.clone();
        for segment in virtual_segments(path) {
            local.push(segment);
        }
        Ok(local)
    }
}

fn virtual_segments(path: &str) -> Vec<&str> {
    let mut segments = Vec::new();
    for segment in path.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            name => segments.push(name),
        }
    }
    segments
}

fn attributes(metadata: &std::fs::Metadata) -> FileAttributes {
    let file_type = metadata.file_type();
    let kind = if file_type.is_dir() {
        FileKind::Dir
    } else if file_type.is_file() {
        FileKind::File
    } else if file_type.is_symlink() {
        FileKind::Symlink
    } else {
        FileKind::Other
    };
    FileAttributes {
        kind,
        size: metadata.len(),
        permissions: Some(metadata.permissions().mode() & 0o7777),
        modified: metadata.modified().ok(),
    }
}

#[async_trait]
impl PathProbe for LocalFilesystem {
    async fn canonicalize(&self, path: &str) -> io::Result<String> {
        let local = self.local_path(path)?;
        fs::metadata(&local).await?;
        Ok(format!("/{}", virtual_segments(path).join("/")))
    }

    async fn metadata(&self, path: &str) -> io::Result<FileAttributes> {
        let local = self.local_path(path)?;
        Ok(attributes(&fs::metadata(local).await?))
    }
}

#[async_trait]
impl RemoteFilesystem for LocalFilesystem {
    async fn read_dir(&self, path: &str) -> io::Result<Vec<DirEntry>> {
        let mut reader = fs::read_dir(self.local_path(path)?).await?;
        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            let metadata = entry.metadata().await?;
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                attributes: attributes(&metadata),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn open_read(&self, path: &str) -> io::Result<RemoteReader> {
        let file = fs::File::open(self.local_path(path)?).await?;
        Ok(Box::new(file))
    }

    async fn open_write(&self, path: &str, mode: WriteMode) -> io::Result<RemoteWriter> {
        let mut options = OpenOptions::new();
        options.create(true);
        match mode {
            WriteMode::Truncate => options.write(true).truncate(true),
            WriteMode::Append => options.append(true),
        };
        Ok(Box::new(options.open(self.local_path(path)?).await?))
    }

    async fn remove_file(&self, path: &str) -> io::Result<()> {
        fs::remove_file(self.local_path(path)?).await
    }

    async fn rename(&self, from: &str, to: &str) -> io::Result<()> {
        let to = self.local_path(to)?;
        // SFTP servers refuse to rename onto an existing file
        if fs::try_exists(&to).await? {
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, "rename target exists"));
        }
        fs::rename(self.local_path(from)?, to).await
    }

    async fn create_dir(&self, path: &str) -> io::Result<()> {
        fs::create_dir(self.local_path(path)?).await
    }

    async fn set_permissions(&self, path: &str, mode: u32) -> io::Result<()> {
        fs::set_permissions(self.local_path(path)?, Permissions::from_mode(mode)).await
    }
}

#[async_trait]
impl RemoteSession for LocalFilesystem {
    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.link.generation() == self.generation
    }

    async fn close(&mut self) -> io::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[test]
    fn paths_stay_below_root() {
        assert_eq!(virtual_segments("/../../etc/passwd"), vec!["etc", "passwd"]);
        assert_eq!(virtual_segments("a/./b/../c"), vec!["a", "c"]);
        assert!(virtual_segments("/").is_empty());
    }

    #[tokio::test]
    async fn write_append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFilesystem::new(dir.path());

        let mut writer = fs.open_write("/note.txt", WriteMode::Truncate).await.unwrap();
        writer.write_all(b"first").await.unwrap();
        writer.shutdown().await.unwrap();
        let mut writer = fs.open_write("/note.txt", WriteMode::Append).await.unwrap();
        writer.write_all(b"second").await.unwrap();
        writer.shutdown().await.unwrap();

        let mut content = String::new();
        fs.open_read("note.txt").await.unwrap().read_to_string(&mut content).await.unwrap();
        assert_eq!(content, "firstsecond");
        assert_eq!(fs.canonicalize("./x/../note.txt").await.unwrap(), "/note.txt");
    }

    #[tokio::test]
    async fn closed_session_fails_with_connection_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut fs = LocalFilesystem::new(dir.path());
        fs.close().await.unwrap();
        assert!(!fs.is_open());
        let err = fs.metadata("/").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
    }

    #[tokio::test]
    async fn exists_reports_absence_but_not_a_lost_session() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("here.txt"), "x").unwrap();
        let mut fs = LocalFilesystem::new(dir.path());

        assert!(fs.exists("/here.txt").await.unwrap());
        assert!(!fs.exists("/missing.txt").await.unwrap());

        fs.close().await.unwrap();
        let err = fs.exists("/here.txt").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
    }
}
