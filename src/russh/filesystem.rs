use std::io;

use async_trait::async_trait;
use russh_sftp::{
    client::error::Error as SftpError,
    protocol::{FileAttributes as SftpAttributes, FileType, OpenFlags, StatusCode},
};
use tokio::io::{BufReader, BufWriter};

use super::RusshSession;
use crate::filesystem::{DirEntry, FileAttributes, FileKind, PathProbe, RemoteFilesystem, RemoteReader, RemoteWriter, WriteMode};

/// Maps protocol failures onto io error kinds so callers can tell a missing
/// file from a dropped connection.
pub(super) fn sftp_error(err: SftpError) -> io::Error {
    let kind = match &err {
        SftpError::Status(status) => match status.status_code {
            StatusCode::NoSuchFile => io::ErrorKind::NotFound,
            StatusCode::PermissionDenied => io::ErrorKind::PermissionDenied,
            StatusCode::NoConnection | StatusCode::ConnectionLost => io::ErrorKind::ConnectionAborted,
            StatusCode::OpUnsupported => io::ErrorKind::Unsupported,
            StatusCode::Eof => io::ErrorKind::UnexpectedEof,
            _ => io::ErrorKind::Other,
        },
        SftpError::Timeout => io::ErrorKind::TimedOut,
        SftpError::IO(_) => io::ErrorKind::ConnectionAborted,
        SftpError::UnexpectedBehavior(message) if channel_gone(message) => io::ErrorKind::ConnectionAborted,
        _ => io::ErrorKind::Other,
    };
    io::Error::new(kind, err.to_string())
}

/// russh-sftp reports a dead channel through these messages while the SSH
/// transport itself may still be up.
fn channel_gone(message: &str) -> bool {
    const CLOSED: [&str; 4] = ["session closed", "recv none message", "SendError", "RecvError"];
    CLOSED.iter().any(|prefix| message.starts_with(prefix))
}

fn attributes(sftp: &SftpAttributes) -> FileAttributes {
    let kind = match sftp.file_type() {
        FileType::Dir => FileKind::Dir,
        FileType::File => FileKind::File,
        FileType::Symlink => FileKind::Symlink,
        FileType::Other => FileKind::Other,
    };
    FileAttributes {
        kind,
        size: sftp.len(),
        permissions: sftp.permissions.map(|mode| mode & 0o7777),
        modified: sftp.modified().ok(),
    }
}

#[async_trait]
impl PathProbe for RusshSession {
    async fn canonicalize(&self, path: &str) -> io::Result<String> {
        self.sftp.canonicalize(path).await.map_err(sftp_error)
    }

    async fn metadata(&self, path: &str) -> io::Result<FileAttributes> {
        let metadata = self.sftp.metadata(path).await.map_err(sftp_error)?;
        Ok(attributes(&metadata))
    }
}

#[async_trait]
impl RemoteFilesystem for RusshSession {
    async fn read_dir(&self, path: &str) -> io::Result<Vec<DirEntry>> {
        let entries = self.sftp.read_dir(path).await.map_err(sftp_error)?;
        Ok(entries
            .filter(|entry| !matches!(entry.file_name().as_str(), "." | ".."))
            .map(|entry| DirEntry {
                name: entry.file_name(),
                attributes: attributes(&entry.metadata()),
            })
            .collect())
    }

    async fn open_read(&self, path: &str) -> io::Result<RemoteReader> {
        let file = self
            .sftp
            .open_with_flags(path, OpenFlags::READ)
            .await
            .map_err(sftp_error)?;
        Ok(Box::new(BufReader::with_capacity(self.buffers.read, file)))
    }

    async fn open_write(&self, path: &str, mode: WriteMode) -> io::Result<RemoteWriter> {
        let flags = match mode {
            WriteMode::Truncate => OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
            WriteMode::Append => OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::APPEND,
        };
        let file = self.sftp.open_with_flags(path, flags).await.map_err(sftp_error)?;
        Ok(Box::new(BufWriter::with_capacity(self.buffers.write, file)))
    }

    async fn remove_file(&self, path: &str) -> io::Result<()> {
        self.sftp.remove_file(path).await.map_err(sftp_error)
    }

    async fn rename(&self, from: &str, to: &str) -> io::Result<()> {
        self.sftp.rename(from, to).await.map_err(sftp_error)
    }

    async fn create_dir(&self, path: &str) -> io::Result<()> {
        self.sftp.create_dir(path).await.map_err(sftp_error)
    }

    async fn set_permissions(&self, path: &str, mode: u32) -> io::Result<()> {
        let attributes = SftpAttributes {
            permissions: Some(mode),
            ..SftpAttributes::empty()
        };
        self.sftp.set_metadata(path, attributes).await.map_err(sftp_error)
    }

    async fn exists(&self, path: &str) -> io::Result<bool> {
        self.sftp.try_exists(path).await.map_err(sftp_error)
    }
}
