//! File operations routed through the session manager.
//!
//! Every call takes the manager lock, reconnects when the session is not open
//! and reports failures as [`Error::Operation`] with the path involved. A
//! failure that means the connection is gone marks the session failed, so the
//! next call starts with a fresh one.

use std::{fmt, io, path::PathBuf, sync::Arc};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

use crate::{
    config::{parse_permissions, ExistingFilePolicy, RetrieveMode},
    directory::{is_absolute, join, split_file_name, split_root},
    error::{is_connection_loss, Error, Result},
    filesystem::{DirEntry, FileAttributes, PathProbe, RemoteFilesystem, RemoteReader, WriteMode},
    session::{Connector, SessionGuard, SessionManager},
};

const IN_PROGRESS_SUFFIX: &str = ".inprogress";
const COPY_BUFFER_SIZE: usize = 32 * 1024;

/// Content handed out by [`TransferEngine::retrieve`].
pub enum RetrievedFile {
    /// Still open on the server until passed to [`TransferEngine::release`] or dropped.
    Stream(RemoteReader),
    Memory(Bytes),
    /// Local copy inside the configured staging directory.
    Local(PathBuf),
}

impl fmt::Debug for RetrievedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetrievedFile::Stream(_) => f.write_str("Stream(..)"),
            RetrievedFile::Memory(bytes) => f.debug_tuple("Memory").field(&bytes.len()).finish(),
            RetrievedFile::Local(path) => f.debug_tuple("Local").field(path).finish(),
        }
    }
}

pub struct TransferEngine<C>
where
    C: Connector,
{
    manager: Arc<SessionManager<C>>,
}

impl<C> Clone for TransferEngine<C>
where
    C: Connector,
{
    fn clone(&self) -> Self {
        TransferEngine {
            manager: self.manager.clone(),
        }
    }
}

impl<C> TransferEngine<C>
where
    C: Connector,
{
    pub fn new(manager: Arc<SessionManager<C>>) -> TransferEngine<C> {
        TransferEngine { manager }
    }

    pub fn manager(&self) -> &Arc<SessionManager<C>> {
        &self.manager
    }

    async fn connected(&self) -> Result<SessionGuard<'_, C>> {
        let mut guard = self.manager.lock().await;
        guard.ensure_connected().await?;
        Ok(guard)
    }

    /// Lists `path`, or the current directory when `path` is empty.
    pub async fn list(&self, path: &str) -> Result<Vec<DirEntry>> {
        let mut guard = self.connected().await?;
        let path = guard.tracker().resolve(path);
        debug!(%path, "listing directory");
        let result = guard.session()?.read_dir(&path).await;
        result.map_err(|err| failed(&mut guard, "list", &path, err))
    }

    pub async fn retrieve(&self, path: &str) -> Result<RetrievedFile> {
        let mut guard = self.connected().await?;
        let path = guard.tracker().resolve(path);
        let result = guard.session()?.open_read(&path).await;
        let mut reader = result.map_err(|err| failed(&mut guard, "retrieve", &path, err))?;

        let retrieve_mode = guard.config().retrieve_mode.clone();
        match retrieve_mode {
            RetrieveMode::Stream => {
                debug!(%path, "streaming remote file");
                Ok(RetrievedFile::Stream(reader))
            }
            RetrieveMode::Memory => {
                let mut content = Vec::new();
                let result = reader.read_to_end(&mut content).await;
                result.map_err(|err| failed(&mut guard, "retrieve", &path, err))?;
                debug!(%path, bytes = content.len(), "retrieved into memory");
                Ok(RetrievedFile::Memory(Bytes::from(content)))
            }
            RetrieveMode::LocalDirectory(directory) => {
                let (_, name) = split_file_name(&path);
                let target = directory.join(name);
                let staging = directory.join(format!("{name}{IN_PROGRESS_SUFFIX}"));
                let local_error = |err: io::Error| Error::operation("retrieve", staging.display().to_string(), err);

                tokio::fs::create_dir_all(&directory).await.map_err(local_error)?;
                let mut file = tokio::fs::File::create(&staging).await.map_err(local_error)?;
                let copied = match tokio::io::copy(&mut reader, &mut file).await {
                    Ok(copied) => copied,
                    Err(err) => {
                        drop(file);
                        if let Err(cleanup) = tokio::fs::remove_file(&staging).await {
                            debug!(staging = %staging.display(), error = %cleanup, "could not remove staging file");
                        }
                        return Err(failed(&mut guard, "retrieve", &path, err));
                    }
                };
                file.sync_all().await.map_err(local_error)?;
                drop(file);
                tokio::fs::rename(&staging, &target).await.map_err(local_error)?;
                debug!(%path, local = %target.display(), bytes = copied, "retrieved into local file");
                Ok(RetrievedFile::Local(target))
            }
        }
    }

    /// Closes a streamed download. Other variants need no cleanup.
    pub fn release(&self, file: RetrievedFile) {
        if let RetrievedFile::Stream(reader) = file {
            debug!("releasing remote stream");
            drop(reader);
        }
    }

    /// Writes `source` to `path`. Returns `false` when the existing-file policy
    /// skipped the write.
    pub async fn store<R>(&self, path: &str, mut source: R, mode: WriteMode) -> Result<bool>
    where
        R: AsyncRead + Unpin + Send,
    {
        let config = self.manager.config().clone();
        let chmod = config.chmod.as_deref().map(parse_permissions).transpose()?;
        let chmod_directory = config.chmod_directory.as_deref().map(parse_permissions).transpose()?;

        let mut guard = self.connected().await?;
        let target = guard.tracker().resolve(path);
        let (directory, name) = split_file_name(&target);
        let name = name.to_string();
        if name.is_empty() || name == "." || name == ".." {
            return Err(Error::operation(
                "store",
                target.clone(),
                io::Error::new(io::ErrorKind::InvalidInput, "path does not name a file"),
            ));
        }

        if config.auto_create && !directory.is_empty() {
            make_directories(&mut guard, &directory, chmod_directory).await?;
        }

        let mut mode = mode;
        if probe_exists(&mut guard, &target).await? {
            match &config.existing_file_policy {
                ExistingFilePolicy::Ignore => {
                    debug!(path = %target, "file exists, skipping store");
                    return Ok(false);
                }
                ExistingFilePolicy::Fail => {
                    return Err(Error::operation(
                        "store",
                        target.clone(),
                        io::Error::new(io::ErrorKind::AlreadyExists, "file already exists"),
                    ));
                }
                ExistingFilePolicy::Move(template) => {
                    let moved = move_target(&directory, &name, template);
                    if probe_exists(&mut guard, &moved).await? {
                        let result = guard.session()?.remove_file(&moved).await;
                        result.map_err(|err| failed(&mut guard, "store", &moved, err))?;
                    }
                    let result = guard.session()?.rename(&target, &moved).await;
                    result.map_err(|err| failed(&mut guard, "store", &target, err))?;
                    debug!(path = %target, to = %moved, "moved existing file aside");
                }
                ExistingFilePolicy::Append => mode = WriteMode::Append,
                ExistingFilePolicy::Override => {}
            }
        }

        let upload = match (&config.temp_prefix, mode) {
            (Some(prefix), WriteMode::Truncate) => join(&directory, &format!("{prefix}{name}")),
            _ => target.clone(),
        };

        let opened = guard.session()?.open_write(&upload, mode).await;
        let mut writer = opened.map_err(|err| failed(&mut guard, "store", &upload, err))?;
        let copied = copy_to_remote(&mut source, &mut writer).await;
        drop(writer);
        let written = match copied {
            Ok(written) => written,
            Err(err) => {
                let err = match err {
                    CopyError::Source(err) => Error::operation("store", target.clone(), err),
                    CopyError::Remote(err) => failed(&mut guard, "store", &upload, err),
                };
                if upload != target {
                    discard_upload(&guard, &upload).await;
                }
                return Err(err);
            }
        };

        if upload != target {
            if probe_exists(&mut guard, &target).await? {
                let result = guard.session()?.remove_file(&target).await;
                result.map_err(|err| failed(&mut guard, "store", &target, err))?;
            }
            let result = guard.session()?.rename(&upload, &target).await;
            result.map_err(|err| failed(&mut guard, "store", &upload, err))?;
        }

        if let Some(chmod) = chmod {
            let result = guard.session()?.set_permissions(&target, chmod).await;
            result.map_err(|err| failed(&mut guard, "chmod", &target, err))?;
        }

        info!(path = %target, bytes = written, ?mode, "stored file");
        Ok(true)
    }

    pub async fn delete(&self, path: &str) -> Result<()> {
        let mut guard = self.connected().await?;
        let path = guard.tracker().resolve(path);
        let result = guard.session()?.remove_file(&path).await;
        result.map_err(|err| failed(&mut guard, "delete", &path, err))?;
        debug!(%path, "deleted file");
        Ok(())
    }

    pub async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let mut guard = self.connected().await?;
        let from = guard.tracker().resolve(from);
        let to = guard.tracker().resolve(to);
        let result = guard.session()?.rename(&from, &to).await;
        result.map_err(|err| failed(&mut guard, "rename", &from, err))?;
        debug!(%from, %to, "renamed file");
        Ok(())
    }

    /// Creates `path` and any missing parents, applying the directory
    /// permissions to every directory created.
    pub async fn mkdir(&self, path: &str) -> Result<()> {
        let chmod_directory = self
            .manager
            .config()
            .chmod_directory
            .as_deref()
            .map(parse_permissions)
            .transpose()?;
        let mut guard = self.connected().await?;
        let path = guard.tracker().resolve(path);
        make_directories(&mut guard, &path, chmod_directory).await
    }

    /// Any failure to query the path counts as absent. A lost connection still
    /// marks the session failed so the next call reconnects. Only failing to
    /// connect in the first place is an error.
    pub async fn exists(&self, path: &str) -> Result<bool> {
        let mut guard = self.connected().await?;
        let path = guard.tracker().resolve(path);
        match probe_exists(&mut guard, &path).await {
            Ok(exists) => Ok(exists),
            Err(err) => {
                debug!(%path, error = %err, "existence check failed, reporting absent");
                Ok(false)
            }
        }
    }

    pub async fn stat(&self, path: &str) -> Result<FileAttributes> {
        let mut guard = self.connected().await?;
        let path = guard.tracker().resolve(path);
        let result = guard.session()?.metadata(&path).await;
        result.map_err(|err| failed(&mut guard, "stat", &path, err))
    }

    pub async fn current_directory(&self) -> Result<String> {
        let mut guard = self.connected().await?;
        let result = {
            let (session, tracker) = guard.parts()?;
            tracker.current_directory(session).await
        };
        result.map_err(|err| failed(&mut guard, "current directory", ".", err))
    }

    pub async fn change_directory(&self, path: &str) -> Result<()> {
        let mut guard = self.connected().await?;
        let result = {
            let (session, tracker) = guard.parts()?;
            tracker.change_directory(session, path).await
        };
        result.map_err(|err| failed(&mut guard, "change directory", path, err))
    }

    pub async fn change_to_parent(&self) -> Result<()> {
        let mut guard = self.connected().await?;
        let result = {
            let (session, tracker) = guard.parts()?;
            tracker.change_to_parent(session).await
        };
        result.map_err(|err| failed(&mut guard, "change directory", "..", err))
    }
}

impl<C> fmt::Debug for TransferEngine<C>
where
    C: Connector,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferEngine").field("manager", &self.manager).finish()
    }
}

fn failed<C>(guard: &mut SessionGuard<'_, C>, operation: &'static str, path: &str, err: io::Error) -> Error
where
    C: Connector,
{
    if is_connection_loss(&err) {
        guard.mark_failed(format!("{operation} {path}: {err}"));
    }
    Error::operation(operation, path, err)
}

async fn probe_exists<C>(guard: &mut SessionGuard<'_, C>, path: &str) -> Result<bool>
where
    C: Connector,
{
    let result = guard.session()?.exists(path).await;
    match result {
        Ok(exists) => Ok(exists),
        Err(err) if is_connection_loss(&err) => Err(failed(guard, "exists", path, err)),
        Err(err) => {
            debug!(%path, error = %err, "treating unreadable path as absent");
            Ok(false)
        }
    }
}

/// Which side of an upload failed. Only the remote side says anything about
/// the session.
enum CopyError {
    Source(io::Error),
    Remote(io::Error),
}

async fn copy_to_remote<R, W>(source: &mut R, writer: &mut W) -> std::result::Result<u64, CopyError>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut written = 0u64;
    loop {
        let read = source.read(&mut buffer).await.map_err(CopyError::Source)?;
        if read == 0 {
            break;
        }
        writer.write_all(&buffer[..read]).await.map_err(CopyError::Remote)?;
        written += read as u64;
    }
    writer.shutdown().await.map_err(CopyError::Remote)?;
    Ok(written)
}

/// Best effort removal of a temporary upload after a failed store.
async fn discard_upload<C>(guard: &SessionGuard<'_, C>, path: &str)
where
    C: Connector,
{
    let Ok(session) = guard.session() else {
        return;
    };
    match session.remove_file(path).await {
        Ok(()) => debug!(%path, "removed partial upload"),
        Err(err) => debug!(%path, error = %err, "could not remove partial upload"),
    }
}

/// Creates the whole path in one request, falling back to one request per
/// missing segment for servers that refuse it.
async fn make_directories<C>(guard: &mut SessionGuard<'_, C>, path: &str, chmod: Option<u32>) -> Result<()>
where
    C: Connector,
{
    if probe_exists(guard, path).await? {
        return Ok(());
    }

    let result = guard.session()?.create_dir(path).await;
    match result {
        Ok(()) => {
            debug!(%path, "created directory");
            return apply_directory_permissions(guard, path, chmod).await;
        }
        Err(err) if is_connection_loss(&err) => return Err(failed(guard, "mkdir", path, err)),
        Err(err) => debug!(%path, error = %err, "creating directory in one request failed, creating segments"),
    }

    for prefix in directory_prefixes(path) {
        if probe_exists(guard, &prefix).await? {
            continue;
        }
        let result = guard.session()?.create_dir(&prefix).await;
        match result {
            Ok(()) => {
                debug!(path = %prefix, "created directory");
                apply_directory_permissions(guard, &prefix, chmod).await?;
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
            Err(err) => return Err(failed(guard, "mkdir", &prefix, err)),
        }
    }
    Ok(())
}

async fn apply_directory_permissions<C>(guard: &mut SessionGuard<'_, C>, path: &str, chmod: Option<u32>) -> Result<()>
where
    C: Connector,
{
    let Some(mode) = chmod else {
        return Ok(());
    };
    let result = guard.session()?.set_permissions(path, mode).await;
    result.map_err(|err| failed(guard, "chmod", path, err))
}

/// `a/b/c` yields `a`, `a/b`, `a/b/c`; the root itself is never included.
fn directory_prefixes(path: &str) -> Vec<String> {
    let (root, rest) = split_root(path);
    let mut current = root;
    let mut prefixes = Vec::new();
    for segment in rest.split('/').filter(|segment| !segment.is_empty() && *segment != ".") {
        current = join(&current, segment);
        prefixes.push(current.clone());
    }
    prefixes
}

fn move_target(directory: &str, name: &str, template: &str) -> String {
    let expanded = template.replace("{name}", name);
    if is_absolute(&expanded) {
        expanded
    } else {
        join(directory, &expanded)
    }
}
