mod filesystem;

pub use filesystem::LocalFilesystem;

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use tracing::debug;

use crate::{
    config::EndpointConfiguration,
    error::{Error, Result},
    session::Connector,
};

/// Connection bookkeeping shared between a [`LocalConnector`] and its sessions.
#[derive(Debug, Default)]
pub struct LocalLink {
    connects: AtomicUsize,
    resets: AtomicUsize,
    generation: AtomicUsize,
    /// Generation plus one of the sessions broken by [`LocalLink::drop_unnoticed`].
    unnoticed: AtomicUsize,
}

impl LocalLink {
    /// Number of sessions handed out so far.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    /// Breaks every session handed out so far, as a dropped connection would.
    pub fn sever(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Breaks the sessions handed out so far while they still report being
    /// open, the way a dead peer goes unnoticed until the next request.
    pub fn drop_unnoticed(&self) {
        self.unnoticed.store(self.generation() + 1, Ordering::SeqCst);
    }

    fn generation(&self) -> usize {
        self.generation.load(Ordering::SeqCst)
    }

    fn is_dropped_unnoticed(&self, generation: usize) -> bool {
        self.unnoticed.load(Ordering::SeqCst) == generation + 1
    }
}

/// Opens sessions on a local directory that stands in for the remote root.
#[derive(Debug, Clone)]
pub struct LocalConnector {
    root: PathBuf,
    link: Arc<LocalLink>,
}

impl LocalConnector {
    pub fn new(root: impl Into<PathBuf>) -> LocalConnector {
        LocalConnector {
            root: root.into(),
            link: Arc::new(LocalLink::default()),
        }
    }

    pub fn link(&self) -> Arc<LocalLink> {
        self.link.clone()
    }
}

#[async_trait]
impl Connector for LocalConnector {
    type Session = LocalFilesystem;

    async fn connect(&mut self, config: &Arc<EndpointConfiguration>) -> Result<LocalFilesystem> {
        match tokio::fs::metadata(&self.root).await {
            Ok(metadata) if metadata.is_dir() => {}
            Ok(_) => {
                return Err(Error::operation(
                    "connect",
                    self.root.display().to_string(),
                    std::io::Error::new(std::io::ErrorKind::InvalidInput, "root is not a directory"),
                ))
            }
            Err(err) => return Err(Error::operation("connect", self.root.display().to_string(), err)),
        }

        self.link.connects.fetch_add(1, Ordering::SeqCst);
        self.link.unnoticed.store(0, Ordering::SeqCst);
        debug!(root = %self.root.display(), user = %config.username, "opened local session");
        Ok(LocalFilesystem::linked(self.root.clone(), self.link.clone(), self.link.generation()))
    }

    fn reset(&mut self) {
        self.link.resets.fetch_add(1, Ordering::SeqCst);
    }
}
