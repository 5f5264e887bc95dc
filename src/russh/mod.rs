mod connection;
mod filesystem;
mod handler;

pub use connection::RusshConnector;
pub use handler::VerifyingHandler;

use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use russh::{client, Disconnect};
use russh_sftp::client::SftpSession;
use tracing::debug;

use crate::{algorithms::BufferSizes, session::RemoteSession};

/// An authenticated SSH connection with its SFTP subsystem.
pub struct RusshSession {
    handle: client::Handle<VerifyingHandler>,
    sftp: SftpSession,
    buffers: BufferSizes,
    channel_closed: Arc<AtomicBool>,
}

impl RusshSession {
    pub fn buffers(&self) -> BufferSizes {
        self.buffers
    }
}

#[async_trait]
impl RemoteSession for RusshSession {
    fn is_open(&self) -> bool {
        !self.handle.is_closed() && !self.channel_closed.load(Ordering::Acquire)
    }

    async fn close(&mut self) -> io::Result<()> {
        if let Err(err) = self.sftp.close().await {
            debug!(error = %err, "closing sftp channel failed");
        }
        self.handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
            .map_err(io::Error::other)
    }
}
