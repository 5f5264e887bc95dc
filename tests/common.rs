#![allow(dead_code)]

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use sftp_endpoint::{
    native::{LocalConnector, LocalFilesystem, LocalLink},
    Connector, EndpointConfiguration, Error, Result, SessionManager, TransferEngine,
};
use tempfile::TempDir;

pub fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests").join("fixtures").join(name)
}

/// A configuration that never touches the user's known_hosts file and retries
/// without waiting.
pub fn test_config() -> EndpointConfiguration {
    let mut config = EndpointConfiguration::new("localhost", "tester");
    config.use_user_known_hosts_file = false;
    config.reconnect_delay = Duration::ZERO;
    config
}

pub struct LocalEndpoint {
    pub root: TempDir,
    pub link: Arc<LocalLink>,
    pub engine: TransferEngine<LocalConnector>,
}

impl LocalEndpoint {
    pub fn new() -> LocalEndpoint {
        LocalEndpoint::with_config(test_config())
    }

    pub fn with_config(config: EndpointConfiguration) -> LocalEndpoint {
        let root = tempfile::tempdir().expect("Could not create temp dir");
        let connector = LocalConnector::new(root.path());
        let link = connector.link();
        let manager = SessionManager::new(Arc::new(config), connector).expect("Invalid configuration");
        LocalEndpoint {
            root,
            link,
            engine: TransferEngine::new(Arc::new(manager)),
        }
    }

    pub fn local(&self, path: &str) -> PathBuf {
        self.root.path().join(path.trim_start_matches('/'))
    }

    pub fn write(&self, path: &str, content: &str) {
        let local = self.local(path);
        if let Some(parent) = local.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(local, content).unwrap();
    }

    pub fn read(&self, path: &str) -> String {
        std::fs::read_to_string(self.local(path)).unwrap()
    }
}

/// Refuses the first `failures` connection attempts, then behaves like a
/// [`LocalConnector`].
pub struct FlakyConnector {
    inner: LocalConnector,
    failures: u32,
    pub attempts: Arc<AtomicU32>,
}

impl FlakyConnector {
    pub fn new(root: &Path, failures: u32) -> FlakyConnector {
        FlakyConnector {
            inner: LocalConnector::new(root),
            failures,
            attempts: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn link(&self) -> Arc<LocalLink> {
        self.inner.link()
    }
}

#[async_trait]
impl Connector for FlakyConnector {
    type Session = LocalFilesystem;

    async fn connect(&mut self, config: &Arc<EndpointConfiguration>) -> Result<LocalFilesystem> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.failures {
            return Err(Error::Network {
                host: config.host.clone(),
                port: config.port,
                source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
            });
        }
        self.inner.connect(config).await
    }

    fn reset(&mut self) {
        self.inner.reset()
    }
}
