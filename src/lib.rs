pub mod algorithms;
pub mod config;
pub mod credentials;
pub mod directory;
pub mod error;
pub mod filesystem;
pub mod known_hosts;
pub mod resource;
pub mod session;
pub mod transfer;

#[cfg(feature = "impl-native")]
pub mod native;

#[cfg(feature = "impl-russh")]
pub mod russh;

pub use config::EndpointConfiguration;
pub use error::{Error, ErrorKind, Result};
pub use session::{Connector, RemoteSession, SessionGuard, SessionManager, SessionStatus};
pub use transfer::{RetrievedFile, TransferEngine};
