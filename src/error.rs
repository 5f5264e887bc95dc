use std::{io, time::Duration};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of [`Error`] used by callers deciding whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Connection,
    Verification,
    Operation,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("could not decode {origin}: {message}{}", hint_suffix(.hint))]
    KeyDecoding {
        origin: String,
        message: String,
        hint: Option<&'static str>,
    },

    #[error("could not connect to {host}:{port} after {attempts} attempt(s): {source}")]
    Connection {
        host: String,
        port: u16,
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("could not reach {host}:{port}: {source}")]
    Network {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("authentication of {user}@{host} failed: {reason}")]
    Authentication {
        user: String,
        host: String,
        reason: String,
    },

    #[error("{stage} with {host}:{port} timed out after {after:?}")]
    Timeout {
        host: String,
        port: u16,
        stage: &'static str,
        after: Duration,
    },

    #[error("host key verification for {host} failed: {reason}")]
    Verification { host: String, reason: String },

    #[error("{operation} failed for {path}: {source}")]
    Operation {
        operation: &'static str,
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("transport error: {0}")]
    Transport(#[from] russh::Error),

    #[error("session is not connected")]
    NotConnected,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Configuration(_) | Error::KeyDecoding { .. } => ErrorKind::Configuration,
            Error::Verification { .. } => ErrorKind::Verification,
            Error::Operation { .. } => ErrorKind::Operation,
            Error::Connection { .. }
            | Error::Network { .. }
            | Error::Authentication { .. }
            | Error::Timeout { .. }
            | Error::Transport(_)
            | Error::NotConnected => ErrorKind::Connection,
        }
    }

    pub(crate) fn configuration(message: impl Into<String>) -> Error {
        Error::Configuration(message.into())
    }

    pub(crate) fn operation(operation: &'static str, path: impl Into<String>, source: io::Error) -> Error {
        Error::Operation {
            operation,
            path: path.into(),
            source,
        }
    }

    /// True when the error means the session can no longer be used.
    pub fn is_connection_loss(&self) -> bool {
        match self {
            Error::Operation { source, .. } => is_connection_loss(source),
            Error::Transport(_) | Error::NotConnected => true,
            _ => false,
        }
    }
}

fn hint_suffix(hint: &Option<&'static str>) -> String {
    match hint {
        Some(hint) => format!(" ({hint})"),
        None => String::new(),
    }
}

pub(crate) fn is_connection_loss(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::TimedOut
            | io::ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_taxonomy() {
        assert_eq!(Error::configuration("x").kind(), ErrorKind::Configuration);
        assert_eq!(
            Error::Verification {
                host: "h".into(),
                reason: "r".into()
            }
            .kind(),
            ErrorKind::Verification
        );
        let connection = Error::Connection {
            host: "h".into(),
            port: 22,
            attempts: 3,
            source: Box::new(Error::NotConnected),
        };
        assert_eq!(connection.kind(), ErrorKind::Connection);
        assert!(connection.to_string().contains("after 3 attempt(s)"));
    }

    #[test]
    fn key_decoding_message_carries_hint() {
        let err = Error::KeyDecoding {
            origin: "private key file /k".into(),
            message: "the key is encrypted".into(),
            hint: Some("check the private key passphrase"),
        };
        assert_eq!(
            err.to_string(),
            "could not decode private key file /k: the key is encrypted (check the private key passphrase)"
        );
    }

    #[test]
    fn aborted_operation_is_connection_loss() {
        let err = Error::operation("list", "/x", io::Error::from(io::ErrorKind::ConnectionAborted));
        assert!(err.is_connection_loss());
        let err = Error::operation("list", "/x", io::Error::from(io::ErrorKind::NotFound));
        assert!(!err.is_connection_loss());
    }
}
