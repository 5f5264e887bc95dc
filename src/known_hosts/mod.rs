mod entry;
mod verifier;

pub use entry::{Marker, TrustEntry};
pub use verifier::{
    check_certificate_claims, HostIdentityVerifier, PeerAddress, PresentedHostKey, ServerKeyVerifier,
};

use std::{
    fmt, fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use russh::keys::ssh_key::{public::KeyData, Fingerprint, HashAlg};
use tracing::{debug, warn};

use crate::{
    config::EndpointConfiguration,
    error::{Error, Result},
};

/// Where the entries of a [`HostTrustStore`] were read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustSource {
    Inline,
    Resource(String),
    File(PathBuf),
    UserDefault(PathBuf),
}

impl TrustSource {
    /// Picks the highest ranked configured source: inline bytes, then resource,
    /// then explicit file, then the user's default file.
    ///
    /// Empty values count as not configured. The user default only counts
    /// when it exists or may be created.
    pub fn select(config: &EndpointConfiguration) -> Option<TrustSource> {
        if config.known_hosts.as_ref().is_some_and(|bytes| !bytes.is_empty()) {
            return Some(TrustSource::Inline);
        }
        if let Some(uri) = config.known_hosts_uri.as_ref().filter(|uri| !uri.trim().is_empty()) {
            return Some(TrustSource::Resource(uri.clone()));
        }
        if let Some(path) = config.known_hosts_file.as_ref().filter(|path| !path.as_os_str().is_empty()) {
            return Some(TrustSource::File(path.clone()));
        }
        if config.use_user_known_hosts_file {
            if let Some(path) = user_known_hosts_file() {
                if path.exists() || config.auto_create_known_hosts_file {
                    return Some(TrustSource::UserDefault(path));
                }
            }
        }
        None
    }

    fn path(&self) -> Option<&Path> {
        match self {
            TrustSource::File(path) | TrustSource::UserDefault(path) => Some(path),
            _ => None,
        }
    }
}

impl fmt::Display for TrustSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrustSource::Inline => f.write_str("inline known hosts"),
            TrustSource::Resource(uri) => write!(f, "known hosts resource {uri}"),
            TrustSource::File(path) | TrustSource::UserDefault(path) => {
                write!(f, "known hosts file {}", path.display())
            }
        }
    }
}

pub fn user_known_hosts_file() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".ssh").join("known_hosts"))
}

/// Outcome of looking up a plain host key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostLookup {
    Trusted,
    Revoked,
    /// The host is known under a different key.
    Changed,
    Unknown,
}

#[derive(Debug)]
pub struct HostTrustStore {
    source: TrustSource,
    entries: Vec<TrustEntry>,
}

impl HostTrustStore {
    /// Loads the single highest ranked source, `None` when nothing is configured.
    pub fn load(config: &EndpointConfiguration) -> Result<Option<HostTrustStore>> {
        let Some(source) = TrustSource::select(config) else {
            return Ok(None);
        };

        let text = match &source {
            TrustSource::Inline => {
                let bytes = config.known_hosts.as_deref().unwrap_or_default();
                String::from_utf8_lossy(bytes).into_owned()
            }
            TrustSource::Resource(uri) => {
                let bytes = config
                    .resource_resolver
                    .resolve(uri)
                    .map_err(|err| load_error(&source, err))?;
                String::from_utf8_lossy(&bytes).into_owned()
            }
            TrustSource::File(path) | TrustSource::UserDefault(path) => match fs::read_to_string(path) {
                Ok(text) => text,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    debug!(path = %path.display(), "known hosts file does not exist yet");
                    String::new()
                }
                Err(err) => return Err(load_error(&source, err)),
            },
        };

        let store = HostTrustStore::parse(source, &text);
        debug!(source = %store.source, entries = store.entries.len(), "loaded host trust store");
        Ok(Some(store))
    }

    pub fn parse(source: TrustSource, text: &str) -> HostTrustStore {
        let mut entries = Vec::new();
        for (number, line) in text.lines().enumerate() {
            match TrustEntry::parse(line) {
                Some(Ok(entry)) => entries.push(entry),
                Some(Err(reason)) => warn!(%source, line = number + 1, %reason, "skipping malformed known hosts line"),
                None => {}
            }
        }
        HostTrustStore { source, entries }
    }

    pub fn source(&self) -> &TrustSource {
        &self.source
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lookup(&self, peer: &PeerAddress, key: &KeyData) -> HostLookup {
        let mut known_under_other_key = false;
        for entry in self.entries.iter().filter(|entry| entry.matches(peer)) {
            match entry.marker() {
                Some(Marker::Revoked) if entry.key() == key => return HostLookup::Revoked,
                Some(_) => {}
                None if entry.key() == key => return HostLookup::Trusted,
                None => known_under_other_key = true,
            }
        }
        if known_under_other_key {
            HostLookup::Changed
        } else {
            HostLookup::Unknown
        }
    }

    pub fn is_revoked(&self, peer: &PeerAddress, key: &KeyData) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.marker() == Some(Marker::Revoked) && entry.key() == key && entry.matches(peer))
    }

    /// SHA-256 fingerprints of the certificate authorities trusted for the peer.
    pub fn certificate_authorities(&self, peer: &PeerAddress) -> Vec<Fingerprint> {
        self.entries
            .iter()
            .filter(|entry| entry.marker() == Some(Marker::CertAuthority) && entry.matches(peer))
            .map(|entry| entry.key().fingerprint(HashAlg::Sha256))
            .collect()
    }

    /// Appends a trust entry for the peer to the backing file, creating the file
    /// and its parent directories when missing.
    ///
    /// Returns `false` when the source is not file backed.
    pub fn persist(&mut self, peer: &PeerAddress, key: &KeyData) -> Result<bool> {
        let entry = TrustEntry::new(peer, key);
        let Some(path) = self.source.path() else {
            debug!(source = %self.source, host = %peer, "trust source cannot be written, entry kept in memory");
            self.entries.push(entry);
            return Ok(false);
        };

        let line = entry.to_line().map_err(|reason| Error::Verification {
            host: peer.to_string(),
            reason: format!("could not encode host key: {reason}"),
        })?;
        append_line(path, &line).map_err(|err| load_error(&self.source, err))?;
        warn!(host = %peer, path = %path.display(), "added host key to known hosts file");
        self.entries.push(entry);
        Ok(true)
    }
}

fn append_line(path: &Path, line: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut options = fs::OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;

    // keep the new entry on its own line if the file lacks a trailing newline
    let needs_newline = match fs::read(path) {
        Ok(existing) => !existing.is_empty() && !existing.ends_with(b"\n"),
        Err(_) => false,
    };
    if needs_newline {
        file.write_all(b"\n")?;
    }
    writeln!(file, "{line}")
}

fn load_error(source: &TrustSource, err: io::Error) -> Error {
    Error::Configuration(format!("{source}: {err}"))
}
