use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
    time::{SystemTime, UNIX_EPOCH},
};

use once_cell::sync::OnceCell;
use russh::keys::ssh_key::{certificate::CertType, public::KeyData, Certificate, PublicKey};
use tracing::{debug, warn};

use super::{HostLookup, HostTrustStore};
use crate::{
    config::EndpointConfiguration,
    error::{Error, Result},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddress {
    pub host: String,
    pub port: u16,
}

impl PeerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> PeerAddress {
        PeerAddress {
            host: host.into(),
            port,
        }
    }

    /// The name used in known hosts files: `host`, or `[host]:port` off port 22.
    pub fn known_hosts_name(&self) -> String {
        if self.port == 22 {
            self.host.clone()
        } else {
            format!("[{}]:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// What the server presented as its identity.
#[derive(Debug, Clone)]
pub enum PresentedHostKey {
    Key(PublicKey),
    Certificate(Certificate),
}

impl PresentedHostKey {
    pub fn key_data(&self) -> &KeyData {
        match self {
            PresentedHostKey::Key(key) => key.key_data(),
            PresentedHostKey::Certificate(certificate) => certificate.public_key(),
        }
    }
}

/// Caller supplied host verification policy. When configured it is the only
/// check performed.
pub trait ServerKeyVerifier: Send + Sync {
    fn verify(&self, peer: &PeerAddress, presented: &PresentedHostKey) -> bool;
}

impl<F> ServerKeyVerifier for F
where
    F: Fn(&PeerAddress, &PresentedHostKey) -> bool + Send + Sync,
{
    fn verify(&self, peer: &PeerAddress, presented: &PresentedHostKey) -> bool {
        self(peer, presented)
    }
}

/// Decides whether a server identity is trusted.
///
/// The trust store is loaded on first use and kept for the lifetime of the
/// verifier, which the connector ties to its transport client.
pub struct HostIdentityVerifier {
    config: Arc<EndpointConfiguration>,
    store: OnceCell<Option<Mutex<HostTrustStore>>>,
}

impl HostIdentityVerifier {
    pub fn new(config: Arc<EndpointConfiguration>) -> HostIdentityVerifier {
        HostIdentityVerifier {
            config,
            store: OnceCell::new(),
        }
    }

    pub fn verify(&self, peer: &PeerAddress, presented: &PresentedHostKey) -> Result<()> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or_default();
        self.verify_at(peer, presented, now)
    }

    /// Same as [`verify`](Self::verify) with an explicit Unix time for the
    /// certificate validity checks.
    pub fn verify_at(&self, peer: &PeerAddress, presented: &PresentedHostKey, now: u64) -> Result<()> {
        let reject = |reason: String| Error::Verification {
            host: peer.to_string(),
            reason,
        };

        if let Some(custom) = &self.config.server_key_verifier {
            debug!(host = %peer, "delegating host verification to custom verifier");
            return match custom.verify(peer, presented) {
                true => Ok(()),
                false => Err(reject("rejected by the configured server key verifier".into())),
            };
        }

        if let PresentedHostKey::Certificate(certificate) = presented {
            check_certificate_claims(certificate, peer, now).map_err(reject)?;
        }

        let strict = self.config.strict_host_key_checking.is_strict();
        let Some(store) = self.store()? else {
            if strict {
                return Err(reject(
                    "strict host key checking is enabled but no known hosts source is configured".into(),
                ));
            }
            warn!(host = %peer, "no known hosts source configured, accepting host key without verification");
            return Ok(());
        };
        let mut store = store.lock().unwrap_or_else(PoisonError::into_inner);

        let lookup = match presented {
            PresentedHostKey::Key(key) => store.lookup(peer, key.key_data()),
            PresentedHostKey::Certificate(certificate) => {
                if store.is_revoked(peer, certificate.signature_key()) {
                    return Err(reject("certificate authority key is revoked".into()));
                }
                let authorities = store.certificate_authorities(peer);
                if authorities.is_empty() {
                    store.lookup(peer, certificate.public_key())
                } else {
                    return match certificate.validate_at(now, authorities.iter()) {
                        Ok(()) if !store.is_revoked(peer, certificate.public_key()) => {
                            debug!(host = %peer, key_id = certificate.key_id(), "host certificate signed by trusted authority");
                            Ok(())
                        }
                        Ok(()) => Err(reject("host key is revoked".into())),
                        Err(err) => Err(reject(format!(
                            "certificate is not signed by a trusted authority: {err}"
                        ))),
                    };
                }
            }
        };

        match lookup {
            HostLookup::Trusted => {
                debug!(host = %peer, source = %store.source(), "host key trusted");
                Ok(())
            }
            HostLookup::Revoked => Err(reject("host key is revoked".into())),
            HostLookup::Changed => Err(reject(format!(
                "host key does not match the one recorded in {}, possible man-in-the-middle attack",
                store.source()
            ))),
            HostLookup::Unknown if strict => Err(reject(format!(
                "host is not listed in {} and strict host key checking is enabled",
                store.source()
            ))),
            HostLookup::Unknown => {
                warn!(host = %peer, source = %store.source(), "accepting unknown host key");
                if self.config.auto_create_known_hosts_file {
                    store.persist(peer, presented.key_data())?;
                }
                Ok(())
            }
        }
    }

    fn store(&self) -> Result<Option<&Mutex<HostTrustStore>>> {
        let store = self
            .store
            .get_or_try_init(|| HostTrustStore::load(&self.config).map(|store| store.map(Mutex::new)))?;
        Ok(store.as_ref())
    }
}

/// Checks the claims of a host certificate independent of who signed it: type,
/// validity window and principals.
pub fn check_certificate_claims(
    certificate: &Certificate,
    peer: &PeerAddress,
    now: u64,
) -> std::result::Result<(), String> {
    if certificate.cert_type() != CertType::Host {
        return Err(format!(
            "certificate type is {:?}, expected a host certificate",
            certificate.cert_type()
        ));
    }
    if now < certificate.valid_after() || now >= certificate.valid_before() {
        return Err(format!(
            "certificate is outside its validity window ({} to {})",
            certificate.valid_after(),
            certificate.valid_before()
        ));
    }

    let principals = certificate.valid_principals();
    if principals.is_empty() || principals.iter().any(|principal| principal_matches(principal, peer)) {
        Ok(())
    } else {
        Err(format!(
            "hostname {} does not match certificate principals {:?}",
            peer.host, principals
        ))
    }
}

fn principal_matches(principal: &str, peer: &PeerAddress) -> bool {
    let host = peer.host.to_ascii_lowercase();
    let principal = principal.to_ascii_lowercase();
    if principal == host || principal == format!("[{}]:{}", host, peer.port) {
        return true;
    }
    match principal.strip_prefix('*') {
        Some(suffix) if suffix.starts_with('.') => host.len() > suffix.len() && host.ends_with(suffix),
        _ => false,
    }
}
