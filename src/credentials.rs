use std::{fmt, path::PathBuf, sync::Arc};

use russh::keys::{
    decode_secret_key, load_secret_key,
    ssh_key::{self, Certificate, PrivateKey},
};
use tracing::debug;

use crate::{
    config::EndpointConfiguration,
    error::{Error, Result},
};

/// Where the private key of an identity came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyOrigin {
    KeyPair,
    Bytes,
    File(PathBuf),
    Uri(String),
}

impl fmt::Display for KeyOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyOrigin::KeyPair => f.write_str("supplied key pair"),
            KeyOrigin::Bytes => f.write_str("private key bytes"),
            KeyOrigin::File(path) => write!(f, "private key file {}", path.display()),
            KeyOrigin::Uri(uri) => write!(f, "private key resource {uri}"),
        }
    }
}

/// A private key, optionally paired with a certificate issued for it.
#[derive(Clone)]
pub struct AuthenticationIdentity {
    pub key: Arc<PrivateKey>,
    pub certificate: Option<Certificate>,
    pub origin: KeyOrigin,
}

impl fmt::Debug for AuthenticationIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthenticationIdentity")
            .field("algorithm", &self.key.algorithm())
            .field("certificate", &self.certificate.as_ref().map(Certificate::key_id))
            .field("origin", &self.origin)
            .finish()
    }
}

type KeyLoader = fn(&EndpointConfiguration) -> Option<Result<(Arc<PrivateKey>, KeyOrigin)>>;
type CertificateLoader = fn(&EndpointConfiguration) -> Option<Result<Certificate>>;

/// Identity sources in priority order, the first configured one wins. Empty
/// values count as not configured.
const KEY_LOADERS: [KeyLoader; 4] = [key_from_pair, key_from_bytes, key_from_file, key_from_uri];
const CERTIFICATE_LOADERS: [CertificateLoader; 3] = [cert_from_bytes, cert_from_file, cert_from_uri];

pub struct CredentialResolver;

impl CredentialResolver {
    /// Produces the identity for one connection attempt, or `None` when no key
    /// source is configured.
    pub fn resolve(config: &EndpointConfiguration) -> Result<Option<AuthenticationIdentity>> {
        let key = first_present(&KEY_LOADERS, config).transpose()?;
        let certificate = first_present(&CERTIFICATE_LOADERS, config).transpose()?;

        match (key, certificate) {
            (None, None) => Ok(None),
            (None, Some(_)) => Err(Error::configuration(
                "a certificate is configured but no private key could be resolved",
            )),
            (Some((key, origin)), certificate) => {
                if let Some(certificate) = &certificate {
                    if certificate.public_key() != key.public_key().key_data() {
                        return Err(Error::configuration(format!(
                            "certificate {:?} was not issued for the key from {origin}",
                            certificate.key_id()
                        )));
                    }
                }
                debug!(%origin, certificate = certificate.is_some(), "resolved authentication identity");
                Ok(Some(AuthenticationIdentity {
                    key,
                    certificate,
                    origin,
                }))
            }
        }
    }
}

fn first_present<T>(
    loaders: &[fn(&EndpointConfiguration) -> Option<Result<T>>],
    config: &EndpointConfiguration,
) -> Option<Result<T>> {
    loaders.iter().find_map(|loader| loader(config))
}

fn key_from_pair(config: &EndpointConfiguration) -> Option<Result<(Arc<PrivateKey>, KeyOrigin)>> {
    config
        .key_pair
        .as_ref()
        .map(|key| Ok((key.clone(), KeyOrigin::KeyPair)))
}

fn key_from_bytes(config: &EndpointConfiguration) -> Option<Result<(Arc<PrivateKey>, KeyOrigin)>> {
    let bytes = config.private_key.as_ref().filter(|bytes| !bytes.is_empty())?;
    Some(decode_key(bytes, config, KeyOrigin::Bytes))
}

fn key_from_file(config: &EndpointConfiguration) -> Option<Result<(Arc<PrivateKey>, KeyOrigin)>> {
    let path = config.private_key_file.as_ref().filter(|path| !path.as_os_str().is_empty())?;
    let origin = KeyOrigin::File(path.clone());
    Some(
        match load_secret_key(path, passphrase(config)) {
            Ok(key) => Ok((Arc::new(key), origin)),
            Err(err) => Err(decoding_error(&origin, err.to_string())),
        },
    )
}

fn key_from_uri(config: &EndpointConfiguration) -> Option<Result<(Arc<PrivateKey>, KeyOrigin)>> {
    let uri = config.private_key_uri.as_ref().filter(|uri| !uri.trim().is_empty())?;
    let origin = KeyOrigin::Uri(uri.clone());
    Some(match config.resource_resolver.resolve(uri) {
        Ok(bytes) => decode_key(&bytes, config, origin),
        Err(err) => Err(decoding_error(&origin, err.to_string())),
    })
}

fn decode_key(
    bytes: &[u8],
    config: &EndpointConfiguration,
    origin: KeyOrigin,
) -> Result<(Arc<PrivateKey>, KeyOrigin)> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| decoding_error(&origin, "key material is not valid UTF-8 text".into()))?;
    match decode_secret_key(text, passphrase(config)) {
        Ok(key) => Ok((Arc::new(key), origin)),
        Err(err) => Err(decoding_error(&origin, err.to_string())),
    }
}

fn cert_from_bytes(config: &EndpointConfiguration) -> Option<Result<Certificate>> {
    let bytes = config.cert_bytes.as_ref().filter(|bytes| !bytes.is_empty())?;
    Some(decode_certificate(bytes, "certificate bytes".into()))
}

fn cert_from_file(config: &EndpointConfiguration) -> Option<Result<Certificate>> {
    let path = config.cert_file.as_ref().filter(|path| !path.as_os_str().is_empty())?;
    let origin = format!("certificate file {}", path.display());
    Some(match std::fs::read(path) {
        Ok(bytes) => decode_certificate(&bytes, origin),
        Err(err) => Err(Error::KeyDecoding {
            origin,
            message: err.to_string(),
            hint: None,
        }),
    })
}

fn cert_from_uri(config: &EndpointConfiguration) -> Option<Result<Certificate>> {
    let uri = config.cert_uri.as_ref().filter(|uri| !uri.trim().is_empty())?;
    let origin = format!("certificate resource {uri}");
    Some(match config.resource_resolver.resolve(uri) {
        Ok(bytes) => decode_certificate(&bytes, origin),
        Err(err) => Err(Error::KeyDecoding {
            origin,
            message: err.to_string(),
            hint: None,
        }),
    })
}

fn passphrase(config: &EndpointConfiguration) -> Option<&str> {
    config.private_key_passphrase.as_deref().filter(|passphrase| !passphrase.is_empty())
}

fn decode_certificate(bytes: &[u8], origin: String) -> Result<Certificate> {
    let parsed = std::str::from_utf8(bytes)
        .map_err(|err| err.to_string())
        .and_then(|text| Certificate::from_openssh(text.trim()).map_err(certificate_error));
    parsed.map_err(|message| Error::KeyDecoding {
        origin,
        message,
        hint: None,
    })
}

fn certificate_error(err: ssh_key::Error) -> String {
    match err {
        // validity bounds are limited to i64::MAX seconds, so "forever" does not decode
        ssh_key::Error::Time => "certificate validity is outside the supported time range, \
                                 issue it with a bounded validity period (ssh-keygen -V)"
            .to_string(),
        other => other.to_string(),
    }
}

fn decoding_error(origin: &KeyOrigin, message: String) -> Error {
    let hint = passphrase_hint(&message);
    Error::KeyDecoding {
        origin: origin.to_string(),
        message,
        hint,
    }
}

fn passphrase_hint(message: &str) -> Option<&'static str> {
    let lower = message.to_ascii_lowercase();
    ["crypt", "passphrase", "password"]
        .iter()
        .any(|needle| lower.contains(needle))
        .then_some("check the private key passphrase")
}
