use std::{borrow::Cow, fmt, str::FromStr};

use russh::{
    cipher, client, compression, kex,
    keys::ssh_key::{Algorithm, EcdsaCurve, HashAlg},
    Preferred,
};
use tracing::{debug, warn};

use crate::{
    config::EndpointConfiguration,
    error::{Error, Result},
};

/// Bytes transferred per request for each unit of the legacy `bulk_requests` setting.
pub const BULK_REQUEST_UNIT: usize = 32 * 1024;
/// Largest read/write buffer handed to the protocol client (126.5 KiB).
pub const MAX_BUFFER_SIZE: usize = 129_536;
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

macro_rules! algorithm_names {
    ($(#[$meta:meta])* $name:ident, $what:literal { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn name(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }

            /// Parses a comma-separated, ordered list of names.
            pub fn parse_list(list: &str) -> Result<Vec<$name>> {
                parse_list(list)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<$name> {
                match s.trim() {
                    $($text => Ok($name::$variant),)+
                    other => Err(Error::configuration(format!("unknown {} {other:?}", $what))),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.name())
            }
        }
    };
}

algorithm_names!(
    /// Symmetric ciphers the transport can negotiate.
    Cipher, "cipher" {
        Chacha20Poly1305 => "chacha20-poly1305@openssh.com",
        Aes256Gcm => "aes256-gcm@openssh.com",
        Aes256Ctr => "aes256-ctr",
        Aes192Ctr => "aes192-ctr",
        Aes128Ctr => "aes128-ctr",
    }
);

algorithm_names!(
    KeyExchange, "key exchange algorithm" {
        Curve25519Sha256 => "curve25519-sha256",
        Curve25519Sha256Libssh => "curve25519-sha256@libssh.org",
        EcdhNistp256 => "ecdh-sha2-nistp256",
        EcdhNistp384 => "ecdh-sha2-nistp384",
        EcdhNistp521 => "ecdh-sha2-nistp521",
        DhGroup16Sha512 => "diffie-hellman-group16-sha512",
        DhGroup14Sha256 => "diffie-hellman-group14-sha256",
        DhGroup14Sha1 => "diffie-hellman-group14-sha1",
        DhGroup1Sha1 => "diffie-hellman-group1-sha1",
    }
);

algorithm_names!(
    /// Public key signature algorithms, used both for the server host key
    /// allow-list and for the client's accepted authentication algorithms.
    KeyAlgorithm, "key algorithm" {
        Ed25519 => "ssh-ed25519",
        EcdsaNistp256 => "ecdsa-sha2-nistp256",
        EcdsaNistp384 => "ecdsa-sha2-nistp384",
        EcdsaNistp521 => "ecdsa-sha2-nistp521",
        RsaSha512 => "rsa-sha2-512",
        RsaSha256 => "rsa-sha2-256",
        Rsa => "ssh-rsa",
    }
);

fn parse_list<T>(list: &str) -> Result<Vec<T>>
where
    T: FromStr<Err = Error>,
{
    list.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::parse)
        .collect()
}

impl Cipher {
    fn transport_name(&self) -> cipher::Name {
        match self {
            Cipher::Chacha20Poly1305 => cipher::CHACHA20_POLY1305,
            Cipher::Aes256Gcm => cipher::AES_256_GCM,
            Cipher::Aes256Ctr => cipher::AES_256_CTR,
            Cipher::Aes192Ctr => cipher::AES_192_CTR,
            Cipher::Aes128Ctr => cipher::AES_128_CTR,
        }
    }
}

impl KeyExchange {
    fn transport_name(&self) -> kex::Name {
        match self {
            KeyExchange::Curve25519Sha256 => kex::CURVE25519,
            KeyExchange::Curve25519Sha256Libssh => kex::CURVE25519_PRE_RFC_8731,
            KeyExchange::EcdhNistp256 => kex::ECDH_SHA2_NISTP256,
            KeyExchange::EcdhNistp384 => kex::ECDH_SHA2_NISTP384,
            KeyExchange::EcdhNistp521 => kex::ECDH_SHA2_NISTP521,
            KeyExchange::DhGroup16Sha512 => kex::DH_G16_SHA512,
            KeyExchange::DhGroup14Sha256 => kex::DH_G14_SHA256,
            KeyExchange::DhGroup14Sha1 => kex::DH_G14_SHA1,
            KeyExchange::DhGroup1Sha1 => kex::DH_G1_SHA1,
        }
    }
}

impl KeyAlgorithm {
    pub fn algorithm(&self) -> Algorithm {
        match self {
            KeyAlgorithm::Ed25519 => Algorithm::Ed25519,
            KeyAlgorithm::EcdsaNistp256 => Algorithm::Ecdsa {
                curve: EcdsaCurve::NistP256,
            },
            KeyAlgorithm::EcdsaNistp384 => Algorithm::Ecdsa {
                curve: EcdsaCurve::NistP384,
            },
            KeyAlgorithm::EcdsaNistp521 => Algorithm::Ecdsa {
                curve: EcdsaCurve::NistP521,
            },
            KeyAlgorithm::RsaSha512 => Algorithm::Rsa {
                hash: Some(HashAlg::Sha512),
            },
            KeyAlgorithm::RsaSha256 => Algorithm::Rsa {
                hash: Some(HashAlg::Sha256),
            },
            KeyAlgorithm::Rsa => Algorithm::Rsa { hash: None },
        }
    }

    /// Whether a key of the given algorithm can sign with this signature algorithm.
    pub fn accepts(&self, key: &Algorithm) -> bool {
        match (self.algorithm(), key) {
            (Algorithm::Rsa { .. }, Algorithm::Rsa { .. }) => true,
            (own, key) => &own == key,
        }
    }

    /// Hash used for an RSA signature, `None` for every other family.
    pub fn rsa_hash(&self) -> Option<Option<HashAlg>> {
        match self {
            KeyAlgorithm::RsaSha512 => Some(Some(HashAlg::Sha512)),
            KeyAlgorithm::RsaSha256 => Some(Some(HashAlg::Sha256)),
            KeyAlgorithm::Rsa => Some(None),
            _ => None,
        }
    }
}

/// Builds the transport client configuration from the endpoint's algorithm,
/// compression and heartbeat preferences.
///
/// Empty allow-lists keep the transport's own defaults.
pub fn negotiate(config: &EndpointConfiguration) -> Result<client::Config> {
    let mut preferred = Preferred::default();

    if !config.ciphers.is_empty() {
        preferred.cipher = Cow::Owned(config.ciphers.iter().map(Cipher::transport_name).collect());
    }

    if !config.key_exchange_protocols.is_empty() {
        let mut names: Vec<kex::Name> = config
            .key_exchange_protocols
            .iter()
            .map(KeyExchange::transport_name)
            .collect();
        // pseudo-algorithms advertising client extensions
        names.push(kex::EXTENSION_SUPPORT_AS_CLIENT);
        names.push(kex::EXTENSION_OPENSSH_STRICT_KEX_AS_CLIENT);
        preferred.kex = Cow::Owned(names);
    }

    if !config.server_host_keys.is_empty() {
        preferred.key = Cow::Owned(config.server_host_keys.iter().map(KeyAlgorithm::algorithm).collect());
    }

    if config.compression > 10 {
        return Err(Error::configuration(format!(
            "compression level {} is outside 0-10",
            config.compression
        )));
    }
    preferred.compression = if config.compression > 0 {
        Cow::Owned(vec![compression::ZLIB_LEGACY, compression::ZLIB, compression::NONE])
    } else {
        Cow::Owned(vec![compression::NONE])
    };

    let mut client_config = client::Config {
        preferred,
        ..Default::default()
    };

    if !config.server_alive_interval.is_zero() {
        client_config.keepalive_interval = Some(config.server_alive_interval);
        client_config.keepalive_max = config.server_alive_count_max;
    }

    debug!(
        host = %config.host,
        ciphers = config.ciphers.len(),
        kex = config.key_exchange_protocols.len(),
        host_keys = config.server_host_keys.len(),
        compression = config.compression,
        "negotiated transport preferences"
    );
    Ok(client_config)
}

/// Effective read and write buffer sizes of the protocol client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSizes {
    pub read: usize,
    pub write: usize,
}

impl Default for BufferSizes {
    fn default() -> BufferSizes {
        BufferSizes {
            read: DEFAULT_BUFFER_SIZE,
            write: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl BufferSizes {
    /// Explicit sizes win per direction; a direction without one falls back to
    /// `bulk_requests` units of 32 KiB, then to the default. Every result is
    /// capped at [`MAX_BUFFER_SIZE`].
    pub fn resolve(read: Option<usize>, write: Option<usize>, bulk_requests: Option<u32>) -> BufferSizes {
        let bulk = bulk_requests
            .filter(|count| *count > 0)
            .map(|count| (count as usize).saturating_mul(BULK_REQUEST_UNIT));
        if bulk.is_some() && (read.is_some() || write.is_some()) {
            debug!("explicit buffer sizes take precedence over bulk_requests");
        }

        BufferSizes {
            read: clamp("read", read.filter(|size| *size > 0).or(bulk).unwrap_or(DEFAULT_BUFFER_SIZE)),
            write: clamp("write", write.filter(|size| *size > 0).or(bulk).unwrap_or(DEFAULT_BUFFER_SIZE)),
        }
    }

    pub fn from_config(config: &EndpointConfiguration) -> BufferSizes {
        BufferSizes::resolve(config.read_buffer_size, config.write_buffer_size, config.bulk_requests)
    }
}

fn clamp(direction: &'static str, size: usize) -> usize {
    if size > MAX_BUFFER_SIZE {
        warn!(direction, requested = size, max = MAX_BUFFER_SIZE, "buffer size capped");
        MAX_BUFFER_SIZE
    } else {
        size
    }
}
