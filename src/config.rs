use std::{
    fmt,
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use russh::keys::ssh_key::PrivateKey;

use crate::{
    algorithms::{Cipher, KeyAlgorithm, KeyExchange},
    error::{Error, Result},
    known_hosts::ServerKeyVerifier,
    resource::{DefaultResourceResolver, ResourceResolver},
};

/// What to do with hosts that have no entry in the trust store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StrictHostKeyChecking {
    /// Reject unknown hosts.
    Yes,
    /// Accept unknown hosts with a warning. When no trust source is configured
    /// at all, every host key is accepted.
    #[default]
    No,
}

impl FromStr for StrictHostKeyChecking {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "yes" | "true" => Ok(StrictHostKeyChecking::Yes),
            "no" | "false" => Ok(StrictHostKeyChecking::No),
            other => Err(Error::configuration(format!(
                "strict host key checking must be yes or no, got {other:?}"
            ))),
        }
    }
}

impl StrictHostKeyChecking {
    pub fn is_strict(&self) -> bool {
        matches!(self, StrictHostKeyChecking::Yes)
    }
}

/// Handling of a file that already exists at the target of a store.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ExistingFilePolicy {
    #[default]
    Override,
    /// Leave the existing file and skip the write.
    Ignore,
    Fail,
    /// Rename the existing file to the target before writing. `{name}` in the
    /// target expands to the file name; relative targets resolve against the
    /// file's directory.
    Move(String),
    Append,
}

/// How downloaded content is handed to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RetrieveMode {
    /// An open remote reader, released by the caller.
    Stream,
    #[default]
    Memory,
    /// Staged in the directory through a `.inprogress` file.
    LocalDirectory(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilenameEncoding {
    #[default]
    Utf8,
}

impl FromStr for FilenameEncoding {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().replace('_', "-").as_str() {
            "UTF-8" | "UTF8" => Ok(FilenameEncoding::Utf8),
            _ => Err(Error::configuration(format!(
                "unsupported filename encoding {s:?}, only UTF-8 is available"
            ))),
        }
    }
}

pub struct EndpointConfiguration {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub connect_timeout: Duration,
    /// Attempts made after the first failed one.
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,

    pub known_hosts: Option<Vec<u8>>,
    pub known_hosts_uri: Option<String>,
    pub known_hosts_file: Option<PathBuf>,
    pub use_user_known_hosts_file: bool,
    pub strict_host_key_checking: StrictHostKeyChecking,
    pub auto_create_known_hosts_file: bool,
    pub server_key_verifier: Option<Arc<dyn ServerKeyVerifier>>,

    pub key_pair: Option<Arc<PrivateKey>>,
    pub private_key: Option<Vec<u8>>,
    pub private_key_file: Option<PathBuf>,
    pub private_key_uri: Option<String>,
    pub private_key_passphrase: Option<String>,
    pub cert_bytes: Option<Vec<u8>>,
    pub cert_file: Option<PathBuf>,
    pub cert_uri: Option<String>,

    /// Zero disables heartbeats.
    pub server_alive_interval: Duration,
    pub server_alive_count_max: usize,
    /// 0 disables compression, 1-10 enables it.
    pub compression: u8,
    pub ciphers: Vec<Cipher>,
    pub key_exchange_protocols: Vec<KeyExchange>,
    pub server_host_keys: Vec<KeyAlgorithm>,
    pub public_key_accepted_algorithms: Vec<KeyAlgorithm>,
    pub bind_address: Option<String>,
    pub read_buffer_size: Option<usize>,
    pub write_buffer_size: Option<usize>,
    /// Deprecated, superseded by the explicit buffer sizes.
    pub bulk_requests: Option<u32>,

    pub chmod: Option<String>,
    pub chmod_directory: Option<String>,
    pub filename_encoding: Option<String>,
    pub stepwise: bool,
    pub auto_create: bool,
    pub existing_file_policy: ExistingFilePolicy,
    pub retrieve_mode: RetrieveMode,
    pub temp_prefix: Option<String>,
    pub resource_resolver: Arc<dyn ResourceResolver>,
}

impl Default for EndpointConfiguration {
    fn default() -> Self {
        EndpointConfiguration {
            host: String::new(),
            port: 22,
            username: String::new(),
            password: None,
            connect_timeout: Duration::from_secs(10),
            reconnect_attempts: 3,
            reconnect_delay: Duration::from_secs(1),
            known_hosts: None,
            known_hosts_uri: None,
            known_hosts_file: None,
            use_user_known_hosts_file: true,
            strict_host_key_checking: StrictHostKeyChecking::No,
            auto_create_known_hosts_file: false,
            server_key_verifier: None,
            key_pair: None,
            private_key: None,
            private_key_file: None,
            private_key_uri: None,
            private_key_passphrase: None,
            cert_bytes: None,
            cert_file: None,
            cert_uri: None,
            server_alive_interval: Duration::ZERO,
            server_alive_count_max: 1,
            compression: 0,
            ciphers: Vec::new(),
            key_exchange_protocols: Vec::new(),
            server_host_keys: Vec::new(),
            public_key_accepted_algorithms: Vec::new(),
            bind_address: None,
            read_buffer_size: None,
            write_buffer_size: None,
            bulk_requests: None,
            chmod: None,
            chmod_directory: None,
            filename_encoding: None,
            stepwise: true,
            auto_create: true,
            existing_file_policy: ExistingFilePolicy::Override,
            retrieve_mode: RetrieveMode::Memory,
            temp_prefix: None,
            resource_resolver: Arc::new(DefaultResourceResolver::new()),
        }
    }
}

impl EndpointConfiguration {
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> EndpointConfiguration {
        EndpointConfiguration {
            host: host.into(),
            username: username.into(),
            ..Default::default()
        }
    }

    /// Checks every setting that can be rejected without touching the network.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::configuration("host must not be empty"));
        }
        if self.username.trim().is_empty() {
            return Err(Error::configuration("username must not be empty"));
        }
        if self.compression > 10 {
            return Err(Error::configuration(format!(
                "compression level {} is outside 0-10",
                self.compression
            )));
        }
        if let Some(chmod) = &self.chmod {
            parse_permissions(chmod)?;
        }
        if let Some(chmod) = &self.chmod_directory {
            parse_permissions(chmod)?;
        }
        if let Some(encoding) = &self.filename_encoding {
            encoding.parse::<FilenameEncoding>()?;
        }
        self.bind_socket_address()?;
        if let ExistingFilePolicy::Move(target) = &self.existing_file_policy {
            if target.trim().is_empty() {
                return Err(Error::configuration("move policy needs a target"));
            }
        }
        if let Some(prefix) = &self.temp_prefix {
            if prefix.contains('/') {
                return Err(Error::configuration("temp prefix must not contain '/'"));
            }
        }
        Ok(())
    }

    pub fn bind_socket_address(&self) -> Result<Option<SocketAddr>> {
        match &self.bind_address {
            Some(address) if !address.trim().is_empty() => parse_bind_address(address).map(Some),
            _ => Ok(None),
        }
    }

    pub fn filename_encoding(&self) -> Result<FilenameEncoding> {
        match &self.filename_encoding {
            Some(encoding) => encoding.parse(),
            None => Ok(FilenameEncoding::Utf8),
        }
    }
}

impl fmt::Debug for EndpointConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn redacted<T>(value: &Option<T>) -> &'static str {
            match value {
                Some(_) => "<redacted>",
                None => "<none>",
            }
        }

        f.debug_struct("EndpointConfiguration")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &redacted(&self.password))
            .field("connect_timeout", &self.connect_timeout)
            .field("reconnect_attempts", &self.reconnect_attempts)
            .field("reconnect_delay", &self.reconnect_delay)
            .field("known_hosts", &self.known_hosts.as_ref().map(Vec::len))
            .field("known_hosts_uri", &self.known_hosts_uri)
            .field("known_hosts_file", &self.known_hosts_file)
            .field("use_user_known_hosts_file", &self.use_user_known_hosts_file)
            .field("strict_host_key_checking", &self.strict_host_key_checking)
            .field("auto_create_known_hosts_file", &self.auto_create_known_hosts_file)
            .field("server_key_verifier", &self.server_key_verifier.is_some())
            .field("key_pair", &redacted(&self.key_pair))
            .field("private_key", &redacted(&self.private_key))
            .field("private_key_file", &self.private_key_file)
            .field("private_key_uri", &self.private_key_uri)
            .field("private_key_passphrase", &redacted(&self.private_key_passphrase))
            .field("cert_file", &self.cert_file)
            .field("cert_uri", &self.cert_uri)
            .field("server_alive_interval", &self.server_alive_interval)
            .field("compression", &self.compression)
            .field("ciphers", &self.ciphers)
            .field("key_exchange_protocols", &self.key_exchange_protocols)
            .field("server_host_keys", &self.server_host_keys)
            .field("bind_address", &self.bind_address)
            .field("stepwise", &self.stepwise)
            .field("existing_file_policy", &self.existing_file_policy)
            .field("retrieve_mode", &self.retrieve_mode)
            .finish_non_exhaustive()
    }
}

/// Parses a three or four digit octal permission string such as `644` or `0755`.
pub fn parse_permissions(value: &str) -> Result<u32> {
    let value = value.trim();
    if !(3..=4).contains(&value.len()) || !value.chars().all(|c| c.is_digit(8)) {
        return Err(Error::configuration(format!(
            "permissions {value:?} must be 3 or 4 octal digits"
        )));
    }
    match u32::from_str_radix(value, 8) {
        Ok(mode) if mode <= 0o7777 => Ok(mode),
        _ => Err(Error::configuration(format!("permissions {value:?} are outside 0-7777"))),
    }
}

/// Accepts `ip`, `ip:port`, `[ipv6]`, `[ipv6]:port` and bare IPv6 literals.
pub fn parse_bind_address(value: &str) -> Result<SocketAddr> {
    let value = value.trim();
    let invalid = || Error::configuration(format!("invalid bind address {value:?}"));

    if let Some(rest) = value.strip_prefix('[') {
        let (ip, tail) = rest.split_once(']').ok_or_else(invalid)?;
        let ip: IpAddr = ip.parse().map_err(|_| invalid())?;
        let port = match tail {
            "" => 0,
            tail => tail
                .strip_prefix(':')
                .and_then(|port| port.parse().ok())
                .ok_or_else(invalid)?,
        };
        return Ok(SocketAddr::new(ip, port));
    }
    if let Ok(ip) = value.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, 0));
    }
    value.parse::<SocketAddr>().map_err(|_| invalid())
}
