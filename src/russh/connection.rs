use std::{
    future::Future,
    io,
    sync::{atomic::AtomicBool, Arc},
};

use async_trait::async_trait;
use russh::{
    client::{self, Handle},
    keys::{
        ssh_key::{Algorithm, HashAlg, PrivateKey},
        PrivateKeyWithHashAlg,
    },
};
use russh_sftp::client::SftpSession;
use tokio::net::{TcpSocket, TcpStream};
use tracing::{debug, info};

use super::{filesystem::sftp_error, RusshSession, VerifyingHandler};
use crate::{
    algorithms::{negotiate, BufferSizes},
    config::EndpointConfiguration,
    credentials::{AuthenticationIdentity, CredentialResolver},
    error::{Error, Result},
    known_hosts::{HostIdentityVerifier, PeerAddress},
    session::Connector,
};

/// What a connector keeps between attempts: the negotiated client
/// configuration and the verifier holding the loaded trust store.
#[derive(Clone)]
struct Transport {
    client_config: Arc<client::Config>,
    verifier: Arc<HostIdentityVerifier>,
}

/// Opens SFTP sessions over russh.
#[derive(Default)]
pub struct RusshConnector {
    transport: Option<Transport>,
}

impl RusshConnector {
    pub fn new() -> RusshConnector {
        RusshConnector::default()
    }

    fn transport(&mut self, config: &Arc<EndpointConfiguration>) -> Result<Transport> {
        if let Some(transport) = &self.transport {
            return Ok(transport.clone());
        }
        let transport = Transport {
            client_config: Arc::new(negotiate(config)?),
            verifier: Arc::new(HostIdentityVerifier::new(config.clone())),
        };
        self.transport = Some(transport.clone());
        Ok(transport)
    }
}

#[async_trait]
impl Connector for RusshConnector {
    type Session = RusshSession;

    async fn connect(&mut self, config: &Arc<EndpointConfiguration>) -> Result<RusshSession> {
        let transport = self.transport(config)?;
        let peer = PeerAddress::new(config.host.clone(), config.port);

        let stream = within(config, "tcp connect", open_socket(config)).await?;
        let channel_closed = Arc::new(AtomicBool::new(false));
        let handler = VerifyingHandler::new(transport.verifier.clone(), peer, channel_closed.clone());
        let mut handle = within(
            config,
            "ssh handshake",
            client::connect_stream(transport.client_config.clone(), stream, handler),
        )
        .await?;

        let identity = {
            let config = config.clone();
            tokio::task::spawn_blocking(move || CredentialResolver::resolve(&config))
                .await
                .map_err(|err| Error::configuration(format!("credential loading task failed: {err}")))??
        };
        within(config, "authentication", authenticate(&mut handle, config, identity)).await?;

        let sftp = within(config, "sftp subsystem", async {
            let channel = handle.channel_open_session().await?;
            channel.request_subsystem(true, "sftp").await?;
            let timeout = config.connect_timeout.as_secs().max(1);
            SftpSession::new_opts(channel.into_stream(), Some(timeout))
                .await
                .map_err(|err| network_error(config, sftp_error(err)))
        })
        .await?;

        let buffers = BufferSizes::from_config(config);
        debug!(read = buffers.read, write = buffers.write, "sftp buffer sizes");
        Ok(RusshSession {
            handle,
            sftp,
            buffers,
            channel_closed,
        })
    }

    fn reset(&mut self) {
        self.transport = None;
    }
}

async fn within<T, F>(config: &EndpointConfiguration, stage: &'static str, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(config.connect_timeout, future).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout {
            host: config.host.clone(),
            port: config.port,
            stage,
            after: config.connect_timeout,
        }),
    }
}

fn network_error(config: &EndpointConfiguration, source: io::Error) -> Error {
    Error::Network {
        host: config.host.clone(),
        port: config.port,
        source,
    }
}

async fn open_socket(config: &EndpointConfiguration) -> Result<TcpStream> {
    let bind = config.bind_socket_address()?;
    let addresses = tokio::net::lookup_host((config.host.as_str(), config.port))
        .await
        .map_err(|err| network_error(config, err))?;

    let mut last_error = None;
    for address in addresses {
        if let Some(bind) = bind {
            if bind.is_ipv4() != address.is_ipv4() {
                continue;
            }
        }
        let socket = match address {
            std::net::SocketAddr::V4(_) => TcpSocket::new_v4(),
            std::net::SocketAddr::V6(_) => TcpSocket::new_v6(),
        }
        .map_err(|err| network_error(config, err))?;
        if let Some(bind) = bind {
            socket.bind(bind).map_err(|err| network_error(config, err))?;
        }

        match socket.connect(address).await {
            Ok(stream) => {
                stream.set_nodelay(true).map_err(|err| network_error(config, err))?;
                debug!(%address, local = ?bind, "tcp connection established");
                return Ok(stream);
            }
            Err(err) => {
                debug!(%address, error = %err, "tcp connect failed");
                last_error = Some(err);
            }
        }
    }

    Err(network_error(
        config,
        last_error.unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no usable address")),
    ))
}

/// Tries the resolved identity first, then the password, and `none` when
/// neither is configured.
async fn authenticate(
    handle: &mut Handle<VerifyingHandler>,
    config: &EndpointConfiguration,
    identity: Option<AuthenticationIdentity>,
) -> Result<()> {
    let user = config.username.clone();
    let failed = |reason: &str| Error::Authentication {
        user: config.username.clone(),
        host: config.host.clone(),
        reason: reason.to_string(),
    };

    let had_identity = identity.is_some();
    if let Some(identity) = identity {
        let result = match identity.certificate {
            Some(certificate) => {
                handle
                    .authenticate_openssh_cert(user.clone(), identity.key.clone(), certificate)
                    .await?
            }
            None => {
                let hash = signature_hash(handle, config, &identity.key).await?;
                handle
                    .authenticate_publickey(user.clone(), PrivateKeyWithHashAlg::new(identity.key.clone(), hash))
                    .await?
            }
        };
        if result.success() {
            info!(user = %user, origin = %identity.origin, "authenticated with public key");
            return Ok(());
        }
        debug!(user = %user, origin = %identity.origin, "public key refused");
    }

    if let Some(password) = &config.password {
        if handle.authenticate_password(user.clone(), password).await?.success() {
            info!(user = %user, "authenticated with password");
            return Ok(());
        }
        return Err(failed("password rejected"));
    }

    if had_identity {
        return Err(failed("public key rejected"));
    }
    if handle.authenticate_none(user).await?.success() {
        return Ok(());
    }
    Err(failed("no credentials configured and the server requires authentication"))
}

/// Signature hash for the key, honouring the accepted algorithm list.
async fn signature_hash(
    handle: &Handle<VerifyingHandler>,
    config: &EndpointConfiguration,
    key: &PrivateKey,
) -> Result<Option<HashAlg>> {
    let algorithm = key.algorithm();
    if !config.public_key_accepted_algorithms.is_empty() {
        let accepted = config
            .public_key_accepted_algorithms
            .iter()
            .find(|accepted| accepted.accepts(&algorithm))
            .ok_or_else(|| {
                Error::configuration(format!(
                    "{} keys are not among the accepted public key algorithms",
                    algorithm.as_str()
                ))
            })?;
        return Ok(accepted.rsa_hash().flatten());
    }

    match algorithm {
        Algorithm::Rsa { .. } => Ok(handle.best_supported_rsa_hash().await?.flatten()),
        _ => Ok(None),
    }
}
