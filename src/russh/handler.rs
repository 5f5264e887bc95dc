use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use russh::{client, keys::ssh_key::PublicKey, ChannelId};
use tracing::{debug, error};

use crate::{
    error::Error,
    known_hosts::{HostIdentityVerifier, PeerAddress, PresentedHostKey},
};

/// Client handler that runs host identity verification during the handshake.
/// Also flags when the server closes a channel, the SFTP channel being the
/// only one opened.
pub struct VerifyingHandler {
    verifier: Arc<HostIdentityVerifier>,
    peer: PeerAddress,
    channel_closed: Arc<AtomicBool>,
}

impl VerifyingHandler {
    pub fn new(
        verifier: Arc<HostIdentityVerifier>,
        peer: PeerAddress,
        channel_closed: Arc<AtomicBool>,
    ) -> VerifyingHandler {
        VerifyingHandler {
            verifier,
            peer,
            channel_closed,
        }
    }
}

impl client::Handler for VerifyingHandler {
    type Error = Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        let verifier = self.verifier.clone();
        let peer = self.peer.clone();
        let presented = PresentedHostKey::Key(server_public_key.clone());
        // loading and appending to known hosts files blocks
        let verified = tokio::task::spawn_blocking(move || verifier.verify(&peer, &presented))
            .await
            .unwrap_or_else(|err| {
                Err(Error::Verification {
                    host: self.peer.to_string(),
                    reason: format!("verification task failed: {err}"),
                })
            });
        match verified {
            Ok(()) => Ok(true),
            Err(err) => {
                error!(host = %self.peer, error = %err, "host key verification failed");
                Err(err)
            }
        }
    }

    async fn channel_close(&mut self, channel: ChannelId, _session: &mut client::Session) -> Result<(), Self::Error> {
        debug!(host = %self.peer, ?channel, "server closed channel");
        self.channel_closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use russh::client::Handler;

    use super::*;
    use crate::config::{EndpointConfiguration, StrictHostKeyChecking};

    const HOST_KEY: &str = include_str!("../../tests/fixtures/host_key.pub");

    fn handler(config: EndpointConfiguration) -> VerifyingHandler {
        let verifier = Arc::new(HostIdentityVerifier::new(Arc::new(config)));
        VerifyingHandler::new(verifier, PeerAddress::new("sftp.example.com", 22), Arc::default())
    }

    #[tokio::test]
    async fn unknown_host_is_recorded_off_the_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let known_hosts = dir.path().join("ssh").join("known_hosts");
        let mut config = EndpointConfiguration::new("sftp.example.com", "tester");
        config.use_user_known_hosts_file = false;
        config.known_hosts_file = Some(known_hosts.clone());
        config.auto_create_known_hosts_file = true;
        let mut handler = handler(config);

        let key = PublicKey::from_openssh(HOST_KEY.trim()).unwrap();
        assert!(handler.check_server_key(&key).await.unwrap());
        let recorded = std::fs::read_to_string(&known_hosts).unwrap();
        assert!(recorded.starts_with("sftp.example.com "), "{recorded}");
    }

    #[tokio::test]
    async fn strict_checking_without_trust_source_is_rejected() {
        let mut config = EndpointConfiguration::new("sftp.example.com", "tester");
        config.use_user_known_hosts_file = false;
        config.strict_host_key_checking = StrictHostKeyChecking::Yes;
        let mut handler = handler(config);

        let key = PublicKey::from_openssh(HOST_KEY.trim()).unwrap();
        let err = handler.check_server_key(&key).await.unwrap_err();
        assert!(matches!(err, Error::Verification { .. }));
    }
}
