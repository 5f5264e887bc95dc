use std::{sync::Arc, time::Duration};

use common::test_config;
use sftp_endpoint::{
    config::StrictHostKeyChecking, filesystem::WriteMode, russh::RusshConnector, RetrievedFile, SessionManager,
    SessionStatus, TransferEngine,
};
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    ContainerAsync, GenericImage, ImageExt,
};
use uuid::Uuid;
mod common;

struct SftpServer {
    engine: TransferEngine<RusshConnector>,
    _container: ContainerAsync<GenericImage>,
}

impl SftpServer {
    async fn start() -> SftpServer {
        let container = GenericImage::new("atmoz/sftp", "alpine")
            .with_exposed_port(22.tcp())
            .with_wait_for(WaitFor::message_on_stderr("Server listening on"))
            .with_cmd(["tester:secret:::upload"])
            .start()
            .await
            .expect("Could not start SFTP container");
        let port = container
            .get_host_port_ipv4(22.tcp())
            .await
            .expect("Could not get SFTP container port corresponding to 22");
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut config = test_config();
        config.host = "127.0.0.1".into();
        config.port = port;
        config.password = Some("secret".into());
        config.strict_host_key_checking = StrictHostKeyChecking::No;
        config.write_buffer_size = Some(64 * 1024);
        let manager = SessionManager::new(Arc::new(config), RusshConnector::new()).expect("Invalid configuration");

        SftpServer {
            engine: TransferEngine::new(Arc::new(manager)),
            _container: container,
        }
    }
}

#[tokio::test]
#[ignore = "requires a docker daemon"]
async fn round_trip_against_openssh() {
    let server = SftpServer::start().await;
    let engine = &server.engine;
    let name = format!("{}.txt", Uuid::new_v4());
    let remote = format!("/upload/nested/{name}");

    engine
        .store(&remote, "hello over sftp".as_bytes(), WriteMode::Truncate)
        .await
        .expect("Store failed");
    assert_eq!(engine.manager().status().await, SessionStatus::Open);

    match engine.retrieve(&remote).await.expect("Retrieve failed") {
        RetrievedFile::Memory(bytes) => assert_eq!(&bytes[..], b"hello over sftp"),
        other => panic!("Unexpected retrieval {other:?}"),
    }

    engine.change_directory("/upload/nested").await.expect("Change directory failed");
    let names: Vec<_> = engine
        .list("")
        .await
        .expect("List failed")
        .into_iter()
        .map(|entry| entry.name)
        .collect();
    assert_eq!(names, vec![name.clone()]);

    engine.rename(&name, "renamed.txt").await.expect("Rename failed");
    assert!(engine.exists("renamed.txt").await.unwrap());
    engine.delete("renamed.txt").await.expect("Delete failed");
    assert!(!engine.exists("renamed.txt").await.unwrap());

    engine.manager().disconnect().await.expect("Disconnect failed");
}

#[tokio::test]
#[ignore = "requires a docker daemon"]
async fn wrong_password_fails_after_retries() {
    let server = SftpServer::start().await;
    let config = server.engine.manager().config();
    let mut wrong = test_config();
    wrong.host = config.host.clone();
    wrong.port = config.port;
    wrong.password = Some("not-the-password".into());
    wrong.reconnect_attempts = 1;

    let manager = SessionManager::new(Arc::new(wrong), RusshConnector::new()).unwrap();
    let err = manager.ensure_connected().await.unwrap_err();
    assert_eq!(err.kind(), sftp_endpoint::ErrorKind::Connection);
}
