use std::{
    io,
    os::unix::fs::PermissionsExt,
    pin::Pin,
    task::{Context, Poll},
};

use common::{test_config, LocalEndpoint};
use sftp_endpoint::{
    config::{ExistingFilePolicy, RetrieveMode},
    filesystem::WriteMode,
    Error, ErrorKind, RetrievedFile, SessionStatus,
};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
mod common;

/// Hands out some bytes, then fails the way a truncated local file does.
struct TruncatedSource {
    sent: bool,
}

impl AsyncRead for TruncatedSource {
    fn poll_read(mut self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        if self.sent {
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::UnexpectedEof, "source truncated")));
        }
        self.sent = true;
        buf.put_slice(b"partial");
        Poll::Ready(Ok(()))
    }
}

fn endpoint_with(configure: impl FnOnce(&mut sftp_endpoint::EndpointConfiguration)) -> LocalEndpoint {
    let mut config = test_config();
    configure(&mut config);
    LocalEndpoint::with_config(config)
}

#[tokio::test]
async fn store_then_retrieve_into_memory() {
    let endpoint = LocalEndpoint::new();
    let stored = endpoint
        .engine
        .store("/upload/report.csv", "a,b\n1,2\n".as_bytes(), WriteMode::Truncate)
        .await
        .expect("Store failed");
    assert!(stored);
    assert_eq!(endpoint.read("upload/report.csv"), "a,b\n1,2\n");

    match endpoint.engine.retrieve("/upload/report.csv").await.expect("Retrieve failed") {
        RetrievedFile::Memory(bytes) => assert_eq!(&bytes[..], b"a,b\n1,2\n"),
        other => panic!("Unexpected retrieval {other:?}"),
    }
}

#[tokio::test]
async fn store_without_auto_create_needs_the_parent() {
    let endpoint = endpoint_with(|config| config.auto_create = false);
    let err = endpoint
        .engine
        .store("/missing/file.txt", "x".as_bytes(), WriteMode::Truncate)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Operation);
}

#[tokio::test]
async fn ignore_policy_skips_existing_files() {
    let endpoint = endpoint_with(|config| config.existing_file_policy = ExistingFilePolicy::Ignore);
    endpoint.write("data.txt", "original");

    let stored = endpoint
        .engine
        .store("/data.txt", "replacement".as_bytes(), WriteMode::Truncate)
        .await
        .unwrap();
    assert!(!stored);
    assert_eq!(endpoint.read("data.txt"), "original");
}

#[tokio::test]
async fn fail_policy_reports_existing_files() {
    let endpoint = endpoint_with(|config| config.existing_file_policy = ExistingFilePolicy::Fail);
    endpoint.write("data.txt", "original");

    let err = endpoint
        .engine
        .store("/data.txt", "replacement".as_bytes(), WriteMode::Truncate)
        .await
        .unwrap_err();
    match err {
        Error::Operation { operation, path, source } => {
            assert_eq!(operation, "store");
            assert_eq!(path, "/data.txt");
            assert_eq!(source.kind(), std::io::ErrorKind::AlreadyExists);
        }
        other => panic!("Unexpected error {other:?}"),
    }
    assert_eq!(endpoint.read("data.txt"), "original");
}

#[tokio::test]
async fn move_policy_keeps_the_previous_file() {
    let endpoint = endpoint_with(|config| {
        config.existing_file_policy = ExistingFilePolicy::Move("{name}.old".into());
    });
    endpoint.write("in/data.txt", "first");
    endpoint.write("in/data.txt.old", "stale");

    endpoint
        .engine
        .store("/in/data.txt", "second".as_bytes(), WriteMode::Truncate)
        .await
        .unwrap();
    assert_eq!(endpoint.read("in/data.txt"), "second");
    assert_eq!(endpoint.read("in/data.txt.old"), "first");
}

#[tokio::test]
async fn append_policy_and_mode_extend_files() {
    let endpoint = endpoint_with(|config| config.existing_file_policy = ExistingFilePolicy::Append);
    endpoint.write("log.txt", "one;");

    endpoint
        .engine
        .store("/log.txt", "two;".as_bytes(), WriteMode::Truncate)
        .await
        .unwrap();
    assert_eq!(endpoint.read("log.txt"), "one;two;");

    let plain = LocalEndpoint::new();
    plain.write("log.txt", "one;");
    plain
        .engine
        .store("/log.txt", "two;".as_bytes(), WriteMode::Append)
        .await
        .unwrap();
    assert_eq!(plain.read("log.txt"), "one;two;");
}

#[tokio::test]
async fn temp_prefix_upload_is_renamed_into_place() {
    let endpoint = endpoint_with(|config| config.temp_prefix = Some(".part-".into()));
    endpoint.write("out/result.bin", "old");

    endpoint
        .engine
        .store("/out/result.bin", "new".as_bytes(), WriteMode::Truncate)
        .await
        .unwrap();
    assert_eq!(endpoint.read("out/result.bin"), "new");
    assert!(!endpoint.local("out/.part-result.bin").exists());
}

#[tokio::test]
async fn failing_source_keeps_the_session() {
    let endpoint = LocalEndpoint::new();
    endpoint.engine.list("/").await.unwrap();

    let err = endpoint
        .engine
        .store("/x.txt", TruncatedSource { sent: false }, WriteMode::Truncate)
        .await
        .unwrap_err();
    match err {
        Error::Operation { operation, source, .. } => {
            assert_eq!(operation, "store");
            assert_eq!(source.kind(), io::ErrorKind::UnexpectedEof);
        }
        other => panic!("Unexpected error {other:?}"),
    }
    assert_eq!(endpoint.engine.manager().status().await, SessionStatus::Open);

    endpoint.engine.list("/").await.unwrap();
    assert_eq!(endpoint.link.connects(), 1);
}

#[tokio::test]
async fn failed_temp_upload_is_removed() {
    let endpoint = endpoint_with(|config| config.temp_prefix = Some(".part-".into()));
    endpoint.write("out/y.txt", "old");

    endpoint
        .engine
        .store("/out/y.txt", TruncatedSource { sent: false }, WriteMode::Truncate)
        .await
        .unwrap_err();
    assert!(!endpoint.local("out/.part-y.txt").exists());
    assert_eq!(endpoint.read("out/y.txt"), "old");
}

#[tokio::test]
async fn chmod_is_applied_after_store() {
    let endpoint = endpoint_with(|config| config.chmod = Some("640".into()));
    endpoint
        .engine
        .store("/secret.txt", "x".as_bytes(), WriteMode::Truncate)
        .await
        .unwrap();

    let mode = std::fs::metadata(endpoint.local("secret.txt")).unwrap().permissions().mode();
    assert_eq!(mode & 0o7777, 0o640);
    let attributes = endpoint.engine.stat("/secret.txt").await.unwrap();
    assert_eq!(attributes.permissions, Some(0o640));
    assert!(attributes.is_file());
}

#[tokio::test]
async fn stream_retrieval_reads_lazily() {
    let endpoint = endpoint_with(|config| config.retrieve_mode = RetrieveMode::Stream);
    endpoint.write("big.txt", "streamed content");

    let retrieved = endpoint.engine.retrieve("big.txt").await.unwrap();
    let RetrievedFile::Stream(mut reader) = retrieved else {
        panic!("Expected a stream");
    };
    let mut content = String::new();
    reader.read_to_string(&mut content).await.unwrap();
    assert_eq!(content, "streamed content");
    endpoint.engine.release(RetrievedFile::Stream(reader));
}

#[tokio::test]
async fn local_retrieval_leaves_no_staging_file() {
    let staging = tempfile::tempdir().unwrap();
    let directory = staging.path().join("downloads");
    let endpoint = endpoint_with(|config| config.retrieve_mode = RetrieveMode::LocalDirectory(directory.clone()));
    endpoint.write("remote/file.txt", "payload");

    let retrieved = endpoint.engine.retrieve("/remote/file.txt").await.unwrap();
    let RetrievedFile::Local(path) = retrieved else {
        panic!("Expected a local file");
    };
    assert_eq!(path, directory.join("file.txt"));
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "payload");
    assert!(!directory.join("file.txt.inprogress").exists());
}

#[tokio::test]
async fn list_reports_names_kinds_and_sizes() {
    let endpoint = LocalEndpoint::new();
    endpoint.write("dir/b.txt", "12345");
    endpoint.write("dir/a.txt", "1");
    std::fs::create_dir(endpoint.local("dir/sub")).unwrap();

    let entries = endpoint.engine.list("/dir").await.unwrap();
    let names: Vec<_> = entries.iter().map(|entry| entry.name.as_str()).collect();
    assert_eq!(names, vec!["a.txt", "b.txt", "sub"]);
    assert_eq!(entries[1].size(), 5);
    assert!(entries[2].is_dir());
    assert!(entries[0].modified().is_some());
}

#[tokio::test]
async fn mkdir_creates_missing_segments_with_permissions() {
    let endpoint = endpoint_with(|config| config.chmod_directory = Some("0750".into()));
    endpoint.engine.mkdir("/a/b/c").await.expect("Mkdir failed");

    for path in ["a", "a/b", "a/b/c"] {
        let metadata = std::fs::metadata(endpoint.local(path)).unwrap();
        assert!(metadata.is_dir());
        assert_eq!(metadata.permissions().mode() & 0o7777, 0o750);
    }
    endpoint.engine.mkdir("/a/b/c").await.expect("Existing directory should be accepted");
}

#[tokio::test]
async fn rename_delete_and_exists() {
    let endpoint = LocalEndpoint::new();
    endpoint.write("from.txt", "x");

    assert!(endpoint.engine.exists("/from.txt").await.unwrap());
    endpoint.engine.rename("/from.txt", "/to.txt").await.unwrap();
    assert!(!endpoint.engine.exists("/from.txt").await.unwrap());
    assert!(endpoint.engine.exists("/to.txt").await.unwrap());

    endpoint.engine.delete("/to.txt").await.unwrap();
    assert!(!endpoint.engine.exists("/to.txt").await.unwrap());

    let err = endpoint.engine.delete("/to.txt").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Operation);
}

#[tokio::test]
async fn exists_reports_absent_when_the_connection_drops() {
    let endpoint = LocalEndpoint::new();
    endpoint.write("here.txt", "x");
    assert!(endpoint.engine.exists("/here.txt").await.unwrap());

    endpoint.link.drop_unnoticed();
    assert!(!endpoint.engine.exists("/here.txt").await.unwrap());
    assert!(matches!(
        endpoint.engine.manager().status().await,
        SessionStatus::Failed(_)
    ));

    assert!(endpoint.engine.exists("/here.txt").await.unwrap());
    assert_eq!(endpoint.link.connects(), 2);
}

#[tokio::test]
async fn unnoticed_drop_during_store_forces_a_reconnect() {
    let endpoint = LocalEndpoint::new();
    endpoint.engine.list("/").await.unwrap();

    endpoint.link.drop_unnoticed();
    let err = endpoint
        .engine
        .store("/z.txt", "x".as_bytes(), WriteMode::Truncate)
        .await
        .unwrap_err();
    assert!(err.is_connection_loss());

    endpoint
        .engine
        .store("/z.txt", "x".as_bytes(), WriteMode::Truncate)
        .await
        .unwrap();
    assert_eq!(endpoint.read("z.txt"), "x");
    assert_eq!(endpoint.link.connects(), 2);
}

#[tokio::test]
async fn stat_of_missing_path_is_an_operation_error() {
    let endpoint = LocalEndpoint::new();
    match endpoint.engine.stat("/nope").await.unwrap_err() {
        Error::Operation { operation, source, .. } => {
            assert_eq!(operation, "stat");
            assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
        }
        other => panic!("Unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn directory_changes_resolve_relative_paths() {
    let endpoint = LocalEndpoint::new();
    std::fs::create_dir_all(endpoint.local("a/b/c")).unwrap();

    assert_eq!(endpoint.engine.current_directory().await.unwrap(), "/");
    endpoint.engine.change_directory("/a/b/c").await.unwrap();
    assert_eq!(endpoint.engine.current_directory().await.unwrap(), "/a/b/c");

    endpoint
        .engine
        .store("here.txt", "x".as_bytes(), WriteMode::Truncate)
        .await
        .unwrap();
    assert_eq!(endpoint.read("a/b/c/here.txt"), "x");
    let names: Vec<_> = endpoint.engine.list("").await.unwrap().into_iter().map(|entry| entry.name).collect();
    assert_eq!(names, vec!["here.txt"]);

    endpoint.engine.change_directory("/a").await.unwrap();
    assert_eq!(endpoint.engine.current_directory().await.unwrap(), "/a");
    endpoint.engine.change_directory("b").await.unwrap();
    endpoint.engine.change_to_parent().await.unwrap();
    assert_eq!(endpoint.engine.current_directory().await.unwrap(), "/a");
}

#[tokio::test]
async fn failed_directory_change_keeps_the_cursor() {
    let endpoint = LocalEndpoint::new();
    std::fs::create_dir_all(endpoint.local("a/b")).unwrap();
    endpoint.write("a/file.txt", "x");
    endpoint.engine.change_directory("/a/b").await.unwrap();

    assert!(endpoint.engine.change_directory("/a/missing").await.is_err());
    assert!(endpoint.engine.change_directory("/a/file.txt").await.is_err());
    assert_eq!(endpoint.engine.current_directory().await.unwrap(), "/a/b");
}

#[tokio::test]
async fn lost_connection_is_replaced_on_next_call() {
    let endpoint = LocalEndpoint::new();
    endpoint.write("x.txt", "x");

    endpoint.engine.list("/").await.unwrap();
    endpoint.link.sever();
    let entries = endpoint.engine.list("/").await.unwrap();

    assert_eq!(entries.len(), 1);
    assert_eq!(endpoint.link.connects(), 2);
}
