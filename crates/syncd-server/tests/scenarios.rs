//! End-to-end protocol scenarios over the in-process transport and the
//! real file-backed history store.

mod support;

use std::time::Duration;

use syncd_core::ports::history::{ClientType, FileIdentAllocSlot, VersionInfo};
use syncd_core::protocol::messages::UploadChangeset;
use syncd_core::{ClientMessage, ProtocolError, ServerConfig, ServerMessage, UploadCursor};

use support::{start_gated_server, start_server, TestClient, TestServer};

#[tokio::test]
async fn happy_path_bootstrap() {
    let ts = start_server(ServerConfig::with_defaults());
    let mut client = TestClient::connect(&ts);

    client.bind(1, "/foo", true).await;
    let ident = match client.recv().await {
        ServerMessage::Ident {
            session_ident,
            client_file_ident,
        } => {
            assert_eq!(session_ident, 1);
            client_file_ident
        }
        other => panic!("expected IDENT, got {other:?}"),
    };
    assert_eq!(ident.ident, 1);
    assert_ne!(ident.salt, 0);

    client.ident(1, ident).await;
    let download = client.expect_download().await;
    assert_eq!(download.session_ident, 1);
    assert!(download.entries.is_empty());
    assert_eq!(download.end.version, 0);
    assert_eq!(download.end.salt, 0);
    assert_eq!(download.progress.server_version, 0);
}

#[tokio::test]
async fn upload_fans_out_to_other_clients() {
    let ts = start_server(ServerConfig::with_defaults());
    let mut a = TestClient::connect(&ts);
    let mut b = TestClient::connect(&ts);
    let a_ident = a.bind_fresh(1, "/foo").await;
    let b_ident = b.bind_fresh(1, "/foo").await;
    assert_ne!(a_ident.ident, b_ident.ident);

    a.upload_one(1, 1, 0, b"change-from-a").await;

    // B receives the new changeset.
    let download = b.expect_download().await;
    assert_eq!(download.entries.len(), 1);
    assert_eq!(download.end.version, 1);
    assert_eq!(download.entries[0].data, b"change-from-a");
    assert_eq!(download.entries[0].origin_file_ident, a_ident.ident);

    // A's own changes never come back, but its progress does.
    let download = a.expect_download().await;
    assert!(download.entries.is_empty());
    assert_eq!(download.progress.server_version, 1);
    assert_eq!(download.upload_progress.client_version, 1);
}

#[tokio::test]
async fn duplicate_upload_is_suppressed_after_restart() {
    let ts = start_server(ServerConfig::with_defaults());
    let vpath = TestServer::vpath("/foo");

    let a_ident = {
        let mut a = TestClient::connect(&ts);
        let a_ident = a.bind_fresh(1, "/foo").await;
        a.upload_one(1, 1, 0, b"only-once").await;
        // Wait until the change is integrated before "crashing" A.
        let download = a.expect_download().await;
        assert_eq!(download.upload_progress.client_version, 1);
        a_ident
    };

    // A reconnects and resumes; the history hands back its threshold.
    let mut a = TestClient::connect(&ts);
    a.bind(2, "/foo", false).await;
    a.ident(2, a_ident).await;
    let download = a.expect_download().await;
    assert_eq!(download.upload_progress.client_version, 1);
    assert!(download.entries.is_empty());

    // The same changeset again: previously integrated, silently skipped.
    a.upload_one(2, 1, 0, b"only-once").await;
    a.send(&ClientMessage::Mark {
        session_ident: 2,
        request_ident: 7,
    })
    .await;
    match a.recv().await {
        ServerMessage::Mark {
            session_ident,
            request_ident,
        } => {
            assert_eq!(session_ident, 2);
            assert_eq!(request_ident, 7);
        }
        other => panic!("expected MARK, got {other:?}"),
    }

    let file = ts.server.lookup_file(&vpath).unwrap();
    assert_eq!(file.version_info().sync_version.version, 1);
}

#[tokio::test]
async fn backpressure_closes_the_session_with_try_again() {
    let mut config = ServerConfig::with_defaults();
    config.max_upload_backlog = Some(1024);
    let (ts, gate) = start_gated_server(config);

    let mut a = TestClient::connect(&ts);
    a.bind_fresh(1, "/foo").await;

    // Stall integration so uploads pile up on the blocked side.
    gate.close();
    a.upload_one(1, 1, 0, &[b'x'; 512]).await; // goes in flight
    a.upload_one(1, 2, 0, &[b'x'; 512]).await; // blocked: 512
    a.upload_one(1, 3, 0, &[b'x'; 512]).await; // blocked: 1024
    a.upload_one(1, 4, 0, &[b'x'; 512]).await; // refused

    let (session_ident, code, try_again) = a.expect_error().await;
    assert_eq!(session_ident, 1);
    assert_eq!(code, ProtocolError::ConnectionClosed.code());
    assert!(try_again);

    gate.release();
}

#[tokio::test]
async fn blacklisted_client_file_is_rejected() {
    let mut config = ServerConfig::with_defaults();
    config
        .client_file_blacklists
        .insert("/foo".to_owned(), vec![1]);
    let ts = start_server(config);

    let mut client = TestClient::connect(&ts);
    client.bind(1, "/foo", true).await;
    let ident = match client.recv().await {
        ServerMessage::Ident {
            client_file_ident, ..
        } => client_file_ident,
        other => panic!("expected IDENT, got {other:?}"),
    };
    assert_eq!(ident.ident, 1);

    client.ident(1, ident).await;
    let (session_ident, code, try_again) = client.expect_error().await;
    assert_eq!(session_ident, 1);
    assert_eq!(code, ProtocolError::ClientFileBlacklisted.code());
    assert!(!try_again);

    // Other sessions on the same connection are unaffected.
    let other = client.bind_fresh(2, "/foo").await;
    assert_eq!(other.ident, 2);
}

#[tokio::test]
async fn compaction_completes_and_sessions_keep_syncing() {
    let ts = start_server(ServerConfig::with_defaults());
    let vpath = TestServer::vpath("/compact");
    let mut a = TestClient::connect(&ts);
    a.bind_fresh(1, "/compact").await;

    a.upload_one(1, 1, 0, b"before-compaction").await;
    let download = a.expect_download().await;
    assert_eq!(download.upload_progress.client_version, 1);

    ts.server.compact_realms(Some(&vpath)).await.unwrap();

    // The reopened store keeps serving the same bound session.
    a.upload_one(1, 2, 1, b"after-compaction").await;
    let download = a.expect_download().await;
    assert_eq!(download.upload_progress.client_version, 2);
    assert_eq!(download.progress.server_version, 2);
}

#[tokio::test]
async fn deletion_mid_traffic_errors_sessions_and_prunes_directories() {
    let ts = start_server(ServerConfig::with_defaults());
    let vpath = TestServer::vpath("/dir/foo");
    let mut a = TestClient::connect(&ts);
    a.bind_fresh(1, "/dir/foo").await;

    let real_path = vpath.real_path(ts.root.path());
    assert!(real_path.exists());

    ts.server.delete_realm(&vpath).await.unwrap();

    let (session_ident, code, _) = a.expect_error().await;
    assert_eq!(session_ident, 1);
    assert_eq!(code, ProtocolError::ServerFileDeleted.code());

    assert!(!real_path.exists());
    // The now-empty parent directory is pruned; the root survives.
    assert!(!ts.root.path().join("dir").exists());
    assert!(ts.root.path().exists());
    assert!(ts.server.lookup_file(&vpath).is_none());

    // A new bind sees a brand-new realm.
    let mut b = TestClient::connect(&ts);
    let ident = b.bind_fresh(1, "/dir/foo").await;
    assert_eq!(ident.ident, 1);
}

#[tokio::test]
async fn every_bound_session_converges_after_a_write() {
    let ts = start_server(ServerConfig::with_defaults());
    let mut clients = Vec::new();
    for i in 0..3 {
        let mut client = TestClient::connect(&ts);
        client.bind_fresh(1, "/swarm").await;
        clients.push((i, client));
    }
    let mut writer = TestClient::connect(&ts);
    writer.bind_fresh(1, "/swarm").await;
    writer.upload_one(1, 1, 0, b"fanned-out").await;

    for (_, client) in &mut clients {
        let download = client.expect_download().await;
        assert_eq!(download.progress.server_version, 1);
        assert_eq!(download.entries.len(), 1);
    }
}

#[tokio::test]
async fn external_change_resumes_downloads() {
    let ts = start_server(ServerConfig::with_defaults());
    let vpath = TestServer::vpath("/ext");
    let mut client = TestClient::connect(&ts);
    client.bind_fresh(1, "/ext").await;

    // Integrate a changeset behind the coordinator's back, as an external
    // process with its own handle would.
    let file = ts.server.lookup_file(&vpath).unwrap();
    let history = file.history().clone();
    let mut slots = [FileIdentAllocSlot {
        client_type: ClientType::Regular,
        ..FileIdentAllocSlot::default()
    }];
    let mut info = VersionInfo::default();
    history
        .allocate_file_identifiers(&mut slots, &mut info)
        .unwrap();
    let mut batch = syncd_core::ports::history::IntegratableChangesets::new();
    batch.insert(
        slots[0].ident.ident,
        syncd_core::ports::history::IntegratableChangesetList {
            upload_progress: UploadCursor::new(1, 0),
            locked_server_version: 0,
            changesets: vec![UploadChangeset {
                upload_cursor: UploadCursor::new(1, 0),
                origin_timestamp: 1,
                origin_file_ident: 0,
                data: b"out-of-band".to_vec(),
            }],
        },
    );
    history.integrate_client_changesets(&batch).unwrap();

    file.recognize_external_change();

    let download = client.expect_download().await;
    assert_eq!(download.entries.len(), 1);
    assert_eq!(download.entries[0].data, b"out-of-band");
}

#[tokio::test]
async fn unbind_is_acknowledged_with_unbound() {
    let ts = start_server(ServerConfig::with_defaults());
    let mut client = TestClient::connect(&ts);
    client.bind_fresh(1, "/foo").await;

    client.send(&ClientMessage::Unbind { session_ident: 1 }).await;
    match client.recv().await {
        ServerMessage::Unbound { session_ident } => assert_eq!(session_ident, 1),
        other => panic!("expected UNBOUND, got {other:?}"),
    }

    // The session identifier can be reused after UNBOUND.
    let ident = client.bind_fresh(1, "/foo").await;
    assert_ne!(ident.ident, 0);
}

#[tokio::test]
async fn connection_level_error_soft_closes_every_session() {
    let ts = start_server(ServerConfig::with_defaults());
    let mut client = TestClient::connect(&ts);
    client.bind_fresh(1, "/foo").await;
    client.bind_fresh(2, "/bar").await;

    // UPLOAD for a session that does not exist is a connection error.
    client.upload_one(99, 1, 0, b"zzz").await;

    let (session_ident, code, _) = client.expect_error().await;
    assert_eq!(session_ident, 0);
    assert_eq!(code, ProtocolError::BadSessionIdent.code());
}

#[tokio::test]
async fn upload_cursor_violations_terminate_only_the_session() {
    let ts = start_server(ServerConfig::with_defaults());
    let mut client = TestClient::connect(&ts);
    client.bind_fresh(1, "/foo").await;
    client.bind_fresh(2, "/bar").await;

    // Claimed server-side progress beyond anything downloaded.
    client.send(&ClientMessage::Upload {
        session_ident: 1,
        progress_client_version: 1,
        progress_server_version: 5,
        locked_server_version: 0,
        changesets: vec![],
    })
    .await;
    let (session_ident, code, _) = client.expect_error().await;
    assert_eq!(session_ident, 1);
    assert_eq!(code, ProtocolError::BadServerVersion.code());

    // The sibling session is untouched and still serves downloads.
    client.send(&ClientMessage::Mark {
        session_ident: 2,
        request_ident: 3,
    })
    .await;
    match client.recv().await {
        ServerMessage::Mark { session_ident, .. } => assert_eq!(session_ident, 2),
        other => panic!("expected MARK, got {other:?}"),
    }
}

#[tokio::test]
async fn regressing_client_version_is_rejected() {
    let ts = start_server(ServerConfig::with_defaults());
    let mut client = TestClient::connect(&ts);
    client.bind_fresh(1, "/foo").await;

    client.upload_one(1, 2, 0, b"at-two").await;
    client.expect_download().await;

    client.upload_one(1, 1, 0, b"regressed").await;
    let (session_ident, code, _) = client.expect_error().await;
    assert_eq!(session_ident, 1);
    assert_eq!(code, ProtocolError::BadClientVersion.code());
}

#[tokio::test]
async fn zombie_connection_is_terminated_on_rebind() {
    let ts = start_server(ServerConfig::with_defaults());
    let mut old = TestClient::connect(&ts);
    let ident = old.bind_fresh(1, "/foo").await;

    // The same client file binds from a fresh connection, as after a
    // network drop the server never noticed.
    let mut new = TestClient::connect(&ts);
    new.bind(1, "/foo", false).await;
    new.ident(1, ident).await;
    new.expect_download().await;

    assert!(old.closed_within(Duration::from_secs(5)).await);
}
