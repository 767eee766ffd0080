//! End-to-end session tests against a scripted server.

mod common;

use common::{init_tracing, near_host_key, client_key, FakeServer, Harness, Offer, TestAuthenticator};
use std::time::Duration;
use tern_platform::{IdentityMaterial, TernError};
use tern_proto::ssh1::auth::{rsa_response, AuthType};
use tern_proto::ssh1::client::Client;
use tern_proto::ssh1::config::SessionConfig;
use tern_proto::ssh1::forwarding::{ForwardAddr, ForwardRule};
use tern_proto::ssh1::identity::Identity;
use tern_proto::ssh1::message::MessageType;
use tern_proto::ssh1::packet::Packet;
use tern_proto::ssh1::session::SessionStatus;
use tern_proto::ssh1::cipher::CipherKind;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

const PASSWORD: u8 = AuthType::Password as u8;
const RSA: u8 = AuthType::Rsa as u8;

fn config() -> SessionConfig {
    SessionConfig::new("legacy.example", 22)
        .with_pty(false)
        .with_hello_timeout(Duration::from_secs(5))
        .with_kex_timeout(Duration::from_secs(5))
}

#[tokio::test]
async fn test_password_login_with_compression_and_exit_status() {
    init_tracing();
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let harness = Harness::new(TestAuthenticator::with_passwords(vec![PASSWORD], &["secret"]));

    let server = tokio::spawn(async move {
        let mut server = FakeServer::new(server_io);
        let client_line = server.hello().await;
        assert!(client_line.starts_with("SSH-1.5-Tern_"));

        let cipher = server.key_exchange(&Offer::new(&[PASSWORD])).await;
        assert_eq!(cipher, CipherKind::TripleDes);
        assert_eq!(server.expect_user().await, "alice");
        server.send_empty(MessageType::Failure).await;

        let password = server.expect(MessageType::AuthPassword).await;
        assert_eq!(password.reader().get_text().unwrap(), "secret");
        server.send_empty(MessageType::Success).await;

        let compression = server.expect(MessageType::RequestCompression).await;
        assert_eq!(compression.reader().get_u32().unwrap(), 6);
        server.send_empty(MessageType::Success).await;
        server.enable_compression(6);

        let pty = server.expect(MessageType::RequestPty).await;
        let mut reader = pty.reader();
        assert_eq!(reader.get_text().unwrap(), "xterm");
        assert_eq!(reader.get_u32().unwrap(), 24);
        assert_eq!(reader.get_u32().unwrap(), 80);
        server.send_empty(MessageType::Success).await;

        server.expect(MessageType::ExecShell).await;
        let mut out = Packet::new(MessageType::StdoutData);
        out.put_string(b"welcome\n");
        server.send(&out).await;

        let input = server.expect(MessageType::StdinData).await;
        assert_eq!(input.reader().get_string().unwrap(), b"exit\n");

        let mut exit = Packet::new(MessageType::ExitStatus);
        exit.put_u32(0);
        server.send(&exit).await;
        server.expect(MessageType::ExitConfirmation).await;
    });

    let config = config().with_pty(true).with_compression_level(6);
    let client = Client::connect_stream(client_io, config, harness.collaborators())
        .await
        .unwrap();
    assert!(matches!(
        client.status(),
        SessionStatus::Open {
            cipher: CipherKind::TripleDes
        }
    ));
    assert_eq!(harness.console.opened.lock().as_deref(), Some("3des"));
    assert_eq!(
        harness.authenticator.password_prompts.lock()[0],
        "alice@legacy.example's password: "
    );

    client.send_stdin(b"exit\n").unwrap();
    server.await.unwrap();

    assert_eq!(client.wait_exit().await.unwrap(), Some(0));
    assert_eq!(&*harness.console.output.lock(), b"welcome\n");
    assert_eq!(&*harness.console.closed.lock(), &[Some(0)]);
}

#[tokio::test]
async fn test_old_version_rejected_without_sending() {
    let (client_io, server_io) = tokio::io::duplex(4096);
    let harness = Harness::new(TestAuthenticator::default());

    let server = tokio::spawn(async move {
        let mut server = FakeServer::new(server_io);
        server.send_line("SSH-0.9-OpenSSH\n").await;
        server.drain().await
    });

    let err = Client::connect_stream(client_io, config(), harness.collaborators())
        .await
        .unwrap_err();
    assert!(matches!(err, TernError::Protocol(_)), "got {}", err);
    assert!(err.to_string().contains("too old"));
    // Not even our identification line went out.
    assert!(server.await.unwrap().is_empty());
}

#[tokio::test]
async fn test_close_key_sizes_rejected_before_session_key() {
    let (client_io, server_io) = tokio::io::duplex(4096);
    let harness = Harness::new(TestAuthenticator::with_passwords(vec![PASSWORD], &[]));

    let server = tokio::spawn(async move {
        let mut server = FakeServer::new(server_io);
        server.hello().await;
        let mut offer = Offer::new(&[PASSWORD]);
        offer.host_key = near_host_key();
        server.send(&offer.keys().to_packet()).await;
        server.drain().await
    });

    let err = Client::connect_stream(client_io, config(), harness.collaborators())
        .await
        .unwrap_err();
    assert!(matches!(err, TernError::Security(_)), "got {}", err);
    assert!(err.to_string().contains("differ by 10 bits"));
    assert!(server.await.unwrap().is_empty());
    // The host key was never consulted.
    assert!(harness.authenticator.host_checks.lock().is_empty());
}

#[tokio::test]
async fn test_rejected_host_key_aborts() {
    let (client_io, server_io) = tokio::io::duplex(4096);
    let harness = Harness::new(TestAuthenticator {
        reject_host: true,
        cipher: CipherKind::TripleDes.id(),
        ..Default::default()
    });

    let server = tokio::spawn(async move {
        let mut server = FakeServer::new(server_io);
        server.hello().await;
        server.send(&Offer::new(&[PASSWORD]).keys().to_packet()).await;
        server.drain().await
    });

    let err = Client::connect_stream(client_io, config(), harness.collaborators())
        .await
        .unwrap_err();
    assert!(matches!(err, TernError::Security(_)), "got {}", err);
    assert!(server.await.unwrap().is_empty());

    let checks = harness.authenticator.host_checks.lock();
    assert_eq!(checks.len(), 1);
    assert_eq!(checks[0].bits, 768);
    assert_eq!(checks[0].exponent, vec![0x01, 0x00, 0x01]);
}

#[tokio::test]
async fn test_unsupported_cipher_is_named() {
    let (client_io, server_io) = tokio::io::duplex(4096);
    let harness = Harness::new(TestAuthenticator::with_passwords(vec![PASSWORD], &[]));

    let server = tokio::spawn(async move {
        let mut server = FakeServer::new(server_io);
        server.hello().await;
        server.send(&Offer::new(&[PASSWORD]).keys().to_packet()).await;
        server.drain().await
    });

    let config = config().with_cipher(CipherKind::Idea);
    let err = Client::connect_stream(client_io, config, harness.collaborators())
        .await
        .unwrap_err();
    assert!(matches!(err, TernError::Security(_)));
    assert!(err.to_string().contains("idea"), "got {}", err);
    assert!(server.await.unwrap().is_empty());
}

#[tokio::test]
async fn test_ignore_and_debug_are_transparent() {
    let (client_io, server_io) = tokio::io::duplex(16 * 1024);
    let harness = Harness::new(TestAuthenticator::with_passwords(vec![PASSWORD], &[]));

    let server = tokio::spawn(async move {
        let mut server = FakeServer::new(server_io);
        server.hello().await;

        let mut ignore = Packet::new(MessageType::Ignore);
        ignore.put_string(b"padding noise");
        server.send(&ignore).await;
        server.key_exchange(&Offer::new(&[PASSWORD])).await;

        server.expect_user().await;
        let mut debug = Packet::new(MessageType::Debug);
        debug.put_string(b"server says hi");
        server.send(&debug).await;
        server.send(&ignore).await;
        server.send_empty(MessageType::Success).await;

        server.expect(MessageType::ExecShell).await;
        server
    });

    let client = Client::connect_stream(client_io, config(), harness.collaborators())
        .await
        .unwrap();
    assert!(matches!(client.status(), SessionStatus::Open { .. }));
    // No password was needed.
    assert!(harness.authenticator.password_prompts.lock().is_empty());
    let _server = server.await.unwrap();
}

#[tokio::test]
async fn test_auth_exhaustion_offers_each_method_once() {
    let (client_io, server_io) = tokio::io::duplex(16 * 1024);
    let harness = Harness::new(TestAuthenticator::with_passwords(
        vec![PASSWORD, RSA, PASSWORD, 42],
        &["wrong", "wrong again"],
    ));

    let server = tokio::spawn(async move {
        let mut server = FakeServer::new(server_io);
        server.hello().await;
        server.key_exchange(&Offer::new(&[PASSWORD, RSA])).await;
        server.expect_user().await;
        server.send_empty(MessageType::Failure).await;
        server.expect(MessageType::AuthPassword).await;
        server.send_empty(MessageType::Failure).await;
        server.drain().await
    });

    let err = Client::connect_stream(client_io, config(), harness.collaborators())
        .await
        .unwrap_err();
    assert!(matches!(err, TernError::Authentication(_)), "got {}", err);
    assert!(err.to_string().contains("no more authentication methods"));
    assert!(server.await.unwrap().is_empty());

    assert_eq!(harness.authenticator.password_prompts.lock().len(), 1);
    assert!(harness.reported("no identity configured"));
    assert!(harness.reported("not known to this client"));
}

#[tokio::test]
async fn test_rsa_identity_login() {
    let (client_io, server_io) = tokio::io::duplex(16 * 1024);
    let identity = Identity::new(client_key(), "alice@workstation");
    let harness = Harness::new(TestAuthenticator {
        preferences: vec![RSA, PASSWORD],
        cipher: CipherKind::Blowfish.id(),
        identity: Some(IdentityMaterial {
            file: identity.to_bytes("open sesame").unwrap(),
            passphrase: Some("open sesame".to_string()),
        }),
        ..Default::default()
    });

    let server = tokio::spawn(async move {
        let mut server = FakeServer::new(server_io);
        server.hello().await;
        assert_eq!(
            server.key_exchange(&Offer::new(&[PASSWORD, RSA])).await,
            CipherKind::Blowfish
        );
        server.expect_user().await;
        server.send_empty(MessageType::Failure).await;

        let request = server.expect(MessageType::AuthRsa).await;
        let user_key = client_key();
        assert_eq!(
            &request.reader().get_mpint().unwrap(),
            user_key.public_key().modulus()
        );

        let secret = [0x5au8; 32];
        let challenge = user_key.public_key().encrypt_pkcs1(&secret).unwrap();
        let mut packet = Packet::new(MessageType::AuthRsaChallenge);
        packet.put_mpint(&challenge);
        server.send(&packet).await;

        let response = server.expect(MessageType::AuthRsaResponse).await;
        let expected = rsa_response(&challenge, &user_key, &server.session_id).unwrap();
        assert_eq!(response.payload(), &expected[..]);
        server.send_empty(MessageType::Success).await;

        server.expect(MessageType::ExecCmd).await;
        server
    });

    let config = config().with_command("id");
    let client = Client::connect_stream(client_io, config, harness.collaborators())
        .await
        .unwrap();
    assert!(matches!(
        client.status(),
        SessionStatus::Open {
            cipher: CipherKind::Blowfish
        }
    ));
    assert!(harness.authenticator.password_prompts.lock().is_empty());
    let _server = server.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_hello_timeout() {
    let (client_io, _server_io) = tokio::io::duplex(4096);
    let harness = Harness::new(TestAuthenticator::default());

    let config = config()
        .with_hello_timeout(Duration::from_millis(200))
        .with_kex_timeout(Duration::from_secs(30));
    let err = Client::connect_stream(client_io, config, harness.collaborators())
        .await
        .unwrap_err();
    assert!(matches!(err, TernError::Timeout(_)), "got {}", err);
    assert!(err.to_string().contains("identification"));
}

#[tokio::test]
async fn test_disconnect_during_handshake_surfaces_reason() {
    let (client_io, server_io) = tokio::io::duplex(4096);
    let harness = Harness::new(TestAuthenticator::with_passwords(vec![PASSWORD], &[]));

    tokio::spawn(async move {
        let mut server = FakeServer::new(server_io);
        server.hello().await;
        let mut bye = Packet::new(MessageType::Disconnect);
        bye.put_string(b"Too many connections");
        server.send(&bye).await;
        server.drain().await
    });

    let err = Client::connect_stream(client_io, config(), harness.collaborators())
        .await
        .unwrap_err();
    assert!(matches!(err, TernError::Disconnected(ref reason) if reason == "Too many connections"));
}

#[tokio::test]
async fn test_remote_forward_uses_one_shot_host_mapping() {
    init_tracing();
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let harness = Harness::new(TestAuthenticator::with_passwords(vec![PASSWORD], &[]));
    let (go_tx, go_rx) = tokio::sync::oneshot::channel::<()>();

    let server = tokio::spawn(async move {
        let mut server = FakeServer::new(server_io);
        server.hello().await;
        server.key_exchange(&Offer::new(&[PASSWORD])).await;
        server.expect_user().await;
        server.send_empty(MessageType::Success).await;

        let request = server.expect(MessageType::PortForwardRequest).await;
        let mut reader = request.reader();
        assert_eq!(reader.get_u32().unwrap(), 9000);
        assert_eq!(reader.get_text().unwrap(), "internal");
        assert_eq!(reader.get_u32().unwrap(), 80);
        server.send_empty(MessageType::Success).await;
        server.expect(MessageType::ExecShell).await;

        go_rx.await.unwrap();
        let mut open = Packet::new(MessageType::PortOpen);
        open.put_u32(5)
            .put_string(b"internal")
            .put_u32(80)
            .put_string(b"203.0.113.9:40000");
        server.send(&open).await;

        // Confirmation strictly precedes channel data.
        let confirmation = server.expect(MessageType::ChannelOpenConfirmation).await;
        let mut reader = confirmation.reader();
        assert_eq!(reader.get_u32().unwrap(), 5);
        let local_id = reader.get_u32().unwrap();

        let data = server.expect(MessageType::ChannelData).await;
        let mut reader = data.reader();
        assert_eq!(reader.get_u32().unwrap(), 5);
        assert_eq!(reader.get_string().unwrap(), b"hello");

        let mut reply = Packet::new(MessageType::ChannelData);
        reply.put_u32(local_id).put_string(b"world");
        server.send(&reply).await;

        let mut close = Packet::new(MessageType::ChannelClose);
        close.put_u32(local_id);
        server.send(&close).await;
        let confirmed = server.expect(MessageType::ChannelCloseConfirmation).await;
        assert_eq!(confirmed.reader().get_u32().unwrap(), 5);

        let mut exit = Packet::new(MessageType::ExitStatus);
        exit.put_u32(3);
        server.send(&exit).await;
        server.expect(MessageType::ExitConfirmation).await;
    });

    let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target_port = target.local_addr().unwrap().port();

    let config = config().with_remote_forward(ForwardRule::new(
        ForwardAddr::new("0.0.0.0", 9000),
        ForwardAddr::new("internal", 80),
    ));
    let client = Client::connect_stream(client_io, config, harness.collaborators())
        .await
        .unwrap();

    let host_map = client.host_map();
    host_map.add_temporary(
        ForwardAddr::new("internal", 80),
        ForwardAddr::new("127.0.0.1", target_port),
    );
    go_tx.send(()).unwrap();

    let (mut socket, _) = target.accept().await.unwrap();
    socket.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    socket.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"world");
    // The one-shot mapping was consumed.
    assert!(host_map.is_empty());

    server.await.unwrap();
    assert_eq!(client.wait_exit().await.unwrap(), Some(3));
    assert!(client.channels().is_empty());
}

#[tokio::test]
async fn test_refused_setup_steps_are_reported() {
    let (client_io, server_io) = tokio::io::duplex(16 * 1024);
    let harness = Harness::new(TestAuthenticator::with_passwords(vec![PASSWORD], &[]));

    let server = tokio::spawn(async move {
        let mut server = FakeServer::new(server_io);
        server.hello().await;
        server.key_exchange(&Offer::new(&[PASSWORD])).await;
        server.expect_user().await;
        server.send_empty(MessageType::Success).await;

        server.expect(MessageType::RequestCompression).await;
        server.send_empty(MessageType::Failure).await;
        server.expect(MessageType::MaxPacketSize).await;
        server.send_empty(MessageType::Failure).await;
        server.expect(MessageType::X11RequestForwarding).await;
        server.send_empty(MessageType::Failure).await;
        server.expect(MessageType::ExecShell).await;
        server
    });

    let config = config()
        .with_compression_level(9)
        .with_max_packet_size(16384)
        .with_x11(":0");
    let client = Client::connect_stream(client_io, config, harness.collaborators())
        .await
        .unwrap();
    assert!(matches!(client.status(), SessionStatus::Open { .. }));
    assert!(harness.reported("compression"));
    assert!(harness.reported("maximum packet size"));
    assert!(harness.reported("X11 forwarding"));

    let _server = server.await.unwrap();
    client.disconnect("bye");
    assert!(matches!(client.wait_exit().await, Ok(None)));
}

#[tokio::test]
async fn test_connect_over_tcp_reaches_version_check() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let harness = Harness::new(TestAuthenticator::default());

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        socket.write_all(b"SSH-0.9-OldServer\n").await.unwrap();
        let mut rest = Vec::new();
        let _ = socket.read_to_end(&mut rest).await;
        rest
    });

    let config = SessionConfig::new("127.0.0.1", port)
        .with_pty(false)
        .with_connect_timeout(Duration::from_secs(5))
        .with_hello_timeout(Duration::from_secs(5));
    let err = Client::connect(config, harness.collaborators())
        .await
        .unwrap_err();
    assert!(matches!(err, TernError::Protocol(_)), "got {}", err);
    assert!(server.await.unwrap().is_empty());
}

#[tokio::test]
async fn test_connect_refused_is_io_error() {
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = closed.local_addr().unwrap().port();
    drop(closed);
    let harness = Harness::new(TestAuthenticator::default());

    let err = Client::connect(SessionConfig::new("127.0.0.1", port), harness.collaborators())
        .await
        .unwrap_err();
    assert!(matches!(err, TernError::Io(_)), "got {}", err);
}
