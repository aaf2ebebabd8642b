//! Loopback end-to-end scenarios for the client/server personas.

use bedrock_pipeline::{
    auth::{self, Payload},
    client::{Client, ClientOptions},
    crypto::keys::KeyPair,
    error::{AuthError, SessionError},
    protocol::{
        catalog::Catalog,
        framer,
        packet::{GamePacket, NetworkSettings, PacketName, RequestChunkRadius, Text},
        GAME_PACKET_HEADER,
    },
    server::{Server, ServerEvent, ServerOptions},
    session::{Session, SessionConfig, SessionEvent, SessionState},
    transport::{self, DatagramReceiver, MemoryListener},
};
use std::{net::SocketAddr, time::Duration};
use tokio::time::timeout;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{port}").parse().unwrap()
}

async fn next_server_event(server: &bedrock_pipeline::server::ServerHandle) -> ServerEvent {
    timeout(Duration::from_secs(5), server.next_event())
        .await
        .expect("timed out waiting for server event")
        .expect("server event stream ended")
}

#[tokio::test]
async fn offline_client_reaches_spawn() {
    init_tracing();
    let (listener, connector) = MemoryListener::bind(addr(19132));
    let server = Server::new(listener, ServerOptions::default()).start();

    let client = Client::connect(&connector, ClientOptions::offline("Steve"))
        .await
        .expect("login should succeed");

    assert_eq!(client.profile.display_name, "Steve");
    assert_eq!(client.profile.identity, auth::offline_identity("Steve"));
    assert_eq!(client.profile.xuid, "0");
    assert_eq!(client.start_game.runtime_entity_id, 1);

    match next_server_event(&server).await {
        ServerEvent::PlayerConnect { profile, .. } => {
            assert_eq!(profile.display_name, "Steve");
            assert_eq!(profile.identity, auth::offline_identity("Steve"));
        }
        other => panic!("expected PlayerConnect, got {other:?}"),
    }
    match next_server_event(&server).await {
        ServerEvent::PlayerSpawn { .. } => {}
        other => panic!("expected PlayerSpawn, got {other:?}"),
    }
}

#[tokio::test]
async fn chat_flows_both_ways_after_spawn() {
    init_tracing();
    let (listener, connector) = MemoryListener::bind(addr(19133));
    let server = Server::new(listener, ServerOptions::default()).start();
    let client = Client::connect(&connector, ClientOptions::offline("Alex"))
        .await
        .unwrap();

    let player = loop {
        match next_server_event(&server).await {
            ServerEvent::PlayerConnect { player, .. } => break player,
            _ => continue,
        }
    };

    client.send(GamePacket::Text(Text::chat("Alex", "hello server")));
    loop {
        match next_server_event(&server).await {
            ServerEvent::PlayerPacket { frame, .. } if frame.name == Some(PacketName::Text) => {
                match Catalog::bedrock().deserialize(&frame.bytes).unwrap() {
                    GamePacket::Text(text) => {
                        assert_eq!(text.message, "hello server");
                        break;
                    }
                    other => panic!("expected Text, got {other:?}"),
                }
            }
            ServerEvent::PlayerDisconnect { reason, .. } => panic!("disconnected: {reason:?}"),
            _ => continue,
        }
    }

    player.send(GamePacket::Text(Text::chat("server", "hello client")));
    let event = timeout(Duration::from_secs(5), client.next_event())
        .await
        .unwrap()
        .unwrap();
    match event {
        bedrock_pipeline::client::ClientEvent::Packet(frame) => {
            match Catalog::bedrock().deserialize(&frame.bytes).unwrap() {
                GamePacket::Text(text) => assert_eq!(text.message, "hello client"),
                other => panic!("expected Text, got {other:?}"),
            }
        }
        other => panic!("unexpected event {other:?}"),
    }
}

/// Builds a client session plus the receiver observing what it sends.
fn manual_client(username: &str) -> (Session, DatagramReceiver) {
    let (local, remote) = transport::link(addr(1), addr(2));
    let keypair = KeyPair::generate();
    let payload = Payload::offline(username, "127.0.0.1:2");
    let chain = auth::create_offline(&keypair, username, &payload).unwrap();
    let session = Session::new_client(local.sender, keypair, chain, SessionConfig::default());
    (session, remote.receiver)
}

fn batch_of(packet: &GamePacket) -> Vec<u8> {
    let frame = Catalog::serialize(packet);
    let mut batch = vec![GAME_PACKET_HEADER];
    batch.extend(framer::frame([frame.as_slice()]));
    batch
}

#[test]
fn threshold_gates_the_method_byte() {
    // Hand the client a NetworkSettings response so compression (zlib,
    // threshold 512) is active but encryption is not yet.
    let (mut session, peer_rx) = manual_client("Steve");
    session.start().unwrap();
    let _request = peer_rx.try_recv().unwrap();

    let settings = GamePacket::NetworkSettings(NetworkSettings {
        compression_threshold: 512,
        compression_algorithm: 0,
        client_throttle: false,
        throttle_threshold: 0,
        throttle_scalar: 0.0,
    });
    let mut events = Vec::new();
    session.on_datagram(&batch_of(&settings), &mut events).unwrap();

    // The Login the session responded with is far over the threshold.
    let login_batch = peer_rx.try_recv().expect("client should have sent Login");
    assert_eq!(login_batch[0], GAME_PACKET_HEADER);
    assert_eq!(login_batch[1], 0x00, "large batch should be zlib");

    // A tiny packet stays verbatim behind a "none" method byte.
    let small = GamePacket::RequestChunkRadius(RequestChunkRadius {
        radius: 8,
        max_radius: 32,
    });
    session.send(&small).unwrap();
    let small_batch = peer_rx.try_recv().unwrap();
    assert_eq!(small_batch[0], GAME_PACKET_HEADER);
    assert_eq!(small_batch[1], 0xFF, "small batch should carry no deflate");
    let frame = Catalog::serialize(&small);
    assert_eq!(&small_batch[2..], framer::frame([frame.as_slice()]).as_slice());
}

/// Drives both sessions until neither has pending datagrams.
fn shuttle(
    client: &mut Session,
    client_out: &DatagramReceiver,
    server: &mut Session,
    server_out: &DatagramReceiver,
) -> Result<Vec<SessionEvent>, SessionError> {
    let mut events = Vec::new();
    loop {
        let mut progressed = false;
        while let Some(datagram) = client_out.try_recv() {
            server.on_datagram(&datagram, &mut events)?;
            progressed = true;
        }
        while let Some(datagram) = server_out.try_recv() {
            client.on_datagram(&datagram, &mut events)?;
            progressed = true;
        }
        if !progressed {
            return Ok(events);
        }
    }
}

fn linked_pair(username: &str) -> (Session, DatagramReceiver, Session, DatagramReceiver) {
    let server_addr = addr(19132);
    linked_pair_with(username, &server_addr.to_string())
}

/// Like [`linked_pair`], but the client's payload advertises an arbitrary
/// destination instead of the server's real address.
fn linked_pair_with(
    username: &str,
    advertised: &str,
) -> (Session, DatagramReceiver, Session, DatagramReceiver) {
    let client_addr = addr(40000);
    let server_addr = addr(19132);
    let (client_end, server_end) = transport::link(client_addr, server_addr);

    let keypair = KeyPair::generate();
    let payload = Payload::offline(username, advertised);
    let chain = auth::create_offline(&keypair, username, &payload).unwrap();

    let (client_sender, client_driver_rx) = client_end.split();
    let (server_sender, server_driver_rx) = server_end.split();
    let client = Session::new_client(client_sender, keypair, chain, SessionConfig::default());
    let server_config = SessionConfig {
        server_address: server_addr.to_string(),
        ..SessionConfig::default()
    };
    let server = Session::new_server(server_sender, KeyPair::generate(), server_config);
    // client_driver_rx sees what the server sent and vice versa
    (client, server_driver_rx, server, client_driver_rx)
}

#[test]
fn encrypted_stream_survives_a_thousand_messages() {
    init_tracing();
    let (mut client, client_out, mut server, server_out) = linked_pair("Steve");
    client.start().unwrap();
    let events = shuttle(&mut client, &client_out, &mut server, &server_out).unwrap();
    assert!(
        events
            .iter()
            .any(|e| matches!(e, SessionEvent::LoggedIn)),
        "handshake should complete"
    );
    assert_eq!(client.state(), SessionState::LoggedIn);
    assert_eq!(server.state(), SessionState::LoggedIn);

    for i in 0..1000 {
        client
            .send(&GamePacket::Text(Text::chat("Steve", &format!("msg {i}"))))
            .unwrap();
    }
    let events = shuttle(&mut client, &client_out, &mut server, &server_out).unwrap();
    let texts = events
        .iter()
        .filter(|e| matches!(e, SessionEvent::Packet(f) if f.name == Some(PacketName::Text)))
        .count();
    assert_eq!(texts, 1000);
}

#[test]
fn tampered_ciphertext_kills_the_session() {
    init_tracing();
    let (mut client, client_out, mut server, server_out) = linked_pair("Steve");
    client.start().unwrap();
    shuttle(&mut client, &client_out, &mut server, &server_out).unwrap();

    for i in 0..499 {
        client
            .send(&GamePacket::Text(Text::chat("Steve", &format!("msg {i}"))))
            .unwrap();
    }
    shuttle(&mut client, &client_out, &mut server, &server_out).unwrap();

    client
        .send(&GamePacket::Text(Text::chat("Steve", "the tampered one")))
        .unwrap();
    let mut datagram = client_out.try_recv().unwrap().to_vec();
    let middle = datagram.len() / 2;
    datagram[middle] ^= 0x01;

    let mut events = Vec::new();
    let err = server.on_datagram(&datagram, &mut events).unwrap_err();
    assert!(matches!(err, SessionError::Encryption(_)));
    server.fail(&err);
    assert_eq!(server.state(), SessionState::Disconnected);
}

#[test]
fn truncated_frame_is_dropped_but_the_session_survives() {
    init_tracing();
    let (mut session, peer_rx) = manual_client("Steve");
    session.start().unwrap();
    let _request = peer_rx.try_recv().unwrap();

    let settings = GamePacket::NetworkSettings(NetworkSettings {
        compression_threshold: 512,
        compression_algorithm: 0,
        client_throttle: false,
        throttle_threshold: 0,
        throttle_scalar: 0.0,
    });
    // One valid frame, then a length prefix of 10 with a single byte
    // behind it.
    let mut batch = batch_of(&settings);
    batch.extend([0x0A, 0x01]);

    let mut events = Vec::new();
    session.on_datagram(&batch, &mut events).unwrap();

    // The valid prefix of the batch was processed: compression came up
    // and the Login went out; the truncated remainder was dropped.
    assert_eq!(session.state(), SessionState::AwaitHandshake);
    assert!(peer_rx.try_recv().is_some(), "Login should still be sent");

    // A batch that is nothing but garbage is also non-fatal.
    session
        .on_datagram(&[GAME_PACKET_HEADER, 0xFF, 0x7F, 0x01], &mut events)
        .unwrap();
    assert_eq!(session.state(), SessionState::AwaitHandshake);
}

#[test]
fn mismatched_server_address_is_rejected() {
    init_tracing();
    // The client's payload claims it is connecting somewhere else.
    let (mut client, client_out, mut server, server_out) =
        linked_pair_with("Steve", "10.9.8.7:19132");
    client.start().unwrap();

    let err = shuttle(&mut client, &client_out, &mut server, &server_out).unwrap_err();
    assert!(matches!(
        err,
        SessionError::Auth(AuthError::ServerAddressMismatch { .. })
    ));
    server.fail(&err);
    assert_eq!(server.state(), SessionState::Disconnected);
}

#[test]
fn login_before_network_settings_is_fatal() {
    init_tracing();
    let (_client, _client_out, mut server, _server_out) = linked_pair("Steve");
    // skip RequestNetworkSettings: hand the server a Login directly
    let login = GamePacket::Login(bedrock_pipeline::protocol::packet::Login {
        protocol_version: bedrock_pipeline::PROTOCOL_VERSION,
        chain_json: r#"{"chain":["a.b.c"]}"#.to_owned(),
        user_jwt: "a.b.c".to_owned(),
    });
    let mut events = Vec::new();
    let err = server
        .on_datagram(&batch_of(&login), &mut events)
        .unwrap_err();
    assert!(matches!(err, SessionError::Protocol(_)));
}

#[tokio::test]
async fn protocol_mismatch_is_rejected() {
    init_tracing();
    let (listener, connector) = MemoryListener::bind(addr(19134));
    let _server = Server::new(listener, ServerOptions::default()).start();

    let mut options = ClientOptions::offline("Old");
    options.protocol_version = 300;
    let result = Client::connect(&connector, options).await;
    assert!(result.is_err());
}
