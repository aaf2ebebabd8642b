//! End-to-end scenarios for the man-in-the-middle persona: a real client
//! and a real server with the bridge in between.

use bedrock_pipeline::{
    bridge::{Bridge, BridgeEvent, BridgeOptions},
    client::{Client, ClientEvent, ClientOptions},
    protocol::{
        catalog::Catalog,
        packet::{ClientCacheStatus, GamePacket, LevelChunk, PacketName, Text},
    },
    server::{Server, ServerEvent, ServerHandle, ServerOptions},
};
use bytes::Bytes;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::time::timeout;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{port}").parse().unwrap()
}

struct Harness {
    server: ServerHandle,
    bridge: bedrock_pipeline::bridge::BridgeHandle,
    client: Client,
}

/// Real server on one listener, bridge on another, client connected
/// through the bridge.
async fn bridged(
    server_port: u16,
    bridge_port: u16,
    configure: impl FnOnce(&mut Bridge),
    on_player_connect: Option<Vec<GamePacket>>,
) -> Harness {
    init_tracing();
    let (server_listener, server_connector) =
        bedrock_pipeline::transport::MemoryListener::bind(addr(server_port));
    let server = Server::new(server_listener, ServerOptions::default()).start();

    let (bridge_listener, bridge_connector) =
        bedrock_pipeline::transport::MemoryListener::bind(addr(bridge_port));
    let mut bridge = Bridge::new(
        bridge_listener,
        Arc::new(server_connector),
        BridgeOptions::default(),
    );
    configure(&mut bridge);
    let bridge = bridge.start();

    // Optionally shove packets at the player the moment its login chain
    // verifies, i.e. well before StartGame exists clientbound.
    let server = if let Some(packets) = on_player_connect {
        let (events_tx, events_rx) = flume::unbounded();
        let inner = server;
        tokio::spawn(async move {
            while let Some(event) = inner.next_event().await {
                if let ServerEvent::PlayerConnect { player, .. } = &event {
                    for packet in &packets {
                        player.send(packet.clone());
                    }
                }
                if events_tx.send(event).is_err() {
                    break;
                }
            }
        });
        ServerHandle::from_events(events_rx)
    } else {
        server
    };

    let client = Client::connect(&bridge_connector, ClientOptions::offline("Steve"))
        .await
        .expect("bridged login should succeed");

    Harness {
        server,
        bridge,
        client,
    }
}

async fn next_server_event(server: &ServerHandle) -> ServerEvent {
    timeout(Duration::from_secs(5), server.next_event())
        .await
        .expect("timed out waiting for server event")
        .expect("server event stream ended")
}

async fn next_client_packet(client: &Client) -> bedrock_pipeline::session::PacketFrame {
    loop {
        let event = timeout(Duration::from_secs(5), client.next_event())
            .await
            .expect("timed out waiting for client event")
            .expect("client event stream ended");
        match event {
            ClientEvent::Packet(frame) => return frame,
            ClientEvent::Disconnected { reason } => panic!("disconnected: {reason:?}"),
        }
    }
}

/// Skips unrelated traffic (e.g. the loading-screen notification the
/// spawn sequence produces) until a packet of the wanted name arrives.
async fn next_player_packet(
    server: &ServerHandle,
    name: PacketName,
) -> bedrock_pipeline::session::PacketFrame {
    loop {
        match next_server_event(server).await {
            ServerEvent::PlayerPacket { frame, .. } if frame.name == Some(name) => return frame,
            ServerEvent::PlayerDisconnect { reason, .. } => panic!("disconnected: {reason:?}"),
            _ => continue,
        }
    }
}

#[tokio::test]
async fn transparent_passthrough_preserves_bytes() {
    let harness = bridged(20132, 20200, |_| {}, None).await;

    match timeout(Duration::from_secs(5), harness.bridge.next_event())
        .await
        .unwrap()
        .unwrap()
    {
        BridgeEvent::Connect { profile, .. } => assert_eq!(profile.display_name, "Steve"),
        other => panic!("expected Connect, got {other:?}"),
    }

    // The real server saw exactly one player; grab its handle before
    // packet events start flowing.
    let player = loop {
        match next_server_event(&harness.server).await {
            ServerEvent::PlayerConnect { player, .. } => break player,
            _ => continue,
        }
    };

    // Serverbound: raw frame in, identical bytes out the far side.
    let frame = Bytes::from(Catalog::serialize(&GamePacket::Text(Text::chat(
        "Steve",
        "unobserved message",
    ))));
    harness.client.send_raw(frame.clone());
    let received = next_player_packet(&harness.server, PacketName::Text).await;
    assert_eq!(received.bytes, frame, "serverbound bytes must be identical");

    // Clientbound mirrors.
    let clientbound = Bytes::from(Catalog::serialize(&GamePacket::Text(Text::chat(
        "server",
        "also unobserved",
    ))));
    player.send_raw(clientbound.clone());
    let received = next_client_packet(&harness.client).await;
    assert_eq!(received.bytes, clientbound, "clientbound bytes must be identical");
}

#[tokio::test]
async fn serverbound_modification_is_applied() {
    let harness = bridged(
        20133,
        20201,
        |bridge| {
            bridge.on_serverbound(PacketName::Text, |packet, signal| {
                if let GamePacket::Text(text) = packet {
                    text.message.push('.');
                    signal.modified = true;
                }
                Ok(())
            });
        },
        None,
    )
    .await;

    harness
        .client
        .send(GamePacket::Text(Text::chat("Steve", "hello")));
    let frame = next_player_packet(&harness.server, PacketName::Text).await;
    match Catalog::bedrock().deserialize(&frame.bytes).unwrap() {
        GamePacket::Text(text) => assert_eq!(text.message, "hello."),
        other => panic!("expected Text, got {other:?}"),
    }
}

#[tokio::test]
async fn cancelled_packets_never_arrive() {
    let harness = bridged(
        20134,
        20202,
        |bridge| {
            bridge.on_serverbound(PacketName::Text, |packet, signal| {
                if let GamePacket::Text(text) = packet {
                    if text.message == "secret" {
                        signal.cancelled = true;
                    }
                }
                Ok(())
            });
        },
        None,
    )
    .await;

    harness
        .client
        .send(GamePacket::Text(Text::chat("Steve", "secret")));
    harness
        .client
        .send(GamePacket::Text(Text::chat("Steve", "public")));

    // Only the second message survives; ordered delivery proves the
    // first was dropped rather than delayed.
    let frame = next_player_packet(&harness.server, PacketName::Text).await;
    match Catalog::bedrock().deserialize(&frame.bytes).unwrap() {
        GamePacket::Text(text) => assert_eq!(text.message, "public"),
        other => panic!("expected Text, got {other:?}"),
    }
}

#[tokio::test]
async fn cache_status_is_always_forced_off() {
    let harness = bridged(20135, 20203, |_| {}, None).await;

    harness
        .client
        .send(GamePacket::ClientCacheStatus(ClientCacheStatus {
            enabled: true,
        }));
    let frame = next_player_packet(&harness.server, PacketName::ClientCacheStatus).await;
    assert_eq!(frame.name, Some(PacketName::ClientCacheStatus));
    match Catalog::bedrock().deserialize(&frame.bytes).unwrap() {
        GamePacket::ClientCacheStatus(status) => {
            assert!(!status.enabled, "bridge must disable blob caching")
        }
        other => panic!("expected ClientCacheStatus, got {other:?}"),
    }
}

#[tokio::test]
async fn early_chunks_are_replayed_after_start_game_in_order() {
    let chunks: Vec<GamePacket> = (0..3)
        .map(|i| {
            GamePacket::LevelChunk(LevelChunk {
                x: i,
                z: -i,
                dimension: 0,
                sub_chunk_count: 1,
                cache_enabled: false,
                blob_hashes: Vec::new(),
                payload: Bytes::from(vec![i as u8; 16]),
            })
        })
        .collect();

    // The chunks are injected the instant the login chain verifies, long
    // before the pack exchange produces a StartGame.
    let harness = bridged(20136, 20204, |_| {}, Some(chunks)).await;

    // Client::connect resolving means StartGame was seen. The deferred
    // chunks must now arrive, in injection order.
    for expected_x in 0..3 {
        let frame = next_client_packet(&harness.client).await;
        assert_eq!(frame.name, Some(PacketName::LevelChunk));
        match Catalog::bedrock().deserialize(&frame.bytes).unwrap() {
            GamePacket::LevelChunk(chunk) => assert_eq!(chunk.x, expected_x),
            other => panic!("expected LevelChunk, got {other:?}"),
        }
    }
}
