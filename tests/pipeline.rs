//! End-to-end pipeline tests over an in-memory duplex transport, driving
//! the server side exactly the way a remote peer would: raw handshake
//! bytes, then hand-crafted chunk stream bytes.

use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use chunkwire::{
    ChunkwireError, ConnectionConfig, ConnectionHandle, Message, MessageType, Outcome, Pipeline,
    HANDSHAKE_SIZE, RTMP_VERSION,
};

fn connect() -> (
    DuplexStream,
    tokio::task::JoinHandle<chunkwire::Result<Outcome>>,
    ConnectionHandle,
    tokio::sync::mpsc::Receiver<Message>,
) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let (pipeline, handle, messages) = Pipeline::new(server, ConnectionConfig::default());
    let run = tokio::spawn(pipeline.run());
    (client, run, handle, messages)
}

/// Drive the client half of the handshake: send C0+C1, consume S0/S1/S2
/// (checking the S2 echo), send C2.
async fn client_handshake(client: &mut DuplexStream) {
    let c1 = vec![0x11u8; HANDSHAKE_SIZE];
    client.write_all(&[RTMP_VERSION]).await.unwrap();
    client.write_all(&c1).await.unwrap();

    let mut response = vec![0u8; 1 + HANDSHAKE_SIZE * 2];
    client.read_exact(&mut response).await.unwrap();
    assert_eq!(response[0], RTMP_VERSION);
    assert_eq!(&response[1 + HANDSHAKE_SIZE..], &c1[..]);

    // C2 echoes S1.
    client
        .write_all(&response[1..1 + HANDSHAKE_SIZE])
        .await
        .unwrap();
}

/// Type-0 chunk header for a small csid, zero timestamp.
fn fmt0_header(csid: u8, length: usize, type_id: u8, stream_id: u32) -> Vec<u8> {
    let mut header = vec![csid & 0x3F, 0, 0, 0];
    header.extend_from_slice(&(length as u32).to_be_bytes()[1..]);
    header.push(type_id);
    header.extend_from_slice(&stream_id.to_le_bytes());
    header
}

/// Wait until the handshake has installed the chunk context.
async fn streaming_context(handle: &ConnectionHandle) -> std::sync::Arc<chunkwire::ChunkStreamContext> {
    for _ in 0..200 {
        if let Some(ctx) = handle.chunk_context() {
            return ctx;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("handshake did not complete");
}

#[tokio::test]
async fn test_handshake_then_message_delivery() {
    let (mut client, run, _handle, mut messages) = connect();
    client_handshake(&mut client).await;

    let payload = b"connect command body";
    let mut wire = fmt0_header(3, payload.len(), 20, 1);
    wire.extend_from_slice(payload);
    client.write_all(&wire).await.unwrap();

    let msg = messages.recv().await.unwrap();
    assert_eq!(msg.message_type, MessageType::Amf0Command);
    assert_eq!(msg.stream_id, 1);
    assert_eq!(&msg.payload[..], payload);

    // Peer hangs up; the run winds down cleanly.
    drop(client);
    assert_eq!(run.await.unwrap().unwrap(), Outcome::Completed);
}

#[tokio::test]
async fn test_multi_chunk_message_reassembled() {
    let (mut client, run, _handle, mut messages) = connect();
    client_handshake(&mut client).await;

    // 300 payload bytes at the default 128-byte chunk size: a type-0
    // chunk then two type-3 continuations.
    let payload: Vec<u8> = (0..300).map(|i| (i % 251) as u8).collect();
    let mut wire = fmt0_header(4, payload.len(), 9, 1);
    wire.extend_from_slice(&payload[..128]);
    wire.push(0xC0 | 4);
    wire.extend_from_slice(&payload[128..256]);
    wire.push(0xC0 | 4);
    wire.extend_from_slice(&payload[256..]);
    client.write_all(&wire).await.unwrap();

    let msg = messages.recv().await.unwrap();
    assert_eq!(msg.message_type, MessageType::Video);
    assert_eq!(&msg.payload[..], &payload[..]);

    drop(client);
    assert_eq!(run.await.unwrap().unwrap(), Outcome::Completed);
}

#[tokio::test]
async fn test_bad_handshake_version_faults_the_run() {
    let (mut client, run, _handle, _messages) = connect();

    client.write_all(&[0x06]).await.unwrap();
    client.write_all(&[0u8; HANDSHAKE_SIZE]).await.unwrap();

    let result = run.await.unwrap();
    assert!(matches!(result, Err(ChunkwireError::Handshake(_))));
}

#[tokio::test]
async fn test_close_during_handshake_faults_the_run() {
    let (mut client, run, _handle, _messages) = connect();

    // Only part of C1 arrives before the peer disappears.
    client.write_all(&[RTMP_VERSION]).await.unwrap();
    client.write_all(&[0u8; 100]).await.unwrap();
    drop(client);

    let result = run.await.unwrap();
    assert!(matches!(result, Err(ChunkwireError::Handshake(_))));
}

#[tokio::test]
async fn test_graceful_close_after_handshake_completes() {
    let (mut client, run, _handle, _messages) = connect();
    client_handshake(&mut client).await;

    drop(client);
    assert_eq!(run.await.unwrap().unwrap(), Outcome::Completed);
}

#[tokio::test]
async fn test_disconnect_cancels_the_run() {
    let (_client, run, handle, _messages) = connect();

    handle.disconnect();
    // Repeat calls are harmless.
    handle.disconnect();

    assert_eq!(run.await.unwrap().unwrap(), Outcome::Cancelled);
    assert!(handle.is_closed());
}

#[tokio::test]
async fn test_disconnect_while_producer_throttled() {
    // A tiny resume threshold parks the producer in the buffer's
    // backpressure wait once the consumer stops draining; a disconnect
    // issued in that state must still end as a cancellation.
    let (client, server) = tokio::io::duplex(64 * 1024);
    let config = ConnectionConfig {
        resume_writer_threshold: 4,
        ..Default::default()
    };
    let (pipeline, handle, _messages) = Pipeline::new(server, config);
    let run = tokio::spawn(pipeline.run());

    let mut client = client;
    client.write_all(&[0u8; 101]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    // A second batch forces the producer into the throttled write.
    client.write_all(&[0u8; 40]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    handle.disconnect();
    assert_eq!(run.await.unwrap().unwrap(), Outcome::Cancelled);
}

#[tokio::test]
async fn test_outbound_multiplex_reaches_the_peer() {
    let (mut client, run, handle, _messages) = connect();
    client_handshake(&mut client).await;
    streaming_context(&handle).await;

    let body = Bytes::from_static(b"onStatus");
    let receipt = handle
        .multiplex_message(3, Message::new(MessageType::Amf0Command, 0, 1, body.clone()))
        .await
        .unwrap();
    receipt.await.unwrap();

    let mut wire = vec![0u8; 12 + body.len()];
    client.read_exact(&mut wire).await.unwrap();
    assert_eq!(wire[0], 0x03);
    assert_eq!(wire[7], 20);
    assert_eq!(&wire[12..], &body[..]);

    drop(client);
    assert_eq!(run.await.unwrap().unwrap(), Outcome::Completed);
}

#[tokio::test]
async fn test_acknowledgement_emitted_past_window() {
    let (mut client, run, handle, mut messages) = connect();
    client_handshake(&mut client).await;
    let ctx = streaming_context(&handle).await;
    ctx.set_window_acknowledgement_size(100);

    // 213 wire bytes (12 + 128 + 1 + 72), comfortably past the window.
    let payload = vec![0xABu8; 200];
    let mut wire = fmt0_header(5, payload.len(), 8, 1);
    wire.extend_from_slice(&payload[..128]);
    wire.push(0xC0 | 5);
    wire.extend_from_slice(&payload[128..]);
    client.write_all(&wire).await.unwrap();

    let msg = messages.recv().await.unwrap();
    assert_eq!(msg.message_type, MessageType::Audio);
    assert_eq!(msg.payload.len(), 200);

    // At least one acknowledgement comes back: csid 2, type 3, 4-byte
    // sequence number.
    let mut ack = vec![0u8; 16];
    client.read_exact(&mut ack).await.unwrap();
    assert_eq!(ack[0], 0x02);
    assert_eq!(ack[7], 3);

    drop(client);
    assert_eq!(run.await.unwrap().unwrap(), Outcome::Completed);
}

#[tokio::test]
async fn test_writes_after_disconnect_fail() {
    let (mut client, run, handle, _messages) = connect();
    client_handshake(&mut client).await;
    streaming_context(&handle).await;

    handle.disconnect();
    assert_eq!(run.await.unwrap().unwrap(), Outcome::Cancelled);

    let result = handle.send_raw(Bytes::from_static(b"late")).await;
    assert!(result.is_err());
}
