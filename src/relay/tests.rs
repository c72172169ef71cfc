//! Body relay tests

use super::*;
use crate::cluster::protocol::{FrameReader, DEFAULT_MAX_FRAME_SIZE};
use pretty_assertions::assert_eq;

fn relay_in(dir: &Path, chunk_size: usize, threshold: usize) -> BodyRelay {
    BodyRelay::new(&RelayConfig {
        chunk_size,
        large_message_threshold: threshold,
        spool_dir: dir.to_path_buf(),
    })
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

async fn collect(relay: &BodyRelay, body: &Body) -> Vec<Bytes> {
    let mut chunks = relay.relay(body);
    let mut out = Vec::new();
    while let Some(chunk) = chunks.next().await {
        out.push(chunk.unwrap());
    }
    out
}

#[tokio::test]
async fn test_small_body_stays_inline_and_relays_as_one_unit() {
    let dir = tempfile::tempdir().unwrap();
    let relay = relay_in(dir.path(), 16, 64);

    let body = relay.spool(&b"short body"[..]).await.unwrap();
    assert!(!body.is_large());

    let chunks = collect(&relay, &body).await;
    assert_eq!(chunks.len(), 1);
    assert_eq!(&chunks[0][..], b"short body");
}

#[tokio::test]
async fn test_long_inline_body_is_sliced_into_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let relay = relay_in(dir.path(), 1000, 4096);
    let data = pattern(50_500);

    // Built in memory, bypassing the spooling threshold
    let body = Body::from(data.clone());
    assert!(!body.is_large());

    let chunks = collect(&relay, &body).await;
    assert_eq!(chunks.len(), 51);
    assert!(chunks.iter().all(|c| c.len() <= 1000));
    let joined: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();
    assert_eq!(joined, data);
}

#[tokio::test]
async fn test_inline_body_frames_fit_the_frame_limit() {
    let dir = tempfile::tempdir().unwrap();
    let relay = relay_in(dir.path(), 64 * 1024, 100 * 1024);
    let data = pattern(DEFAULT_MAX_FRAME_SIZE + 4096);
    let body = Body::from(data.clone());

    let mut wire = Vec::new();
    let sent = relay.relay_to_peer(3, &body, &mut wire).await.unwrap();
    assert_eq!(sent, data.len() as u64);

    let mut reader = FrameReader::new(DEFAULT_MAX_FRAME_SIZE);
    let mut input = &wire[..];
    let mut received = Vec::with_capacity(data.len());
    let mut frames = 0usize;
    loop {
        match reader.read_message(&mut input).await.unwrap() {
            Some(ClusterMessage::BodyChunk { data, .. }) => {
                assert!(data.len() <= 64 * 1024);
                received.extend_from_slice(&data);
                frames += 1;
            }
            Some(ClusterMessage::BodyEnd { transfer_id }) => {
                assert_eq!(transfer_id, 3);
                break;
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }
    assert_eq!(frames, data.len().div_ceil(64 * 1024));
    assert!(received == data, "reassembled body differs");
}

#[tokio::test]
async fn test_relay_chunks_leaves_out_end_marker() {
    let dir = tempfile::tempdir().unwrap();
    let relay = relay_in(dir.path(), 100, 1000);
    let body = Body::from(pattern(250));

    let mut wire = Vec::new();
    relay.relay_chunks(9, &body, &mut wire).await.unwrap();

    let mut reader = FrameReader::new(DEFAULT_MAX_FRAME_SIZE);
    let mut input = &wire[..];
    let mut frames = Vec::new();
    while let Some(frame) = reader.read_message(&mut input).await.unwrap() {
        frames.push(frame.type_name());
    }
    assert_eq!(frames, vec!["BodyChunk", "BodyChunk", "BodyChunk"]);
}

#[tokio::test]
async fn test_large_body_is_spooled_and_chunked() {
    let dir = tempfile::tempdir().unwrap();
    let relay = relay_in(dir.path(), 1024, 4096);
    let data = pattern(10_000);

    let body = relay.spool(&data[..]).await.unwrap();
    assert!(body.is_large());
    assert_eq!(body.len(), 10_000);

    let chunks = collect(&relay, &body).await;
    assert_eq!(chunks.len(), 10);
    assert!(chunks.iter().all(|c| c.len() <= 1024));

    let joined: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();
    assert_eq!(joined, data);
}

#[tokio::test]
async fn test_spool_file_removed_when_last_clone_drops() {
    let dir = tempfile::tempdir().unwrap();
    let relay = relay_in(dir.path(), 512, 1024);

    let body = relay.spool(&pattern(5000)[..]).await.unwrap();
    let path = match &body {
        Body::Large(large) => large.path().to_path_buf(),
        Body::Inline(_) => panic!("expected a spooled body"),
    };
    let copy = body.clone();
    drop(body);
    assert!(path.exists());
    drop(copy);
    assert!(!path.exists());
}

#[tokio::test]
async fn test_copy_to_writes_identical_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let relay = relay_in(dir.path(), 700, 2000);
    let data = pattern(9_999);

    let body = relay.spool(&data[..]).await.unwrap();
    let mut out = Vec::new();
    let written = relay.copy_to(&body, &mut out).await.unwrap();

    assert_eq!(written, 9_999);
    assert_eq!(out, data);
}

#[tokio::test]
async fn test_relay_to_peer_round_trip_through_assembler() {
    let dir = tempfile::tempdir().unwrap();
    let relay = relay_in(dir.path(), 256, 1000);

    for len in [0usize, 10, 1000, 1001, 20_000] {
        let data = pattern(len);
        let body = relay.spool(&data[..]).await.unwrap();

        let mut wire = Vec::new();
        let sent = relay.relay_to_peer(7, &body, &mut wire).await.unwrap();
        assert_eq!(sent, len as u64);

        let mut reader = FrameReader::new(DEFAULT_MAX_FRAME_SIZE);
        let mut input = &wire[..];
        let mut assembler = relay.assembler(len as u64).await.unwrap();
        loop {
            match reader.read_message(&mut input).await.unwrap() {
                Some(ClusterMessage::BodyChunk { transfer_id, data }) => {
                    assert_eq!(transfer_id, 7);
                    assert!(data.len() <= 256);
                    assembler.push(&data).await.unwrap();
                }
                Some(ClusterMessage::BodyEnd { transfer_id }) => {
                    assert_eq!(transfer_id, 7);
                    break;
                }
                other => panic!("unexpected frame {:?}", other),
            }
        }

        let received = assembler.finish().await.unwrap();
        assert_eq!(received.is_large(), len > 1000);
        let mut out = Vec::new();
        relay.copy_to(&received, &mut out).await.unwrap();
        assert_eq!(out, data, "body of {} bytes differs", len);
    }
}

#[tokio::test]
async fn test_assembler_rejects_short_body() {
    let dir = tempfile::tempdir().unwrap();
    let relay = relay_in(dir.path(), 16, 32);

    let mut assembler = relay.assembler(100).await.unwrap();
    assembler.push(&[1u8; 40]).await.unwrap();
    assert!(matches!(
        assembler.finish().await,
        Err(RelayError::Interrupted(_))
    ));

    // The partial spool file is discarded
    let leftover = std::fs::read_dir(dir.path()).unwrap().count();
    assert_eq!(leftover, 0);
}

#[tokio::test]
async fn test_assembler_rejects_overrun() {
    let dir = tempfile::tempdir().unwrap();
    let relay = relay_in(dir.path(), 16, 32);

    let mut assembler = relay.assembler(4).await.unwrap();
    assert!(assembler.push(b"12345").await.is_err());
}

#[tokio::test]
async fn test_truncated_spool_file_interrupts_relay() {
    let dir = tempfile::tempdir().unwrap();
    let relay = relay_in(dir.path(), 128, 256);

    let body = relay.spool(&pattern(4096)[..]).await.unwrap();
    if let Body::Large(large) = &body {
        std::fs::write(large.path(), pattern(100)).unwrap();
    }

    let mut sink = Vec::new();
    let err = relay.copy_to(&body, &mut sink).await.unwrap_err();
    assert!(matches!(err, RelayError::Interrupted(_)));
}
