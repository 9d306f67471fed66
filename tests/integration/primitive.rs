use std::time::Duration;

use ghostline::primitive::{qword_at, Operation, CORRUPT_ORIGINAL_SIZE, WRITE_ORIGINAL_SIZE};
use ghostline::{MemoryPrimitive, PrimitiveError};
use ghostline_core::compress::decompress;
use ghostline_core::wire;

use crate::*;

const TRANSFORM_HEADER_LEN: usize = 16;

/// Split a compression transform into (original size, prefix, compressed).
fn split_transform(msg: &[u8]) -> (u32, &[u8], &[u8]) {
    assert_eq!(&msg[..4], &wire::COMPRESSED_PROTOCOL_ID);
    let original_size = u32::from_le_bytes(msg[4..8].try_into().unwrap());
    let offset = u32::from_le_bytes(msg[12..16].try_into().unwrap()) as usize;
    let rest = &msg[TRANSFORM_HEADER_LEN..];
    (original_size, &rest[..offset], &rest[offset..])
}

/// Answer every negotiate, ignore everything after it.
fn negotiate_only(_conn: usize, msg: usize) -> Option<Vec<u8>> {
    (msg == 0).then(echo)
}

#[tokio::test]
async fn write_sends_payload_then_compressed_filler() {
    let mut peer = FakePeer::spawn(negotiate_only).await.unwrap();
    let primitive = MemoryPrimitive::new(peer.target(), settings(), layout());

    let addr = 0xFFFF_F780_0000_0900;
    primitive.write(b"payload!", addr).await.unwrap();

    let conns = peer.connections(1).await.unwrap();
    let messages = &conns[0];
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0], wire::negotiate_request().to_vec());

    let (original_size, prefix, compressed) = split_transform(&messages[1]);
    assert_eq!(original_size, WRITE_ORIGINAL_SIZE);
    assert_eq!(prefix, b"payload!");

    let filler = decompress(compressed, true).unwrap();
    let fill = 0x1100 - 8;
    assert_eq!(filler.len(), fill + 0x18 + 8);
    assert!(filler[..fill].iter().all(|b| *b == 0x41));
    assert_eq!(qword_at(&filler, filler.len() - 8), Some(addr));
}

#[tokio::test]
async fn corrupt_overruns_by_offset() {
    let mut peer = FakePeer::spawn(negotiate_only).await.unwrap();
    let primitive = MemoryPrimitive::new(peer.target(), settings(), layout());

    let pointer = 0xFFFF_F780_0000_0900u64.to_le_bytes();
    primitive.corrupt(&pointer, 0x38).await.unwrap();

    let conns = peer.connections(1).await.unwrap();
    let (original_size, prefix, compressed) = split_transform(&conns[0][1]);
    assert_eq!(original_size, CORRUPT_ORIGINAL_SIZE);
    assert_eq!(prefix.len(), 0x1100 + 0x38);
    assert!(prefix.iter().all(|b| *b == 0x33));
    assert_eq!(&compressed[compressed.len() - 2..], &[0x37, 0x13]);

    // Only a lenient decoder gets past the trailer.
    assert!(decompress(compressed, true).is_err());
    assert_eq!(decompress(compressed, false).unwrap(), pointer.to_vec());
}

#[tokio::test]
async fn read_returns_first_leak() {
    let stub = 0x0000_0001_0006_00E9;
    let mut peer = FakePeer::spawn(move |conn, msg| match (conn, msg) {
        (2, 0) => Some(leak(stub)),
        (_, 0) => Some(echo()),
        _ => None,
    })
    .await
    .unwrap();
    let config = settings();
    let primitive = MemoryPrimitive::new(peer.target(), config.clone(), layout());

    let phys = 0x1_2345_6ABC;
    let data = primitive.read(phys).await.unwrap().expect("leak");
    assert_eq!(qword_at(&data, 0), Some(stub));

    let conns = peer.connections(3).await.unwrap();

    // Descriptor planted by the write.
    let (_, descriptor, compressed) = split_transform(&conns[0][1]);
    assert_eq!(descriptor.len(), 0x48);
    assert_eq!(qword_at(descriptor, 48), Some(phys >> 12));
    let filler = decompress(compressed, true).unwrap();
    assert_eq!(qword_at(&filler, filler.len() - 8), Some(config.descriptor_va));

    // Buffer header pointed at it.
    let (_, prefix, compressed) = split_transform(&conns[1][1]);
    assert_eq!(prefix.len(), 0x1100 + 0x38);
    assert_eq!(
        decompress(compressed, false).unwrap(),
        config.descriptor_va.to_le_bytes().to_vec()
    );

    // The leaking probe was the last connection.
    assert_eq!(conns[2].len(), 1);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(peer.drain(), 0);
}

#[tokio::test]
async fn read_gives_up_after_every_attempt_echoes() {
    let mut peer = FakePeer::spawn(negotiate_only).await.unwrap();
    let primitive = MemoryPrimitive::new(peer.target(), settings(), layout());

    assert!(primitive.read(0x1000).await.unwrap().is_none());

    // 3 attempts of write, corrupt and 3 probes.
    let conns = peer.connections(15).await.unwrap();
    for attempt in conns.chunks(5) {
        assert_eq!(attempt[0].len(), 2);
        assert_eq!(attempt[1].len(), 2);
        assert!(attempt[2..].iter().all(|probe| probe.len() == 1));
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(peer.drain(), 0);
}

#[tokio::test]
async fn silent_probes_count_as_misses() {
    let mut peer = FakePeer::spawn(|conn, msg| (conn % 5 < 2 && msg == 0).then(echo))
        .await
        .unwrap();
    let primitive = MemoryPrimitive::new(peer.target(), settings(), layout());

    assert!(primitive.read(0x1000).await.unwrap().is_none());
    peer.connections(15).await.unwrap();
}

#[tokio::test]
async fn short_probe_answer_is_not_a_leak() {
    let mut peer = FakePeer::spawn(|conn, msg| match (conn % 5, msg) {
        (step, 0) if step >= 2 => Some(vec![0x00, 0x00, 0x00]),
        (_, 0) => Some(echo()),
        _ => None,
    })
    .await
    .unwrap();
    let primitive = MemoryPrimitive::new(peer.target(), settings(), layout());

    assert!(primitive.read(0x1000).await.unwrap().is_none());
    peer.connections(15).await.unwrap();
}

#[tokio::test]
async fn read_setup_timeout_moves_to_next_attempt() {
    let stub = 0x0000_0001_0006_00E9;
    // The first write never gets a negotiate answer; the second attempt
    // leaks on its first probe.
    let mut peer = FakePeer::spawn(move |conn, msg| match (conn, msg) {
        (0, _) => None,
        (3, 0) => Some(leak(stub)),
        (_, 0) => Some(echo()),
        _ => None,
    })
    .await
    .unwrap();
    let primitive = MemoryPrimitive::new(peer.target(), settings(), layout());

    let data = primitive.read(0x1000).await.unwrap().expect("leak");
    assert_eq!(qword_at(&data, 0), Some(stub));

    let conns = peer.connections(4).await.unwrap();
    assert_eq!(conns[0].len(), 1);
    assert_eq!(conns[1].len(), 2);
    assert_eq!(conns[2].len(), 2);
    assert_eq!(conns[3].len(), 1);
}

#[tokio::test]
async fn read_from_silent_peer_is_no_data() {
    let mut peer = FakePeer::spawn(|_, _| None).await.unwrap();
    let primitive = MemoryPrimitive::new(peer.target(), settings(), layout());

    assert!(primitive.read(0x1000).await.unwrap().is_none());

    // Each attempt stops at its write.
    let conns = peer.connections(3).await.unwrap();
    assert!(conns.iter().all(|c| c.len() == 1));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(peer.drain(), 0);
}

#[tokio::test]
async fn write_to_silent_peer_fails() {
    let peer = FakePeer::spawn(|_, _| None).await.unwrap();
    let primitive = MemoryPrimitive::new(peer.target(), settings(), layout());

    let err = primitive.write(b"x", 0x1000).await.unwrap_err();
    assert!(err.is_timeout());
    match err {
        PrimitiveError::Session { op, source, .. } => {
            assert_eq!(op, Operation::Write);
            assert!(source.is_timeout());
        }
    }
}
