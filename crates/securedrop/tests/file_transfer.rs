//! File transfer between two connected managers

mod common;

use common::{connect, Fixture, Member};
use securedrop::channels::{encode_tagged_chunk, ControlFrame, FileMeta};
use securedrop::{
    ChunkFraming, DataLink, Direction, Error, MessagePayload, MessageStatus, OutgoingFile,
    SecureDropConfig, SessionEvent, TransferProgress,
};
use std::io::Write;

const FILE_SIZE: usize = 50_000;

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

async fn connected_pair(config: SecureDropConfig) -> (Fixture, Member, Member) {
    let fixture = Fixture::new();
    let mut alice = fixture.member_with("alice", config.clone());
    let mut bob = fixture.member_with("bob", config);
    connect(&mut alice, &mut bob).await;
    (fixture, alice, bob)
}

/// Progress reported to the receiver for `transfer_id`, in order
fn receive_progress(events: &[SessionEvent], transfer_id: &str) -> Vec<TransferProgress> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::FileProgress {
                transfer_id: id,
                progress,
            } if id == transfer_id => Some(*progress),
            _ => None,
        })
        .collect()
}

fn assert_progress_law(progress: &[TransferProgress], total: u64) {
    assert!(!progress.is_empty());
    assert!(progress
        .windows(2)
        .all(|w| w[0].transferred <= w[1].transferred));
    assert!(progress.iter().all(|p| p.total == total));
    assert_eq!(progress.iter().filter(|p| p.is_complete()).count(), 1);
    assert!(progress.last().unwrap().is_complete());
}

async fn round_trip(framing: ChunkFraming, chunk_size: usize) {
    let config = SecureDropConfig::default()
        .with_chunk_framing(framing)
        .with_chunk_size(chunk_size);
    let (_fixture, alice, mut bob) = connected_pair(config).await;

    let data = pattern(FILE_SIZE);
    let sent = alice
        .handle
        .send_file(OutgoingFile::from_bytes(
            "pattern.bin",
            Some("application/octet-stream"),
            data.clone(),
        ))
        .await
        .unwrap();
    assert_eq!(sent.status, MessageStatus::Sent);
    let transfer_id = sent.transfer_id().unwrap().to_string();

    let events = bob
        .collect_until(|e| matches!(e, SessionEvent::FileReceived(_)))
        .await;
    match events.last() {
        Some(SessionEvent::FileReceived(file)) => {
            assert_eq!(file.meta.id, transfer_id);
            assert_eq!(file.meta.name, "pattern.bin");
            assert_eq!(file.meta.size, FILE_SIZE as u64);
            assert_eq!(file.data.len(), FILE_SIZE);
            assert_eq!(&file.data[..], &data[..]);
        }
        other => panic!("unexpected event {:?}", other),
    }

    assert_progress_law(&receive_progress(&events, &transfer_id), FILE_SIZE as u64);
}

#[tokio::test]
async fn test_round_trip_raw_chunks() {
    for chunk_size in [1024, 16384, 65536, FILE_SIZE + 1] {
        round_trip(ChunkFraming::Raw, chunk_size).await;
    }
}

#[tokio::test]
async fn test_round_trip_tagged_chunks() {
    for chunk_size in [1024, 16384, 65536, FILE_SIZE + 1] {
        round_trip(ChunkFraming::Tagged, chunk_size).await;
    }
}

#[tokio::test]
async fn test_history_records_both_directions() {
    let (_fixture, alice, mut bob) = connected_pair(SecureDropConfig::default()).await;

    let sent = alice
        .handle
        .send_file(OutgoingFile::from_bytes("notes.txt", Some("text/plain"), "remember the milk"))
        .await
        .unwrap();

    bob.wait_event(|e| matches!(e, SessionEvent::FileReceived(_)))
        .await;

    let outgoing = alice.handle.messages().await;
    assert_eq!(outgoing.len(), 1);
    assert_eq!(outgoing[0].id, sent.id);
    assert_eq!(outgoing[0].direction, Direction::Outgoing);
    assert_eq!(outgoing[0].status, MessageStatus::Sent);

    let incoming = bob.handle.messages().await;
    assert_eq!(incoming.len(), 1);
    assert_eq!(incoming[0].direction, Direction::Incoming);
    assert_eq!(incoming[0].status, MessageStatus::Received);
    match &incoming[0].payload {
        MessagePayload::File {
            name, mime, data, ..
        } => {
            assert_eq!(name, "notes.txt");
            assert_eq!(mime.as_deref(), Some("text/plain"));
            assert_eq!(data.as_deref(), Some(&b"remember the milk"[..]));
        }
        other => panic!("unexpected payload {:?}", other),
    }
}

#[tokio::test]
async fn test_sender_progress_reaches_total() {
    let config = SecureDropConfig::default().with_chunk_size(4096);
    let (_fixture, mut alice, _bob) = connected_pair(config).await;

    let sent = alice
        .handle
        .send_file(OutgoingFile::from_bytes("a.bin", None, pattern(20_000)))
        .await
        .unwrap();
    let transfer_id = sent.transfer_id().unwrap().to_string();

    let events = alice
        .collect_until(|e| {
            matches!(e, SessionEvent::SendProgress { progress, .. } if progress.is_complete())
        })
        .await;
    let sent_bytes: Vec<u64> = events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::SendProgress {
                transfer_id: id,
                progress,
            } if *id == transfer_id => Some(progress.transferred),
            _ => None,
        })
        .collect();
    assert_eq!(sent_bytes.len(), 5);
    assert_eq!(sent_bytes.last(), Some(&20_000));
}

#[tokio::test]
async fn test_empty_file() {
    let (_fixture, alice, mut bob) = connected_pair(SecureDropConfig::default()).await;

    alice
        .handle
        .send_file(OutgoingFile::from_bytes("empty", None, Vec::new()))
        .await
        .unwrap();

    let events = bob
        .collect_until(|e| matches!(e, SessionEvent::FileReceived(_)))
        .await;
    match events.last() {
        Some(SessionEvent::FileReceived(file)) => {
            assert!(file.data.is_empty());
            assert_progress_law(&receive_progress(&events, &file.meta.id), 0);
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_concurrent_sends_arrive_intact() {
    for framing in [ChunkFraming::Raw, ChunkFraming::Tagged] {
        let config = SecureDropConfig::default()
            .with_chunk_framing(framing)
            .with_chunk_size(1024);
        let (_fixture, alice, mut bob) = connected_pair(config).await;

        let first = pattern(30_000);
        let second: Vec<u8> = pattern(20_000).into_iter().rev().collect();
        let (a, b) = tokio::join!(
            alice
                .handle
                .send_file(OutgoingFile::from_bytes("first", None, first.clone())),
            alice
                .handle
                .send_file(OutgoingFile::from_bytes("second", None, second.clone())),
        );
        a.unwrap();
        b.unwrap();

        let mut received = Vec::new();
        while received.len() < 2 {
            if let SessionEvent::FileReceived(file) = bob
                .wait_event(|e| matches!(e, SessionEvent::FileReceived(_)))
                .await
            {
                received.push(file);
            }
        }
        received.sort_by(|x, y| x.meta.name.cmp(&y.meta.name));
        assert_eq!(&received[0].data[..], &first[..]);
        assert_eq!(&received[1].data[..], &second[..]);
    }
}

#[tokio::test]
async fn test_send_file_from_disk() {
    let (_fixture, alice, mut bob) = connected_pair(SecureDropConfig::default()).await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("report.csv");
    let content = pattern(70_000);
    std::fs::File::create(&path)
        .unwrap()
        .write_all(&content)
        .unwrap();

    let file = OutgoingFile::open(&path).await.unwrap();
    alice.handle.send_file(file).await.unwrap();

    match bob
        .wait_event(|e| matches!(e, SessionEvent::FileReceived(_)))
        .await
    {
        SessionEvent::FileReceived(file) => {
            assert_eq!(file.meta.name, "report.csv");
            assert_eq!(file.meta.mime.as_deref(), Some("text/csv"));
            assert_eq!(&file.data[..], &content[..]);
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_send_file_without_session() {
    let fixture = Fixture::new();
    let alice = fixture.member("alice");

    let result = alice
        .handle
        .send_file(OutgoingFile::from_bytes("a.bin", None, vec![1, 2, 3]))
        .await;
    assert!(matches!(result, Err(Error::ChannelNotOpen(_))));
    assert!(alice.handle.messages().await.is_empty());
}

#[tokio::test]
async fn test_protocol_violations_are_dropped() {
    let (fixture, alice, mut bob) = connected_pair(SecureDropConfig::default()).await;
    let link = fixture.network.data_link("alice").unwrap();

    // Chunk without an announced transfer, malformed and unknown control frames
    link.send_binary(bytes::Bytes::from_static(b"orphan")).await.unwrap();
    link.send_text("{not json").await.unwrap();
    link.send_text(r#"{"type":"reaction","emoji":"+1"}"#).await.unwrap();
    link.send_text(&ControlFrame::FileComplete {
        id: "never-announced".to_string(),
    }
    .to_json()
    .unwrap())
        .await
        .unwrap();

    alice.handle.send_message("still fine").await.unwrap();
    bob.wait_event(|e| matches!(e, SessionEvent::MessageAppended(m) if m.text() == Some("still fine")))
        .await;

    assert_eq!(bob.handle.messages().await.len(), 1);
    assert_eq!(bob.handle.state(), common::chat_with("alice"));
}

#[tokio::test]
async fn test_size_mismatch_fails_transfer() {
    let (fixture, _alice, mut bob) = connected_pair(SecureDropConfig::default()).await;
    let link = fixture.network.data_link("alice").unwrap();

    let meta = FileMeta {
        id: "t-short".to_string(),
        name: "short.bin".to_string(),
        size: 10,
        mime: None,
    };
    link.send_text(&ControlFrame::FileMeta { meta }.to_json().unwrap())
        .await
        .unwrap();
    link.send_binary(bytes::Bytes::from_static(b"abcd")).await.unwrap();
    link.send_text(&ControlFrame::FileComplete {
        id: "t-short".to_string(),
    }
    .to_json()
    .unwrap())
        .await
        .unwrap();

    let event = bob
        .wait_event(|e| matches!(e, SessionEvent::TransferFailed { .. }))
        .await;
    assert_eq!(
        event,
        SessionEvent::TransferFailed {
            transfer_id: Some("t-short".to_string()),
            reason: securedrop::ProtocolViolation::SizeMismatch {
                id: "t-short".to_string(),
                received: 4,
                size: 10,
            }
            .to_string(),
        }
    );

    let history = bob.handle.messages().await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, MessageStatus::Failed);
}

#[tokio::test]
async fn test_oversized_announcement_rejected() {
    let mut config = SecureDropConfig::default();
    config.transfer.max_incoming_file_size = 1024;
    let (fixture, _alice, mut bob) = connected_pair(config).await;
    let link = fixture.network.data_link("alice").unwrap();

    let meta = FileMeta {
        id: "t-big".to_string(),
        name: "big.iso".to_string(),
        size: 4096,
        mime: None,
    };
    link.send_text(&ControlFrame::FileMeta { meta }.to_json().unwrap())
        .await
        .unwrap();

    let event = bob
        .wait_event(|e| matches!(e, SessionEvent::TransferFailed { .. }))
        .await;
    assert!(matches!(
        event,
        SessionEvent::TransferFailed { transfer_id: Some(id), .. } if id == "t-big"
    ));
    assert!(bob.handle.messages().await.is_empty());
}

#[tokio::test]
async fn test_tagged_chunks_for_unknown_transfer() {
    let config = SecureDropConfig::default().with_chunk_framing(ChunkFraming::Tagged);
    let (fixture, _alice, mut bob) = connected_pair(config).await;
    let link = fixture.network.data_link("alice").unwrap();

    link.send_binary(encode_tagged_chunk("ghost", b"boo").unwrap())
        .await
        .unwrap();

    let event = bob
        .wait_event(|e| matches!(e, SessionEvent::TransferFailed { .. }))
        .await;
    assert!(matches!(
        event,
        SessionEvent::TransferFailed { transfer_id: Some(id), .. } if id == "ghost"
    ));
}

#[tokio::test]
async fn test_session_end_discards_pending_transfer() {
    let (fixture, alice, mut bob) = connected_pair(SecureDropConfig::default()).await;
    let link = fixture.network.data_link("alice").unwrap();

    let meta = FileMeta {
        id: "t-pending".to_string(),
        name: "half.bin".to_string(),
        size: 100,
        mime: None,
    };
    link.send_text(&ControlFrame::FileMeta { meta }.to_json().unwrap())
        .await
        .unwrap();
    bob.wait_event(|e| matches!(e, SessionEvent::FileStarted(_)))
        .await;

    alice.handle.end().await.unwrap();

    let event = bob
        .wait_event(|e| matches!(e, SessionEvent::TransferFailed { .. }))
        .await;
    assert!(matches!(
        event,
        SessionEvent::TransferFailed { transfer_id: Some(id), .. } if id == "t-pending"
    ));
    bob.wait_idle().await;
}
