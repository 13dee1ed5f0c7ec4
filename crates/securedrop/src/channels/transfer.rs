//! Chunked file transfer
//!
//! The sender announces a file with `file-meta`, streams its bytes as binary
//! chunks and finishes with `file-complete`. The receiver keeps one
//! [`TransferAssembler`] record per announced file until it completes.

use super::frame::{encode_tagged_chunk, ControlFrame, FileMeta};
use crate::config::{ChunkFraming, TransferConfig};
use crate::error::ProtocolViolation;
use crate::peer::DataLink;
use crate::{Error, Result};
use bytes::{Bytes, BytesMut};
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};

/// How often the sender re-checks a full send buffer
const BACKPRESSURE_POLL: Duration = Duration::from_millis(5);

/// Bytes moved so far for one transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub transferred: u64,
    pub total: u64,
}

impl TransferProgress {
    pub fn is_complete(&self) -> bool {
        self.transferred == self.total
    }
}

/// A fully received file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub meta: FileMeta,
    pub data: Bytes,
}

#[derive(Debug)]
struct PendingTransfer {
    meta: FileMeta,
    chunks: Vec<Bytes>,
    received: u64,
}

/// Receive-side transfer records
///
/// Records are keyed by transfer id and kept in announcement order.
#[derive(Debug)]
pub struct TransferAssembler {
    framing: ChunkFraming,
    max_file_size: u64,
    pending: Vec<PendingTransfer>,
}

impl TransferAssembler {
    pub fn new(framing: ChunkFraming, max_file_size: u64) -> Self {
        Self {
            framing,
            max_file_size,
            pending: Vec::new(),
        }
    }

    pub fn from_config(config: &TransferConfig) -> Self {
        Self::new(config.chunk_framing, config.max_incoming_file_size)
    }

    /// Number of transfers awaiting completion
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.pending.iter().any(|t| t.meta.id == id)
    }

    /// Allocate a record for an announced file
    pub fn begin(&mut self, meta: FileMeta) -> std::result::Result<(), ProtocolViolation> {
        if self.is_pending(&meta.id) {
            return Err(ProtocolViolation::DuplicateTransfer(meta.id));
        }

        if meta.size > self.max_file_size {
            return Err(ProtocolViolation::FileTooLarge {
                id: meta.id,
                size: meta.size,
                limit: self.max_file_size,
            });
        }

        debug!("Receiving file {} ({} bytes)", meta.id, meta.size);
        self.pending.push(PendingTransfer {
            meta,
            chunks: Vec::new(),
            received: 0,
        });
        Ok(())
    }

    /// Append a chunk to its transfer
    ///
    /// Returns the transfer id and, while the transfer is still short of its
    /// declared size, its progress. The progress that reaches the total is
    /// reported by [`complete`](Self::complete) instead. A chunk that
    /// overflows the declared size fails and discards the record.
    pub fn push_chunk(
        &mut self,
        transfer_id: Option<&str>,
        data: Bytes,
    ) -> std::result::Result<(String, Option<TransferProgress>), ProtocolViolation> {
        let index = self.bind_chunk(transfer_id)?;
        let record = &mut self.pending[index];

        let received = record.received + data.len() as u64;
        if received > record.meta.size {
            let failed = self.pending.remove(index);
            return Err(ProtocolViolation::SizeOverflow {
                id: failed.meta.id,
                size: failed.meta.size,
            });
        }

        record.received = received;
        record.chunks.push(data);

        let progress = (received < record.meta.size).then_some(TransferProgress {
            transferred: received,
            total: record.meta.size,
        });
        Ok((record.meta.id.clone(), progress))
    }

    fn bind_chunk(&self, transfer_id: Option<&str>) -> std::result::Result<usize, ProtocolViolation> {
        match (self.framing, transfer_id) {
            (ChunkFraming::Tagged, Some(id)) => self
                .pending
                .iter()
                .position(|t| t.meta.id == id)
                .ok_or_else(|| ProtocolViolation::UnknownTransfer(id.to_string())),
            (ChunkFraming::Tagged, None) => Err(ProtocolViolation::MalformedChunkHeader(
                "untagged chunk with tagged framing".to_string(),
            )),
            (ChunkFraming::Raw, _) => match self.pending.len() {
                0 => Err(ProtocolViolation::OrphanChunk),
                1 => Ok(0),
                n => Err(ProtocolViolation::AmbiguousChunk(n)),
            },
        }
    }

    /// Finish a transfer and assemble its bytes
    pub fn complete(
        &mut self,
        id: &str,
    ) -> std::result::Result<(ReceivedFile, TransferProgress), ProtocolViolation> {
        let index = self
            .pending
            .iter()
            .position(|t| t.meta.id == id)
            .ok_or_else(|| ProtocolViolation::UnknownTransfer(id.to_string()))?;
        let record = self.pending.remove(index);

        if record.received != record.meta.size {
            return Err(ProtocolViolation::SizeMismatch {
                id: record.meta.id,
                received: record.received,
                size: record.meta.size,
            });
        }

        let mut data = BytesMut::with_capacity(record.received as usize);
        for chunk in &record.chunks {
            data.extend_from_slice(chunk);
        }

        let progress = TransferProgress {
            transferred: record.received,
            total: record.meta.size,
        };
        Ok((
            ReceivedFile {
                meta: record.meta,
                data: data.freeze(),
            },
            progress,
        ))
    }

    /// Drop every pending record, returning their announcements
    pub fn abort_all(&mut self) -> Vec<FileMeta> {
        self.pending.drain(..).map(|t| t.meta).collect()
    }
}

/// A file queued for sending
pub struct OutgoingFile {
    pub name: String,
    pub mime: Option<String>,
    pub size: u64,
    source: Box<dyn AsyncRead + Send + Unpin>,
}

impl std::fmt::Debug for OutgoingFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutgoingFile")
            .field("name", &self.name)
            .field("mime", &self.mime)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

impl OutgoingFile {
    /// File backed by an in-memory buffer
    pub fn from_bytes(name: &str, mime: Option<&str>, data: impl Into<Bytes>) -> Self {
        let data: Bytes = data.into();
        Self {
            name: name.to_string(),
            mime: mime.map(str::to_string),
            size: data.len() as u64,
            source: Box::new(std::io::Cursor::new(data)),
        }
    }

    /// File read from any async source of known size
    pub fn from_reader(
        name: &str,
        mime: Option<&str>,
        size: u64,
        reader: impl AsyncRead + Send + Unpin + 'static,
    ) -> Self {
        Self {
            name: name.to_string(),
            mime: mime.map(str::to_string),
            size,
            source: Box::new(reader),
        }
    }

    /// Open a file from disk, guessing its MIME type from the extension
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::TransferError(format!("No file name in {}", path.display())))?;
        let mime = guess_mime(&name);

        Ok(Self::from_reader(&name, mime, size, file))
    }

    /// Announcement for this file under transfer id `id`
    pub fn meta(&self, id: &str) -> FileMeta {
        FileMeta {
            id: id.to_string(),
            name: self.name.clone(),
            size: self.size,
            mime: self.mime.clone(),
        }
    }
}

fn guess_mime(name: &str) -> Option<&'static str> {
    let ext = name.rsplit_once('.')?.1.to_ascii_lowercase();
    let mime = match ext.as_str() {
        "txt" | "log" => "text/plain",
        "md" => "text/markdown",
        "html" | "htm" => "text/html",
        "csv" => "text/csv",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        _ => return None,
    };
    Some(mime)
}

/// Send `file` over `link` as transfer `meta.id`
///
/// Emits `file-meta`, the chunks and `file-complete`, waiting while the
/// channel buffers more than `max_buffered_amount` bytes and yielding to the
/// scheduler every `yield_every_chunks` chunks. `on_progress` sees the byte
/// count after every chunk. Returns the number of payload bytes sent.
///
/// If the source ends before the announced size, `file-complete` is still
/// sent so the receiver discards its record, and an error is returned.
pub async fn stream_file<F>(
    link: &dyn DataLink,
    meta: &FileMeta,
    file: OutgoingFile,
    config: &TransferConfig,
    mut on_progress: F,
) -> Result<u64>
where
    F: FnMut(TransferProgress) + Send,
{
    if !link.is_open() {
        return Err(Error::ChannelNotOpen(format!(
            "cannot send {}: data channel '{}' is closed",
            meta.name,
            link.label()
        )));
    }

    link.send_text(&ControlFrame::FileMeta { meta: meta.clone() }.to_json()?)
        .await?;

    let mut source = file.source.take(meta.size);
    let mut buf = vec![0u8; config.chunk_size.max(1)];
    let mut sent = 0u64;
    let mut chunks = 0usize;

    loop {
        let filled = fill_chunk(&mut source, &mut buf).await?;
        if filled == 0 {
            break;
        }

        wait_for_buffer(link, config.max_buffered_amount).await?;

        let frame = match config.chunk_framing {
            ChunkFraming::Raw => Bytes::copy_from_slice(&buf[..filled]),
            ChunkFraming::Tagged => encode_tagged_chunk(&meta.id, &buf[..filled])?,
        };
        link.send_binary(frame).await?;

        sent += filled as u64;
        chunks += 1;
        on_progress(TransferProgress {
            transferred: sent,
            total: meta.size,
        });

        if chunks % config.yield_every_chunks.max(1) == 0 {
            tokio::task::yield_now().await;
        }
    }

    link.send_text(&ControlFrame::FileComplete { id: meta.id.clone() }.to_json()?)
        .await?;

    if sent != meta.size {
        warn!(
            "Source for {} ended after {} of {} bytes",
            meta.id, sent, meta.size
        );
        return Err(Error::TransferError(format!(
            "{} ended after {} of {} bytes",
            meta.name, sent, meta.size
        )));
    }

    debug!("Sent file {} in {} chunks", meta.id, chunks);
    Ok(sent)
}

/// Read until `buf` is full or the source is exhausted
async fn fill_chunk<R: AsyncRead + Unpin>(source: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

async fn wait_for_buffer(link: &dyn DataLink, max_buffered: usize) -> Result<()> {
    loop {
        if !link.is_open() {
            return Err(Error::ChannelNotOpen(
                "data channel closed during transfer".to_string(),
            ));
        }
        if link.buffered_amount().await <= max_buffered {
            return Ok(());
        }
        tokio::time::sleep(BACKPRESSURE_POLL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::frame::{decode_payload, ChannelPayload, InboundFrame};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Records everything sent; optionally reports a full buffer for a while
    struct RecordingLink {
        sent: Mutex<Vec<ChannelPayload>>,
        open: AtomicBool,
        busy_polls: AtomicUsize,
    }

    impl RecordingLink {
        fn new() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                open: AtomicBool::new(true),
                busy_polls: AtomicUsize::new(0),
            }
        }

        fn take(&self) -> Vec<ChannelPayload> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }
    }

    #[async_trait]
    impl DataLink for RecordingLink {
        fn label(&self) -> &str {
            "test"
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        async fn send_text(&self, text: &str) -> Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push(ChannelPayload::Text(text.to_string()));
            Ok(())
        }

        async fn send_binary(&self, data: Bytes) -> Result<()> {
            self.sent.lock().unwrap().push(ChannelPayload::Binary(data));
            Ok(())
        }

        async fn buffered_amount(&self) -> usize {
            let remaining = self.busy_polls.load(Ordering::SeqCst);
            if remaining > 0 {
                self.busy_polls.store(remaining - 1, Ordering::SeqCst);
                usize::MAX
            } else {
                0
            }
        }

        async fn close(&self) -> Result<()> {
            self.open.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    fn config(chunk_size: usize, framing: ChunkFraming) -> TransferConfig {
        TransferConfig {
            chunk_size,
            chunk_framing: framing,
            max_buffered_amount: usize::MAX / 2,
            max_incoming_file_size: 1 << 30,
            yield_every_chunks: 4,
        }
    }

    /// Feed everything the sender produced into an assembler
    fn receive(
        frames: Vec<ChannelPayload>,
        framing: ChunkFraming,
    ) -> (Option<ReceivedFile>, Vec<TransferProgress>) {
        let mut assembler = TransferAssembler::new(framing, 1 << 30);
        let mut progress = Vec::new();
        let mut received = None;

        for frame in frames {
            match decode_payload(frame, framing).unwrap() {
                InboundFrame::Control(ControlFrame::FileMeta { meta }) => {
                    assembler.begin(meta).unwrap();
                }
                InboundFrame::Chunk { transfer_id, data } => {
                    let (_, p) = assembler.push_chunk(transfer_id.as_deref(), data).unwrap();
                    progress.extend(p);
                }
                InboundFrame::Control(ControlFrame::FileComplete { id }) => {
                    let (file, p) = assembler.complete(&id).unwrap();
                    progress.push(p);
                    received = Some(file);
                }
                InboundFrame::Control(other) => panic!("unexpected frame: {:?}", other),
            }
        }

        (received, progress)
    }

    #[tokio::test]
    async fn test_round_trip_for_chunk_sizes() {
        const N: usize = 150_000;
        let data = sample(N);

        for chunk_size in [1024, 16384, 65536, N + 1] {
            for framing in [ChunkFraming::Raw, ChunkFraming::Tagged] {
                let link = RecordingLink::new();
                let file = OutgoingFile::from_bytes("blob.bin", None, data.clone());
                let meta = file.meta("t-1");

                let sent = stream_file(&link, &meta, file, &config(chunk_size, framing), |_| {})
                    .await
                    .unwrap();
                assert_eq!(sent, N as u64);

                let frames = link.take();
                assert_eq!(frames.len(), 2 + N.div_ceil(chunk_size));

                let (file, progress) = receive(frames, framing);
                let file = file.unwrap();
                assert_eq!(file.data.len(), N);
                assert_eq!(&file.data[..], &data[..], "chunk size {}", chunk_size);

                assert!(progress.windows(2).all(|w| w[0].transferred <= w[1].transferred));
                assert_eq!(progress.iter().filter(|p| p.is_complete()).count(), 1);
                assert!(progress.last().unwrap().is_complete());
            }
        }
    }

    #[tokio::test]
    async fn test_empty_file() {
        let link = RecordingLink::new();
        let file = OutgoingFile::from_bytes("empty.txt", Some("text/plain"), Vec::new());
        let meta = file.meta("t-0");

        stream_file(&link, &meta, file, &config(1024, ChunkFraming::Raw), |_| {})
            .await
            .unwrap();

        let (file, progress) = receive(link.take(), ChunkFraming::Raw);
        assert!(file.unwrap().data.is_empty());
        assert_eq!(progress, vec![TransferProgress { transferred: 0, total: 0 }]);
    }

    #[tokio::test]
    async fn test_sender_progress_and_backpressure() {
        let link = RecordingLink::new();
        link.busy_polls.store(3, Ordering::SeqCst);

        let file = OutgoingFile::from_bytes("a.bin", None, sample(5000));
        let meta = file.meta("t-2");
        let mut seen = Vec::new();

        stream_file(&link, &meta, file, &config(2048, ChunkFraming::Raw), |p| {
            seen.push(p.transferred)
        })
        .await
        .unwrap();

        assert_eq!(seen, vec![2048, 4096, 5000]);
        assert_eq!(link.busy_polls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_closed_link_rejected() {
        let link = RecordingLink::new();
        link.close().await.unwrap();

        let file = OutgoingFile::from_bytes("a.bin", None, sample(10));
        let meta = file.meta("t-3");
        let err = stream_file(&link, &meta, file, &config(4, ChunkFraming::Raw), |_| {})
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ChannelNotOpen(_)));
        assert!(link.take().is_empty());
    }

    #[tokio::test]
    async fn test_short_source_still_completes_frame_sequence() {
        let link = RecordingLink::new();
        let file = OutgoingFile::from_reader("a.bin", None, 100, std::io::Cursor::new(sample(40)));
        let meta = file.meta("t-4");

        let err = stream_file(&link, &meta, file, &config(16, ChunkFraming::Raw), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TransferError(_)));

        let frames = link.take();
        assert_eq!(
            frames.last(),
            Some(&ChannelPayload::Text(r#"{"type":"file-complete","id":"t-4"}"#.to_string()))
        );
    }

    #[tokio::test]
    async fn test_open_reads_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        tokio::fs::write(&path, b"hello from disk").await.unwrap();

        let file = OutgoingFile::open(&path).await.unwrap();
        assert_eq!(file.name, "notes.txt");
        assert_eq!(file.size, 15);
        assert_eq!(file.mime.as_deref(), Some("text/plain"));
    }

    fn meta(id: &str, size: u64) -> FileMeta {
        FileMeta {
            id: id.to_string(),
            name: format!("{}.bin", id),
            size,
            mime: None,
        }
    }

    #[test]
    fn test_orphan_chunk_rejected() {
        let mut assembler = TransferAssembler::new(ChunkFraming::Raw, 1024);
        assert_eq!(
            assembler.push_chunk(None, Bytes::from_static(b"x")),
            Err(ProtocolViolation::OrphanChunk)
        );
    }

    #[test]
    fn test_raw_chunk_ambiguous_with_two_pending() {
        let mut assembler = TransferAssembler::new(ChunkFraming::Raw, 1024);
        assembler.begin(meta("a", 4)).unwrap();
        assembler.begin(meta("b", 4)).unwrap();

        assert_eq!(
            assembler.push_chunk(None, Bytes::from_static(b"x")),
            Err(ProtocolViolation::AmbiguousChunk(2))
        );
        assert_eq!(assembler.pending_count(), 2);
    }

    #[test]
    fn test_tagged_chunks_interleave() {
        let mut assembler = TransferAssembler::new(ChunkFraming::Tagged, 1024);
        assembler.begin(meta("a", 4)).unwrap();
        assembler.begin(meta("b", 2)).unwrap();

        assembler.push_chunk(Some("a"), Bytes::from_static(b"aa")).unwrap();
        assembler.push_chunk(Some("b"), Bytes::from_static(b"bb")).unwrap();
        assembler.push_chunk(Some("a"), Bytes::from_static(b"AA")).unwrap();

        let (b, _) = assembler.complete("b").unwrap();
        let (a, _) = assembler.complete("a").unwrap();
        assert_eq!(&a.data[..], b"aaAA");
        assert_eq!(&b.data[..], b"bb");
        assert_eq!(
            assembler.push_chunk(Some("c"), Bytes::from_static(b"c")),
            Err(ProtocolViolation::UnknownTransfer("c".to_string()))
        );
    }

    #[test]
    fn test_overflow_fails_record() {
        let mut assembler = TransferAssembler::new(ChunkFraming::Raw, 1024);
        assembler.begin(meta("a", 3)).unwrap();

        let result = assembler.push_chunk(None, Bytes::from_static(b"abcd"));
        assert!(matches!(result, Err(ProtocolViolation::SizeOverflow { .. })));
        assert_eq!(assembler.pending_count(), 0);
    }

    #[test]
    fn test_short_completion_fails() {
        let mut assembler = TransferAssembler::new(ChunkFraming::Raw, 1024);
        assembler.begin(meta("a", 3)).unwrap();
        assembler.push_chunk(None, Bytes::from_static(b"ab")).unwrap();

        assert_eq!(
            assembler.complete("a").map(|_| ()),
            Err(ProtocolViolation::SizeMismatch {
                id: "a".to_string(),
                received: 2,
                size: 3
            })
        );
        assert!(!assembler.is_pending("a"));
    }

    #[test]
    fn test_limits_and_duplicates() {
        let mut assembler = TransferAssembler::new(ChunkFraming::Raw, 10);
        assert!(matches!(
            assembler.begin(meta("big", 11)),
            Err(ProtocolViolation::FileTooLarge { .. })
        ));

        assembler.begin(meta("a", 1)).unwrap();
        assert_eq!(
            assembler.begin(meta("a", 1)),
            Err(ProtocolViolation::DuplicateTransfer("a".to_string()))
        );

        let aborted = assembler.abort_all();
        assert_eq!(aborted.len(), 1);
        assert_eq!(assembler.pending_count(), 0);
    }

    #[test]
    fn test_guess_mime() {
        assert_eq!(guess_mime("photo.JPG"), Some("image/jpeg"));
        assert_eq!(guess_mime("archive.tar.zip"), Some("application/zip"));
        assert_eq!(guess_mime("README"), None);
    }
}
