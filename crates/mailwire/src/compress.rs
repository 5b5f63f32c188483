//! DEFLATE layer for COMPRESS=DEFLATE sessions.
//!
//! After the server accepts `COMPRESS DEFLATE`, both directions of the
//! connection switch to raw DEFLATE streams (no zlib header). The engine
//! routes every inbound chunk through [`CompressionLayer::inflate`] before
//! framing and every outbound write through [`CompressionLayer::deflate`],
//! so the framer and the send path see plaintext regardless of compression
//! state.
//!
//! Each outbound write ends with a sync flush so the server can decode the
//! command without waiting for more data. Both directions keep their
//! dictionary across calls; the codec is stateful for the whole session.
//!
//! The codec can run inline or on a dedicated worker thread. The worker
//! exists for callers that push large message bodies and do not want codec
//! work on the connection task; it is selected with
//! [`Config::offload_compression`](crate::Config).

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use tokio::sync::oneshot;

use crate::{Error, Result};

const OUTPUT_CHUNK: usize = 8 * 1024;

/// Stateful raw-DEFLATE codec for one session.
pub struct DeflateCodec {
    deflate: Compress,
    inflate: Decompress,
}

impl std::fmt::Debug for DeflateCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeflateCodec")
            .field("deflated_out", &self.deflate.total_out())
            .field("inflated_out", &self.inflate.total_out())
            .finish()
    }
}

impl Default for DeflateCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl DeflateCodec {
    /// Creates a codec with fresh dictionaries in both directions.
    #[must_use]
    pub fn new() -> Self {
        Self {
            deflate: Compress::new(Compression::default(), false),
            inflate: Decompress::new(false),
        }
    }

    /// Compresses one outbound write, sync-flushed.
    ///
    /// # Errors
    ///
    /// Returns a compression error if the stream state is corrupt.
    #[allow(clippy::cast_possible_truncation)]
    pub fn deflate(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(input.len() / 2 + 64);
        let mut consumed = 0usize;
        loop {
            if out.len() == out.capacity() {
                out.reserve(OUTPUT_CHUNK);
            }
            let before_in = self.deflate.total_in();
            let before_out = self.deflate.total_out();
            self.deflate
                .compress_vec(&input[consumed..], &mut out, FlushCompress::Sync)
                .map_err(|e| Error::Compression(e.to_string()))?;
            consumed += (self.deflate.total_in() - before_in) as usize;
            let produced = (self.deflate.total_out() - before_out) as usize;
            if consumed >= input.len() && (produced == 0 || out.len() < out.capacity()) {
                break;
            }
        }
        Ok(out)
    }

    /// Decompresses one inbound chunk.
    ///
    /// # Errors
    ///
    /// Returns a compression error on a corrupt DEFLATE stream.
    #[allow(clippy::cast_possible_truncation)]
    pub fn inflate(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(input.len() * 3 + 64);
        let mut consumed = 0usize;
        loop {
            if out.len() == out.capacity() {
                out.reserve(OUTPUT_CHUNK);
            }
            let before_in = self.inflate.total_in();
            let status = self
                .inflate
                .decompress_vec(&input[consumed..], &mut out, FlushDecompress::None)
                .map_err(|e| Error::Compression(e.to_string()))?;
            consumed += (self.inflate.total_in() - before_in) as usize;
            if matches!(status, Status::StreamEnd) {
                break;
            }
            if consumed >= input.len() && out.len() < out.capacity() {
                break;
            }
        }
        Ok(out)
    }
}

/// A codec job sent to the worker thread.
enum CodecJob {
    Inflate(Vec<u8>, oneshot::Sender<Result<Vec<u8>>>),
    Deflate(Vec<u8>, oneshot::Sender<Result<Vec<u8>>>),
}

/// The active compression stage of a connection.
///
/// Created when compression is enabled and dropped on close. Dropping the
/// worker variant closes the job channel, which ends the worker thread.
pub struct CompressionLayer {
    mode: Mode,
}

enum Mode {
    InProcess(Box<DeflateCodec>),
    Worker(std::sync::mpsc::Sender<CodecJob>),
}

impl CompressionLayer {
    /// Creates a layer, on a worker thread when `offload` is set.
    ///
    /// # Errors
    ///
    /// Returns a compression error if the worker thread cannot be spawned.
    pub fn new(offload: bool) -> Result<Self> {
        if offload { Self::worker() } else { Ok(Self::in_process()) }
    }

    /// Creates a layer that runs the codec on the caller's task.
    #[must_use]
    pub fn in_process() -> Self {
        Self {
            mode: Mode::InProcess(Box::new(DeflateCodec::new())),
        }
    }

    /// Creates a layer backed by a dedicated codec thread.
    ///
    /// # Errors
    ///
    /// Returns a compression error if the thread cannot be spawned.
    pub fn worker() -> Result<Self> {
        let (tx, rx) = std::sync::mpsc::channel::<CodecJob>();
        std::thread::Builder::new()
            .name("mailwire-deflate".to_string())
            .spawn(move || {
                let mut codec = DeflateCodec::new();
                while let Ok(job) = rx.recv() {
                    match job {
                        CodecJob::Inflate(data, reply) => {
                            let _ = reply.send(codec.inflate(&data));
                        }
                        CodecJob::Deflate(data, reply) => {
                            let _ = reply.send(codec.deflate(&data));
                        }
                    }
                }
            })
            .map_err(|e| Error::Compression(format!("failed to spawn codec worker: {e}")))?;
        Ok(Self {
            mode: Mode::Worker(tx),
        })
    }

    /// Decompresses an inbound chunk.
    ///
    /// # Errors
    ///
    /// Returns a compression error on corrupt input or a dead worker.
    pub async fn inflate(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        match &mut self.mode {
            Mode::InProcess(codec) => codec.inflate(data),
            Mode::Worker(tx) => {
                Self::round_trip(tx, |reply| CodecJob::Inflate(data.to_vec(), reply)).await
            }
        }
    }

    /// Compresses an outbound write.
    ///
    /// # Errors
    ///
    /// Returns a compression error on a corrupt stream or a dead worker.
    pub async fn deflate(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        match &mut self.mode {
            Mode::InProcess(codec) => codec.deflate(data),
            Mode::Worker(tx) => {
                Self::round_trip(tx, |reply| CodecJob::Deflate(data.to_vec(), reply)).await
            }
        }
    }

    async fn round_trip(
        tx: &std::sync::mpsc::Sender<CodecJob>,
        job: impl FnOnce(oneshot::Sender<Result<Vec<u8>>>) -> CodecJob,
    ) -> Result<Vec<u8>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(job(reply_tx))
            .map_err(|_| Error::Compression("codec worker terminated".to_string()))?;
        reply_rx
            .await
            .map_err(|_| Error::Compression("codec worker dropped the job".to_string()))?
    }
}

impl std::fmt::Debug for CompressionLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = match self.mode {
            Mode::InProcess(_) => "in-process",
            Mode::Worker(_) => "worker",
        };
        f.debug_struct("CompressionLayer")
            .field("mode", &mode)
            .finish()
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_round_trip() {
        let mut client = DeflateCodec::new();
        let mut server = DeflateCodec::new();

        let wire = client.deflate(b"W1 CAPABILITY\r\n").unwrap();
        assert!(!wire.is_empty());
        let plain = server.inflate(&wire).unwrap();
        assert_eq!(plain, b"W1 CAPABILITY\r\n");
    }

    #[test]
    fn test_each_write_decodable_alone() {
        // sync flush makes every write visible without waiting for more input
        let mut tx = DeflateCodec::new();
        let mut rx = DeflateCodec::new();

        for line in [&b"W1 NOOP\r\n"[..], b"W2 LIST \"\" \"*\"\r\n", b"hello\r\n"] {
            let wire = tx.deflate(line).unwrap();
            assert_eq!(rx.inflate(&wire).unwrap(), line);
        }
    }

    #[test]
    fn test_inflate_across_arbitrary_partitions() {
        let mut tx = DeflateCodec::new();
        let wire = tx
            .deflate(b"* 1 FETCH (BODY[] {11}\r\nhello world)\r\n")
            .unwrap();

        for split in 1..wire.len() {
            let mut rx = DeflateCodec::new();
            let mut plain = rx.inflate(&wire[..split]).unwrap();
            plain.extend(rx.inflate(&wire[split..]).unwrap());
            assert_eq!(plain, b"* 1 FETCH (BODY[] {11}\r\nhello world)\r\n");
        }
    }

    #[test]
    fn test_dictionary_persists_between_writes() {
        // the second write may reference the first one's dictionary
        let mut tx = DeflateCodec::new();
        let mut rx = DeflateCodec::new();

        let first = tx.deflate(b"the quick brown fox jumps over the lazy dog").unwrap();
        let second = tx.deflate(b"the quick brown fox jumps over the lazy dog").unwrap();
        assert!(second.len() < first.len());

        rx.inflate(&first).unwrap();
        let plain = rx.inflate(&second).unwrap();
        assert_eq!(plain, b"the quick brown fox jumps over the lazy dog");
    }

    #[test]
    fn test_inflate_garbage_is_error() {
        let mut rx = DeflateCodec::new();
        let result = rx.inflate(&[0xde, 0xad, 0xbe, 0xef, 0x01, 0x02, 0x03]);
        assert!(result.is_err());
    }

    #[test]
    fn test_large_payload_round_trip() {
        let mut tx = DeflateCodec::new();
        let mut rx = DeflateCodec::new();

        let body: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let wire = tx.deflate(&body).unwrap();
        assert_eq!(rx.inflate(&wire).unwrap(), body);
    }

    #[tokio::test]
    async fn test_worker_layer_round_trip() {
        let mut layer = CompressionLayer::worker().unwrap();
        let mut server = DeflateCodec::new();

        let wire = layer.deflate(b"W1 NOOP\r\n").await.unwrap();
        assert_eq!(server.inflate(&wire).unwrap(), b"W1 NOOP\r\n");

        let back = server.deflate(b"* OK done\r\n").unwrap();
        assert_eq!(layer.inflate(&back).await.unwrap(), b"* OK done\r\n");
    }

    #[tokio::test]
    async fn test_in_process_layer_round_trip() {
        let mut layer = CompressionLayer::in_process();
        let mut server = DeflateCodec::new();

        let wire = layer.deflate(b"abc").await.unwrap();
        assert_eq!(server.inflate(&wire).unwrap(), b"abc");
    }
}
