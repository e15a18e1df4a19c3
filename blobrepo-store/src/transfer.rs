//! Chunked copies between an index directory and the object store.
//!
//! Uploads re-seal the file: the body is streamed through verbatim, the
//! source footer is validated against the bytes actually read, and a
//! freshly computed footer is appended in its place.

use bytes::Bytes;
use crc32fast::Hasher;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use blobrepo_common::backend::{ObjectSink, ObjectStoreClient};
use blobrepo_common::footer::{ChecksumFooter, CHECKSUMMED_FOOTER_PREFIX};
use blobrepo_common::{ObjectKey, RepoError, Result};

use crate::index_dir::IndexInput;

/// Bytes moved per read/write. Bounds the memory held by one transfer.
pub const CHUNK_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct TransferEngine {
    chunk_size: usize,
}

impl Default for TransferEngine {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
        }
    }
}

impl TransferEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    /// Upload `source` to `dest`, replacing its trailing `footer_length`
    /// bytes with a footer computed over the uploaded body. Returns the
    /// number of bytes stored.
    pub async fn copy_into_store(
        &self,
        client: &dyn ObjectStoreClient,
        mut source: IndexInput,
        footer_length: u64,
        dest: &ObjectKey,
    ) -> Result<u64> {
        if source.length <= footer_length {
            return Err(RepoError::CorruptSource {
                name: source.name,
                reason: format!("file is too small: {}", source.length),
            });
        }

        let mut sink = client.open_write(dest).await?;
        let streamed = self.stream_into(&mut source, footer_length, sink.as_mut()).await;
        match streamed {
            Ok(written) => {
                sink.finish()
                    .await
                    .map_err(|e| RepoError::transfer(dest.as_str(), e))?;
                Ok(written)
            }
            Err(e) => {
                sink.abort().await;
                Err(RepoError::transfer(dest.as_str(), e))
            }
        }
    }

    async fn stream_into(
        &self,
        source: &mut IndexInput,
        footer_length: u64,
        sink: &mut dyn ObjectSink,
    ) -> Result<u64> {
        let body_length = source.length - footer_length;
        let mut hasher = Hasher::new();
        let mut buffer = vec![0u8; self.chunk_size];
        let mut remaining = body_length;

        while remaining > 0 {
            let len = remaining.min(self.chunk_size as u64) as usize;
            source.reader.read_exact(&mut buffer[..len]).await?;
            hasher.update(&buffer[..len]);
            sink.write(Bytes::copy_from_slice(&buffer[..len])).await?;
            remaining -= len as u64;
        }

        let mut footer = vec![0u8; footer_length as usize];
        source.reader.read_exact(&mut footer).await?;
        let prefix_len = CHECKSUMMED_FOOTER_PREFIX.min(footer.len());
        hasher.update(&footer[..prefix_len]);
        let actual = u64::from(hasher.finalize());

        let corrupt = |reason: String| RepoError::CorruptSource {
            name: source.name.clone(),
            reason,
        };
        let expected = ChecksumFooter::decode(&footer).map_err(|e| corrupt(e.to_string()))?;
        expected.verify(actual).map_err(|e| corrupt(e.to_string()))?;

        let sealed = ChecksumFooter::crc32(actual as u32).encode();
        sink.write(Bytes::copy_from_slice(&sealed)).await?;
        debug!(name = %source.name, body = body_length, checksum = actual, "Footer re-sealed");
        Ok(body_length + sealed.len() as u64)
    }

    /// Download `source` into `dest` unchanged. `dest` is shut down on
    /// every exit path. Returns the number of bytes copied.
    pub async fn copy_out_of_store(
        &self,
        client: &dyn ObjectStoreClient,
        source: &ObjectKey,
        dest: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64> {
        let mut reader = match client.open_read(source).await {
            Ok(reader) => reader,
            Err(e) => {
                let _ = dest.shutdown().await;
                return Err(e);
            }
        };

        let copied = self.stream_out(reader.as_mut(), dest).await;
        let closed = dest.shutdown().await;
        let copied = copied.map_err(|e| RepoError::transfer(source.as_str(), e))?;
        closed.map_err(|e| RepoError::transfer(source.as_str(), e))?;
        Ok(copied)
    }

    async fn stream_out(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        dest: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64> {
        let mut buffer = vec![0u8; self.chunk_size];
        let mut copied = 0u64;
        loop {
            let filled = fill_chunk(reader, &mut buffer).await?;
            if filled == 0 {
                break;
            }
            dest.write_all(&buffer[..filled]).await?;
            copied += filled as u64;
        }
        dest.flush().await?;
        Ok(copied)
    }
}

/// Read until `buffer` is full or the stream ends.
async fn fill_chunk(reader: &mut (dyn AsyncRead + Send + Unpin), buffer: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        let n = reader.read(&mut buffer[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use blobrepo_common::footer::{seal, FOOTER_LENGTH};

    fn input(name: &str, data: Vec<u8>) -> IndexInput {
        IndexInput {
            name: name.to_string(),
            length: data.len() as u64,
            reader: Box::new(std::io::Cursor::new(data)),
        }
    }

    fn body(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    async fn round_trip(engine: TransferEngine, body_len: usize) {
        let backend = MemoryBackend::new();
        let key = ObjectKey::new("backup/file");
        let file = seal(&body(body_len));

        let stored = engine
            .copy_into_store(&backend, input("file", file.clone()), FOOTER_LENGTH, &key)
            .await
            .unwrap();
        assert_eq!(stored, file.len() as u64);
        assert_eq!(backend.get("backup/file").unwrap().as_ref(), file.as_slice());

        let mut out: Vec<u8> = Vec::new();
        let copied = engine.copy_out_of_store(&backend, &key, &mut out).await.unwrap();
        assert_eq!(copied, file.len() as u64);
        assert_eq!(out, file);
    }

    #[tokio::test]
    async fn test_round_trip_sizes() {
        let engine = TransferEngine::with_chunk_size(64);
        for body_len in [1, 64, 65, 192] {
            round_trip(engine, body_len).await;
        }
    }

    #[tokio::test]
    async fn test_round_trip_past_real_chunk_size() {
        round_trip(TransferEngine::new(), CHUNK_SIZE + 1).await;
    }

    #[tokio::test]
    async fn test_too_small_source_is_corrupt() {
        let backend = MemoryBackend::new();
        let engine = TransferEngine::new();
        let key = ObjectKey::new("f");

        let err = engine
            .copy_into_store(&backend, input("f", vec![0u8; 16]), FOOTER_LENGTH, &key)
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::CorruptSource { ref reason, .. } if reason.contains("16")));
        assert!(backend.keys().is_empty());

        engine
            .copy_into_store(&backend, input("f", seal(b"x")), FOOTER_LENGTH, &key)
            .await
            .unwrap();
        assert_eq!(backend.head_length(&key).await.unwrap(), 17);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_not_committed() {
        let backend = MemoryBackend::new();
        let mut file = seal(b"segment body");
        file[0] ^= 0xff;

        let err = TransferEngine::with_chunk_size(4)
            .copy_into_store(&backend, input("seg", file), FOOTER_LENGTH, &ObjectKey::new("seg"))
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::CorruptSource { ref name, .. } if name == "seg"));
        assert!(backend.keys().is_empty());
    }

    #[tokio::test]
    async fn test_short_read_is_transfer_error() {
        let backend = MemoryBackend::new();
        let mut source = input("seg", seal(b"body"));
        source.length += 10;

        let err = TransferEngine::new()
            .copy_into_store(&backend, source, FOOTER_LENGTH, &ObjectKey::new("dest/seg"))
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::Transfer { ref key, .. } if key == "dest/seg"));
        assert!(matches!(err.root_cause(), RepoError::Io(_)));
        assert!(backend.keys().is_empty());
    }

    #[tokio::test]
    async fn test_download_missing_is_not_found() {
        let backend = MemoryBackend::new();
        let mut out: Vec<u8> = Vec::new();
        let err = TransferEngine::new()
            .copy_out_of_store(&backend, &ObjectKey::new("missing"), &mut out)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
