//! Body Relay
//!
//! Moves message bodies between their source and a destination in bounded
//! chunks. Small bodies live inline; bodies above the large-message threshold
//! are spooled to disk and read back lazily, so neither delivery nor
//! redistribution ever materializes a large body in memory.
//!
//! Peak memory per relay is one chunk (`relay.chunk_size`), plus at most
//! `relay.large_message_threshold` while deciding whether to spool.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures_util::stream::{self, BoxStream, StreamExt};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cluster::protocol::{write_message, ClusterMessage};
use crate::config::RelayConfig;

/// Errors raised while relaying a body
#[derive(Debug)]
pub enum RelayError {
    /// Reading the body source failed
    Io(std::io::Error),
    /// Writing to the destination failed
    Sink(std::io::Error),
    /// The stream ended or overran before the declared length
    Interrupted(String),
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::Io(e) => write!(f, "body source error: {}", e),
            RelayError::Sink(e) => write!(f, "body destination error: {}", e),
            RelayError::Interrupted(msg) => write!(f, "relay interrupted: {}", msg),
        }
    }
}

impl std::error::Error for RelayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RelayError::Io(e) | RelayError::Sink(e) => Some(e),
            RelayError::Interrupted(_) => None,
        }
    }
}

/// A spool file on disk, removed when the last reference drops
#[derive(Debug)]
struct SpoolFile {
    path: PathBuf,
}

impl Drop for SpoolFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove spool file {:?}: {}", self.path, e);
            }
        }
    }
}

/// A body stored in a spool file and read on demand
#[derive(Debug, Clone)]
pub struct LargeBody {
    file: Arc<SpoolFile>,
    len: u64,
}

impl LargeBody {
    pub fn path(&self) -> &Path {
        &self.file.path
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Message body
#[derive(Debug, Clone)]
pub enum Body {
    /// Held in memory, relayed as a single unit
    Inline(Bytes),
    /// Spooled to disk, relayed chunk by chunk
    Large(LargeBody),
}

impl Body {
    pub fn len(&self) -> u64 {
        match self {
            Body::Inline(bytes) => bytes.len() as u64,
            Body::Large(large) => large.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_large(&self) -> bool {
        matches!(self, Body::Large(_))
    }

    /// Inline bytes, if the body is held in memory
    pub fn as_inline(&self) -> Option<&Bytes> {
        match self {
            Body::Inline(bytes) => Some(bytes),
            Body::Large(_) => None,
        }
    }
}

/// State for lazily reading a large body
struct ChunkReader {
    body: LargeBody,
    file: Option<File>,
    remaining: u64,
    chunk_size: usize,
}

/// Streams bodies between sources and destinations in bounded chunks
#[derive(Debug, Clone)]
pub struct BodyRelay {
    chunk_size: usize,
    large_threshold: u64,
    spool_dir: PathBuf,
}

impl BodyRelay {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            chunk_size: config.chunk_size.max(1),
            large_threshold: config.large_message_threshold as u64,
            spool_dir: config.spool_dir.clone(),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn large_threshold(&self) -> u64 {
        self.large_threshold
    }

    /// Stream a body as chunks for delivery.
    ///
    /// An inline body up to one chunk is yielded as a single unit; a longer
    /// one is sliced into chunks without copying. A large body is read from
    /// its spool file one chunk at a time; a file shorter than its recorded
    /// length fails the stream with `Interrupted`.
    pub fn relay(&self, body: &Body) -> BoxStream<'static, Result<Bytes, RelayError>> {
        match body {
            Body::Inline(bytes) if bytes.is_empty() => stream::empty().boxed(),
            Body::Inline(bytes) if bytes.len() <= self.chunk_size => {
                stream::once(futures_util::future::ready(Ok(bytes.clone()))).boxed()
            }
            Body::Inline(bytes) => {
                let chunks: Vec<Result<Bytes, RelayError>> = (0..bytes.len())
                    .step_by(self.chunk_size)
                    .map(|start| {
                        let end = std::cmp::min(start + self.chunk_size, bytes.len());
                        Ok(bytes.slice(start..end))
                    })
                    .collect();
                stream::iter(chunks).boxed()
            }
            Body::Large(large) => {
                let reader = ChunkReader {
                    body: large.clone(),
                    file: None,
                    remaining: large.len(),
                    chunk_size: self.chunk_size,
                };
                stream::try_unfold(reader, |mut reader| async move {
                    if reader.remaining == 0 {
                        return Ok(None);
                    }
                    if reader.file.is_none() {
                        let file = File::open(reader.body.path()).await.map_err(RelayError::Io)?;
                        reader.file = Some(file);
                    }
                    let Some(file) = reader.file.as_mut() else {
                        return Ok(None);
                    };

                    let want = std::cmp::min(reader.chunk_size as u64, reader.remaining) as usize;
                    let mut buf = vec![0u8; want];
                    if let Err(e) = file.read_exact(&mut buf).await {
                        return Err(match e.kind() {
                            std::io::ErrorKind::UnexpectedEof => RelayError::Interrupted(format!(
                                "spool file ended with {} bytes outstanding",
                                reader.remaining
                            )),
                            _ => RelayError::Io(e),
                        });
                    }
                    reader.remaining -= want as u64;
                    Ok(Some((Bytes::from(buf), reader)))
                })
                .boxed()
            }
        }
    }

    /// Copy a body into a destination stream, returning the bytes written
    pub async fn copy_to<W>(&self, body: &Body, writer: &mut W) -> Result<u64, RelayError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut chunks = self.relay(body);
        let mut written = 0u64;
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            writer.write_all(&chunk).await.map_err(RelayError::Sink)?;
            written += chunk.len() as u64;
        }
        writer.flush().await.map_err(RelayError::Sink)?;
        Ok(written)
    }

    /// Relay a body to a peer connection as `BodyChunk` frames followed by
    /// the `BodyEnd` marker. The peer must not treat the message as received
    /// before the marker arrives.
    pub async fn relay_to_peer<W>(
        &self,
        transfer_id: u64,
        body: &Body,
        writer: &mut W,
    ) -> Result<u64, RelayError>
    where
        W: AsyncWrite + Unpin,
    {
        let sent = self.relay_chunks(transfer_id, body, writer).await?;
        write_message(writer, &ClusterMessage::BodyEnd { transfer_id })
            .await
            .map_err(RelayError::Sink)?;
        Ok(sent)
    }

    /// Write the `BodyChunk` frames of a body without the end marker
    pub async fn relay_chunks<W>(
        &self,
        transfer_id: u64,
        body: &Body,
        writer: &mut W,
    ) -> Result<u64, RelayError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut chunks = self.relay(body);
        let mut sent = 0u64;
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            sent += chunk.len() as u64;
            // Spooled chunks are uniquely owned and convert without a copy
            let frame = ClusterMessage::BodyChunk {
                transfer_id,
                data: Vec::from(chunk),
            };
            write_message(writer, &frame).await.map_err(RelayError::Sink)?;
        }
        Ok(sent)
    }

    /// Ingest a producer stream into a body, spooling to disk once the
    /// content exceeds the large-message threshold
    pub async fn spool<R>(&self, mut reader: R) -> Result<Body, RelayError>
    where
        R: AsyncRead + Unpin,
    {
        let mut inline = BytesMut::new();
        let mut spooled: Option<(File, SpoolFile)> = None;
        let mut total = 0u64;
        let mut buf = vec![0u8; self.chunk_size];

        loop {
            let n = reader.read(&mut buf).await.map_err(RelayError::Io)?;
            if n == 0 {
                break;
            }
            total += n as u64;

            match spooled.as_mut() {
                Some((file, _)) => file.write_all(&buf[..n]).await.map_err(RelayError::Sink)?,
                None => {
                    inline.extend_from_slice(&buf[..n]);
                    if inline.len() as u64 > self.large_threshold {
                        let (mut file, spool) = self.create_spool().await?;
                        file.write_all(&inline).await.map_err(RelayError::Sink)?;
                        inline = BytesMut::new();
                        spooled = Some((file, spool));
                    }
                }
            }
        }

        match spooled {
            Some((mut file, spool)) => {
                file.flush().await.map_err(RelayError::Sink)?;
                debug!("Spooled {} byte body to {:?}", total, spool.path);
                Ok(Body::Large(LargeBody {
                    file: Arc::new(spool),
                    len: total,
                }))
            }
            None => Ok(Body::Inline(inline.freeze())),
        }
    }

    /// Start assembling an inbound body of a declared length
    pub async fn assembler(&self, declared_len: u64) -> Result<BodyAssembler, RelayError> {
        let sink = if declared_len > self.large_threshold {
            let (file, spool) = self.create_spool().await?;
            AssemblerSink::File { file, spool }
        } else {
            AssemblerSink::Memory(BytesMut::with_capacity(declared_len as usize))
        };
        Ok(BodyAssembler {
            declared_len,
            received: 0,
            sink,
        })
    }

    async fn create_spool(&self) -> Result<(File, SpoolFile), RelayError> {
        tokio::fs::create_dir_all(&self.spool_dir)
            .await
            .map_err(RelayError::Sink)?;
        let path = self
            .spool_dir
            .join(format!("{}.body", Uuid::new_v4().simple()));
        let file = File::create(&path).await.map_err(RelayError::Sink)?;
        Ok((file, SpoolFile { path }))
    }
}

enum AssemblerSink {
    Memory(BytesMut),
    File { file: File, spool: SpoolFile },
}

/// Reassembles a body arriving as chunks.
///
/// Dropping an unfinished assembler discards the partial body, including
/// its spool file.
pub struct BodyAssembler {
    declared_len: u64,
    received: u64,
    sink: AssemblerSink,
}

impl BodyAssembler {
    pub fn declared_len(&self) -> u64 {
        self.declared_len
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub async fn push(&mut self, chunk: &[u8]) -> Result<(), RelayError> {
        let received = self.received + chunk.len() as u64;
        if received > self.declared_len {
            return Err(RelayError::Interrupted(format!(
                "received {} bytes, declared {}",
                received, self.declared_len
            )));
        }
        match &mut self.sink {
            AssemblerSink::Memory(buf) => buf.extend_from_slice(chunk),
            AssemblerSink::File { file, .. } => {
                file.write_all(chunk).await.map_err(RelayError::Sink)?
            }
        }
        self.received = received;
        Ok(())
    }

    /// Complete the body after the end-of-body marker
    pub async fn finish(self) -> Result<Body, RelayError> {
        if self.received != self.declared_len {
            return Err(RelayError::Interrupted(format!(
                "body ended at {} of {} bytes",
                self.received, self.declared_len
            )));
        }
        match self.sink {
            AssemblerSink::Memory(buf) => Ok(Body::Inline(buf.freeze())),
            AssemblerSink::File { mut file, spool } => {
                file.flush().await.map_err(RelayError::Sink)?;
                Ok(Body::Large(LargeBody {
                    file: Arc::new(spool),
                    len: self.received,
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests;
