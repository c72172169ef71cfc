//! Cluster Protocol Messages
//!
//! Defines the binary protocol used for inter-node communication.
//! Messages are serialized using bincode and framed with a 4-byte
//! big-endian length prefix.
//!
//! A message transfer is a `TransferBegin` header, zero or more
//! `BodyChunk` frames and a closing `BodyEnd`. The receiver answers with
//! `TransferAck` or `TransferNack`. A sender that cannot finish a body
//! sends `TransferAbort` instead of `BodyEnd`.

use bincode::{Decode, Encode};
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::message::{MessageId, Properties};

/// Protocol version for compatibility checking
pub const CLUSTER_PROTOCOL_VERSION: u8 = 1;

/// Default upper bound for a single frame
pub const DEFAULT_MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Why a message is being transferred
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum TransferKind {
    /// Stranded message moved by the redistribution controller
    Redistribute,
    /// Producer message routed by on-demand load balancing
    Route,
}

impl TransferKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferKind::Redistribute => "redistribute",
            TransferKind::Route => "route",
        }
    }
}

/// Messages exchanged between cluster nodes over TCP
#[derive(Debug, Clone, Encode, Decode)]
pub enum ClusterMessage {
    /// Handshake sent when connecting to a peer
    Hello {
        /// Node ID of the sender
        node_id: String,
        /// Protocol version
        version: u8,
        /// Sender start time, resets sequence tracking after a restart
        incarnation: u64,
    },

    /// Handshake acknowledgment
    HelloAck {
        /// Node ID of the responder
        node_id: String,
        /// Protocol version
        version: u8,
        incarnation: u64,
    },

    /// Local consumer count for a queue on the sending node
    Advertise {
        node_id: String,
        queue: String,
        consumer_count: u32,
        seq: u64,
    },

    /// Start of a message transfer
    TransferBegin {
        transfer_id: u64,
        kind: TransferKind,
        queue: String,
        message_id: MessageId,
        properties: Properties,
        delivery_count: u32,
        body_len: u64,
    },

    /// Body bytes for an open transfer
    BodyChunk { transfer_id: u64, data: Vec<u8> },

    /// End-of-body marker; the transfer is complete
    BodyEnd { transfer_id: u64 },

    /// Sender gave up on an open transfer
    TransferAbort { transfer_id: u64, reason: String },

    /// Receiver took ownership of the message
    TransferAck { transfer_id: u64 },

    /// Receiver refused the message
    TransferNack { transfer_id: u64, reason: String },

    /// Keep-alive ping
    Ping,

    /// Keep-alive pong
    Pong,

    /// Graceful disconnect notification
    Goodbye,
}

impl ClusterMessage {
    /// Encode message to bytes using bincode
    pub fn encode(&self) -> Result<Vec<u8>, bincode::error::EncodeError> {
        bincode::encode_to_vec(self, bincode::config::standard())
    }

    /// Decode message from bytes using bincode
    pub fn decode(data: &[u8]) -> Result<Self, bincode::error::DecodeError> {
        bincode::decode_from_slice(data, bincode::config::standard()).map(|(msg, _)| msg)
    }

    /// Get the message type name for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            ClusterMessage::Hello { .. } => "Hello",
            ClusterMessage::HelloAck { .. } => "HelloAck",
            ClusterMessage::Advertise { .. } => "Advertise",
            ClusterMessage::TransferBegin { .. } => "TransferBegin",
            ClusterMessage::BodyChunk { .. } => "BodyChunk",
            ClusterMessage::BodyEnd { .. } => "BodyEnd",
            ClusterMessage::TransferAbort { .. } => "TransferAbort",
            ClusterMessage::TransferAck { .. } => "TransferAck",
            ClusterMessage::TransferNack { .. } => "TransferNack",
            ClusterMessage::Ping => "Ping",
            ClusterMessage::Pong => "Pong",
            ClusterMessage::Goodbye => "Goodbye",
        }
    }
}

/// Frame a message with length prefix for TCP transmission
pub fn frame_message(msg: &ClusterMessage) -> Result<Vec<u8>, bincode::error::EncodeError> {
    let payload = msg.encode()?;
    let len = payload.len() as u32;

    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);

    Ok(frame)
}

/// Read frame length from bytes (returns None if not enough data)
pub fn read_frame_length(data: &[u8]) -> Option<u32> {
    if data.len() < 4 {
        return None;
    }
    Some(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
}

/// Frame and write a message, returning the frame size
pub async fn write_message<W>(writer: &mut W, msg: &ClusterMessage) -> std::io::Result<usize>
where
    W: AsyncWrite + Unpin,
{
    let frame = frame_message(msg)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
    writer.write_all(&frame).await?;
    Ok(frame.len())
}

/// Incremental frame reader.
///
/// Buffered bytes live in the reader, so `read_message` can be used as a
/// `tokio::select!` branch without losing partial frames.
pub struct FrameReader {
    buf: BytesMut,
    max_frame_size: usize,
}

impl FrameReader {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(64 * 1024),
            max_frame_size,
        }
    }

    /// Decode the next complete frame already in the buffer
    pub fn try_decode(&mut self) -> std::io::Result<Option<ClusterMessage>> {
        let Some(len) = read_frame_length(&self.buf) else {
            return Ok(None);
        };
        let len = len as usize;
        if len > self.max_frame_size {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("frame of {} bytes exceeds limit {}", len, self.max_frame_size),
            ));
        }
        if self.buf.len() < 4 + len {
            return Ok(None);
        }

        self.buf.advance(4);
        let payload = self.buf.split_to(len);
        ClusterMessage::decode(&payload)
            .map(Some)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))
    }

    /// Read until a full message is available.
    ///
    /// Returns `Ok(None)` on a clean end of stream at a frame boundary.
    pub async fn read_message<R>(&mut self, reader: &mut R) -> std::io::Result<Option<ClusterMessage>>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            if let Some(msg) = self.try_decode()? {
                return Ok(Some(msg));
            }
            let n = reader.read_buf(&mut self.buf).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed mid-frame",
                ));
            }
        }
    }
}
