//! Upstream wire protocol
//!
//! Frame format:
//! ```text
//! +-------------+----------+-------------------+-------------+
//! | Version (1) | Type (1) | Length (4, BE u32)| JSON body   |
//! +-------------+----------+-------------------+-------------+
//! ```
//!
//! The codec buffers partial frames across socket reads: `decode` returns
//! `Ok(None)` until a whole frame is available.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

use super::{CollectionId, CollectionInfo, HistoryRequest, StreamRecord};
use crate::error::SourceError;
use crate::types::{DataPoint, StreamId, Timestamp};

/// Protocol version spoken by this client
pub const PROTOCOL_VERSION: u8 = 1;

/// Header length in bytes
pub const HEADER_LEN: usize = 6;

/// Default maximum frame body (64MB)
const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Message type tag carried in the header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Client asks for the collection list
    RequestCollections = 1,
    /// Client asks for streams after a stream id
    RequestStreams = 2,
    /// Client asks for streams active since a timestamp
    RequestActiveStreams = 3,
    /// Client asks for aggregated history
    RequestHistory = 4,
    /// Collection list
    Collections = 10,
    /// A chunk of stream descriptions
    Streams = 11,
    /// A chunk of active stream ids
    ActiveStreams = 12,
    /// A chunk of history for one label
    History = 13,
    /// The upstream abandoned part of a query
    QueryCancelled = 14,
}

impl MessageType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::RequestCollections),
            2 => Some(Self::RequestStreams),
            3 => Some(Self::RequestActiveStreams),
            4 => Some(Self::RequestHistory),
            10 => Some(Self::Collections),
            11 => Some(Self::Streams),
            12 => Some(Self::ActiveStreams),
            13 => Some(Self::History),
            14 => Some(Self::QueryCancelled),
            _ => None,
        }
    }

    /// Name used in error messages
    pub fn name(&self) -> &'static str {
        match self {
            Self::RequestCollections => "REQUEST_COLLECTIONS",
            Self::RequestStreams => "REQUEST_STREAMS",
            Self::RequestActiveStreams => "REQUEST_ACTIVE_STREAMS",
            Self::RequestHistory => "REQUEST_HISTORY",
            Self::Collections => "COLLECTIONS",
            Self::Streams => "STREAMS",
            Self::ActiveStreams => "ACTIVE_STREAMS",
            Self::History => "HISTORY",
            Self::QueryCancelled => "QUERY_CANCELLED",
        }
    }
}

/// Body of a stream list request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamsRequest {
    /// Collection being queried
    pub collection: CollectionId,
    /// Stream id or timestamp the listing starts after
    pub boundary: i64,
}

/// Body of a collection list response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionList {
    /// Every collection the upstream knows
    pub collections: Vec<CollectionInfo>,
}

/// One chunk of a stream listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamsChunk {
    /// Collection the streams belong to
    pub collection: CollectionId,
    /// More chunks follow
    pub more: bool,
    /// Streams in this chunk
    pub streams: Vec<StreamRecord>,
}

/// One chunk of an active stream listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveStreamsChunk {
    /// Collection the streams belong to
    pub collection: CollectionId,
    /// More chunks follow
    pub more: bool,
    /// Ids of streams with recent data
    pub streams: Vec<StreamId>,
}

/// One chunk of history for a single label
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryChunk {
    /// Collection the data belongs to
    pub collection: CollectionId,
    /// Label the rows were aggregated for
    pub label: String,
    /// Measurement frequency of the underlying streams
    pub binsize: i64,
    /// More chunks for this label follow
    pub more: bool,
    /// Aggregated rows, ascending by time
    pub data: Vec<DataPoint>,
}

/// Notice that the upstream gave up on part of a query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cancellation {
    /// Collection of the cancelled query, absent for collection requests
    #[serde(default)]
    pub collection: Option<CollectionId>,
    /// Labels affected
    #[serde(default)]
    pub labels: Vec<String>,
    /// First second of the abandoned range
    #[serde(default)]
    pub start: Timestamp,
    /// Last second of the abandoned range (inclusive)
    #[serde(default)]
    pub end: Timestamp,
    /// Whether further chunks follow for the affected labels
    #[serde(default)]
    pub more: bool,
}

/// A decoded protocol message
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Ask for the collection list
    RequestCollections,
    /// Ask for streams created after `boundary` (a stream id)
    RequestStreams(StreamsRequest),
    /// Ask for streams active since `boundary` (a timestamp)
    RequestActiveStreams(StreamsRequest),
    /// Ask for aggregated history
    RequestHistory(HistoryRequest),
    /// Collection list
    Collections(CollectionList),
    /// Stream descriptions
    Streams(StreamsChunk),
    /// Active stream ids
    ActiveStreams(ActiveStreamsChunk),
    /// History for one label
    History(HistoryChunk),
    /// Partial query cancellation
    QueryCancelled(Cancellation),
}

impl Message {
    /// Header tag for this message
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::RequestCollections => MessageType::RequestCollections,
            Message::RequestStreams(_) => MessageType::RequestStreams,
            Message::RequestActiveStreams(_) => MessageType::RequestActiveStreams,
            Message::RequestHistory(_) => MessageType::RequestHistory,
            Message::Collections(_) => MessageType::Collections,
            Message::Streams(_) => MessageType::Streams,
            Message::ActiveStreams(_) => MessageType::ActiveStreams,
            Message::History(_) => MessageType::History,
            Message::QueryCancelled(_) => MessageType::QueryCancelled,
        }
    }

    fn encode_body(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            Message::RequestCollections => Ok(b"{}".to_vec()),
            Message::RequestStreams(body) | Message::RequestActiveStreams(body) => {
                serde_json::to_vec(body)
            },
            Message::RequestHistory(body) => serde_json::to_vec(body),
            Message::Collections(body) => serde_json::to_vec(body),
            Message::Streams(body) => serde_json::to_vec(body),
            Message::ActiveStreams(body) => serde_json::to_vec(body),
            Message::History(body) => serde_json::to_vec(body),
            Message::QueryCancelled(body) => serde_json::to_vec(body),
        }
    }

    fn decode_body(kind: MessageType, body: &[u8]) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            MessageType::RequestCollections => Message::RequestCollections,
            MessageType::RequestStreams => Message::RequestStreams(serde_json::from_slice(body)?),
            MessageType::RequestActiveStreams => {
                Message::RequestActiveStreams(serde_json::from_slice(body)?)
            },
            MessageType::RequestHistory => Message::RequestHistory(serde_json::from_slice(body)?),
            MessageType::Collections => Message::Collections(serde_json::from_slice(body)?),
            MessageType::Streams => Message::Streams(serde_json::from_slice(body)?),
            MessageType::ActiveStreams => Message::ActiveStreams(serde_json::from_slice(body)?),
            MessageType::History => Message::History(serde_json::from_slice(body)?),
            MessageType::QueryCancelled => Message::QueryCancelled(serde_json::from_slice(body)?),
        })
    }
}

/// Codec for upstream protocol frames
pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Codec with the default 64MB frame limit
    pub fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Codec rejecting bodies larger than `max_frame_size`
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = SourceError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, SourceError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let version = src[0];
        if version != PROTOCOL_VERSION {
            return Err(SourceError::Protocol(format!(
                "Unsupported protocol version {}",
                version
            )));
        }

        let kind = MessageType::from_u8(src[1]).ok_or_else(|| {
            SourceError::Protocol(format!("Unknown message type {}", src[1]))
        })?;

        let length = (&src[2..HEADER_LEN]).get_u32() as usize;
        if length > self.max_frame_size {
            return Err(SourceError::Protocol(format!(
                "Frame size {} exceeds maximum {}",
                length, self.max_frame_size
            )));
        }

        let total_length = HEADER_LEN + length;
        if src.len() < total_length {
            src.reserve(total_length - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let body = src.split_to(length);

        Message::decode_body(kind, &body)
            .map(Some)
            .map_err(|e| SourceError::Protocol(format!("Malformed {} body: {}", kind.name(), e)))
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = SourceError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), SourceError> {
        let kind = item.message_type();
        let body = item
            .encode_body()
            .map_err(|e| SourceError::Protocol(format!("Failed to encode {}: {}", kind.name(), e)))?;

        if body.len() > self.max_frame_size {
            return Err(SourceError::Protocol(format!(
                "Frame size {} exceeds maximum {}",
                body.len(),
                self.max_frame_size
            )));
        }

        dst.reserve(HEADER_LEN + body.len());
        dst.put_u8(PROTOCOL_VERSION);
        dst.put_u8(kind as u8);
        dst.put_u32(body.len() as u32);
        dst.extend_from_slice(&body);

        Ok(())
    }
}
