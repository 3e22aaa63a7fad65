//! Wire protocol types and codec for broker connections
//!
//! Frames arriving from a broker are `[u32 size][u32 frame_type][payload]`,
//! where size counts the type word plus the payload. Commands going out are an
//! ASCII verb line terminated by `\n`, optionally followed by a length-prefixed
//! body. When compression is negotiated, both directions carry
//! `[u32 block_len][compressed block]` units wrapping the plain stream.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::io::Read;
use std::io::Write;

use crate::error::RiverqError;

pub type TopicName = String;
pub type PartitionId = u32;

/// Protocol magic written once, immediately after connecting
pub const MAGIC: &[u8; 4] = b"  V2";

pub const FRAME_TYPE_RESPONSE: u32 = 0;
pub const FRAME_TYPE_ERROR: u32 = 1;
pub const FRAME_TYPE_MESSAGE: u32 = 2;

/// Broker heartbeats arrive as a response frame with this exact body
pub const HEARTBEAT_BODY: &[u8] = b"_heartbeat_";

/// Opaque 16-byte message identifier, echoed back verbatim in FIN/REQ/TOUCH
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId(pub [u8; 16]);

impl MessageId {
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId(")?;
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        write!(f, ")")
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// One decoded frame from a broker
#[derive(Debug, Clone)]
pub enum Frame {
    Response(Bytes),
    Error(BrokerError),
    Message(MessageFrame),
}

impl Frame {
    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Frame::Response(body) if body.as_ref() == HEARTBEAT_BODY)
    }
}

/// Error frame payload, split into the leading code token and the rest
#[derive(Debug, Clone)]
pub struct BrokerError {
    pub code: String,
    pub detail: String,
}

impl BrokerError {
    fn parse(payload: &[u8]) -> Self {
        let text = String::from_utf8_lossy(payload);
        match text.split_once(' ') {
            Some((code, detail)) => Self {
                code: code.to_string(),
                detail: detail.trim().to_string(),
            },
            None => Self {
                code: text.trim().to_string(),
                detail: String::new(),
            },
        }
    }
}

/// Message frame payload: timestamp, attempts, id, body
#[derive(Debug, Clone)]
pub struct MessageFrame {
    pub timestamp_ns: i64,
    pub attempts: u16,
    pub id: MessageId,
    pub body: Bytes,
}

impl MessageFrame {
    /// Minimum payload length: 8 timestamp + 2 attempts + 16 id
    const HEADER_LEN: usize = 26;

    fn parse(mut payload: Bytes) -> Result<Self, RiverqError> {
        if payload.len() < Self::HEADER_LEN {
            return Err(RiverqError::protocol(format!(
                "message frame too short: {} bytes",
                payload.len()
            )));
        }
        let timestamp_ns = payload.get_i64();
        let attempts = payload.get_u16();
        let mut id = [0u8; 16];
        payload.copy_to_slice(&mut id);
        Ok(Self {
            timestamp_ns,
            attempts,
            id: MessageId(id),
            body: payload,
        })
    }
}

/// Commands the client sends to a broker
#[derive(Debug, Clone)]
pub enum Command {
    /// Negotiation request; body is the identify JSON document
    Identify(Bytes),
    Sub {
        topic: TopicName,
        channel: String,
    },
    Pub {
        topic: TopicName,
        partition: Option<PartitionId>,
        body: Bytes,
    },
    Mpub {
        topic: TopicName,
        partition: Option<PartitionId>,
        bodies: Vec<Bytes>,
    },
    Rdy(u32),
    Finish(MessageId),
    Requeue(MessageId, u32),
    Touch(MessageId),
    Close,
    Nop,
}

impl Command {
    fn encode_into(&self, dst: &mut BytesMut) {
        match self {
            Command::Identify(body) => {
                dst.put_slice(b"IDENTIFY\n");
                put_body(dst, body);
            }
            Command::Sub { topic, channel } => {
                dst.put_slice(b"SUB ");
                dst.put_slice(topic.as_bytes());
                dst.put_u8(b' ');
                dst.put_slice(channel.as_bytes());
                dst.put_u8(b'\n');
            }
            Command::Pub {
                topic,
                partition,
                body,
            } => {
                dst.put_slice(b"PUB ");
                put_topic(dst, topic, *partition);
                dst.put_u8(b'\n');
                put_body(dst, body);
            }
            Command::Mpub {
                topic,
                partition,
                bodies,
            } => {
                dst.put_slice(b"MPUB ");
                put_topic(dst, topic, *partition);
                dst.put_u8(b'\n');
                let total: usize = 4 + bodies.iter().map(|b| 4 + b.len()).sum::<usize>();
                dst.put_u32(total as u32);
                dst.put_u32(bodies.len() as u32);
                for body in bodies {
                    put_body(dst, body);
                }
            }
            Command::Rdy(count) => {
                dst.put_slice(b"RDY ");
                dst.put_slice(count.to_string().as_bytes());
                dst.put_u8(b'\n');
            }
            Command::Finish(id) => {
                dst.put_slice(b"FIN ");
                dst.put_slice(id.as_bytes());
                dst.put_u8(b'\n');
            }
            Command::Requeue(id, delay_secs) => {
                dst.put_slice(b"REQ ");
                dst.put_slice(id.as_bytes());
                dst.put_u8(b' ');
                dst.put_slice(delay_secs.to_string().as_bytes());
                dst.put_u8(b'\n');
            }
            Command::Touch(id) => {
                dst.put_slice(b"TOUCH ");
                dst.put_slice(id.as_bytes());
                dst.put_u8(b'\n');
            }
            Command::Close => dst.put_slice(b"CLS\n"),
            Command::Nop => dst.put_slice(b"NOP\n"),
        }
    }
}

fn put_topic(dst: &mut BytesMut, topic: &str, partition: Option<PartitionId>) {
    dst.put_slice(topic.as_bytes());
    if let Some(p) = partition {
        dst.put_u8(b' ');
        dst.put_slice(p.to_string().as_bytes());
    }
}

fn put_body(dst: &mut BytesMut, body: &[u8]) {
    dst.put_u32(body.len() as u32);
    dst.put_slice(body);
}

/// Stream compression installed after negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Snappy,
    Deflate { level: u32 },
}

/// Frame codec: encodes `Command`, decodes `Frame`.
///
/// In compressed mode the raw stream is a sequence of length-prefixed
/// compressed blocks; decoded bytes accumulate in an internal buffer that the
/// plain frame parser then consumes, so a logical frame may span blocks.
#[derive(Debug)]
pub struct FrameCodec {
    compression: Compression,
    decoded: BytesMut,
    max_frame_len: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            compression: Compression::None,
            decoded: BytesMut::new(),
            max_frame_len: 16 * 1024 * 1024,
        }
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// Switch the codec into compressed mode. Only valid during negotiation,
    /// after the plain-text identify exchange and before any other traffic.
    pub fn set_compression(&mut self, compression: Compression) {
        self.compression = compression;
    }

    fn decode_plain(&self, src: &mut BytesMut) -> Result<Option<Frame>, RiverqError> {
        if src.len() < 4 {
            return Ok(None);
        }
        let size = (&src[0..4]).get_u32() as usize;
        if size < 4 {
            return Err(RiverqError::protocol(format!(
                "frame size {size} below minimum"
            )));
        }
        if size > self.max_frame_len {
            return Err(RiverqError::protocol(format!(
                "frame size {size} exceeds limit"
            )));
        }
        if src.len() < 4 + size {
            return Ok(None);
        }
        src.advance(4);
        let mut frame = src.split_to(size).freeze();
        let frame_type = frame.get_u32();
        match frame_type {
            FRAME_TYPE_RESPONSE => Ok(Some(Frame::Response(frame))),
            FRAME_TYPE_ERROR => Ok(Some(Frame::Error(BrokerError::parse(&frame)))),
            FRAME_TYPE_MESSAGE => Ok(Some(Frame::Message(MessageFrame::parse(frame)?))),
            other => Err(RiverqError::protocol(format!(
                "unknown frame type {other}"
            ))),
        }
    }

    fn inflate_blocks(&mut self, src: &mut BytesMut) -> Result<(), RiverqError> {
        loop {
            if src.len() < 4 {
                return Ok(());
            }
            let block_len = (&src[0..4]).get_u32() as usize;
            if block_len > self.max_frame_len {
                return Err(RiverqError::protocol(format!(
                    "compressed block of {block_len} bytes exceeds limit"
                )));
            }
            if src.len() < 4 + block_len {
                return Ok(());
            }
            src.advance(4);
            let block = src.split_to(block_len);
            let plain = match self.compression {
                Compression::Snappy => snap::raw::Decoder::new()
                    .decompress_vec(&block)
                    .map_err(|e| RiverqError::protocol(format!("snappy inflate: {e}")))?,
                Compression::Deflate { .. } => {
                    let mut out = Vec::new();
                    flate2::read::DeflateDecoder::new(block.as_ref())
                        .read_to_end(&mut out)
                        .map_err(|e| RiverqError::protocol(format!("deflate inflate: {e}")))?;
                    out
                }
                Compression::None => unreachable!(),
            };
            self.decoded.extend_from_slice(&plain);
        }
    }

    fn deflate_block(&self, plain: &[u8], dst: &mut BytesMut) -> Result<(), RiverqError> {
        let compressed = match self.compression {
            Compression::Snappy => snap::raw::Encoder::new()
                .compress_vec(plain)
                .map_err(|e| RiverqError::protocol(format!("snappy deflate: {e}")))?,
            Compression::Deflate { level } => {
                let mut enc = flate2::write::DeflateEncoder::new(
                    Vec::new(),
                    flate2::Compression::new(level),
                );
                enc.write_all(plain)
                    .and_then(|_| enc.finish())
                    .map_err(|e| RiverqError::protocol(format!("deflate: {e}")))?
            }
            Compression::None => unreachable!(),
        };
        dst.put_u32(compressed.len() as u32);
        dst.put_slice(&compressed);
        Ok(())
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl tokio_util::codec::Encoder<Command> for FrameCodec {
    type Error = RiverqError;

    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if self.compression == Compression::None {
            item.encode_into(dst);
            return Ok(());
        }
        let mut plain = BytesMut::new();
        item.encode_into(&mut plain);
        self.deflate_block(&plain, dst)
    }
}

impl tokio_util::codec::Decoder for FrameCodec {
    type Item = Frame;
    type Error = RiverqError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.compression == Compression::None {
            return self.decode_plain(src);
        }
        self.inflate_blocks(src)?;
        let mut decoded = std::mem::take(&mut self.decoded);
        let frame = self.decode_plain(&mut decoded);
        self.decoded = decoded;
        frame
    }
}

/// Body of an outbound message: either a single payload or an MPUB batch
#[derive(Debug, Clone)]
pub enum MessageBody {
    Single(Bytes),
    Batch(Vec<Bytes>),
}

impl MessageBody {
    pub fn count(&self) -> usize {
        match self {
            MessageBody::Single(_) => 1,
            MessageBody::Batch(bodies) => bodies.len(),
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            MessageBody::Single(body) => body.is_empty(),
            MessageBody::Batch(bodies) => {
                bodies.is_empty() || bodies.iter().any(|b| b.is_empty())
            }
        }
    }
}

/// Outbound message handed to the publish engine
#[derive(Debug, Clone)]
pub struct Message {
    pub topic: TopicName,
    pub body: MessageBody,
    /// Ordering key; messages with the same key route to the same partition
    pub sharding_key: Option<u64>,
}

impl Message {
    pub fn builder() -> MessageBuilder {
        MessageBuilder::default()
    }

    /// Single message with no routing key
    pub fn new<T: Into<TopicName>, B: Into<Bytes>>(topic: T, body: B) -> Result<Self, RiverqError> {
        Self::builder().topic(topic).body(body).build()
    }
}

/// Builder for outbound messages
#[derive(Debug, Default)]
pub struct MessageBuilder {
    topic: Option<TopicName>,
    body: Option<MessageBody>,
    sharding_key: Option<u64>,
}

impl MessageBuilder {
    pub fn topic<T: Into<TopicName>>(mut self, topic: T) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn body<B: Into<Bytes>>(mut self, body: B) -> Self {
        self.body = Some(MessageBody::Single(body.into()));
        self
    }

    pub fn batch<I, B>(mut self, bodies: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        self.body = Some(MessageBody::Batch(
            bodies.into_iter().map(|b| b.into()).collect(),
        ));
        self
    }

    pub fn sharding_key(mut self, key: u64) -> Self {
        self.sharding_key = Some(key);
        self
    }

    pub fn build(self) -> Result<Message, RiverqError> {
        let topic = self.topic.unwrap_or_default();
        if topic.trim().is_empty() {
            return Err(RiverqError::InvalidTopic { topic });
        }
        let body = self
            .body
            .ok_or_else(|| RiverqError::InvalidMessage {
                message: "message body is required".to_string(),
            })?;
        if body.is_empty() {
            return Err(RiverqError::InvalidMessage {
                message: "message body must not be empty".to_string(),
            });
        }
        Ok(Message {
            topic,
            body,
            sharding_key: self.sharding_key,
        })
    }
}

/// Acknowledged publish: where the message landed
#[derive(Debug, Clone)]
pub struct MessageReceipt {
    pub address: String,
    pub topic: TopicName,
    pub partition: Option<PartitionId>,
    /// Receipt token returned by brokers that echo one in the OK response
    pub receipt_id: Option<String>,
}

/// Message delivered to a consumer, carrying enough origin information for
/// finish/requeue/touch to find the connection it arrived on.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub id: MessageId,
    pub body: Bytes,
    pub attempts: u16,
    pub timestamp_ns: i64,
    pub address: String,
    pub connection_id: u64,
    next_requeue_delay: Option<std::time::Duration>,
}

impl InboundMessage {
    pub(crate) fn from_frame(frame: MessageFrame, address: String, connection_id: u64) -> Self {
        Self {
            id: frame.id,
            body: frame.body,
            attempts: frame.attempts,
            timestamp_ns: frame.timestamp_ns,
            address,
            connection_id,
            next_requeue_delay: None,
        }
    }

    /// Delay to use if this message is requeued after handling
    pub fn set_next_requeue_delay(&mut self, delay: std::time::Duration) {
        self.next_requeue_delay = Some(delay);
    }

    pub fn next_requeue_delay(&self) -> Option<std::time::Duration> {
        self.next_requeue_delay
    }
}
