//! Levin packet codec and stream framing.
//!
//! Every Levin packet starts with a 33-byte little-endian bucket header:
//!
//! ```text
//! +-----------+---------+--------+---------+-------------+--------+---------+
//! | Signature | Body    | Return | Command | Return code | Flags  | Version |
//! | 8 bytes   | 8 bytes | 1 byte | 4 bytes | 4 bytes     | 4 bytes| 4 bytes |
//! +-----------+---------+--------+---------+-------------+--------+---------+
//! |                          Body (JSON payload)                           |
//! +------------------------------------------------------------------------+
//! ```
//!
//! - Signature: `0x0101010101012101`
//! - Return: 1 when the sender expects a reply
//! - Flags: 1 for requests, 2 for responses
//!
//! [`PacketCodec`] is the seam between framing and serialization;
//! [`FrameDecoder`] applies the reassembly policy on top of any codec.

use crate::message::{Command, Packet, Payload};
use crate::{NetworkError, NetworkResult, MAX_PACKET_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::Arc;
use tokio_util::codec::Decoder;
use tracing::{debug, trace};

/// Levin bucket signature.
pub const LEVIN_SIGNATURE: u64 = 0x0101_0101_0101_2101;

/// Header size: signature (8) + body length (8) + return flag (1) +
/// command (4) + return code (4) + flags (4) + version (4) = 33 bytes
pub const HEADER_SIZE: usize = 33;

/// Levin protocol version written in every header.
const LEVIN_PROTOCOL_VERSION: u32 = 1;

const LEVIN_PACKET_REQUEST: u32 = 0x0000_0001;
const LEVIN_PACKET_RESPONSE: u32 = 0x0000_0002;

/// Outcome of decoding the front of a byte buffer.
#[derive(Debug)]
pub enum Decoded {
    /// A full packet, occupying the first `consumed` bytes.
    Packet { packet: Packet, consumed: usize },
    /// The buffer holds a valid prefix of a packet.
    NeedMoreData,
    /// The buffer cannot start a valid packet.
    Malformed(String),
}

/// Serializer for packets.
pub trait PacketCodec: Send + Sync + 'static {
    /// Encode a packet into wire bytes.
    fn encode(&self, packet: &Packet) -> NetworkResult<Bytes>;

    /// Decode the packet at the front of `buf`.
    fn decode(&self, buf: &[u8]) -> Decoded;
}

/// Levin bucket codec with JSON bodies.
#[derive(Debug, Clone)]
pub struct LevinCodec {
    /// Maximum allowed body size.
    max_size: usize,
}

impl LevinCodec {
    /// Create a new codec with the default size limit.
    pub fn new() -> Self {
        Self {
            max_size: MAX_PACKET_SIZE,
        }
    }

    /// Create a codec with a custom body size limit.
    pub fn with_max_size(max_size: usize) -> Self {
        Self { max_size }
    }
}

impl Default for LevinCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketCodec for LevinCodec {
    fn encode(&self, packet: &Packet) -> NetworkResult<Bytes> {
        packet.validate()?;

        let body = packet.payload.encode_body()?;
        if body.len() > self.max_size {
            return Err(NetworkError::MessageTooLarge {
                size: body.len(),
                max: self.max_size,
            });
        }

        let flags = if packet.response {
            LEVIN_PACKET_RESPONSE
        } else {
            LEVIN_PACKET_REQUEST
        };

        let mut dst = BytesMut::with_capacity(HEADER_SIZE + body.len());
        dst.put_u64_le(LEVIN_SIGNATURE);
        dst.put_u64_le(body.len() as u64);
        dst.put_u8(packet.expects_response as u8);
        dst.put_u32_le(packet.command.id());
        dst.put_i32_le(packet.return_code);
        dst.put_u32_le(flags);
        dst.put_u32_le(LEVIN_PROTOCOL_VERSION);
        dst.put_slice(&body);

        Ok(dst.freeze())
    }

    fn decode(&self, buf: &[u8]) -> Decoded {
        let signature = LEVIN_SIGNATURE.to_le_bytes();

        // Reject a bad prefix before the full header arrives
        let prefix = buf.len().min(signature.len());
        if buf[..prefix] != signature[..prefix] {
            return Decoded::Malformed(format!(
                "Invalid signature prefix: {}",
                hex::encode(&buf[..prefix])
            ));
        }

        if buf.len() < HEADER_SIZE {
            return Decoded::NeedMoreData;
        }

        let mut header = &buf[signature.len()..HEADER_SIZE];
        let length = header.get_u64_le();
        let expects_response = header.get_u8() != 0;
        let command = Command::from_id(header.get_u32_le());
        let return_code = header.get_i32_le();
        let flags = header.get_u32_le();
        let _version = header.get_u32_le();

        if length > self.max_size as u64 {
            return Decoded::Malformed(format!(
                "Body too large: {} bytes, max {} bytes",
                length, self.max_size
            ));
        }

        let total_size = HEADER_SIZE + length as usize;
        if buf.len() < total_size {
            return Decoded::NeedMoreData;
        }

        let payload = match Payload::decode_body(command, &buf[HEADER_SIZE..total_size]) {
            Ok(payload) => payload,
            Err(e) => return Decoded::Malformed(format!("Bad {} body: {}", command, e)),
        };

        Decoded::Packet {
            packet: Packet {
                command,
                expects_response,
                response: flags & LEVIN_PACKET_RESPONSE != 0,
                return_code,
                payload,
            },
            consumed: total_size,
        }
    }
}

/// Turns a fragmented byte stream into packets.
///
/// The `BytesMut` handed in by `FramedRead` is the reassembly buffer. After a
/// packet only the bytes the codec consumed are dropped, so several packets
/// arriving in one read all come out. Command id 0 is swallowed.
///
/// The decoder remembers where the newest read begins in the buffer. When
/// the accumulated bytes are malformed, or a stale partial header keeps
/// asking for more data while the newest read frames a packet on its own,
/// the older bytes are dropped and framing restarts at that read. Malformed
/// data with nothing newer behind it clears the buffer.
pub struct FrameDecoder {
    codec: Arc<dyn PacketCodec>,
    malformed: u64,
    /// Buffer length when `decode` last returned.
    seen: usize,
    /// Offset of the newest read within the buffer.
    boundary: usize,
}

impl FrameDecoder {
    /// Create a decoder around a codec.
    pub fn new(codec: Arc<dyn PacketCodec>) -> Self {
        Self {
            codec,
            malformed: 0,
            seen: 0,
            boundary: 0,
        }
    }

    /// Number of times buffered data was discarded as malformed.
    pub fn malformed_count(&self) -> u64 {
        self.malformed
    }

    fn drop_front(&mut self, src: &mut BytesMut, count: usize) {
        src.advance(count);
        self.boundary = self.boundary.saturating_sub(count);
    }

    /// Whether the newest read frames a packet without the older bytes.
    fn newest_read_frames(&self, src: &BytesMut) -> bool {
        self.boundary > 0
            && self.boundary < src.len()
            && matches!(
                self.codec.decode(&src[self.boundary..]),
                Decoded::Packet { .. }
            )
    }
}

impl Decoder for FrameDecoder {
    type Item = Packet;
    type Error = NetworkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() > self.seen {
            self.boundary = self.seen;
        }

        loop {
            if src.is_empty() {
                self.seen = 0;
                self.boundary = 0;
                return Ok(None);
            }

            match self.codec.decode(&src[..]) {
                Decoded::Packet { packet, consumed } => {
                    self.drop_front(src, consumed.clamp(1, src.len()));

                    if packet.command.is_noise() {
                        trace!("Skipping zero command");
                        continue;
                    }

                    self.seen = src.len();
                    return Ok(Some(packet));
                }
                Decoded::NeedMoreData => {
                    if self.newest_read_frames(src) {
                        self.malformed += 1;
                        debug!(dropped = self.boundary, "Discarding stale partial packet");
                        let stale = self.boundary;
                        self.drop_front(src, stale);
                        continue;
                    }

                    self.seen = src.len();
                    return Ok(None);
                }
                Decoded::Malformed(reason) => {
                    self.malformed += 1;

                    if self.boundary > 0 && self.boundary < src.len() {
                        debug!(
                            dropped = self.boundary,
                            reason = %reason,
                            "Discarding malformed data before the latest read"
                        );
                        let stale = self.boundary;
                        self.drop_front(src, stale);
                        continue;
                    }

                    debug!(dropped = src.len(), reason = %reason, "Discarding malformed data");
                    src.clear();
                    self.seen = 0;
                    self.boundary = 0;
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(packet) => Ok(Some(packet)),
            None => {
                if !src.is_empty() {
                    debug!(dropped = src.len(), "Discarding partial packet at end of stream");
                    src.clear();
                }
                self.seen = 0;
                self.boundary = 0;
                Ok(None)
            }
        }
    }
}
