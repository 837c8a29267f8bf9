//! Framed codec: byte stream to frame groups to decoded messages.
//!
//! The wire unit is a frame group: a 32-bit call id, a 32-bit frame count,
//! then that many length-prefixed frames (all integers big-endian). A group
//! carries exactly one request or one response. [`GroupDecoder`] is the
//! resumable parsing state machine; [`MessageDecoder`] layers payload
//! interpretation (optional handshake record, then header map and body) on
//! top, with a sticky one-way downgrade once a peer demonstrates it omits
//! handshakes. [`MessageEncoder`] emits each group's header and frames
//! contiguously, so no partial group is ever observable between messages.

use std::marker::PhantomData;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    errors::{ProtocolError, Result},
    handshake::HandshakeRecord,
    payload::Packet,
    wire::WireCursor,
};

/// Frame-group header width: id plus frame count.
const GROUP_HEADER_LEN: usize = 8;

/// Largest frame the decoder will buffer (16 MB).
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Largest frame count the decoder accepts in one group.
pub const MAX_FRAME_COUNT: u32 = 1024;

/// Raw wire unit: a call id and its length-prefixed frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameGroup {
    /// Call id chosen by the client bridge.
    pub id: i32,
    /// Frame bodies, without their length prefixes.
    pub frames: Vec<Bytes>,
}

impl FrameGroup {
    /// Concatenate the frames into one contiguous payload buffer.
    pub fn concat(&self) -> Bytes {
        match self.frames.as_slice() {
            [] => Bytes::new(),
            [single] => single.clone(),
            frames => {
                let total = frames.iter().map(Bytes::len).sum();
                let mut buf = BytesMut::with_capacity(total);
                for frame in frames {
                    buf.extend_from_slice(frame);
                }
                buf.freeze()
            },
        }
    }
}

#[derive(Debug)]
enum GroupState {
    /// Waiting for the 8-byte group header.
    Header,
    /// Collecting `remaining` more frames for the group with this id.
    Frames { id: i32, remaining: u32, frames: Vec<Bytes> },
}

/// Resumable frame-group parser.
///
/// Parsing survives arbitrary chunk boundaries: partial headers and
/// partial frames stay buffered in the source until enough bytes arrive.
/// End-of-input with a buffered partial group fails with
/// [`ProtocolError::TrailingData`] carrying the unconsumed bytes.
#[derive(Debug)]
pub struct GroupDecoder {
    state: GroupState,
}

impl GroupDecoder {
    /// Create a decoder at the start of a stream.
    pub fn new() -> Self {
        Self { state: GroupState::Header }
    }
}

impl Default for GroupDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for GroupDecoder {
    type Item = FrameGroup;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<FrameGroup>> {
        loop {
            match &mut self.state {
                GroupState::Header => {
                    if src.len() < GROUP_HEADER_LEN {
                        return Ok(None);
                    }
                    let mut header = &src[..GROUP_HEADER_LEN];
                    let id = header.get_i32();
                    let count = header.get_i32();
                    if count < 0 {
                        return Err(ProtocolError::NegativeFrameCount { count });
                    }
                    if count as u32 > MAX_FRAME_COUNT {
                        return Err(ProtocolError::TooManyFrames { count, max: MAX_FRAME_COUNT });
                    }
                    src.advance(GROUP_HEADER_LEN);
                    self.state = GroupState::Frames {
                        id,
                        remaining: count as u32,
                        frames: Vec::with_capacity(count.min(4) as usize),
                    };
                },
                GroupState::Frames { id, remaining, frames } => {
                    if *remaining == 0 {
                        let group = FrameGroup { id: *id, frames: std::mem::take(frames) };
                        self.state = GroupState::Header;
                        return Ok(Some(group));
                    }
                    if src.len() < 4 {
                        return Ok(None);
                    }
                    let mut prefix = &src[..4];
                    let len = prefix.get_i32();
                    if len < 0 || len as u32 > MAX_FRAME_LEN {
                        return Err(ProtocolError::InvalidFrameLength {
                            len: i64::from(len),
                            max: MAX_FRAME_LEN,
                        });
                    }
                    let len = len as usize;
                    if src.len() < 4 + len {
                        src.reserve(4 + len - src.len());
                        return Ok(None);
                    }
                    src.advance(4);
                    frames.push(src.split_to(len).freeze());
                    *remaining -= 1;
                },
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<FrameGroup>> {
        if let Some(group) = self.decode(src)? {
            return Ok(Some(group));
        }
        if src.is_empty() && matches!(self.state, GroupState::Header) {
            return Ok(None);
        }
        let leftover = src.split().freeze();
        self.state = GroupState::Header;
        Err(ProtocolError::TrailingData { leftover })
    }
}

/// Decoded frame group: call id, optional handshake record, and payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message<H> {
    /// Call id the group was keyed by.
    pub id: i32,
    /// Handshake record, when the peer attached one.
    pub handshake: Option<H>,
    /// Header map and body.
    pub packet: Packet,
}

impl<H> Message<H> {
    /// Build a message without a handshake record.
    pub fn bare(id: i32, packet: Packet) -> Self {
        Self { id, handshake: None, packet }
    }

    /// Build a message with a handshake record attached.
    pub fn with_handshake(id: i32, handshake: H, packet: Packet) -> Self {
        Self { id, handshake: Some(handshake), packet }
    }
}

/// Frame-group decoder plus payload interpretation.
///
/// `H` is the handshake record this side receives: `HandshakeResponse` on
/// a client bridge, `HandshakeRequest` on a server gateway.
///
/// Payload decoding is optimistic under the current handshake
/// expectation. The decoder starts expecting handshakes; when a group
/// fails to decode with one but succeeds without, the expectation flips
/// off and never flips back. Bouncing between modes would destabilize
/// stateful connections.
#[derive(Debug)]
pub struct MessageDecoder<H> {
    groups: GroupDecoder,
    expect_handshake: bool,
    _handshake: PhantomData<H>,
}

impl<H> MessageDecoder<H> {
    /// Create a decoder in expect-handshake mode.
    pub fn new() -> Self {
        Self { groups: GroupDecoder::new(), expect_handshake: true, _handshake: PhantomData }
    }

    /// Whether the decoder still expects handshake records.
    pub fn expecting_handshake(&self) -> bool {
        self.expect_handshake
    }
}

impl<H> Default for MessageDecoder<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: HandshakeRecord> MessageDecoder<H> {
    fn interpret(&mut self, group: &FrameGroup) -> Result<Message<H>> {
        let buf = group.concat();
        if !self.expect_handshake {
            let (handshake, packet) = parse_payload::<H>(&buf, false)?;
            return Ok(Message { id: group.id, handshake, packet });
        }
        match parse_payload::<H>(&buf, true) {
            Ok((handshake, packet)) => Ok(Message { id: group.id, handshake, packet }),
            Err(primary) => match parse_payload::<H>(&buf, false) {
                Ok((handshake, packet)) => {
                    self.expect_handshake = false;
                    tracing::debug!(id = group.id, "peer omits handshakes; decoder downgraded");
                    Ok(Message { id: group.id, handshake, packet })
                },
                Err(_) => Err(primary),
            },
        }
    }
}

fn parse_payload<H: HandshakeRecord>(buf: &Bytes, with_handshake: bool) -> Result<(Option<H>, Packet)> {
    if !with_handshake {
        return Ok((None, Packet::decode(buf)?));
    }
    let mut cur = WireCursor::new(buf);
    let handshake = H::decode(&mut cur)?;
    let rest = buf.slice(cur.position()..);
    Ok((Some(handshake), Packet::decode(&rest)?))
}

impl<H: HandshakeRecord> Decoder for MessageDecoder<H> {
    type Item = Message<H>;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message<H>>> {
        match self.groups.decode(src)? {
            Some(group) => self.interpret(&group).map(Some),
            None => Ok(None),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Message<H>>> {
        match self.groups.decode_eof(src)? {
            Some(group) => self.interpret(&group).map(Some),
            None => Ok(None),
        }
    }
}

/// Serializes messages into atomically-written frame groups.
///
/// A message becomes at most two frames: the handshake record when
/// present, then the packet payload. The group header and every frame are
/// appended to the destination in one call, so frames of different groups
/// never interleave on one connection.
#[derive(Debug)]
pub struct MessageEncoder<H> {
    _handshake: PhantomData<H>,
}

impl<H> MessageEncoder<H> {
    /// Create an encoder.
    pub fn new() -> Self {
        Self { _handshake: PhantomData }
    }
}

impl<H> Default for MessageEncoder<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: HandshakeRecord> Encoder<Message<H>> for MessageEncoder<H> {
    type Error = ProtocolError;

    fn encode(&mut self, message: Message<H>, dst: &mut BytesMut) -> Result<()> {
        let mut frames: Vec<BytesMut> = Vec::with_capacity(2);
        if let Some(handshake) = &message.handshake {
            let mut frame = BytesMut::new();
            handshake.encode(&mut frame);
            frames.push(frame);
        }
        let mut frame = BytesMut::new();
        message.packet.encode(&mut frame);
        frames.push(frame);

        for frame in &frames {
            if frame.len() > MAX_FRAME_LEN as usize {
                return Err(ProtocolError::InvalidFrameLength {
                    len: frame.len() as i64,
                    max: MAX_FRAME_LEN,
                });
            }
        }

        dst.reserve(GROUP_HEADER_LEN + frames.iter().map(|f| 4 + f.len()).sum::<usize>());
        dst.put_i32(message.id);
        dst.put_i32(frames.len() as i32);
        for frame in frames {
            dst.put_i32(frame.len() as i32);
            dst.extend_from_slice(&frame);
        }
        Ok(())
    }
}
