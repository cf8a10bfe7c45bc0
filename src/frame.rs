//! Frame header model and the budgeted frame buffer.
//!
//! Every transmitted frame starts with a single varint packing the message
//! number and a seven-bit flag field. The flag layout: low three bits carry
//! the [`MessageType`], then `MoreComing` (0x08), `Urgent` (0x10), `NoReply`
//! (0x20), and `Compressed` (0x40).

use std::fmt;

use bytes::BufMut;

use crate::{
    error::BlipError,
    varint::{read_uvarint, write_uvarint},
};

const FLAG_BITS: u32 = 7;
const FLAG_MASK: u64 = 0x7F;

/// Sequence number identifying a message within one direction of a
/// connection. Numbers start at 1 and increase monotonically per sender.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageNo(pub u64);

impl From<u64> for MessageNo {
    fn from(value: u64) -> Self { Self(value) }
}

impl fmt::Display for MessageNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "#{}", self.0) }
}

/// Kind of message a frame belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// A request initiated by the sender.
    Request = 0,
    /// A successful response to a request.
    Response = 1,
    /// An error response to a request.
    Error = 2,
    /// Acknowledges received bytes of a peer's request.
    AckRequest = 4,
    /// Acknowledges received bytes of a peer's response.
    AckResponse = 5,
}

impl MessageType {
    pub(crate) fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Self::Request),
            1 => Some(Self::Response),
            2 => Some(Self::Error),
            4 => Some(Self::AckRequest),
            5 => Some(Self::AckResponse),
            _ => None,
        }
    }

    /// Whether this is one of the two ack types.
    #[must_use]
    pub const fn is_ack(self) -> bool { matches!(self, Self::AckRequest | Self::AckResponse) }

    /// The ack type that acknowledges a message of this type.
    pub(crate) fn ack_type(self) -> Option<Self> {
        match self {
            Self::Request => Some(Self::AckRequest),
            Self::Response | Self::Error => Some(Self::AckResponse),
            Self::AckRequest | Self::AckResponse => None,
        }
    }

    /// The message type an ack of this type refers to.
    pub(crate) fn acked_type(self) -> Option<Self> {
        match self {
            Self::AckRequest => Some(Self::Request),
            Self::AckResponse => Some(Self::Response),
            _ => None,
        }
    }

    pub(crate) const fn name(self) -> &'static str {
        match self {
            Self::Request => "REQ",
            Self::Response => "RES",
            Self::Error => "ERR",
            Self::AckRequest => "ACKREQ",
            Self::AckResponse => "ACKRES",
        }
    }
}

/// Per-frame flag byte: message type plus delivery modifiers.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FrameFlags(u8);

impl FrameFlags {
    pub(crate) const TYPE_MASK: u8 = 0x07;
    pub(crate) const MORE_COMING: u8 = 0x08;
    pub(crate) const URGENT: u8 = 0x10;
    pub(crate) const NO_REPLY: u8 = 0x20;
    pub(crate) const COMPRESSED: u8 = 0x40;

    /// Flags for a message of `kind` with no modifiers set.
    #[must_use]
    pub const fn new(kind: MessageType) -> Self { Self(kind as u8) }

    /// Raw flag byte as transmitted.
    #[must_use]
    pub const fn bits(self) -> u8 { self.0 }

    /// Parse a received flag byte, rejecting unknown message types.
    ///
    /// # Errors
    ///
    /// Returns [`BlipError::UnknownFrameType`] when the low three bits do not
    /// name a defined message type.
    pub fn from_bits(bits: u8) -> Result<Self, BlipError> {
        let type_bits = bits & Self::TYPE_MASK;
        if MessageType::from_bits(type_bits).is_none() {
            return Err(BlipError::UnknownFrameType(type_bits));
        }
        Ok(Self(bits & 0x7F))
    }

    /// The message type encoded in the low three bits.
    #[must_use]
    pub fn message_type(self) -> MessageType {
        // from_bits validated the type on ingress; constructors set it.
        MessageType::from_bits(self.0 & Self::TYPE_MASK).unwrap_or(MessageType::Request)
    }

    /// Replace the message type, keeping the modifier bits.
    #[must_use]
    pub fn with_type(self, kind: MessageType) -> Self {
        Self((self.0 & !Self::TYPE_MASK) | kind as u8)
    }

    /// Whether more frames of this message follow.
    #[must_use]
    pub const fn more_coming(self) -> bool { self.0 & Self::MORE_COMING != 0 }

    /// Whether the message is scheduled on the urgent tier.
    #[must_use]
    pub const fn urgent(self) -> bool { self.0 & Self::URGENT != 0 }

    /// Whether the sender declines a response.
    #[must_use]
    pub const fn no_reply(self) -> bool { self.0 & Self::NO_REPLY != 0 }

    /// Whether this frame's payload went through the deflater.
    #[must_use]
    pub const fn compressed(self) -> bool { self.0 & Self::COMPRESSED != 0 }

    /// Whether the frame belongs to an ack message.
    #[must_use]
    pub fn is_ack(self) -> bool { self.message_type().is_ack() }

    #[must_use]
    pub(crate) fn with(self, bit: u8, on: bool) -> Self {
        if on { Self(self.0 | bit) } else { Self(self.0 & !bit) }
    }
}

impl fmt::Debug for FrameFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message_type().name())?;
        for (bit, label) in [
            (Self::MORE_COMING, "MORE"),
            (Self::URGENT, "URG"),
            (Self::NO_REPLY, "NOREPLY"),
            (Self::COMPRESSED, "Z"),
        ] {
            if self.0 & bit != 0 {
                write!(f, "|{label}")?;
            }
        }
        Ok(())
    }
}

/// Decoded frame header: the leading varint of every frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub number: MessageNo,
    pub flags: FrameFlags,
}

impl FrameHeader {
    #[must_use]
    pub const fn new(number: MessageNo, flags: FrameFlags) -> Self { Self { number, flags } }

    /// Append the header varint to `dst`.
    pub fn encode<B: BufMut>(&self, dst: &mut B) {
        write_uvarint((self.number.0 << FLAG_BITS) | u64::from(self.flags.bits()), dst);
    }

    /// Decode a header from the front of `src`, advancing past it.
    ///
    /// # Errors
    ///
    /// Returns a varint error for a malformed header word or
    /// [`BlipError::UnknownFrameType`] for an undefined message type.
    pub fn decode(src: &mut &[u8]) -> Result<Self, BlipError> {
        let word = read_uvarint(src)?;
        let flags = FrameFlags::from_bits((word & FLAG_MASK) as u8)?;
        Ok(Self {
            number: MessageNo(word >> FLAG_BITS),
            flags,
        })
    }
}

/// Fixed-budget output buffer for one frame's payload.
///
/// The multiplexer allocates one per scheduler tick; the owning message fills
/// it through the codec. A trailer reservation keeps the checksum's four
/// bytes free while payload is written, then releases them for the checksum
/// itself.
pub struct FrameBuf {
    data: Box<[u8]>,
    len: usize,
    limit: usize,
}

impl FrameBuf {
    /// Allocate a buffer holding at most `capacity` bytes.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity].into_boxed_slice(),
            len: 0,
            limit: capacity,
        }
    }

    /// Bytes written so far.
    #[must_use]
    pub fn len(&self) -> usize { self.len }

    /// Whether nothing has been written yet.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.len == 0 }

    /// Room left before the current limit.
    #[must_use]
    pub fn remaining(&self) -> usize { self.limit - self.len }

    /// Shrink the writable limit by `n` trailing bytes.
    pub fn reserve_trailer(&mut self, n: usize) {
        debug_assert!(self.limit >= self.len + n);
        self.limit -= n;
    }

    /// Undo a matching [`reserve_trailer`](Self::reserve_trailer).
    pub fn release_trailer(&mut self, n: usize) {
        debug_assert!(self.limit + n <= self.data.len());
        self.limit += n;
    }

    /// The unwritten span up to the limit, for codecs that fill in place.
    pub fn unfilled(&mut self) -> &mut [u8] { &mut self.data[self.len..self.limit] }

    /// Mark `n` bytes of [`unfilled`](Self::unfilled) as written.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(self.len + n <= self.limit);
        self.len += n;
    }

    /// Copy `src` into the buffer. Panics if it does not fit; callers bound
    /// their writes by [`remaining`](Self::remaining).
    pub fn put_slice(&mut self, src: &[u8]) {
        assert!(src.len() <= self.remaining(), "frame buffer overflow");
        self.data[self.len..self.len + src.len()].copy_from_slice(src);
        self.len += src.len();
    }

    /// Drop bytes from the tail, keeping the first `len`.
    pub fn truncate(&mut self, len: usize) {
        debug_assert!(len <= self.len);
        self.len = len;
    }

    /// Everything written so far.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] { &self.data[..self.len] }
}
