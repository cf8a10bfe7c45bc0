//! RFC 6455 frame encoding and incremental decoding.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// WebSocket frame opcodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0x0 => Some(Self::Continuation),
            0x1 => Some(Self::Text),
            0x2 => Some(Self::Binary),
            0x8 => Some(Self::Close),
            0x9 => Some(Self::Ping),
            0xA => Some(Self::Pong),
            _ => None,
        }
    }

    /// Control frames may not be fragmented or carry large payloads.
    #[must_use]
    pub const fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }
}

/// One decoded frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WsFrame {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Bytes,
}

/// Errors raised by the frame decoder.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum FramingError {
    #[error("reserved bits set in frame header")]
    ReservedBits,
    #[error("unknown opcode {0:#x}")]
    UnknownOpcode(u8),
    #[error("fragmented control frame")]
    FragmentedControl,
    #[error("control frame payload exceeds 125 bytes")]
    OversizedControl,
    #[error("frame length overflows this platform")]
    LengthOverflow,
}

/// Encode one frame into `out`. Client-role senders pass a masking key;
/// servers send unmasked.
pub fn encode_frame(opcode: Opcode, payload: &[u8], mask: Option<[u8; 4]>, out: &mut BytesMut) {
    out.reserve(14 + payload.len());
    out.put_u8(0x80 | opcode as u8);
    let mask_bit = if mask.is_some() { 0x80 } else { 0 };
    match payload.len() {
        len if len < 126 => out.put_u8(mask_bit | len as u8),
        len if len <= usize::from(u16::MAX) => {
            out.put_u8(mask_bit | 126);
            out.put_u16(len as u16);
        }
        len => {
            out.put_u8(mask_bit | 127);
            out.put_u64(len as u64);
        }
    }
    match mask {
        Some(key) => {
            out.put_slice(&key);
            let start = out.len();
            out.put_slice(payload);
            for (i, byte) in out[start..].iter_mut().enumerate() {
                *byte ^= key[i % 4];
            }
        }
        None => out.put_slice(payload),
    }
}

/// Encode a CLOSE frame payload: status code plus UTF-8 message.
pub(crate) fn encode_close_payload(code: u16, message: &str) -> Bytes {
    let mut payload = BytesMut::with_capacity(2 + message.len());
    payload.put_u16(code);
    payload.put_slice(message.as_bytes());
    payload.freeze()
}

/// Decode a CLOSE frame payload. An empty payload means no status code.
pub(crate) fn decode_close_payload(payload: &[u8]) -> (Option<u16>, String) {
    if payload.len() < 2 {
        return (None, String::new());
    }
    let code = u16::from_be_bytes([payload[0], payload[1]]);
    let message = String::from_utf8_lossy(&payload[2..]).into_owned();
    (Some(code), message)
}

/// Incremental frame decoder over a byte stream.
///
/// Feed received bytes into an accumulation buffer and call
/// [`decode`](Self::decode) until it returns `None`, in the style of a
/// length-prefixed frame processor.
#[derive(Debug, Default)]
pub struct FrameDecoder;

impl FrameDecoder {
    #[must_use]
    pub fn new() -> Self { Self }

    /// Attempt to decode the next frame from `src`, consuming its bytes on
    /// success and leaving them untouched when more input is needed.
    ///
    /// # Errors
    ///
    /// Returns a [`FramingError`] for malformed headers; the connection
    /// should fail with a protocol error.
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<WsFrame>, FramingError> {
        if src.len() < 2 {
            return Ok(None);
        }
        let first = src[0];
        let second = src[1];
        if first & 0x70 != 0 {
            return Err(FramingError::ReservedBits);
        }
        let fin = first & 0x80 != 0;
        let opcode =
            Opcode::from_bits(first & 0x0F).ok_or(FramingError::UnknownOpcode(first & 0x0F))?;
        let masked = second & 0x80 != 0;

        let (payload_len, header_len) = match second & 0x7F {
            126 => {
                if src.len() < 4 {
                    return Ok(None);
                }
                (u64::from(u16::from_be_bytes([src[2], src[3]])), 4)
            }
            127 => {
                if src.len() < 10 {
                    return Ok(None);
                }
                let mut len_bytes = [0u8; 8];
                len_bytes.copy_from_slice(&src[2..10]);
                (u64::from_be_bytes(len_bytes), 10)
            }
            len => (u64::from(len), 2),
        };

        if opcode.is_control() {
            if !fin {
                return Err(FramingError::FragmentedControl);
            }
            if payload_len > 125 {
                return Err(FramingError::OversizedControl);
            }
        }

        let payload_len = usize::try_from(payload_len).map_err(|_| FramingError::LengthOverflow)?;
        let mask_len = if masked { 4 } else { 0 };
        let frame_len = header_len + mask_len + payload_len;
        if src.len() < frame_len {
            return Ok(None);
        }

        src.advance(header_len);
        let key = if masked {
            let key = [src[0], src[1], src[2], src[3]];
            src.advance(4);
            Some(key)
        } else {
            None
        };
        let mut payload = src.split_to(payload_len);
        if let Some(key) = key {
            for (i, byte) in payload.iter_mut().enumerate() {
                *byte ^= key[i % 4];
            }
        }
        Ok(Some(WsFrame {
            fin,
            opcode,
            payload: payload.freeze(),
        }))
    }
}
