//! Per-frame compression and the rolling direction checksum.
//!
//! One [`Deflater`] and one [`Inflater`] exist per connection, shared by all
//! messages of the matching direction. Compressed frames therefore must pass
//! through the codec in transmission order. Both codecs also run the
//! direction's CRC-32: over pre-compression bytes on the write side and
//! post-decompression bytes on the read side, so the checksum is independent
//! of frame boundaries and compression state.
//!
//! Sync-flush deflate always ends its output with `00 00 FF FF`. The sender
//! strips that trailer from each compressed frame and the receiver restores
//! it before inflating, saving four bytes per frame.

use crc32fast::Hasher;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};
use thiserror::Error;

use crate::frame::FrameBuf;

/// Size in bytes of the per-frame checksum trailer.
pub const CHECKSUM_SIZE: usize = 4;

/// The four bytes every sync-flush deflate block ends with.
pub(crate) const SYNC_FLUSH_TRAILER: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

/// Chunk growth for inflate output.
const INFLATE_CHUNK: usize = 8 * 1024;

/// How a codec call treats its payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodecMode {
    /// Pass bytes through untouched (checksum only).
    Raw,
    /// Deflate/inflate, flushing so output ends at a byte boundary.
    SyncFlush,
}

/// Errors raised by the frame codecs.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CodecError {
    /// The deflater rejected its input or state.
    #[error("deflate failed: {0}")]
    Deflate(#[from] flate2::CompressError),

    /// The inflater rejected the compressed stream.
    #[error("inflate failed: {0}")]
    Inflate(#[from] flate2::DecompressError),

    /// The inflater made no progress on non-empty input.
    #[error("compressed frame is truncated")]
    Stalled,

    /// A compressed frame did not end with the sync-flush trailer.
    #[error("sync-flush trailer missing from compressed frame")]
    MissingTrailer,

    /// The received checksum does not match the running CRC-32.
    #[error("checksum mismatch: expected {expected:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { expected: u32, computed: u32 },
}

/// Write-side codec: raw-deflate compressor plus the outbound CRC-32.
pub struct Deflater {
    compress: Compress,
    checksum: Hasher,
    unflushed: usize,
}

impl Deflater {
    /// Create a deflater at the given compression level. Uses raw deflate
    /// (no zlib wrapper), as the wire format requires.
    #[must_use]
    pub fn new(level: Compression) -> Self {
        Self {
            compress: Compress::new(level, false),
            checksum: Hasher::new(),
            unflushed: 0,
        }
    }

    /// Move bytes from the front of `src` into `dst`, advancing `src` past
    /// what was consumed and returning the consumed count.
    ///
    /// `Raw` copies verbatim; `SyncFlush` deflates and ends the call's output
    /// at a byte boundary. Either way the consumed bytes feed the outbound
    /// checksum. The call stops early when `dst` runs out of room.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Deflate`] if the compressor fails.
    pub fn write(
        &mut self,
        src: &mut &[u8],
        dst: &mut FrameBuf,
        mode: CodecMode,
    ) -> Result<usize, CodecError> {
        match mode {
            CodecMode::Raw => {
                let n = src.len().min(dst.remaining());
                self.checksum.update(&src[..n]);
                dst.put_slice(&src[..n]);
                *src = &src[n..];
                Ok(n)
            }
            CodecMode::SyncFlush => self.write_deflated(src, dst),
        }
    }

    fn write_deflated(&mut self, src: &mut &[u8], dst: &mut FrameBuf) -> Result<usize, CodecError> {
        let mut consumed_total = 0;
        while !src.is_empty() {
            // Feed no more input than the remaining room can absorb even if
            // deflate expands it (stored blocks add ~5 bytes per 64 KiB, the
            // flush marker and bit padding another handful), so the sync
            // flush always completes within this frame.
            let room = dst.remaining();
            let max_input = room.saturating_sub(room / 64 + 64);
            if max_input == 0 {
                break;
            }
            let take = src.len().min(max_input);
            let before_in = self.compress.total_in();
            let before_out = self.compress.total_out();
            self.compress
                .compress(&src[..take], dst.unfilled(), FlushCompress::Sync)?;
            let consumed = (self.compress.total_in() - before_in) as usize;
            let produced = (self.compress.total_out() - before_out) as usize;
            self.checksum.update(&src[..consumed]);
            *src = &src[consumed..];
            dst.advance(produced);
            consumed_total += consumed;
            if consumed == 0 && produced == 0 {
                break;
            }
        }
        // A completed sync flush always leaves spare room in the output
        // buffer; a full buffer means deflate still holds pending bytes.
        self.unflushed = usize::from(dst.remaining() == 0);
        Ok(consumed_total)
    }

    /// Nonzero when the last compressed write could not complete its sync
    /// flush. At the end of a frame this means the frame is unrecoverable,
    /// since its output does not stop at a byte boundary.
    #[must_use]
    pub fn unflushed_bytes(&self) -> usize { self.unflushed }

    /// Append the current running checksum, big-endian, to `dst`.
    pub fn write_checksum(&self, dst: &mut FrameBuf) {
        dst.put_slice(&self.checksum.clone().finalize().to_be_bytes());
    }
}

/// Read-side codec: raw-deflate decompressor plus the inbound CRC-32.
pub struct Inflater {
    decompress: Decompress,
    checksum: Hasher,
}

impl Inflater {
    #[must_use]
    pub fn new() -> Self {
        Self {
            decompress: Decompress::new(false),
            checksum: Hasher::new(),
        }
    }

    /// Decode all of `src`, appending the output to `dst` and feeding it to
    /// the inbound checksum.
    ///
    /// For `SyncFlush` input the caller must already have restored the
    /// `00 00 FF FF` trailer the sender stripped.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Inflate`] on corrupt input and
    /// [`CodecError::Stalled`] if the decompressor stops making progress.
    pub fn read(
        &mut self,
        src: &[u8],
        dst: &mut Vec<u8>,
        mode: CodecMode,
    ) -> Result<(), CodecError> {
        match mode {
            CodecMode::Raw => {
                self.checksum.update(src);
                dst.extend_from_slice(src);
                Ok(())
            }
            CodecMode::SyncFlush => self.read_inflated(src, dst),
        }
    }

    fn read_inflated(&mut self, src: &[u8], dst: &mut Vec<u8>) -> Result<(), CodecError> {
        let mut input = src;
        while !input.is_empty() {
            let out_start = dst.len();
            dst.resize(out_start + INFLATE_CHUNK, 0);
            let before_in = self.decompress.total_in();
            let before_out = self.decompress.total_out();
            let result =
                self.decompress
                    .decompress(input, &mut dst[out_start..], FlushDecompress::Sync);
            let consumed = (self.decompress.total_in() - before_in) as usize;
            let produced = (self.decompress.total_out() - before_out) as usize;
            dst.truncate(out_start + produced);
            result?;
            self.checksum.update(&dst[out_start..]);
            input = &input[consumed..];
            if consumed == 0 && produced == 0 {
                return Err(CodecError::Stalled);
            }
        }
        Ok(())
    }

    /// Compare the running checksum against a received trailer value.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::ChecksumMismatch`] when they differ; the
    /// connection must be torn down.
    pub fn verify_checksum(&self, expected: u32) -> Result<(), CodecError> {
        let computed = self.checksum.clone().finalize();
        if computed == expected {
            Ok(())
        } else {
            Err(CodecError::ChecksumMismatch { expected, computed })
        }
    }
}

impl Default for Inflater {
    fn default() -> Self { Self::new() }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn deflate_frame(deflater: &mut Deflater, mut payload: &[u8], capacity: usize) -> Vec<u8> {
        let mut buf = FrameBuf::new(capacity);
        while !payload.is_empty() {
            deflater
                .write(&mut payload, &mut buf, CodecMode::SyncFlush)
                .expect("deflate");
        }
        assert_eq!(deflater.unflushed_bytes(), 0);
        let mut out = buf.as_slice().to_vec();
        assert!(out.ends_with(&SYNC_FLUSH_TRAILER));
        out.truncate(out.len() - SYNC_FLUSH_TRAILER.len());
        out
    }

    fn inflate_frame(inflater: &mut Inflater, frame: &[u8]) -> Vec<u8> {
        let mut input = frame.to_vec();
        input.extend_from_slice(&SYNC_FLUSH_TRAILER);
        let mut out = Vec::new();
        inflater
            .read(&input, &mut out, CodecMode::SyncFlush)
            .expect("inflate");
        out
    }

    #[test]
    fn raw_mode_copies_and_checksums() {
        let mut deflater = Deflater::new(Compression::default());
        let mut inflater = Inflater::new();
        let payload = b"raw passthrough";

        let mut buf = FrameBuf::new(64);
        let mut src = &payload[..];
        deflater
            .write(&mut src, &mut buf, CodecMode::Raw)
            .expect("raw write");
        assert!(src.is_empty());
        assert_eq!(buf.as_slice(), payload);

        let mut out = Vec::new();
        inflater
            .read(buf.as_slice(), &mut out, CodecMode::Raw)
            .expect("raw read");
        assert_eq!(out, payload);
        assert_eq!(
            crc32fast::hash(payload),
            deflater.checksum.clone().finalize()
        );
        inflater
            .verify_checksum(crc32fast::hash(payload))
            .expect("checksum");
    }

    #[test]
    fn raw_mode_respects_buffer_budget() {
        let mut deflater = Deflater::new(Compression::default());
        let mut buf = FrameBuf::new(4);
        let mut src = &b"123456"[..];
        let consumed = deflater
            .write(&mut src, &mut buf, CodecMode::Raw)
            .expect("raw write");
        assert_eq!(consumed, 4);
        assert_eq!(src, b"56");
    }

    #[test]
    fn compressed_frames_round_trip_across_boundaries() {
        let mut deflater = Deflater::new(Compression::default());
        let mut inflater = Inflater::new();

        let payload: Vec<u8> = (0u32..10_000).map(|i| (i % 251) as u8).collect();
        let frames: Vec<Vec<u8>> = payload
            .chunks(3000)
            .map(|chunk| deflate_frame(&mut deflater, chunk, 64 * 1024))
            .collect();

        let mut reassembled = Vec::new();
        for frame in &frames {
            reassembled.extend_from_slice(&inflate_frame(&mut inflater, frame));
        }
        assert_eq!(reassembled, payload);
        inflater
            .verify_checksum(deflater.checksum.clone().finalize())
            .expect("running checksums agree");
    }

    #[test]
    fn checksum_mismatch_is_reported() {
        let inflater = Inflater::new();
        let err = inflater.verify_checksum(0xDEAD_BEEF).unwrap_err();
        assert!(matches!(err, CodecError::ChecksumMismatch { .. }));
    }

    #[test]
    fn corrupt_compressed_input_fails() {
        let mut deflater = Deflater::new(Compression::default());
        let mut inflater = Inflater::new();
        let mut frame = deflate_frame(&mut deflater, &[7u8; 4096], 64 * 1024);
        for byte in frame.iter_mut() {
            *byte = byte.wrapping_add(0x55);
        }
        let mut input = frame;
        input.extend_from_slice(&SYNC_FLUSH_TRAILER);
        let mut out = Vec::new();
        assert!(inflater
            .read(&input, &mut out, CodecMode::SyncFlush)
            .is_err());
    }

    proptest! {
        #[test]
        fn any_payload_survives_compression(payload in proptest::collection::vec(any::<u8>(), 0..4096)) {
            let mut deflater = Deflater::new(Compression::default());
            let mut inflater = Inflater::new();
            if payload.is_empty() {
                return Ok(());
            }
            let frame = deflate_frame(&mut deflater, &payload, 64 * 1024);
            prop_assert_eq!(inflate_frame(&mut inflater, &frame), payload);
        }
    }
}
