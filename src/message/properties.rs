//! Property block encoding.
//!
//! Properties travel at the front of a message's first frame as a
//! varint-length-prefixed block of alternating NUL-terminated key and value
//! strings. Tokens matching a fixed table shared by both peers are
//! abbreviated to a single byte below 0x20.

use bytes::{BufMut, Bytes, BytesMut};

use crate::varint::write_uvarint;

/// Well-known tokens, abbreviated on the wire to `index + 1`.
const ABBREVIATIONS: [&str; 14] = [
    "Profile",
    "Error-Code",
    "Error-Domain",
    "Content-Type",
    "application/json",
    "application/octet-stream",
    "text/plain;charset=UTF-8",
    "text/xml",
    "Accept",
    "Cache-Control",
    "must-revalidate",
    "If-Match",
    "If-None-Match",
    "Location",
];

/// Encode `pairs` as a property block, without the varint length prefix.
#[must_use]
pub(crate) fn encode_block(pairs: &[(String, String)]) -> BytesMut {
    let mut block = BytesMut::new();
    for (key, value) in pairs {
        put_token(key, &mut block);
        put_token(value, &mut block);
    }
    block
}

/// Encode `pairs` with the leading varint length prefix, appending to `dst`.
pub(crate) fn encode_prefixed(pairs: &[(String, String)], dst: &mut BytesMut) {
    let block = encode_block(pairs);
    write_uvarint(block.len() as u64, dst);
    dst.extend_from_slice(&block);
}

fn put_token(token: &str, block: &mut BytesMut) {
    match ABBREVIATIONS.iter().position(|known| *known == token) {
        Some(index) => block.put_u8(index as u8 + 1),
        None => block.put_slice(token.as_bytes()),
    }
    block.put_u8(0);
}

fn expand(token: &[u8]) -> Option<&str> {
    match token.first() {
        Some(&code) if code < 0x20 => ABBREVIATIONS.get(usize::from(code) - 1).copied(),
        _ => std::str::from_utf8(token).ok(),
    }
}

/// A decoded property block: an ordered list of key/value string pairs.
///
/// Lookups are linear scans over the raw block, expanding abbreviation codes
/// on the fly; messages carry a handful of small properties, so no index is
/// kept.
#[derive(Clone, Debug, Default)]
pub struct Properties {
    block: Bytes,
}

impl Properties {
    pub(crate) fn from_block(block: Bytes) -> Self { Self { block } }

    /// Look up the value for `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.iter().find(|(k, _)| *k == key).map(|(_, v)| v)
    }

    /// Iterate over the key/value pairs in wire order. Tokens that are not
    /// valid UTF-8 and dangling keys are skipped.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        let mut tokens = self.block.split(|&b| b == 0);
        std::iter::from_fn(move || {
            loop {
                let key = tokens.next()?;
                if key.is_empty() {
                    // Terminator of the previous token pair, or end padding.
                    continue;
                }
                let value = tokens.next().unwrap_or_default();
                match (expand(key), expand(value)) {
                    (Some(k), Some(v)) => return Some((k, v)),
                    _ => continue,
                }
            }
        })
    }

    /// Number of key/value pairs.
    #[must_use]
    pub fn len(&self) -> usize { self.iter().count() }

    /// Whether the block holds no properties.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.iter().next().is_none() }
}
