//! Distributed-tier wire frame
//!
//! Self-describing binary envelope persisted to the distributed store:
//!
//! ```text
//! [2B sentinel+version][2B entropy][8B creation ticks LE]
//! [varint flags][varint payload-length][varint duration-ms][varint tag-count]
//! [varint+utf8 key][varint+utf8 tag]*[payload bytes][2B sentinel+version]
//! ```
//!
//! Parsing never panics and never returns `Err`: every malformed, foreign,
//! expired or invalidated frame maps to a typed outcome the read path treats
//! as an ordinary miss. An unrecognized leading marker means "written by an
//! incompatible producer", which is distinct from corruption.

use std::ops::Range;
use std::sync::Arc;

use crate::cache::invalidation::{TagInvalidationStore, TagStamp};
use crate::cache::tags::{TagSet, WILDCARD_TAG};
use crate::cache::types::EntryFlags;
use crate::cache::wire::varint::{read_varint, write_varint};

/// Leading/trailing frame marker byte.
pub const SENTINEL: u8 = 0x5A;
/// Format version. Frames with a different version byte are treated as a
/// miss, never as a hard failure.
pub const PROTOCOL_VERSION: u8 = 0x01;

const MARKER: [u8; 2] = [SENTINEL, PROTOCOL_VERSION];
// marker(2) + entropy(2) + creation(8)
const FIXED_HEADER_LEN: usize = 12;

/// Typed parse outcome. Only `Success` carries data; everything else is a
/// reason the frame cannot be served.
#[derive(Debug)]
pub enum PayloadParse {
    Success(ParsedFields),
    /// Leading marker unknown: foreign or incompatible producer.
    FormatNotRecognized,
    /// Structural corruption: truncation, varint overflow, bad trailing
    /// marker, leftover bytes, malformed strings.
    InvalidData,
    /// The embedded key differs from the lookup key.
    KeyMismatch,
    /// Entry-level lifetime elapsed.
    Expired,
    /// Invalidated by the wildcard or by one of its tags.
    Invalidated,
}

/// Fields of a successfully parsed frame. `payload` is a range into the
/// input buffer so the caller can adopt the bytes without copying.
#[derive(Debug)]
pub struct ParsedFields {
    pub creation_ticks: u64,
    pub duration_ms: u64,
    pub flags: EntryFlags,
    pub payload: Range<usize>,
    pub tags: TagSet,
    /// Tags whose invalidation stamp is still being fetched from the
    /// distributed store. Non-empty means freshness is unconfirmed; the
    /// caller must fail closed.
    pub pending_tags: Vec<Arc<str>>,
}

/// Appends a complete wire frame to `out`.
pub fn write_payload(
    out: &mut Vec<u8>,
    key: &str,
    tags: &TagSet,
    flags: EntryFlags,
    creation_ticks: u64,
    duration_ms: u64,
    payload: &[u8],
) {
    out.extend_from_slice(&MARKER);
    out.extend_from_slice(&rand::random::<u16>().to_le_bytes());
    out.extend_from_slice(&creation_ticks.to_le_bytes());
    write_varint(out, flags.bits());
    write_varint(out, payload.len() as u64);
    write_varint(out, duration_ms);
    write_varint(out, tags.len() as u64);
    write_string(out, key);
    for tag in tags.iter() {
        write_string(out, tag);
    }
    out.extend_from_slice(payload);
    out.extend_from_slice(&MARKER);
}

fn write_string(out: &mut Vec<u8>, value: &str) {
    write_varint(out, value.len() as u64);
    out.extend_from_slice(value.as_bytes());
}

fn read_string<'a>(data: &'a [u8], pos: &mut usize) -> Option<&'a str> {
    let len = read_varint(data, pos)?;
    let len = usize::try_from(len).ok()?;
    let end = pos.checked_add(len)?;
    let bytes = data.get(*pos..end)?;
    *pos = end;
    std::str::from_utf8(bytes).ok()
}

/// Parses and freshness-checks a frame fetched for `expected_key`.
///
/// Tag checks consult the invalidation store for every embedded tag even
/// after the first stale one is found, so each tag's distributed lookup is
/// kick-started on this request rather than the next.
pub fn try_parse(
    data: &[u8],
    expected_key: &str,
    now_ticks: u64,
    invalidation: &TagInvalidationStore,
) -> PayloadParse {
    if data.len() < FIXED_HEADER_LEN + MARKER.len() {
        if data.len() >= MARKER.len() && data[..2] != MARKER {
            return PayloadParse::FormatNotRecognized;
        }
        return PayloadParse::InvalidData;
    }
    if data[..2] != MARKER {
        return PayloadParse::FormatNotRecognized;
    }
    // Bytes 2..4 are entropy, ignored on read.
    let creation_ticks = u64::from_le_bytes([
        data[4], data[5], data[6], data[7], data[8], data[9], data[10], data[11],
    ]);
    let mut pos = FIXED_HEADER_LEN;

    let raw_flags = match read_varint(data, &mut pos) {
        Some(v) => v,
        None => return PayloadParse::InvalidData,
    };
    // Unknown bits were written by a newer minor version; tolerated.
    let flags = EntryFlags::from_bits_truncate(raw_flags);
    let payload_len = match read_varint(data, &mut pos).map(usize::try_from) {
        Some(Ok(v)) => v,
        _ => return PayloadParse::InvalidData,
    };
    let duration_ms = match read_varint(data, &mut pos) {
        Some(v) => v,
        None => return PayloadParse::InvalidData,
    };
    let tag_count = match read_varint(data, &mut pos) {
        Some(v) => v,
        None => return PayloadParse::InvalidData,
    };
    // Each tag needs at least one byte; a larger count is corrupt.
    if tag_count > data.len() as u64 {
        return PayloadParse::InvalidData;
    }

    // Entry-level expiry comes before any tag work.
    if creation_ticks.saturating_add(duration_ms) <= now_ticks {
        return PayloadParse::Expired;
    }

    let mut pending_tags: Vec<Arc<str>> = Vec::new();
    let mut invalidated = false;
    match invalidation.stamp_for(WILDCARD_TAG) {
        TagStamp::Resolved(ticks) if creation_ticks <= ticks => invalidated = true,
        TagStamp::Resolved(_) => {}
        TagStamp::Pending => pending_tags.push(Arc::from(WILDCARD_TAG)),
    }

    let embedded_key = match read_string(data, &mut pos) {
        Some(key) => key,
        None => return PayloadParse::InvalidData,
    };
    if embedded_key != expected_key {
        return PayloadParse::KeyMismatch;
    }

    let mut tags: Vec<Arc<str>> = Vec::with_capacity(tag_count as usize);
    for _ in 0..tag_count {
        let tag = match read_string(data, &mut pos) {
            Some(tag) => tag,
            None => return PayloadParse::InvalidData,
        };
        if tag.is_empty() || tag == WILDCARD_TAG {
            return PayloadParse::InvalidData;
        }
        match invalidation.stamp_for(tag) {
            TagStamp::Resolved(ticks) if creation_ticks <= ticks => invalidated = true,
            TagStamp::Resolved(_) => {}
            TagStamp::Pending => pending_tags.push(Arc::from(tag)),
        }
        tags.push(Arc::from(tag));
    }

    // Trailing marker must sit exactly at the computed offset with nothing
    // after it.
    let payload_start = pos;
    let payload_end = match payload_start.checked_add(payload_len) {
        Some(end) => end,
        None => return PayloadParse::InvalidData,
    };
    let expected_total = match payload_end.checked_add(MARKER.len()) {
        Some(total) => total,
        None => return PayloadParse::InvalidData,
    };
    if expected_total != data.len() || data[payload_end..] != MARKER {
        return PayloadParse::InvalidData;
    }

    if invalidated {
        return PayloadParse::Invalidated;
    }

    PayloadParse::Success(ParsedFields {
        creation_ticks,
        duration_ms,
        flags,
        payload: payload_start..payload_end,
        tags: TagSet::from_vec(tags),
        pending_tags,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_store() -> TagInvalidationStore {
        TagInvalidationStore::new(None)
    }

    fn frame(key: &str, tags: &TagSet, creation: u64, duration: u64, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        write_payload(
            &mut out,
            key,
            tags,
            EntryFlags::empty(),
            creation,
            duration,
            payload,
        );
        out
    }

    #[test]
    fn round_trip_with_tags() {
        let tags = TagSet::new(["beta", "alpha"]).unwrap();
        let buf = frame("user:1", &tags, 1_000, 60_000, b"hello world");
        let store = empty_store();
        match try_parse(&buf, "user:1", 2_000, &store) {
            PayloadParse::Success(fields) => {
                assert_eq!(fields.creation_ticks, 1_000);
                assert_eq!(fields.duration_ms, 60_000);
                assert_eq!(&buf[fields.payload], b"hello world");
                assert_eq!(fields.tags.len(), 2);
                assert!(fields.pending_tags.is_empty());
            }
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[test]
    fn empty_payload_round_trips() {
        let buf = frame("k", &TagSet::Empty, 10, 1_000, b"");
        match try_parse(&buf, "k", 10, &empty_store()) {
            PayloadParse::Success(fields) => assert!(fields.payload.is_empty()),
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[test]
    fn unknown_version_is_not_recognized() {
        let mut buf = frame("k", &TagSet::Empty, 10, 1_000, b"data");
        buf[1] = PROTOCOL_VERSION + 1;
        assert!(matches!(
            try_parse(&buf, "k", 10, &empty_store()),
            PayloadParse::FormatNotRecognized
        ));
    }

    #[test]
    fn trailing_sentinel_flip_is_corruption() {
        let mut buf = frame("k", &TagSet::Empty, 10, 1_000, b"data");
        let last = buf.len() - 1;
        buf[last] ^= 0xFF;
        assert!(matches!(
            try_parse(&buf, "k", 10, &empty_store()),
            PayloadParse::InvalidData
        ));
    }

    #[test]
    fn truncation_is_corruption() {
        let buf = frame("k", &TagSet::Empty, 10, 1_000, b"data");
        for cut in [buf.len() - 1, buf.len() - 3, FIXED_HEADER_LEN + 1] {
            assert!(matches!(
                try_parse(&buf[..cut], "k", 10, &empty_store()),
                PayloadParse::InvalidData | PayloadParse::FormatNotRecognized
            ));
        }
    }

    #[test]
    fn leftover_bytes_are_corruption() {
        let mut buf = frame("k", &TagSet::Empty, 10, 1_000, b"data");
        buf.push(0x00);
        assert!(matches!(
            try_parse(&buf, "k", 10, &empty_store()),
            PayloadParse::InvalidData
        ));
    }

    #[test]
    fn key_mismatch_is_distinct() {
        let buf = frame("k1", &TagSet::Empty, 10, 1_000, b"data");
        assert!(matches!(
            try_parse(&buf, "k2", 10, &empty_store()),
            PayloadParse::KeyMismatch
        ));
    }

    #[test]
    fn entry_expiry_precedes_tag_checks() {
        let buf = frame("k", &TagSet::Empty, 10, 100, b"data");
        assert!(matches!(
            try_parse(&buf, "k", 110, &empty_store()),
            PayloadParse::Expired
        ));
        assert!(matches!(
            try_parse(&buf, "k", 109, &empty_store()),
            PayloadParse::Success(_)
        ));
    }

    #[test]
    fn wildcard_invalidation_dominates() {
        let store = empty_store();
        store.invalidate(WILDCARD_TAG, 50);
        let buf = frame("k", &TagSet::Empty, 40, 10_000, b"data");
        assert!(matches!(
            try_parse(&buf, "k", 60, &store),
            PayloadParse::Invalidated
        ));
        let fresh = frame("k", &TagSet::Empty, 60, 10_000, b"data");
        assert!(matches!(
            try_parse(&fresh, "k", 70, &store),
            PayloadParse::Success(_)
        ));
    }

    #[test]
    fn tag_invalidation_rejects_older_entries() {
        let store = empty_store();
        store.invalidate("promo", 500);
        let tags = TagSet::new(["promo"]).unwrap();
        let stale = frame("k", &tags, 400, 10_000, b"data");
        assert!(matches!(
            try_parse(&stale, "k", 600, &store),
            PayloadParse::Invalidated
        ));
        let fresh = frame("k", &tags, 600, 10_000, b"data");
        assert!(matches!(
            try_parse(&fresh, "k", 700, &store),
            PayloadParse::Success(_)
        ));
    }

    #[test]
    fn embedded_wildcard_tag_is_corruption() {
        // Hand-build a frame claiming one tag whose value is the wildcard.
        let mut buf = Vec::new();
        buf.extend_from_slice(&MARKER);
        buf.extend_from_slice(&0u16.to_le_bytes());
        buf.extend_from_slice(&100u64.to_le_bytes());
        write_varint(&mut buf, 0); // flags
        write_varint(&mut buf, 0); // payload len
        write_varint(&mut buf, 10_000); // duration
        write_varint(&mut buf, 1); // tag count
        write_string(&mut buf, "k");
        write_string(&mut buf, WILDCARD_TAG);
        buf.extend_from_slice(&MARKER);
        assert!(matches!(
            try_parse(&buf, "k", 100, &empty_store()),
            PayloadParse::InvalidData
        ));
    }

    #[test]
    fn absurd_tag_count_is_corruption() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&MARKER);
        buf.extend_from_slice(&0u16.to_le_bytes());
        buf.extend_from_slice(&100u64.to_le_bytes());
        write_varint(&mut buf, 0);
        write_varint(&mut buf, 0);
        write_varint(&mut buf, 10_000);
        write_varint(&mut buf, u64::MAX); // tag count
        write_string(&mut buf, "k");
        buf.extend_from_slice(&MARKER);
        assert!(matches!(
            try_parse(&buf, "k", 100, &empty_store()),
            PayloadParse::InvalidData
        ));
    }
}
