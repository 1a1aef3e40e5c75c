//! MQTT wire primitives (MQTT v5 §1.5).
//!
//! The remaining-length field of every MQTT packet is a variable-byte
//! integer: little-endian base-128 with a continuation bit of 0x80 on every
//! byte except the last. MQTT caps the encoding at 4 bytes, so the
//! largest representable value is 2^28 - 1. String fields are UTF-8 with a
//! 2-byte big-endian length prefix.

/// A decoded variable-byte integer together with the bytes it occupied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Varint {
    pub value: u32,
    pub consumed: usize,
}

/// Encode `n` as an MQTT variable-byte integer.
///
/// Callers must keep `n` below 2^28; larger values are not representable in
/// the 4-byte form the protocol allows.
pub fn encode_varint(mut n: u32) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(4);
    loop {
        let mut b = (n % 128) as u8;
        n /= 128;
        if n > 0 {
            b |= 0x80;
        }
        bytes.push(b);
        if n == 0 {
            return bytes;
        }
    }
}

/// Decode a variable-byte integer from `buf` starting at `offset`.
///
/// Returns `None` when the buffer ends before a terminating byte, or when
/// the fourth byte still carries the continuation bit (oversized encoding).
/// Callers must treat `None` as "insufficient or invalid data".
pub fn decode_varint(buf: &[u8], offset: usize) -> Option<Varint> {
    let mut value = 0u32;
    let mut shift = 0;
    let mut consumed = 0;
    loop {
        let byte = *buf.get(offset + consumed)?;
        consumed += 1;
        value |= u32::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some(Varint { value, consumed });
        }
        if consumed == 4 {
            return None;
        }
        shift += 7;
    }
}

/// Encode `s` as a 2-byte big-endian length prefix followed by UTF-8 bytes.
///
/// The length prefix is 16 bits; strings whose encoding exceeds 65535 bytes
/// are a caller error and have their length truncated rather than panicking.
pub fn write_utf8(s: &str) -> Vec<u8> {
    let bytes = s.as_bytes();
    let len = bytes.len() as u16;
    let mut buf = Vec::with_capacity(2 + bytes.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(bytes);
    buf
}

/// Decode a length-prefixed UTF-8 string from `buf` starting at `offset`.
///
/// Returns the string and the total bytes consumed (prefix included), or
/// `None` when the buffer is too short. Invalid UTF-8 is replaced rather
/// than rejected, matching how payload text is handled.
pub fn read_utf8(buf: &[u8], offset: usize) -> Option<(String, usize)> {
    let len_bytes = buf.get(offset..offset + 2)?;
    let len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
    let bytes = buf.get(offset + 2..offset + 2 + len)?;
    Some((String::from_utf8_lossy(bytes).into_owned(), 2 + len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_roundtrip_boundaries() {
        for n in [
            0u32,
            1,
            127,
            128,
            16_383,
            16_384,
            2_097_151,
            2_097_152,
            (1 << 28) - 1,
        ] {
            let encoded = encode_varint(n);
            let decoded = decode_varint(&encoded, 0).unwrap();
            assert_eq!(decoded.value, n);
            assert_eq!(decoded.consumed, encoded.len());
        }
    }

    #[test]
    fn varint_encoded_lengths() {
        assert_eq!(encode_varint(127).len(), 1);
        assert_eq!(encode_varint(128).len(), 2);
        assert_eq!(encode_varint(16_384).len(), 3);
        assert_eq!(encode_varint(2_097_152).len(), 4);
    }

    #[test]
    fn varint_with_offset() {
        let mut buf = vec![0xff, 0xff];
        buf.extend(encode_varint(300));
        let decoded = decode_varint(&buf, 2).unwrap();
        assert_eq!(decoded.value, 300);
        assert_eq!(decoded.consumed, 2);
    }

    #[test]
    fn varint_truncated() {
        // Continuation bit set but the buffer ends.
        assert_eq!(decode_varint(&[0x80], 0), None);
        assert_eq!(decode_varint(&[], 0), None);
        assert_eq!(decode_varint(&[0x00], 1), None);
    }

    #[test]
    fn varint_oversized() {
        // Five continuation bytes: must report failure, not panic or spin.
        assert_eq!(decode_varint(&[0x80, 0x80, 0x80, 0x80, 0x80], 0), None);
        // Four bytes with the last still continuing is also malformed.
        assert_eq!(decode_varint(&[0xff, 0xff, 0xff, 0xff, 0x01], 0), None);
    }

    #[test]
    fn utf8_roundtrip() {
        for s in ["", "a/b", "hello world", "grüße/置顶", "🦀"] {
            let encoded = write_utf8(s);
            let (decoded, consumed) = read_utf8(&encoded, 0).unwrap();
            assert_eq!(decoded, s);
            assert_eq!(consumed, encoded.len());
        }
    }

    #[test]
    fn utf8_truncated() {
        let encoded = write_utf8("topic");
        assert_eq!(read_utf8(&encoded[..encoded.len() - 1], 0), None);
        assert_eq!(read_utf8(&encoded[..1], 0), None);
    }

    #[test]
    fn utf8_oversized_string_truncates_length() {
        // 65536 bytes: the 16-bit prefix wraps to 0. Characterized, not
        // supported; callers must keep strings under 64 KiB.
        let s = "x".repeat(65_536);
        let encoded = write_utf8(&s);
        assert_eq!(&encoded[..2], &[0, 0]);
    }
}
