use crate::message::ResponseCode;

/// Structured error detail attached to an error-class response
///
/// Decoded on a best-effort basis from a small tagged record carried in the
/// response payload: an optional namespace string, a signed numeric code, and
/// an optional message string. Absent or malformed input yields the default
/// value; decoding never fails.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtendedError {
    /// Namespace the numeric code belongs to
    pub namespace: Option<String>,
    /// Namespace-specific error code, zero when absent
    pub code: i32,
    /// Human-readable detail
    pub message: Option<String>,
}

const NAMESPACE_FIELD: u64 = 1;
const CODE_FIELD: u64 = 2;
const MESSAGE_FIELD: u64 = 3;

impl ExtendedError {
    /// Decode the extended error attached to a response, if any
    ///
    /// Returns `None` for non-error response codes. For error-class codes the
    /// payload is decoded permissively: any subset of fields may be present
    /// and unknown fields are skipped. A payload that fails to decode
    /// mid-record is rejected as a whole and yields the default value.
    pub fn decode(code: ResponseCode, payload: &[u8]) -> Option<Self> {
        if !code.is_error() {
            return None;
        }
        Some(Self::decode_fields(payload))
    }

    fn decode_fields(payload: &[u8]) -> Self {
        let mut decoded = Self::default();
        let mut cursor = Cursor { buf: payload };
        while !cursor.buf.is_empty() {
            let Some(key) = cursor.varint() else {
                return Self::default();
            };
            let (field, wire_type) = (key >> 3, key & 0x07);
            let parsed = match (field, wire_type) {
                (NAMESPACE_FIELD, 2) => cursor
                    .string()
                    .map(|value| decoded.namespace = Some(value)),
                (CODE_FIELD, 0) => cursor
                    .varint()
                    .map(|value| decoded.code = zigzag(value)),
                (MESSAGE_FIELD, 2) => cursor.string().map(|value| decoded.message = Some(value)),
                (_, wire_type) => cursor.skip(wire_type),
            };
            if parsed.is_none() {
                // fields are not salvaged from a partially valid record
                return Self::default();
            }
        }
        decoded
    }
}

/// Zigzag-decode a varint into a signed 32-bit code
fn zigzag(value: u64) -> i32 {
    ((value >> 1) as i64 ^ -((value & 1) as i64)) as i32
}

struct Cursor<'a> {
    buf: &'a [u8],
}

impl Cursor<'_> {
    fn varint(&mut self) -> Option<u64> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let (&byte, rest) = self.buf.split_first()?;
            self.buf = rest;
            if shift >= 64 {
                return None;
            }
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Some(value);
            }
            shift += 7;
        }
    }

    fn bytes(&mut self) -> Option<&[u8]> {
        let len = self.varint()? as usize;
        if len > self.buf.len() {
            return None;
        }
        let (value, rest) = self.buf.split_at(len);
        self.buf = rest;
        Some(value)
    }

    fn string(&mut self) -> Option<String> {
        let raw = self.bytes()?;
        String::from_utf8(raw.to_vec()).ok()
    }

    fn skip(&mut self, wire_type: u64) -> Option<()> {
        match wire_type {
            0 => self.varint().map(|_| ()),
            1 => self.advance(8),
            2 => self.bytes().map(|_| ()),
            5 => self.advance(4),
            _ => None,
        }
    }

    fn advance(&mut self, count: usize) -> Option<()> {
        if count > self.buf.len() {
            return None;
        }
        self.buf = &self.buf[count..];
        Some(())
    }
}
