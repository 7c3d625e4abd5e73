//! Bytes payload, shared by `bytes` and `bytearray`.

use std::fmt::Write;

use serde::{Deserialize, Serialize};

/// Raw byte storage. The heap distinguishes the immutable and mutable types
/// by variant; the payload is the same.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Bytes(Vec<u8>);

impl Bytes {
    #[must_use]
    pub fn new(data: Vec<u8>) -> Self {
        Self(data)
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    #[must_use]
    pub fn as_mut_vec(&mut self) -> &mut Vec<u8> {
        &mut self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn estimate_size(&self) -> usize {
        self.0.capacity() + size_of::<Self>()
    }
}

/// Writes the guest `repr` of bytes content: `b'...'` with escapes.
pub(crate) fn write_bytes_repr(out: &mut String, data: &[u8], mutable: bool) {
    if mutable {
        out.push_str("bytearray(");
    }
    out.push_str("b'");
    for &byte in data {
        match byte {
            b'\\' => out.push_str("\\\\"),
            b'\'' => out.push_str("\\'"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            0x20..=0x7e => out.push(byte as char),
            _ => {
                let _ = write!(out, "\\x{byte:02x}");
            }
        }
    }
    out.push('\'');
    if mutable {
        out.push(')');
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repr_escapes_non_printable() {
        let mut out = String::new();
        write_bytes_repr(&mut out, b"a\x00'\xff", false);
        assert_eq!(out, "b'a\\x00\\'\\xff'");
    }

    #[test]
    fn bytearray_repr_wraps() {
        let mut out = String::new();
        write_bytes_repr(&mut out, b"ok", true);
        assert_eq!(out, "bytearray(b'ok')");
    }
}
