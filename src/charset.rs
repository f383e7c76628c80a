use encoding_rs::{Encoding, UTF_8, UTF_16BE, UTF_16LE};
use std::borrow::Cow;
use std::fmt;

use crate::error::{Error, Result};

/// Text encoding of a payload.
///
/// UTF-8, UTF-16 and single-byte encodings are byte transparent: a key encoded in the charset
/// can be matched directly against the payload bytes, so bytes that do not decode are carried
/// through untouched. Other multi-byte encodings go through a decode / re-encode cycle.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Charset {
    encoding: &'static Encoding,
}

impl Charset {
    pub fn utf8() -> Self {
        Self { encoding: UTF_8 }
    }

    pub fn utf16le() -> Self {
        Self { encoding: UTF_16LE }
    }

    pub fn utf16be() -> Self {
        Self { encoding: UTF_16BE }
    }

    pub fn for_label(label: &str) -> Result<Self> {
        Encoding::for_label(label.trim().as_bytes())
            .map(|encoding| Self { encoding })
            .ok_or_else(|| Error::UnsupportedCharset(label.to_string()))
    }

    pub fn name(&self) -> &'static str {
        self.encoding.name()
    }

    /// Code unit width in bytes; matches must start on a unit boundary.
    pub fn unit(&self) -> usize {
        if self.is_utf16() { 2 } else { 1 }
    }

    pub fn is_byte_transparent(&self) -> bool {
        self.encoding == UTF_8 || self.is_utf16() || self.encoding.is_single_byte()
    }

    fn is_utf16(&self) -> bool {
        self.encoding == UTF_16LE || self.encoding == UTF_16BE
    }

    /// Encodes `text`, or `None` when a character has no mapping in this charset.
    pub fn encode<'a>(&self, text: &'a str) -> Option<Cow<'a, [u8]>> {
        if self.encoding == UTF_16LE {
            return Some(Cow::Owned(
                text.encode_utf16().flat_map(u16::to_le_bytes).collect(),
            ));
        }
        if self.encoding == UTF_16BE {
            return Some(Cow::Owned(
                text.encode_utf16().flat_map(u16::to_be_bytes).collect(),
            ));
        }
        let (bytes, _, unmappable) = self.encoding.encode(text);
        (!unmappable).then_some(bytes)
    }

    /// Strict decode without BOM sniffing; `None` on malformed input.
    pub fn decode<'a>(&self, bytes: &'a [u8]) -> Option<Cow<'a, str>> {
        self.encoding
            .decode_without_bom_handling_and_without_replacement(bytes)
    }
}

impl Default for Charset {
    fn default() -> Self {
        Self::utf8()
    }
}

impl fmt::Debug for Charset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Display for Charset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
