//! Rewrites `CONSTANT_Utf8` entries in JVM class files; the rest of the file is copied through.

use serde::Serialize;
use std::ops::Range;
use tracing::debug;

use crate::error::{Error, Result};
use crate::placeholder::PlaceholderMap;
use crate::result::{Rewrite, Warning};
use crate::text::CompiledMap;

pub const MAGIC: u32 = 0xCAFE_BABE;
const HEADER_LEN: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstantPoolEntry<'a> {
    Utf8(&'a [u8]),
    Integer(u32),
    Float(u32),
    Long(u64),
    Double(u64),
    Class { name_index: u16 },
    String { string_index: u16 },
    FieldRef { class_index: u16, name_and_type_index: u16 },
    MethodRef { class_index: u16, name_and_type_index: u16 },
    InterfaceMethodRef { class_index: u16, name_and_type_index: u16 },
    NameAndType { name_index: u16, descriptor_index: u16 },
    MethodHandle { reference_kind: u8, reference_index: u16 },
    MethodType { descriptor_index: u16 },
    InvokeDynamic { bootstrap_method_attr_index: u16, name_and_type_index: u16 },
    /// Second slot taken by a Long or Double.
    Unusable,
}

impl ConstantPoolEntry<'_> {
    pub fn tag(&self) -> u8 {
        match self {
            Self::Utf8(_) => 1,
            Self::Integer(_) => 3,
            Self::Float(_) => 4,
            Self::Long(_) => 5,
            Self::Double(_) => 6,
            Self::Class { .. } => 7,
            Self::String { .. } => 8,
            Self::FieldRef { .. } => 9,
            Self::MethodRef { .. } => 10,
            Self::InterfaceMethodRef { .. } => 11,
            Self::NameAndType { .. } => 12,
            Self::MethodHandle { .. } => 15,
            Self::MethodType { .. } => 16,
            Self::InvokeDynamic { .. } => 18,
            Self::Unusable => 0,
        }
    }
}

/// A parsed class file header and constant pool, borrowing the input.
#[derive(Debug)]
pub struct ClassFile<'a> {
    pub minor_version: u16,
    pub major_version: u16,
    entries: Vec<ConstantPoolEntry<'a>>,
    spans: Vec<Range<usize>>,
    pool_end: usize,
    bytes: &'a [u8],
}

impl<'a> ClassFile<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self> {
        let mut r = Reader { bytes, pos: 0 };
        let magic = r.u32()?;
        if magic != MAGIC {
            return Err(Error::malformed_class_file(0, format!("bad magic {magic:#010x}")));
        }
        let minor_version = r.u16()?;
        let major_version = r.u16()?;
        let count = r.u16()? as usize;

        let mut entries = Vec::with_capacity(count.saturating_sub(1));
        let mut spans = Vec::with_capacity(count.saturating_sub(1));
        let mut slot = 1;
        while slot < count {
            let start = r.pos;
            let tag = r.u8()?;
            let entry = match tag {
                1 => {
                    let len = r.u16()? as usize;
                    ConstantPoolEntry::Utf8(r.take(len)?)
                }
                3 => ConstantPoolEntry::Integer(r.u32()?),
                4 => ConstantPoolEntry::Float(r.u32()?),
                5 => ConstantPoolEntry::Long(r.u64()?),
                6 => ConstantPoolEntry::Double(r.u64()?),
                7 => ConstantPoolEntry::Class {
                    name_index: r.u16()?,
                },
                8 => ConstantPoolEntry::String {
                    string_index: r.u16()?,
                },
                9 => ConstantPoolEntry::FieldRef {
                    class_index: r.u16()?,
                    name_and_type_index: r.u16()?,
                },
                10 => ConstantPoolEntry::MethodRef {
                    class_index: r.u16()?,
                    name_and_type_index: r.u16()?,
                },
                11 => ConstantPoolEntry::InterfaceMethodRef {
                    class_index: r.u16()?,
                    name_and_type_index: r.u16()?,
                },
                12 => ConstantPoolEntry::NameAndType {
                    name_index: r.u16()?,
                    descriptor_index: r.u16()?,
                },
                15 => ConstantPoolEntry::MethodHandle {
                    reference_kind: r.u8()?,
                    reference_index: r.u16()?,
                },
                16 => ConstantPoolEntry::MethodType {
                    descriptor_index: r.u16()?,
                },
                18 => ConstantPoolEntry::InvokeDynamic {
                    bootstrap_method_attr_index: r.u16()?,
                    name_and_type_index: r.u16()?,
                },
                other => {
                    return Err(Error::malformed_class_file(
                        start,
                        format!("unknown constant pool tag {other} in slot {slot}"),
                    ));
                }
            };
            let wide = matches!(tag, 5 | 6);
            entries.push(entry);
            spans.push(start..r.pos);
            slot += 1;
            if wide {
                entries.push(ConstantPoolEntry::Unusable);
                spans.push(r.pos..r.pos);
                slot += 1;
            }
        }

        Ok(Self {
            minor_version,
            major_version,
            entries,
            spans,
            pool_end: r.pos,
            bytes,
        })
    }

    /// The `constant_pool_count` header field: number of slots plus one.
    pub fn constant_pool_count(&self) -> usize {
        self.entries.len() + 1
    }

    /// Entry at a 1-based slot.
    pub fn entry(&self, slot: usize) -> Option<&ConstantPoolEntry<'a>> {
        slot.checked_sub(1).and_then(|i| self.entries.get(i))
    }

    pub fn entries(&self) -> impl Iterator<Item = (usize, &ConstantPoolEntry<'a>)> {
        self.entries.iter().enumerate().map(|(i, e)| (i + 1, e))
    }

    /// Bytes after the constant pool.
    pub fn remainder(&self) -> &'a [u8] {
        &self.bytes[self.pool_end..]
    }

    /// One row per slot, for display.
    pub fn describe(&self) -> Vec<PoolRow> {
        self.entries()
            .filter(|(_, e)| !matches!(e, ConstantPoolEntry::Unusable))
            .map(|(slot, entry)| PoolRow {
                slot,
                tag: entry.tag(),
                value: describe_entry(entry),
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolRow {
    pub slot: usize,
    pub tag: u8,
    pub value: String,
}

fn describe_entry(entry: &ConstantPoolEntry<'_>) -> String {
    match entry {
        ConstantPoolEntry::Utf8(b) => match decode_modified_utf8(b) {
            Some(s) => format!("utf8 {s:?}"),
            None => format!("utf8 <{} undecodable bytes>", b.len()),
        },
        ConstantPoolEntry::Integer(v) => format!("int {}", *v as i32),
        ConstantPoolEntry::Float(v) => format!("float {}", f32::from_bits(*v)),
        ConstantPoolEntry::Long(v) => format!("long {}", *v as i64),
        ConstantPoolEntry::Double(v) => format!("double {}", f64::from_bits(*v)),
        ConstantPoolEntry::Class { name_index } => format!("class #{name_index}"),
        ConstantPoolEntry::String { string_index } => format!("string #{string_index}"),
        ConstantPoolEntry::FieldRef {
            class_index,
            name_and_type_index,
        } => format!("fieldref #{class_index}.#{name_and_type_index}"),
        ConstantPoolEntry::MethodRef {
            class_index,
            name_and_type_index,
        } => format!("methodref #{class_index}.#{name_and_type_index}"),
        ConstantPoolEntry::InterfaceMethodRef {
            class_index,
            name_and_type_index,
        } => format!("interfacemethodref #{class_index}.#{name_and_type_index}"),
        ConstantPoolEntry::NameAndType {
            name_index,
            descriptor_index,
        } => format!("nameandtype #{name_index}:#{descriptor_index}"),
        ConstantPoolEntry::MethodHandle {
            reference_kind,
            reference_index,
        } => format!("methodhandle {reference_kind}:#{reference_index}"),
        ConstantPoolEntry::MethodType { descriptor_index } => {
            format!("methodtype #{descriptor_index}")
        }
        ConstantPoolEntry::InvokeDynamic {
            bootstrap_method_attr_index,
            name_and_type_index,
        } => format!("invokedynamic #{bootstrap_method_attr_index}:#{name_and_type_index}"),
        ConstantPoolEntry::Unusable => String::new(),
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| {
                Error::malformed_class_file(self.pos, format!("truncated, wanted {n} bytes"))
            })?;
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(u64::from_be_bytes(buf))
    }
}

/// Rewrites UTF8 constants of class files. Holds no state, so one instance serves every
/// worker.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClassFileRewriter;

impl ClassFileRewriter {
    pub fn new() -> Self {
        Self
    }

    /// Returns the rewritten class file, or the original bytes when nothing matched or the
    /// file could not be rewritten safely.
    pub fn rewrite(&self, bytes: &[u8], map: &PlaceholderMap) -> Rewrite {
        if map.is_empty() {
            return Rewrite::unchanged(bytes);
        }
        let compiled = compile_modified_utf8(map);
        if !compiled.matches_any(bytes) {
            return Rewrite::unchanged(bytes);
        }

        match rewrite_pool(bytes, &compiled) {
            Ok(Some(rewrite)) => rewrite,
            Ok(None) => Rewrite::unchanged(bytes),
            Err(e) => {
                debug!(error = %e, "class file left unchanged");
                Rewrite::unchanged(bytes).with_warning(Warning::new("class", e.to_string()))
            }
        }
    }
}

fn rewrite_pool(bytes: &[u8], compiled: &CompiledMap) -> Result<Option<Rewrite>> {
    let class = ClassFile::parse(bytes)?;
    let mut out = Vec::with_capacity(bytes.len() + 64);
    out.extend_from_slice(&bytes[..HEADER_LEN]);

    let mut replacements = 0;
    let mut warnings = Vec::new();
    for ((slot, entry), span) in class.entries().zip(&class.spans) {
        let ConstantPoolEntry::Utf8(payload) = entry else {
            out.extend_from_slice(&bytes[span.clone()]);
            continue;
        };
        let (replaced, count) = compiled.apply(payload);
        if count == 0 {
            out.extend_from_slice(&bytes[span.clone()]);
            continue;
        }
        let Ok(len) = u16::try_from(replaced.len()) else {
            warnings.push(Warning::new(
                "class",
                format!(
                    "constant #{slot} would grow to {} bytes, over the 65535 limit; kept",
                    replaced.len()
                ),
            ));
            out.extend_from_slice(&bytes[span.clone()]);
            continue;
        };
        out.push(1);
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&replaced);
        replacements += count;
    }
    if replacements == 0 {
        return Ok(None);
    }
    out.extend_from_slice(class.remainder());

    let reparsed = ClassFile::parse(&out)?;
    if reparsed.constant_pool_count() != class.constant_pool_count() {
        return Err(Error::malformed_class_file(
            8,
            "constant pool count changed during rewrite",
        ));
    }

    Ok(Some(Rewrite {
        bytes: out,
        replacements,
        warnings,
    }))
}

fn compile_modified_utf8(map: &PlaceholderMap) -> CompiledMap {
    let pairs = map
        .ordered()
        .into_iter()
        .map(|(k, v)| (encode_modified_utf8(k), encode_modified_utf8(v)))
        .collect();
    CompiledMap::from_encoded(pairs, 1)
}

/// Encodes `text` as JVM modified UTF-8.
pub fn encode_modified_utf8(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len());
    for unit in text.encode_utf16() {
        let u = unit as u32;
        match u {
            0x0001..=0x007F => out.push(u as u8),
            0x0000 | 0x0080..=0x07FF => {
                out.push(0xC0 | (u >> 6) as u8);
                out.push(0x80 | (u & 0x3F) as u8);
            }
            _ => {
                out.push(0xE0 | (u >> 12) as u8);
                out.push(0x80 | ((u >> 6) & 0x3F) as u8);
                out.push(0x80 | (u & 0x3F) as u8);
            }
        }
    }
    out
}

/// Decodes JVM modified UTF-8; `None` for malformed input or unpaired surrogates.
pub fn decode_modified_utf8(bytes: &[u8]) -> Option<String> {
    let mut units = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        let cont = |j: usize| bytes.get(j).filter(|&&c| c & 0xC0 == 0x80).map(|&c| (c & 0x3F) as u16);
        match b {
            0x01..=0x7F => {
                units.push(b as u16);
                i += 1;
            }
            0xC0..=0xDF => {
                units.push(((b & 0x1F) as u16) << 6 | cont(i + 1)?);
                i += 2;
            }
            0xE0..=0xEF => {
                units.push(((b & 0x0F) as u16) << 12 | cont(i + 1)? << 6 | cont(i + 2)?);
                i += 3;
            }
            _ => return None,
        }
    }
    String::from_utf16(&units).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utf8(s: &str) -> Vec<u8> {
        let payload = encode_modified_utf8(s);
        let mut out = vec![1];
        out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        out.extend_from_slice(&payload);
        out
    }

    /// Minimal class: the given pool entries followed by an empty class body.
    fn class_bytes(entries: &[Vec<u8>], slots: u16) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&MAGIC.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&52u16.to_be_bytes());
        out.extend_from_slice(&(slots + 1).to_be_bytes());
        for e in entries {
            out.extend_from_slice(e);
        }
        // access flags, this, super, then empty interfaces/fields/methods/attributes
        out.extend_from_slice(&[0x00, 0x21, 0x00, 0x02, 0x00, 0x03]);
        out.extend_from_slice(&[0; 8]);
        out
    }

    fn sample() -> Vec<u8> {
        let long = {
            let mut e = vec![5];
            e.extend_from_slice(&42u64.to_be_bytes());
            e
        };
        class_bytes(
            &[
                utf8("demo/App"),
                vec![7, 0x00, 0x01],
                long,
                utf8("Version ${VERSION}"),
                vec![8, 0x00, 0x05],
            ],
            6,
        )
    }

    fn map(pairs: &[(&str, &str)]) -> PlaceholderMap {
        pairs.iter().copied().collect()
    }

    #[test]
    fn parse_keeps_slot_numbering_across_wide_entries() {
        let bytes = sample();
        let class = ClassFile::parse(&bytes).unwrap();
        assert_eq!(class.major_version, 52);
        assert_eq!(class.constant_pool_count(), 7);
        assert_eq!(class.entry(3), Some(&ConstantPoolEntry::Long(42)));
        assert_eq!(class.entry(4), Some(&ConstantPoolEntry::Unusable));
        assert_eq!(
            class.entry(6),
            Some(&ConstantPoolEntry::String { string_index: 5 })
        );
        assert_eq!(class.remainder().len(), 14);
    }

    #[test]
    fn no_matching_literal_round_trips_byte_identical() {
        let bytes = sample();
        let out = ClassFileRewriter::new().rewrite(&bytes, &map(&[("${MISSING}", "x")]));
        assert_eq!(out.bytes, bytes);
        assert_eq!(out.replacements, 0);
    }

    #[test]
    fn matching_literal_is_rewritten_with_intact_structure() {
        let bytes = sample();
        let out = ClassFileRewriter::new().rewrite(&bytes, &map(&[("${VERSION}", "1.2.3-rc1")]));
        assert_eq!(out.replacements, 1);
        assert_eq!(&out.bytes[..4], &MAGIC.to_be_bytes());

        let class = ClassFile::parse(&out.bytes).unwrap();
        assert_eq!(class.constant_pool_count(), 7);
        assert_eq!(
            class.entry(5),
            Some(&ConstantPoolEntry::Utf8(&b"Version 1.2.3-rc1"[..]))
        );
        assert_eq!(class.remainder(), ClassFile::parse(&bytes).unwrap().remainder());
    }

    #[test]
    fn unknown_tag_returns_original_with_warning() {
        let bytes = class_bytes(&[utf8("${VERSION}"), vec![19, 0x00, 0x01]], 2);
        let out = ClassFileRewriter::new().rewrite(&bytes, &map(&[("${VERSION}", "1")]));
        assert_eq!(out.bytes, bytes);
        assert_eq!(out.warnings.len(), 1);
        assert!(out.warnings[0].message.contains("unknown constant pool tag 19"));
    }

    #[test]
    fn truncated_pool_returns_original() {
        let mut long = vec![5];
        long.extend_from_slice(&7u64.to_be_bytes());
        let mut bytes = class_bytes(&[utf8("${VERSION}"), long], 3);
        bytes.truncate(28);
        let out = ClassFileRewriter::new().rewrite(&bytes, &map(&[("${VERSION}", "1")]));
        assert_eq!(out.bytes, bytes);
        assert!(!out.warnings.is_empty());
    }

    #[test]
    fn oversized_constant_is_kept() {
        let bytes = class_bytes(&[utf8("${BIG}"), utf8("${SMALL}")], 2);
        let huge = "x".repeat(70_000);
        let out = ClassFileRewriter::new()
            .rewrite(&bytes, &map(&[("${BIG}", huge.as_str()), ("${SMALL}", "s")]));
        let class = ClassFile::parse(&out.bytes).unwrap();
        assert_eq!(class.entry(1), Some(&ConstantPoolEntry::Utf8(&b"${BIG}"[..])));
        assert_eq!(class.entry(2), Some(&ConstantPoolEntry::Utf8(&b"s"[..])));
        assert_eq!(out.replacements, 1);
        assert_eq!(out.warnings.len(), 1);
    }

    #[test]
    fn modified_utf8_encodes_nul_and_supplementary_characters() {
        assert_eq!(encode_modified_utf8("a\0b"), vec![b'a', 0xC0, 0x80, b'b']);
        let emoji = encode_modified_utf8("\u{1F600}");
        assert_eq!(emoji.len(), 6);
        assert_eq!(decode_modified_utf8(&emoji).as_deref(), Some("\u{1F600}"));
        assert_eq!(decode_modified_utf8(&[0xC0, 0x80]).as_deref(), Some("\0"));
        assert_eq!(decode_modified_utf8(&[0x00]), None);
    }

    #[test]
    fn describe_lists_every_usable_slot() {
        let bytes = sample();
        let rows = ClassFile::parse(&bytes).unwrap().describe();
        let slots: Vec<usize> = rows.iter().map(|r| r.slot).collect();
        assert_eq!(slots, vec![1, 2, 3, 5, 6]);
        assert_eq!(rows[3].value, "utf8 \"Version ${VERSION}\"");
    }
}
