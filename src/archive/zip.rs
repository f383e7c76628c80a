use std::io::{Cursor, Read, Write};
use tracing::{debug, warn};
use zip::result::ZipError;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use super::{Job, Outcome, Repacked};
use crate::error::{Error, Result};
use crate::result::Warning;

const ZIP64_EXTRA_ID: u16 = 0x0001;
const CENTRAL_HEADER_SIG: u32 = 0x0201_4b50;
const END_OF_CENTRAL_SIG: u32 = 0x0605_4b50;
const ZIP64_LOCATOR_SIG: u32 = 0x0706_4b50;
const CENTRAL_HEADER_LEN: usize = 46;
const END_OF_CENTRAL_LEN: usize = 22;
const UTF8_FLAG: u16 = 1 << 11;

enum Slot {
    /// Copied with its compressed bytes untouched.
    Raw,
    Job(usize),
}

/// Rewrites the entries of a ZIP-family archive. `run` receives every non-empty file entry and
/// returns one outcome per job, in job order.
pub(crate) fn rewrite_zip(
    bytes: &[u8],
    java: bool,
    run: impl FnOnce(Vec<Job>) -> Vec<Outcome>,
) -> Result<Repacked> {
    let mut archive = ZipArchive::new(Cursor::new(bytes)).map_err(zip_error)?;
    let mut warnings = Vec::new();
    let mut slots = Vec::with_capacity(archive.len());
    let mut jobs = Vec::new();
    let mut signed = false;

    for i in 0..archive.len() {
        let name = archive.by_index_raw(i).map_err(zip_error)?.name().to_string();
        signed |= is_signature_file(&name);
        let mut file = match archive.by_index(i) {
            Ok(file) => file,
            Err(ZipError::UnsupportedArchive(reason)) => {
                warnings.push(Warning::new(name, format!("copied unread: {reason}")));
                slots.push(Slot::Raw);
                continue;
            }
            Err(e) => return Err(zip_error(e)),
        };
        if file.is_dir() || file.size() == 0 {
            slots.push(Slot::Raw);
            continue;
        }
        let mut data = Vec::with_capacity(file.size() as usize);
        if let Err(e) = file.read_to_end(&mut data) {
            warn!(entry = %name, error = %e, "zip entry unreadable, copying raw");
            warnings.push(Warning::new(name, format!("copied unread: {e}")));
            slots.push(Slot::Raw);
            continue;
        }
        slots.push(Slot::Job(jobs.len()));
        jobs.push(Job { name, bytes: data });
    }

    let entries = jobs.len();
    let outcomes = run(jobs);
    let rewritten = outcomes
        .iter()
        .filter(|o| matches!(o, Outcome::Replace(_)))
        .count();
    if rewritten == 0 {
        return Ok(Repacked {
            bytes: bytes.to_vec(),
            entries,
            rewritten,
            warnings,
        });
    }
    if java && signed {
        warnings.push(Warning::new(
            "META-INF",
            "archive is signed; rewritten entries invalidate the signature",
        ));
    }

    let mut comments = Vec::with_capacity(slots.len());
    let mut writer = ZipWriter::new(Cursor::new(Vec::with_capacity(bytes.len())));
    for (i, slot) in slots.iter().enumerate() {
        let replacement = match slot {
            Slot::Job(j) => match &outcomes[*j] {
                Outcome::Replace(data) => Some(data),
                Outcome::Keep => None,
            },
            Slot::Raw => None,
        };
        let source = archive.by_index_raw(i).map_err(zip_error)?;
        comments.push(source.comment().as_bytes().to_vec());
        let Some(data) = replacement else {
            writer.raw_copy_file(source).map_err(zip_error)?;
            continue;
        };

        let method = match source.compression() {
            CompressionMethod::Stored if data.len() as u64 == source.size() => {
                CompressionMethod::Stored
            }
            _ => CompressionMethod::Deflated,
        };
        let mut options = FileOptions::default()
            .compression_method(method)
            .last_modified_time(source.last_modified())
            .large_file(data.len() as u64 >= u32::MAX as u64);
        if let Some(mode) = source.unix_mode() {
            options = options.unix_permissions(mode);
        }
        let name = source.name().to_string();
        let extra = sanitize_extra(source.extra_data());
        drop(source);

        if extra.is_empty() {
            writer.start_file(name, options).map_err(zip_error)?;
        } else {
            writer
                .start_file_with_extra_data(name, options)
                .map_err(zip_error)?;
            writer.write_all(&extra)?;
            writer.end_extra_data().map_err(zip_error)?;
        }
        writer.write_all(data)?;
    }
    writer.set_raw_comment(archive.comment().to_vec());
    let mut out = writer.finish().map_err(zip_error)?.into_inner();

    if comments.iter().any(|c| !c.is_empty()) {
        match restore_comments(&out, &comments) {
            Some(patched) => out = patched,
            None => {
                debug!("central directory not patchable, entry comments dropped");
                warnings.push(Warning::new("zip", "entry comments could not be kept"));
            }
        }
    }

    Ok(Repacked {
        bytes: out,
        entries,
        rewritten,
        warnings,
    })
}

fn zip_error(e: ZipError) -> Error {
    match e {
        ZipError::Io(io) => Error::Io(io),
        other => Error::malformed_container("zip", other.to_string()),
    }
}

/// Writes entry comments into a central directory whose comments are all empty, as the
/// writer leaves them. `comments` is in central directory order. ZIP64 directories are not
/// patched.
fn restore_comments(bytes: &[u8], comments: &[Vec<u8>]) -> Option<Vec<u8>> {
    let eocd = find_end_of_central(bytes)?;
    if eocd >= 20 && le_u32(bytes, eocd - 20)? == ZIP64_LOCATOR_SIG {
        return None;
    }
    let count = le_u16(bytes, eocd + 10)? as usize;
    let cd_size = le_u32(bytes, eocd + 12)? as usize;
    let cd_offset = le_u32(bytes, eocd + 16)? as usize;
    if count != comments.len() || cd_offset + cd_size != eocd {
        return None;
    }

    let extra: usize = comments.iter().map(Vec::len).sum();
    let mut out = Vec::with_capacity(bytes.len() + extra);
    out.extend_from_slice(&bytes[..cd_offset]);
    let mut pos = cd_offset;
    for comment in comments {
        if le_u32(bytes, pos)? != CENTRAL_HEADER_SIG {
            return None;
        }
        let name_len = le_u16(bytes, pos + 28)? as usize;
        let extra_len = le_u16(bytes, pos + 30)? as usize;
        let old_len = le_u16(bytes, pos + 32)? as usize;
        let end = pos + CENTRAL_HEADER_LEN + name_len + extra_len;
        let start = out.len();
        out.extend_from_slice(bytes.get(pos..end)?);
        if comment.is_empty() {
            out.extend_from_slice(bytes.get(end..end + old_len)?);
        } else {
            let len = u16::try_from(comment.len()).ok()?;
            out[start + 32..start + 34].copy_from_slice(&len.to_le_bytes());
            if !comment.is_ascii() {
                let flags = u16::from_le_bytes([out[start + 8], out[start + 9]]) | UTF8_FLAG;
                out[start + 8..start + 10].copy_from_slice(&flags.to_le_bytes());
            }
            out.extend_from_slice(comment);
        }
        pos = end + old_len;
    }
    if pos != eocd {
        return None;
    }

    let new_size = u32::try_from(out.len() - cd_offset).ok()?;
    let tail = out.len();
    out.extend_from_slice(&bytes[eocd..]);
    out[tail + 12..tail + 16].copy_from_slice(&new_size.to_le_bytes());
    Some(out)
}

fn find_end_of_central(bytes: &[u8]) -> Option<usize> {
    let last = bytes.len().checked_sub(END_OF_CENTRAL_LEN)?;
    let first = last.saturating_sub(u16::MAX as usize);
    (first..=last).rev().find(|&pos| {
        le_u32(bytes, pos) == Some(END_OF_CENTRAL_SIG)
            && le_u16(bytes, pos + 20)
                .is_some_and(|len| pos + END_OF_CENTRAL_LEN + len as usize == bytes.len())
    })
}

fn le_u16(bytes: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_le_bytes(bytes.get(at..at + 2)?.try_into().ok()?))
}

fn le_u32(bytes: &[u8], at: usize) -> Option<u32> {
    Some(u32::from_le_bytes(bytes.get(at..at + 4)?.try_into().ok()?))
}

fn is_signature_file(name: &str) -> bool {
    let upper = name.to_ascii_uppercase();
    upper.starts_with("META-INF/")
        && [".SF", ".RSA", ".DSA", ".EC"]
            .iter()
            .any(|ext| upper.ends_with(ext))
}

/// Keeps the well-formed extra blocks that the writer accepts. The writer emits its own
/// ZIP64 block when needed.
fn sanitize_extra(extra: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(extra.len());
    let mut rest = extra;
    while rest.len() >= 4 {
        let id = u16::from_le_bytes([rest[0], rest[1]]);
        let size = u16::from_le_bytes([rest[2], rest[3]]) as usize;
        if rest.len() < 4 + size {
            break;
        }
        if id != ZIP64_EXTRA_ID {
            out.extend_from_slice(&rest[..4 + size]);
        }
        rest = &rest[4 + size..];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(entries: &[(&str, &[u8], CompressionMethod)]) -> Vec<u8> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, data, method) in entries {
            let options = FileOptions::default().compression_method(*method);
            if name.ends_with('/') {
                zip.add_directory(*name, options).unwrap();
            } else {
                zip.start_file(*name, options).unwrap();
                zip.write_all(data).unwrap();
            }
        }
        zip.set_comment("archive comment");
        zip.finish().unwrap().into_inner()
    }

    fn read(bytes: &[u8]) -> Vec<(String, Vec<u8>, CompressionMethod)> {
        let mut archive = ZipArchive::new(Cursor::new(bytes)).unwrap();
        (0..archive.len())
            .map(|i| {
                let mut file = archive.by_index(i).unwrap();
                let mut data = Vec::new();
                file.read_to_end(&mut data).unwrap();
                (file.name().to_string(), data, file.compression())
            })
            .collect()
    }

    fn upper(jobs: Vec<Job>) -> Vec<Outcome> {
        jobs.into_iter()
            .map(|job| {
                if job.name.ends_with(".txt") {
                    Outcome::Replace(job.bytes.to_ascii_uppercase())
                } else {
                    Outcome::Keep
                }
            })
            .collect()
    }

    #[test]
    fn unchanged_archive_is_returned_byte_identical() {
        let original = build(&[
            ("docs/", b"", CompressionMethod::Stored),
            ("docs/a.txt", b"hello", CompressionMethod::Deflated),
        ]);
        let out = rewrite_zip(&original, false, |jobs| {
            jobs.iter().map(|_| Outcome::Keep).collect()
        })
        .unwrap();
        assert_eq!(out.bytes, original);
        assert_eq!(out.entries, 1);
        assert_eq!(out.rewritten, 0);
    }

    #[test]
    fn rewritten_entries_keep_order_and_untouched_entries_survive() {
        let original = build(&[
            ("a.txt", b"first", CompressionMethod::Deflated),
            ("b/", b"", CompressionMethod::Stored),
            ("b/raw.bin", b"\x00\x01", CompressionMethod::Stored),
            ("b/c.txt", b"second", CompressionMethod::Stored),
        ]);
        let out = rewrite_zip(&original, false, upper).unwrap();
        let entries = read(&out.bytes);
        let names: Vec<&str> = entries.iter().map(|(n, _, _)| n.as_str()).collect();
        assert_eq!(names, ["a.txt", "b/", "b/raw.bin", "b/c.txt"]);
        assert_eq!(entries[0].1, b"FIRST");
        assert_eq!(entries[2].1, b"\x00\x01");
        assert_eq!(entries[3].1, b"SECOND");
        assert_eq!(out.rewritten, 2);

        let archive = ZipArchive::new(Cursor::new(&out.bytes[..])).unwrap();
        assert_eq!(archive.comment(), b"archive comment");
    }

    #[test]
    fn stored_entries_switch_to_deflate_only_when_length_changes() {
        let original = build(&[
            ("same.txt", b"abc", CompressionMethod::Stored),
            ("grow.txt", b"abc", CompressionMethod::Stored),
        ]);
        let out = rewrite_zip(&original, false, |jobs| {
            jobs.into_iter()
                .map(|job| match job.name.as_str() {
                    "same.txt" => Outcome::Replace(b"xyz".to_vec()),
                    _ => Outcome::Replace(b"abcdef".to_vec()),
                })
                .collect()
        })
        .unwrap();
        let entries = read(&out.bytes);
        assert_eq!(entries[0].2, CompressionMethod::Stored);
        assert_eq!(entries[0].1, b"xyz");
        assert_eq!(entries[1].2, CompressionMethod::Deflated);
        assert_eq!(entries[1].1, b"abcdef");
    }

    #[test]
    fn signed_jars_warn_when_rewritten() {
        let original = build(&[
            ("META-INF/MANIFEST.MF", b"Manifest-Version: 1.0\n", CompressionMethod::Deflated),
            ("META-INF/CERT.SF", b"sig", CompressionMethod::Deflated),
            ("app.txt", b"v", CompressionMethod::Deflated),
        ]);
        let out = rewrite_zip(&original, true, upper).unwrap();
        assert!(out.warnings.iter().any(|w| w.message.contains("signed")));
    }

    #[test]
    fn garbage_is_a_malformed_container() {
        let err = rewrite_zip(b"PK\x03\x04 not really", false, upper).unwrap_err();
        assert!(matches!(err, Error::MalformedContainer { format: "zip", .. }));
    }

    fn entry_comments(bytes: &[u8]) -> Vec<String> {
        let mut archive = ZipArchive::new(Cursor::new(bytes)).unwrap();
        (0..archive.len())
            .map(|i| archive.by_index_raw(i).unwrap().comment().to_string())
            .collect()
    }

    #[test]
    fn entry_comments_survive_a_rewrite() {
        let plain = build(&[
            ("a.txt", b"first", CompressionMethod::Deflated),
            ("raw.bin", b"\x00\x01", CompressionMethod::Stored),
            ("b.txt", b"second", CompressionMethod::Deflated),
        ]);
        let comments = vec![b"keep-me".to_vec(), b"binary".to_vec(), Vec::new()];
        let original = restore_comments(&plain, &comments).unwrap();
        assert_eq!(entry_comments(&original), ["keep-me", "binary", ""]);

        let out = rewrite_zip(&original, false, upper).unwrap();
        assert_eq!(out.rewritten, 2);
        assert!(out.warnings.is_empty());
        assert_eq!(entry_comments(&out.bytes), ["keep-me", "binary", ""]);
        let entries = read(&out.bytes);
        assert_eq!(entries[0].1, b"FIRST");
        assert_eq!(entries[2].1, b"SECOND");

        let archive = ZipArchive::new(Cursor::new(&out.bytes[..])).unwrap();
        assert_eq!(archive.comment(), b"archive comment");
    }

    #[test]
    fn non_ascii_comments_are_flagged_as_utf8() {
        let plain = build(&[("a.txt", b"x", CompressionMethod::Deflated)]);
        let patched = restore_comments(&plain, &["r\u{e9}sum\u{e9}".as_bytes().to_vec()]).unwrap();
        assert_eq!(entry_comments(&patched), ["r\u{e9}sum\u{e9}"]);
        assert!(restore_comments(&plain, &[]).is_none());
    }

    #[test]
    fn extra_data_drops_zip64_and_truncated_blocks() {
        let mut extra = vec![0x01, 0x00, 0x04, 0x00, 1, 2, 3, 4];
        extra.extend_from_slice(&[0x55, 0x54, 0x01, 0x00, 7]);
        extra.extend_from_slice(&[0x75, 0x78, 0x09]);
        assert_eq!(sanitize_extra(&extra), vec![0x55, 0x54, 0x01, 0x00, 7]);
    }
}
