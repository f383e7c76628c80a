use std::io::Read;
use tar::{Archive, Builder, EntryType, Header, PaxExtensions};
use tracing::debug;

use super::{Job, Outcome, Repacked};
use crate::error::{Error, Result};
use crate::result::Warning;

/// One header block as read from the archive, extension records included.
struct Record {
    header: Header,
    data: Vec<u8>,
    job: Option<usize>,
}

/// Rewrites the regular file entries of a tar stream. Extension records (GNU long names, pax
/// headers) are copied as they are and name the entry that follows them.
pub(crate) fn rewrite_tar(
    bytes: &[u8],
    run: impl FnOnce(Vec<Job>) -> Vec<Outcome>,
) -> Result<Repacked> {
    let mut archive = Archive::new(bytes);
    let mut records = Vec::new();
    let mut jobs = Vec::new();
    let mut warnings = Vec::new();
    let mut long_name: Option<Vec<u8>> = None;
    let mut size_override = false;

    for entry in archive.entries().map_err(tar_error)?.raw(true) {
        let mut entry = entry.map_err(tar_error)?;
        let header = entry.header().clone();
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data).map_err(tar_error)?;

        let mut job = None;
        match header.entry_type() {
            EntryType::GNUSparse => {
                let name = String::from_utf8_lossy(&header.path_bytes()).into_owned();
                debug!(entry = %name, "sparse tar member, archive copied unchanged");
                return Ok(Repacked {
                    bytes: bytes.to_vec(),
                    entries: 0,
                    rewritten: 0,
                    warnings: vec![Warning::new(name, "sparse members are not rewritten")],
                });
            }
            EntryType::GNULongName => long_name = Some(trim_nul(&data).to_vec()),
            EntryType::XHeader => {
                for ext in PaxExtensions::new(&data).flatten() {
                    match ext.key() {
                        Ok("path") => long_name = Some(ext.value_bytes().to_vec()),
                        Ok("size") => size_override = true,
                        _ => {}
                    }
                }
            }
            EntryType::XGlobalHeader | EntryType::GNULongLink => {}
            kind => {
                let name = long_name
                    .take()
                    .unwrap_or_else(|| header.path_bytes().into_owned());
                let name = String::from_utf8_lossy(&name).into_owned();
                let is_file = matches!(kind, EntryType::Regular | EntryType::Continuous);
                if std::mem::take(&mut size_override) {
                    warnings.push(Warning::new(name, "pax size override, copied unchanged"));
                } else if is_file && !data.is_empty() {
                    job = Some(jobs.len());
                    jobs.push(Job {
                        name,
                        bytes: data.clone(),
                    });
                }
            }
        }
        records.push(Record { header, data, job });
    }

    let entries = jobs.len();
    let mut outcomes = run(jobs);
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

    let mut builder = Builder::new(Vec::with_capacity(bytes.len()));
    for mut record in records {
        let data = match record.job {
            Some(j) => match std::mem::replace(&mut outcomes[j], Outcome::Keep) {
                Outcome::Replace(new) => {
                    record.header.set_size(new.len() as u64);
                    record.header.set_cksum();
                    new
                }
                Outcome::Keep => record.data,
            },
            None => record.data,
        };
        builder.append(&record.header, &data[..]).map_err(tar_error)?;
    }
    let out = builder.into_inner().map_err(tar_error)?;

    Ok(Repacked {
        bytes: out,
        entries,
        rewritten,
        warnings,
    })
}

fn tar_error(e: std::io::Error) -> Error {
    Error::malformed_container("tar", e.to_string())
}

fn trim_nul(bytes: &[u8]) -> &[u8] {
    match bytes.iter().position(|&b| b == 0) {
        Some(end) => &bytes[..end],
        None => bytes,
    }
}
