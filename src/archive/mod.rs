//! Container detection and the entry-parallel rewrite of ZIP and TAR archives.

pub mod codec;
mod tar;
mod zip;

use std::sync::Arc;
use tracing::{debug, info, warn};

pub use codec::{Codec, Framing};

use crate::error::Result;
use crate::placeholder::PlaceholderMap;
use crate::pool::{TaskOutcome, WorkerPool};
use crate::result::{Rewrite, Warning};

pub const DEFAULT_MAX_DEPTH: usize = 10;

const ZIP_EXTENSIONS: &[&str] = &[
    "zip", "jar", "war", "ear", "aar", "apk", "xpi", "vsix", "nupkg", "snupkg",
];
const JAVA_EXTENSIONS: &[&str] = &["jar", "war", "ear", "aar"];
const TAR_SUFFIXES: &[(&str, Option<Codec>)] = &[
    (".tar.gz", Some(Codec::Gzip)),
    (".tgz", Some(Codec::Gzip)),
    (".tar.bz2", Some(Codec::Bzip2)),
    (".tbz2", Some(Codec::Bzip2)),
    (".tbz", Some(Codec::Bzip2)),
    (".tar.xz", Some(Codec::Xz)),
    (".txz", Some(Codec::Xz)),
    (".tar", None),
];
const SINGLE_SUFFIXES: &[(&str, Codec)] = &[
    (".gz", Codec::Gzip),
    (".bz2", Codec::Bzip2),
    (".xz", Codec::Xz),
    (".7z", Codec::SevenZip),
];
const USTAR_OFFSET: usize = 257;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// ZIP central-directory archive; `java` marks the JAR family.
    Zip { java: bool },
    Tar,
    /// One compressed payload with no entry structure of its own.
    Single,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerFormat {
    pub codec: Option<Codec>,
    pub layout: Layout,
}

impl ContainerFormat {
    /// Recognizes a container from its file name alone.
    pub fn from_name(name: &str) -> Option<Self> {
        let lower = file_name(name).to_ascii_lowercase();
        if let Some((_, codec)) = TAR_SUFFIXES.iter().find(|(s, _)| lower.ends_with(s)) {
            return Some(Self {
                codec: *codec,
                layout: Layout::Tar,
            });
        }
        if let Some((_, codec)) = SINGLE_SUFFIXES.iter().find(|(s, _)| lower.ends_with(s)) {
            return Some(Self {
                codec: Some(*codec),
                layout: Layout::Single,
            });
        }
        let (stem, ext) = lower.rsplit_once('.')?;
        if stem.is_empty() || !ZIP_EXTENSIONS.contains(&ext) {
            return None;
        }
        Some(Self {
            codec: None,
            layout: Layout::Zip {
                java: JAVA_EXTENSIONS.contains(&ext),
            },
        })
    }

    /// Recognizes a container from its leading bytes.
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        let single = |codec| {
            Some(Self {
                codec: Some(codec),
                layout: Layout::Single,
            })
        };
        if bytes.starts_with(b"PK\x03\x04") || bytes.starts_with(b"PK\x05\x06") {
            Some(Self {
                codec: None,
                layout: Layout::Zip { java: false },
            })
        } else if bytes.starts_with(b"\x1f\x8b") {
            single(Codec::Gzip)
        } else if bytes.starts_with(b"BZh") {
            single(Codec::Bzip2)
        } else if bytes.starts_with(b"\xfd7zXZ\x00") {
            single(Codec::Xz)
        } else if bytes.starts_with(b"7z\xbc\xaf\x27\x1c") {
            single(Codec::SevenZip)
        } else if Self::is_tar(bytes) {
            Some(Self {
                codec: None,
                layout: Layout::Tar,
            })
        } else {
            None
        }
    }

    /// Name first, content second.
    pub fn detect(name: &str, bytes: &[u8]) -> Option<Self> {
        Self::from_name(name).or_else(|| Self::sniff(bytes))
    }

    /// True when the POSIX `ustar` magic sits where a tar header keeps it.
    pub fn is_tar(bytes: &[u8]) -> bool {
        bytes
            .get(USTAR_OFFSET..USTAR_OFFSET + 5)
            .is_some_and(|magic| magic == b"ustar")
    }

    pub fn label(&self) -> String {
        let layout = match self.layout {
            Layout::Zip { java: true } => "jar",
            Layout::Zip { java: false } => "zip",
            Layout::Tar => "tar",
            Layout::Single => "",
        };
        match (layout, self.codec) {
            (layout, None) => layout.to_string(),
            ("", Some(codec)) => codec.to_string(),
            (layout, Some(codec)) => format!("{layout}+{codec}"),
        }
    }
}

fn file_name(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

/// Name under which the payload of a single compressed file is dispatched.
fn inner_name(name: &str, codec: Codec) -> String {
    let suffix = match codec {
        Codec::Gzip => ".gz",
        Codec::Bzip2 => ".bz2",
        Codec::Xz => ".xz",
        Codec::SevenZip => ".7z",
    };
    let lower = name.to_ascii_lowercase();
    if lower.ends_with(suffix) {
        name[..name.len() - suffix.len()].to_string()
    } else {
        name.to_string()
    }
}

/// A file entry read out of a container.
pub(crate) struct Job {
    pub name: String,
    pub bytes: Vec<u8>,
}

pub(crate) enum Outcome {
    Keep,
    Replace(Vec<u8>),
}

/// A reassembled container.
#[derive(Debug)]
pub(crate) struct Repacked {
    pub bytes: Vec<u8>,
    pub entries: usize,
    pub rewritten: usize,
    pub warnings: Vec<Warning>,
}

/// Result of rewriting one container.
#[derive(Debug, Clone, Default)]
pub struct ContainerRewrite {
    pub rewrite: Rewrite,
    /// File entries handed to the entry handler.
    pub entries: usize,
    pub entries_rewritten: usize,
}

/// Transforms one container entry. Implementations decide how to classify and dispatch it,
/// including recursing into nested containers at `depth + 1`.
pub trait EntryHandler: Send + Sync + 'static {
    fn handle_entry(
        self: &Arc<Self>,
        name: &str,
        bytes: &[u8],
        map: &Arc<PlaceholderMap>,
        depth: usize,
    ) -> Result<Rewrite>;
}

#[derive(Debug, Clone, Copy)]
pub struct ArchiveConfig {
    /// Recurse into containers found inside containers.
    pub nested: bool,
    pub max_depth: usize,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            nested: false,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

pub struct ArchiveProcessor {
    config: ArchiveConfig,
    pool: Arc<WorkerPool>,
}

impl ArchiveProcessor {
    pub fn new(config: ArchiveConfig, pool: Arc<WorkerPool>) -> Self {
        Self { config, pool }
    }

    pub fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    /// Whether a container found at `depth` should be opened.
    pub fn descends_into(&self, depth: usize) -> bool {
        depth == 0 || (self.config.nested && depth <= self.config.max_depth)
    }

    /// Rewrites the container `bytes` (named `name`, detected as `format`) found at `depth`.
    ///
    /// Unchanged containers come back byte-identical. Errors are returned only when the
    /// container structure or its compression stream cannot be read.
    pub fn process<H: EntryHandler>(
        &self,
        handler: &Arc<H>,
        bytes: &[u8],
        name: &str,
        format: ContainerFormat,
        map: &Arc<PlaceholderMap>,
        depth: usize,
    ) -> Result<ContainerRewrite> {
        debug!(name, format = %format.label(), depth, size = bytes.len(), "processing container");
        let Some(codec) = format.codec else {
            return self.process_layout(handler, bytes, name, format.layout, map, depth);
        };
        if !codec.is_supported() {
            warn!(name, %codec, "container framing is not rewritten");
            return Ok(ContainerRewrite {
                rewrite: Rewrite::unchanged(bytes).with_warning(Warning::new(
                    name,
                    format!("{codec} archives are passed through unchanged"),
                )),
                ..ContainerRewrite::default()
            });
        }

        let (payload, framing) = codec::unwrap(codec, bytes)?;
        let mut inner = match format.layout {
            Layout::Single => {
                let stem = inner_name(name, codec);
                match ContainerFormat::detect(&stem, &payload) {
                    Some(ContainerFormat { codec: None, layout }) if layout != Layout::Single => {
                        self.process_layout(handler, &payload, &stem, layout, map, depth)?
                    }
                    _ => {
                        let rewrite = handler.handle_entry(&stem, &payload, map, depth)?;
                        let changed = usize::from(rewrite.bytes != payload);
                        ContainerRewrite {
                            rewrite,
                            entries: 1,
                            entries_rewritten: changed,
                        }
                    }
                }
            }
            layout => self.process_layout(handler, &payload, name, layout, map, depth)?,
        };

        if inner.rewrite.bytes == payload {
            inner.rewrite.bytes = bytes.to_vec();
        } else {
            inner.rewrite.bytes = codec::wrap(codec, &inner.rewrite.bytes, &framing)?;
        }
        Ok(inner)
    }

    fn process_layout<H: EntryHandler>(
        &self,
        handler: &Arc<H>,
        bytes: &[u8],
        name: &str,
        layout: Layout,
        map: &Arc<PlaceholderMap>,
        depth: usize,
    ) -> Result<ContainerRewrite> {
        let mut replacements = 0;
        let mut entry_warnings = Vec::new();
        let run = |jobs: Vec<Job>| -> Vec<Outcome> {
            let outcomes = self.run_entries(handler, jobs, map, depth);
            outcomes
                .into_iter()
                .map(|(outcome, rewrite)| {
                    if let Some(rewrite) = rewrite {
                        replacements += rewrite.replacements;
                        entry_warnings.extend(rewrite.warnings);
                    }
                    outcome
                })
                .collect()
        };
        let repacked = match layout {
            Layout::Zip { java } => zip::rewrite_zip(bytes, java, run)?,
            Layout::Tar => tar::rewrite_tar(bytes, run)?,
            Layout::Single => {
                return Ok(ContainerRewrite {
                    rewrite: handler.handle_entry(name, bytes, map, depth)?,
                    entries: 1,
                    ..ContainerRewrite::default()
                });
            }
        };

        let mut warnings = repacked.warnings;
        warnings.append(&mut entry_warnings);
        if repacked.rewritten > 0 {
            info!(
                name,
                entries = repacked.entries,
                rewritten = repacked.rewritten,
                replacements,
                "container rewritten"
            );
        }
        Ok(ContainerRewrite {
            rewrite: Rewrite {
                bytes: repacked.bytes,
                replacements,
                warnings,
            },
            entries: repacked.entries,
            entries_rewritten: repacked.rewritten,
        })
    }

    /// Fans the jobs out over the pool. Each job yields an outcome for the container writer
    /// plus the entry's rewrite, when one was produced.
    fn run_entries<H: EntryHandler>(
        &self,
        handler: &Arc<H>,
        jobs: Vec<Job>,
        map: &Arc<PlaceholderMap>,
        depth: usize,
    ) -> Vec<(Outcome, Option<Rewrite>)> {
        let names: Vec<String> = jobs.iter().map(|job| job.name.clone()).collect();
        let originals: Vec<Arc<Vec<u8>>> = jobs.into_iter().map(|job| Arc::new(job.bytes)).collect();
        let work: Vec<(String, Arc<Vec<u8>>)> = names
            .iter()
            .cloned()
            .zip(originals.iter().cloned())
            .collect();

        let task_handler = Arc::clone(handler);
        let task_map = Arc::clone(map);
        let outcomes = self.pool.map_ordered(work, move |_, (name, bytes)| {
            task_handler.handle_entry(&name, &bytes, &task_map, depth)
        });

        outcomes
            .into_iter()
            .zip(names.iter().zip(&originals))
            .map(|(outcome, (name, original))| {
                let failure = match outcome {
                    TaskOutcome::Done(Ok(mut rewrite)) => {
                        let bytes = std::mem::take(&mut rewrite.bytes);
                        let outcome = if bytes == **original {
                            Outcome::Keep
                        } else {
                            Outcome::Replace(bytes)
                        };
                        rewrite.warnings = scoped(name, std::mem::take(&mut rewrite.warnings));
                        return (outcome, Some(rewrite));
                    }
                    TaskOutcome::Done(Err(e)) => e.to_string(),
                    other => other.failure().unwrap_or_default(),
                };
                warn!(entry = %name, %failure, "entry kept unchanged");
                let warning = Warning::new(name.as_str(), format!("kept unchanged: {failure}"));
                (Outcome::Keep, Some(Rewrite::default().with_warning(warning)))
            })
            .collect()
    }
}

/// Prefixes warnings raised inside an entry with the entry's name.
fn scoped(entry: &str, warnings: Vec<Warning>) -> Vec<Warning> {
    warnings
        .into_iter()
        .map(|w| {
            if w.scope == entry || w.scope.starts_with(&format!("{entry}!")) {
                w
            } else {
                Warning::new(format!("{entry}!{}", w.scope), w.message)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::pool::{PoolConfig, PoolSizing};
    use std::io::{Cursor, Read, Write};
    use std::time::Duration;

    /// Uppercases `.txt` entries, fails on `bad.txt`, panics on `boom.txt`.
    struct Upper;

    impl EntryHandler for Upper {
        fn handle_entry(
            self: &Arc<Self>,
            name: &str,
            bytes: &[u8],
            _map: &Arc<PlaceholderMap>,
            _depth: usize,
        ) -> Result<Rewrite> {
            match name {
                "bad.txt" => Err(Error::malformed_class_file(0, "broken")),
                "boom.txt" => panic!("handler crashed"),
                n if n.ends_with(".txt") => Ok(Rewrite {
                    bytes: bytes.to_ascii_uppercase(),
                    replacements: 1,
                    warnings: Vec::new(),
                }),
                _ => Ok(Rewrite::unchanged(bytes)),
            }
        }
    }

    fn processor() -> ArchiveProcessor {
        let pool = WorkerPool::new(PoolConfig {
            sizing: PoolSizing::Fixed(3),
            task_timeout: Duration::from_secs(10),
        })
        .unwrap();
        ArchiveProcessor::new(ArchiveConfig::default(), Arc::new(pool))
    }

    fn zip_of(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut zip = ::zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, data) in entries {
            zip.start_file(*name, ::zip::write::FileOptions::default())
                .unwrap();
            zip.write_all(data.as_bytes()).unwrap();
        }
        zip.finish().unwrap().into_inner()
    }

    fn zip_entries(bytes: &[u8]) -> Vec<(String, String)> {
        let mut archive = ::zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        (0..archive.len())
            .map(|i| {
                let mut file = archive.by_index(i).unwrap();
                let mut text = String::new();
                file.read_to_string(&mut text).unwrap();
                (file.name().to_string(), text)
            })
            .collect()
    }

    fn run(bytes: &[u8], name: &str) -> ContainerRewrite {
        let format = ContainerFormat::detect(name, bytes).unwrap();
        processor()
            .process(&Arc::new(Upper), bytes, name, format, &Arc::new(PlaceholderMap::new()), 0)
            .unwrap()
    }

    #[test]
    fn names_map_to_formats() {
        let tar_gz = ContainerFormat::from_name("dist/app.TAR.GZ").unwrap();
        assert_eq!(tar_gz.codec, Some(Codec::Gzip));
        assert_eq!(tar_gz.layout, Layout::Tar);
        assert_eq!(
            ContainerFormat::from_name("lib/core.jar").unwrap().layout,
            Layout::Zip { java: true }
        );
        assert_eq!(ContainerFormat::from_name("notes.txt.xz").unwrap().label(), "xz");
        assert_eq!(ContainerFormat::from_name("a.tbz2").unwrap().label(), "tar+bzip2");
        assert!(ContainerFormat::from_name("report.docx").is_none());
        assert!(ContainerFormat::from_name(".zip").is_none());
    }

    #[test]
    fn content_sniffing_recognizes_signatures() {
        assert_eq!(
            ContainerFormat::sniff(b"PK\x05\x06").unwrap().layout,
            Layout::Zip { java: false }
        );
        assert_eq!(ContainerFormat::sniff(b"BZh91AY").unwrap().codec, Some(Codec::Bzip2));
        let mut tar = vec![0u8; 512];
        tar[257..262].copy_from_slice(b"ustar");
        assert_eq!(ContainerFormat::sniff(&tar).unwrap().layout, Layout::Tar);
        assert!(ContainerFormat::sniff(b"plain text").is_none());
    }

    #[test]
    fn failing_entries_keep_their_bytes_and_the_rest_is_rewritten() {
        let original = zip_of(&[
            ("a.txt", "one"),
            ("bad.txt", "two"),
            ("boom.txt", "three"),
            ("keep.bin", "four"),
        ]);
        let out = run(&original, "bundle.zip");
        assert_eq!(
            zip_entries(&out.rewrite.bytes),
            vec![
                ("a.txt".to_string(), "ONE".to_string()),
                ("bad.txt".to_string(), "two".to_string()),
                ("boom.txt".to_string(), "three".to_string()),
                ("keep.bin".to_string(), "four".to_string()),
            ]
        );
        assert_eq!((out.entries, out.entries_rewritten), (4, 1));
        assert_eq!(out.rewrite.replacements, 1);
        let scopes: Vec<&str> = out.rewrite.warnings.iter().map(|w| w.scope.as_str()).collect();
        assert_eq!(scopes, ["bad.txt", "boom.txt"]);
    }

    #[test]
    fn compressed_tar_is_unwrapped_and_rewrapped() {
        let mut builder = ::tar::Builder::new(Vec::new());
        let mut header = ::tar::Header::new_gnu();
        header.set_size(5);
        header.set_mode(0o644);
        builder
            .append_data(&mut header, "conf/app.txt", &b"hello"[..])
            .unwrap();
        let tar = builder.into_inner().unwrap();
        let packed = codec::wrap(Codec::Gzip, &tar, &Framing::default()).unwrap();

        let out = run(&packed, "dist.tgz");
        let (unpacked, _) = codec::unwrap(Codec::Gzip, &out.rewrite.bytes).unwrap();
        let mut archive = ::tar::Archive::new(&unpacked[..]);
        let mut entry = archive.entries().unwrap().next().unwrap().unwrap();
        let mut text = String::new();
        entry.read_to_string(&mut text).unwrap();
        assert_eq!(text, "HELLO");
    }

    #[test]
    fn single_compressed_files_dispatch_their_payload_under_the_stem() {
        let packed = codec::wrap(Codec::Xz, b"quiet", &Framing::default()).unwrap();
        let out = run(&packed, "motd.txt.xz");
        let (unpacked, _) = codec::unwrap(Codec::Xz, &out.rewrite.bytes).unwrap();
        assert_eq!(unpacked, b"QUIET");

        let untouched = codec::wrap(Codec::Bzip2, b"data", &Framing::default()).unwrap();
        let out = run(&untouched, "blob.bin.bz2");
        assert_eq!(out.rewrite.bytes, untouched);
    }

    #[test]
    fn seven_zip_passes_through_with_a_warning() {
        let bytes = b"7z\xbc\xaf\x27\x1c\x00\x04rest";
        let out = run(bytes, "tools.7z");
        assert_eq!(out.rewrite.bytes, bytes);
        assert!(out.rewrite.warnings[0].message.contains("7z"));
    }

    #[test]
    fn depth_guard_follows_the_nested_toggle() {
        let pool = Arc::new(WorkerPool::new(PoolConfig::default()).unwrap());
        let flat = ArchiveProcessor::new(ArchiveConfig::default(), Arc::clone(&pool));
        assert!(flat.descends_into(0));
        assert!(!flat.descends_into(1));
        let nested = ArchiveProcessor::new(
            ArchiveConfig {
                nested: true,
                max_depth: 2,
            },
            pool,
        );
        assert!(nested.descends_into(2));
        assert!(!nested.descends_into(3));
    }

    #[test]
    fn scoped_warnings_name_the_entry_once() {
        let warnings = scoped(
            "lib/a.jar",
            vec![Warning::new("x.class", "m"), Warning::new("lib/a.jar", "n")],
        );
        assert_eq!(warnings[0].scope, "lib/a.jar!x.class");
        assert_eq!(warnings[1].scope, "lib/a.jar");
    }
}
