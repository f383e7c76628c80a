//! Decides how a payload should be handled from its name and its leading bytes.

use serde::Serialize;
use tracing::trace;

use crate::archive::ContainerFormat;
use crate::cache::{BoundedCache, CacheConfig, CacheStats};
use crate::charset::Charset;

const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "json", "xml", "html", "htm", "css", "js", "ts", "java", "kt", "groovy", "gradle",
    "py", "rb", "yaml", "yml", "toml", "ini", "cfg", "conf", "config", "properties", "md", "mf",
    "sql", "sh", "bat", "cmd", "csv", "svg", "tpl",
];
const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp", "tiff", "webp"];
const DOCUMENT_EXTENSIONS: &[&str] = &[
    "pdf", "doc", "docx", "xls", "xlsx", "ppt", "pptx", "odt", "ods", "odp",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MagicKind {
    Binary,
    Container,
    Image,
    Document,
}

const MAGIC_TABLE: &[(&[u8], MagicKind)] = &[
    (b"\x7fELF", MagicKind::Binary),
    (b"MZ", MagicKind::Binary),
    (b"\xfe\xed\xfa\xce", MagicKind::Binary),
    (b"\xfe\xed\xfa\xcf", MagicKind::Binary),
    (b"\xce\xfa\xed\xfe", MagicKind::Binary),
    (b"\xcf\xfa\xed\xfe", MagicKind::Binary),
    (b"\xca\xfe\xba\xbe", MagicKind::Binary),
    (b"\0asm", MagicKind::Binary),
    (b"PK\x03\x04", MagicKind::Container),
    (b"PK\x05\x06", MagicKind::Container),
    (b"\x1f\x8b", MagicKind::Container),
    (b"BZh", MagicKind::Container),
    (b"\xfd7zXZ\x00", MagicKind::Container),
    (b"7z\xbc\xaf\x27\x1c", MagicKind::Container),
    (b"\x89PNG\r\n\x1a\n", MagicKind::Image),
    (b"\xff\xd8\xff", MagicKind::Image),
    (b"GIF87a", MagicKind::Image),
    (b"GIF89a", MagicKind::Image),
    (b"%PDF-", MagicKind::Document),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Text,
    Binary,
    ClassFile,
    Container,
    Image,
    Document,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub kind: ContentKind,
    /// Encoding of text payloads.
    pub charset: Option<Charset>,
}

impl Classification {
    fn of(kind: ContentKind) -> Self {
        Self {
            kind,
            charset: None,
        }
    }

    fn text(charset: Charset) -> Self {
        Self {
            kind: ContentKind::Text,
            charset: Some(charset),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ClassifierConfig {
    pub sample_size: usize,
    /// Highest share of control bytes a text sample may contain.
    pub max_control_ratio: f64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            sample_size: 512,
            max_control_ratio: 0.10,
        }
    }
}

pub struct ContentClassifier {
    config: ClassifierConfig,
    cache: BoundedCache<(String, u64), Classification>,
}

impl ContentClassifier {
    pub fn new(config: ClassifierConfig, cache: CacheConfig) -> Self {
        Self {
            config,
            cache: BoundedCache::new(cache),
        }
    }

    /// Classifies `bytes`, using `name` as the primary hint. Results are cached per
    /// (name, length).
    pub fn classify(&self, name: &str, bytes: &[u8]) -> Classification {
        let key = (name.to_string(), bytes.len() as u64);
        self.cache.get_or_insert_with(key, || {
            let classification = self.classify_uncached(name, bytes);
            trace!(name, kind = ?classification.kind, "classified");
            classification
        })
    }

    fn classify_uncached(&self, name: &str, bytes: &[u8]) -> Classification {
        let ext = extension(name);
        if ext == "class" {
            return Classification::of(ContentKind::ClassFile);
        }
        if ContainerFormat::from_name(name).is_some() {
            return Classification::of(ContentKind::Container);
        }
        if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            return Classification::of(ContentKind::Image);
        }
        if DOCUMENT_EXTENSIONS.contains(&ext.as_str()) {
            return Classification::of(ContentKind::Document);
        }
        if TEXT_EXTENSIONS.contains(&ext.as_str()) {
            return Classification::text(bom_charset(bytes).unwrap_or_default());
        }
        self.sniff(bytes)
    }

    /// Content-only classification.
    pub fn sniff(&self, bytes: &[u8]) -> Classification {
        if bytes.is_empty() {
            return Classification::text(Charset::utf8());
        }
        if let Some(charset) = bom_charset(bytes) {
            return Classification::text(charset);
        }
        if let Some((_, kind)) = MAGIC_TABLE.iter().find(|(magic, _)| bytes.starts_with(magic)) {
            return Classification::of(match kind {
                MagicKind::Binary => ContentKind::Binary,
                MagicKind::Container => ContentKind::Container,
                MagicKind::Image => ContentKind::Image,
                MagicKind::Document => ContentKind::Document,
            });
        }
        if ContainerFormat::is_tar(bytes) {
            return Classification::of(ContentKind::Container);
        }
        if bytes.contains(&0) {
            return Classification::of(ContentKind::Binary);
        }

        let sample = &bytes[..bytes.len().min(self.config.sample_size)];
        let controls = sample.iter().filter(|&&b| is_control(b)).count();
        if controls as f64 / sample.len() as f64 > self.config.max_control_ratio {
            return Classification::of(ContentKind::Binary);
        }
        match std::str::from_utf8(sample) {
            Ok(_) => Classification::text(Charset::utf8()),
            // a multi-byte character cut off by the sample boundary
            Err(e) if e.error_len().is_none() && sample.len() < bytes.len() => {
                Classification::text(Charset::utf8())
            }
            Err(_) => Classification::of(ContentKind::Binary),
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

impl Default for ContentClassifier {
    fn default() -> Self {
        Self::new(ClassifierConfig::default(), CacheConfig::default())
    }
}

fn extension(name: &str) -> String {
    let file = name.rsplit('/').next().unwrap_or(name);
    match file.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => ext.to_ascii_lowercase(),
        _ => String::new(),
    }
}

fn bom_charset(bytes: &[u8]) -> Option<Charset> {
    if bytes.starts_with(b"\xef\xbb\xbf") {
        Some(Charset::utf8())
    } else if bytes.starts_with(b"\xff\xfe") {
        Some(Charset::utf16le())
    } else if bytes.starts_with(b"\xfe\xff") {
        Some(Charset::utf16be())
    } else {
        None
    }
}

fn is_control(b: u8) -> bool {
    b < 0x20 && !matches!(b, b'\t' | b'\n' | b'\r' | 0x0c | 0x1b)
}
