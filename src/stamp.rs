//! Classifies a payload and routes it to the matching transformer.

use serde::Serialize;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::archive::{ArchiveConfig, ArchiveProcessor, ContainerFormat, ContainerRewrite, EntryHandler};
use crate::cache::{BoundedCache, CacheConfig, CacheKey, CacheStats};
use crate::charset::Charset;
use crate::classfile::ClassFileRewriter;
use crate::classify::{Classification, ClassifierConfig, ContentClassifier, ContentKind};
use crate::error::{Error, Result};
use crate::placeholder::PlaceholderMap;
use crate::pool::{PoolConfig, WorkerPool};
use crate::result::{MetricsSnapshot, ProcessingResult, Rewrite, Warning};
use crate::text::{TextConfig, TextEngine};

const CLASS_FILE_ENCODING: &str = "modified-utf-8";

/// An external transformer for payloads the core does not rewrite itself, such as office
/// documents or image metadata.
pub trait Collaborator: Send + Sync {
    fn name(&self) -> &str;

    fn accepts(&self, name: &str, kind: ContentKind) -> bool;

    fn process(&self, bytes: &[u8], name: &str, map: &PlaceholderMap) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone, Default)]
pub struct StampConfig {
    pub pool: PoolConfig,
    pub text: TextConfig,
    pub archive: ArchiveConfig,
    pub cache: CacheConfig,
    pub classifier: ClassifierConfig,
    /// Forces the charset of every text payload instead of trusting the classifier.
    pub charset: Option<Charset>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct StampStats {
    pub text: MetricsSnapshot,
    pub text_cache: CacheStats,
    pub class_cache: CacheStats,
    pub classification_cache: CacheStats,
    pub threads: usize,
}

#[derive(Clone)]
pub struct Stamper {
    inner: Arc<Pipeline>,
}

struct Pipeline {
    config: StampConfig,
    pool: Arc<WorkerPool>,
    text: TextEngine,
    classes: ClassFileRewriter,
    classifier: ContentClassifier,
    archives: ArchiveProcessor,
    text_cache: BoundedCache<CacheKey, Arc<Rewrite>>,
    class_cache: BoundedCache<CacheKey, Arc<Rewrite>>,
    collaborators: Vec<Arc<dyn Collaborator>>,
}

impl Stamper {
    pub fn new(config: StampConfig) -> Result<Self> {
        Self::with_collaborators(config, Vec::new())
    }

    pub fn with_collaborators(
        config: StampConfig,
        collaborators: Vec<Arc<dyn Collaborator>>,
    ) -> Result<Self> {
        let pool = Arc::new(WorkerPool::new(config.pool)?);
        let pipeline = Pipeline {
            text: TextEngine::new(config.text, Arc::clone(&pool)),
            classes: ClassFileRewriter::new(),
            classifier: ContentClassifier::new(config.classifier, config.cache),
            archives: ArchiveProcessor::new(config.archive, Arc::clone(&pool)),
            text_cache: BoundedCache::new(config.cache),
            class_cache: BoundedCache::new(config.cache),
            collaborators,
            pool,
            config,
        };
        debug!(
            threads = pipeline.pool.threads(),
            nested = pipeline.config.archive.nested,
            max_depth = pipeline.config.archive.max_depth,
            collaborators = pipeline.collaborators.len(),
            "stamper ready"
        );
        Ok(Self {
            inner: Arc::new(pipeline),
        })
    }

    pub fn config(&self) -> &StampConfig {
        &self.inner.config
    }

    /// Rewrites `bytes`, using `name` as the file name hint.
    ///
    /// Containers are rewritten entry by entry; class files, text and collaborator payloads
    /// are rewritten directly; anything else comes back unchanged. Only an invalid
    /// placeholder map, an unreadable container structure or a broken compression stream
    /// fail the call.
    pub fn process(
        &self,
        bytes: &[u8],
        name: &str,
        map: &PlaceholderMap,
    ) -> Result<(Vec<u8>, ProcessingResult)> {
        let started = Instant::now();
        let (map, mut warnings) = checked(map)?;
        let mut result = ProcessingResult::new(bytes.len() as u64, 0, map.len());

        let out = if map.is_empty() {
            debug!(name, "no placeholders, payload returned unchanged");
            ContainerRewrite {
                rewrite: Rewrite::unchanged(bytes),
                ..ContainerRewrite::default()
            }
        } else {
            self.inner.dispatch(name, bytes, &map, 0)?
        };

        warnings.extend(out.rewrite.warnings);
        result.replacement_count = out.rewrite.replacements;
        result.entries_processed = out.entries;
        result.entries_rewritten = out.entries_rewritten;
        result.warnings = warnings;
        result.elapsed = started.elapsed();
        info!(
            name,
            bytes = result.bytes_processed,
            replacements = result.replacement_count,
            entries = result.entries_processed,
            warnings = result.warnings.len(),
            elapsed_ms = result.elapsed.as_millis() as u64,
            "stamped"
        );
        Ok((out.rewrite.bytes, result))
    }

    /// Streams a text payload from `reader` to `writer` without holding it in memory.
    pub fn process_stream<R: Read, W: Write>(
        &self,
        reader: R,
        writer: W,
        map: &PlaceholderMap,
    ) -> Result<ProcessingResult> {
        let (map, mut warnings) = checked(map)?;
        let charset = self.inner.config.charset.unwrap_or_default();
        let mut result = self
            .inner
            .text
            .substitute_stream(reader, writer, &map, charset)?;
        warnings.append(&mut result.warnings);
        result.warnings = warnings;
        Ok(result)
    }

    pub fn classify(&self, name: &str, bytes: &[u8]) -> Classification {
        self.inner.classifier.classify(name, bytes)
    }

    pub fn stats(&self) -> StampStats {
        StampStats {
            text: self.inner.text.metrics(),
            text_cache: self.inner.text_cache.stats(),
            class_cache: self.inner.class_cache.stats(),
            classification_cache: self.inner.classifier.cache_stats(),
            threads: self.inner.pool.threads(),
        }
    }

    pub fn reset_metrics(&self) {
        self.inner.text.reset_metrics();
    }
}

/// Rejects maps with validation errors; validation warnings are carried into the report.
fn checked(map: &PlaceholderMap) -> Result<(Arc<PlaceholderMap>, Vec<Warning>)> {
    let report = map.validate();
    if !report.is_valid() {
        return Err(Error::InvalidPlaceholders(report.errors.join("; ")));
    }
    let warnings = report
        .warnings
        .into_iter()
        .map(|w| Warning::new("placeholders", w))
        .collect();
    Ok((Arc::new(map.clone()), warnings))
}

impl Pipeline {
    /// Routes one payload living at `depth` (0 for the caller's input, one more per enclosing
    /// container).
    fn dispatch(
        self: &Arc<Self>,
        name: &str,
        bytes: &[u8],
        map: &Arc<PlaceholderMap>,
        depth: usize,
    ) -> Result<ContainerRewrite> {
        let classification = self.classifier.classify(name, bytes);
        let rewrite = match classification.kind {
            ContentKind::Container => return self.open_container(name, bytes, map, depth),
            ContentKind::ClassFile => {
                let key = CacheKey::new(name, bytes, map.fingerprint(), CLASS_FILE_ENCODING);
                cached(&self.class_cache, key, || self.classes.rewrite(bytes, map))
            }
            ContentKind::Text => {
                let charset = self
                    .config
                    .charset
                    .or(classification.charset)
                    .unwrap_or_default();
                let key = CacheKey::new(name, bytes, map.fingerprint(), charset.name());
                cached(&self.text_cache, key, || self.text.substitute(bytes, map, charset))
            }
            kind => self.collaborate(name, bytes, map, kind),
        };
        Ok(ContainerRewrite {
            rewrite,
            ..ContainerRewrite::default()
        })
    }

    fn open_container(
        self: &Arc<Self>,
        name: &str,
        bytes: &[u8],
        map: &Arc<PlaceholderMap>,
        depth: usize,
    ) -> Result<ContainerRewrite> {
        let Some(format) = ContainerFormat::detect(name, bytes) else {
            return Ok(ContainerRewrite {
                rewrite: Rewrite::unchanged(bytes),
                ..ContainerRewrite::default()
            });
        };
        if !self.archives.descends_into(depth) {
            let mut rewrite = Rewrite::unchanged(bytes);
            if self.config.archive.nested {
                let limit = self.config.archive.max_depth;
                warn!(name, depth, limit, "nested container beyond the depth limit");
                rewrite = rewrite.with_warning(Warning::new(
                    name,
                    format!("{}, copied unchanged", Error::DepthExceeded { limit }),
                ));
            }
            return Ok(ContainerRewrite {
                rewrite,
                ..ContainerRewrite::default()
            });
        }
        self.archives.process(self, bytes, name, format, map, depth)
    }

    fn collaborate(
        &self,
        name: &str,
        bytes: &[u8],
        map: &PlaceholderMap,
        kind: ContentKind,
    ) -> Rewrite {
        let Some(collaborator) = self.collaborators.iter().find(|c| c.accepts(name, kind)) else {
            return Rewrite::unchanged(bytes);
        };
        match collaborator.process(bytes, name, map) {
            Ok(out) => Rewrite {
                bytes: out,
                ..Rewrite::default()
            },
            Err(e) => {
                warn!(name, collaborator = collaborator.name(), error = %e, "collaborator failed");
                Rewrite::unchanged(bytes).with_warning(Warning::new(
                    name,
                    format!("{} failed: {e}", collaborator.name()),
                ))
            }
        }
    }
}

impl EntryHandler for Pipeline {
    fn handle_entry(
        self: &Arc<Self>,
        name: &str,
        bytes: &[u8],
        map: &Arc<PlaceholderMap>,
        depth: usize,
    ) -> Result<Rewrite> {
        self.dispatch(name, bytes, map, depth + 1)
            .map(|out| out.rewrite)
    }
}

fn cached(
    cache: &BoundedCache<CacheKey, Arc<Rewrite>>,
    key: CacheKey,
    compute: impl FnOnce() -> Rewrite,
) -> Rewrite {
    let hit = cache.get_or_insert_with(key, || Arc::new(compute()));
    Rewrite::clone(&hit)
}
