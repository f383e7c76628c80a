//! Placeholder substitution for text payloads: sequential, chunk-parallel or streaming.

use std::borrow::Cow;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::charset::Charset;
use crate::error::Result;
use crate::placeholder::PlaceholderMap;
use crate::pool::{TaskOutcome, WorkerPool};
use crate::result::{EngineMetrics, MetricsSnapshot, ProcessingResult, Rewrite, Warning};
use crate::search::Finder;

pub const DEFAULT_PARALLEL_THRESHOLD: usize = 5 * 1024 * 1024;
pub const DEFAULT_MIN_CHUNK: usize = 64 * 1024;
pub const DEFAULT_STREAM_BUFFER: usize = 2 * 1024 * 1024;
pub const MIN_STREAM_BUFFER: usize = 256 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct TextConfig {
    /// Buffers at least this large use the parallel strategy.
    pub parallel_threshold: usize,
    pub min_chunk: usize,
    pub stream_buffer: usize,
}

impl Default for TextConfig {
    fn default() -> Self {
        Self {
            parallel_threshold: DEFAULT_PARALLEL_THRESHOLD,
            min_chunk: DEFAULT_MIN_CHUNK,
            stream_buffer: DEFAULT_STREAM_BUFFER,
        }
    }
}

/// A placeholder map encoded for one charset.
#[derive(Debug, Clone)]
pub struct CompiledMap {
    passes: Vec<Pass>,
    unit: usize,
}

#[derive(Debug, Clone)]
struct Pass {
    finder: Finder,
    value: Vec<u8>,
}

impl CompiledMap {
    /// Encodes every pair in processing order. Pairs the charset cannot represent are dropped
    /// and reported.
    pub fn compile(map: &PlaceholderMap, charset: Charset) -> (Self, Vec<String>) {
        let mut passes = Vec::with_capacity(map.len());
        let mut skipped = Vec::new();
        for (key, value) in map.ordered() {
            match (charset.encode(key), charset.encode(value)) {
                (Some(k), Some(v)) => passes.push(Pass {
                    finder: Finder::new(&k),
                    value: v.into_owned(),
                }),
                _ => skipped.push(format!("placeholder {key} is not representable in {charset}")),
            }
        }
        let compiled = Self {
            passes,
            unit: charset.unit(),
        };
        (compiled, skipped)
    }

    /// Builds passes from pairs already encoded and ordered by the caller.
    pub(crate) fn from_encoded(pairs: Vec<(Vec<u8>, Vec<u8>)>, unit: usize) -> Self {
        let passes = pairs
            .into_iter()
            .filter(|(k, _)| !k.is_empty())
            .map(|(k, value)| Pass {
                finder: Finder::new(&k),
                value,
            })
            .collect();
        Self { passes, unit }
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }

    /// Longest encoded key, in bytes.
    pub fn overlap(&self) -> usize {
        self.passes
            .iter()
            .map(|p| p.finder.needle().len())
            .max()
            .unwrap_or(0)
    }

    /// True if any key occurs in `bytes` at all.
    pub fn matches_any(&self, bytes: &[u8]) -> bool {
        self.passes
            .iter()
            .any(|p| p.finder.find_aligned(bytes, 0, self.unit).is_some())
    }

    /// Sequential substitution. Borrows the input when nothing was replaced.
    pub fn apply<'a>(&self, input: &'a [u8]) -> (Cow<'a, [u8]>, u64) {
        let mut current = Cow::Borrowed(input);
        let mut total = 0;
        for pass in &self.passes {
            if let Some((next, count)) = replace_all(pass, &current, self.unit) {
                current = Cow::Owned(next);
                total += count;
            }
        }
        (current, total)
    }

    /// One single-pass map per key, in processing order.
    fn split(&self) -> Vec<CompiledMap> {
        self.passes
            .iter()
            .map(|pass| Self {
                passes: vec![pass.clone()],
                unit: self.unit,
            })
            .collect()
    }

    /// Smallest unit-aligned position at or after `at` that no occurrence of any key
    /// straddles.
    fn seam_at(&self, bytes: &[u8], at: usize) -> usize {
        let mut seam = at.next_multiple_of(self.unit);
        while seam < bytes.len() {
            match self.straddle_end(bytes, seam) {
                Some(end) => seam = end,
                None => return seam,
            }
        }
        bytes.len()
    }

    fn straddle_end(&self, bytes: &[u8], seam: usize) -> Option<usize> {
        let mut furthest = None;
        for pass in &self.passes {
            let k = pass.finder.needle().len();
            if k < 2 {
                continue;
            }
            let start = (seam + 1).saturating_sub(k) / self.unit * self.unit;
            let window = &bytes[..(seam + k - 1).min(bytes.len())];
            let mut from = start;
            while let Some(pos) = pass.finder.find_aligned(window, from, self.unit) {
                if pos >= seam {
                    break;
                }
                if pos + k > seam {
                    furthest = furthest.max(Some(pos + k));
                }
                from = pos + 1;
            }
        }
        furthest
    }
}

fn replace_all(pass: &Pass, input: &[u8], unit: usize) -> Option<(Vec<u8>, u64)> {
    let key_len = pass.finder.needle().len();
    let first = pass.finder.find_aligned(input, 0, unit)?;
    let mut out = Vec::with_capacity(input.len());
    let mut copied = 0;
    let mut count = 0;
    let mut next = Some(first);
    while let Some(pos) = next {
        out.extend_from_slice(&input[copied..pos]);
        out.extend_from_slice(&pass.value);
        copied = pos + key_len;
        count += 1;
        next = pass.finder.find_aligned(input, copied, unit);
    }
    out.extend_from_slice(&input[copied..]);
    Some((out, count))
}

/// Rolling window for one pass of the streaming strategy.
struct StreamPass<'a> {
    pass: &'a Pass,
    pending: Vec<u8>,
    replacements: u64,
}

impl<'a> StreamPass<'a> {
    fn new(pass: &'a Pass) -> Self {
        Self {
            pass,
            pending: Vec::new(),
            replacements: 0,
        }
    }

    /// Feeds `input` and appends everything that can no longer take part in a match.
    /// `pending` always starts on a unit boundary of this pass's input stream.
    fn push(&mut self, input: &[u8], unit: usize, out: &mut Vec<u8>) {
        self.pending.extend_from_slice(input);
        let key_len = self.pass.finder.needle().len();
        let mut emitted = 0;
        while let Some(pos) = self.pass.finder.find_aligned(&self.pending, emitted, unit) {
            out.extend_from_slice(&self.pending[emitted..pos]);
            out.extend_from_slice(&self.pass.value);
            emitted = pos + key_len;
            self.replacements += 1;
        }
        let safe = self.pending.len().saturating_sub(key_len - 1) / unit * unit;
        let keep_from = safe.max(emitted);
        out.extend_from_slice(&self.pending[emitted..keep_from]);
        self.pending.drain(..keep_from);
    }

    fn finish(&mut self, out: &mut Vec<u8>) {
        out.append(&mut self.pending);
    }
}

pub struct TextEngine {
    config: TextConfig,
    pool: Arc<WorkerPool>,
    metrics: EngineMetrics,
}

impl TextEngine {
    pub fn new(config: TextConfig, pool: Arc<WorkerPool>) -> Self {
        Self {
            config,
            pool,
            metrics: EngineMetrics::default(),
        }
    }

    pub fn config(&self) -> &TextConfig {
        &self.config
    }

    /// Substitutes every placeholder in an in-memory buffer, choosing the sequential or
    /// parallel strategy by size.
    pub fn substitute(&self, bytes: &[u8], map: &PlaceholderMap, charset: Charset) -> Rewrite {
        let started = Instant::now();
        let rewrite = self.substitute_inner(bytes, map, charset);
        self.metrics
            .record(bytes.len() as u64, rewrite.replacements, started.elapsed());
        rewrite
    }

    fn substitute_inner(&self, bytes: &[u8], map: &PlaceholderMap, charset: Charset) -> Rewrite {
        if map.is_empty() || bytes.is_empty() {
            return Rewrite::unchanged(bytes);
        }
        if !charset.is_byte_transparent() {
            return substitute_transcoded(bytes, map, charset);
        }

        let (compiled, skipped) = CompiledMap::compile(map, charset);
        let mut rewrite = if compiled.is_empty() {
            Rewrite::unchanged(bytes)
        } else if bytes.len() >= self.config.parallel_threshold && self.pool.threads() > 1 {
            self.substitute_parallel(bytes, &compiled)
        } else {
            let (out, replacements) = compiled.apply(bytes);
            Rewrite {
                bytes: out.into_owned(),
                replacements,
                warnings: Vec::new(),
            }
        };
        rewrite
            .warnings
            .extend(skipped.into_iter().map(|msg| Warning::new("text", msg)));
        rewrite
    }

    /// Runs each pass over the whole buffer in turn, cutting that pass's input at seams its
    /// key does not straddle.
    fn substitute_parallel(&self, bytes: &[u8], compiled: &CompiledMap) -> Rewrite {
        let mut current: Arc<[u8]> = Arc::from(bytes);
        let mut replacements = 0;
        for pass in compiled.split() {
            if !pass.matches_any(&current) {
                continue;
            }
            match self.parallel_pass(&current, Arc::new(pass)) {
                Ok((next, count)) => {
                    current = Arc::from(next);
                    replacements += count;
                }
                Err(failure) => {
                    warn!(%failure, "parallel substitution failed, falling back to sequential");
                    let (out, replacements) = compiled.apply(bytes);
                    return Rewrite {
                        bytes: out.into_owned(),
                        replacements,
                        warnings: vec![Warning::new(
                            "text",
                            format!("parallel substitution fell back to sequential: {failure}"),
                        )],
                    };
                }
            }
        }
        Rewrite {
            bytes: current.to_vec(),
            replacements,
            warnings: Vec::new(),
        }
    }

    fn parallel_pass(
        &self,
        data: &Arc<[u8]>,
        pass: Arc<CompiledMap>,
    ) -> std::result::Result<(Vec<u8>, u64), String> {
        let chunk = (data.len() / self.pool.threads()).max(self.config.min_chunk);
        let mut ranges = Vec::new();
        let mut start = 0;
        while start < data.len() {
            let end = pass.seam_at(data, start + chunk).min(data.len());
            ranges.push(start..end);
            start = end;
        }
        debug!(
            len = data.len(),
            chunks = ranges.len(),
            overlap = pass.overlap(),
            "parallel pass"
        );

        let task_data = Arc::clone(data);
        let outcomes = self.pool.map_ordered(ranges, move |_, range| {
            let (out, count) = pass.apply(&task_data[range]);
            (out.into_owned(), count)
        });
        if let Some(failure) = outcomes.iter().find_map(TaskOutcome::failure) {
            return Err(failure);
        }

        let mut out = Vec::with_capacity(data.len());
        let mut replacements = 0;
        for (piece, count) in outcomes.into_iter().filter_map(TaskOutcome::ok) {
            out.extend_from_slice(&piece);
            replacements += count;
        }
        Ok((out, replacements))
    }

    /// Streams `reader` into `writer` with the configured buffer size.
    pub fn substitute_stream<R: Read, W: Write>(
        &self,
        reader: R,
        writer: W,
        map: &PlaceholderMap,
        charset: Charset,
    ) -> Result<ProcessingResult> {
        let buffer = self.config.stream_buffer.max(MIN_STREAM_BUFFER);
        self.substitute_stream_with_buffer(reader, writer, map, charset, buffer)
    }

    /// Streams `reader` into `writer`, reading at most `buffer` bytes at a time.
    /// The output does not depend on `buffer`.
    pub fn substitute_stream_with_buffer<R: Read, W: Write>(
        &self,
        mut reader: R,
        mut writer: W,
        map: &PlaceholderMap,
        charset: Charset,
        buffer: usize,
    ) -> Result<ProcessingResult> {
        let started = Instant::now();
        let mut result = ProcessingResult::new(0, 0, map.len());

        if map.is_empty() {
            debug!("no placeholders, copying stream");
            result.bytes_processed = io::copy(&mut reader, &mut writer)?;
        } else if !charset.is_byte_transparent() {
            let mut input = Vec::new();
            reader.read_to_end(&mut input)?;
            let rewrite = substitute_transcoded(&input, map, charset);
            writer.write_all(&rewrite.bytes)?;
            result.bytes_processed = input.len() as u64;
            result.replacement_count = rewrite.replacements;
            result.warnings = rewrite.warnings;
        } else {
            let (compiled, skipped) = CompiledMap::compile(map, charset);
            result.warnings = skipped
                .into_iter()
                .map(|msg| Warning::new("text", msg))
                .collect();
            let (bytes, replacements) =
                stream_passes(&compiled, &mut reader, &mut writer, buffer.max(1))?;
            result.bytes_processed = bytes;
            result.replacement_count = replacements;
        }
        writer.flush()?;

        result.elapsed = started.elapsed();
        self.metrics
            .record(result.bytes_processed, result.replacement_count, result.elapsed);
        debug!(
            bytes = result.bytes_processed,
            replacements = result.replacement_count,
            elapsed_ms = result.elapsed.as_millis() as u64,
            "stream substitution finished"
        );
        Ok(result)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn reset_metrics(&self) {
        self.metrics.reset();
    }
}

fn stream_passes<R: Read, W: Write>(
    compiled: &CompiledMap,
    reader: &mut R,
    writer: &mut W,
    buffer: usize,
) -> Result<(u64, u64)> {
    let unit = compiled.unit;
    let mut passes: Vec<StreamPass<'_>> = compiled.passes.iter().map(StreamPass::new).collect();
    let mut buf = vec![0u8; buffer];
    let mut total = 0u64;

    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        total += n as u64;
        let mut carry = buf[..n].to_vec();
        for pass in passes.iter_mut() {
            let mut out = Vec::with_capacity(carry.len());
            pass.push(&carry, unit, &mut out);
            carry = out;
        }
        writer.write_all(&carry)?;
    }

    // Flush each window in order, feeding it through the passes after it.
    let mut tail = Vec::new();
    for i in 0..passes.len() {
        let mut out = Vec::new();
        passes[i].push(&tail, unit, &mut out);
        passes[i].finish(&mut out);
        tail = out;
    }
    writer.write_all(&tail)?;

    let replacements = passes.iter().map(|p| p.replacements).sum();
    Ok((total, replacements))
}

/// Decode, substitute and re-encode for charsets whose bytes cannot be matched directly.
fn substitute_transcoded(bytes: &[u8], map: &PlaceholderMap, charset: Charset) -> Rewrite {
    let Some(text) = charset.decode(bytes) else {
        return Rewrite::unchanged(bytes).with_warning(Warning::new(
            "text",
            format!("content is not valid {charset}, left unchanged"),
        ));
    };
    let (compiled, _) = CompiledMap::compile(map, Charset::utf8());
    let (replaced, replacements) = compiled.apply(text.as_bytes());
    if replacements == 0 {
        return Rewrite::unchanged(bytes);
    }
    let replaced = String::from_utf8_lossy(&replaced);
    match charset.encode(&replaced) {
        Some(encoded) => Rewrite {
            bytes: encoded.into_owned(),
            replacements,
            warnings: Vec::new(),
        },
        None => Rewrite::unchanged(bytes).with_warning(Warning::new(
            "text",
            format!("substituted values are not representable in {charset}, left unchanged"),
        )),
    }
}

/// Replacement count estimated from per-key occurrence deltas between `before` and `after`.
/// Inexact when a value reintroduces key text; the engine itself counts matches directly.
pub fn estimate_replacements(
    before: &[u8],
    after: &[u8],
    map: &PlaceholderMap,
    charset: Charset,
) -> u64 {
    let (compiled, _) = CompiledMap::compile(map, charset);
    compiled
        .passes
        .iter()
        .map(|p| {
            let b = p.finder.count(before, compiled.unit);
            let a = p.finder.count(after, compiled.unit);
            b.saturating_sub(a) as u64
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{PoolConfig, PoolSizing};
    use std::time::Duration;

    fn engine(config: TextConfig) -> TextEngine {
        let pool = WorkerPool::new(PoolConfig {
            sizing: PoolSizing::Fixed(4),
            task_timeout: Duration::from_secs(30),
        })
        .unwrap();
        TextEngine::new(config, Arc::new(pool))
    }

    fn map(pairs: &[(&str, &str)]) -> PlaceholderMap {
        pairs.iter().copied().collect()
    }

    fn stream(engine: &TextEngine, input: &[u8], map: &PlaceholderMap, buffer: usize) -> Vec<u8> {
        let mut out = Vec::new();
        engine
            .substitute_stream_with_buffer(input, &mut out, map, Charset::utf8(), buffer)
            .unwrap();
        out
    }

    #[test]
    fn longer_key_wins_over_embedded_shorter_key() {
        let engine = engine(TextConfig::default());
        let m = map(&[("${A}", "short"), ("${AB}", "long")]);
        let out = engine.substitute(b"${AB} ${A}", &m, Charset::utf8());
        assert_eq!(out.bytes, b"long short");
        assert_eq!(out.replacements, 2);
    }

    #[test]
    fn empty_map_is_identity() {
        let engine = engine(TextConfig::default());
        let input = b"keep \xff\xfe ${X} as is";
        let out = engine.substitute(input, &PlaceholderMap::new(), Charset::utf8());
        assert_eq!(out.bytes, input);
        assert_eq!(out.replacements, 0);
    }

    #[test]
    fn invalid_utf8_bytes_survive_substitution() {
        let engine = engine(TextConfig::default());
        let m = map(&[("${V}", "1.0")]);
        let out = engine.substitute(b"\xc3(${V}\xff", &m, Charset::utf8());
        assert_eq!(out.bytes, b"\xc3(1.0\xff");
    }

    #[test]
    fn streaming_output_is_independent_of_buffer_size() {
        let engine = engine(TextConfig::default());
        let m = map(&[("${NAME}", "Sam"), ("${VERSION}", "2.0.1"), ("${N}", "n")]);
        let input = b"Hello ${NAME}, ${VERSION}${NAME}${N}${NAM ${NAME}".repeat(5);
        let expected = engine.substitute(&input, &m, Charset::utf8()).bytes;
        for buffer in [1, 2, 7, 13, 4096, input.len()] {
            assert_eq!(stream(&engine, &input, &m, buffer), expected, "buffer {buffer}");
        }
    }

    #[test]
    fn streaming_counts_match_sequential_counts() {
        let engine = engine(TextConfig::default());
        let m = map(&[("${A}", "x"), ("${AB}", "y")]);
        let input = b"${AB}${A}${A}B}";
        let mut out = Vec::new();
        let result = engine
            .substitute_stream_with_buffer(&input[..], &mut out, &m, Charset::utf8(), 3)
            .unwrap();
        let sequential = engine.substitute(input, &m, Charset::utf8());
        assert_eq!(out, sequential.bytes);
        assert_eq!(result.replacement_count, sequential.replacements);
        assert_eq!(result.bytes_processed, input.len() as u64);
    }

    #[test]
    fn parallel_matches_sequential_across_seams() {
        let config = TextConfig {
            parallel_threshold: 1,
            min_chunk: 5,
            ..TextConfig::default()
        };
        let engine = engine(config);
        let m = map(&[("${LONGER_KEY}", "L"), ("${K}", "k")]);
        let input = b"ab${LONGER_KEY}c${K}${K}d${LONGER_KEY}${LONGER_KEY}e".repeat(40);
        let (compiled, _) = CompiledMap::compile(&m, Charset::utf8());
        let (expected, expected_count) = compiled.apply(&input);
        let out = engine.substitute(&input, &m, Charset::utf8());
        assert_eq!(out.bytes, expected.as_ref());
        assert_eq!(out.replacements, expected_count);
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn a_later_key_formed_across_a_seam_is_still_replaced() {
        let config = TextConfig {
            parallel_threshold: 1,
            min_chunk: 7,
            ..TextConfig::default()
        };
        let engine = engine(config);
        let m = map(&[("${LONG}", "a"), ("ab", "Z")]);
        let (compiled, _) = CompiledMap::compile(&m, Charset::utf8());
        for input in [b"${LONG}b".to_vec(), b"${LONG}b-".repeat(20)] {
            let (expected, expected_count) = compiled.apply(&input);
            let out = engine.substitute(&input, &m, Charset::utf8());
            assert_eq!(out.bytes, expected.as_ref());
            assert_eq!(out.replacements, expected_count);
        }
        assert_eq!(engine.substitute(b"${LONG}b", &m, Charset::utf8()).bytes, b"Z");
    }

    #[test]
    fn seams_never_split_an_occurrence() {
        let m = map(&[("${KEY}", "v")]);
        let (compiled, _) = CompiledMap::compile(&m, Charset::utf8());
        let bytes = b"xx${KEY}yy";
        for at in 0..bytes.len() {
            let seam = compiled.seam_at(bytes, at);
            assert!(!(3..8).contains(&seam), "seam {seam} splits the key for at={at}");
        }
    }

    #[test]
    fn utf16_matches_only_on_code_unit_boundaries() {
        let engine = engine(TextConfig::default());
        let m = map(&[("A", "B")]);
        let cs = Charset::utf16le();
        let input = cs.encode("xAx").unwrap().into_owned();
        let out = engine.substitute(&input, &m, cs);
        assert_eq!(out.bytes, cs.encode("xBx").unwrap().as_ref());

        // 0x41 0x00 at an odd offset is not the character 'A'.
        let misaligned = [0x41, 0x41, 0x00, 0x00];
        let out = engine.substitute(&misaligned, &m, cs);
        assert_eq!(out.bytes, misaligned);
    }

    #[test]
    fn legacy_multibyte_charsets_round_trip_through_decode() {
        let engine = engine(TextConfig::default());
        let sjis = Charset::for_label("shift_jis").unwrap();
        let m = map(&[("${NAME}", "\u{65e5}\u{672c}")]);
        let input = sjis.encode("\u{540d}\u{524d}: ${NAME}").unwrap().into_owned();
        let out = engine.substitute(&input, &m, sjis);
        let decoded = sjis.decode(&out.bytes).unwrap();
        assert_eq!(decoded, "\u{540d}\u{524d}: \u{65e5}\u{672c}");
        assert_eq!(out.replacements, 1);
    }

    #[test]
    fn reapplying_the_map_is_a_no_op() {
        let engine = engine(TextConfig::default());
        let m = map(&[("${NAME}", "Sam"), ("${VERSION}", "2")]);
        let once = engine.substitute(b"${NAME} v${VERSION}", &m, Charset::utf8());
        let twice = engine.substitute(&once.bytes, &m, Charset::utf8());
        assert_eq!(once.bytes, twice.bytes);
        assert_eq!(twice.replacements, 0);
    }

    #[test]
    fn delta_estimate_undercounts_when_values_reintroduce_keys() {
        let m = map(&[("${X}", "${X}${X}")]);
        let engine = engine(TextConfig::default());
        let out = engine.substitute(b"${X}", &m, Charset::utf8());
        assert_eq!(out.replacements, 1);
        assert_eq!(
            estimate_replacements(b"${X}", &out.bytes, &m, Charset::utf8()),
            0
        );
    }

    #[test]
    fn metrics_accumulate_per_call() {
        let engine = engine(TextConfig::default());
        let m = map(&[("${X}", "y")]);
        engine.substitute(b"${X}${X}", &m, Charset::utf8());
        engine.substitute(b"${X}", &m, Charset::utf8());
        let snap = engine.metrics();
        assert_eq!(snap.operations, 2);
        assert_eq!(snap.replacements, 3);
        engine.reset_metrics();
        assert_eq!(engine.metrics().replacements, 0);
    }
}
