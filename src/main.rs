use anyhow::{Context, Result};
use clap::Parser;
use placy::archive::ContainerFormat;
use placy::classfile::{ClassFile, PoolRow};
use placy::classify::{ContentClassifier, ContentKind};
use placy::cli::{Cli, Commands, OutputFormat};
use placy::config::{StampOverrides, resolve_placeholders, resolve_stamp_config};
use placy::placeholder::{PlaceholderMap, ValidationReport};
use placy::result::ProcessingResult;
use placy::scan::{entry_name, map_file, output_path, scan_files, temp_sibling, write_atomic};
use placy::stamp::{StampStats, Stamper};
use rayon::prelude::*;
use serde::Serialize;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{Level, debug, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let cli = parse_cli()?;
    init_tracing(cli.verbose);

    match cli.command.clone() {
        Commands::Stamp {
            input,
            output,
            set,
            name,
            charset,
            stream,
            nested,
            max_depth,
            format,
        } => {
            let map = resolve_placeholders(&cli, &set)?;
            let overrides = StampOverrides {
                nested,
                max_depth,
                charset,
            };
            let stamper = Stamper::new(resolve_stamp_config(&cli, &overrides)?)?;
            let job = StampJob {
                input: &input,
                output: output.as_deref(),
                name: name.as_deref(),
                stream,
            };
            let report = stamp(&stamper, &map, &job)?;
            write_stamp_report(&report, format)?;
        }
        Commands::Classify { files, format } => {
            let rows = classify_files(&files)?;
            write_classify_output(&rows, format)?;
        }
        Commands::Inspect { class_file, format } => {
            let report = inspect_class_file(&class_file)?;
            write_inspect_output(&report, format)?;
        }
        Commands::Validate { set, format } => {
            let map = resolve_placeholders(&cli, &set)?;
            let report = ValidateReport::new(&map);
            write_validate_output(&report, format)?;
            if !report.report.is_valid() {
                anyhow::bail!("placeholder map has {} error(s)", report.report.errors.len());
            }
        }
    }

    Ok(())
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn parse_cli() -> Result<Cli> {
    let args: Vec<String> = std::env::args().collect();
    Ok(Cli::parse_from(rewrite_args_for_implicit_stamp(args)))
}

/// `placy app.jar --set K=V` is shorthand for `placy stamp app.jar --set K=V`.
fn rewrite_args_for_implicit_stamp(mut args: Vec<String>) -> Vec<String> {
    if args.len() <= 1 {
        return args;
    }

    let subcommands = ["stamp", "classify", "inspect", "validate", "help"];

    let mut idx = 1usize;
    while idx < args.len() {
        let a = args[idx].as_str();
        if a == "--" {
            idx += 1;
            break;
        }

        if a == "--placeholders" || a == "--threads" {
            idx += 2;
            continue;
        }

        if a.starts_with('-') {
            idx += 1;
            continue;
        }

        break;
    }

    if idx < args.len() {
        let token = args[idx].as_str();
        if !subcommands.contains(&token) {
            args.insert(idx, "stamp".to_string());
        }
    }

    args
}

struct StampJob<'a> {
    input: &'a Path,
    output: Option<&'a Path>,
    name: Option<&'a str>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct FileReport {
    input: String,
    output: String,
    changed: bool,
    #[serde(flatten)]
    result: ProcessingResult,
}

#[derive(Debug, Default, Serialize)]
struct Totals {
    files: usize,
    files_changed: usize,
    bytes_processed: u64,
    replacement_count: u64,
    warnings: usize,
}

#[derive(Debug, Serialize)]
struct StampReport {
    files: Vec<FileReport>,
    totals: Totals,
    duration_ms: u64,
    stats: StampStats,
}

fn stamp(stamper: &Stamper, map: &PlaceholderMap, job: &StampJob<'_>) -> Result<StampReport> {
    let start = Instant::now();
    let files = if job.input.is_dir() {
        if job.stream {
            anyhow::bail!("--stream takes a single file, not a directory");
        }
        let inputs = scan_files(job.input)?;
        info!(root = %job.input.display(), files = inputs.len(), "scanned input tree");
        inputs
            .par_iter()
            .map(|file| {
                let target = output_path(job.input, file, job.output);
                let name = entry_name(job.input, file);
                stamp_file(stamper, map, file, &target, &name)
            })
            .collect::<Result<Vec<_>>>()?
    } else {
        let target = job.output.unwrap_or(job.input).to_path_buf();
        let name = match job.name {
            Some(hint) => hint.to_string(),
            None => file_name(job.input),
        };
        let report = if job.stream {
            stream_file(stamper, map, job.input, &target)?
        } else {
            stamp_file(stamper, map, job.input, &target, &name)?
        };
        vec![report]
    };

    let mut totals = Totals::default();
    for f in &files {
        totals.files += 1;
        totals.files_changed += usize::from(f.changed);
        totals.bytes_processed += f.result.bytes_processed;
        totals.replacement_count += f.result.replacement_count;
        totals.warnings += f.result.warnings.len();
    }

    Ok(StampReport {
        files,
        totals,
        duration_ms: start.elapsed().as_millis() as u64,
        stats: stamper.stats(),
    })
}

fn stamp_file(
    stamper: &Stamper,
    map: &PlaceholderMap,
    input: &Path,
    target: &Path,
    name: &str,
) -> Result<FileReport> {
    let bytes = map_file(input)?;
    let (out, result) = stamper
        .process(&bytes, name, map)
        .with_context(|| format!("Failed to stamp {}", input.display()))?;
    let changed = out.as_slice() != &*bytes;
    drop(bytes);

    if changed || target != input {
        write_atomic(target, &out)?;
    } else {
        debug!(input = %input.display(), "unchanged, not rewritten");
    }

    Ok(FileReport {
        input: input.to_string_lossy().to_string(),
        output: target.to_string_lossy().to_string(),
        changed,
        result,
    })
}

fn stream_file(
    stamper: &Stamper,
    map: &PlaceholderMap,
    input: &Path,
    target: &Path,
) -> Result<FileReport> {
    if let Some(parent) = target.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    let tmp = temp_sibling(target);
    let reader = BufReader::new(
        File::open(input).with_context(|| format!("Failed to open input: {}", input.display()))?,
    );
    let writer = BufWriter::new(
        File::create(&tmp).with_context(|| format!("Failed to create {}", tmp.display()))?,
    );
    let result = match stamper.process_stream(reader, writer, map) {
        Ok(result) => result,
        Err(e) => {
            let _ = std::fs::remove_file(&tmp);
            return Err(e).with_context(|| format!("Failed to stream {}", input.display()));
        }
    };
    std::fs::rename(&tmp, target)
        .with_context(|| format!("Failed to replace output: {}", target.display()))?;

    Ok(FileReport {
        input: input.to_string_lossy().to_string(),
        output: target.to_string_lossy().to_string(),
        changed: result.replacement_count > 0,
        result,
    })
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string_lossy().to_string())
}

fn write_stamp_report(report: &StampReport, format: OutputFormat) -> Result<()> {
    let content = match format {
        OutputFormat::Json => serde_json::to_string_pretty(report)?,
        OutputFormat::Text => {
            let mut out = String::new();
            for f in &report.files {
                out.push_str(&format!(
                    "{} -> {}: {} replacement(s){}\n",
                    f.input,
                    f.output,
                    f.result.replacement_count,
                    if f.changed { "" } else { ", unchanged" }
                ));
                for w in &f.result.warnings {
                    out.push_str(&format!("  warning: {w}\n"));
                }
            }
            out.push_str(&format!(
                "files: {}, changed: {}, replacements: {}, duration_ms: {}\n",
                report.totals.files,
                report.totals.files_changed,
                report.totals.replacement_count,
                report.duration_ms
            ));
            out
        }
    };
    print_content(&content);
    Ok(())
}

#[derive(Debug, Serialize)]
struct ClassifyRow {
    path: String,
    kind: ContentKind,
    charset: Option<&'static str>,
    container: Option<String>,
}

fn classify_files(files: &[PathBuf]) -> Result<Vec<ClassifyRow>> {
    let classifier = ContentClassifier::default();
    files
        .iter()
        .map(|path| {
            let bytes = map_file(path)?;
            let name = file_name(path);
            let classification = classifier.classify(&name, &bytes);
            let container = match classification.kind {
                ContentKind::Container => {
                    ContainerFormat::detect(&name, &bytes).map(|f| f.label())
                }
                _ => None,
            };
            Ok(ClassifyRow {
                path: path.to_string_lossy().to_string(),
                kind: classification.kind,
                charset: classification.charset.map(|c| c.name()),
                container,
            })
        })
        .collect()
}

fn write_classify_output(rows: &[ClassifyRow], format: OutputFormat) -> Result<()> {
    let content = match format {
        OutputFormat::Json => serde_json::to_string_pretty(rows)?,
        OutputFormat::Text => {
            let mut out = String::new();
            for r in rows {
                let detail = r.container.as_deref().or(r.charset).unwrap_or("-");
                out.push_str(&format!("{}: {:?} ({detail})\n", r.path, r.kind));
            }
            out
        }
    };
    print_content(&content);
    Ok(())
}

#[derive(Debug, Serialize)]
struct InspectReport {
    path: String,
    major_version: u16,
    minor_version: u16,
    constant_pool_count: usize,
    constants: Vec<PoolRow>,
}

fn inspect_class_file(path: &Path) -> Result<InspectReport> {
    let bytes = map_file(path)?;
    let class = ClassFile::parse(&bytes)
        .with_context(|| format!("Not a readable class file: {}", path.display()))?;
    Ok(InspectReport {
        path: path.to_string_lossy().to_string(),
        major_version: class.major_version,
        minor_version: class.minor_version,
        constant_pool_count: class.constant_pool_count(),
        constants: class.describe(),
    })
}

fn write_inspect_output(report: &InspectReport, format: OutputFormat) -> Result<()> {
    let content = match format {
        OutputFormat::Json => serde_json::to_string_pretty(report)?,
        OutputFormat::Text => {
            let mut out = String::new();
            out.push_str(&format!("path: {}\n", report.path));
            out.push_str(&format!(
                "version: {}.{}\n",
                report.major_version, report.minor_version
            ));
            out.push_str(&format!(
                "constant_pool_count: {}\n",
                report.constant_pool_count
            ));
            for row in &report.constants {
                out.push_str(&format!("  #{:<5} {}\n", row.slot, row.value));
            }
            out
        }
    };
    print_content(&content);
    Ok(())
}

#[derive(Debug, Serialize)]
struct ValidateReport {
    placeholders: usize,
    #[serde(flatten)]
    report: ValidationReport,
}

impl ValidateReport {
    fn new(map: &PlaceholderMap) -> Self {
        Self {
            placeholders: map.len(),
            report: map.validate(),
        }
    }
}

fn write_validate_output(report: &ValidateReport, format: OutputFormat) -> Result<()> {
    let content = match format {
        OutputFormat::Json => serde_json::to_string_pretty(report)?,
        OutputFormat::Text => {
            let mut out = format!("placeholders: {}\n", report.placeholders);
            for e in &report.report.errors {
                out.push_str(&format!("error: {e}\n"));
            }
            for w in &report.report.warnings {
                out.push_str(&format!("warning: {w}\n"));
            }
            out
        }
    };
    print_content(&content);
    Ok(())
}

fn print_content(content: &str) {
    print!("{content}");
    if !content.ends_with('\n') {
        println!();
    }
}
