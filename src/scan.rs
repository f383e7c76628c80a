//! Input discovery and file access for the binary.

use anyhow::{Context, Result};
use ignore::WalkBuilder;
use memmap2::Mmap;
use std::fs::File;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::mpsc;

/// Contents of an input file: memory-mapped, or owned when the file is empty.
pub enum FileBytes {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl Deref for FileBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            FileBytes::Mapped(m) => m,
            FileBytes::Owned(v) => v,
        }
    }
}

pub fn map_file(path: &Path) -> Result<FileBytes> {
    let file =
        File::open(path).with_context(|| format!("Failed to open input: {}", path.display()))?;
    let len = file
        .metadata()
        .with_context(|| format!("Failed to stat input: {}", path.display()))?
        .len();
    if len == 0 {
        return Ok(FileBytes::Owned(Vec::new()));
    }
    let mmap = unsafe { Mmap::map(&file) }
        .with_context(|| format!("Failed to mmap input: {}", path.display()))?;
    Ok(FileBytes::Mapped(mmap))
}

/// Every regular file under `base`, hidden files and ignored paths included, in path order.
pub fn scan_files(base: &Path) -> Result<Vec<PathBuf>> {
    let (tx, rx) = mpsc::channel();

    let walker = WalkBuilder::new(base)
        .hidden(false)
        .ignore(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .parents(false)
        .build_parallel();

    walker.run(|| {
        let tx = tx.clone();
        Box::new(move |entry| {
            if let Ok(entry) = entry
                && entry.file_type().is_some_and(|t| t.is_file())
            {
                let _ = tx.send(entry.into_path());
            }
            ignore::WalkState::Continue
        })
    });

    drop(tx);
    let mut files: Vec<PathBuf> = rx.iter().collect();
    files.sort();
    Ok(files)
}

/// Where `file` (found under `base`) is written: mirrored under `output`, or in place.
pub fn output_path(base: &Path, file: &Path, output: Option<&Path>) -> PathBuf {
    match (output, file.strip_prefix(base)) {
        (Some(out), Ok(relative)) => out.join(relative),
        _ => file.to_path_buf(),
    }
}

/// Name used for classification: the path relative to `base`, with `/` separators.
pub fn entry_name(base: &Path, file: &Path) -> String {
    let relative = file.strip_prefix(base).unwrap_or(file);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Replaces `path` with `bytes` through a sibling temporary file.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    let tmp = temp_sibling(path);
    std::fs::write(&tmp, bytes)
        .with_context(|| format!("Failed to write output: {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to replace output: {}", path.display()))?;
    Ok(())
}

pub fn temp_sibling(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(format!(".placy-{}.tmp", std::process::id()));
    PathBuf::from(os)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn temp_dir(prefix: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!(
            "{prefix}-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        p
    }

    #[test]
    fn scan_finds_nested_and_hidden_files_in_order() {
        let base = temp_dir("placy-scan");
        fs::create_dir_all(base.join("b/c")).unwrap();
        fs::write(base.join("a.txt"), "a").unwrap();
        fs::write(base.join("b/c/d.properties"), "d").unwrap();
        fs::write(base.join(".env"), "e").unwrap();

        let files = scan_files(&base).unwrap();
        let names: Vec<String> = files.iter().map(|f| entry_name(&base, f)).collect();
        assert_eq!(names, [".env", "a.txt", "b/c/d.properties"]);
        let _ = fs::remove_dir_all(&base);
    }

    #[test]
    fn outputs_mirror_the_input_tree() {
        let base = Path::new("/in");
        let file = Path::new("/in/conf/app.yml");
        assert_eq!(
            output_path(base, file, Some(Path::new("/out"))),
            PathBuf::from("/out/conf/app.yml")
        );
        assert_eq!(output_path(base, file, None), file);
    }

    #[test]
    fn mapped_and_empty_files_read_the_same_way() {
        let base = temp_dir("placy-map");
        fs::create_dir_all(&base).unwrap();
        let full = base.join("full.txt");
        let empty = base.join("empty.txt");
        fs::write(&full, "content").unwrap();
        fs::write(&empty, "").unwrap();

        assert_eq!(&*map_file(&full).unwrap(), b"content");
        assert!(map_file(&empty).unwrap().is_empty());

        write_atomic(&full, b"replaced").unwrap();
        assert_eq!(fs::read(&full).unwrap(), b"replaced");
        let _ = fs::remove_dir_all(&base);
    }
}
