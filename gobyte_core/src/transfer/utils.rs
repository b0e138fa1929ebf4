//! File selection, collision-free target naming, and display formatting.

use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};

use super::protocol::FileMetadata;

/// A local file staged for sending: its metadata as it will appear on the
/// wire plus the absolute path to read it from.
#[derive(Debug, Clone)]
pub struct FileOffer {
    pub name: String,
    /// Relative directory announced to the receiver; `"."` for files that
    /// should land directly in the download root.
    pub rel_path: String,
    pub abs_path: PathBuf,
    pub size: u64,
}

impl FileOffer {
    pub fn metadata(&self) -> Result<FileMetadata, super::protocol::ProtoError> {
        FileMetadata::new(self.size, self.name.clone(), self.rel_path.clone())
    }
}

/// Resolve user-selected paths into offers: stat each file, take its name,
/// and keep the relative directory part so the receiver can recreate it.
/// Directories are rejected; callers expand them beforehand.
pub fn resolve_files(paths: &[PathBuf]) -> Result<Vec<FileOffer>> {
    let mut offers = Vec::with_capacity(paths.len());

    for path in paths {
        let meta = std::fs::metadata(path)
            .with_context(|| format!("cannot access {}", path.display()))?;
        if meta.is_dir() {
            bail!("{} is a directory, not a file", path.display());
        }

        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .with_context(|| format!("{} has no usable file name", path.display()))?
            .to_string();

        let rel_path = if path.is_absolute() {
            ".".to_string()
        } else {
            match path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => {
                    parent.to_string_lossy().into_owned()
                }
                _ => ".".to_string(),
            }
        };

        offers.push(FileOffer {
            name,
            rel_path,
            abs_path: std::fs::canonicalize(path)
                .with_context(|| format!("cannot resolve {}", path.display()))?,
            size: meta.len(),
        });
    }

    Ok(offers)
}

/// Strip a wire path down to something safe to join under the download
/// root: only normal components survive, so `..`, roots and drive prefixes
/// cannot escape it.
pub fn sanitize_rel_path(path: &str) -> PathBuf {
    Path::new(path)
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .collect()
}

/// Strip a wire file name down to its final component.
pub fn sanitize_file_name(name: &str) -> String {
    let name = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim()
        .to_string();
    if name.is_empty() || name == "." || name == ".." {
        "unnamed".to_string()
    } else {
        name
    }
}

/// Pick a target path for `name` in `dir` that does not collide with an
/// existing file. On collision the existing `<stem> (<n>)<ext>` entries are
/// counted and the next index is used: with `a.txt` and `a (1).txt` present
/// a new `a.txt` becomes `a (2).txt`.
pub fn next_available_path(dir: &Path, name: &str) -> std::io::Result<PathBuf> {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return Ok(candidate);
    }

    let (stem, ext) = split_name(name);
    let count = count_renamed(dir, stem, ext)?;
    Ok(dir.join(format!("{stem} ({}){ext}", count + 1)))
}

/// Split into stem and extension, keeping the dot with the extension:
/// `"a.txt"` -> `("a", ".txt")`, `"archive"` -> `("archive", "")`.
fn split_name(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) if idx > 0 => name.split_at(idx),
        _ => (name, ""),
    }
}

fn count_renamed(dir: &Path, stem: &str, ext: &str) -> std::io::Result<usize> {
    let prefix = format!("{stem} (");
    let suffix = format!("){ext}");

    let mut count = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        let Some(rest) = file_name.strip_prefix(&prefix) else {
            continue;
        };
        let Some(index) = rest.strip_suffix(&suffix) else {
            continue;
        };
        if !index.is_empty() && index.bytes().all(|byte| byte.is_ascii_digit()) {
            count += 1;
        }
    }
    Ok(count)
}

/// Human-readable byte count: `532 B`, `1.2 KB`, `3.4 GB`.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["KB", "MB", "GB", "TB", "PB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

/// Transfer speed from a byte count and elapsed seconds.
pub fn format_speed(bytes: u64, elapsed_secs: f64) -> String {
    if elapsed_secs <= 0.0 {
        return "0 B/s".to_string();
    }
    format!("{}/s", format_size((bytes as f64 / elapsed_secs) as u64))
}
