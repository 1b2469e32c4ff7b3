//! Offline checks for a region output directory.
//!
//! A directory is complete when chunk indexes run `0..n` without gaps, every chunk has
//! exactly one `{chunk:06}.png` snapshot, and every chunk index (where the store writes
//! one) lists strictly increasing sequence numbers whose byte ranges fit the chunk file.

use anyhow::{anyhow, Context, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::storage::chunked::INDEX_SUFFIX;
use crate::storage::{ChunkIndexEntry, METADATA_FILE};

#[derive(Debug, Clone, Default)]
pub struct RegionDirReport {
    pub path: PathBuf,
    /// `format` from `metadata.json`, when present.
    pub format: Option<String>,
    pub chunks: BTreeSet<i64>,
    pub snapshots: BTreeSet<i64>,
    /// Frames counted from chunk indexes or per-frame images; `None` if not countable.
    pub frames: Option<u64>,
    pub missing_snapshots: Vec<i64>,
    pub orphan_snapshots: Vec<i64>,
    /// Chunk indexes absent from an otherwise contiguous run.
    pub gaps: Vec<i64>,
    pub index_errors: Vec<String>,
}

impl RegionDirReport {
    pub fn is_complete(&self) -> bool {
        self.missing_snapshots.is_empty()
            && self.orphan_snapshots.is_empty()
            && self.gaps.is_empty()
            && self.index_errors.is_empty()
    }
}

#[derive(Default)]
struct ChunkArtifacts {
    data_len: Option<u64>,
    image_count: Option<u64>,
    index: Option<PathBuf>,
}

pub fn verify_region_dir(path: &Path) -> Result<RegionDirReport> {
    if !path.is_dir() {
        return Err(anyhow!("{} is not a directory", path.display()));
    }
    let mut report = RegionDirReport {
        path: path.to_path_buf(),
        format: read_format(path)?,
        ..RegionDirReport::default()
    };
    let mut artifacts: BTreeMap<i64, ChunkArtifacts> = BTreeMap::new();

    for entry in std::fs::read_dir(path).with_context(|| format!("failed to list {}", path.display()))? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some((chunk, rest)) = split_chunk_name(&name) else {
            continue;
        };
        let file_type = entry.file_type()?;
        if file_type.is_dir() && rest.is_empty() {
            report.chunks.insert(chunk);
            artifacts.entry(chunk).or_default().image_count = Some(count_pngs(&entry.path())?);
        } else if rest == ".png" {
            report.snapshots.insert(chunk);
        } else if rest == INDEX_SUFFIX {
            artifacts.entry(chunk).or_default().index = Some(entry.path());
        } else if file_type.is_file() && rest.starts_with('.') {
            report.chunks.insert(chunk);
            artifacts.entry(chunk).or_default().data_len = Some(entry.metadata()?.len());
        }
    }

    report.missing_snapshots = report.chunks.difference(&report.snapshots).copied().collect();
    report.orphan_snapshots = report.snapshots.difference(&report.chunks).copied().collect();
    if let Some(&last) = report.chunks.iter().next_back() {
        report.gaps = (0..=last).filter(|c| !report.chunks.contains(c)).collect();
    }

    let mut frames = 0u64;
    let mut countable = !report.chunks.is_empty();
    for chunk in report.chunks.clone() {
        let art = artifacts.remove(&chunk).unwrap_or_default();
        match (&art.index, art.image_count) {
            (Some(index), _) => {
                frames += check_index(chunk, index, art.data_len, &mut report.index_errors)?;
            }
            (None, Some(count)) => frames += count,
            (None, None) => countable = false,
        }
    }
    report.frames = countable.then_some(frames);
    Ok(report)
}

/// Split `000012.raw` into `(12, ".raw")`.
fn split_chunk_name(name: &str) -> Option<(i64, &str)> {
    if name.len() < 6 || !name.is_char_boundary(6) {
        return None;
    }
    let (digits, rest) = name.split_at(6);
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let chunk = digits.parse().ok()?;
    Some((chunk, rest))
}

fn count_pngs(dir: &Path) -> Result<u64> {
    let mut count = 0;
    for entry in std::fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))? {
        let path = entry?.path();
        if path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("png"))
            .unwrap_or(false)
        {
            count += 1;
        }
    }
    Ok(count)
}

fn read_format(dir: &Path) -> Result<Option<String>> {
    let path = dir.join(METADATA_FILE);
    if !path.is_file() {
        return Ok(None);
    }
    let raw = std::fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_slice(&raw)
        .map_err(|e| anyhow!("invalid metadata {}: {}", path.display(), e))?;
    Ok(value
        .get("format")
        .and_then(|f| f.as_str())
        .map(str::to_string))
}

fn check_index(
    chunk: i64,
    path: &Path,
    data_len: Option<u64>,
    errors: &mut Vec<String>,
) -> Result<u64> {
    let raw = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let entries: Vec<ChunkIndexEntry> = serde_json::from_slice(&raw)
        .map_err(|e| anyhow!("invalid chunk index {}: {}", path.display(), e))?;
    let mut last: Option<u64> = None;
    for entry in &entries {
        if let Some(prev) = last {
            if entry.sequence <= prev {
                errors.push(format!(
                    "chunk {}: sequence {} follows {}",
                    chunk, entry.sequence, prev
                ));
            }
        }
        last = Some(entry.sequence);
        if let Some(len) = data_len {
            if entry.offset + entry.len > len {
                errors.push(format!(
                    "chunk {}: frame {} ends at byte {} past chunk size {}",
                    chunk,
                    entry.sequence,
                    entry.offset + entry.len,
                    len
                ));
            }
        }
    }
    Ok(entries.len() as u64)
}
