//! chunk_verify - offline checker for recorded region directories
//!
//! For each region directory this tool reports:
//! - chunk artifacts found and gaps in the chunk numbering
//! - rollover snapshots, missing or without a chunk
//! - frames listed by per-chunk indexes or per-frame images
//! - index entries out of sequence or past the end of their chunk
//!
//! Exits non-zero if any directory is incomplete.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use roi_recorder::{verify_region_dir, RegionDirReport};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(
    name = "chunk_verify",
    about = "Verify chunk files and snapshots of recorded regions"
)]
struct Args {
    /// Region directories to check
    #[arg(value_name = "DIR")]
    dirs: Vec<PathBuf>,

    /// Check every <BASE>_ROI_<i> directory next to BASE
    #[arg(long, value_name = "BASE")]
    base: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = Args::parse();
    let is_tty = std::io::stderr().is_terminal();
    let stdout_is_tty = std::io::stdout().is_terminal();
    let ui = ui::Ui::from_args(Some(&args.ui), is_tty, !stdout_is_tty);

    let mut dirs = args.dirs.clone();
    if let Some(base) = &args.base {
        let _stage = ui.stage("Find region directories");
        dirs.extend(region_dirs(base)?);
    }
    if dirs.is_empty() {
        return Err(anyhow!("no region directories given (pass DIR or --base)"));
    }

    let mut incomplete = 0;
    for dir in &dirs {
        let report = {
            let _stage = ui.stage(&format!("Verify {}", dir.display()));
            verify_region_dir(dir)?
        };
        print_report(&report, args.verbose);
        if !report.is_complete() {
            incomplete += 1;
        }
    }

    println!();
    if incomplete > 0 {
        return Err(anyhow!(
            "{} of {} region directories are incomplete",
            incomplete,
            dirs.len()
        ));
    }
    println!("chunk_verify: all {} region directories OK", dirs.len());
    Ok(())
}

fn region_dirs(base: &Path) -> Result<Vec<PathBuf>> {
    let parent = match base.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let prefix = format!(
        "{}_ROI_",
        base.file_name()
            .ok_or_else(|| anyhow!("invalid base path {}", base.display()))?
            .to_string_lossy()
    );
    let mut found: Vec<(usize, PathBuf)> = Vec::new();
    for entry in
        std::fs::read_dir(&parent).with_context(|| format!("failed to list {}", parent.display()))?
    {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(idx) = name.strip_prefix(&prefix).and_then(|s| s.parse().ok()) {
            if entry.file_type()?.is_dir() {
                found.push((idx, entry.path()));
            }
        }
    }
    found.sort();
    Ok(found.into_iter().map(|(_, path)| path).collect())
}

fn print_report(report: &RegionDirReport, verbose: bool) {
    let status = if report.is_complete() { "OK" } else { "INCOMPLETE" };
    println!("=== {} [{}] ===", report.path.display(), status);
    if let Some(format) = &report.format {
        println!("  format:    {}", format);
    }
    println!("  chunks:    {}", report.chunks.len());
    println!("  snapshots: {}", report.snapshots.len());
    match report.frames {
        Some(frames) => println!("  frames:    {}", frames),
        None => println!("  frames:    (not indexed)"),
    }
    if !report.gaps.is_empty() {
        println!("  missing chunks: {:?}", report.gaps);
    }
    if !report.missing_snapshots.is_empty() {
        println!("  chunks without snapshot: {:?}", report.missing_snapshots);
    }
    if !report.orphan_snapshots.is_empty() {
        println!("  snapshots without chunk: {:?}", report.orphan_snapshots);
    }
    for err in &report.index_errors {
        println!("  index: {}", err);
    }
    if verbose {
        println!("  chunk ids: {:?}", report.chunks);
    }
}
