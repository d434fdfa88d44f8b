//! Progress estimation.
//!
//! Three independent signals feed `RenderSupervisor`: a stdout line
//! parser for tools that print `Frame N (current/total)`, a completed
//! image-sequence file count, and a growth curve for tools that only
//! produce one file at the end (video container formats).

use std::path::Path;

/// A line of the form `Frame 12 (34/100)`. Returns `(current, total)`
/// when the line matches; `None` otherwise. Hand-parsed rather than via
/// the `regex` crate since this single fixed-prefix pattern doesn't
/// warrant the dependency, matching the original's own `str.index`
/// based parse in `LogMonitor._parse_progress_line`.
pub fn parse_frame_line(line: &str) -> Option<(u32, u32)> {
    let rest = line.trim().strip_prefix("Frame ")?;
    let open = rest.find('(')?;
    let close = rest.find(')')?;
    if close < open {
        return None;
    }
    let _frame_number: u32 = rest[..open].trim().parse().ok()?;
    let fraction = &rest[open + 1..close];
    let (current, total) = fraction.split_once('/')?;
    let current: u32 = current.trim().parse().ok()?;
    let total: u32 = total.trim().parse().ok()?;
    Some((current, total))
}

/// Exact match (after trimming) on the render tool's completion marker.
pub fn is_done_marker(line: &str) -> bool {
    line.trim() == "Done!"
}

/// Internal debug chatter the render tool emits on stdout alongside
/// useful output — filtered from the log sink rather than forwarded.
/// A small fixed set since the spec does not enumerate one and the
/// original monitored a log file, not stdout, for this signal.
const NOISE_PREFIXES: &[&str] = &["DEBUG:", "[internal]", "TRACE:"];

pub fn is_noise_line(line: &str) -> bool {
    let trimmed = line.trim_start();
    NOISE_PREFIXES.iter().any(|p| trimmed.starts_with(p))
}

/// Progress from a frame fraction, as a percentage.
pub fn frame_progress(current: u32, total: u32) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (current as f64 / total as f64) * 100.0
}

/// Heuristic progress for image-sequence output: the fraction of
/// expected frames already written to `output_dir`, capped at 99% (the
/// last frame is only counted once the tool reports `Done!`).
///
/// Counts files matching `<stem>_<NNNNN><ext>` directly under
/// `output_dir` and in its immediate subdirectories (the tool writes one
/// subdirectory per sub-composition when `createfolderforlayercomps` is
/// set); `frames_per_comp` is the expected per-subdirectory frame count,
/// and the denominator scales by the number of subdirectories that
/// actually hold matching files (at least 1, so a flat, uncomposited
/// output directory is unaffected).
pub fn image_sequence_progress(output_dir: &Path, stem: &str, frames_per_comp: u32) -> f64 {
    if frames_per_comp == 0 {
        return 0.0;
    }
    let (written, subdirs_with_files) = count_matching_files(output_dir, stem);
    let expected = frames_per_comp as u64 * subdirs_with_files.max(1) as u64;
    ((written as f64 / expected as f64) * 100.0).min(99.0)
}

/// Returns (matching file count across `dir` and its immediate
/// subdirectories, number of subdirectories that held at least one
/// match). Only one level deep: the tool never nests further.
fn count_matching_files(dir: &Path, stem: &str) -> (u64, u32) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return (0, 0);
    };

    let mut total = 0u64;
    let mut subdirs_with_files = 0u32;
    for entry in entries.filter_map(Result::ok) {
        let path = entry.path();
        if path.is_file() {
            if matches_frame_pattern(&path, stem) {
                total += 1;
            }
        } else if path.is_dir() {
            let sub_count = count_matching_files_flat(&path, stem);
            if sub_count > 0 {
                total += sub_count;
                subdirs_with_files += 1;
            }
        }
    }
    (total, subdirs_with_files)
}

fn count_matching_files_flat(dir: &Path, stem: &str) -> u64 {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .filter_map(Result::ok)
        .filter(|entry| entry.path().is_file() && matches_frame_pattern(&entry.path(), stem))
        .count() as u64
}

/// Matches `<stem>_<NNNNN><ext>`: the file's stem (name minus last
/// extension) must be `<stem>_` followed by one or more ASCII digits.
/// Hand-rolled rather than via the `regex` crate for the same reason as
/// `parse_frame_line`: a single fixed pattern doesn't warrant it.
fn matches_frame_pattern(path: &Path, stem: &str) -> bool {
    let Some(file_stem) = path.file_stem().and_then(|s| s.to_str()) else {
        return false;
    };
    let prefix = format!("{stem}_");
    match file_stem.strip_prefix(prefix.as_str()) {
        Some(digits) => !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()),
        None => false,
    }
}

/// Asymptotic growth curve for single-file video output, where no
/// frame count is observable: `90 * t / (t + 120)`, capped at 90% so
/// the remaining 10% is always attributed to the final `Done!` signal.
pub fn video_file_progress(elapsed_secs: f64) -> f64 {
    if elapsed_secs <= 0.0 {
        return 0.0;
    }
    (90.0 * elapsed_secs / (elapsed_secs + 120.0)).min(90.0)
}
