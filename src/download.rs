//! Download completion detection over a watched directory.
//!
//! The portal offers no completion callback, so each triggered download is
//! observed at the filesystem level: snapshot the directory before the click,
//! then poll for a newcomer that no longer carries the browser's in-progress
//! marker extension. Completed files are renamed to their record timestamp so
//! artifacts sort chronologically and collide predictably.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::NaiveDateTime;
use log::{debug, info, warn};

use crate::error::Result;
use crate::CancelFlag;

/// Chrome writes partial downloads under this extension until complete.
const PARTIAL_MARKER: &str = ".crdownload";

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);
const POLL_INTERVAL: Duration = Duration::from_secs(1);
const COLLISION_CEILING: u32 = 100;

/// A completed, renamed download awaiting relay.
#[derive(Debug, Clone)]
pub struct DownloadedArtifact {
    pub recorded_at: NaiveDateTime,
    pub path: PathBuf,
}

impl DownloadedArtifact {
    pub fn file_name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }
}

/// Names currently present in the download directory.
pub fn snapshot_dir(dir: &Path) -> Result<HashSet<String>> {
    let mut names = HashSet::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            names.insert(name.to_string());
        }
    }
    Ok(names)
}

/// Split the newcomers since `before` into completed files and in-progress markers.
fn split_newcomers(before: &HashSet<String>, current: &HashSet<String>) -> (Vec<String>, Vec<String>) {
    let mut completed = Vec::new();
    let mut in_progress = Vec::new();
    for name in current.difference(before) {
        if name.ends_with(PARTIAL_MARKER) {
            in_progress.push(name.clone());
        } else {
            completed.push(name.clone());
        }
    }
    completed.sort();
    in_progress.sort();
    (completed, in_progress)
}

/// Wait for one new completed file to appear in `dir`.
///
/// Returns `None` on timeout or cancellation; the caller treats that as a
/// failed row and moves on.
pub async fn wait_for_new_file(
    dir: &Path,
    before: &HashSet<String>,
    cancel: &CancelFlag,
) -> Result<Option<PathBuf>> {
    let deadline = Instant::now() + DOWNLOAD_TIMEOUT;
    let mut announced_partial = false;

    while Instant::now() < deadline {
        if cancel.is_cancelled() {
            debug!("download wait abandoned: stop requested");
            return Ok(None);
        }

        let current = snapshot_dir(dir)?;
        let (completed, in_progress) = split_newcomers(before, &current);

        if let Some(name) = completed.first() {
            if completed.len() > 1 {
                warn!(
                    "{} new files appeared for one download trigger, taking {name}",
                    completed.len()
                );
            }
            info!("download complete: {name}");
            return Ok(Some(dir.join(name)));
        }

        if !in_progress.is_empty() && !announced_partial {
            debug!("download in progress: {}", in_progress.join(", "));
            announced_partial = true;
        }

        thirtyfour::support::sleep(POLL_INTERVAL).await;
    }

    warn!(
        "no completed download within {}s (watched {})",
        DOWNLOAD_TIMEOUT.as_secs(),
        dir.display()
    );
    Ok(None)
}

/// Filesystem-safe rendition of a record timestamp, e.g. `2024-01-01_10-00-00`.
pub fn artifact_stem(recorded_at: &NaiveDateTime) -> String {
    recorded_at
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
        .replace(':', "-")
        .replace(' ', "_")
}

/// Rename a completed download to its record timestamp, keeping the original
/// extension and suffixing `_1`, `_2`, ... on collision. Past the collision
/// ceiling the original name is kept rather than looping forever.
pub fn rename_to_record(downloaded: &Path, recorded_at: &NaiveDateTime) -> Result<PathBuf> {
    let dir = downloaded.parent().unwrap_or_else(|| Path::new("."));
    let stem = artifact_stem(recorded_at);
    let ext = downloaded
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{e}"))
        .unwrap_or_default();

    let mut target = dir.join(format!("{stem}{ext}"));
    let mut suffix = 0u32;
    while target.exists() {
        suffix += 1;
        if suffix > COLLISION_CEILING {
            warn!(
                "gave up renaming {} after {} collisions, keeping original name",
                downloaded.display(),
                COLLISION_CEILING
            );
            return Ok(downloaded.to_path_buf());
        }
        target = dir.join(format!("{stem}_{suffix}{ext}"));
    }

    fs::rename(downloaded, &target)?;
    info!(
        "renamed {} -> {}",
        downloaded.display(),
        target.display()
    );
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    fn set(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn newcomer_with_partial_marker_is_not_complete() {
        let before = set(&["old.pdf"]);
        let current = set(&["old.pdf", "report.docx.crdownload"]);
        let (completed, in_progress) = split_newcomers(&before, &current);
        assert!(completed.is_empty());
        assert_eq!(in_progress, vec!["report.docx.crdownload"]);
    }

    #[test]
    fn completed_newcomer_is_picked_over_marker() {
        let before = set(&[]);
        let current = set(&["report.docx", "other.xlsx.crdownload"]);
        let (completed, _) = split_newcomers(&before, &current);
        assert_eq!(completed, vec!["report.docx"]);
    }

    #[test]
    fn preexisting_files_never_count_as_new() {
        let before = set(&["a.docx", "b.docx"]);
        let current = before.clone();
        let (completed, in_progress) = split_newcomers(&before, &current);
        assert!(completed.is_empty());
        assert!(in_progress.is_empty());
    }

    #[test]
    fn stem_replaces_unsafe_separators() {
        let stamp = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap();
        assert_eq!(artifact_stem(&stamp), "2024-01-01_10-00-00");
    }

    #[test]
    fn rename_uses_timestamp_and_keeps_extension() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("export (1).docx");
        fs::write(&raw, b"x").unwrap();

        let renamed = rename_to_record(&raw, &ts("2024-01-01 10:00:00")).unwrap();
        assert_eq!(
            renamed.file_name().unwrap().to_str().unwrap(),
            "2024-01-01_10-00-00.docx"
        );
        assert!(renamed.exists());
        assert!(!raw.exists());
    }

    #[test]
    fn rename_collision_appends_numeric_suffix() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("2024-01-01_10-00-00.txt"), b"first").unwrap();
        let raw = dir.path().join("download.txt");
        fs::write(&raw, b"second").unwrap();

        let renamed = rename_to_record(&raw, &ts("2024-01-01 10:00:00")).unwrap();
        assert_eq!(
            renamed.file_name().unwrap().to_str().unwrap(),
            "2024-01-01_10-00-00_1.txt"
        );
        // the first file is untouched
        assert_eq!(
            fs::read(dir.path().join("2024-01-01_10-00-00.txt")).unwrap(),
            b"first"
        );
    }

    #[test]
    fn rename_without_extension_still_works() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("blob");
        fs::write(&raw, b"x").unwrap();

        let renamed = rename_to_record(&raw, &ts("2024-02-03 04:05:06")).unwrap();
        assert_eq!(
            renamed.file_name().unwrap().to_str().unwrap(),
            "2024-02-03_04-05-06"
        );
    }

    #[test]
    fn rename_past_ceiling_keeps_original_name() {
        let dir = tempfile::tempdir().unwrap();
        let stamp = ts("2024-01-01 10:00:00");
        fs::write(dir.path().join("2024-01-01_10-00-00.txt"), b"0").unwrap();
        for n in 1..=100 {
            fs::write(dir.path().join(format!("2024-01-01_10-00-00_{n}.txt")), b"x").unwrap();
        }
        let raw = dir.path().join("download.txt");
        fs::write(&raw, b"y").unwrap();

        let kept = rename_to_record(&raw, &stamp).unwrap();
        assert_eq!(kept, raw);
        assert!(raw.exists());
    }
}
