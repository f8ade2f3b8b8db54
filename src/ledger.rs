//! Persisted set of filenames already relayed to the destination chat.
//!
//! The ledger is a plain newline-delimited file in the working directory. A name
//! present here is never uploaded again, even across process restarts. The file
//! is rewritten in full after each relay pass; a crash mid-pass can therefore
//! lose names recorded earlier in that same pass, which costs a re-upload next
//! cycle and nothing else.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::error::Result;

pub const LEDGER_FILE: &str = "uploaded_relay_files.txt";

#[derive(Debug)]
pub struct UploadLedger {
    path: PathBuf,
    names: BTreeSet<String>,
}

impl UploadLedger {
    /// Load the ledger from `path`. A missing file is an empty ledger, not an error.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let names = match fs::read_to_string(&path) {
            Ok(content) => content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no ledger at {}, starting empty", path.display());
                BTreeSet::new()
            }
            Err(e) => return Err(e.into()),
        };
        info!("ledger loaded: {} previously uploaded file(s)", names.len());
        Ok(UploadLedger { path, names })
    }

    pub fn contains(&self, file_name: &str) -> bool {
        self.names.contains(file_name)
    }

    /// Record a name in memory. Not durable until [`UploadLedger::rewrite`] runs.
    pub fn record(&mut self, file_name: impl Into<String>) {
        self.names.insert(file_name.into());
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Keep only the paths whose file name is not yet in the ledger.
    pub fn filter_new<'a, P: AsRef<Path>>(&self, paths: &'a [P]) -> Vec<&'a P> {
        paths
            .iter()
            .filter(|p| match p.as_ref().file_name().and_then(|n| n.to_str()) {
                Some(name) => !self.contains(name),
                None => false,
            })
            .collect()
    }

    /// Persist the full accumulated set, replacing the file contents.
    pub fn rewrite(&self) -> Result<()> {
        let mut content = self
            .names
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n");
        if !content.is_empty() {
            content.push('\n');
        }
        fs::write(&self.path, content)?;
        debug!("ledger rewritten with {} name(s)", self.names.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_empty_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = UploadLedger::load(dir.path().join("ledger.txt")).unwrap();
        assert!(ledger.is_empty());
    }

    #[test]
    fn round_trip_preserves_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.txt");

        let mut ledger = UploadLedger::load(&path).unwrap();
        ledger.record("2024-01-01_10-00-00.docx");
        ledger.record("2024-01-01_10-05-00.xlsx");
        ledger.rewrite().unwrap();

        let reloaded = UploadLedger::load(&path).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert!(reloaded.contains("2024-01-01_10-00-00.docx"));
        assert!(!reloaded.contains("2024-01-02_09-00-00.docx"));
    }

    #[test]
    fn blank_lines_are_ignored_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.txt");
        fs::write(&path, "a.docx\n\n  \nb.zip\n").unwrap();

        let ledger = UploadLedger::load(&path).unwrap();
        assert_eq!(ledger.len(), 2);
        assert!(ledger.contains("b.zip"));
    }

    #[test]
    fn filter_new_drops_already_uploaded() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = UploadLedger::load(dir.path().join("ledger.txt")).unwrap();
        ledger.record("old.docx");

        let paths = vec![PathBuf::from("/tmp/old.docx"), PathBuf::from("/tmp/new.docx")];
        let residual = ledger.filter_new(&paths);
        assert_eq!(residual.len(), 1);
        assert_eq!(residual[0].file_name().unwrap(), "new.docx");
    }

    #[test]
    fn rewrite_replaces_stale_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.txt");
        fs::write(&path, "stale-entry-kept-in-memory.docx\n").unwrap();

        let mut ledger = UploadLedger::load(&path).unwrap();
        ledger.record("fresh.docx");
        ledger.rewrite().unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("stale-entry-kept-in-memory.docx"));
        assert!(content.contains("fresh.docx"));
    }
}
