//! One full harvest-and-relay cycle, plus the entry points the control
//! surface calls: `run_one_cycle` and `teardown`.
//!
//! Account passes are isolated failure domains: each gets a fresh browser
//! session that is closed on every path before the next account starts, and a
//! failed pass is absorbed into the report instead of propagating. The cycle
//! counts as successful when the relay stage completes and made progress on
//! whatever was pending; harvest-side failures only show up in the logs and
//! counts. Every cycle lands in the history journal, abandoned ones included.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::Path;
use std::time::Duration;

use chrono::Local;
use log::{debug, error, info, warn};

use crate::config::{AccountCredential, AppConfig};
use crate::download::DownloadedArtifact;
use crate::error::Result;
use crate::harvest::{harvest_new_records, HarvestCursor, HarvestOutcome};
use crate::ledger::{UploadLedger, LEDGER_FILE};
use crate::relay;
use crate::session::{probe_portal, PortalSession, PORTAL_LOGIN_URL};
use crate::CancelFlag;

pub const CYCLE_HISTORY_FILE: &str = "cycle_history.csv";

/// What one cycle did, for the log bracket and the history journal.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub harvested: usize,
    pub uploaded: usize,
    pub upload_failed: usize,
    pub success: bool,
}

/// State carried across cycles within one process. Each account keeps its own
/// harvest cursor; a restart clears them and the upload ledger takes over
/// duplicate suppression.
#[derive(Debug, Default)]
pub struct PipelineState {
    cursors: HashMap<&'static str, HarvestCursor>,
}

impl PipelineState {
    pub fn cursor_for(&mut self, label: &'static str) -> &mut HarvestCursor {
        self.cursors.entry(label).or_default()
    }
}

/// Run one harvest-all-accounts-then-relay pass.
pub async fn run_one_cycle(
    cfg: &AppConfig,
    state: &mut PipelineState,
    cancel: &CancelFlag,
) -> CycleReport {
    let mut report = CycleReport::default();

    let download_dir = match cfg.ensure_download_dir() {
        Ok(dir) => dir,
        Err(e) => {
            error!("cannot prepare download directory: {e}");
            journal(&report);
            return report;
        }
    };

    if !cfg.has_primary_account() {
        error!("primary portal account not configured, cycle abandoned");
        journal(&report);
        return report;
    }
    let accounts = cfg.accounts();

    let mut artifacts: Vec<DownloadedArtifact> = Vec::new();
    for account in &accounts {
        if cancel.is_cancelled() {
            warn!("stop requested, skipping remaining account passes");
            break;
        }
        let cursor = state.cursor_for(account.label);
        match harvest_account(cfg, &download_dir, account, cursor, cancel).await {
            Ok(outcome) => {
                info!(
                    "{}: pass complete, {} new artifact(s)",
                    account.label,
                    outcome.artifacts.len()
                );
                for artifact in &outcome.artifacts {
                    debug!("{}: harvested {}", account.label, artifact.file_name());
                }
                artifacts.extend(outcome.artifacts);
            }
            Err(e) => {
                error!("{}: account pass failed: {e}", account.label);
                if !e.is_session_fatal() {
                    warn!("{}: failure was not page-level, later stages may hit it too", account.label);
                }
            }
        }
        thirtyfour::support::sleep(Duration::from_secs(2)).await;
    }
    report.harvested = artifacts.len();

    match relay_stage(cfg, &download_dir, &artifacts, cancel).await {
        Ok(outcome) => {
            report.uploaded = outcome.uploaded;
            report.upload_failed = outcome.failed;
            report.success = outcome.is_success();
            if !report.success {
                warn!(
                    "relay pass moved nothing: {} file(s) still pending",
                    outcome.failed
                );
            }
        }
        Err(e) => {
            error!("relay stage failed: {e}");
        }
    }

    journal(&report);
    report
}

fn journal(report: &CycleReport) {
    if let Err(e) = append_cycle_history(Path::new(CYCLE_HISTORY_FILE), report) {
        warn!("could not append cycle history: {e}");
    }
}

/// Request an orderly stop. Takes effect at the next boundary check; an
/// operation already in flight finishes first.
pub fn teardown(cancel: &CancelFlag) {
    info!("teardown requested");
    cancel.cancel();
}

/// One account's full pass with a guaranteed session close, success or not.
async fn harvest_account(
    cfg: &AppConfig,
    download_dir: &Path,
    account: &AccountCredential,
    cursor: &mut HarvestCursor,
    cancel: &CancelFlag,
) -> Result<HarvestOutcome> {
    probe_portal("intelligence portal", PORTAL_LOGIN_URL).await;
    let mut session = PortalSession::open(cfg, download_dir, account.label).await?;
    let outcome = drive_account(&mut session, account, cursor, download_dir, cancel).await;
    if let Err(e) = session.close().await {
        warn!("{}: session close failed: {e}", account.label);
    }
    outcome
}

async fn drive_account(
    session: &mut PortalSession,
    account: &AccountCredential,
    cursor: &mut HarvestCursor,
    download_dir: &Path,
    cancel: &CancelFlag,
) -> Result<HarvestOutcome> {
    session.login(account).await?;
    session.open_unreceived_gate().await?;
    session.delegate();
    harvest_new_records(session, cursor, download_dir, cancel).await
}

async fn relay_stage(
    cfg: &AppConfig,
    download_dir: &Path,
    artifacts: &[DownloadedArtifact],
    cancel: &CancelFlag,
) -> Result<relay::RelayOutcome> {
    let mut ledger = UploadLedger::load(LEDGER_FILE)?;
    relay::push_artifacts(cfg, download_dir, artifacts, &mut ledger, cancel).await
}

pub fn log_cycle_start(cycle: u64) {
    info!("==================== cycle {cycle} started ====================");
}

pub fn log_cycle_end(cycle: u64, report: &CycleReport) {
    info!(
        "cycle {cycle} finished: success={} harvested={} uploaded={} upload_failed={}",
        report.success, report.harvested, report.uploaded, report.upload_failed
    );
    info!("==================== cycle {cycle} ended ======================");
}

/// Append one row per cycle, creating the file with a header when absent.
pub fn append_cycle_history(path: &Path, report: &CycleReport) -> Result<()> {
    let write_header = !path.exists();
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);
    if write_header {
        writer.write_record(["finished_at", "harvested", "uploaded", "upload_failed", "success"])?;
    }
    writer.write_record([
        Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        report.harvested.to_string(),
        report.uploaded.to_string(),
        report.upload_failed.to_string(),
        report.success.to_string(),
    ])?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;

    #[test]
    fn history_gets_header_once_and_a_row_per_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cycle_history.csv");

        let report = CycleReport { harvested: 2, uploaded: 2, upload_failed: 0, success: true };
        append_cycle_history(&path, &report).unwrap();
        append_cycle_history(&path, &report).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("finished_at,"));
        assert!(lines[1].ends_with(",2,2,0,true"));
    }

    #[test]
    fn accounts_get_independent_cursors() {
        let mut state = PipelineState::default();
        let stamp =
            NaiveDateTime::parse_from_str("2024-01-01 10:00:00", "%Y-%m-%d %H:%M:%S").unwrap();
        state.cursor_for("account1").advance_to(stamp);
        assert_eq!(state.cursor_for("account1").last_seen(), Some(stamp));
        assert_eq!(state.cursor_for("account2").last_seen(), None);
    }
}
