//! Harvesting new records out of the unreceived-records grid.
//!
//! The grid lives inside a nested frame and is rendered by jqGrid, which
//! drops ids and classes often enough that frame, table and row discovery all
//! cascade through fallbacks. Row classification against the high-water-mark
//! cursor is pure so the qualification rule is testable without a browser:
//! a row qualifies iff it is dated today and sits strictly past the cursor.
//! The cursor lives in memory only; a restart re-scans today and leaves
//! duplicate suppression to the upload ledger.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{Local, NaiveDate, NaiveDateTime};
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use thirtyfour::{By, WebDriver, WebElement};

use crate::download::{
    artifact_stem, rename_to_record, snapshot_dir, wait_for_new_file, DownloadedArtifact,
};
use crate::error::{FerryError, Result};
use crate::selector::{
    click_or_script, resolve, resolve_or_scan, FallbackScan, FloorPolicy, Locator, Scope,
    ScoreHints,
};
use crate::session::{records_frame_id, PortalSession, GATE_LINK_ID};
use crate::CancelFlag;

/// Grid layout: 0-indexed record name and creation timestamp columns.
const NAME_CELL: usize = 5;
const TIMESTAMP_CELL: usize = 7;
/// Rows with fewer cells than this are chrome, not data.
const MIN_DATA_CELLS: usize = 8;

const PRIMARY_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const ALTERNATE_FORMATS: [&str; 2] = ["%Y/%m/%d %H:%M:%S", "%m/%d/%Y %H:%M:%S"];
const DATE_ONLY_FORMAT: &str = "%Y-%m-%d";

static TABLE_LADDER: Lazy<Vec<Locator>> = Lazy::new(|| {
    vec![
        Locator::present(By::Css("#gridTable"), "grid table by id"),
        Locator::present(By::Css("table.ui-jqgrid-btable"), "grid table by body class"),
        Locator::present(By::Css("table[id*='grid']"), "table with grid id fragment"),
        Locator::present(By::Css("table[class*='jqgrid']"), "table with jqgrid class fragment"),
    ]
});

static DOWNLOAD_LADDER: Lazy<Vec<Locator>> = Lazy::new(|| {
    vec![Locator::present(
        By::XPath(".//a[contains(@onclick,'downloadfiles')]"),
        "download link by click hook",
    )]
});

static DOWNLOAD_SCAN: FallbackScan = FallbackScan {
    tag: "a",
    hints: ScoreHints {
        strong_hook: Some("downloadfiles"),
        keywords: &["下载"],
        weak_hooks: &["download"],
        style_marks: &[("color:blue", 20), ("cursor:pointer", 15)],
        clickable_without_href: 10,
    },
};

/// Highest record timestamp already queued this process. Everything at or
/// below it is considered harvested.
#[derive(Debug, Default, Clone)]
pub struct HarvestCursor {
    last_seen: Option<NaiveDateTime>,
}

impl HarvestCursor {
    pub fn last_seen(&self) -> Option<NaiveDateTime> {
        self.last_seen
    }

    pub fn is_new(&self, stamp: NaiveDateTime, today: NaiveDate) -> bool {
        stamp.date() == today && self.last_seen.map_or(true, |seen| stamp > seen)
    }

    pub fn advance_to(&mut self, stamp: NaiveDateTime) {
        if self.last_seen.map_or(true, |seen| stamp > seen) {
            self.last_seen = Some(stamp);
        }
    }
}

/// A grid row that qualified for download.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedRecord {
    pub created_at: NaiveDateTime,
    pub name: String,
}

/// Cell data pulled out of one candidate row.
#[derive(Debug, Clone)]
pub struct RowSnapshot {
    pub name: String,
    pub raw_timestamp: String,
}

#[derive(Debug, PartialEq)]
pub enum RowVerdict {
    Queued(QueuedRecord),
    NotToday,
    AlreadySeen,
    Unparsable,
}

/// Parse a grid timestamp. The primary format covers the normal rendering;
/// the alternates cover exports seen from older deployments. Date-only values
/// are taken as midnight.
pub fn parse_record_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let trimmed = raw.trim();
    if trimmed.chars().count() < 10 || !trimmed.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }
    if let Ok(stamp) = NaiveDateTime::parse_from_str(trimmed, PRIMARY_FORMAT) {
        return Some(stamp);
    }
    for format in ALTERNATE_FORMATS {
        if let Ok(stamp) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(stamp);
        }
    }
    NaiveDate::parse_from_str(trimmed, DATE_ONLY_FORMAT)
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
}

pub fn classify_row(snapshot: &RowSnapshot, today: NaiveDate, cursor: &HarvestCursor) -> RowVerdict {
    let Some(stamp) = parse_record_timestamp(&snapshot.raw_timestamp) else {
        return RowVerdict::Unparsable;
    };
    if stamp.date() != today {
        return RowVerdict::NotToday;
    }
    if !cursor.is_new(stamp, today) {
        return RowVerdict::AlreadySeen;
    }
    RowVerdict::Queued(QueuedRecord {
        created_at: stamp,
        name: snapshot.name.clone(),
    })
}

pub fn summarize_dates(stamps: &[NaiveDateTime]) -> BTreeMap<NaiveDate, usize> {
    let mut by_date = BTreeMap::new();
    for stamp in stamps {
        *by_date.entry(stamp.date()).or_insert(0) += 1;
    }
    by_date
}

pub fn sidecar_file_name(account_label: &str, created_at: &NaiveDateTime) -> String {
    format!("intel_{account_label}_{}.txt", artifact_stem(created_at))
}

/// Audit note written before the download is even triggered, so a record that
/// later fails to download still leaves a trace.
pub fn write_sidecar(dir: &Path, account_label: &str, record: &QueuedRecord) -> Result<PathBuf> {
    let path = dir.join(sidecar_file_name(account_label, &record.created_at));
    let content = format!(
        "created_at: {}\nname: {}\n",
        record.created_at.format(PRIMARY_FORMAT),
        record.name
    );
    fs::write(&path, content)?;
    Ok(path)
}

#[derive(Debug, Default)]
pub struct HarvestOutcome {
    pub artifacts: Vec<DownloadedArtifact>,
    pub rows_seen: usize,
    pub rows_queued: usize,
    pub failed_downloads: usize,
}

/// Walk the unreceived-records grid and download everything new.
///
/// Row-level problems (unparsable timestamp, timed-out download) are logged
/// and skipped; only frame or table discovery failing aborts the pass.
pub async fn harvest_new_records(
    session: &PortalSession,
    cursor: &mut HarvestCursor,
    download_dir: &Path,
    cancel: &CancelFlag,
) -> Result<HarvestOutcome> {
    let driver = session.driver();
    enter_records_frame(driver).await?;
    let outcome = harvest_inside_frame(
        driver,
        session.label(),
        cursor,
        download_dir,
        Local::now().date_naive(),
        cancel,
    )
    .await;
    if let Err(e) = driver.enter_default_frame().await {
        warn!("could not leave records frame: {e}");
    }
    outcome
}

async fn enter_records_frame(driver: &WebDriver) -> Result<()> {
    let scope = Scope::Page(driver);
    let ladder = [
        Locator::present(By::Id(records_frame_id()), "records frame by id"),
        Locator::present(
            By::XPath(format!("//iframe[contains(@id,'{GATE_LINK_ID}')]")),
            "records frame by id fragment",
        ),
    ];

    if let Some(frame) = resolve(&scope, &ladder, Duration::from_secs(5)).await? {
        frame.enter_frame().await?;
        debug!("entered records frame");
        return Ok(());
    }

    // Enumerate what is actually there before the delayed retry.
    let frames = driver.find_all(By::Tag("iframe")).await?;
    let mut ids = Vec::new();
    for frame in &frames {
        if let Ok(Some(id)) = frame.attr("id").await {
            ids.push(id);
        }
    }
    warn!(
        "records frame not found among {} iframe(s) [{}], retrying after delay",
        frames.len(),
        ids.join(", ")
    );
    thirtyfour::support::sleep(Duration::from_secs(5)).await;

    match resolve(&scope, &ladder, Duration::from_secs(5)).await? {
        Some(frame) => {
            frame.enter_frame().await?;
            debug!("entered records frame after delayed retry");
            Ok(())
        }
        None => Err(FerryError::RecordsFrameMissing),
    }
}

async fn locate_grid_table(driver: &WebDriver) -> Result<WebElement> {
    let scope = Scope::Page(driver);
    if let Some(table) = resolve(&scope, &TABLE_LADDER, Duration::from_secs(5)).await? {
        return Ok(table);
    }

    // Last resort: any table whose id or class mentions the grid.
    let tables = driver.find_all(By::Tag("table")).await?;
    debug!("table ladder empty, scanning {} table(s)", tables.len());
    for table in tables {
        let id = table.attr("id").await.ok().flatten().unwrap_or_default();
        let class = table.attr("class").await.ok().flatten().unwrap_or_default();
        if id.to_lowercase().contains("grid") || class.to_lowercase().contains("jqgrid") {
            debug!("accepting table id='{id}' class='{class}'");
            return Ok(table);
        }
    }
    Err(FerryError::RecordsTableMissing)
}

async fn has_class(row: &WebElement, marker: &str) -> bool {
    match row.attr("class").await {
        Ok(Some(class)) => class.contains(marker),
        _ => false,
    }
}

/// Data rows carry the jqGrid body-row class and never the header-row class.
/// When the class filter comes up empty the cell count decides instead.
async fn collect_data_rows(table: &WebElement) -> Result<Vec<WebElement>> {
    let mut rows = Vec::new();
    for row in table.find_all(By::Css("tr.jqgrow")).await? {
        if !has_class(&row, "jqgfirstrow").await {
            rows.push(row);
        }
    }

    if rows.is_empty() {
        for row in table.find_all(By::XPath(".//tr[contains(@class,'jqgrow')]")).await? {
            if !has_class(&row, "jqgfirstrow").await {
                rows.push(row);
            }
        }
    }

    if rows.is_empty() {
        debug!("class-based row filter empty, falling back to cell count");
        for row in table.find_all(By::Tag("tr")).await? {
            if has_class(&row, "jqgfirstrow").await {
                continue;
            }
            if row.find_all(By::Tag("td")).await?.len() >= MIN_DATA_CELLS {
                rows.push(row);
            }
        }
    }

    Ok(rows)
}

async fn harvest_inside_frame(
    driver: &WebDriver,
    account_label: &str,
    cursor: &mut HarvestCursor,
    download_dir: &Path,
    today: NaiveDate,
    cancel: &CancelFlag,
) -> Result<HarvestOutcome> {
    let table = locate_grid_table(driver).await?;
    let rows = collect_data_rows(&table).await?;
    if rows.is_empty() {
        return Err(FerryError::NoDataRows);
    }
    info!("{account_label}: {} data row(s) in grid", rows.len());

    if let Some(first) = rows.first() {
        let mut cells = Vec::new();
        for cell in first.find_all(By::Tag("td")).await? {
            cells.push(cell.text().await.unwrap_or_default());
        }
        debug!("first row sample: {}", cells.join(" | "));
    }

    let mut outcome = HarvestOutcome {
        rows_seen: rows.len(),
        ..Default::default()
    };

    let mut candidates: Vec<(WebElement, RowSnapshot)> = Vec::new();
    for row in rows {
        let cells = row.find_all(By::Tag("td")).await?;
        if cells.len() <= TIMESTAMP_CELL {
            debug!("skipping row with only {} cell(s)", cells.len());
            continue;
        }
        let snapshot = RowSnapshot {
            name: cells[NAME_CELL].text().await.unwrap_or_default(),
            raw_timestamp: cells[TIMESTAMP_CELL].text().await.unwrap_or_default(),
        };
        candidates.push((row, snapshot));
    }

    let stamps: Vec<NaiveDateTime> = candidates
        .iter()
        .filter_map(|(_, snapshot)| parse_record_timestamp(&snapshot.raw_timestamp))
        .collect();
    let by_date = summarize_dates(&stamps);
    let summary: Vec<String> = by_date.iter().map(|(d, n)| format!("{d}: {n}")).collect();
    info!("{account_label}: row dates [{}]", summary.join(", "));

    let mut queue: Vec<(WebElement, QueuedRecord)> = Vec::new();
    for (row, snapshot) in candidates {
        match classify_row(&snapshot, today, cursor) {
            RowVerdict::Queued(record) => {
                info!(
                    "{account_label}: new record '{}' at {}",
                    record.name, record.created_at
                );
                if let Err(e) = write_sidecar(Path::new("."), account_label, &record) {
                    warn!("sidecar write failed for '{}': {e}", record.name);
                }
                queue.push((row, record));
            }
            RowVerdict::NotToday => debug!("row '{}' not dated today", snapshot.raw_timestamp),
            RowVerdict::AlreadySeen => debug!("row '{}' already harvested", snapshot.raw_timestamp),
            RowVerdict::Unparsable => {
                warn!(
                    "{account_label}: unparsable timestamp '{}', skipping row",
                    snapshot.raw_timestamp
                )
            }
        }
    }

    if queue.is_empty() {
        if let Some(latest) = by_date.keys().max() {
            info!("{account_label}: nothing new today, latest row date is {latest}");
        }
        return Ok(outcome);
    }
    outcome.rows_queued = queue.len();

    for (row, record) in &queue {
        if cancel.is_cancelled() {
            warn!("{account_label}: stop requested, abandoning remaining downloads");
            break;
        }
        match download_row(driver, row, record, download_dir, cancel).await {
            Ok(Some(artifact)) => outcome.artifacts.push(artifact),
            Ok(None) => outcome.failed_downloads += 1,
            Err(e) => {
                warn!("{account_label}: download of '{}' failed: {e}", record.name);
                outcome.failed_downloads += 1;
            }
        }
        thirtyfour::support::sleep(Duration::from_secs(2)).await;
    }

    for (_, record) in &queue {
        cursor.advance_to(record.created_at);
    }
    debug!("{account_label}: cursor now at {:?}", cursor.last_seen());

    info!(
        "{account_label}: {} downloaded, {} failed, {} queued",
        outcome.artifacts.len(),
        outcome.failed_downloads,
        outcome.rows_queued
    );
    Ok(outcome)
}

async fn download_row(
    driver: &WebDriver,
    row: &WebElement,
    record: &QueuedRecord,
    download_dir: &Path,
    cancel: &CancelFlag,
) -> Result<Option<DownloadedArtifact>> {
    let scope = Scope::Within(row);
    let Some(hit) = resolve_or_scan(
        &scope,
        &DOWNLOAD_LADDER,
        Duration::from_secs(2),
        &DOWNLOAD_SCAN,
        FloorPolicy::BestEffort,
    )
    .await?
    else {
        warn!("no download control in row for '{}'", record.name);
        return Ok(None);
    };

    let before = snapshot_dir(download_dir)?;
    click_or_script(driver, &hit.element).await?;
    debug!("download triggered for '{}'", record.name);

    match wait_for_new_file(download_dir, &before, cancel).await? {
        Some(path) => {
            let renamed = rename_to_record(&path, &record.created_at)?;
            Ok(Some(DownloadedArtifact {
                recorded_at: record.created_at,
                path: renamed,
            }))
        }
        None => Ok(None),
    }
}
