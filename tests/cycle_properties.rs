//! The harvest-classify-rename-ledger layers working together across two
//! simulated cycles, without a browser: first run picks everything up, an
//! immediate rerun finds nothing new and needs no relay session.

use std::fs;
use std::path::PathBuf;

use chrono::{NaiveDate, NaiveDateTime};
use intel_ferry_rs::download::rename_to_record;
use intel_ferry_rs::harvest::{classify_row, HarvestCursor, QueuedRecord, RowSnapshot, RowVerdict};
use intel_ferry_rs::ledger::UploadLedger;

fn ts(s: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
}

fn row(name: &str, raw: &str) -> RowSnapshot {
    RowSnapshot {
        name: name.to_string(),
        raw_timestamp: raw.to_string(),
    }
}

/// One account's classification pass: queue qualifying rows, then advance the
/// cursor to the max queued timestamp.
fn classify_pass(
    rows: &[RowSnapshot],
    today: NaiveDate,
    cursor: &mut HarvestCursor,
) -> Vec<QueuedRecord> {
    let queued: Vec<QueuedRecord> = rows
        .iter()
        .filter_map(|snapshot| match classify_row(snapshot, today, cursor) {
            RowVerdict::Queued(record) => Some(record),
            _ => None,
        })
        .collect();
    for record in &queued {
        cursor.advance_to(record.created_at);
    }
    queued
}

#[test]
fn first_cycle_harvests_uploads_and_ledgers_everything() {
    let workspace = tempfile::tempdir().unwrap();
    let download_dir = workspace.path().join("downloads");
    fs::create_dir_all(&download_dir).unwrap();
    let ledger_path = workspace.path().join("uploaded_relay_files.txt");

    let today = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
    let account1_rows = vec![
        row("morning brief", "2024-01-01 08:30:00"),
        row("incident report", "2024-01-01 09:45:00"),
        row("yesterday leftover", "2023-12-31 22:00:00"),
    ];
    let account2_rows = vec![row("old bulletin", "2023-12-30 10:00:00")];

    let mut cursor1 = HarvestCursor::default();
    let mut cursor2 = HarvestCursor::default();
    let queued1 = classify_pass(&account1_rows, today, &mut cursor1);
    let queued2 = classify_pass(&account2_rows, today, &mut cursor2);
    assert_eq!(queued1.len(), 2);
    assert!(queued2.is_empty());

    // each queued record's raw download lands in the watched directory and is
    // renamed to its record timestamp
    let mut artifacts: Vec<PathBuf> = Vec::new();
    for (i, record) in queued1.iter().enumerate() {
        let raw = download_dir.join(format!("export_{i}.docx"));
        fs::write(&raw, b"payload").unwrap();
        artifacts.push(rename_to_record(&raw, &record.created_at).unwrap());
    }
    let names: Vec<&str> = artifacts
        .iter()
        .map(|p| p.file_name().unwrap().to_str().unwrap())
        .collect();
    assert_eq!(
        names,
        vec!["2024-01-01_08-30-00.docx", "2024-01-01_09-45-00.docx"]
    );

    // relay pass: empty ledger lets both through, then records them
    let mut ledger = UploadLedger::load(&ledger_path).unwrap();
    let residual = ledger.filter_new(&artifacts);
    assert_eq!(residual.len(), 2);
    for name in &names {
        ledger.record(*name);
    }
    ledger.rewrite().unwrap();

    let persisted = fs::read_to_string(&ledger_path).unwrap();
    let lines: Vec<&str> = persisted.lines().collect();
    assert_eq!(lines.len(), 2);
    for name in &names {
        assert!(lines.contains(name));
    }
}

#[test]
fn immediate_rerun_finds_nothing_and_skips_the_relay() {
    let workspace = tempfile::tempdir().unwrap();
    let ledger_path = workspace.path().join("uploaded_relay_files.txt");

    let today = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
    let rows = vec![
        row("morning brief", "2024-01-01 08:30:00"),
        row("incident report", "2024-01-01 09:45:00"),
    ];

    // first cycle
    let mut cursor = HarvestCursor::default();
    let queued = classify_pass(&rows, today, &mut cursor);
    assert_eq!(queued.len(), 2);
    assert_eq!(cursor.last_seen(), Some(ts("2024-01-01 09:45:00")));

    let mut ledger = UploadLedger::load(&ledger_path).unwrap();
    ledger.record("2024-01-01_08-30-00.docx");
    ledger.record("2024-01-01_09-45-00.docx");
    ledger.rewrite().unwrap();

    // rerun with identical rows: the cursor filters every row out
    let queued_again = classify_pass(&rows, today, &mut cursor);
    assert!(queued_again.is_empty());

    // and even if the same artifacts reappeared, the reloaded ledger leaves an
    // empty residual set, so no relay session would be opened
    let reloaded = UploadLedger::load(&ledger_path).unwrap();
    let artifacts = vec![
        PathBuf::from("/tmp/2024-01-01_08-30-00.docx"),
        PathBuf::from("/tmp/2024-01-01_09-45-00.docx"),
    ];
    assert!(reloaded.filter_new(&artifacts).is_empty());
}

#[test]
fn later_record_same_day_is_picked_up_by_the_next_cycle() {
    let today = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
    let mut cursor = HarvestCursor::default();

    let first = vec![row("morning brief", "2024-01-01 08:30:00")];
    assert_eq!(classify_pass(&first, today, &mut cursor).len(), 1);

    let second = vec![
        row("morning brief", "2024-01-01 08:30:00"),
        row("noon update", "2024-01-01 12:00:00"),
    ];
    let queued = classify_pass(&second, today, &mut cursor);
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].name, "noon update");
    assert_eq!(cursor.last_seen(), Some(ts("2024-01-01 12:00:00")));
}
