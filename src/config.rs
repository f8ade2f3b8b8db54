//! On-disk configuration.
//!
//! `config.json` lives in the working directory. Every field has a default so
//! a partial or absent file still yields a runnable configuration; credentials
//! default to empty and are validated where they are used.

use std::fs;
use std::path::{Path, PathBuf};

use log::warn;
use serde::Deserialize;

use crate::error::Result;

pub const CONFIG_FILE: &str = "config.json";

/// How the browser session is brought up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    /// Fresh driver-managed browser.
    NewBrowser,
    /// Connect to an already-running browser through its debugger address.
    AttachExisting,
    /// Fresh browser without a window.
    Headless,
}

/// One source-portal login, read-only to the pipeline.
#[derive(Debug, Clone)]
pub struct AccountCredential {
    pub label: &'static str,
    pub principal: String,
    pub secret: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub portal_username: String,
    pub portal_password: String,
    pub portal_username2: String,
    pub portal_password2: String,
    pub relay_id_card: String,
    pub relay_password: String,
    pub relay_group_name: String,
    pub run_mode: RunMode,
    pub cycle_minutes: u64,
    pub download_path: PathBuf,
    pub log_level: String,
    pub webdriver_url: String,
    pub debugger_address: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            portal_username: String::new(),
            portal_password: String::new(),
            portal_username2: String::new(),
            portal_password2: String::new(),
            relay_id_card: String::new(),
            relay_password: String::new(),
            relay_group_name: "情指值班通知".to_string(),
            run_mode: RunMode::NewBrowser,
            cycle_minutes: 30,
            download_path: PathBuf::from("./downloads"),
            log_level: "info".to_string(),
            webdriver_url: "http://localhost:9515".to_string(),
            debugger_address: "127.0.0.1:9222".to_string(),
        }
    }
}

impl AppConfig {
    /// Load from `path`; an absent file yields the defaults.
    pub fn load(path: &Path) -> Result<AppConfig> {
        match fs::read_to_string(path) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("no {} found, running on defaults", path.display());
                Ok(AppConfig::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// The portal accounts usable this cycle. Each credential pair must be
    /// complete to count; a half-configured pair is dropped with a warning.
    pub fn accounts(&self) -> Vec<AccountCredential> {
        let mut out = Vec::new();

        match pair(&self.portal_username, &self.portal_password) {
            PairState::Complete => out.push(AccountCredential {
                label: "account1",
                principal: self.portal_username.clone(),
                secret: self.portal_password.clone(),
            }),
            PairState::Partial => warn!("primary account ignored: username and password must both be set"),
            PairState::Absent => {}
        }

        match pair(&self.portal_username2, &self.portal_password2) {
            PairState::Complete => out.push(AccountCredential {
                label: "account2",
                principal: self.portal_username2.clone(),
                secret: self.portal_password2.clone(),
            }),
            PairState::Partial => warn!("secondary account ignored: username and password must both be set"),
            PairState::Absent => {}
        }

        out
    }

    /// The primary account must be fully configured for a cycle to run.
    pub fn has_primary_account(&self) -> bool {
        matches!(
            pair(&self.portal_username, &self.portal_password),
            PairState::Complete
        )
    }

    pub fn relay_configured(&self) -> bool {
        !self.relay_id_card.is_empty() && !self.relay_password.is_empty()
    }

    /// Create the download directory if needed and return its absolute path.
    /// The browser needs an absolute path for its download preference.
    pub fn ensure_download_dir(&self) -> Result<PathBuf> {
        fs::create_dir_all(&self.download_path)?;
        Ok(fs::canonicalize(&self.download_path)?)
    }
}

enum PairState {
    Complete,
    Partial,
    Absent,
}

fn pair(principal: &str, secret: &str) -> PairState {
    match (principal.is_empty(), secret.is_empty()) {
        (false, false) => PairState::Complete,
        (true, true) => PairState::Absent,
        _ => PairState::Partial,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = AppConfig::load(&dir.path().join("config.json")).unwrap();
        assert_eq!(cfg.cycle_minutes, 30);
        assert_eq!(cfg.run_mode, RunMode::NewBrowser);
        assert_eq!(cfg.download_path, PathBuf::from("./downloads"));
        assert!(cfg.accounts().is_empty());
    }

    #[test]
    fn partial_file_keeps_given_values_and_defaults_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"portal_username": "alice", "portal_password": "pw", "cycle_minutes": 5}"#,
        )
        .unwrap();

        let cfg = AppConfig::load(&path).unwrap();
        assert_eq!(cfg.cycle_minutes, 5);
        assert_eq!(cfg.webdriver_url, "http://localhost:9515");
        assert_eq!(cfg.relay_group_name, "情指值班通知");
        let accounts = cfg.accounts();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].label, "account1");
    }

    #[test]
    fn run_mode_parses_kebab_case() {
        let cfg: AppConfig = serde_json::from_str(r#"{"run_mode": "attach-existing"}"#).unwrap();
        assert_eq!(cfg.run_mode, RunMode::AttachExisting);
        let cfg: AppConfig = serde_json::from_str(r#"{"run_mode": "headless"}"#).unwrap();
        assert_eq!(cfg.run_mode, RunMode::Headless);
    }

    #[test]
    fn half_configured_pair_is_dropped() {
        let cfg: AppConfig = serde_json::from_str(
            r#"{
                "portal_username": "a", "portal_password": "pw",
                "portal_username2": "b"
            }"#,
        )
        .unwrap();
        let accounts = cfg.accounts();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].label, "account1");
    }

    #[test]
    fn secondary_account_alone_does_not_satisfy_the_primary_requirement() {
        let cfg: AppConfig =
            serde_json::from_str(r#"{"portal_username2": "b", "portal_password2": "pb"}"#).unwrap();
        assert!(!cfg.has_primary_account());
        assert_eq!(cfg.accounts().len(), 1);

        let cfg: AppConfig =
            serde_json::from_str(r#"{"portal_username": "a", "portal_password": "pa"}"#).unwrap();
        assert!(cfg.has_primary_account());
    }

    #[test]
    fn two_complete_pairs_give_two_accounts() {
        let cfg: AppConfig = serde_json::from_str(
            r#"{
                "portal_username": "a", "portal_password": "pa",
                "portal_username2": "b", "portal_password2": "pb"
            }"#,
        )
        .unwrap();
        let labels: Vec<_> = cfg.accounts().iter().map(|a| a.label).collect();
        assert_eq!(labels, vec!["account1", "account2"]);
    }

    #[test]
    fn malformed_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{not json").unwrap();
        assert!(AppConfig::load(&path).is_err());
    }
}
