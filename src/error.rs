//! Error types for the harvest and relay pipeline.
//!
//! Only failures that abort a whole account pass or the whole relay stage are
//! surfaced as `FerryError`. Anything narrower (one unparsable row, one timed-out
//! download, one failed upload) is logged and skipped where it happens so sibling
//! work keeps moving.

use std::path::PathBuf;

use thiserror::Error;
use thirtyfour::error::WebDriverError;

pub type Result<T> = std::result::Result<T, FerryError>;

#[derive(Debug, Error)]
pub enum FerryError {
    #[error(transparent)]
    WebDriver(#[from] WebDriverError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),

    #[error("history journal: {0}")]
    Journal(#[from] csv::Error),

    #[error("{portal} login form is missing a credential input")]
    LoginFormIncomplete { portal: &'static str },

    #[error("{portal} login control not found")]
    LoginControlMissing { portal: &'static str },

    #[error("intelligence navigation entry not found")]
    NavEntryMissing,

    #[error("unreceived-records gate not reached after {attempts} attempts")]
    GateNotReached { attempts: u32 },

    #[error("records frame not found")]
    RecordsFrameMissing,

    #[error("records table not found inside frame")]
    RecordsTableMissing,

    #[error("no data rows recognized in records table")]
    NoDataRows,

    #[error("relay credentials not configured")]
    RelayCredentialsMissing,

    #[error("relay credential inputs did not appear within {waited_secs}s")]
    RelayLoginFormTimeout { waited_secs: u64 },

    #[error("relay home view not reached within {waited_secs}s (still at {last_url})")]
    RelayHomeTimeout { waited_secs: u64, last_url: String },

    #[error("relay chat '{0}' not found")]
    RelayChatMissing(String),

    #[error("relay upload control missing: {0}")]
    UploadControlMissing(&'static str),

    #[error("artifact missing on disk: {}", .0.display())]
    ArtifactMissing(PathBuf),
}

impl FerryError {
    /// True for conditions that only abort one account's pass, leaving the
    /// rest of the cycle (other account, relay stage) to continue.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            FerryError::LoginFormIncomplete { .. }
                | FerryError::LoginControlMissing { .. }
                | FerryError::NavEntryMissing
                | FerryError::GateNotReached { .. }
                | FerryError::RecordsFrameMissing
                | FerryError::RecordsTableMissing
                | FerryError::NoDataRows
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_fatal_covers_navigation_failures() {
        assert!(FerryError::GateNotReached { attempts: 3 }.is_session_fatal());
        assert!(FerryError::RecordsFrameMissing.is_session_fatal());
        assert!(!FerryError::RelayChatMissing("duty group".into()).is_session_fatal());
    }

    #[test]
    fn messages_carry_context() {
        let err = FerryError::RelayHomeTimeout {
            waited_secs: 300,
            last_url: "https://relay.example/#/login".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("300"));
        assert!(msg.contains("#/login"));
    }
}
