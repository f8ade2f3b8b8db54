//! Relaying harvested artifacts into the destination chat.
//!
//! The relay portal is an Element-UI single-page app. Its login form renders
//! without usable ids, so credential inputs are found by their observed
//! positions first and by placeholder text as the slow path. Upload success
//! is judged by the confirmation dialog disappearing; peeking at the chat
//! transcript afterwards is advisory logging only and never decides whether
//! a file lands in the ledger. A file whose confirmation is not observed
//! stays out of the ledger so the next cycle retries it.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use once_cell::sync::Lazy;
use thirtyfour::{By, WebDriver, WebElement};

use crate::config::AppConfig;
use crate::download::DownloadedArtifact;
use crate::error::{FerryError, Result};
use crate::ledger::UploadLedger;
use crate::selector::{click_or_script, resolve, Locator, Scope};
use crate::session::{open_browser, probe_portal};
use crate::CancelFlag;

pub const RELAY_LOGIN_URL: &str = "https://10.2.120.214:10242/#/login";

const ID_PLACEHOLDER: &str = "请输入身份证号";
const PASSWORD_PLACEHOLDER: &str = "请输入密码";
const LOGIN_BUTTON_TEXT: &str = "登录";
const HOME_URL_FRAGMENT: &str = "home/chat";

/// Observed positions of the credential inputs on the login layout.
const ID_INPUT_INDEX: usize = 3;
const PASSWORD_INPUT_INDEX: usize = 4;

const LOGIN_FORM_TIMEOUT: Duration = Duration::from_secs(120);
const LOGIN_FORM_POLL: Duration = Duration::from_secs(5);
const HOME_TIMEOUT: Duration = Duration::from_secs(300);
const HOME_POLL: Duration = Duration::from_secs(10);
const DIALOG_GONE_ATTEMPTS: u32 = 8;

const FILE_MESSAGE_HINTS: [&str; 7] =
    ["docx", "xls", "zip", "attachment", "file", "文件", "附件"];

static ATTACH_LADDER: Lazy<Vec<Locator>> = Lazy::new(|| {
    vec![
        Locator::interactive(By::Css("i.icon-wenjian"), "attach icon by class"),
        Locator::interactive(
            By::XPath("//i[contains(@class,'icon-wenjian')]"),
            "attach icon by class fragment",
        ),
    ]
});

static CONFIRM_LADDER: Lazy<Vec<Locator>> = Lazy::new(|| {
    vec![
        Locator::interactive(
            By::XPath("/html/body/div[2]/div/div[3]/button[2]"),
            "confirm button by structural path",
        ),
        Locator::interactive(
            By::XPath(
                "//div[contains(@class,'el-message-box')]//div[contains(@class,'el-message-box__btns')]/button[2]",
            ),
            "confirm button by dialog structure",
        ),
        Locator::interactive(
            By::XPath("//button[.//span[contains(text(),'确定')]]"),
            "confirm button by span text",
        ),
        Locator::interactive(
            By::XPath("//button[.//span[contains(text(),'确 定')]]"),
            "confirm button by spaced span text",
        ),
    ]
});

#[derive(Debug, Default)]
pub struct RelayOutcome {
    pub uploaded: usize,
    pub failed: usize,
    /// Already in the ledger, no action taken.
    pub skipped: usize,
}

impl RelayOutcome {
    /// A completed pass counts as successful when something moved or nothing
    /// was pending; failures with zero uploads mean the relay never worked.
    pub fn is_success(&self) -> bool {
        self.failed == 0 || self.uploaded > 0
    }
}

/// Upload every artifact not yet in the ledger. With an empty residual set no
/// browser is opened at all. Missing credentials, login failure or home-view
/// failure abort the whole pass; per-file failures are absorbed and the file
/// stays un-ledgered.
pub async fn push_artifacts(
    cfg: &AppConfig,
    download_dir: &Path,
    artifacts: &[DownloadedArtifact],
    ledger: &mut UploadLedger,
    cancel: &CancelFlag,
) -> Result<RelayOutcome> {
    let candidates: Vec<PathBuf> = artifacts.iter().map(|a| a.path.clone()).collect();
    let residual: Vec<PathBuf> = ledger
        .filter_new(&candidates)
        .into_iter()
        .cloned()
        .collect();
    let skipped = candidates.len() - residual.len();
    if skipped > 0 {
        info!("{skipped} artifact(s) already uploaded in earlier cycles");
    }
    if residual.is_empty() {
        info!("nothing to relay");
        return Ok(RelayOutcome { skipped, ..Default::default() });
    }
    if !cfg.relay_configured() {
        warn!(
            "relay credentials not configured, leaving {} artifact(s) for later",
            residual.len()
        );
        return Err(FerryError::RelayCredentialsMissing);
    }

    probe_portal("relay portal", RELAY_LOGIN_URL).await;
    let session = RelaySession::open(cfg, download_dir).await?;
    let driven = session.drive(cfg, &residual, ledger, cancel).await;
    if let Err(e) = session.close().await {
        warn!("relay session close failed: {e}");
    }
    let mut outcome = driven?;
    outcome.skipped = skipped;
    Ok(outcome)
}

struct RelaySession {
    driver: WebDriver,
}

impl RelaySession {
    async fn open(cfg: &AppConfig, download_dir: &Path) -> Result<Self> {
        let driver = open_browser(cfg, download_dir).await?;
        info!("relay: browser session opened");
        Ok(RelaySession { driver })
    }

    async fn close(self) -> Result<()> {
        self.driver.quit().await?;
        info!("relay: session closed");
        Ok(())
    }

    async fn drive(
        &self,
        cfg: &AppConfig,
        residual: &[PathBuf],
        ledger: &mut UploadLedger,
        cancel: &CancelFlag,
    ) -> Result<RelayOutcome> {
        self.login(cfg, cancel).await?;
        self.open_chat(&cfg.relay_group_name).await?;

        let mut outcome = RelayOutcome::default();
        for path in residual {
            if cancel.is_cancelled() {
                warn!("relay: stop requested, abandoning remaining uploads");
                break;
            }
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();
            match self.upload_one(path).await {
                Ok(true) => {
                    info!("relay: uploaded {name}");
                    ledger.record(name);
                    outcome.uploaded += 1;
                }
                Ok(false) => {
                    warn!("relay: confirmation not observed for {name}, will retry next cycle");
                    outcome.failed += 1;
                }
                Err(e) => {
                    warn!("relay: upload of {name} failed: {e}");
                    outcome.failed += 1;
                }
            }
            thirtyfour::support::sleep(Duration::from_secs(2)).await;
        }

        ledger.rewrite()?;
        info!(
            "relay: {} uploaded, {} failed, ledger now {} name(s)",
            outcome.uploaded,
            outcome.failed,
            ledger.len()
        );
        Ok(outcome)
    }

    async fn login(&self, cfg: &AppConfig, cancel: &CancelFlag) -> Result<()> {
        self.driver.goto(RELAY_LOGIN_URL).await?;
        thirtyfour::support::sleep(Duration::from_secs(5)).await;
        let url = self.driver.current_url().await?;
        debug!("relay: login page at {url}");
        thirtyfour::support::sleep(Duration::from_secs(8)).await;

        let (principal_input, secret_input) = self.find_credential_inputs(cancel).await?;
        principal_input.clear().await?;
        principal_input.send_keys(&cfg.relay_id_card).await?;
        thirtyfour::support::sleep(Duration::from_secs(1)).await;
        secret_input.clear().await?;
        secret_input.send_keys(&cfg.relay_password).await?;
        thirtyfour::support::sleep(Duration::from_secs(2)).await;

        let scope = Scope::Page(&self.driver);
        let login_ladder = [Locator::interactive(
            By::XPath(format!(
                "//button[contains(@class,'el-button--primary') and .//span[contains(text(),'{LOGIN_BUTTON_TEXT}')]]"
            )),
            "relay login button",
        )];
        let Some(login_button) = resolve(&scope, &login_ladder, Duration::from_secs(10)).await?
        else {
            return Err(FerryError::LoginControlMissing { portal: "relay portal" });
        };
        click_or_script(&self.driver, &login_button).await?;
        info!("relay: credentials submitted");
        thirtyfour::support::sleep(Duration::from_secs(10)).await;

        self.wait_for_home(cancel).await
    }

    /// The login inputs sit at fixed positions when the page is fully drawn.
    /// Until then, poll for them by placeholder.
    async fn find_credential_inputs(&self, cancel: &CancelFlag) -> Result<(WebElement, WebElement)> {
        let inputs = self.driver.find_all(By::Tag("input")).await?;
        debug!("relay: {} input(s) on login page", inputs.len());
        if inputs.len() > PASSWORD_INPUT_INDEX {
            return Ok((
                inputs[ID_INPUT_INDEX].clone(),
                inputs[PASSWORD_INPUT_INDEX].clone(),
            ));
        }

        warn!("relay: login inputs not at expected positions, polling by placeholder");
        let deadline = Instant::now() + LOGIN_FORM_TIMEOUT;
        loop {
            if cancel.is_cancelled() {
                return Err(FerryError::RelayLoginFormTimeout {
                    waited_secs: LOGIN_FORM_TIMEOUT.as_secs(),
                });
            }
            let principal = self
                .driver
                .find(By::Css(format!("input[placeholder='{ID_PLACEHOLDER}']")))
                .await;
            let secret = self
                .driver
                .find(By::Css(format!("input[placeholder='{PASSWORD_PLACEHOLDER}']")))
                .await;
            if let (Ok(principal), Ok(secret)) = (principal, secret) {
                return Ok((principal, secret));
            }
            if Instant::now() >= deadline {
                return Err(FerryError::RelayLoginFormTimeout {
                    waited_secs: LOGIN_FORM_TIMEOUT.as_secs(),
                });
            }
            thirtyfour::support::sleep(LOGIN_FORM_POLL).await;
        }
    }

    async fn wait_for_home(&self, cancel: &CancelFlag) -> Result<()> {
        let deadline = Instant::now() + HOME_TIMEOUT;
        loop {
            let url = self.driver.current_url().await?;
            if url.as_str().contains(HOME_URL_FRAGMENT) {
                info!("relay: home view reached");
                return Ok(());
            }
            if cancel.is_cancelled() || Instant::now() >= deadline {
                return Err(FerryError::RelayHomeTimeout {
                    waited_secs: HOME_TIMEOUT.as_secs(),
                    last_url: url.to_string(),
                });
            }
            debug!("relay: still at {url}");
            thirtyfour::support::sleep(HOME_POLL).await;
        }
    }

    async fn open_chat(&self, group_name: &str) -> Result<()> {
        let scope = Scope::Page(&self.driver);
        let chat_ladder = [Locator::interactive(
            By::XPath(format!(
                "//div[contains(@class,'chat-name-text') and contains(text(),'{group_name}')]"
            )),
            "destination chat entry",
        )];
        let Some(chat) = resolve(&scope, &chat_ladder, Duration::from_secs(10)).await? else {
            return Err(FerryError::RelayChatMissing(group_name.to_string()));
        };
        chat.click().await?;
        info!("relay: chat '{group_name}' opened");
        thirtyfour::support::sleep(Duration::from_secs(2)).await;
        Ok(())
    }

    /// One attach-confirm round. `Ok(true)` only when the confirmation dialog
    /// was seen to go away; everything else leaves the file un-ledgered.
    async fn upload_one(&self, path: &Path) -> Result<bool> {
        if !path.exists() {
            return Err(FerryError::ArtifactMissing(path.to_path_buf()));
        }
        let scope = Scope::Page(&self.driver);

        // The path must be registered before the attach control is clicked:
        // suppress the native chooser, then seed the hidden file input.
        self.driver
            .execute("HTMLInputElement.prototype.click = function() {};", vec![])
            .await?;
        let input_ladder = [Locator::present(
            By::Css("input[type='file']"),
            "hidden file input",
        )];
        let Some(file_input) = resolve(&scope, &input_ladder, Duration::from_secs(5)).await? else {
            return Err(FerryError::UploadControlMissing("file input"));
        };
        file_input
            .send_keys(path.to_string_lossy().to_string())
            .await?;
        debug!("relay: file path seeded");

        let Some(attach) = resolve(&scope, &ATTACH_LADDER, Duration::from_secs(5)).await? else {
            return Err(FerryError::UploadControlMissing("attach icon"));
        };
        click_or_script(&self.driver, &attach).await?;

        self.wait_for_path_consumed(&file_input, path).await;

        let Some(confirm) = resolve(&scope, &CONFIRM_LADDER, Duration::from_secs(3)).await? else {
            return Err(FerryError::UploadControlMissing("confirm button"));
        };
        thirtyfour::support::sleep(Duration::from_millis(1500)).await;
        click_or_script(&self.driver, &confirm).await?;

        let confirmed = self.dialog_gone().await?;
        if confirmed {
            self.log_transcript_hint().await;
        }
        Ok(confirmed)
    }

    /// Bounded wait for the page to register the seeded path: the confirmation
    /// dialog coming up or the file input reporting a value both count. A quiet
    /// page is tolerated because the upload may already be past its dialog.
    async fn wait_for_path_consumed(&self, file_input: &WebElement, path: &Path) {
        for _ in 0..10 {
            if self.dialog_visible().await.unwrap_or(false) {
                debug!("relay: confirmation dialog up");
                return;
            }
            if let Ok(Some(value)) = file_input.value().await {
                if !value.is_empty() {
                    debug!("relay: file input holds the seeded path");
                    return;
                }
            }
            thirtyfour::support::sleep(Duration::from_secs(1)).await;
        }
        debug!(
            "relay: no visible reaction to {} yet, proceeding to confirm",
            path.display()
        );
    }

    async fn dialog_visible(&self) -> Result<bool> {
        let wrappers = self
            .driver
            .find_all(By::Css("div.el-message-box__wrapper"))
            .await?;
        for wrapper in wrappers {
            if wrapper.is_displayed().await.unwrap_or(false) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Success signal: the confirmation dialog stops being visible.
    async fn dialog_gone(&self) -> Result<bool> {
        for _ in 0..DIALOG_GONE_ATTEMPTS {
            thirtyfour::support::sleep(Duration::from_secs(1)).await;
            if !self.dialog_visible().await? {
                return Ok(true);
            }
            debug!("relay: confirmation dialog still visible");
        }
        Ok(false)
    }

    /// Advisory only. The transcript renders uploads in too many shapes to
    /// let its absence veto a confirmed dialog.
    async fn log_transcript_hint(&self) {
        let messages = match self.driver.find_all(By::Css("li.messageBG")).await {
            Ok(messages) => messages,
            Err(e) => {
                debug!("relay: transcript not inspectable: {e}");
                return;
            }
        };
        for message in messages.iter().rev().take(5) {
            if let Ok(html) = message.inner_html().await {
                if looks_like_file_message(&html) {
                    debug!("relay: file-like message visible in transcript");
                    return;
                }
            }
        }
        debug!("relay: no file-like message spotted in transcript (advisory)");
    }
}

fn looks_like_file_message(html: &str) -> bool {
    let lowered = html.to_lowercase();
    FILE_MESSAGE_HINTS.iter().any(|hint| lowered.contains(hint))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn artifact(dir: &Path, name: &str) -> DownloadedArtifact {
        DownloadedArtifact {
            recorded_at: NaiveDate::from_ymd_opt(2024, 1, 1)
                .unwrap()
                .and_hms_opt(10, 0, 0)
                .unwrap(),
            path: dir.join(name),
        }
    }

    #[tokio::test]
    async fn pending_files_without_relay_credentials_fail_the_pass() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = UploadLedger::load(dir.path().join("ledger.txt")).unwrap();
        let artifacts = vec![artifact(dir.path(), "2024-01-01_10-00-00.docx")];
        let cancel = CancelFlag::new();

        let err = push_artifacts(&AppConfig::default(), dir.path(), &artifacts, &mut ledger, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, FerryError::RelayCredentialsMissing));
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn fully_ledgered_artifacts_succeed_without_a_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = UploadLedger::load(dir.path().join("ledger.txt")).unwrap();
        ledger.record("2024-01-01_10-00-00.docx");
        let artifacts = vec![artifact(dir.path(), "2024-01-01_10-00-00.docx")];
        let cancel = CancelFlag::new();

        let outcome = push_artifacts(&AppConfig::default(), dir.path(), &artifacts, &mut ledger, &cancel)
            .await
            .unwrap();
        assert_eq!(outcome.skipped, 1);
        assert_eq!(outcome.uploaded, 0);
        assert_eq!(outcome.failed, 0);
        assert!(outcome.is_success());
    }

    #[test]
    fn pass_success_needs_progress_once_failures_appear() {
        assert!(RelayOutcome { uploaded: 2, failed: 0, skipped: 0 }.is_success());
        assert!(RelayOutcome { uploaded: 1, failed: 1, skipped: 0 }.is_success());
        assert!(!RelayOutcome { uploaded: 0, failed: 2, skipped: 0 }.is_success());
        assert!(RelayOutcome { uploaded: 0, failed: 0, skipped: 3 }.is_success());
    }

    #[test]
    fn file_markup_is_recognized() {
        assert!(looks_like_file_message(
            r#"<div class="file-card"><span>brief.DOCX</span></div>"#
        ));
        assert!(looks_like_file_message("<span>附件: 情况通报.zip</span>"));
        assert!(!looks_like_file_message("<span>收到，马上处理</span>"));
    }

    #[test]
    fn hint_match_is_case_insensitive() {
        assert!(looks_like_file_message("REPORT.XLSX"));
        assert!(looks_like_file_message("some Attachment here"));
    }
}
