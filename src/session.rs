//! Source-portal session lifecycle.
//!
//! One `PortalSession` owns one browser for one account pass: bring-up per the
//! configured run mode, login, the dashboard navigation into the
//! unreceived-records gate, teardown. Closing consumes the session, so a
//! harvested-out browser cannot be reused by mistake. The gate click gets a
//! bounded retry ladder because the dashboard intermittently renders without
//! the link's id; success is verified by the records frame appearing, not by
//! the click call returning.

use std::path::Path;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use once_cell::sync::Lazy;
use thirtyfour::{By, ChromeCapabilities, ChromiumLikeCapabilities, DesiredCapabilities, WebDriver};

use crate::config::{AccountCredential, AppConfig, RunMode};
use crate::error::{FerryError, Result};
use crate::selector::{
    click_or_script, resolve, resolve_or_scan, FallbackScan, FloorPolicy, Locator, Scope,
    ScoreHints,
};

pub const PORTAL_LOGIN_URL: &str = "http://35.0.40.55/kfkj_zdr/Views/Login/Index.html";

/// Anchor id of the unreceived-records entry on the dashboard. Stable across
/// deployments observed so far, but the text match below covers it vanishing.
pub const GATE_LINK_ID: &str = "165d41e5ea5745b596cff61066478125";
pub const UNRECEIVED_TEXT: &str = "未接收";
const NAV_INTEL_TEXT: &str = "我的情报";
const LOGIN_BUTTON_TEXT: &str = "登录";

const ELEMENT_WAIT: Duration = Duration::from_secs(10);
const PAGE_LOAD_TIMEOUT: Duration = Duration::from_secs(30);
const GATE_ATTEMPTS: u32 = 3;
const GATE_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Id of the frame the gate click is expected to reveal.
pub fn records_frame_id() -> String {
    format!("iframe{GATE_LINK_ID}")
}

static NAV_LADDER: Lazy<Vec<Locator>> = Lazy::new(|| {
    vec![Locator::interactive(
        By::XPath(format!(
            "//div[contains(@class,'main-nav-text') and contains(text(),'{NAV_INTEL_TEXT}')]"
        )),
        "intelligence nav entry",
    )]
});

static GATE_LADDER: Lazy<Vec<Locator>> = Lazy::new(|| {
    vec![
        Locator::present(
            By::XPath(format!(
                "//a[@id='{GATE_LINK_ID}' and contains(text(),'{UNRECEIVED_TEXT}')]"
            )),
            "gate link by id and text",
        ),
        Locator::present(
            By::XPath(format!("//a[@id='{GATE_LINK_ID}']")),
            "gate link by id",
        ),
        Locator::present(By::PartialLinkText(UNRECEIVED_TEXT), "gate link by text"),
    ]
});

static GATE_SCAN: FallbackScan = FallbackScan {
    tag: "a",
    hints: ScoreHints {
        strong_hook: None,
        keywords: &[UNRECEIVED_TEXT],
        weak_hooks: &[],
        style_marks: &[],
        clickable_without_href: 0,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Navigating,
    Authenticating,
    NavigatingToDashboard,
    ClickingGate,
    Delegated,
    Closing,
}

pub struct PortalSession {
    driver: WebDriver,
    label: &'static str,
    state: SessionState,
}

/// Capability set for the configured run mode. `download_dir` must be
/// absolute; in attach mode the running browser keeps its own download
/// setting and the operator must have pointed it at the same directory.
fn browser_caps(cfg: &AppConfig, download_dir: &Path) -> Result<ChromeCapabilities> {
    let mut caps = DesiredCapabilities::chrome();
    match cfg.run_mode {
        RunMode::AttachExisting => {
            info!("attaching to browser at {}", cfg.debugger_address);
            caps.add_experimental_option(
                "debuggerAddress",
                serde_json::json!(cfg.debugger_address),
            )?;
        }
        mode => {
            if mode == RunMode::Headless {
                caps.set_headless()?;
                caps.add_arg("--window-size=1920,1080")?;
            } else {
                caps.add_arg("--start-maximized")?;
            }
            caps.add_arg("--no-sandbox")?;
            caps.add_arg("--disable-gpu")?;
            caps.add_experimental_option(
                "prefs",
                serde_json::json!({
                    "download.default_directory": download_dir.to_string_lossy(),
                    "download.prompt_for_download": false,
                    "profile.default_content_settings.popups": 0,
                }),
            )?;
        }
    }
    Ok(caps)
}

/// Bring up a browser per the configured run mode.
pub async fn open_browser(cfg: &AppConfig, download_dir: &Path) -> Result<WebDriver> {
    let caps = browser_caps(cfg, download_dir)?;
    Ok(WebDriver::new(&cfg.webdriver_url, caps).await?)
}

impl PortalSession {
    pub async fn open(cfg: &AppConfig, download_dir: &Path, label: &'static str) -> Result<Self> {
        let driver = open_browser(cfg, download_dir).await?;
        info!("{label}: browser session opened");
        Ok(PortalSession {
            driver,
            label,
            state: SessionState::Idle,
        })
    }

    pub fn driver(&self) -> &WebDriver {
        &self.driver
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    fn enter(&mut self, next: SessionState) {
        debug!("{}: {:?} -> {:?}", self.label, self.state, next);
        self.state = next;
    }

    /// Navigate to the login page and authenticate. A missing credential
    /// input or login control fails the whole account pass without retry.
    pub async fn login(&mut self, account: &AccountCredential) -> Result<()> {
        self.enter(SessionState::Navigating);
        self.driver.goto(PORTAL_LOGIN_URL).await?;
        thirtyfour::support::sleep(Duration::from_secs(3)).await;

        self.enter(SessionState::Authenticating);
        let scope = Scope::Page(&self.driver);

        let username_ladder = [Locator::present(By::Id("username"), "login username input")];
        let password_ladder = [Locator::present(By::Id("password"), "login password input")];

        let Some(username_input) = resolve(&scope, &username_ladder, ELEMENT_WAIT).await? else {
            return Err(FerryError::LoginFormIncomplete { portal: "intelligence portal" });
        };
        let Some(password_input) = resolve(&scope, &password_ladder, ELEMENT_WAIT).await? else {
            return Err(FerryError::LoginFormIncomplete { portal: "intelligence portal" });
        };

        username_input.clear().await?;
        username_input.send_keys(&account.principal).await?;
        password_input.clear().await?;
        password_input.send_keys(&account.secret).await?;

        let login_ladder = [Locator::interactive(
            By::XPath(format!("//span[contains(text(),'{LOGIN_BUTTON_TEXT}')]")),
            "portal login control",
        )];
        let Some(login_control) = resolve(&scope, &login_ladder, ELEMENT_WAIT).await? else {
            return Err(FerryError::LoginControlMissing { portal: "intelligence portal" });
        };
        login_control.click().await?;
        info!("{}: credentials submitted", self.label);

        thirtyfour::support::sleep(Duration::from_secs(5)).await;
        self.wait_for_page_load().await?;
        self.enter(SessionState::NavigatingToDashboard);
        Ok(())
    }

    /// Poll the loading indicator until it reports hidden. An indicator that
    /// never existed counts as loaded; a timeout is logged and tolerated.
    async fn wait_for_page_load(&self) -> Result<()> {
        let deadline = Instant::now() + PAGE_LOAD_TIMEOUT;
        loop {
            match self.driver.find(By::Id("loading_manage")).await {
                Ok(indicator) => {
                    let style = indicator.attr("style").await?.unwrap_or_default();
                    let displayed = indicator.is_displayed().await.unwrap_or(false);
                    if style_hidden(&style) || !displayed {
                        debug!("{}: page load complete", self.label);
                        return Ok(());
                    }
                }
                Err(_) => {
                    debug!("{}: no loading indicator, treating page as loaded", self.label);
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                warn!(
                    "{}: loading indicator still visible after {}s, continuing anyway",
                    self.label,
                    PAGE_LOAD_TIMEOUT.as_secs()
                );
                return Ok(());
            }
            thirtyfour::support::sleep(Duration::from_secs(1)).await;
        }
    }

    /// Click into the unreceived-records gate, retrying with a page refresh
    /// and nav re-click. Each attempt is judged by the records frame showing
    /// up; a click that lands but reveals no frame counts as failed.
    pub async fn open_unreceived_gate(&mut self) -> Result<()> {
        let scope = Scope::Page(&self.driver);
        let Some(nav_entry) = resolve(&scope, &NAV_LADDER, ELEMENT_WAIT).await? else {
            return Err(FerryError::NavEntryMissing);
        };
        nav_entry.click().await?;
        info!("{}: opened intelligence view", self.label);
        thirtyfour::support::sleep(Duration::from_secs(3)).await;

        self.enter(SessionState::ClickingGate);
        let scope = Scope::Page(&self.driver);
        for attempt in 1..=GATE_ATTEMPTS {
            if attempt > 1 {
                warn!(
                    "{}: retrying gate click (attempt {attempt}/{GATE_ATTEMPTS})",
                    self.label
                );
                thirtyfour::support::sleep(GATE_RETRY_DELAY).await;
                self.driver.refresh().await?;
                thirtyfour::support::sleep(Duration::from_secs(5)).await;
                match resolve(&scope, &NAV_LADDER, ELEMENT_WAIT).await? {
                    Some(nav) => {
                        nav.click().await?;
                        thirtyfour::support::sleep(Duration::from_secs(3)).await;
                    }
                    None => warn!("{}: nav entry missing after refresh", self.label),
                }
            }

            thirtyfour::support::sleep(Duration::from_secs(5)).await;
            if self.try_gate_click().await? {
                info!("{}: unreceived-records gate open", self.label);
                return Ok(());
            }
        }

        Err(FerryError::GateNotReached { attempts: GATE_ATTEMPTS })
    }

    async fn try_gate_click(&self) -> Result<bool> {
        let scope = Scope::Page(&self.driver);
        let Some(hit) = resolve_or_scan(
            &scope,
            &GATE_LADDER,
            Duration::from_secs(5),
            &GATE_SCAN,
            FloorPolicy::Enforce,
        )
        .await?
        else {
            warn!("{}: gate link not found on this attempt", self.label);
            return Ok(false);
        };

        let link = hit.element;
        let displayed = link.is_displayed().await.unwrap_or(false);
        let enabled = link.is_enabled().await.unwrap_or(false);
        debug!("{}: gate link displayed={displayed} enabled={enabled}", self.label);
        if !displayed {
            link.scroll_into_view().await?;
            thirtyfour::support::sleep(Duration::from_secs(1)).await;
        }

        click_or_script(&self.driver, &link).await?;

        thirtyfour::support::sleep(Duration::from_secs(5)).await;
        let url = self.driver.current_url().await?;
        debug!("{}: after gate click at {url}", self.label);
        thirtyfour::support::sleep(Duration::from_secs(3)).await;

        let frame_ladder = [
            Locator::present(By::Id(records_frame_id()), "records frame by id"),
            Locator::present(
                By::XPath(format!("//iframe[contains(@id,'{GATE_LINK_ID}')]")),
                "records frame by id fragment",
            ),
        ];
        let frame_present = resolve(&scope, &frame_ladder, Duration::from_secs(5))
            .await?
            .is_some();
        if !frame_present {
            warn!("{}: records frame absent after click", self.label);
        }
        Ok(frame_present)
    }

    /// Hand the browser to the harvester. Purely a bookkeeping transition.
    pub fn delegate(&mut self) {
        self.enter(SessionState::Delegated);
    }

    /// Tear down the browser. Consumes the session.
    pub async fn close(mut self) -> Result<()> {
        self.enter(SessionState::Closing);
        let label = self.label;
        self.driver.quit().await?;
        info!("{label}: session closed");
        Ok(())
    }
}

fn style_hidden(style: &str) -> bool {
    let packed = style.replace(' ', "");
    packed.contains("display:none")
}

/// Advisory reachability check before a stage opens its browser. TLS errors
/// are tolerated because the relay endpoint is self-signed.
pub async fn probe_portal(label: &str, url: &str) {
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .danger_accept_invalid_certs(true)
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            debug!("probe client build failed: {e}");
            return;
        }
    };
    match client.head(url).send().await {
        Ok(response) => debug!("{label} reachable ({})", response.status()),
        Err(e) => warn!("{label} may be unreachable: {e}"),
    }
}
