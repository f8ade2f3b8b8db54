//! Resilient element lookup over an unstable DOM.
//!
//! The portals intermittently drop the ids and classes their pages normally
//! carry, so every important lookup is expressed as an ordered ladder of
//! candidate locators tried with a short per-candidate poll, backed by a
//! last-resort enumeration of a generic tag scored by heuristics. Fallback
//! hits below a confidence floor are either refused or handed back flagged as
//! low-confidence, depending on what the caller is about to do with them.
//!
//! Scoring runs on plain extracted features so the weights are testable
//! without a browser.

use std::time::{Duration, Instant};

use log::{debug, warn};
use thirtyfour::error::WebDriverResult;
use thirtyfour::{By, WebDriver, WebElement};

/// Minimum fallback score an element needs before it is trusted.
pub const CONFIDENCE_FLOOR: u32 = 50;

const POLL_STEP: Duration = Duration::from_millis(250);

/// Where a lookup searches: the whole page or inside one element.
#[derive(Clone, Copy)]
pub enum Scope<'a> {
    Page(&'a WebDriver),
    Within(&'a WebElement),
}

impl Scope<'_> {
    pub async fn find_all(&self, by: By) -> WebDriverResult<Vec<WebElement>> {
        match self {
            Scope::Page(driver) => driver.find_all(by).await,
            Scope::Within(element) => element.find_all(by).await,
        }
    }
}

/// State a candidate must be in before it is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Need {
    /// Attached to the DOM is enough (hidden inputs, frames).
    Present,
    /// Must report displayed and enabled.
    Interactive,
}

/// One candidate locator in a ladder, labeled for the log trail.
#[derive(Debug, Clone)]
pub struct Locator {
    pub by: By,
    pub need: Need,
    pub label: &'static str,
}

impl Locator {
    pub fn present(by: By, label: &'static str) -> Self {
        Locator { by, need: Need::Present, label }
    }

    pub fn interactive(by: By, label: &'static str) -> Self {
        Locator { by, need: Need::Interactive, label }
    }
}

async fn satisfies(element: &WebElement, need: Need) -> bool {
    match need {
        Need::Present => true,
        Need::Interactive => {
            matches!(element.is_displayed().await, Ok(true))
                && matches!(element.is_enabled().await, Ok(true))
        }
    }
}

/// Try each candidate in order, polling each for up to `per_candidate`.
/// Returns the first element satisfying its candidate's state requirement.
pub async fn resolve(
    scope: &Scope<'_>,
    ladder: &[Locator],
    per_candidate: Duration,
) -> WebDriverResult<Option<WebElement>> {
    for locator in ladder {
        let deadline = Instant::now() + per_candidate;
        loop {
            let found = scope.find_all(locator.by.clone()).await?;
            for element in found {
                if satisfies(&element, locator.need).await {
                    debug!("resolved via {}", locator.label);
                    return Ok(Some(element));
                }
            }
            if Instant::now() >= deadline {
                break;
            }
            thirtyfour::support::sleep(POLL_STEP).await;
        }
        debug!("candidate exhausted: {}", locator.label);
    }
    Ok(None)
}

/// Features extracted from one enumerated element, scoreable offline.
#[derive(Debug, Default, Clone)]
pub struct ElementFeatures {
    pub text: String,
    pub onclick: String,
    pub href: String,
    pub style: String,
}

pub async fn extract_features(element: &WebElement) -> ElementFeatures {
    ElementFeatures {
        text: element.text().await.unwrap_or_default(),
        onclick: attr_or_empty(element, "onclick").await,
        href: attr_or_empty(element, "href").await,
        style: attr_or_empty(element, "style").await,
    }
}

async fn attr_or_empty(element: &WebElement, name: &str) -> String {
    element.attr(name).await.ok().flatten().unwrap_or_default()
}

/// Scoring heuristics for one kind of fallback target.
#[derive(Debug, Clone)]
pub struct ScoreHints {
    /// Exact substring expected in the click handler. Worth 100.
    pub strong_hook: Option<&'static str>,
    /// Visible-text keywords. Worth 50.
    pub keywords: &'static [&'static str],
    /// Case-insensitive click-handler substrings. Worth 30.
    pub weak_hooks: &'static [&'static str],
    /// Inline-style fragments (whitespace-insensitive) with their weights.
    pub style_marks: &'static [(&'static str, u32)],
    /// Weight for a click handler with no href, 0 to disable.
    pub clickable_without_href: u32,
}

pub fn score_features(features: &ElementFeatures, hints: &ScoreHints) -> (u32, Vec<&'static str>) {
    let mut score = 0;
    let mut reasons = Vec::new();

    if let Some(hook) = hints.strong_hook {
        if features.onclick.contains(hook) {
            score += 100;
            reasons.push("exact click hook");
        }
    }
    if hints.keywords.iter().any(|k| features.text.contains(k)) {
        score += 50;
        reasons.push("keyword in text");
    }
    let onclick_lower = features.onclick.to_lowercase();
    if hints.weak_hooks.iter().any(|h| onclick_lower.contains(h)) {
        score += 30;
        reasons.push("generic click hook");
    }
    let style_packed = features.style.replace(' ', "");
    for &(mark, weight) in hints.style_marks {
        if style_packed.contains(mark) {
            score += weight;
            reasons.push(mark);
        }
    }
    if hints.clickable_without_href > 0 && !features.onclick.is_empty() && features.href.is_empty() {
        score += hints.clickable_without_href;
        reasons.push("click-only link");
    }

    (score, reasons)
}

/// Fallback enumeration: every element of one tag, scored.
#[derive(Debug, Clone)]
pub struct FallbackScan {
    pub tag: &'static str,
    pub hints: ScoreHints,
}

/// What to do with a best candidate that lands below the confidence floor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloorPolicy {
    /// Refuse it; the caller gets nothing rather than a guess.
    Enforce,
    /// Hand it back flagged low-confidence; the caller acts on it anyway.
    BestEffort,
}

/// `Some(low_confidence)` when the score is acted on, `None` when refused.
fn fallback_verdict(score: u32, policy: FloorPolicy) -> Option<bool> {
    if score >= CONFIDENCE_FLOOR {
        Some(false)
    } else {
        match policy {
            FloorPolicy::Enforce => None,
            FloorPolicy::BestEffort => Some(true),
        }
    }
}

pub struct ScoredElement {
    pub element: WebElement,
    pub score: u32,
    pub reasons: Vec<&'static str>,
    pub low_confidence: bool,
}

/// Enumerate `scan.tag` in scope and return the highest-scoring candidate,
/// subject to the floor policy. First hit wins score ties.
pub async fn scan_by_score(
    scope: &Scope<'_>,
    scan: &FallbackScan,
    policy: FloorPolicy,
) -> WebDriverResult<Option<ScoredElement>> {
    let candidates = scope.find_all(By::Tag(scan.tag)).await?;
    debug!("fallback scan over {} <{}> element(s)", candidates.len(), scan.tag);

    let mut sample = Vec::new();
    let mut best: Option<(WebElement, u32, Vec<&'static str>)> = None;

    for element in candidates {
        let features = extract_features(&element).await;
        if sample.len() < 20 {
            let shown: String = features.text.chars().take(30).collect();
            sample.push(shown);
        }
        let (score, reasons) = score_features(&features, &scan.hints);
        if score == 0 {
            continue;
        }
        let better = match &best {
            Some((_, best_score, _)) => score > *best_score,
            None => true,
        };
        if better {
            best = Some((element, score, reasons));
        }
    }

    debug!("scanned texts: {}", sample.join(" | "));

    let Some((element, score, reasons)) = best else {
        return Ok(None);
    };

    match fallback_verdict(score, policy) {
        Some(low_confidence) => {
            if low_confidence {
                warn!(
                    "acting on low-confidence fallback (score {score} < {CONFIDENCE_FLOOR}): {}",
                    reasons.join(", ")
                );
            } else {
                debug!("fallback candidate accepted (score {score}): {}", reasons.join(", "));
            }
            Ok(Some(ScoredElement { element, score, reasons, low_confidence }))
        }
        None => {
            warn!(
                "best fallback candidate scored {score}, below floor {CONFIDENCE_FLOOR}; refusing it"
            );
            Ok(None)
        }
    }
}

/// Click, and when the driver rejects the click (overlay, off-screen, theme
/// quirk), fall back to a script click on the same element.
pub async fn click_or_script(driver: &WebDriver, element: &WebElement) -> WebDriverResult<()> {
    match element.click().await {
        Ok(()) => Ok(()),
        Err(e) => {
            warn!("direct click rejected ({e}), using script click");
            driver
                .execute("arguments[0].click();", vec![element.to_json()?])
                .await?;
            Ok(())
        }
    }
}

/// Ladder first, scan second. The usual entry point for important lookups.
pub async fn resolve_or_scan(
    scope: &Scope<'_>,
    ladder: &[Locator],
    per_candidate: Duration,
    scan: &FallbackScan,
    policy: FloorPolicy,
) -> WebDriverResult<Option<ScoredElement>> {
    if let Some(element) = resolve(scope, ladder, per_candidate).await? {
        return Ok(Some(ScoredElement {
            element,
            score: 0,
            reasons: Vec::new(),
            low_confidence: false,
        }));
    }
    scan_by_score(scope, scan, policy).await
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOWNLOAD_HINTS: ScoreHints = ScoreHints {
        strong_hook: Some("downloadfiles"),
        keywords: &["下载"],
        weak_hooks: &["download"],
        style_marks: &[("color:blue", 20), ("cursor:pointer", 15)],
        clickable_without_href: 10,
    };

    fn features(text: &str, onclick: &str, href: &str, style: &str) -> ElementFeatures {
        ElementFeatures {
            text: text.into(),
            onclick: onclick.into(),
            href: href.into(),
            style: style.into(),
        }
    }

    #[test]
    fn exact_hook_clears_the_floor_alone() {
        let f = features("", "downloadFiles('1')", "", "");
        // hook matching is case-sensitive on the exact form
        let (score, _) = score_features(&f, &DOWNLOAD_HINTS);
        assert!(score < CONFIDENCE_FLOOR);

        let f = features("", "downloadfiles('1')", "", "");
        let (score, reasons) = score_features(&f, &DOWNLOAD_HINTS);
        assert!(score >= CONFIDENCE_FLOOR);
        assert!(reasons.contains(&"exact click hook"));
    }

    #[test]
    fn keyword_text_sits_exactly_at_the_floor() {
        let f = features("下载", "", "", "");
        let (score, _) = score_features(&f, &DOWNLOAD_HINTS);
        assert_eq!(score, CONFIDENCE_FLOOR);
    }

    #[test]
    fn stacked_weak_signals_can_clear_the_floor() {
        let f = features("打开", "doDownload()", "", "color: blue; cursor: pointer");
        let (score, reasons) = score_features(&f, &DOWNLOAD_HINTS);
        // 30 (generic hook) + 20 + 15 (styles) + 10 (click-only)
        assert_eq!(score, 75);
        assert!(reasons.contains(&"generic click hook"));
    }

    #[test]
    fn a_single_weak_signal_stays_below_the_floor() {
        let f = features("打开", "", "", "cursor:pointer");
        let (score, _) = score_features(&f, &DOWNLOAD_HINTS);
        assert!(score < CONFIDENCE_FLOOR);
    }

    #[test]
    fn style_matching_ignores_whitespace() {
        let f = features("", "", "", "color: blue");
        let (score, reasons) = score_features(&f, &DOWNLOAD_HINTS);
        assert_eq!(score, 20);
        assert_eq!(reasons, vec!["color:blue"]);
    }

    #[test]
    fn href_suppresses_click_only_bonus() {
        let with_href = features("", "go()", "http://x", "");
        let without = features("", "go()", "", "");
        assert!(score_features(&without, &DOWNLOAD_HINTS).0 > score_features(&with_href, &DOWNLOAD_HINTS).0);
    }

    #[test]
    fn floor_is_enforced_or_waived_by_policy() {
        assert_eq!(fallback_verdict(50, FloorPolicy::Enforce), Some(false));
        assert_eq!(fallback_verdict(49, FloorPolicy::Enforce), None);
        assert_eq!(fallback_verdict(49, FloorPolicy::BestEffort), Some(true));
        assert_eq!(fallback_verdict(120, FloorPolicy::BestEffort), Some(false));
    }
}
