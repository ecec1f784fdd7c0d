use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::driver::{DriverError, PageDriver};

#[derive(Clone, Debug, PartialEq)]
pub enum FieldAction {
    Populate { value: String },
    Trigger,
}

impl FieldAction {
    pub fn kind(&self) -> &'static str {
        match self {
            FieldAction::Populate { .. } => "populate",
            FieldAction::Trigger => "trigger",
        }
    }
}

/// One failed candidate and why it failed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    pub selector: String,
    pub error: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionOutcome {
    pub succeeded: bool,
    pub matched_selector: Option<String>,
    /// Failed candidates in input order. On success, only those tried before
    /// the match.
    pub attempted_selectors: Vec<Attempt>,
    pub final_observed_value: Option<String>,
}

impl ActionOutcome {
    fn matched(selector: &str, attempts: Vec<Attempt>, observed: Option<String>) -> Self {
        Self {
            succeeded: true,
            matched_selector: Some(selector.to_string()),
            attempted_selectors: attempts,
            final_observed_value: observed,
        }
    }

    fn exhausted(attempts: Vec<Attempt>) -> Self {
        Self {
            succeeded: false,
            matched_selector: None,
            attempted_selectors: attempts,
            final_observed_value: None,
        }
    }

    /// `selector: reason` pairs joined for an error message.
    pub fn trail(&self) -> String {
        self.attempted_selectors
            .iter()
            .map(|a| format!("{}: {}", a.selector, a.error))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExecutorError {
    #[error("candidate selector list is empty")]
    EmptyCandidates,
    #[error("session unavailable: {0}")]
    Session(DriverError),
}

#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    /// How long one candidate may take to become visible.
    pub candidate_timeout: Duration,
    pub poll_interval: Duration,
    /// How long a typed value may take to settle before verification fails.
    pub verify_window: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            candidate_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
            verify_window: Duration::from_secs(1),
        }
    }
}

enum CandidateFailure {
    Recoverable(String),
    Fatal(DriverError),
}

impl From<DriverError> for CandidateFailure {
    fn from(e: DriverError) -> Self {
        if e.is_fatal() {
            CandidateFailure::Fatal(e)
        } else {
            CandidateFailure::Recoverable(e.to_string())
        }
    }
}

/// Walks a priority-ordered selector list and applies one action to the first
/// candidate that accepts it.
#[derive(Clone, Debug, Default)]
pub struct SelectorExecutor {
    cfg: ExecutorConfig,
}

impl SelectorExecutor {
    pub fn new(cfg: ExecutorConfig) -> Self {
        Self { cfg }
    }

    /// Candidates are tried strictly in the given order and the walk stops at
    /// the first success. Per-candidate failures land in the outcome trail;
    /// only an empty list or a lost session is an `Err`.
    pub async fn execute<D>(
        &self,
        driver: &D,
        candidates: &[String],
        action: &FieldAction,
    ) -> Result<ActionOutcome, ExecutorError>
    where
        D: PageDriver + ?Sized,
    {
        if candidates.is_empty() {
            return Err(ExecutorError::EmptyCandidates);
        }
        let mut attempts = Vec::with_capacity(candidates.len());
        for selector in candidates {
            debug!(selector = %selector, action = action.kind(), "trying candidate");
            match self.attempt(driver, selector, action).await {
                Ok(observed) => {
                    info!(
                        selector = %selector,
                        action = action.kind(),
                        failed_before = attempts.len(),
                        "candidate succeeded"
                    );
                    return Ok(ActionOutcome::matched(selector, attempts, observed));
                }
                Err(CandidateFailure::Fatal(e)) => {
                    warn!(selector = %selector, "session lost mid-action: {}", e);
                    return Err(ExecutorError::Session(e));
                }
                Err(CandidateFailure::Recoverable(reason)) => {
                    warn!(selector = %selector, action = action.kind(), "candidate failed: {}", reason);
                    attempts.push(Attempt {
                        selector: selector.clone(),
                        error: reason,
                    });
                }
            }
        }
        Ok(ActionOutcome::exhausted(attempts))
    }

    async fn attempt<D>(
        &self,
        driver: &D,
        selector: &str,
        action: &FieldAction,
    ) -> Result<Option<String>, CandidateFailure>
    where
        D: PageDriver + ?Sized,
    {
        match driver
            .wait_for_visible(selector, self.cfg.candidate_timeout)
            .await
        {
            Ok(()) => {}
            Err(DriverError::Timeout(_)) => {
                return Err(CandidateFailure::Recoverable(format!(
                    "not found/visible within {}ms",
                    self.cfg.candidate_timeout.as_millis()
                )));
            }
            Err(e) => return Err(e.into()),
        }

        match action {
            FieldAction::Populate { value } => {
                driver.focus(selector).await?;
                driver.set_value(selector, "").await?;
                driver.dispatch_events(selector, &["input", "change"]).await?;
                driver.type_text(selector, value).await?;
                driver.dispatch_events(selector, &["change"]).await?;
                let observed = self.settled_value(driver, selector, value).await?;
                if observed != *value {
                    return Err(CandidateFailure::Recoverable(format!(
                        "verification mismatch: expected {:?} got {:?}",
                        value, observed
                    )));
                }
                Ok(Some(observed))
            }
            FieldAction::Trigger => {
                driver.scroll_into_view(selector).await?;
                driver.click(selector).await?;
                Ok(None)
            }
        }
    }

    /// Polls the live value until it equals `expected` or the verify window
    /// closes, returning the last value read.
    async fn settled_value<D>(
        &self,
        driver: &D,
        selector: &str,
        expected: &str,
    ) -> Result<String, DriverError>
    where
        D: PageDriver + ?Sized,
    {
        let start = Instant::now();
        loop {
            let observed = value_text(driver.read_property(selector, "value").await?);
            if observed == expected || start.elapsed() >= self.cfg.verify_window {
                return Ok(observed);
            }
            sleep(self.cfg.poll_interval).await;
        }
    }
}

fn value_text(v: Option<Value>) -> String {
    match v {
        None => String::new(),
        Some(Value::String(s)) => s,
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeElement, FakePage};

    fn quick() -> SelectorExecutor {
        SelectorExecutor::new(ExecutorConfig {
            candidate_timeout: Duration::from_millis(50),
            poll_interval: Duration::from_millis(5),
            verify_window: Duration::from_millis(20),
        })
    }

    fn sels(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn populate(v: &str) -> FieldAction {
        FieldAction::Populate { value: v.to_string() }
    }

    #[tokio::test]
    async fn matches_the_only_live_candidate_wherever_it_sits() {
        for pos in 0..3 {
            let page = FakePage::new(vec![FakeElement::new("input").id("email")]);
            let mut list = sels(&["#a", "#b", "#c"]);
            list[pos] = "#email".into();
            let out = quick()
                .execute(&page, &list, &populate("x@y.z"))
                .await
                .unwrap();
            assert!(out.succeeded);
            assert_eq!(out.matched_selector.as_deref(), Some("#email"));
            assert_eq!(out.attempted_selectors.len(), pos);
            assert_eq!(page.value_of("#email").as_deref(), Some("x@y.z"));
        }
    }

    #[tokio::test]
    async fn stops_after_first_success() {
        let page = FakePage::new(vec![
            FakeElement::new("button").id("go"),
            FakeElement::new("button").class("go"),
        ]);
        let out = quick()
            .execute(&page, &sels(&["#go", ".go"]), &FieldAction::Trigger)
            .await
            .unwrap();
        assert_eq!(out.matched_selector.as_deref(), Some("#go"));
        assert_eq!(page.clicks_of("#go"), 1);
        assert_eq!(page.clicks_of(".go"), 0);
    }

    #[tokio::test]
    async fn exhausted_trail_keeps_input_order_and_duplicates() {
        let page = FakePage::new(vec![FakeElement::new("input").id("hidden").hidden()]);
        let list = sels(&["#nope", "#hidden", "#nope"]);
        let out = quick().execute(&page, &list, &populate("v")).await.unwrap();
        assert!(!out.succeeded);
        assert!(out.matched_selector.is_none());
        let tried: Vec<_> = out.attempted_selectors.iter().map(|a| a.selector.as_str()).collect();
        assert_eq!(tried, vec!["#nope", "#hidden", "#nope"]);
        assert!(out.attempted_selectors[0].error.contains("not found/visible within 50ms"));
    }

    #[tokio::test]
    async fn rejected_value_is_a_verification_failure() {
        let page = FakePage::new(vec![
            FakeElement::new("input").id("short").max_length(3),
            FakeElement::new("input").name("full"),
        ]);
        let out = quick()
            .execute(&page, &sels(&["#short", "[name=\"full\"]"]), &populate("abcdef"))
            .await
            .unwrap();
        assert_eq!(out.matched_selector.as_deref(), Some("[name=\"full\"]"));
        assert_eq!(out.attempted_selectors.len(), 1);
        assert_eq!(
            out.attempted_selectors[0].error,
            r#"verification mismatch: expected "abcdef" got "abc""#
        );
        assert_eq!(out.final_observed_value.as_deref(), Some("abcdef"));
    }

    #[tokio::test]
    async fn populate_clears_previous_content_and_fires_events() {
        let page = FakePage::new(vec![FakeElement::new("input").id("q").value("old text")]);
        let out = quick().execute(&page, &sels(&["#q"]), &populate("new")).await.unwrap();
        assert!(out.succeeded);
        assert_eq!(page.value_of("#q").as_deref(), Some("new"));
        let events = page.events_of("#q");
        assert!(events.iter().any(|e| e == "input"));
        assert!(events.iter().any(|e| e == "change"));
    }

    #[tokio::test]
    async fn repeated_populate_is_idempotent() {
        let page = FakePage::new(vec![FakeElement::new("input").id("name")]);
        let exec = quick();
        for _ in 0..2 {
            let out = exec.execute(&page, &sels(&["#name"]), &populate("Bruce")).await.unwrap();
            assert!(out.succeeded);
            assert_eq!(out.final_observed_value.as_deref(), Some("Bruce"));
        }
        assert_eq!(page.value_of("#name").as_deref(), Some("Bruce"));
    }

    #[tokio::test]
    async fn invalid_selector_does_not_abort_the_walk() {
        let page = FakePage::new(vec![FakeElement::new("button").class("ok")]);
        let out = quick()
            .execute(&page, &sels(&["button[[", ".ok"]), &FieldAction::Trigger)
            .await
            .unwrap();
        assert!(out.succeeded);
        assert!(out.attempted_selectors[0].error.starts_with("script error"));
    }

    #[tokio::test]
    async fn empty_list_is_a_precondition_error() {
        let page = FakePage::new(vec![]);
        let err = quick().execute(&page, &[], &FieldAction::Trigger).await.unwrap_err();
        assert_eq!(err, ExecutorError::EmptyCandidates);
    }

    #[tokio::test]
    async fn closed_session_is_fatal() {
        let page = FakePage::new(vec![FakeElement::new("button").id("b")]);
        page.close().await.unwrap();
        let err = quick()
            .execute(&page, &sels(&["#b", "#c"]), &FieldAction::Trigger)
            .await
            .unwrap_err();
        assert_eq!(err, ExecutorError::Session(DriverError::SessionClosed));
    }
}
