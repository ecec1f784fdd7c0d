//! Runs against a real Chromium. `cargo test -- --ignored` with `CHROME_BIN`
//! set (or a browser on PATH).

use std::time::Duration;

use formhands::tools::ToolConfig;
use formhands::{Browser, BrowserConfig, ExecutorConfig, PageDriver, SelectorExecutor, ToolError, Toolbox};
use serde_json::{json, Value};

const SIGNUP_HTML: &str = r#"<!DOCTYPE html>
<html><body>
  <div><form action="/login"><input name="user"></form></div>
  <div>
    <form>
      <input id="email" name="email" type="email" placeholder="Email" required>
      <input type="hidden" name="token" value="t">
      <input type="submit" value="Create Account">
    </form>
  </div>
  <button class="btn-submit" onclick="this.dataset.clicked = 'yes'">Go</button>
</body></html>"#;

#[tokio::test]
#[ignore = "needs a Chromium binary"]
async fn signup_page_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let page_path = dir.path().join("signup.html");
    std::fs::write(&page_path, SIGNUP_HTML).unwrap();

    let browser = Browser::launch(BrowserConfig {
        ws_url: None,
        ..BrowserConfig::default()
    })
    .await
    .unwrap();
    let tools = Toolbox::new(
        &browser,
        SelectorExecutor::new(ExecutorConfig {
            candidate_timeout: Duration::from_millis(500),
            ..ExecutorConfig::default()
        }),
        ToolConfig {
            screenshot_dir: dir.path().join("shots"),
            settle_delay: Duration::ZERO,
            ..ToolConfig::default()
        },
    );

    let url = format!("file://{}", page_path.display());
    assert_eq!(tools.call("open_url", json!({ "url": url })).await.unwrap(), json!({"success": true}));

    let inventory = tools.call("analyze_dom_elements", json!({})).await.unwrap();
    let items = inventory["elementData"].as_array().unwrap();
    let kinds: Vec<_> = items.iter().map(|i| i["kind"].as_str().unwrap()).collect();
    assert_eq!(kinds, vec!["form", "form", "field", "field", "field", "clickable", "clickable"]);
    let token = items.iter().find(|i| i["name"] == "token").unwrap();
    assert_eq!(token["visible"], false);

    // The bare second form is addressed by its path and must resolve to it.
    let second_form = items[1]["selectors"][0].as_str().unwrap();
    assert_eq!(second_form, "body > div:nth-of-type(2) > form:nth-of-type(1)");
    let same = browser
        .evaluate(&format!("document.querySelector({second_form:?}) === document.forms[1]"))
        .await
        .unwrap();
    assert_eq!(same, Value::Bool(true));

    let filled = tools
        .call("populate_form_field", json!({"targetSelectors": ["#missing", "#email"], "inputData": "a@b.com"}))
        .await
        .unwrap();
    assert_eq!(filled["matchedSelector"], "#email");
    assert_eq!(filled["finalObservedValue"], "a@b.com");

    let err = tools
        .call("populate_form_field", json!({"targetSelectors": ["[name=\"token\"]"], "inputData": "x"}))
        .await
        .unwrap_err();
    assert!(matches!(err, ToolError::Exhausted { .. }));

    let clicked = tools
        .call("trigger_element_action", json!({"elementSelectors": ["#submit", ".btn-submit"]}))
        .await
        .unwrap();
    assert_eq!(clicked["matchedSelector"], ".btn-submit");
    let flag = browser
        .evaluate("document.querySelector('.btn-submit').dataset.clicked")
        .await
        .unwrap();
    assert_eq!(flag, json!("yes"));

    browser.close().await.unwrap();
}
