use anyhow::Result;
use async_trait::async_trait;
use chromiumoxide::browser::Browser as OxideBrowser;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::error::CdpError;
use chromiumoxide::handler::Handler;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::driver::{DriverError, PageDriver};

#[derive(Clone, Debug)]
pub struct BrowserConfig {
    pub headless: bool,
    pub user_agent: Option<String>,
    /// Chromium binary; falls back to chromiumoxide's own detection.
    pub chrome_executable: Option<PathBuf>,
    /// Attach to a running browser instead of launching one.
    pub ws_url: Option<String>,
    pub viewport: (u32, u32),
    /// Upper bound for any single protocol round trip.
    pub step_timeout: Duration,
    pub poll_interval: Duration,
    pub extra_args: Vec<String>,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: true,
            user_agent: None,
            chrome_executable: std::env::var("CHROME_BIN").ok().map(PathBuf::from),
            ws_url: std::env::var("CHROME_WS_URL")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            viewport: (1280, 800),
            step_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
            extra_args: vec!["--disable-extensions".into()],
        }
    }
}

pub struct Browser {
    page: Page,
    browser: Mutex<OxideBrowser>,
    handler_task: Mutex<Option<JoinHandle<()>>>,
    closed: Arc<AtomicBool>,
    step_timeout: Duration,
    poll_interval: Duration,
    profile_dir: Option<PathBuf>,
}

impl Browser {
    pub async fn launch(cfg: BrowserConfig) -> Result<Self> {
        if let Some(ws) = cfg.ws_url.clone() {
            return Self::connect(&ws, cfg).await;
        }
        let mut builder = chromiumoxide::browser::BrowserConfig::builder();
        if !cfg.headless {
            builder = builder.with_head();
        }
        if let Some(exe) = &cfg.chrome_executable {
            builder = builder.chrome_executable(exe);
        }
        // A fresh profile per run avoids ProcessSingleton lock conflicts when
        // Chromium is restarted rapidly.
        let ts = SystemTime::now().duration_since(UNIX_EPOCH)?.as_millis();
        let mut profile_dir: PathBuf = std::env::temp_dir();
        profile_dir.push(format!("formhands-profile-{}-{}", std::process::id(), ts));
        std::fs::create_dir_all(&profile_dir)?;
        builder = builder
            .user_data_dir(profile_dir.clone())
            .no_sandbox()
            .arg("--no-first-run")
            .arg("--no-default-browser-check");
        for arg in &cfg.extra_args {
            builder = builder.arg(arg.as_str());
        }
        info!(headless = cfg.headless, profile = %profile_dir.display(), "launching chromium");
        let launched: Result<Self> = async {
            let bcfg = builder.build().map_err(|e| anyhow::anyhow!(e))?;
            let (browser, handler) = OxideBrowser::launch(bcfg).await?;
            Self::attach(browser, handler, cfg, Some(profile_dir.clone())).await
        }
        .await;
        if launched.is_err() {
            remove_profile_dir(&profile_dir);
        }
        launched
    }

    pub async fn connect(ws_url: &str, cfg: BrowserConfig) -> Result<Self> {
        info!(ws_url, "connecting to running browser");
        let (browser, handler) = OxideBrowser::connect(ws_url).await?;
        Self::attach(browser, handler, cfg, None).await
    }

    async fn attach(
        browser: OxideBrowser,
        mut handler: Handler,
        cfg: BrowserConfig,
        profile_dir: Option<PathBuf>,
    ) -> Result<Self> {
        let closed = Arc::new(AtomicBool::new(false));
        let flag = closed.clone();
        let handler_task = tokio::spawn(async move {
            while let Some(ev) = handler.next().await {
                if let Err(e) = ev {
                    debug!("browser handler error (ignoring): {}", e);
                }
            }
            flag.store(true, Ordering::SeqCst);
            info!("browser handler task ended");
        });

        let page = browser.new_page("about:blank").await?;
        if let Some(ua) = cfg.user_agent {
            page.set_user_agent(ua).await?;
        }
        // A non-zero viewport avoids 0-width screenshot errors.
        let metrics = SetDeviceMetricsOverrideParams::builder()
            .width(cfg.viewport.0 as i64)
            .height(cfg.viewport.1 as i64)
            .device_scale_factor(1.0)
            .mobile(false)
            .build()
            .map_err(|e| anyhow::anyhow!(e))?;
        if let Err(e) = page.execute(metrics).await {
            warn!("viewport override failed: {}", e);
        }

        Ok(Self {
            page,
            browser: Mutex::new(browser),
            handler_task: Mutex::new(Some(handler_task)),
            closed,
            step_timeout: cfg.step_timeout,
            poll_interval: cfg.poll_interval,
            profile_dir,
        })
    }

    fn ensure_open(&self) -> Result<(), DriverError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DriverError::SessionClosed);
        }
        Ok(())
    }

    /// Runs one protocol step under the step timeout.
    async fn guard<T, F>(&self, limit: Duration, fut: F) -> Result<T, DriverError>
    where
        F: Future<Output = std::result::Result<T, CdpError>>,
    {
        self.ensure_open()?;
        match tokio::time::timeout(limit, fut).await {
            Ok(res) => res.map_err(|e| self.classify(e)),
            Err(_) => {
                self.ensure_open()?;
                Err(DriverError::Timeout(limit))
            }
        }
    }

    fn classify(&self, err: CdpError) -> DriverError {
        match err {
            CdpError::Ws(_) | CdpError::ChannelSendError(_) | CdpError::NoResponse => {
                self.closed.store(true, Ordering::SeqCst);
                DriverError::SessionClosed
            }
            CdpError::Timeout => DriverError::Timeout(self.step_timeout),
            CdpError::NotFound => DriverError::NotFound("element".into()),
            CdpError::JavascriptException(details) => DriverError::Script(details.text.clone()),
            other => DriverError::Protocol(other.to_string()),
        }
    }

    async fn eval(&self, script: String) -> Result<Value, DriverError> {
        let res = self.guard(self.step_timeout, self.page.evaluate(script)).await?;
        Ok(res.value().cloned().unwrap_or(Value::Null))
    }

    async fn require(&self, selector: &str) -> Result<chromiumoxide::Element, DriverError> {
        self.guard(self.step_timeout, self.page.find_element(selector))
            .await
            .map_err(|e| match e {
                DriverError::Protocol(_) | DriverError::NotFound(_) => {
                    DriverError::NotFound(selector.to_string())
                }
                other => other,
            })
    }

    pub async fn close(&self) -> Result<()> {
        if !self.closed.load(Ordering::SeqCst) {
            let mut browser = self.browser.lock().await;
            if let Err(e) = browser.close().await {
                warn!("browser close returned error: {}", e);
            }
            let _ = tokio::time::timeout(Duration::from_secs(5), browser.wait()).await;
        }
        if let Some(task) = self.handler_task.lock().await.take() {
            let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
        }
        self.closed.store(true, Ordering::SeqCst);
        if let Some(dir) = &self.profile_dir {
            remove_profile_dir(dir);
        }
        info!("browser closed");
        Ok(())
    }
}

#[derive(Deserialize)]
struct PropertyRead {
    found: bool,
    value: Option<Value>,
}

fn remove_profile_dir(dir: &Path) {
    if let Err(e) = std::fs::remove_dir_all(dir) {
        debug!("failed to clean up profile dir {}: {}", dir.display(), e);
    }
}

fn js_str(s: &str) -> String {
    Value::String(s.to_owned()).to_string()
}

fn not_found(selector: &str) -> DriverError {
    DriverError::NotFound(selector.to_string())
}

#[async_trait]
impl PageDriver for Browser {
    async fn navigate(&self, url: &str, timeout: Duration) -> Result<(), DriverError> {
        self.guard(timeout, async {
            self.page.goto(url).await?;
            self.page.wait_for_navigation().await?;
            Ok(())
        })
        .await
    }

    async fn current_url(&self) -> Result<Option<String>, DriverError> {
        self.guard(self.step_timeout, self.page.url()).await
    }

    async fn wait_for_visible(&self, selector: &str, timeout: Duration) -> Result<(), DriverError> {
        let script = format!(
            r#"(() => {{
                const el = document.querySelector({sel});
                if (!el) return false;
                const r = el.getBoundingClientRect();
                return r.width > 0 && r.height > 0;
            }})()"#,
            sel = js_str(selector)
        );
        let start = Instant::now();
        loop {
            if self.eval(script.clone()).await? == Value::Bool(true) {
                return Ok(());
            }
            if start.elapsed() >= timeout {
                return Err(DriverError::Timeout(timeout));
            }
            sleep(self.poll_interval).await;
        }
    }

    async fn read_property(&self, selector: &str, prop: &str) -> Result<Option<Value>, DriverError> {
        let script = format!(
            r#"(() => {{
                const el = document.querySelector({sel});
                if (!el) return {{ found: false, value: null }};
                const v = el[{prop}];
                return {{ found: true, value: v === undefined ? null : v }};
            }})()"#,
            sel = js_str(selector),
            prop = js_str(prop)
        );
        let read: PropertyRead = serde_json::from_value(self.eval(script).await?)
            .map_err(|e| DriverError::Script(format!("unexpected property payload: {e}")))?;
        if !read.found {
            return Err(not_found(selector));
        }
        Ok(read.value.filter(|v| !v.is_null()))
    }

    async fn set_value(&self, selector: &str, value: &str) -> Result<(), DriverError> {
        // The prototype setter keeps framework-managed inputs in sync.
        let script = format!(
            r#"(() => {{
                const el = document.querySelector({sel});
                if (!el) return false;
                const desc = Object.getOwnPropertyDescriptor(Object.getPrototypeOf(el), 'value');
                if (desc && desc.set) {{ desc.set.call(el, {val}); }} else {{ el.value = {val}; }}
                return true;
            }})()"#,
            sel = js_str(selector),
            val = js_str(value)
        );
        match self.eval(script).await? {
            Value::Bool(true) => Ok(()),
            _ => Err(not_found(selector)),
        }
    }

    async fn dispatch_events(&self, selector: &str, events: &[&str]) -> Result<(), DriverError> {
        let names: Vec<Value> = events.iter().map(|e| Value::String((*e).to_string())).collect();
        let script = format!(
            r#"(() => {{
                const el = document.querySelector({sel});
                if (!el) return false;
                for (const name of {names}) {{
                    el.dispatchEvent(new Event(name, {{ bubbles: true }}));
                }}
                return true;
            }})()"#,
            sel = js_str(selector),
            names = Value::Array(names)
        );
        match self.eval(script).await? {
            Value::Bool(true) => Ok(()),
            _ => Err(not_found(selector)),
        }
    }

    async fn focus(&self, selector: &str) -> Result<(), DriverError> {
        let el = self.require(selector).await?;
        self.guard(self.step_timeout, async { el.focus().await.map(|_| ()) })
            .await
    }

    async fn scroll_into_view(&self, selector: &str) -> Result<(), DriverError> {
        let el = self.require(selector).await?;
        self.guard(self.step_timeout, async {
            el.scroll_into_view().await.map(|_| ())
        })
        .await
    }

    async fn click(&self, selector: &str) -> Result<(), DriverError> {
        let el = self.require(selector).await?;
        self.guard(self.step_timeout, async { el.click().await.map(|_| ()) })
            .await
    }

    async fn type_text(&self, selector: &str, text: &str) -> Result<(), DriverError> {
        let el = self.require(selector).await?;
        self.guard(self.step_timeout, async {
            el.type_str(text).await.map(|_| ())
        })
        .await
    }

    async fn capture_screenshot(&self) -> Result<Vec<u8>, DriverError> {
        let take = || async {
            self.page
                .screenshot(
                    ScreenshotParams::builder()
                        .format(CaptureScreenshotFormat::Png)
                        .full_page(true)
                        .build(),
                )
                .await
        };
        match self.guard(self.step_timeout, take()).await {
            Ok(bytes) => Ok(bytes),
            Err(DriverError::Protocol(msg)) if msg.contains("0 width") || msg.contains("0 height") => {
                // Force the viewport and retry once.
                if let Ok(metrics) = SetDeviceMetricsOverrideParams::builder()
                    .width(1280)
                    .height(800)
                    .device_scale_factor(1.0)
                    .mobile(false)
                    .build()
                {
                    let _ = self.page.execute(metrics).await;
                }
                sleep(Duration::from_millis(50)).await;
                self.guard(self.step_timeout, take()).await
            }
            Err(e) => Err(e),
        }
    }

    async fn evaluate(&self, script: &str) -> Result<Value, DriverError> {
        self.eval(script.to_string()).await
    }

    async fn close(&self) -> Result<(), DriverError> {
        Browser::close(self)
            .await
            .map_err(|e| DriverError::Protocol(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leftover_profiles() -> Vec<PathBuf> {
        let prefix = format!("formhands-profile-{}-", std::process::id());
        std::fs::read_dir(std::env::temp_dir())
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.path())
                    .filter(|p| {
                        p.file_name()
                            .is_some_and(|n| n.to_string_lossy().starts_with(&prefix))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn failed_launch_removes_profile_dir() {
        let cfg = BrowserConfig {
            chrome_executable: Some(PathBuf::from("/nonexistent/formhands-chromium")),
            ws_url: None,
            ..BrowserConfig::default()
        };
        assert!(Browser::launch(cfg).await.is_err());
        assert!(leftover_profiles().is_empty());
    }
}
