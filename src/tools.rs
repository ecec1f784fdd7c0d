use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::fs as async_fs;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::driver::{DriverError, PageDriver};
use crate::executor::{ActionOutcome, ExecutorError, FieldAction, SelectorExecutor};
use crate::inventory::{self, DomInventoryItem, TargetArea};

pub(crate) const READY_STATE_SCRIPT: &str = "document.readyState";

#[derive(Clone, Debug)]
pub struct ToolConfig {
    pub screenshot_dir: PathBuf,
    pub navigation_timeout: Duration,
    /// How long to poll for `document.readyState == "complete"` after a load.
    pub settle_timeout: Duration,
    /// Extra pause once the document is complete, for scripts that render
    /// the form after load. Capped by what is left of `settle_timeout`.
    pub settle_delay: Duration,
    pub poll_interval: Duration,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            screenshot_dir: std::env::var("FORMHANDS_SCREENSHOT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./assets/images")),
            navigation_timeout: Duration::from_secs(30),
            settle_timeout: Duration::from_secs(3),
            settle_delay: Duration::from_secs(1),
            poll_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("{operation} failed for every selector ({}): {}", .outcome.attempted_selectors.len(), .outcome.trail())]
    Exhausted {
        operation: &'static str,
        outcome: ActionOutcome,
    },
    #[error("{0}")]
    Driver(DriverError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("session unavailable: {0}")]
    Fatal(DriverError),
}

impl ToolError {
    /// Fatal errors end the run; everything else goes back to the model.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ToolError::Fatal(_))
    }
}

impl From<DriverError> for ToolError {
    fn from(e: DriverError) -> Self {
        if e.is_fatal() {
            ToolError::Fatal(e)
        } else {
            ToolError::Driver(e)
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OpenUrlResult {
    pub success: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenshotResult {
    pub file_path: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryResult {
    pub element_data: Vec<DomInventoryItem>,
}

/// A decoded tool invocation.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "name", content = "arguments", rename_all = "snake_case")]
pub enum ToolRequest {
    OpenUrl {
        url: String,
    },
    TakeScreenshot,
    AnalyzeDomElements {
        #[serde(default, rename = "targetArea")]
        target_area: Option<String>,
    },
    PopulateFormField {
        #[serde(rename = "targetSelectors")]
        target_selectors: Vec<String>,
        #[serde(rename = "inputData")]
        input_data: String,
    },
    TriggerElementAction {
        #[serde(rename = "elementSelectors")]
        element_selectors: Vec<String>,
    },
}

pub const TOOL_NAMES: [&str; 5] = [
    "open_url",
    "take_screenshot",
    "analyze_dom_elements",
    "populate_form_field",
    "trigger_element_action",
];

impl ToolRequest {
    pub fn parse(name: &str, arguments: Value) -> Result<Self, ToolError> {
        if !TOOL_NAMES.contains(&name) {
            return Err(ToolError::UnknownTool(name.to_string()));
        }
        // Argument-less tools may arrive with `{}` or null.
        let arguments = match (name, arguments) {
            ("take_screenshot", _) => Value::Null,
            (_, Value::Null) => json!({}),
            (_, v) => v,
        };
        let mut envelope = json!({ "name": name });
        if !arguments.is_null() {
            envelope["arguments"] = arguments;
        }
        serde_json::from_value(envelope).map_err(|e| ToolError::InvalidArguments(e.to_string()))
    }
}

/// Chat Completions `tools` array for the five operations.
pub fn definitions() -> Value {
    json!([
        {"type": "function", "function": {
            "name": "open_url",
            "description": "Open the given URL in the browser and wait for the page to load.",
            "parameters": {
                "type": "object",
                "properties": { "url": { "type": "string", "description": "Absolute URL to open" } },
                "required": ["url"]
            }
        }},
        {"type": "function", "function": {
            "name": "take_screenshot",
            "description": "Take a screenshot of the current page and save it as a PNG.",
            "parameters": { "type": "object", "properties": {} }
        }},
        {"type": "function", "function": {
            "name": "analyze_dom_elements",
            "description": "List forms, input fields, and clickable elements on the current page, each with suggested CSS selectors.",
            "parameters": {
                "type": "object",
                "properties": {
                    "targetArea": {
                        "type": ["string", "null"],
                        "description": "What to list: 'forms' (everything), 'inputs', or 'buttons'"
                    }
                }
            }
        }},
        {"type": "function", "function": {
            "name": "populate_form_field",
            "description": "Fill a form field, trying each CSS selector in order until one accepts the value.",
            "parameters": {
                "type": "object",
                "properties": {
                    "targetSelectors": {
                        "type": "array", "items": { "type": "string" },
                        "description": "CSS selectors to attempt in priority order"
                    },
                    "inputData": { "type": "string", "description": "Value to type into the field" }
                },
                "required": ["targetSelectors", "inputData"]
            }
        }},
        {"type": "function", "function": {
            "name": "trigger_element_action",
            "description": "Click an element, trying each CSS selector in order until one works.",
            "parameters": {
                "type": "object",
                "properties": {
                    "elementSelectors": {
                        "type": "array", "items": { "type": "string" },
                        "description": "CSS selectors to attempt in priority order"
                    }
                },
                "required": ["elementSelectors"]
            }
        }}
    ])
}

/// The agent-callable operations over one borrowed page.
pub struct Toolbox<'d, D: PageDriver + ?Sized> {
    driver: &'d D,
    executor: SelectorExecutor,
    cfg: ToolConfig,
}

impl<'d, D: PageDriver + ?Sized> Toolbox<'d, D> {
    pub fn new(driver: &'d D, executor: SelectorExecutor, cfg: ToolConfig) -> Self {
        Self { driver, executor, cfg }
    }

    /// Decode and run one named call, returning its JSON result.
    pub async fn call(&self, name: &str, arguments: Value) -> Result<Value, ToolError> {
        let request = ToolRequest::parse(name, arguments)?;
        self.dispatch(request).await
    }

    pub async fn dispatch(&self, request: ToolRequest) -> Result<Value, ToolError> {
        Ok(match request {
            ToolRequest::OpenUrl { url } => to_json(self.open_url(&url).await?),
            ToolRequest::TakeScreenshot => to_json(self.take_screenshot().await?),
            ToolRequest::AnalyzeDomElements { target_area } => {
                to_json(self.analyze_dom_elements(target_area.as_deref()).await?)
            }
            ToolRequest::PopulateFormField {
                target_selectors,
                input_data,
            } => to_json(self.populate_form_field(&target_selectors, &input_data).await?),
            ToolRequest::TriggerElementAction { element_selectors } => {
                to_json(self.trigger_element_action(&element_selectors).await?)
            }
        })
    }

    pub async fn open_url(&self, url: &str) -> Result<OpenUrlResult, ToolError> {
        if url.trim().is_empty() {
            return Err(ToolError::InvalidArguments("url must not be empty".into()));
        }
        self.driver.navigate(url, self.cfg.navigation_timeout).await?;
        self.settle().await?;
        match self.driver.current_url().await {
            Ok(Some(landed)) if landed != url => info!(url, landed = %landed, "browsed to page"),
            _ => info!(url, "browsed to page"),
        }
        Ok(OpenUrlResult { success: true })
    }

    async fn settle(&self) -> Result<(), ToolError> {
        let start = Instant::now();
        loop {
            match self.driver.evaluate(READY_STATE_SCRIPT).await {
                Ok(Value::String(s)) if s == "complete" => {
                    let left = self.cfg.settle_timeout.saturating_sub(start.elapsed());
                    sleep(self.cfg.settle_delay.min(left)).await;
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) if e.is_fatal() => return Err(ToolError::Fatal(e)),
                Err(e) => warn!("ready state check failed: {}", e),
            }
            if start.elapsed() >= self.cfg.settle_timeout {
                warn!("page did not reach readyState=complete, continuing");
                return Ok(());
            }
            sleep(self.cfg.poll_interval).await;
        }
    }

    pub async fn take_screenshot(&self) -> Result<ScreenshotResult, ToolError> {
        let png = self.driver.capture_screenshot().await?;
        async_fs::create_dir_all(&self.cfg.screenshot_dir).await?;
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let mut path = self.cfg.screenshot_dir.join(format!("screenshot-{ts}.png"));
        let mut n = 1;
        while async_fs::try_exists(&path).await? {
            path = self.cfg.screenshot_dir.join(format!("screenshot-{ts}-{n}.png"));
            n += 1;
        }
        async_fs::write(&path, &png).await?;
        let file_path = path.to_string_lossy().to_string();
        info!(path = %file_path, bytes = png.len(), "screenshot saved");
        Ok(ScreenshotResult { file_path })
    }

    pub async fn analyze_dom_elements(
        &self,
        target_area: Option<&str>,
    ) -> Result<InventoryResult, ToolError> {
        let element_data = inventory::inspect(self.driver, TargetArea::parse(target_area)).await?;
        Ok(InventoryResult { element_data })
    }

    pub async fn populate_form_field(
        &self,
        target_selectors: &[String],
        input_data: &str,
    ) -> Result<ActionOutcome, ToolError> {
        let action = FieldAction::Populate {
            value: input_data.to_string(),
        };
        self.run_action("populate_form_field", "targetSelectors", target_selectors, &action)
            .await
    }

    pub async fn trigger_element_action(
        &self,
        element_selectors: &[String],
    ) -> Result<ActionOutcome, ToolError> {
        self.run_action(
            "trigger_element_action",
            "elementSelectors",
            element_selectors,
            &FieldAction::Trigger,
        )
        .await
    }

    async fn run_action(
        &self,
        operation: &'static str,
        field: &str,
        candidates: &[String],
        action: &FieldAction,
    ) -> Result<ActionOutcome, ToolError> {
        let outcome = self
            .executor
            .execute(self.driver, candidates, action)
            .await
            .map_err(|e| match e {
                ExecutorError::EmptyCandidates => {
                    ToolError::InvalidArguments(format!("{field} must not be empty"))
                }
                ExecutorError::Session(e) => ToolError::Fatal(e),
            })?;
        if !outcome.succeeded {
            return Err(ToolError::Exhausted { operation, outcome });
        }
        Ok(outcome)
    }
}

fn to_json<T: Serialize>(value: T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}
