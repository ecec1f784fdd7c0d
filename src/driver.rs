use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DriverError {
    #[error("timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error("no element matches {0}")]
    NotFound(String),
    #[error("browser session closed")]
    SessionClosed,
    #[error("script error: {0}")]
    Script(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl DriverError {
    /// The session is gone; retrying another selector cannot help.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DriverError::SessionClosed)
    }
}

/// Primitive operations against one live document.
///
/// Implementations are borrowed per call and must be driven serially: the
/// executor and tool layer never issue two operations concurrently.
#[async_trait]
pub trait PageDriver: Send + Sync {
    /// Navigate and wait for the load to settle.
    async fn navigate(&self, url: &str, timeout: Duration) -> Result<(), DriverError>;

    async fn current_url(&self) -> Result<Option<String>, DriverError>;

    /// Resolve once an element matching `selector` exists and has a non-empty
    /// layout box, polling until `timeout`.
    async fn wait_for_visible(&self, selector: &str, timeout: Duration) -> Result<(), DriverError>;

    /// Read a DOM property of the first match. `Ok(None)` means the property is
    /// null or undefined; a missing element is `DriverError::NotFound`.
    async fn read_property(&self, selector: &str, prop: &str) -> Result<Option<Value>, DriverError>;

    /// Assign `value` through the element's native setter, without events.
    async fn set_value(&self, selector: &str, value: &str) -> Result<(), DriverError>;

    /// Dispatch bubbling synthetic events, in order.
    async fn dispatch_events(&self, selector: &str, events: &[&str]) -> Result<(), DriverError>;

    async fn focus(&self, selector: &str) -> Result<(), DriverError>;

    async fn scroll_into_view(&self, selector: &str) -> Result<(), DriverError>;

    /// Pointer click at the element's clickable point.
    async fn click(&self, selector: &str) -> Result<(), DriverError>;

    /// Keystroke-by-keystroke input into the element.
    async fn type_text(&self, selector: &str, text: &str) -> Result<(), DriverError>;

    /// PNG bytes of the current page.
    async fn capture_screenshot(&self) -> Result<Vec<u8>, DriverError>;

    /// Evaluate an expression in the page and return its JSON value.
    async fn evaluate(&self, script: &str) -> Result<Value, DriverError>;

    /// Release the session. Every later call fails with `SessionClosed`.
    async fn close(&self) -> Result<(), DriverError>;
}
