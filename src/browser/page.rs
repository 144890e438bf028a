use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by the browser layer
#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("browser is not running")]
    NotRunning,

    #[error("failed to launch browser: {0}")]
    Launch(String),

    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },

    #[error("element not found: {0}")]
    ElementNotFound(String),

    #[error("script evaluation failed: {0}")]
    Script(String),

    #[error("browser protocol error: {0}")]
    Protocol(String),

    #[error("page operation timed out after {0:?}")]
    Timeout(Duration),
}

/// Cookie as captured from, and replayed into, the browser
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrowserCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    #[serde(default = "default_cookie_path")]
    pub path: String,
    /// Seconds since the epoch, negative for session cookies
    #[serde(default)]
    pub expires: f64,
    #[serde(default)]
    pub secure: bool,
    #[serde(default, rename = "httpOnly")]
    pub http_only: bool,
    #[serde(default, rename = "sameSite", skip_serializing_if = "Option::is_none")]
    pub same_site: Option<String>,
}

fn default_cookie_path() -> String {
    "/".to_string()
}

impl BrowserCookie {
    /// Whether this cookie would be sent to `host` (domain-suffix match)
    pub fn matches_host(&self, host: &str) -> bool {
        if self.domain.is_empty() {
            return false;
        }
        host.ends_with(&self.domain) || format!(".{}", host).ends_with(&self.domain)
    }

    /// Identity used when the browser replaces a cookie
    pub fn key(&self) -> (&str, &str, &str) {
        (&self.name, &self.domain, &self.path)
    }
}

/// Web storage area
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageArea {
    Local,
    Session,
}

impl StorageArea {
    pub fn js_name(self) -> &'static str {
        match self {
            StorageArea::Local => "localStorage",
            StorageArea::Session => "sessionStorage",
        }
    }
}

/// A live browser tab.
///
/// Everything the crawl pipeline does to a page goes through this trait, so the
/// CDP backend can be swapped for an in-memory page in tests.
#[async_trait]
pub trait PageHandle: Send + Sync {
    /// Navigate to `url`
    async fn goto(&self, url: &str) -> Result<(), BrowserError>;

    /// Wait for the load event of the current navigation
    async fn wait_for_load(&self) -> Result<(), BrowserError>;

    /// Wait until no new network resources appeared for `quiet`, bounded by `limit`
    async fn wait_for_idle(&self, quiet: Duration, limit: Duration) -> Result<(), BrowserError>;

    /// URL currently shown by the page
    async fn current_url(&self) -> Result<String, BrowserError>;

    /// Serialized DOM of the page
    async fn content(&self) -> Result<String, BrowserError>;

    /// Evaluate a script expression and return its JSON value (promises are awaited)
    async fn evaluate(&self, script: &str) -> Result<serde_json::Value, BrowserError>;

    /// All cookies visible to the page
    async fn cookies(&self) -> Result<Vec<BrowserCookie>, BrowserError>;

    /// Set one cookie scoped to `url`. The page itself may still be on `about:blank`.
    async fn set_cookie(&self, cookie: &BrowserCookie, url: &str) -> Result<(), BrowserError>;

    /// Read every item of a storage area
    async fn storage_items(&self, area: StorageArea) -> Result<HashMap<String, String>, BrowserError>;

    /// Write the given items into a storage area
    async fn set_storage_items(
        &self,
        area: StorageArea,
        items: &HashMap<String, String>,
    ) -> Result<(), BrowserError>;

    /// Whether at least one element matches `selector`
    async fn exists(&self, selector: &str) -> Result<bool, BrowserError>;

    /// Number of elements matching `selector`
    async fn count(&self, selector: &str) -> Result<usize, BrowserError>;

    /// Click the first element matching `selector`
    async fn click(&self, selector: &str) -> Result<(), BrowserError>;

    /// Type text into the first element matching `selector`
    async fn type_into(&self, selector: &str, text: &str) -> Result<(), BrowserError>;

    /// Inner text of the first element matching `selector`
    async fn text_of(&self, selector: &str) -> Result<String, BrowserError>;

    /// Attribute value of the first element matching `selector`
    async fn attribute_of(&self, selector: &str, name: &str) -> Result<Option<String>, BrowserError>;

    /// PNG screenshot of the viewport
    async fn screenshot(&self) -> Result<Vec<u8>, BrowserError>;

    /// Close the tab
    async fn close(&self) -> Result<(), BrowserError>;
}

/// A running browser process that can open tabs
#[async_trait]
pub trait BrowserHandle: Send + Sync {
    async fn new_page(&self) -> Result<Box<dyn PageHandle>, BrowserError>;

    async fn shutdown(&self) -> Result<(), BrowserError>;
}

/// Starts browser processes
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self, headless: bool) -> Result<Arc<dyn BrowserHandle>, BrowserError>;
}
