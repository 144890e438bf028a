//! In-memory browser used by unit tests across the crate.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::browser::page::{
    BrowserCookie, BrowserError, BrowserHandle, BrowserLauncher, PageHandle, StorageArea,
};

/// What a fake URL serves
#[derive(Debug, Clone, Default)]
pub struct PageFixture {
    pub html: String,
    /// selector -> number of matching elements
    pub selectors: HashMap<String, usize>,
    pub texts: HashMap<String, String>,
    pub attributes: HashMap<(String, String), String>,
    /// (needle, result): the first script containing `needle` returns `result`
    pub scripts: Vec<(String, serde_json::Value)>,
    /// cookies the site sets when loaded
    pub sets_cookies: Vec<BrowserCookie>,
    pub fail_navigation: bool,
}

impl PageFixture {
    pub fn html(html: &str) -> Self {
        Self {
            html: html.to_string(),
            ..Default::default()
        }
    }

    pub fn with_selector(mut self, selector: &str) -> Self {
        self.selectors.insert(selector.to_string(), 1);
        self
    }

    pub fn with_text(mut self, selector: &str, text: &str) -> Self {
        self.selectors.insert(selector.to_string(), 1);
        self.texts.insert(selector.to_string(), text.to_string());
        self
    }

    pub fn with_attribute(mut self, selector: &str, name: &str, value: &str) -> Self {
        self.selectors.insert(selector.to_string(), 1);
        self.attributes
            .insert((selector.to_string(), name.to_string()), value.to_string());
        self
    }

    pub fn with_script(mut self, needle: &str, result: serde_json::Value) -> Self {
        self.scripts.push((needle.to_string(), result));
        self
    }

    pub fn with_cookie(mut self, cookie: BrowserCookie) -> Self {
        self.sets_cookies.push(cookie);
        self
    }
}

/// Shared fake internet plus an event log of everything pages did
#[derive(Default)]
pub struct FakeWeb {
    fixtures: Mutex<HashMap<String, PageFixture>>,
    events: Mutex<Vec<String>>,
    scripts: Mutex<Vec<String>>,
    pub open_pages: AtomicUsize,
}

impl FakeWeb {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn serve(&self, url: &str, fixture: PageFixture) {
        self.fixtures.lock().unwrap().insert(url.to_string(), fixture);
    }

    pub fn fixture(&self, url: &str) -> PageFixture {
        self.fixtures
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .unwrap_or_default()
    }

    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn evaluated_scripts(&self) -> Vec<String> {
        self.scripts.lock().unwrap().clone()
    }
}

#[derive(Default)]
struct BrowserState {
    cookies: Vec<BrowserCookie>,
    storage: HashMap<StorageArea, HashMap<String, String>>,
}

pub struct FakeLauncher {
    web: Arc<FakeWeb>,
    launches: Mutex<Vec<bool>>,
    fail_visible: AtomicBool,
}

impl FakeLauncher {
    pub fn new(web: Arc<FakeWeb>) -> Arc<Self> {
        Arc::new(Self {
            web,
            launches: Mutex::new(Vec::new()),
            fail_visible: AtomicBool::new(false),
        })
    }

    /// Every later visible launch fails, as on a host without a display
    pub fn fail_visible_launches(&self) {
        self.fail_visible.store(true, Ordering::SeqCst);
    }

    /// Headless flag of every launch, in order
    pub fn launches(&self) -> Vec<bool> {
        self.launches.lock().unwrap().clone()
    }
}

#[async_trait]
impl BrowserLauncher for FakeLauncher {
    async fn launch(&self, headless: bool) -> Result<Arc<dyn BrowserHandle>, BrowserError> {
        self.launches.lock().unwrap().push(headless);
        if !headless && self.fail_visible.load(Ordering::SeqCst) {
            return Err(BrowserError::Launch("no display".to_string()));
        }
        self.web.record(format!("launch:{}", if headless { "headless" } else { "visible" }));
        Ok(Arc::new(FakeBrowser {
            web: Arc::clone(&self.web),
            state: Arc::new(Mutex::new(BrowserState::default())),
        }))
    }
}

pub struct FakeBrowser {
    web: Arc<FakeWeb>,
    state: Arc<Mutex<BrowserState>>,
}

#[async_trait]
impl BrowserHandle for FakeBrowser {
    async fn new_page(&self) -> Result<Box<dyn PageHandle>, BrowserError> {
        self.web.record("new_page".to_string());
        self.web.open_pages.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakePage::new(
            Arc::clone(&self.web),
            Arc::clone(&self.state),
        )))
    }

    async fn shutdown(&self) -> Result<(), BrowserError> {
        self.web.record("shutdown".to_string());
        Ok(())
    }
}

pub struct FakePage {
    web: Arc<FakeWeb>,
    state: Arc<Mutex<BrowserState>>,
    url: Mutex<String>,
    closed: AtomicBool,
}

impl FakePage {
    fn new(web: Arc<FakeWeb>, state: Arc<Mutex<BrowserState>>) -> Self {
        Self {
            web,
            state,
            url: Mutex::new("about:blank".to_string()),
            closed: AtomicBool::new(false),
        }
    }

    /// Standalone page, for tests that do not need a browser
    pub fn standalone(web: Arc<FakeWeb>, url: &str) -> Self {
        let page = Self::new(web, Arc::new(Mutex::new(BrowserState::default())));
        *page.url.lock().unwrap() = url.to_string();
        page
    }

    fn current(&self) -> PageFixture {
        self.web.fixture(&self.url.lock().unwrap())
    }

    fn upsert_cookie(&self, cookie: &BrowserCookie) {
        let mut state = self.state.lock().unwrap();
        state.cookies.retain(|c| c.key() != cookie.key());
        state.cookies.push(cookie.clone());
    }
}

#[async_trait]
impl PageHandle for FakePage {
    async fn goto(&self, url: &str) -> Result<(), BrowserError> {
        self.web.record(format!("goto:{}", url));
        let fixture = self.web.fixture(url);
        if fixture.fail_navigation {
            return Err(BrowserError::Navigation {
                url: url.to_string(),
                reason: "net::ERR_CONNECTION_REFUSED".to_string(),
            });
        }
        *self.url.lock().unwrap() = url.to_string();
        for cookie in &fixture.sets_cookies {
            self.upsert_cookie(cookie);
        }
        Ok(())
    }

    async fn wait_for_load(&self) -> Result<(), BrowserError> {
        Ok(())
    }

    async fn wait_for_idle(&self, _quiet: Duration, _limit: Duration) -> Result<(), BrowserError> {
        Ok(())
    }

    async fn current_url(&self) -> Result<String, BrowserError> {
        Ok(self.url.lock().unwrap().clone())
    }

    async fn content(&self) -> Result<String, BrowserError> {
        Ok(self.current().html)
    }

    async fn evaluate(&self, script: &str) -> Result<serde_json::Value, BrowserError> {
        self.web.scripts.lock().unwrap().push(script.to_string());
        let fixture = self.current();
        Ok(fixture
            .scripts
            .iter()
            .find(|(needle, _)| script.contains(needle.as_str()))
            .map(|(_, value)| value.clone())
            .unwrap_or(serde_json::Value::Null))
    }

    async fn cookies(&self) -> Result<Vec<BrowserCookie>, BrowserError> {
        Ok(self.state.lock().unwrap().cookies.clone())
    }

    async fn set_cookie(&self, cookie: &BrowserCookie, url: &str) -> Result<(), BrowserError> {
        // A cookie needs an http(s) URL to attach to, whatever the page shows
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(BrowserError::Protocol(format!("cannot set cookie for {}", url)));
        }
        self.web.record(format!("set_cookie:{}", cookie.name));
        self.upsert_cookie(cookie);
        Ok(())
    }

    async fn storage_items(&self, area: StorageArea) -> Result<HashMap<String, String>, BrowserError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .storage
            .get(&area)
            .cloned()
            .unwrap_or_default())
    }

    async fn set_storage_items(
        &self,
        area: StorageArea,
        items: &HashMap<String, String>,
    ) -> Result<(), BrowserError> {
        self.web.record(format!("set_storage:{}", area.js_name()));
        let mut state = self.state.lock().unwrap();
        let entry = state.storage.entry(area).or_default();
        for (key, value) in items {
            entry.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    async fn exists(&self, selector: &str) -> Result<bool, BrowserError> {
        Ok(self.current().selectors.get(selector).copied().unwrap_or(0) > 0)
    }

    async fn count(&self, selector: &str) -> Result<usize, BrowserError> {
        Ok(self.current().selectors.get(selector).copied().unwrap_or(0))
    }

    async fn click(&self, selector: &str) -> Result<(), BrowserError> {
        if !self.exists(selector).await? {
            return Err(BrowserError::ElementNotFound(selector.to_string()));
        }
        self.web.record(format!("click:{}", selector));
        Ok(())
    }

    async fn type_into(&self, selector: &str, text: &str) -> Result<(), BrowserError> {
        if !self.exists(selector).await? {
            return Err(BrowserError::ElementNotFound(selector.to_string()));
        }
        self.web.record(format!("type:{}:{}", selector, text));
        Ok(())
    }

    async fn text_of(&self, selector: &str) -> Result<String, BrowserError> {
        self.current()
            .texts
            .get(selector)
            .cloned()
            .ok_or_else(|| BrowserError::ElementNotFound(selector.to_string()))
    }

    async fn attribute_of(&self, selector: &str, name: &str) -> Result<Option<String>, BrowserError> {
        let fixture = self.current();
        if fixture.selectors.get(selector).copied().unwrap_or(0) == 0 {
            return Err(BrowserError::ElementNotFound(selector.to_string()));
        }
        Ok(fixture
            .attributes
            .get(&(selector.to_string(), name.to_string()))
            .cloned())
    }

    async fn screenshot(&self) -> Result<Vec<u8>, BrowserError> {
        self.web.record("screenshot".to_string());
        Ok(vec![0x89, b'P', b'N', b'G'])
    }

    async fn close(&self) -> Result<(), BrowserError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.web.record("close".to_string());
            self.web.open_pages.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
