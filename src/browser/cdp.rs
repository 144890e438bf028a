use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::network::{
    CookieParam, CookieSameSite, SetCookiesParams, TimeSinceEpoch,
};
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::browser::page::{
    BrowserCookie, BrowserError, BrowserHandle, BrowserLauncher, PageHandle, StorageArea,
};
use crate::cli::config::BrowserSettings;

fn protocol(err: impl std::fmt::Display) -> BrowserError {
    BrowserError::Protocol(err.to_string())
}

/// Quote a string as a JavaScript literal
fn js_string(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

/// Launches Chromium over the DevTools protocol
pub struct CdpLauncher {
    settings: BrowserSettings,
    user_agent: Option<String>,
}

impl CdpLauncher {
    pub fn new(settings: BrowserSettings, user_agent: Option<String>) -> Self {
        Self { settings, user_agent }
    }

    fn config(&self, headless: bool) -> Result<BrowserConfig, BrowserError> {
        let mut builder = BrowserConfig::builder()
            .request_timeout(Duration::from_secs(self.settings.page_timeout_secs))
            .window_size(self.settings.window_width, self.settings.window_height);

        if !headless {
            builder = builder.with_head();
        }

        if let Some(path) = &self.settings.executable_path {
            builder = builder.chrome_executable(PathBuf::from(path));
        }

        // Hide the automation switches that bot mitigation looks for
        builder = builder
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-dev-shm-usage")
            .arg("--no-first-run")
            .arg("--no-default-browser-check");

        if let Some(agent) = &self.user_agent {
            builder = builder.arg(format!("--user-agent={}", agent));
        }

        if let Some(proxy) = &self.settings.proxy_url {
            builder = builder.arg(format!("--proxy-server={}", proxy));
        }

        for arg in &self.settings.extra_args {
            builder = builder.arg(arg.clone());
        }

        builder.build().map_err(BrowserError::Launch)
    }
}

#[async_trait]
impl BrowserLauncher for CdpLauncher {
    async fn launch(&self, headless: bool) -> Result<Arc<dyn BrowserHandle>, BrowserError> {
        let config = self.config(headless)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| BrowserError::Launch(e.to_string()))?;

        // The handler drives the websocket; the browser is dead once it stops
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("CDP handler event error: {}", e);
                }
            }
        });

        debug!("Browser launched (headless: {})", headless);

        Ok(Arc::new(CdpBrowser {
            browser: Mutex::new(Some(browser)),
            handler_task,
            page_timeout: Duration::from_secs(self.settings.page_timeout_secs),
        }))
    }
}

pub struct CdpBrowser {
    browser: Mutex<Option<Browser>>,
    handler_task: JoinHandle<()>,
    page_timeout: Duration,
}

#[async_trait]
impl BrowserHandle for CdpBrowser {
    async fn new_page(&self) -> Result<Box<dyn PageHandle>, BrowserError> {
        let guard = self.browser.lock().await;
        let browser = guard.as_ref().ok_or(BrowserError::NotRunning)?;
        let page = browser.new_page("about:blank").await.map_err(protocol)?;
        Ok(Box::new(CdpPage {
            page,
            timeout: self.page_timeout,
        }))
    }

    async fn shutdown(&self) -> Result<(), BrowserError> {
        if let Some(mut browser) = self.browser.lock().await.take() {
            if let Err(e) = browser.close().await {
                warn!("Error closing browser: {}", e);
            }
        }
        self.handler_task.abort();
        Ok(())
    }
}

pub struct CdpPage {
    page: Page,
    timeout: Duration,
}

impl CdpPage {
    async fn eval_value(&self, script: String) -> Result<serde_json::Value, BrowserError> {
        let result = self
            .page
            .evaluate(script)
            .await
            .map_err(|e| BrowserError::Script(e.to_string()))?;
        Ok(result.value().cloned().unwrap_or(serde_json::Value::Null))
    }
}

#[async_trait]
impl PageHandle for CdpPage {
    async fn goto(&self, url: &str) -> Result<(), BrowserError> {
        match tokio::time::timeout(self.timeout, self.page.goto(url)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(BrowserError::Navigation {
                url: url.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(BrowserError::Timeout(self.timeout)),
        }
    }

    async fn wait_for_load(&self) -> Result<(), BrowserError> {
        match tokio::time::timeout(self.timeout, self.page.wait_for_navigation()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(protocol(e)),
            Err(_) => Err(BrowserError::Timeout(self.timeout)),
        }
    }

    async fn wait_for_idle(&self, quiet: Duration, limit: Duration) -> Result<(), BrowserError> {
        // Poll the resource timeline until it stops growing
        let script = format!(
            r#"(async () => {{
                const limitMs = {limit};
                const quietMs = {quiet};
                const interval = 250;
                const start = Date.now();
                let last = performance.getEntriesByType('resource').length;
                let stable = 0;
                while (Date.now() - start < limitMs) {{
                    await new Promise(r => setTimeout(r, interval));
                    const now = performance.getEntriesByType('resource').length;
                    if (document.readyState === 'complete' && now === last) {{
                        stable += interval;
                        if (stable >= quietMs) return true;
                    }} else {{
                        stable = 0;
                    }}
                    last = now;
                }}
                return false;
            }})()"#,
            limit = limit.as_millis(),
            quiet = quiet.as_millis(),
        );

        let settled = self.eval_value(script).await?;
        if settled.as_bool() != Some(true) {
            debug!("Network idle not reached within {:?}", limit);
        }
        Ok(())
    }

    async fn current_url(&self) -> Result<String, BrowserError> {
        Ok(self.page.url().await.map_err(protocol)?.unwrap_or_default())
    }

    async fn content(&self) -> Result<String, BrowserError> {
        self.page.content().await.map_err(protocol)
    }

    async fn evaluate(&self, script: &str) -> Result<serde_json::Value, BrowserError> {
        self.eval_value(script.to_string()).await
    }

    async fn cookies(&self) -> Result<Vec<BrowserCookie>, BrowserError> {
        let cookies = self.page.get_cookies().await.map_err(protocol)?;
        Ok(cookies
            .into_iter()
            .map(|c| BrowserCookie {
                name: c.name,
                value: c.value,
                domain: c.domain,
                path: c.path,
                expires: c.expires,
                secure: c.secure,
                http_only: c.http_only,
                same_site: c.same_site.map(|s| {
                    match s {
                        CookieSameSite::Strict => "Strict",
                        CookieSameSite::Lax => "Lax",
                        CookieSameSite::None => "None",
                    }
                    .to_string()
                }),
            })
            .collect())
    }

    async fn set_cookie(&self, cookie: &BrowserCookie, url: &str) -> Result<(), BrowserError> {
        let mut builder = CookieParam::builder()
            .name(cookie.name.clone())
            .value(cookie.value.clone())
            .url(url)
            .domain(cookie.domain.clone())
            .path(cookie.path.clone())
            .secure(cookie.secure)
            .http_only(cookie.http_only);

        if cookie.expires > 0.0 {
            builder = builder.expires(TimeSinceEpoch::new(cookie.expires));
        }

        match cookie.same_site.as_deref() {
            Some("Strict") => builder = builder.same_site(CookieSameSite::Strict),
            Some("Lax") => builder = builder.same_site(CookieSameSite::Lax),
            Some("None") => builder = builder.same_site(CookieSameSite::None),
            _ => {}
        }

        // Page::set_cookie rejects blank pages, the raw command only needs the url
        let param = builder.build().map_err(BrowserError::Protocol)?;
        self.page
            .execute(SetCookiesParams::new(vec![param]))
            .await
            .map_err(protocol)?;
        Ok(())
    }

    async fn storage_items(&self, area: StorageArea) -> Result<HashMap<String, String>, BrowserError> {
        let raw = self
            .eval_value(format!("JSON.stringify({})", area.js_name()))
            .await?;
        let text = raw.as_str().unwrap_or("{}");
        serde_json::from_str(text).map_err(|e| BrowserError::Script(e.to_string()))
    }

    async fn set_storage_items(
        &self,
        area: StorageArea,
        items: &HashMap<String, String>,
    ) -> Result<(), BrowserError> {
        if items.is_empty() {
            return Ok(());
        }
        let mut script = String::new();
        for (key, value) in items {
            script.push_str(&format!(
                "{}.setItem({}, {});\n",
                area.js_name(),
                js_string(key),
                js_string(value)
            ));
        }
        script.push_str("true");
        self.eval_value(script).await?;
        Ok(())
    }

    async fn exists(&self, selector: &str) -> Result<bool, BrowserError> {
        Ok(self.count(selector).await? > 0)
    }

    async fn count(&self, selector: &str) -> Result<usize, BrowserError> {
        let value = self
            .eval_value(format!(
                "document.querySelectorAll({}).length",
                js_string(selector)
            ))
            .await?;
        Ok(value.as_u64().unwrap_or(0) as usize)
    }

    async fn click(&self, selector: &str) -> Result<(), BrowserError> {
        let element = self
            .page
            .find_element(selector)
            .await
            .map_err(|_| BrowserError::ElementNotFound(selector.to_string()))?;
        element.click().await.map_err(protocol)?;
        Ok(())
    }

    async fn type_into(&self, selector: &str, text: &str) -> Result<(), BrowserError> {
        let element = self
            .page
            .find_element(selector)
            .await
            .map_err(|_| BrowserError::ElementNotFound(selector.to_string()))?;
        element.focus().await.map_err(protocol)?;
        element.type_str(text).await.map_err(protocol)?;
        Ok(())
    }

    async fn text_of(&self, selector: &str) -> Result<String, BrowserError> {
        let value = self
            .eval_value(format!(
                "(() => {{ const el = document.querySelector({}); return el ? el.innerText : null; }})()",
                js_string(selector)
            ))
            .await?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| BrowserError::ElementNotFound(selector.to_string()))
    }

    async fn attribute_of(&self, selector: &str, name: &str) -> Result<Option<String>, BrowserError> {
        let element = self
            .page
            .find_element(selector)
            .await
            .map_err(|_| BrowserError::ElementNotFound(selector.to_string()))?;
        element.attribute(name).await.map_err(protocol)
    }

    async fn screenshot(&self) -> Result<Vec<u8>, BrowserError> {
        self.page
            .screenshot(
                ScreenshotParams::builder()
                    .format(CaptureScreenshotFormat::Png)
                    .build(),
            )
            .await
            .map_err(protocol)
    }

    async fn close(&self) -> Result<(), BrowserError> {
        self.page.clone().close().await.map_err(protocol)
    }
}
