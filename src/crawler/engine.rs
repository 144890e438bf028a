use async_trait::async_trait;
use rand::{thread_rng, Rng};
use reqwest::header::HeaderMap;
use reqwest::Client;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::browser::state::{apply_cookies, apply_storage};
use crate::browser::{BrowserError, BrowserLease, BrowserSessionManager, PageHandle, SessionError, SessionStore};
use crate::cli::config::EngineSettings;
use crate::crawler::frontier::{extract_links, Frontier, QueueItem};
use crate::source::{AdapterCall, AdapterOutput, ExtractionError, SourceAdapter};
use crate::utils::{CrawlStats, FetchPath};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Browser(#[from] BrowserError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{url} returned status {status}")]
    Status { url: String, status: u16 },

    #[error("page operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

/// A page fetched by a frontier worker
#[derive(Debug, Clone)]
pub struct FetchedPage {
    /// URL as queued
    pub url: String,
    /// URL after redirects
    pub final_url: String,
    pub depth: u32,
    /// HTTP status, when fetched without the browser
    pub status: Option<u16>,
    pub html: String,
    pub path: FetchPath,
}

/// Hook invoked for every page the frontier fetches
#[async_trait]
pub trait ResponseCallback: Send + Sync {
    async fn on_response(&self, page: &FetchedPage) -> anyhow::Result<()>;
}

/// Writes every fetched page under a directory
pub struct PageArchive {
    dir: PathBuf,
}

impl PageArchive {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn file_name(url: &str) -> String {
        let name: String = url
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect();
        format!("{}.html", name.trim_end_matches('_'))
    }
}

#[async_trait]
impl ResponseCallback for PageArchive {
    async fn on_response(&self, page: &FetchedPage) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(Self::file_name(&page.url));
        tokio::fs::write(&path, &page.html).await?;
        debug!("Archived {} to {}", page.url, path.display());
        Ok(())
    }
}

/// Whether a probe response shows signs of a bot-mitigation layer
pub fn signals_bot_mitigation(status: u16, headers: &HeaderMap) -> bool {
    if status == 403 || status == 503 {
        return true;
    }
    ["cf-ray", "cf-mitigated", "server-timing", "x-robots-tag"]
        .iter()
        .any(|name| headers.contains_key(*name))
}

/// A user agent picked at random
pub fn pick_user_agent(agents: &[String]) -> Option<&str> {
    if agents.is_empty() {
        return None;
    }
    Some(agents[thread_rng().gen_range(0..agents.len())].as_str())
}

fn build_client(settings: &EngineSettings, timeout: Duration, proxy_url: Option<&str>) -> Result<Client, EngineError> {
    let mut builder = Client::builder().cookie_store(true).timeout(timeout);
    if let Some(agent) = pick_user_agent(&settings.user_agents) {
        builder = builder.user_agent(agent);
    }
    if let Some(proxy_url) = proxy_url {
        builder = builder.proxy(reqwest::Proxy::all(proxy_url)?);
    }
    Ok(builder.build()?)
}

/// Delay before retry number `attempt` (1-based): exponential with jitter
fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let exponential = base_ms.saturating_mul(1u64 << (attempt.saturating_sub(1)).min(16));
    let jitter = if base_ms > 0 {
        thread_rng().gen_range(0..=base_ms / 2)
    } else {
        0
    };
    Duration::from_millis(exponential + jitter)
}

/// Sleep for `duration` unless shutdown is signalled first. Returns false on shutdown.
async fn sleep_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        changed = shutdown.changed() => changed.is_ok() && !*shutdown.borrow(),
    }
}

/// Runs pages on the shared browser: adapter operations for broker tasks and
/// the breadth-first frontier crawl
pub struct CrawlEngine {
    browser: Arc<BrowserSessionManager>,
    sessions: Arc<SessionStore>,
    frontier: Arc<Frontier>,
    http: Client,
    settings: EngineSettings,
    page_timeout: Duration,
    callbacks: Vec<Arc<dyn ResponseCallback>>,
    stats: CrawlStats,
}

impl CrawlEngine {
    pub fn new(
        settings: EngineSettings,
        page_timeout: Duration,
        browser: Arc<BrowserSessionManager>,
        sessions: Arc<SessionStore>,
        stats: CrawlStats,
    ) -> Result<Self, EngineError> {
        let http = build_client(&settings, page_timeout, None)?;
        let frontier = Arc::new(Frontier::new(settings.max_depth, &settings.exclude_patterns));

        Ok(Self {
            browser,
            sessions,
            frontier,
            http,
            settings,
            page_timeout,
            callbacks: Vec::new(),
            stats,
        })
    }

    /// Send plain HTTP fetches and probes through `proxy_url`
    pub fn with_proxy(mut self, proxy_url: &str) -> Result<Self, EngineError> {
        self.http = build_client(&self.settings, self.page_timeout, Some(proxy_url))?;
        Ok(self)
    }

    /// Register a hook for fetched pages
    pub fn with_callback(mut self, callback: Arc<dyn ResponseCallback>) -> Self {
        self.callbacks.push(callback);
        self
    }

    pub fn frontier(&self) -> &Arc<Frontier> {
        &self.frontier
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn stats(&self) -> &CrawlStats {
        &self.stats
    }

    /// Relaunch the shared browser with the given visibility
    pub async fn set_headless(&self, headless: bool) -> Result<(), EngineError> {
        self.browser.set_headless(headless).await?;
        Ok(())
    }

    /// Seed the frontier
    pub async fn seed(&self, url: &str) -> bool {
        self.frontier.push(url, 0).await
    }

    fn strip_session_prefix<'a>(&self, url: &'a str) -> &'a str {
        url.strip_prefix(self.settings.session_prefix.as_str()).unwrap_or(url)
    }

    /// Run an adapter operation on a fresh page of the shared browser
    pub async fn process_page(
        &self,
        url: &str,
        adapter: &dyn SourceAdapter,
        call: AdapterCall,
    ) -> Result<AdapterOutput, EngineError> {
        let lease = self.browser.shared().await?;
        self.process_on_lease(&lease, url, adapter, call).await
    }

    /// Run an adapter operation with sole use of the browser in the given
    /// mode. The default mode is restored afterwards, whatever the outcome.
    pub async fn process_page_exclusive(
        &self,
        url: &str,
        adapter: &dyn SourceAdapter,
        call: AdapterCall,
        headless: bool,
    ) -> Result<AdapterOutput, EngineError> {
        let lease = self.browser.exclusive(headless).await?;
        let result = self.process_on_lease(&lease, url, adapter, call).await;

        if let Err(e) = lease.release().await {
            error!("Error restoring browser mode: {}", e);
        }
        result
    }

    async fn process_on_lease(
        &self,
        lease: &BrowserLease,
        url: &str,
        adapter: &dyn SourceAdapter,
        call: AdapterCall,
    ) -> Result<AdapterOutput, EngineError> {
        let page = lease.new_page().await?;

        // Interactive operations are bounded by the captcha timeout instead
        let result = match call {
            AdapterCall::Chapter | AdapterCall::BookInfo => {
                match tokio::time::timeout(self.page_timeout, self.run_on_page(page.as_ref(), url, adapter, call)).await {
                    Ok(result) => result,
                    Err(_) => Err(EngineError::Timeout(self.page_timeout)),
                }
            }
            AdapterCall::Session | AdapterCall::SourceSession => {
                self.run_on_page(page.as_ref(), url, adapter, call).await
            }
        };

        if let Err(e) = page.close().await {
            warn!("Error closing page for {}: {}", url, e);
        }
        result
    }

    async fn run_on_page(
        &self,
        page: &dyn PageHandle,
        url: &str,
        adapter: &dyn SourceAdapter,
        call: AdapterCall,
    ) -> Result<AdapterOutput, EngineError> {
        let target = match call {
            AdapterCall::SourceSession => adapter.home_url(),
            _ => self.strip_session_prefix(url),
        };

        let snapshot = match self.sessions.load().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Ignoring unreadable session snapshot: {}", e);
                None
            }
        };

        // Cookies go in before navigation, storage needs the target origin
        if let Some(data) = &snapshot {
            let applied = apply_cookies(page, &data.cookies, target).await;
            debug!("Applied {} session cookies", applied);
        }

        debug!("Navigating to {}", target);
        page.goto(target).await?;
        page.wait_for_load().await?;

        if let Some(data) = &snapshot {
            apply_storage(page, data).await?;
        }

        let outcome = call.invoke(adapter, url, page).await;

        // A loading reader still refreshed the session worth keeping
        if matches!(outcome, Ok(_) | Err(ExtractionError::PageLoading(_))) {
            self.capture_session(page).await;
        }

        Ok(outcome?)
    }

    async fn capture_session(&self, page: &dyn PageHandle) {
        match self.sessions.capture(page).await {
            Ok(data) => {
                self.stats.record_session_capture().await;
                debug!("Session snapshot saved with {} cookies", data.cookies.len());
            }
            Err(e) => warn!("Error saving session snapshot: {}", e),
        }
    }

    /// Start the frontier worker pool
    pub fn spawn_workers(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        info!("Starting {} frontier workers", self.settings.concurrency);
        (0..self.settings.concurrency)
            .map(|id| {
                let engine = Arc::clone(self);
                let shutdown = shutdown.clone();
                tokio::spawn(async move { engine.worker_loop(id, shutdown).await })
            })
            .collect()
    }

    async fn worker_loop(self: Arc<Self>, id: usize, mut shutdown: watch::Receiver<bool>) {
        let politeness = Duration::from_millis(self.settings.politeness_delay_ms);
        let idle = Duration::from_millis(200);
        debug!(worker = id, "Worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let Some(item) = self.frontier.claim().await else {
                if !sleep_or_shutdown(idle, &mut shutdown).await {
                    break;
                }
                continue;
            };

            let success = self.fetch_with_retry(&item, id, &mut shutdown).await;
            self.frontier.complete(&item.url, success).await;

            if !sleep_or_shutdown(politeness, &mut shutdown).await {
                break;
            }
        }

        debug!(worker = id, "Worker stopped");
    }

    async fn fetch_with_retry(
        &self,
        item: &QueueItem,
        worker: usize,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        let attempts = self.settings.max_fetch_attempts.max(1);

        for attempt in 1..=attempts {
            match self.fetch(item).await {
                Ok(()) => return true,
                Err(e) if attempt < attempts => {
                    let delay = backoff_delay(self.settings.retry_backoff_ms, attempt);
                    warn!(worker, url = %item.url, "Fetch attempt {} failed: {}; retrying in {:?}", attempt, e, delay);
                    if !sleep_or_shutdown(delay, shutdown).await {
                        debug!(worker, url = %item.url, "Shutdown during retry backoff");
                        return false;
                    }
                }
                Err(e) => {
                    error!(worker, url = %item.url, "Giving up after {} attempts: {}", attempts, e);
                }
            }
        }

        self.stats.record_abandoned().await;
        false
    }

    /// Fetch one frontier item and enqueue its links
    async fn fetch(&self, item: &QueueItem) -> Result<(), EngineError> {
        let page = if self.needs_browser(&item.url).await {
            self.fetch_with_browser(item).await?
        } else {
            self.fetch_with_http(item).await?
        };

        for callback in &self.callbacks {
            if let Err(e) = callback.on_response(&page).await {
                warn!("Response callback failed for {}: {}", page.url, e);
            }
        }

        if item.depth < self.frontier.max_depth() {
            let base = Url::parse(&page.final_url).map_err(|_| EngineError::InvalidUrl(page.final_url.clone()))?;
            let mut added = 0;
            for link in extract_links(&page.html, &base) {
                if self.frontier.push(&link, item.depth + 1).await {
                    added += 1;
                }
            }
            debug!("Queued {} new links from {}", added, page.url);
        }

        Ok(())
    }

    /// HEAD probe; the browser is needed when it fails or shows mitigation
    async fn needs_browser(&self, url: &str) -> bool {
        let request = self
            .http
            .head(url)
            .timeout(Duration::from_secs(self.settings.probe_timeout_secs));

        match request.send().await {
            Ok(response) => {
                let mitigated = signals_bot_mitigation(response.status().as_u16(), response.headers());
                debug!("Probe {} -> {} (browser: {})", url, response.status(), mitigated);
                mitigated
            }
            Err(e) => {
                debug!("Probe failed for {}: {}", url, e);
                true
            }
        }
    }

    async fn fetch_with_http(&self, item: &QueueItem) -> Result<FetchedPage, EngineError> {
        let timer = self.stats.start_timer();
        let result = self.http_get(item).await;

        let bytes = result.as_ref().map(|p| p.html.len()).unwrap_or(0);
        self.stats
            .record_fetch(FetchPath::Http, result.is_ok(), bytes, timer.elapsed_ms())
            .await;
        result
    }

    async fn http_get(&self, item: &QueueItem) -> Result<FetchedPage, EngineError> {
        let response = self.http.get(&item.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::Status {
                url: item.url.clone(),
                status: status.as_u16(),
            });
        }

        let final_url = response.url().to_string();
        let html = response.text().await?;
        info!(url = %item.url, "Fetched over HTTP ({} bytes)", html.len());

        Ok(FetchedPage {
            url: item.url.clone(),
            final_url,
            depth: item.depth,
            status: Some(status.as_u16()),
            html,
            path: FetchPath::Http,
        })
    }

    async fn fetch_with_browser(&self, item: &QueueItem) -> Result<FetchedPage, EngineError> {
        let timer = self.stats.start_timer();
        let lease = self.browser.shared().await?;
        let page = lease.new_page().await?;

        let result = match tokio::time::timeout(self.page_timeout, self.browse(page.as_ref(), item)).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout(self.page_timeout)),
        };

        if let Err(e) = page.close().await {
            warn!("Error closing page for {}: {}", item.url, e);
        }
        drop(lease);

        let bytes = result.as_ref().map(|p| p.html.len()).unwrap_or(0);
        self.stats
            .record_fetch(FetchPath::Browser, result.is_ok(), bytes, timer.elapsed_ms())
            .await;
        result
    }

    async fn browse(&self, page: &dyn PageHandle, item: &QueueItem) -> Result<FetchedPage, EngineError> {
        let host = Url::parse(&item.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .ok_or_else(|| EngineError::InvalidUrl(item.url.clone()))?;

        match self.sessions.cookies_for_host(&host).await {
            Ok(cookies) => {
                apply_cookies(page, &cookies, &item.url).await;
            }
            Err(e) => warn!("Ignoring unreadable session snapshot: {}", e),
        }

        page.goto(&item.url).await?;
        page.wait_for_load().await?;
        if let Err(e) = page
            .wait_for_idle(
                Duration::from_millis(self.settings.idle_quiet_ms),
                Duration::from_millis(self.settings.idle_limit_ms),
            )
            .await
        {
            debug!("Network did not settle for {}: {}", item.url, e);
        }

        // Keep the snapshot fresh whatever page we are on
        self.capture_session(page).await;

        let html = page.content().await?;
        let final_url = page.current_url().await.unwrap_or_else(|_| item.url.clone());
        info!(url = %item.url, "Fetched with browser ({} bytes)", html.len());

        Ok(FetchedPage {
            url: item.url.clone(),
            final_url,
            depth: item.depth,
            status: None,
            html,
            path: FetchPath::Browser,
        })
    }

    /// Wait until the frontier has nothing queued or in flight
    pub async fn wait_until_drained(&self, shutdown: &mut watch::Receiver<bool>) {
        while !self.frontier.is_drained().await {
            if !sleep_or_shutdown(Duration::from_millis(200), shutdown).await {
                break;
            }
        }
    }
}
