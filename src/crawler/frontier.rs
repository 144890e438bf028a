use regex::Regex;
use scraper::{Html, Selector};
use std::collections::{HashSet, VecDeque};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use url::Url;

/// Frontier entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    /// Normalized URL, always with a trailing slash
    pub url: String,

    /// Link distance from the seed (0 for seeds)
    pub depth: u32,
}

/// Normalize a URL so equivalent spellings share one frontier entry.
///
/// Lowercases the host, drops the default port and the fragment, and makes sure
/// the path ends with a slash. Returns `None` for anything that is not http(s).
pub fn normalize_url(raw: &str) -> Option<String> {
    // `Url` already lowercases the host and drops default ports
    let mut normalized = Url::parse(raw.trim()).ok()?;
    if !matches!(normalized.scheme(), "http" | "https") || normalized.host_str().is_none() {
        return None;
    }

    normalized.set_fragment(None);

    if !normalized.path().ends_with('/') {
        let path = format!("{}/", normalized.path());
        normalized.set_path(&path);
    }

    Some(normalized.to_string())
}

/// Absolute same-origin links found in `html`, resolved against the document
/// base (a `<base href>` when present, otherwise `page_url`)
pub fn extract_links(html: &str, page_url: &Url) -> Vec<String> {
    let document = Html::parse_document(html);

    let base = match Selector::parse("base[href]") {
        Ok(selector) => document
            .select(&selector)
            .next()
            .and_then(|el| el.value().attr("href"))
            .and_then(|href| page_url.join(href).ok())
            .unwrap_or_else(|| page_url.clone()),
        Err(_) => page_url.clone(),
    };

    let selector = match Selector::parse("a[href]") {
        Ok(s) => s,
        Err(_) => return Vec::new(),
    };

    let mut seen = HashSet::new();
    let mut links = Vec::new();
    for el in document.select(&selector) {
        let Some(href) = el.value().attr("href") else {
            continue;
        };
        let href = href.trim();
        if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") {
            continue;
        }

        let Ok(mut link) = base.join(href) else {
            continue;
        };
        if link.origin() != page_url.origin() {
            continue;
        }
        link.set_fragment(None);

        let link = link.to_string();
        if seen.insert(link.clone()) {
            links.push(link);
        }
    }

    links
}

#[derive(Default)]
struct FrontierState {
    queue: VecDeque<QueueItem>,
    /// URLs waiting in `queue`
    pending: HashSet<String>,
    visited: HashSet<String>,
    failed: HashSet<String>,
    in_flight: usize,
}

/// Breadth-first crawl state shared by the frontier workers
pub struct Frontier {
    state: Mutex<FrontierState>,

    max_depth: u32,

    /// Compiled regex patterns for URL exclusion
    exclude_patterns: Vec<Regex>,
}

impl Frontier {
    pub fn new(max_depth: u32, exclude: &[String]) -> Self {
        let exclude_patterns = exclude
            .iter()
            .filter_map(|pattern| match Regex::new(pattern) {
                Ok(regex) => Some(regex),
                Err(e) => {
                    warn!("Invalid exclude pattern '{}': {}", pattern, e);
                    None
                }
            })
            .collect();

        Self {
            state: Mutex::new(FrontierState::default()),
            max_depth,
            exclude_patterns,
        }
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    /// Enqueue `url` at `depth`. Returns whether it was added.
    pub async fn push(&self, url: &str, depth: u32) -> bool {
        if depth > self.max_depth {
            debug!("Skipping {} beyond max depth ({})", url, depth);
            return false;
        }

        if self.exclude_patterns.iter().any(|p| p.is_match(url)) {
            debug!("Skipping URL matching exclusion pattern: {}", url);
            return false;
        }

        let Some(normalized) = normalize_url(url) else {
            debug!("Skipping invalid URL: {}", url);
            return false;
        };

        let mut state = self.state.lock().await;
        if state.visited.contains(&normalized) || state.pending.contains(&normalized) {
            return false;
        }

        state.pending.insert(normalized.clone());
        state.queue.push_back(QueueItem {
            url: normalized,
            depth,
        });
        true
    }

    /// Take the next item to fetch.
    ///
    /// Popping, the depth check and marking the URL visited happen under one
    /// lock, so two workers can never claim the same URL.
    pub async fn claim(&self) -> Option<QueueItem> {
        let mut state = self.state.lock().await;
        while let Some(item) = state.queue.pop_front() {
            state.pending.remove(&item.url);

            if item.depth > self.max_depth {
                continue;
            }
            if !state.visited.insert(item.url.clone()) {
                continue;
            }

            state.in_flight += 1;
            return Some(item);
        }
        None
    }

    /// Finish a claimed item
    pub async fn complete(&self, url: &str, success: bool) {
        let mut state = self.state.lock().await;
        state.in_flight = state.in_flight.saturating_sub(1);
        if !success {
            state.failed.insert(url.to_string());
        }
    }

    /// Nothing queued and nothing being fetched
    pub async fn is_drained(&self) -> bool {
        let state = self.state.lock().await;
        state.queue.is_empty() && state.in_flight == 0
    }

    pub async fn is_visited(&self, url: &str) -> bool {
        match normalize_url(url) {
            Some(normalized) => self.state.lock().await.visited.contains(&normalized),
            None => false,
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    pub async fn visited_count(&self) -> usize {
        self.state.lock().await.visited.len()
    }

    pub async fn failed_count(&self) -> usize {
        self.state.lock().await.failed.len()
    }
}
