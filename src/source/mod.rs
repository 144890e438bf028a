pub mod glyph;
pub mod sangtacviet;

pub use glyph::GlyphMap;
pub use sangtacviet::Sangtacviet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::browser::{BehaviorSimulator, BrowserError, CaptchaError, CaptchaGate, PageHandle};
use crate::cli::config::AdapterSettings;
use crate::control::Website;
use crate::crawler::task::SourceType;

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("unexpected path for {url}: expected {expected} segments, got {actual}")]
    InvalidPath {
        url: String,
        expected: usize,
        actual: usize,
    },

    #[error("element not found: {0}")]
    MissingElement(String),

    #[error("endpoint request failed: {0}")]
    Endpoint(String),

    /// The reader was still loading; the session was refreshed and the task can be retried
    #[error("page still loading: {0}")]
    PageLoading(String),

    #[error(transparent)]
    Captcha(#[from] CaptchaError),

    #[error(transparent)]
    Browser(#[from] BrowserError),
}

impl ExtractionError {
    /// Map a missing-element browser error to [`ExtractionError::MissingElement`]
    pub(crate) fn from_lookup(err: BrowserError) -> Self {
        match err {
            BrowserError::ElementNotFound(selector) => ExtractionError::MissingElement(selector),
            other => ExtractionError::Browser(other),
        }
    }
}

/// Book metadata with its ordered chapter list
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Book {
    pub url: String,
    pub id: String,
    pub name: String,
    pub image_url: String,
    pub author: String,
    /// Upstream host the site mirrors the book from
    pub host: String,
    pub chapters: Vec<Chapter>,
}

/// Chapter stub as listed on the book page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    pub id: String,
    pub name: String,
    pub url: String,
    /// 1-based position in the book
    pub number: u32,
}

/// Text of one chapter
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChapterContent {
    pub url: String,
    pub book_id: String,
    pub chapter_id: String,
    /// One paragraph per line
    pub text: String,
}

/// Site-specific extraction.
///
/// Every operation receives a page that is already navigated with the stored
/// session applied. Adapters make no assumption about browser visibility.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source(&self) -> SourceType;

    /// Page the login flow starts from
    fn home_url(&self) -> &str;

    /// Log in and leave the browser authenticated
    async fn extract_source_session(&self, page: &dyn PageHandle) -> Result<(), ExtractionError>;

    /// Refresh the session against `url`, with an operator confirming a live page
    /// when `url` carries the session prefix
    async fn extract_session(&self, url: &str, page: &dyn PageHandle) -> Result<(), ExtractionError>;

    async fn extract_chapter(&self, url: &str, page: &dyn PageHandle) -> Result<ChapterContent, ExtractionError>;

    async fn extract_book_info(&self, url: &str, page: &dyn PageHandle) -> Result<Book, ExtractionError>;
}

/// Adapter operation run inside a processed page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterCall {
    SourceSession,
    Session,
    Chapter,
    BookInfo,
}

/// What an [`AdapterCall`] produced
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterOutput {
    Done,
    Chapter(ChapterContent),
    Book(Book),
}

impl AdapterCall {
    pub async fn invoke(
        self,
        adapter: &dyn SourceAdapter,
        url: &str,
        page: &dyn PageHandle,
    ) -> Result<AdapterOutput, ExtractionError> {
        match self {
            AdapterCall::SourceSession => {
                adapter.extract_source_session(page).await?;
                Ok(AdapterOutput::Done)
            }
            AdapterCall::Session => {
                adapter.extract_session(url, page).await?;
                Ok(AdapterOutput::Done)
            }
            AdapterCall::Chapter => Ok(AdapterOutput::Chapter(adapter.extract_chapter(url, page).await?)),
            AdapterCall::BookInfo => Ok(AdapterOutput::Book(adapter.extract_book_info(url, page).await?)),
        }
    }
}

/// Collaborators every adapter is built with
#[derive(Clone)]
pub struct SourceContext {
    pub gate: Arc<CaptchaGate>,
    pub behavior: BehaviorSimulator,
    pub glyphs: Arc<GlyphMap>,
    /// Marks session URLs that need an operator to pick a live page
    pub session_prefix: String,
    /// Where debug screenshots go
    pub artifact_dir: PathBuf,
    pub settings: AdapterSettings,
}

/// Adapters keyed by the source they serve
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<SourceType, Arc<dyn SourceAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `adapter`, replacing any adapter for the same source
    pub fn register(&mut self, adapter: Arc<dyn SourceAdapter>) {
        let source = adapter.source();
        if self.adapters.insert(source, adapter).is_some() {
            warn!("Replaced adapter for source {}", source);
        }
    }

    pub fn get(&self, source: SourceType) -> Option<Arc<dyn SourceAdapter>> {
        self.adapters.get(&source).cloned()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Build adapters for the enabled sites whose script has an implementation
    pub fn from_websites(websites: &[Website], ctx: &SourceContext) -> Self {
        let mut registry = Self::new();

        for website in websites.iter().filter(|w| w.enabled) {
            match website.script_name.parse::<SourceType>() {
                Ok(SourceType::Sangtacviet) => {
                    registry.register(Arc::new(Sangtacviet::new(website, ctx.clone())));
                    info!("Registered adapter for {} ({})", website.script_name, website.url);
                }
                Ok(source) => warn!("No adapter implemented for source {}", source),
                Err(e) => warn!("Skipping website {}: {}", website.url, e),
            }
        }

        for source in SourceType::ALL {
            if registry.get(source).is_none() {
                info!("No adapter registered for {}; its tasks will be dropped", source);
            }
        }

        registry
    }
}
