use async_trait::async_trait;
use scraper::{ElementRef, Html, Node};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use super::{Book, Chapter, ChapterContent, ExtractionError, SourceAdapter, SourceContext};
use crate::browser::PageHandle;
use crate::control::Website;
use crate::crawler::task::SourceType;

/// `url.split('/')` length of a book page, trailing slash included
pub const BOOK_INFO_URL_LENGTH: usize = 8;

/// `url.split('/')` length of a chapter page, trailing slash included
pub const CHAPTER_URL_LENGTH: usize = 9;

const LANGUAGE_OPTION: &str = ".modal-content .seloption[value='vi']";
const USERNAME_INPUT: &str = "input[name*='user']";
const PASSWORD_INPUT: &str = "input[type='password']";
const BOOK_NAME: &str = "#book_name2";
const AUTHOR_NAME: &str = "i.cap h2";
const COVER_IMAGE: &str = "img#thumb-prop";
const READER_CONTENT: &str = "div#content-container > div i";

const OPEN_LOGIN_SCRIPT: &str = r##"(() => {
    const loginLink = document.querySelector("#tm-nav-search-top-right a");
    if (loginLink) {
        loginLink.click();
        return true;
    }
    return false;
})()"##;

const SUBMIT_LOGIN_SCRIPT: &str = r#"(async () => {
    await loginstv();
    return true;
})()"#;

const CHAPTER_SCRIPT: &str = r#"(async (url) => {
    try {
        const response = await fetch(url, {
            method: "POST",
            credentials: "include",
            headers: { "Content-Type": "application/x-www-form-urlencoded" },
        });
        if (response.status !== 200) {
            return { ok: false, error: "status " + response.status };
        }
        const text = await response.text();
        if (!text) {
            return { ok: false, error: "response text empty" };
        }
        const json = JSON.parse(text);
        if (json.code != 0) {
            return { ok: false, error: "code is " + json.code };
        }
        if (!json.data) {
            return { ok: false, error: "data is empty" };
        }
        return { ok: true, data: json.data };
    } catch (err) {
        return { ok: false, error: String(err) };
    }
})(__URL__)"#;

const CHAPTER_LIST_SCRIPT: &str = r#"(async (url) => {
    try {
        const response = await fetch(url, { credentials: "include" });
        if (response.status !== 200) {
            return { ok: false, error: "status " + response.status };
        }
        const text = await response.text();
        if (!text) {
            return { ok: false, error: "response text empty" };
        }
        const json = JSON.parse(text);
        if (json.code != 1) {
            return { ok: false, error: "code is " + json.code };
        }
        if (json.enckey) {
            eval(atob(json.enckey));
        }
        if (!json.data) {
            return { ok: false, error: "data is empty" };
        }
        return { ok: true, data: json.data };
    } catch (err) {
        return { ok: false, error: String(err) };
    }
})(__URL__)"#;

/// Reply shape of the in-page endpoint scripts
#[derive(Debug, Deserialize)]
struct EndpointReply {
    ok: bool,
    #[serde(default)]
    data: String,
    #[serde(default)]
    error: String,
}

/// Identifiers carried by a chapter URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterPath {
    pub book_id: String,
    pub chapter_id: String,
    pub host: String,
    pub sty: String,
}

/// Identifiers carried by a book URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookPath {
    pub book_id: String,
    pub host: String,
}

fn split_path(url: &str, expected: usize) -> Result<Vec<&str>, ExtractionError> {
    let parts: Vec<&str> = url.split('/').collect();
    if parts.len() != expected {
        return Err(ExtractionError::InvalidPath {
            url: url.to_string(),
            expected,
            actual: parts.len(),
        });
    }
    Ok(parts)
}

/// `https://<site>/truyen/<host>/<sty>/<book>/<chapter>/`
pub fn parse_chapter_path(url: &str) -> Result<ChapterPath, ExtractionError> {
    let parts = split_path(url, CHAPTER_URL_LENGTH)?;
    let n = parts.len();
    Ok(ChapterPath {
        book_id: parts[n - 3].to_string(),
        chapter_id: parts[n - 2].to_string(),
        host: parts[n - 5].to_string(),
        sty: parts[n - 4].to_string(),
    })
}

/// `https://<site>/truyen/<host>/<sty>/<book>/`
pub fn parse_book_path(url: &str) -> Result<BookPath, ExtractionError> {
    let parts = split_path(url, BOOK_INFO_URL_LENGTH)?;
    let n = parts.len();
    Ok(BookPath {
        book_id: parts[n - 2].to_string(),
        host: parts[n - 4].to_string(),
    })
}

/// Decode the chapter-list payload: records separated by `-//-1-/-`, fields by `-/-`
pub fn parse_chapter_list(data: &str, book_url: &str) -> Vec<Chapter> {
    let base = if book_url.ends_with('/') {
        book_url.to_string()
    } else {
        format!("{}/", book_url)
    };

    // The payload opens with a bare `1-/-` marker
    let data = data.replacen("1-/-", "", 1);

    data.split("-//-1-/-")
        .filter(|record| !record.is_empty())
        .filter_map(|record| {
            let fields: Vec<&str> = record.split("-/-").collect();
            if fields.len() < 2 {
                return None;
            }
            Some((fields[0].to_string(), fields[1].trim().to_string()))
        })
        .enumerate()
        .map(|(i, (id, name))| Chapter {
            url: format!("{}{}/", base, id),
            id,
            name,
            number: i as u32 + 1,
        })
        .collect()
}

fn collect_text(element: ElementRef, out: &mut String) {
    for child in element.children() {
        match child.value() {
            Node::Text(text) => out.push_str(text.trim_matches('\t')),
            Node::Element(_) => {
                if let Some(child) = ElementRef::wrap(child) {
                    collect_text(child, out);
                }
            }
            _ => {}
        }
    }

    if element.value().name() == "p" && element.has_children() {
        out.push('\n');
    }
}

/// Plain text of a chapter body, one paragraph per line
pub fn html_to_text(html: &str) -> String {
    let fragment = Html::parse_fragment(html);
    let mut out = String::new();
    collect_text(fragment.root_element(), &mut out);
    out.replace("\n\n", "\n").trim().to_string()
}

fn with_url(script: &str, url: &str) -> String {
    script.replace("__URL__", &serde_json::Value::String(url.to_string()).to_string())
}

/// Adapter for sangtacviet
pub struct Sangtacviet {
    base_url: String,
    username: String,
    password: String,
    ctx: SourceContext,
}

impl Sangtacviet {
    pub fn new(website: &Website, ctx: SourceContext) -> Self {
        let base_url = if website.url.ends_with('/') {
            website.url.clone()
        } else {
            format!("{}/", website.url)
        };

        Self {
            base_url,
            username: website.username.clone(),
            password: website.password.clone(),
            ctx,
        }
    }

    fn origin(url: &str) -> Result<String, ExtractionError> {
        Url::parse(url)
            .map(|u| u.origin().ascii_serialization())
            .map_err(|e| ExtractionError::Endpoint(format!("invalid page URL {}: {}", url, e)))
    }

    async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(self.ctx.settings.settle_ms)).await;
    }

    /// Run an endpoint script and return its `data`
    async fn call_endpoint(&self, page: &dyn PageHandle, script: &str, endpoint: &str) -> Result<String, ExtractionError> {
        debug!("Calling endpoint {}", endpoint);
        let value = page.evaluate(&with_url(script, endpoint)).await?;
        let reply: EndpointReply = serde_json::from_value(value)
            .map_err(|e| ExtractionError::Endpoint(format!("unexpected reply from {}: {}", endpoint, e)))?;

        if reply.ok {
            Ok(reply.data)
        } else {
            Err(ExtractionError::Endpoint(reply.error))
        }
    }

    async fn save_debug_screenshot(&self, page: &dyn PageHandle, name: &str) {
        let png = match page.screenshot().await {
            Ok(png) => png,
            Err(e) => {
                warn!("Error taking screenshot: {}", e);
                return;
            }
        };

        let path = self.ctx.artifact_dir.join(name);
        if let Err(e) = tokio::fs::create_dir_all(&self.ctx.artifact_dir).await {
            warn!("Error creating artifact directory: {}", e);
            return;
        }
        if let Err(e) = tokio::fs::write(&path, png).await {
            warn!("Error saving screenshot {}: {}", path.display(), e);
        }
    }

    /// Reload the reader until its content renders, so the refreshed session
    /// can be captured for the next attempt
    async fn wait_for_reader(&self, url: &str, page: &dyn PageHandle) -> Result<bool, ExtractionError> {
        info!("Chapter endpoint not ready, reloading reader: {}", url);
        page.goto(url).await?;
        if let Err(e) = page.wait_for_load().await {
            warn!("Error waiting for reader to load: {}", e);
        }
        self.ctx.gate.check(page, "chapter").await?;

        let interval = Duration::from_millis(self.ctx.settings.loading_poll_interval_ms);
        for attempt in 1..=self.ctx.settings.loading_poll_attempts {
            let rendered = page.count(READER_CONTENT).await?;
            debug!("Reader poll {}: {} content elements", attempt, rendered);
            if rendered > 0 {
                return Ok(true);
            }
            tokio::time::sleep(interval).await;
        }
        Ok(false)
    }
}

#[async_trait]
impl SourceAdapter for Sangtacviet {
    fn source(&self) -> SourceType {
        SourceType::Sangtacviet
    }

    fn home_url(&self) -> &str {
        &self.base_url
    }

    async fn extract_source_session(&self, page: &dyn PageHandle) -> Result<(), ExtractionError> {
        info!("Logging in to {}", self.base_url);
        self.settle().await;

        // Language modal only shows on a fresh profile
        if page.exists(LANGUAGE_OPTION).await? {
            match self.ctx.behavior.click(page, LANGUAGE_OPTION).await {
                Ok(()) => {
                    self.settle().await;
                    if let Err(e) = page.wait_for_load().await {
                        warn!("Error waiting for page to load after language selection: {}", e);
                    }
                }
                Err(e) => warn!("Error clicking language option: {}", e),
            }
        } else {
            debug!("Language option not found, continuing");
        }

        let opened = page.evaluate(OPEN_LOGIN_SCRIPT).await?;
        if opened != serde_json::Value::Bool(true) {
            debug!("Login link not found, looking for the form directly");
        }

        self.ctx
            .behavior
            .type_text(page, USERNAME_INPUT, &self.username)
            .await
            .map_err(ExtractionError::from_lookup)?;
        self.ctx
            .behavior
            .type_text(page, PASSWORD_INPUT, &self.password)
            .await
            .map_err(ExtractionError::from_lookup)?;

        page.evaluate(SUBMIT_LOGIN_SCRIPT).await?;
        self.save_debug_screenshot(page, "login_debug.png").await;

        page.wait_for_load().await?;

        if !self.ctx.gate.check_login(page, "login").await? {
            debug!("No captcha after login");
        }

        self.save_debug_screenshot(page, "final_debug.png").await;
        info!("Login flow finished for {}", self.base_url);
        Ok(())
    }

    async fn extract_session(&self, url: &str, page: &dyn PageHandle) -> Result<(), ExtractionError> {
        if !url.starts_with(&self.ctx.session_prefix) {
            return self.extract_source_session(page).await;
        }

        self.ctx
            .gate
            .confirm("Open a chapter in the browser window, then confirm here")
            .await?;

        if let Err(e) = page.wait_for_load().await {
            warn!("Error waiting for page after confirmation: {}", e);
        }
        self.ctx.gate.check(page, "session").await?;
        Ok(())
    }

    async fn extract_chapter(&self, url: &str, page: &dyn PageHandle) -> Result<ChapterContent, ExtractionError> {
        let path = parse_chapter_path(url)?;
        let endpoint = format!(
            "{}/index.php?bookid={}&c={}&h={}&ngmar=readc&sajax=readchapter&sty={}&exts=",
            Self::origin(url)?,
            path.book_id,
            path.chapter_id,
            path.host,
            path.sty
        );

        match self.call_endpoint(page, CHAPTER_SCRIPT, &endpoint).await {
            Ok(html) => {
                let text = self.ctx.glyphs.apply(&html_to_text(&html));
                info!("Extracted chapter {} of book {} ({} chars)", path.chapter_id, path.book_id, text.len());
                Ok(ChapterContent {
                    url: url.to_string(),
                    book_id: path.book_id,
                    chapter_id: path.chapter_id,
                    text,
                })
            }
            Err(ExtractionError::Endpoint(reason)) => {
                let rendered = self.wait_for_reader(url, page).await?;
                if !rendered {
                    warn!("Reader never rendered content for {}", url);
                }
                Err(ExtractionError::PageLoading(format!("{} ({})", url, reason)))
            }
            Err(e) => Err(e),
        }
    }

    async fn extract_book_info(&self, url: &str, page: &dyn PageHandle) -> Result<Book, ExtractionError> {
        let path = parse_book_path(url)?;

        let name = page.text_of(BOOK_NAME).await.map_err(ExtractionError::from_lookup)?;
        let author = page.text_of(AUTHOR_NAME).await.map_err(ExtractionError::from_lookup)?;
        let image_url = page
            .attribute_of(COVER_IMAGE, "src")
            .await
            .map_err(ExtractionError::from_lookup)?
            .ok_or_else(|| ExtractionError::MissingElement(format!("{}[src]", COVER_IMAGE)))?;

        let endpoint = format!(
            "{}/index.php?ngmar=chapterlist&h={}&bookid={}&sajax=getchapterlist",
            Self::origin(url)?,
            path.host,
            path.book_id
        );
        let data = self.call_endpoint(page, CHAPTER_LIST_SCRIPT, &endpoint).await?;
        let chapters = parse_chapter_list(&data, url);
        info!("Book {} has {} chapters", path.book_id, chapters.len());

        Ok(Book {
            url: url.to_string(),
            id: path.book_id,
            name: name.trim().to_string(),
            image_url,
            author: author.trim().to_string(),
            host: path.host,
            chapters,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::testing::{FakePage, FakeWeb, PageFixture};
    use crate::browser::CaptchaError;
    use crate::source::tests::test_context;
    use serde_json::json;
    use std::sync::Arc;

    const BOOK_URL: &str = "https://sangtacviet.app/truyen/qidian/1/1033219/";
    const CHAPTER_URL: &str = "https://sangtacviet.app/truyen/qidian/1/1033219/70512/";

    fn adapter(dir: &std::path::Path) -> (Sangtacviet, tokio::sync::mpsc::Sender<()>) {
        let (ctx, tx) = test_context(dir);
        let website = Website {
            id: 1,
            name: "STV".to_string(),
            url: "https://sangtacviet.app".to_string(),
            script_name: "sangtacviet".to_string(),
            crawl_interval: 0,
            enabled: true,
            username: "reader".to_string(),
            password: "pw".to_string(),
        };
        (Sangtacviet::new(&website, ctx), tx)
    }

    fn page_at(url: &str, fixture: PageFixture) -> (Arc<FakeWeb>, FakePage) {
        let web = FakeWeb::new();
        web.serve(url, fixture);
        let page = FakePage::standalone(Arc::clone(&web), url);
        (web, page)
    }

    #[test]
    fn test_chapter_path_segments() {
        let path = parse_chapter_path(CHAPTER_URL).unwrap();
        assert_eq!(
            path,
            ChapterPath {
                book_id: "1033219".to_string(),
                chapter_id: "70512".to_string(),
                host: "qidian".to_string(),
                sty: "1".to_string(),
            }
        );

        // A book URL is one segment short
        let err = parse_chapter_path(BOOK_URL).unwrap_err();
        assert!(matches!(err, ExtractionError::InvalidPath { expected: 9, actual: 8, .. }));
    }

    #[test]
    fn test_book_path_segments() {
        let path = parse_book_path(BOOK_URL).unwrap();
        assert_eq!(path.book_id, "1033219");
        assert_eq!(path.host, "qidian");

        assert!(parse_book_path(CHAPTER_URL).is_err());
    }

    #[test]
    fn test_parse_chapter_list() {
        let data = "1-/-101-/- Chương 1: Mở đầu -//-1-/-102-/-Chương 2-//-1-/-broken";
        let chapters = parse_chapter_list(data, BOOK_URL);

        assert_eq!(chapters.len(), 2);
        assert_eq!(chapters[0].id, "101");
        assert_eq!(chapters[0].name, "Chương 1: Mở đầu");
        assert_eq!(chapters[0].number, 1);
        assert_eq!(chapters[0].url, format!("{}101/", BOOK_URL));
        assert_eq!(chapters[1].number, 2);
        assert!(parse_chapter_list("", BOOK_URL).is_empty());
    }

    #[test]
    fn test_html_to_text_one_paragraph_per_line() {
        let html = "<p>Dòng một</p><p>\tDòng <i>hai</i></p><p></p><div>cuối</div>";
        assert_eq!(html_to_text(html), "Dòng một\nDòng hai\ncuối");
    }

    #[tokio::test]
    async fn test_chapter_rejects_wrong_length_before_any_request() {
        let dir = tempfile::tempdir().unwrap();
        let (adapter, _tx) = adapter(dir.path());
        let (web, page) = page_at(BOOK_URL, PageFixture::default());

        let result = adapter.extract_chapter(BOOK_URL, &page).await;
        assert!(matches!(result, Err(ExtractionError::InvalidPath { .. })));
        assert!(web.evaluated_scripts().is_empty());
    }

    #[tokio::test]
    async fn test_chapter_from_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let (adapter, _tx) = adapter(dir.path());
        let (web, page) = page_at(
            CHAPTER_URL,
            PageFixture::default().with_script(
                "sajax=readchapter",
                json!({"ok": true, "data": "<p>Một</p><p>Hai</p>"}),
            ),
        );

        let chapter = adapter.extract_chapter(CHAPTER_URL, &page).await.unwrap();
        assert_eq!(chapter.text, "Một\nHai");
        assert_eq!(chapter.book_id, "1033219");
        assert_eq!(chapter.chapter_id, "70512");

        let scripts = web.evaluated_scripts();
        assert!(scripts[0].contains(
            "https://sangtacviet.app/index.php?bookid=1033219&c=70512&h=qidian&ngmar=readc&sajax=readchapter&sty=1&exts="
        ));
    }

    #[tokio::test]
    async fn test_chapter_not_ready_reloads_and_reports_loading() {
        let dir = tempfile::tempdir().unwrap();
        let (adapter, _tx) = adapter(dir.path());
        let (web, page) = page_at(
            CHAPTER_URL,
            PageFixture::default()
                .with_script("sajax=readchapter", json!({"ok": false, "error": "code is 5"}))
                .with_selector(READER_CONTENT),
        );

        let result = adapter.extract_chapter(CHAPTER_URL, &page).await;
        assert!(matches!(result, Err(ExtractionError::PageLoading(_))));
        assert!(web.events().contains(&format!("goto:{}", CHAPTER_URL)));
    }

    #[tokio::test]
    async fn test_book_info() {
        let dir = tempfile::tempdir().unwrap();
        let (adapter, _tx) = adapter(dir.path());
        let (_web, page) = page_at(
            BOOK_URL,
            PageFixture::default()
                .with_text(BOOK_NAME, " Đấu Phá ")
                .with_text(AUTHOR_NAME, "Thiên Tằm")
                .with_attribute(COVER_IMAGE, "src", "https://img/cover.jpg")
                .with_script(
                    "sajax=getchapterlist",
                    json!({"ok": true, "data": "1-/-11-/-Một-//-1-/-12-/-Hai"}),
                ),
        );

        let book = adapter.extract_book_info(BOOK_URL, &page).await.unwrap();
        assert_eq!(book.name, "Đấu Phá");
        assert_eq!(book.author, "Thiên Tằm");
        assert_eq!(book.image_url, "https://img/cover.jpg");
        assert_eq!(book.id, "1033219");
        assert_eq!(book.host, "qidian");
        assert_eq!(book.chapters.len(), 2);
        assert_eq!(book.chapters[1].url, format!("{}12/", BOOK_URL));
    }

    #[tokio::test]
    async fn test_book_info_missing_title() {
        let dir = tempfile::tempdir().unwrap();
        let (adapter, _tx) = adapter(dir.path());
        let (_web, page) = page_at(BOOK_URL, PageFixture::default());

        let result = adapter.extract_book_info(BOOK_URL, &page).await;
        assert!(matches!(result, Err(ExtractionError::MissingElement(ref s)) if s == BOOK_NAME));
    }

    #[tokio::test]
    async fn test_login_flow_types_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let (adapter, _tx) = adapter(dir.path());
        let (web, page) = page_at(
            "https://sangtacviet.app/",
            PageFixture::default()
                .with_selector(LANGUAGE_OPTION)
                .with_selector(USERNAME_INPUT)
                .with_selector(PASSWORD_INPUT)
                .with_script("#tm-nav-search-top-right", json!(true))
                .with_script("loginstv", json!(true)),
        );

        adapter.extract_source_session(&page).await.unwrap();

        let events = web.events();
        assert!(events.contains(&format!("click:{}", LANGUAGE_OPTION)));
        let typed_user: String = events
            .iter()
            .filter_map(|e| e.strip_prefix(&format!("type:{}:", USERNAME_INPUT)))
            .collect();
        assert_eq!(typed_user, "reader");
        assert!(web.evaluated_scripts().iter().any(|s| s.contains("loginstv")));
        assert!(dir.path().join("login_debug.png").exists());
    }

    #[test]
    fn test_open_login_script_keeps_id_selector() {
        assert!(OPEN_LOGIN_SCRIPT.contains(r##"querySelector("#tm-nav-search-top-right a")"##));
        assert!(OPEN_LOGIN_SCRIPT.trim_end().ends_with("})()"));
    }

    #[tokio::test]
    async fn test_login_without_form_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (adapter, _tx) = adapter(dir.path());
        let (_web, page) = page_at("https://sangtacviet.app/", PageFixture::default());

        let result = adapter.extract_source_session(&page).await;
        assert!(matches!(result, Err(ExtractionError::MissingElement(ref s)) if s == USERNAME_INPUT));
    }

    #[tokio::test]
    async fn test_prefixed_session_waits_for_operator() {
        let dir = tempfile::tempdir().unwrap();
        let (adapter, tx) = adapter(dir.path());
        let (web, page) = page_at(CHAPTER_URL, PageFixture::default());

        tx.send(()).await.unwrap();
        adapter
            .extract_session(&format!("session:{}", CHAPTER_URL), &page)
            .await
            .unwrap();

        // No login was attempted
        assert!(web.evaluated_scripts().is_empty());
    }

    #[tokio::test]
    async fn test_prefixed_session_without_operator_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (adapter, tx) = adapter(dir.path());
        let (_web, page) = page_at(CHAPTER_URL, PageFixture::default());
        drop(tx);

        let result = adapter.extract_session(&format!("session:{}", CHAPTER_URL), &page).await;
        assert!(matches!(result, Err(ExtractionError::Captcha(CaptchaError::SignalClosed))));
    }
}
