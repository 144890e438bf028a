use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::browser::page::{BrowserCookie, BrowserError, PageHandle, StorageArea};

#[derive(Debug, Error)]
pub enum SessionError {
    /// Nothing has been captured yet; callers continue without a session
    #[error("no session data at {0}")]
    NoData(PathBuf),

    #[error("session file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid session data: {0}")]
    Parse(#[from] serde_json::Error),

    #[error(transparent)]
    Browser(#[from] BrowserError),
}

/// Authentication state of the browser, as persisted between runs
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SessionData {
    /// Page the snapshot was taken on
    pub url: String,

    #[serde(default)]
    pub headers: HashMap<String, String>,

    #[serde(default)]
    pub cookies: Vec<BrowserCookie>,

    #[serde(default)]
    pub local_storage: HashMap<String, String>,

    #[serde(default)]
    pub session_storage: HashMap<String, String>,

    pub timestamp: DateTime<Utc>,
}

/// Counts reported upstream after a session task
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub url: String,
    pub cookies: usize,
    pub local_storage: usize,
    pub session_storage: usize,
    pub captured_at: DateTime<Utc>,
}

impl SessionData {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            timestamp: Utc::now(),
            ..Default::default()
        }
    }

    /// Cookies the browser would send to `host`
    pub fn cookies_for_host(&self, host: &str) -> Vec<BrowserCookie> {
        self.cookies
            .iter()
            .filter(|c| c.matches_host(host))
            .cloned()
            .collect()
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            url: self.url.clone(),
            cookies: self.cookies.len(),
            local_storage: self.local_storage.len(),
            session_storage: self.session_storage.len(),
            captured_at: self.timestamp,
        }
    }
}

/// Capture cookies and web storage from `page`.
///
/// Each source is read independently; a failed read is logged and the snapshot
/// carries whatever did succeed.
pub async fn extract(page: &dyn PageHandle) -> Result<SessionData, SessionError> {
    let url = page.current_url().await.unwrap_or_default();
    let mut data = SessionData::new(&url);

    match page.cookies().await {
        Ok(cookies) => data.cookies = cookies,
        Err(e) => warn!("Error extracting cookies: {}", e),
    }

    match page.storage_items(StorageArea::Local).await {
        Ok(items) => data.local_storage = items,
        Err(e) => warn!("Error extracting localStorage: {}", e),
    }

    match page.storage_items(StorageArea::Session).await {
        Ok(items) => data.session_storage = items,
        Err(e) => warn!("Error extracting sessionStorage: {}", e),
    }

    Ok(data)
}

/// Set each cookie on `page` for the navigation target `url`; a rejected cookie is skipped
pub async fn apply_cookies(page: &dyn PageHandle, cookies: &[BrowserCookie], url: &str) -> usize {
    let mut applied = 0;
    for cookie in cookies {
        match page.set_cookie(cookie, url).await {
            Ok(()) => applied += 1,
            Err(e) => warn!("Error setting cookie {}: {}", cookie.name, e),
        }
    }
    applied
}

/// Write both storage maps into the current origin of `page`
pub async fn apply_storage(page: &dyn PageHandle, data: &SessionData) -> Result<(), SessionError> {
    if !data.local_storage.is_empty() {
        page.set_storage_items(StorageArea::Local, &data.local_storage)
            .await?;
    }
    if !data.session_storage.is_empty() {
        page.set_storage_items(StorageArea::Session, &data.session_storage)
            .await?;
    }
    Ok(())
}

/// Replay a snapshot into `page`
pub async fn apply(page: &dyn PageHandle, data: &SessionData) -> Result<(), SessionError> {
    apply_cookies(page, &data.cookies, &data.url).await;
    apply_storage(page, data).await
}

/// Write `data` as JSON, replacing the file atomically
pub async fn save_to_disk(data: &SessionData, path: &Path) -> Result<(), SessionError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let contents = serde_json::to_vec_pretty(data)?;
    let tmp = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
    tokio::fs::write(&tmp, contents).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }

    debug!("Session data saved to {}", path.display());
    Ok(())
}

/// Read a snapshot; a missing file is [`SessionError::NoData`]
pub async fn load_from_disk(path: &Path) -> Result<SessionData, SessionError> {
    let contents = match tokio::fs::read(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(SessionError::NoData(path.to_path_buf()))
        }
        Err(e) => return Err(e.into()),
    };

    Ok(serde_json::from_slice(&contents)?)
}

/// The session snapshot owned by one engine: cached in memory, backed by one file
pub struct SessionStore {
    path: PathBuf,
    current: Mutex<Option<SessionData>>,
}

impl SessionStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            current: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current snapshot, reading the file on first use. `None` when nothing was captured yet.
    pub async fn load(&self) -> Result<Option<SessionData>, SessionError> {
        let mut current = self.current.lock().await;
        if current.is_none() {
            match load_from_disk(&self.path).await {
                Ok(data) => {
                    info!("Loaded session snapshot from {}", self.path.display());
                    *current = Some(data);
                }
                Err(SessionError::NoData(_)) => {
                    debug!("No session snapshot at {}", self.path.display());
                }
                Err(e) => return Err(e),
            }
        }
        Ok(current.clone())
    }

    /// Capture the state of `page`, persist it and make it current.
    ///
    /// Captures are serialized so the file and the cached snapshot always agree.
    pub async fn capture(&self, page: &dyn PageHandle) -> Result<SessionData, SessionError> {
        let mut current = self.current.lock().await;
        let data = extract(page).await?;
        save_to_disk(&data, &self.path).await?;
        *current = Some(data.clone());
        Ok(data)
    }

    /// Cookies of the current snapshot that apply to `host`
    pub async fn cookies_for_host(&self, host: &str) -> Result<Vec<BrowserCookie>, SessionError> {
        Ok(self
            .load()
            .await?
            .map(|data| data.cookies_for_host(host))
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::page::{BrowserHandle, BrowserLauncher};
    use crate::browser::testing::{FakeLauncher, FakeWeb, PageFixture};
    use std::sync::Arc;

    fn cookie(name: &str, value: &str, domain: &str) -> BrowserCookie {
        BrowserCookie {
            name: name.to_string(),
            value: value.to_string(),
            domain: domain.to_string(),
            path: "/".to_string(),
            expires: -1.0,
            secure: true,
            http_only: true,
            same_site: Some("Lax".to_string()),
        }
    }

    fn snapshot() -> SessionData {
        let mut data = SessionData::new("https://sangtacviet.app/");
        data.cookies = vec![
            cookie("PHPSESSID", "abc", ".sangtacviet.app"),
            cookie("tracker", "1", ".ads.example"),
        ];
        data.local_storage.insert("lang".to_string(), "vi".to_string());
        data.session_storage.insert("tab".to_string(), "reader".to_string());
        data
    }

    async fn open_page() -> Box<dyn PageHandle> {
        let web = FakeWeb::new();
        web.serve("https://sangtacviet.app/", PageFixture::html("<html></html>"));
        let launcher = FakeLauncher::new(web);
        let browser = launcher.launch(true).await.unwrap();
        let page = browser.new_page().await.unwrap();
        page.goto("https://sangtacviet.app/").await.unwrap();
        page
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let data = snapshot();

        let once = open_page().await;
        apply(once.as_ref(), &data).await.unwrap();
        let after_once = extract(once.as_ref()).await.unwrap();

        let twice = open_page().await;
        apply(twice.as_ref(), &data).await.unwrap();
        apply(twice.as_ref(), &data).await.unwrap();
        let after_twice = extract(twice.as_ref()).await.unwrap();

        assert_eq!(after_once.cookies, after_twice.cookies);
        assert_eq!(after_once.local_storage, after_twice.local_storage);
        assert_eq!(after_once.session_storage, after_twice.session_storage);
        assert_eq!(after_twice.cookies.len(), 2);
    }

    #[tokio::test]
    async fn test_cookies_apply_on_blank_page_with_target_url() {
        let web = FakeWeb::new();
        let browser = FakeLauncher::new(web).launch(true).await.unwrap();
        let page = browser.new_page().await.unwrap();
        assert_eq!(page.current_url().await.unwrap(), "about:blank");

        let data = snapshot();
        assert_eq!(apply_cookies(page.as_ref(), &data.cookies, "about:blank").await, 0);
        assert_eq!(apply_cookies(page.as_ref(), &data.cookies, "https://sangtacviet.app/").await, 2);
        assert_eq!(page.cookies().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_apply_with_empty_storage_is_ok() {
        let page = open_page().await;
        let data = SessionData::new("https://sangtacviet.app/");
        assert!(apply(page.as_ref(), &data).await.is_ok());
    }

    #[test]
    fn test_cookies_for_host() {
        let data = snapshot();
        let cookies = data.cookies_for_host("sangtacviet.app");
        assert_eq!(cookies.len(), 1);
        assert_eq!(cookies[0].name, "PHPSESSID");
    }

    #[tokio::test]
    async fn test_missing_file_is_no_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session_data.json");

        let result = load_from_disk(&path).await;
        assert!(matches!(result, Err(SessionError::NoData(_))));

        let store = SessionStore::new(path);
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_and_load_file_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("session_data.json");
        let data = snapshot();

        save_to_disk(&data, &path).await.unwrap();
        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert!(raw.get("local_storage").is_some());
        assert!(raw.get("session_storage").is_some());
        assert_eq!(raw["cookies"][0]["httpOnly"], true);

        let loaded = load_from_disk(&path).await.unwrap();
        assert_eq!(loaded, data);
    }

    #[tokio::test]
    async fn test_concurrent_saves_all_succeed() {
        let dir = tempfile::tempdir().unwrap();
        let path = Arc::new(dir.path().join("session_data.json"));

        for _ in 0..10 {
            let saves: Vec<_> = (0..8)
                .map(|i| {
                    let path = Arc::clone(&path);
                    tokio::spawn(async move {
                        let mut data = snapshot();
                        data.local_storage.insert("worker".to_string(), i.to_string());
                        save_to_disk(&data, &path).await
                    })
                })
                .collect();

            for save in futures::future::join_all(saves).await {
                assert!(save.unwrap().is_ok());
            }
            assert!(load_from_disk(&path).await.is_ok());
        }

        // Only the snapshot itself is left behind
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_captures_keep_file_and_cache_in_sync() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::new(dir.path().join("session_data.json")));
        let page: Arc<dyn PageHandle> = Arc::from(open_page().await);

        let captures: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                let page = Arc::clone(&page);
                tokio::spawn(async move {
                    page.set_cookie(&cookie("n", &i.to_string(), ".sangtacviet.app"), "https://sangtacviet.app/")
                        .await
                        .unwrap();
                    store.capture(page.as_ref()).await
                })
            })
            .collect();

        for capture in futures::future::join_all(captures).await {
            assert!(capture.unwrap().is_ok());
        }

        let cached = store.load().await.unwrap().unwrap();
        let on_disk = load_from_disk(store.path()).await.unwrap();
        assert_eq!(cached, on_disk);
    }

    #[tokio::test]
    async fn test_store_capture_persists_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("session_data.json"));

        let page = open_page().await;
        page.set_cookie(&cookie("sid", "42", ".sangtacviet.app"), "https://sangtacviet.app/")
            .await
            .unwrap();

        let captured = store.capture(page.as_ref()).await.unwrap();
        assert_eq!(captured.url, "https://sangtacviet.app/");
        assert_eq!(store.cookies_for_host("sangtacviet.app").await.unwrap().len(), 1);

        // A fresh store reads the same snapshot back from disk
        let reopened = SessionStore::new(store.path().to_path_buf());
        assert_eq!(reopened.load().await.unwrap().unwrap().cookies, captured.cookies);
    }
}
