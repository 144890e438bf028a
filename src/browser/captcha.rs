use async_trait::async_trait;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines, Stdin};
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::browser::page::{BrowserError, PageHandle};

#[derive(Debug, Error)]
pub enum CaptchaError {
    #[error("captcha was not resolved within {0:?}")]
    Timeout(Duration),

    #[error("operator signal source closed")]
    SignalClosed,

    #[error(transparent)]
    Browser(#[from] BrowserError),
}

/// Known captcha markers, in detection order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptchaKind {
    Recaptcha,
    Hcaptcha,
    InputField,
    Image,
}

impl CaptchaKind {
    pub const ALL: [CaptchaKind; 4] = [
        CaptchaKind::Recaptcha,
        CaptchaKind::Hcaptcha,
        CaptchaKind::InputField,
        CaptchaKind::Image,
    ];

    pub fn selector(self) -> &'static str {
        match self {
            CaptchaKind::Recaptcha => "iframe[src*='recaptcha']",
            CaptchaKind::Hcaptcha => "iframe[src*='hcaptcha']",
            CaptchaKind::InputField => "input[name*='captcha'], input[id*='captcha'], .captcha-input",
            CaptchaKind::Image => "img[src*='captcha'], img[alt*='captcha'], .captcha-image",
        }
    }
}

/// First captcha marker present on `page`
pub async fn detect_kind(page: &dyn PageHandle) -> Result<Option<CaptchaKind>, BrowserError> {
    for kind in CaptchaKind::ALL {
        if page.exists(kind.selector()).await? {
            info!("Captcha detected: {:?}", kind);
            return Ok(Some(kind));
        }
    }
    Ok(None)
}

/// Whether any captcha marker is present. Lookup failures count as absent.
pub async fn detect(page: &dyn PageHandle) -> bool {
    match detect_kind(page).await {
        Ok(kind) => kind.is_some(),
        Err(e) => {
            warn!("Captcha detection failed: {}", e);
            false
        }
    }
}

/// Something that tells the agent a human finished at the browser
#[async_trait]
pub trait OperatorSignal: Send + Sync {
    async fn wait(&self, prompt: &str) -> Result<(), CaptchaError>;
}

/// Waits for Enter on the agent's terminal.
///
/// One reader lives as long as the signal, so input typed ahead is kept for
/// the next wait.
pub struct ConsoleSignal<R = Stdin> {
    lines: Mutex<Lines<BufReader<R>>>,
}

impl ConsoleSignal {
    pub fn new() -> Self {
        Self::from_reader(tokio::io::stdin())
    }
}

impl Default for ConsoleSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: AsyncRead + Unpin> ConsoleSignal<R> {
    pub fn from_reader(reader: R) -> Self {
        Self {
            lines: Mutex::new(BufReader::new(reader).lines()),
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> OperatorSignal for ConsoleSignal<R> {
    async fn wait(&self, prompt: &str) -> Result<(), CaptchaError> {
        println!("\n==================================================");
        println!("{}", prompt);
        println!("Press Enter to continue...");
        println!("==================================================");

        let mut lines = self.lines.lock().await;
        match lines.next_line().await {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(CaptchaError::SignalClosed),
            Err(e) => {
                warn!("Failed to read operator input: {}", e);
                Err(CaptchaError::SignalClosed)
            }
        }
    }
}

/// Signal delivered programmatically, e.g. from a webhook or a test
pub struct ChannelSignal {
    rx: Mutex<mpsc::Receiver<()>>,
}

impl ChannelSignal {
    pub fn new() -> (Self, mpsc::Sender<()>) {
        let (tx, rx) = mpsc::channel(8);
        (Self { rx: Mutex::new(rx) }, tx)
    }
}

#[async_trait]
impl OperatorSignal for ChannelSignal {
    async fn wait(&self, prompt: &str) -> Result<(), CaptchaError> {
        info!("Waiting for operator: {}", prompt);
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(CaptchaError::SignalClosed)
    }
}

/// Await `signal`, bounded by `timeout` when one is set
async fn wait_for_operator(
    signal: &dyn OperatorSignal,
    prompt: &str,
    timeout: Option<Duration>,
) -> Result<(), CaptchaError> {
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, signal.wait(prompt)).await {
            Ok(result) => result,
            Err(_) => Err(CaptchaError::Timeout(limit)),
        },
        None => signal.wait(prompt).await,
    }
}

/// Strategy for getting past a detected captcha
#[async_trait]
pub trait CaptchaResolver: Send + Sync {
    /// Return once the captcha on `page` is solved and the page has settled
    async fn resolve(&self, page: &dyn PageHandle, label: &str, grace: Duration) -> Result<(), CaptchaError>;
}

/// Hands the captcha to a human at the visible browser
pub struct OperatorResolver {
    signal: Arc<dyn OperatorSignal>,

    /// Where screenshots of the captcha are written
    artifact_dir: PathBuf,

    timeout: Option<Duration>,
}

impl OperatorResolver {
    pub fn new(signal: Arc<dyn OperatorSignal>, artifact_dir: PathBuf, timeout: Option<Duration>) -> Self {
        Self {
            signal,
            artifact_dir,
            timeout,
        }
    }

    async fn save_screenshot(&self, page: &dyn PageHandle, label: &str) -> Option<PathBuf> {
        let png = match page.screenshot().await {
            Ok(png) => png,
            Err(e) => {
                warn!("Error taking captcha screenshot: {}", e);
                return None;
            }
        };

        let path = self
            .artifact_dir
            .join(format!("{}_captcha_{}.png", label, Utc::now().format("%Y%m%d%H%M%S")));

        if let Err(e) = tokio::fs::create_dir_all(&self.artifact_dir).await {
            warn!("Error creating artifact directory: {}", e);
            return None;
        }
        match tokio::fs::write(&path, png).await {
            Ok(()) => Some(path),
            Err(e) => {
                warn!("Error saving captcha screenshot: {}", e);
                None
            }
        }
    }
}

#[async_trait]
impl CaptchaResolver for OperatorResolver {
    async fn resolve(&self, page: &dyn PageHandle, label: &str, grace: Duration) -> Result<(), CaptchaError> {
        if let Some(path) = self.save_screenshot(page, label).await {
            info!("Captcha screenshot saved to {}", path.display());
        }

        wait_for_operator(
            self.signal.as_ref(),
            "CAPTCHA DETECTED - MANUAL INTERVENTION REQUIRED",
            self.timeout,
        )
        .await?;

        info!("Continuing after manual captcha resolution");

        // Redirects usually follow a solved challenge
        tokio::time::sleep(grace).await;
        page.wait_for_load().await?;

        Ok(())
    }
}

/// Detection plus resolution, interposed wherever a page may be challenged
pub struct CaptchaGate {
    resolver: Arc<dyn CaptchaResolver>,
    signal: Arc<dyn OperatorSignal>,
    timeout: Option<Duration>,
    grace: Duration,
    login_grace: Duration,
}

impl CaptchaGate {
    pub fn new(
        resolver: Arc<dyn CaptchaResolver>,
        signal: Arc<dyn OperatorSignal>,
        timeout: Option<Duration>,
        grace: Duration,
        login_grace: Duration,
    ) -> Self {
        Self {
            resolver,
            signal,
            timeout,
            grace,
            login_grace,
        }
    }

    /// Resolve a captcha if one is present. Returns whether one was found.
    pub async fn check(&self, page: &dyn PageHandle, label: &str) -> Result<bool, CaptchaError> {
        self.check_with_grace(page, label, self.grace).await
    }

    /// Like [`check`](Self::check), with the longer settle time used after a login submit
    pub async fn check_login(&self, page: &dyn PageHandle, label: &str) -> Result<bool, CaptchaError> {
        self.check_with_grace(page, label, self.login_grace).await
    }

    async fn check_with_grace(
        &self,
        page: &dyn PageHandle,
        label: &str,
        grace: Duration,
    ) -> Result<bool, CaptchaError> {
        if !detect(page).await {
            return Ok(false);
        }
        self.resolver.resolve(page, label, grace).await?;
        Ok(true)
    }

    /// Block until the operator confirms an interactive step
    pub async fn confirm(&self, prompt: &str) -> Result<(), CaptchaError> {
        wait_for_operator(self.signal.as_ref(), prompt, self.timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::testing::{FakePage, FakeWeb, PageFixture};

    const URL: &str = "https://sangtacviet.app/";

    fn page_with(fixture: PageFixture) -> (Arc<FakeWeb>, FakePage) {
        let web = FakeWeb::new();
        web.serve(URL, fixture);
        let page = FakePage::standalone(Arc::clone(&web), URL);
        (web, page)
    }

    fn gate(signal: Arc<ChannelSignal>, dir: PathBuf, timeout: Option<Duration>) -> CaptchaGate {
        let resolver = Arc::new(OperatorResolver::new(signal.clone(), dir, timeout));
        CaptchaGate::new(resolver, signal, timeout, Duration::ZERO, Duration::ZERO)
    }

    #[tokio::test]
    async fn test_detects_recaptcha_alone() {
        let (_web, page) = page_with(PageFixture::default().with_selector(CaptchaKind::Recaptcha.selector()));

        assert!(detect(&page).await);
        assert_eq!(detect_kind(&page).await.unwrap(), Some(CaptchaKind::Recaptcha));
    }

    #[tokio::test]
    async fn test_no_marker_means_no_captcha() {
        let (_web, page) = page_with(PageFixture::html("<html><body>chapter</body></html>"));
        assert!(!detect(&page).await);
    }

    #[tokio::test]
    async fn test_first_match_wins() {
        let (_web, page) = page_with(
            PageFixture::default()
                .with_selector(CaptchaKind::Image.selector())
                .with_selector(CaptchaKind::Hcaptcha.selector()),
        );
        assert_eq!(detect_kind(&page).await.unwrap(), Some(CaptchaKind::Hcaptcha));
    }

    #[tokio::test]
    async fn test_operator_signal_resumes_and_saves_screenshot() {
        let dir = tempfile::tempdir().unwrap();
        let (web, page) = page_with(PageFixture::default().with_selector(CaptchaKind::InputField.selector()));
        let (signal, tx) = ChannelSignal::new();
        let gate = gate(Arc::new(signal), dir.path().to_path_buf(), Some(Duration::from_secs(5)));

        tx.send(()).await.unwrap();
        assert!(gate.check(&page, "login").await.unwrap());

        assert!(web.events().contains(&"screenshot".to_string()));
        let saved: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(saved.len(), 1);
    }

    #[tokio::test]
    async fn test_console_signal_keeps_typed_ahead_lines() {
        let signal = ConsoleSignal::from_reader(&b"first\nsecond\n"[..]);

        assert!(signal.wait("captcha").await.is_ok());
        assert!(signal.wait("captcha").await.is_ok());
        assert!(matches!(signal.wait("captcha").await, Err(CaptchaError::SignalClosed)));
    }

    #[tokio::test]
    async fn test_unanswered_captcha_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let (_web, page) = page_with(PageFixture::default().with_selector(CaptchaKind::Recaptcha.selector()));
        let (signal, _tx) = ChannelSignal::new();
        let gate = gate(Arc::new(signal), dir.path().to_path_buf(), Some(Duration::from_millis(20)));

        let result = gate.check(&page, "chapter").await;
        assert!(matches!(result, Err(CaptchaError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_clean_page_skips_resolver() {
        let dir = tempfile::tempdir().unwrap();
        let (web, page) = page_with(PageFixture::html("<p>ok</p>"));
        let (signal, _tx) = ChannelSignal::new();
        let gate = gate(Arc::new(signal), dir.path().to_path_buf(), None);

        assert!(!gate.check(&page, "book").await.unwrap());
        assert!(!web.events().contains(&"screenshot".to_string()));
    }
}
