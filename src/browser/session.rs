use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, error, info, warn};

use crate::browser::page::{BrowserError, BrowserHandle, BrowserLauncher, PageHandle};

/// Visibility of the shared browser and the process itself
pub struct ModeState {
    headless: bool,
    browser: Option<Arc<dyn BrowserHandle>>,
}

impl ModeState {
    /// Tear down the running browser and start one with the requested visibility
    async fn relaunch(&mut self, launcher: &dyn BrowserLauncher, headless: bool) -> Result<(), BrowserError> {
        if let Some(old) = self.browser.take() {
            if let Err(e) = old.shutdown().await {
                error!("Error closing browser before relaunch: {}", e);
            }
        }

        self.browser = Some(launcher.launch(headless).await?);
        self.headless = headless;
        info!("Browser relaunched (headless: {})", headless);
        Ok(())
    }
}

/// Owner of the single browser process shared by every worker.
///
/// Page work holds a shared lease for as long as it keeps pages open. Switching
/// between headless and visible takes the exclusive lease, which waits for all
/// shared holders to finish, so no page ever outlives the browser it came from.
pub struct BrowserSessionManager {
    launcher: Arc<dyn BrowserLauncher>,

    state: Arc<RwLock<ModeState>>,

    /// Mode the browser returns to after an exclusive lease
    default_headless: bool,
}

impl BrowserSessionManager {
    pub fn new(launcher: Arc<dyn BrowserLauncher>, headless: bool) -> Self {
        Self {
            launcher,
            state: Arc::new(RwLock::new(ModeState {
                headless,
                browser: None,
            })),
            default_headless: headless,
        }
    }

    /// Launch the browser if it is not running yet
    pub async fn initialize(&self) -> Result<(), BrowserError> {
        let mut state = self.state.write().await;
        if state.browser.is_none() {
            let headless = state.headless;
            state.relaunch(self.launcher.as_ref(), headless).await?;
        }
        Ok(())
    }

    /// Lease for ordinary page work; many may be held at once
    pub async fn shared(&self) -> Result<BrowserLease, BrowserError> {
        let guard = Arc::clone(&self.state).read_owned().await;
        if guard.browser.is_none() {
            return Err(BrowserError::NotRunning);
        }
        Ok(BrowserLease::Shared(guard))
    }

    /// Sole use of the browser in the given mode, relaunching it if needed.
    ///
    /// The browser goes back to the default mode on [`BrowserLease::release`].
    pub async fn exclusive(&self, headless: bool) -> Result<BrowserLease, BrowserError> {
        let mut guard = Arc::clone(&self.state).write_owned().await;
        if guard.browser.is_none() || guard.headless != headless {
            if let Err(e) = guard.relaunch(self.launcher.as_ref(), headless).await {
                // Never leave the shared holders without a browser
                error!("Could not switch browser (headless: {}): {}", headless, e);
                if let Err(restore) = guard.relaunch(self.launcher.as_ref(), self.default_headless).await {
                    error!("Could not restore browser (headless: {}): {}", self.default_headless, restore);
                }
                return Err(e);
            }
        }
        debug!("Exclusive browser lease taken (headless: {})", headless);

        Ok(BrowserLease::Exclusive {
            guard,
            launcher: Arc::clone(&self.launcher),
            restore_headless: self.default_headless,
        })
    }

    /// Relaunch the browser with a new visibility; waits for every lease to be returned
    pub async fn set_headless(&self, headless: bool) -> Result<(), BrowserError> {
        let mut state = self.state.write().await;
        if state.browser.is_some() && state.headless == headless {
            return Ok(());
        }
        state.relaunch(self.launcher.as_ref(), headless).await
    }

    pub async fn is_headless(&self) -> bool {
        self.state.read().await.headless
    }

    /// Shut the browser down
    pub async fn close(&self) {
        let mut state = self.state.write().await;
        if let Some(browser) = state.browser.take() {
            if let Err(e) = browser.shutdown().await {
                error!("Error closing browser: {}", e);
            }
            debug!("Browser closed");
        }
    }

    /// Shut the browser down unless leases are still held after `limit`.
    /// Returns whether it was closed.
    pub async fn close_within(&self, limit: Duration) -> bool {
        match tokio::time::timeout(limit, self.close()).await {
            Ok(()) => true,
            Err(_) => {
                warn!("Browser still in use after {:?}, leaving it to exit with the process", limit);
                false
            }
        }
    }
}

/// Access to the shared browser, see [`BrowserSessionManager`]
pub enum BrowserLease {
    Shared(OwnedRwLockReadGuard<ModeState>),
    Exclusive {
        guard: OwnedRwLockWriteGuard<ModeState>,
        launcher: Arc<dyn BrowserLauncher>,
        restore_headless: bool,
    },
}

impl BrowserLease {
    fn state(&self) -> &ModeState {
        match self {
            BrowserLease::Shared(guard) => &**guard,
            BrowserLease::Exclusive { guard, .. } => &**guard,
        }
    }

    pub fn is_headless(&self) -> bool {
        self.state().headless
    }

    pub fn is_exclusive(&self) -> bool {
        matches!(self, BrowserLease::Exclusive { .. })
    }

    /// Open a tab on the leased browser
    pub async fn new_page(&self) -> Result<Box<dyn PageHandle>, BrowserError> {
        match &self.state().browser {
            Some(browser) => browser.new_page().await,
            None => Err(BrowserError::NotRunning),
        }
    }

    /// Give the lease back, restoring the default mode after exclusive use
    pub async fn release(self) -> Result<(), BrowserError> {
        match self {
            BrowserLease::Shared(_) => Ok(()),
            BrowserLease::Exclusive {
                mut guard,
                launcher,
                restore_headless,
            } => {
                if guard.headless != restore_headless || guard.browser.is_none() {
                    guard.relaunch(launcher.as_ref(), restore_headless).await?;
                }
                debug!("Exclusive browser lease released");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::testing::{FakeLauncher, FakeWeb};

    fn manager() -> (Arc<FakeLauncher>, BrowserSessionManager) {
        let launcher = FakeLauncher::new(FakeWeb::new());
        let manager = BrowserSessionManager::new(launcher.clone(), true);
        (launcher, manager)
    }

    #[tokio::test]
    async fn test_shared_lease_requires_running_browser() {
        let (_launcher, manager) = manager();
        assert!(matches!(manager.shared().await, Err(BrowserError::NotRunning)));

        manager.initialize().await.unwrap();
        let lease = manager.shared().await.unwrap();
        assert!(lease.is_headless());
        assert!(lease.new_page().await.is_ok());
    }

    #[tokio::test]
    async fn test_shared_leases_coexist() {
        let (_launcher, manager) = manager();
        manager.initialize().await.unwrap();

        let first = manager.shared().await.unwrap();
        let second = tokio::time::timeout(Duration::from_millis(100), manager.shared()).await;
        assert!(second.is_ok());
        drop(first);
    }

    #[tokio::test]
    async fn test_exclusive_lease_toggles_and_restores() {
        let (launcher, manager) = manager();
        manager.initialize().await.unwrap();

        let lease = manager.exclusive(false).await.unwrap();
        assert!(!lease.is_headless());
        assert!(lease.is_exclusive());
        lease.release().await.unwrap();

        assert!(manager.is_headless().await);
        assert_eq!(launcher.launches(), vec![true, false, true]);
    }

    #[tokio::test]
    async fn test_failed_visible_launch_restores_headless() {
        let (launcher, manager) = manager();
        manager.initialize().await.unwrap();
        launcher.fail_visible_launches();

        let result = manager.exclusive(false).await;
        assert!(matches!(result, Err(BrowserError::Launch(_))));

        let lease = manager.shared().await.unwrap();
        assert!(lease.is_headless());
        assert!(lease.new_page().await.is_ok());
        assert_eq!(launcher.launches(), vec![true, false, true]);
    }

    #[tokio::test]
    async fn test_exclusive_waits_for_shared_holders() {
        let (_launcher, manager) = manager();
        manager.initialize().await.unwrap();

        let shared = manager.shared().await.unwrap();
        let blocked = tokio::time::timeout(Duration::from_millis(50), manager.exclusive(false)).await;
        assert!(blocked.is_err());

        drop(shared);
        let lease = manager.exclusive(false).await.unwrap();
        lease.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_gives_up_while_leased() {
        let (_launcher, manager) = manager();
        manager.initialize().await.unwrap();

        let lease = manager.exclusive(false).await.unwrap();
        assert!(!manager.close_within(Duration::from_millis(50)).await);

        lease.release().await.unwrap();
        assert!(manager.close_within(Duration::from_millis(50)).await);
        assert!(matches!(manager.shared().await, Err(BrowserError::NotRunning)));
    }

    #[tokio::test]
    async fn test_set_headless_relaunches_once() {
        let (launcher, manager) = manager();
        manager.initialize().await.unwrap();

        manager.set_headless(false).await.unwrap();
        manager.set_headless(false).await.unwrap();
        assert!(!manager.is_headless().await);
        assert_eq!(launcher.launches(), vec![true, false]);

        manager.close().await;
        assert!(manager.shared().await.is_err());
    }
}
