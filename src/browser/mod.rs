pub mod behavior;
pub mod captcha;
pub mod cdp;
pub mod page;
pub mod session;
pub mod state;

#[cfg(test)]
pub mod testing;

// Re-export common types
pub use behavior::BehaviorSimulator;
pub use captcha::{CaptchaError, CaptchaGate, CaptchaResolver, ChannelSignal, ConsoleSignal, OperatorResolver, OperatorSignal};
pub use cdp::CdpLauncher;
pub use page::{BrowserCookie, BrowserError, BrowserHandle, BrowserLauncher, PageHandle, StorageArea};
pub use session::{BrowserLease, BrowserSessionManager};
pub use state::{SessionData, SessionError, SessionStore, SessionSummary};
