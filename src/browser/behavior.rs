use rand::{thread_rng, Rng};
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

use crate::browser::page::{BrowserError, PageHandle};

/// Human-like input pacing for form interaction
#[derive(Debug, Clone)]
pub struct BehaviorSimulator {
    /// Min and max milliseconds per typed character
    typing_speed: (u64, u64),

    /// Min and max milliseconds before a click
    click_delay: (u64, u64),
}

fn pick(range: (u64, u64)) -> u64 {
    let (low, high) = range;
    if high <= low {
        return low;
    }
    thread_rng().gen_range(low..high)
}

impl BehaviorSimulator {
    pub fn new(typing_speed: (u64, u64), click_delay: (u64, u64)) -> Self {
        Self {
            typing_speed,
            click_delay,
        }
    }

    /// No delays at all
    pub fn instant() -> Self {
        Self::new((0, 0), (0, 0))
    }

    /// Click with a random reaction delay
    pub async fn click(&self, page: &dyn PageHandle, selector: &str) -> Result<(), BrowserError> {
        // Random delay before clicking (simulates human reaction time)
        sleep(Duration::from_millis(pick(self.click_delay))).await;
        page.click(selector).await?;
        debug!("Clicked {}", selector);
        Ok(())
    }

    /// Type text one character at a time with variable speed
    pub async fn type_text(&self, page: &dyn PageHandle, selector: &str, text: &str) -> Result<(), BrowserError> {
        let mut buf = [0u8; 4];
        for c in text.chars() {
            page.type_into(selector, c.encode_utf8(&mut buf)).await?;
            sleep(Duration::from_millis(pick(self.typing_speed))).await;
        }

        debug!("Typed {} characters into {}", text.chars().count(), selector);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::testing::{FakePage, FakeWeb, PageFixture};
    use std::sync::Arc;

    #[test]
    fn test_pick_stays_in_range() {
        for _ in 0..100 {
            let value = pick((50, 150));
            assert!((50..150).contains(&value));
        }
        assert_eq!(pick((7, 7)), 7);
        assert_eq!(pick((9, 3)), 9);
    }

    #[tokio::test]
    async fn test_type_text_sends_each_character() {
        let web = FakeWeb::new();
        web.serve("https://x/", PageFixture::default().with_selector("input[name*='user']"));
        let page = FakePage::standalone(Arc::clone(&web), "https://x/");

        BehaviorSimulator::instant()
            .type_text(&page, "input[name*='user']", "ab")
            .await
            .unwrap();

        let typed: Vec<_> = web.events().into_iter().filter(|e| e.starts_with("type:")).collect();
        assert_eq!(typed, vec!["type:input[name*='user']:a", "type:input[name*='user']:b"]);
    }

    #[tokio::test]
    async fn test_click_missing_element_fails() {
        let web = FakeWeb::new();
        let page = FakePage::standalone(web, "https://x/");

        let result = BehaviorSimulator::instant().click(&page, "#login").await;
        assert!(matches!(result, Err(BrowserError::ElementNotFound(_))));
    }
}
