use crate::agent::{Action, AgentError, Computer, Locator, PageHandle};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chromiumoxide::browser::Browser as OxideBrowser;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchMouseEventParams, DispatchMouseEventType, InsertTextParams, MouseButton,
};
use chromiumoxide::layout::Point;
use chromiumoxide::page::{Page, ScreenshotParamsBuilder};
use futures::StreamExt;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::sleep;
use tracing::debug;

const CREDENTIAL_PROBE: &str = r#"!!document.querySelector('input[type="password"], input[autocomplete="one-time-code"], input[name*="otp" i]')"#;
const TEXT_PROBE: &str = "document.body ? document.body.innerText : ''";
const READY_PROBE: &str = "document.readyState";

#[derive(Clone)]
pub struct BrowserConfig {
    pub headless: bool,
    pub user_agent: Option<String>,
    /// Quiet period after the document reports complete.
    pub settle: Duration,
    /// Upper bound on waiting for `document.readyState == "complete"`.
    pub ready_timeout: Duration,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: true,
            user_agent: None,
            settle: Duration::from_millis(400),
            ready_timeout: Duration::from_secs(10),
        }
    }
}

pub struct Browser {
    page: Page,
    _browser: OxideBrowser,
}

fn viewport() -> Result<SetDeviceMetricsOverrideParams> {
    SetDeviceMetricsOverrideParams::builder()
        .width(1280)
        .height(800)
        .device_scale_factor(1.0)
        .mobile(false)
        .build()
        .map_err(|e| anyhow!(e))
}

impl Browser {
    pub async fn launch(cfg: &BrowserConfig) -> Result<Self> {
        let mut builder = chromiumoxide::browser::BrowserConfig::builder();
        if !cfg.headless {
            builder = builder.with_head();
        }
        // A fresh profile per launch avoids ProcessSingleton lock conflicts on rapid restarts.
        let ts = SystemTime::now().duration_since(UNIX_EPOCH)?.as_millis();
        let mut profile_dir: PathBuf = std::env::temp_dir();
        profile_dir.push(format!("flowcap-profile-{}-{}", std::process::id(), ts));
        std::fs::create_dir_all(&profile_dir)?;
        builder = builder
            .user_data_dir(profile_dir)
            .arg("--no-first-run")
            .arg("--no-default-browser-check");
        let bcfg = builder.build().map_err(|e| anyhow!(e))?;
        let (browser, mut handler) = OxideBrowser::launch(bcfg).await?;
        tokio::spawn(async move { while let Some(_ev) = handler.next().await {} });
        let page = browser.new_page("about:blank").await?;
        Self::prepare(browser, page, cfg).await
    }

    /// Attaches to an already running Chromium, e.g. one the user is logged into.
    pub async fn connect(ws_url: &str, cfg: &BrowserConfig) -> Result<Self> {
        let (browser, mut handler) = OxideBrowser::connect(ws_url).await?;
        tokio::spawn(async move { while let Some(_ev) = handler.next().await {} });
        let page = match browser.pages().await?.into_iter().next() {
            Some(page) => page,
            None => browser.new_page("about:blank").await?,
        };
        Self::prepare(browser, page, cfg).await
    }

    async fn prepare(browser: OxideBrowser, page: Page, cfg: &BrowserConfig) -> Result<Self> {
        if let Some(ua) = &cfg.user_agent {
            page.set_user_agent(ua.clone()).await?;
        }
        // A zero-sized viewport breaks screenshots.
        page.execute(viewport()?).await?;
        Ok(Self { page, _browser: browser })
    }

    pub fn page(&self) -> &Page {
        &self.page
    }

    pub async fn goto(&self, url: &str) -> Result<()> {
        self.page.goto(url).await?;
        self.page.wait_for_navigation().await?;
        Ok(())
    }

    pub async fn move_mouse(&self, x: i64, y: i64) -> Result<()> {
        self.page.move_mouse(Point { x: x as f64, y: y as f64 }).await?;
        Ok(())
    }

    pub async fn click_at(&self, x: i64, y: i64) -> Result<()> {
        let cmd = DispatchMouseEventParams::builder()
            .x(x as f64)
            .y(y as f64)
            .button(MouseButton::Left)
            .click_count(1);
        let press = cmd
            .clone()
            .r#type(DispatchMouseEventType::MousePressed)
            .build()
            .map_err(|e| anyhow!(e))?;
        let release = cmd
            .r#type(DispatchMouseEventType::MouseReleased)
            .build()
            .map_err(|e| anyhow!(e))?;
        self.page
            .move_mouse(Point { x: x as f64, y: y as f64 })
            .await?
            .execute(press)
            .await?;
        self.page.execute(release).await?;
        Ok(())
    }

    pub async fn click(&self, target: &Locator) -> Result<()> {
        match target {
            Locator::Coordinates { x, y } => self.click_at(*x as i64, *y as i64).await,
            Locator::Css { selector } => {
                self.page.find_element(selector.as_str()).await?.click().await?;
                Ok(())
            }
            Locator::XPath { expr } => {
                self.page.find_xpath(expr.as_str()).await?.click().await?;
                Ok(())
            }
            Locator::Text { pattern } => {
                self.page.find_xpath(text_xpath(pattern)).await?.click().await?;
                Ok(())
            }
        }
    }

    pub async fn hover(&self, target: &Locator) -> Result<()> {
        match target {
            Locator::Coordinates { x, y } => self.move_mouse(*x as i64, *y as i64).await,
            Locator::Css { selector } => {
                self.page.find_element(selector.as_str()).await?.hover().await?;
                Ok(())
            }
            Locator::XPath { expr } => {
                self.page.find_xpath(expr.as_str()).await?.hover().await?;
                Ok(())
            }
            Locator::Text { pattern } => {
                self.page.find_xpath(text_xpath(pattern)).await?.hover().await?;
                Ok(())
            }
        }
    }

    pub async fn scroll(&self, dx: i64, dy: i64) -> Result<()> {
        self.page.evaluate(format!("window.scrollBy({dx}, {dy});")).await?;
        Ok(())
    }

    /// Inserts text into the focused element, focusing `into` first when given.
    pub async fn type_text(&self, text: &str, into: Option<&Locator>) -> Result<()> {
        if let Some(target) = into {
            self.click(target).await?;
        }
        self.page
            .execute(InsertTextParams { text: text.to_string() })
            .await?;
        Ok(())
    }

    pub async fn keypress(&self, key: &str) -> Result<()> {
        let k = serde_json::to_string(key)?;
        let js = format!(
            r#"
            (function() {{
              const el = document.activeElement || document.body;
              const opts = {{key: {k}, code: {k}, bubbles: true}};
              el.dispatchEvent(new KeyboardEvent("keydown", opts));
              el.dispatchEvent(new KeyboardEvent("keyup", opts));
            }})()
        "#
        );
        self.page.evaluate(js).await?;
        Ok(())
    }

    pub async fn screenshot_png(&self) -> Result<Vec<u8>> {
        let take = || async {
            self.page
                .screenshot(ScreenshotParamsBuilder::default().full_page(true).build())
                .await
        };
        match take().await {
            Ok(bytes) => Ok(bytes),
            Err(e) => {
                let msg = e.to_string();
                if msg.contains("0 width") || msg.contains("0 height") {
                    self.page.execute(viewport()?).await?;
                    sleep(Duration::from_millis(50)).await;
                    return Ok(take().await?);
                }
                Err(anyhow!(e))
            }
        }
    }

    /// Waits for the document to finish loading, then for a quiet period.
    pub async fn wait_for_stable(&self, cfg: &BrowserConfig) -> Result<()> {
        let deadline = tokio::time::Instant::now() + cfg.ready_timeout;
        while tokio::time::Instant::now() < deadline {
            let state: String = self.page.evaluate(READY_PROBE).await?.into_value()?;
            if state == "complete" {
                break;
            }
            sleep(Duration::from_millis(100)).await;
        }
        sleep(cfg.settle).await;
        Ok(())
    }
}

fn text_xpath(pattern: &str) -> String {
    let literal = if pattern.contains('\'') {
        format!("\"{pattern}\"")
    } else {
        format!("'{pattern}'")
    };
    format!("//*[contains(normalize-space(text()), {literal})]")
}

// ========================= Page & Computer adapters =========================

/// A settled chromium tab.
#[derive(Clone)]
pub struct ChromiumPage {
    page: Page,
}

fn computer_err(e: impl std::fmt::Display) -> AgentError {
    AgentError::Computer(e.to_string())
}

#[async_trait]
impl PageHandle for ChromiumPage {
    async fn url(&self) -> Result<String, AgentError> {
        Ok(self.page.url().await.map_err(computer_err)?.unwrap_or_default())
    }

    async fn title(&self) -> Result<String, AgentError> {
        Ok(self.page.get_title().await.map_err(computer_err)?.unwrap_or_default())
    }

    async fn text_excerpt(&self) -> Result<String, AgentError> {
        self.page
            .evaluate(TEXT_PROBE)
            .await
            .map_err(computer_err)?
            .into_value::<String>()
            .map_err(computer_err)
    }

    async fn has_credential_input(&self) -> Result<bool, AgentError> {
        self.page
            .evaluate(CREDENTIAL_PROBE)
            .await
            .map_err(computer_err)?
            .into_value::<bool>()
            .map_err(computer_err)
    }

    async fn screenshot_png(&self) -> Result<Vec<u8>, AgentError> {
        self.page
            .screenshot(ScreenshotParamsBuilder::default().full_page(true).build())
            .await
            .map_err(computer_err)
    }
}

pub struct ChromiumComputer {
    browser: Browser,
    cfg: BrowserConfig,
}

impl ChromiumComputer {
    pub async fn launch(cfg: BrowserConfig) -> Result<Self, AgentError> {
        let browser = Browser::launch(&cfg).await.map_err(computer_err)?;
        Ok(Self { browser, cfg })
    }

    pub async fn connect(ws_url: &str, cfg: BrowserConfig) -> Result<Self, AgentError> {
        let browser = Browser::connect(ws_url, &cfg).await.map_err(computer_err)?;
        Ok(Self { browser, cfg })
    }

    async fn settled(&self) -> Result<ChromiumPage, AgentError> {
        self.browser.wait_for_stable(&self.cfg).await.map_err(computer_err)?;
        Ok(ChromiumPage { page: self.browser.page().clone() })
    }
}

#[async_trait]
impl Computer for ChromiumComputer {
    type Page = ChromiumPage;

    async fn open_url(&self, url: &str) -> Result<ChromiumPage, AgentError> {
        self.browser.goto(url).await.map_err(computer_err)?;
        self.settled().await
    }

    async fn current_page(&self) -> Result<ChromiumPage, AgentError> {
        self.settled().await
    }

    async fn execute(&self, action: &Action) -> Result<ChromiumPage, AgentError> {
        debug!(action = %action.describe(), "chromium execute");
        let done = match action {
            Action::Click { target } => self.browser.click(target).await,
            Action::Hover { target } => self.browser.hover(target).await,
            Action::Type { text, into } => self.browser.type_text(text, into.as_ref()).await,
            Action::Key { combo } => self.browser.keypress(combo).await,
            Action::Scroll { dx, dy } => self.browser.scroll(*dx as i64, *dy as i64).await,
            Action::Navigate { url } => self.browser.goto(url).await,
            Action::Wait { ms } => {
                sleep(Duration::from_millis(*ms)).await;
                Ok(())
            }
        };
        done.map_err(computer_err)?;
        self.settled().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_xpath_quotes_patterns() {
        assert_eq!(text_xpath("New issue"), "//*[contains(normalize-space(text()), 'New issue')]");
        assert_eq!(text_xpath("Don't save"), "//*[contains(normalize-space(text()), \"Don't save\")]");
    }
}
