//! Browser automation seam.
//!
//! The scraper only needs to open a cookie-seeded page, navigate, read the
//! title and markup, count elements and click one. [`ChromeBrowser`] provides
//! that over the Chrome DevTools protocol.

use crate::session::Session;
use anyhow::{anyhow, Context, Result};
use headless_chrome::protocol::cdp::Network::CookieParam;
use headless_chrome::protocol::cdp::Target::DisposeBrowserContext;
use headless_chrome::{LaunchOptions, Tab};
use serde_json::json;
use std::cell::RefCell;
use std::sync::Arc;
use std::time::Duration;

/// A single loaded page
pub trait BrowserPage {
    fn goto(&mut self, url: &str) -> Result<()>;
    fn title(&self) -> Result<String>;
    fn content(&self) -> Result<String>;
    /// Number of elements matching a CSS selector
    fn count(&self, selector: &str) -> Result<usize>;
    fn click(&self, selector: &str) -> Result<()>;
}

/// Opens pages seeded with a session's cookies and user agent
pub trait Browser {
    type Page: BrowserPage;

    fn open(&self, session: &Session) -> Result<Self::Page>;

    /// Shut down the running browser, if any. The next `open` starts a new one.
    fn release(&self) {}
}

/// Local Chrome/Chromium, launched on first use
pub struct ChromeBrowser {
    headless: bool,
    /// How long a click waits for the match table to refresh
    settle: Duration,
    nav_timeout: Duration,
    click_timeout: Duration,
    running: RefCell<Option<headless_chrome::Browser>>,
}

impl ChromeBrowser {
    pub fn new(headless: bool, settle: Duration) -> Self {
        Self {
            headless,
            settle,
            nav_timeout: Duration::from_secs(60),
            click_timeout: Duration::from_secs(5),
            running: RefCell::new(None),
        }
    }

    fn instance(&self) -> Result<headless_chrome::Browser> {
        let mut running = self.running.borrow_mut();
        if let Some(browser) = running.as_ref() {
            return Ok(browser.clone());
        }
        let options = LaunchOptions::default_builder()
            .headless(self.headless)
            .idle_browser_timeout(Duration::from_secs(600))
            .build()
            .map_err(|e| anyhow!("invalid browser options: {}", e))?;
        let browser = headless_chrome::Browser::new(options).context("launching Chrome")?;
        tracing::debug!(headless = self.headless, "browser launched");
        *running = Some(browser.clone());
        Ok(browser)
    }
}

impl Browser for ChromeBrowser {
    type Page = ChromePage;

    fn open(&self, session: &Session) -> Result<ChromePage> {
        let browser = self.instance()?;
        // One incognito context per page; cookies never carry over between sessions
        let context = browser.new_context().context("creating browser context")?;
        let context_id = context.get_id().to_string();
        let tab = match context.new_tab() {
            Ok(tab) => tab,
            Err(err) => {
                dispose_context(&browser, &context_id);
                return Err(err).context("opening tab");
            }
        };
        let page = ChromePage {
            browser,
            context_id,
            tab,
            settle: self.settle,
            click_timeout: self.click_timeout,
        };

        page.tab.set_default_timeout(self.nav_timeout);
        page.tab
            .set_user_agent(&session.user_agent, None, None)
            .context("setting user agent")?;

        let cookies = session
            .cookies
            .iter()
            .map(|c| {
                serde_json::from_value::<CookieParam>(json!({
                    "name": c.name,
                    "value": c.value,
                    "domain": c.domain,
                    "path": c.path,
                    "secure": c.secure,
                    "httpOnly": c.http_only,
                    "sameSite": "Lax",
                }))
            })
            .collect::<Result<Vec<_>, _>>()
            .context("building cookie params")?;
        page.tab
            .set_cookies(cookies)
            .context("injecting session cookies")?;
        tracing::debug!(count = session.cookies.len(), "cookies injected");

        Ok(page)
    }

    fn release(&self) {
        if self.running.borrow_mut().take().is_some() {
            tracing::debug!("browser shut down");
        }
    }
}

fn dispose_context(browser: &headless_chrome::Browser, context_id: &str) {
    let dispose = DisposeBrowserContext {
        browser_context_id: context_id.to_string(),
    };
    if let Err(err) = browser.call_method(dispose) {
        tracing::debug!(context = context_id, error = %err, "browser context not disposed");
    }
}

pub struct ChromePage {
    browser: headless_chrome::Browser,
    context_id: String,
    tab: Arc<Tab>,
    settle: Duration,
    click_timeout: Duration,
}

impl BrowserPage for ChromePage {
    fn goto(&mut self, url: &str) -> Result<()> {
        self.tab
            .navigate_to(url)
            .with_context(|| format!("navigating to {}", url))?
            .wait_until_navigated()
            .with_context(|| format!("waiting for {}", url))?;
        Ok(())
    }

    fn title(&self) -> Result<String> {
        self.tab.get_title().context("reading page title")
    }

    fn content(&self) -> Result<String> {
        self.tab.get_content().context("reading page markup")
    }

    fn count(&self, selector: &str) -> Result<usize> {
        let expr = format!(
            "document.querySelectorAll({}).length",
            serde_json::to_string(selector)?
        );
        let result = self
            .tab
            .evaluate(&expr, false)
            .with_context(|| format!("counting '{}'", selector))?;
        Ok(result.value.and_then(|v| v.as_u64()).unwrap_or(0) as usize)
    }

    fn click(&self, selector: &str) -> Result<()> {
        self.tab
            .wait_for_element_with_custom_timeout(selector, self.click_timeout)
            .with_context(|| format!("locating '{}'", selector))?
            .click()
            .with_context(|| format!("clicking '{}'", selector))?;
        std::thread::sleep(self.settle);
        Ok(())
    }
}

impl Drop for ChromePage {
    fn drop(&mut self) {
        let _ = self.tab.close(false);
        dispose_context(&self.browser, &self.context_id);
    }
}
