//! Match-history scraping: drive an authenticated browser page through
//! pagination and hand the rendered markup to the match parser.

use crate::browser::{Browser, BrowserPage};
use crate::error::AcquireError;
use crate::matches::{parse_match_table, MatchRecord};
use crate::session::{IdentityProvider, Session, SessionStore};
use chrono::{DateTime, Utc};

/// Title fragment of the authenticated personal game data page
const PERSONAL_DATA_TITLE: &str = "Personal Game Data";
const LOAD_MORE: &str = "#load_more_clickable";
const TABLE_ROWS: &str = "table.csgo_scoreboard_root tbody tr";
const FIRST_ROW_HEADER: &str = "table.csgo_scoreboard_root tbody tr:first-child th";

pub const DEFAULT_HISTORY_URL: &str = "https://steamcommunity.com/my/gcpd/730/";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScraperOptions {
    pub history_url: String,
    /// Clicks allowed while the match table is still empty
    pub load_more_retries: u32,
    /// Further clicks once rows are present
    pub extra_pages: u32,
}

impl Default for ScraperOptions {
    fn default() -> Self {
        Self {
            history_url: DEFAULT_HISTORY_URL.to_string(),
            load_more_retries: 10,
            extra_pages: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrapeState {
    Navigating,
    AuthRetry,
    Paginating,
    Extracting,
    Parsing,
    Done,
}

impl ScrapeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Navigating => "navigating",
            Self::AuthRetry => "auth_retry",
            Self::Paginating => "paginating",
            Self::Extracting => "extracting",
            Self::Parsing => "parsing",
            Self::Done => "done",
        }
    }
}

/// Outcome of scraping one category
#[derive(Debug, Default)]
pub struct ScrapeReport {
    pub tab: String,
    pub records: Vec<MatchRecord>,
    pub skipped_recent: usize,
    pub failed: usize,
}

impl ScrapeReport {
    pub fn parsed(&self) -> usize {
        self.records.len()
    }

    /// Demo URLs of the parsed matches, in page order
    pub fn demo_urls(&self) -> Vec<String> {
        self.records
            .iter()
            .filter_map(|r| r.demo_url.clone())
            .filter(|u| !u.trim().is_empty())
            .collect()
    }
}

pub struct MatchHistoryScraper<B> {
    browser: B,
    options: ScraperOptions,
}

impl<B: Browser> MatchHistoryScraper<B> {
    pub fn new(browser: B, options: ScraperOptions) -> Self {
        Self { browser, options }
    }

    /// Page URL for a category tag such as `premier` or `competitive`
    pub fn history_url(&self, tab: &str) -> String {
        format!("{}?tab=matchhistory{}", self.options.history_url, tab)
    }

    /// Scrape one category as of `now`.
    ///
    /// `session` is replaced in place when the stored session turns out to be
    /// stale and a forced re-login succeeds.
    pub fn scrape_at<P: IdentityProvider>(
        &self,
        tab: &str,
        session: &mut Session,
        sessions: &SessionStore<P>,
        now: DateTime<Utc>,
    ) -> Result<ScrapeReport, AcquireError> {
        let url = self.history_url(tab);
        tracing::info!(tab, url = %url, "scraping match history");

        let page = self.open_authenticated(tab, &url, session, sessions)?;

        transition(tab, ScrapeState::Navigating, ScrapeState::Paginating);
        self.paginate(tab, &page)?;

        transition(tab, ScrapeState::Paginating, ScrapeState::Extracting);
        let html = self.extract(tab, &page)?;
        drop(page);

        transition(tab, ScrapeState::Extracting, ScrapeState::Parsing);
        let outcome = parse_match_table(&html, tab, now)?;

        transition(tab, ScrapeState::Parsing, ScrapeState::Done);
        Ok(ScrapeReport {
            tab: tab.to_string(),
            skipped_recent: outcome.skipped_recent,
            failed: outcome.failures.len(),
            records: outcome.records,
        })
    }

    fn open_authenticated<P: IdentityProvider>(
        &self,
        tab: &str,
        url: &str,
        session: &mut Session,
        sessions: &SessionStore<P>,
    ) -> Result<B::Page, AcquireError> {
        let page = self.navigate(tab, url, session)?;
        if self.is_authenticated(tab, &page)? {
            return Ok(page);
        }
        drop(page);

        tracing::warn!(tab, account = %session.account, "history page not authenticated, forcing re-login");
        transition(tab, ScrapeState::Navigating, ScrapeState::AuthRetry);

        *session = sessions.load_or_create(&session.account, true)?;

        let page = self.navigate(tab, url, session)?;
        if self.is_authenticated(tab, &page)? {
            transition(tab, ScrapeState::AuthRetry, ScrapeState::Navigating);
            return Ok(page);
        }
        Err(AcquireError::auth(
            &session.account,
            "personal game data page still unavailable after re-login",
        ))
    }

    /// Shut the browser down between passes
    pub fn release_browser(&self) {
        self.browser.release();
    }

    fn navigate(&self, tab: &str, url: &str, session: &Session) -> Result<B::Page, AcquireError> {
        let mut page = match self.browser.open(session) {
            Ok(page) => page,
            Err(err) => {
                tracing::warn!(
                    tab,
                    error = %format!("{:#}", err),
                    "browser unavailable, relaunching"
                );
                self.browser.release();
                self.browser
                    .open(session)
                    .map_err(|e| AcquireError::browser(tab, e))?
            }
        };
        page.goto(url).map_err(|e| {
            AcquireError::auth(&session.account, format!("page unreachable: {:#}", e))
        })?;
        Ok(page)
    }

    fn is_authenticated(&self, tab: &str, page: &B::Page) -> Result<bool, AcquireError> {
        let title = page.title().map_err(|e| AcquireError::browser(tab, e))?;
        tracing::debug!(tab, title = %title, "history page loaded");
        Ok(title.contains(PERSONAL_DATA_TITLE))
    }

    /// Click "load more" until rows show up, at most `load_more_retries` times
    fn paginate(&self, tab: &str, page: &B::Page) -> Result<(), AcquireError> {
        let mut attempts = 0;
        while table_is_empty(page).map_err(|e| AcquireError::browser(tab, e))? {
            if attempts == self.options.load_more_retries {
                return Err(AcquireError::PaginationTimeout {
                    tab: tab.to_string(),
                    attempts,
                });
            }
            attempts += 1;
            tracing::debug!(tab, attempt = attempts, "match table empty, loading more");
            // A failed click still consumes an attempt
            if let Err(err) = page.click(LOAD_MORE) {
                tracing::debug!(tab, attempt = attempts, error = %format!("{:#}", err), "load more click failed");
            }
        }
        Ok(())
    }

    fn extract(&self, tab: &str, page: &B::Page) -> Result<String, AcquireError> {
        for i in 0..self.options.extra_pages {
            if let Err(err) = page.click(LOAD_MORE) {
                tracing::debug!(tab, page = i + 1, error = %format!("{:#}", err), "no further history to load");
                break;
            }
        }
        page.content().map_err(|e| AcquireError::browser(tab, e))
    }
}

/// Empty means no rows at all, or a lone header row
fn table_is_empty<P: BrowserPage>(page: &P) -> anyhow::Result<bool> {
    match page.count(TABLE_ROWS)? {
        0 => Ok(true),
        1 => Ok(page.count(FIRST_ROW_HEADER)? > 0),
        _ => Ok(false),
    }
}

fn transition(tab: &str, from: ScrapeState, to: ScrapeState) {
    tracing::debug!(tab, from = from.as_str(), to = to.as_str(), "scraper transition");
}
