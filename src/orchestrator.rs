//! Acquisition pass: scrape each category, then fetch whatever demos are new.

use crate::browser::Browser;
use crate::cache::DownloadCache;
use crate::history::MatchHistoryScraper;
use crate::session::{IdentityProvider, Session, SessionStore};
use crate::transport::Transport;
use chrono::{DateTime, Utc};
use std::fmt;
use std::ops::ControlFlow;
use std::time::Duration;

/// Totals for one pass over all categories
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub evicted: usize,
    pub parsed: usize,
    pub skipped_recent: usize,
    pub parse_failed: usize,
    pub downloaded: usize,
    pub cached: usize,
    pub download_failed: usize,
    pub failed_categories: Vec<String>,
}

impl RunSummary {
    pub fn is_clean(&self) -> bool {
        self.parse_failed == 0 && self.download_failed == 0 && self.failed_categories.is_empty()
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "matches: {} parsed, {} too recent, {} failed | demos: {} downloaded, {} cached, {} failed, {} expired",
            self.parsed,
            self.skipped_recent,
            self.parse_failed,
            self.downloaded,
            self.cached,
            self.download_failed,
            self.evicted
        )?;
        if !self.failed_categories.is_empty() {
            write!(f, " | failed categories: {}", self.failed_categories.join(", "))?;
        }
        Ok(())
    }
}

pub struct Acquisition<B, P, T> {
    scraper: MatchHistoryScraper<B>,
    sessions: SessionStore<P>,
    cache: DownloadCache<T>,
}

impl<B: Browser, P: IdentityProvider, T: Transport> Acquisition<B, P, T> {
    pub fn new(
        scraper: MatchHistoryScraper<B>,
        sessions: SessionStore<P>,
        cache: DownloadCache<T>,
    ) -> Self {
        Self {
            scraper,
            sessions,
            cache,
        }
    }

    #[cfg(test)]
    pub fn sessions(&self) -> &SessionStore<P> {
        &self.sessions
    }

    #[cfg(test)]
    pub fn cache(&self) -> &DownloadCache<T> {
        &self.cache
    }

    /// One pass over `categories`. A failed category is logged and skipped.
    pub fn run(&mut self, categories: &[String], session: &mut Session) -> RunSummary {
        self.run_at(categories, session, Utc::now())
    }

    pub fn run_at(
        &mut self,
        categories: &[String],
        session: &mut Session,
        now: DateTime<Utc>,
    ) -> RunSummary {
        let mut summary = RunSummary {
            evicted: self.cache.prepare_session_at(now),
            ..RunSummary::default()
        };

        for tab in categories {
            let report = match self.scraper.scrape_at(tab, session, &self.sessions, now) {
                Ok(report) => report,
                Err(err) => {
                    tracing::error!(tab = %tab, kind = err.kind(), error = %err, "category failed");
                    summary.failed_categories.push(tab.clone());
                    continue;
                }
            };
            tracing::info!(
                tab = %report.tab,
                parsed = report.parsed(),
                too_recent = report.skipped_recent,
                failed = report.failed,
                "category scraped"
            );
            summary.parsed += report.parsed();
            summary.skipped_recent += report.skipped_recent;
            summary.parse_failed += report.failed;

            let urls = report.demo_urls();
            if urls.is_empty() {
                tracing::info!(tab = %tab, "no downloadable demos");
                continue;
            }

            let fetched = self.cache.fetch_all(&urls, tab, session);
            summary.downloaded += fetched.downloaded;
            summary.cached += fetched.cached;
            summary.download_failed += fetched.failed;
        }
        self.scraper.release_browser();

        tracing::info!(
            parsed = summary.parsed,
            downloaded = summary.downloaded,
            cached = summary.cached,
            failed_categories = summary.failed_categories.len(),
            "acquisition pass complete"
        );
        summary
    }

    /// Repeat [`run`](Self::run) every `interval` until `after_pass` breaks
    pub fn run_continuous<F>(
        &mut self,
        categories: &[String],
        session: &mut Session,
        interval: Duration,
        mut after_pass: F,
    ) where
        F: FnMut(&RunSummary) -> ControlFlow<()>,
    {
        loop {
            let summary = self.run(categories, session);
            if after_pass(&summary).is_break() {
                break;
            }
            tracing::info!(sleep_secs = interval.as_secs(), "waiting for next pass");
            std::thread::sleep(interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::FakeTransport;
    use crate::history::tests::{FakeBrowser, FakeState};
    use crate::history::ScraperOptions;
    use crate::matches::tests::{match_row, page, player_table};
    use crate::progress::NoProgress;
    use crate::session::tests::{test_session, FakeProvider};
    use std::collections::HashMap;
    use std::rc::Rc;
    use tempfile::TempDir;

    const A: &str = "https://replay181.valve.net/730/003690000000000000011_0001.dem.bz2";
    const B: &str = "https://replay182.valve.net/730/003690000000000000012_0002.dem.bz2";

    fn hours_ago(h: i64) -> String {
        (Utc::now() - chrono::Duration::hours(h))
            .format("%Y-%m-%d %H:%M:%S GMT")
            .to_string()
    }

    fn competitive_html() -> String {
        page(&[
            match_row("Mirage", &hours_ago(2), Some(A), Some(player_table(5, "a"))),
            match_row("Nuke", &hours_ago(6), Some(B), Some(player_table(5, "b"))),
        ])
    }

    type TestAcquisition<'a> = Acquisition<FakeBrowser, FakeProvider, &'a FakeTransport>;

    fn acquisition<'a>(
        dir: &TempDir,
        html: HashMap<String, String>,
        transport: &'a FakeTransport,
    ) -> (Rc<FakeState>, TestAcquisition<'a>) {
        let state = Rc::new(FakeState {
            valid_token: "good".to_string(),
            rows_after: Some(0),
            html,
            ..FakeState::default()
        });
        let browser = FakeBrowser {
            state: Rc::clone(&state),
        };
        let acq = Acquisition::new(
            MatchHistoryScraper::new(browser, ScraperOptions::default()),
            SessionStore::new(dir.path().join("sessions"), FakeProvider::new()),
            DownloadCache::new(
                dir.path().join("demos"),
                dir.path().join("demos").join("cache.json"),
                transport,
                Box::new(NoProgress),
            ),
        );
        (state, acq)
    }

    #[test]
    fn test_end_to_end_then_idempotent() {
        let dir = TempDir::new().unwrap();
        let transport = FakeTransport::serving(&[A, B]);
        let (state, mut acq) = acquisition(
            &dir,
            HashMap::from([("competitive".to_string(), competitive_html())]),
            &transport,
        );

        acq.sessions().save(&test_session("alice", "good")).unwrap();
        let mut session = acq.sessions().load_or_create("alice", false).unwrap();
        assert_eq!(acq.sessions().provider().logins.get(), 0);

        let categories = vec!["competitive".to_string()];
        let first = acq.run(&categories, &mut session);
        assert_eq!(first.parsed, 2);
        assert_eq!(first.downloaded, 2);
        assert_eq!(first.cached, 0);
        assert!(first.is_clean());
        assert_eq!(state.releases.get(), 1);

        let store = acq.cache().store();
        assert_eq!(store.len(), 2);
        let today = Utc::now().date_naive();
        for url in [A, B] {
            let entry = store.get(url).unwrap();
            assert!(entry.filename.starts_with("competitive/"));
            assert_eq!(entry.download_date.date_naive(), today);
            assert!(dir.path().join("demos").join(&entry.filename).is_file());
        }

        let second = acq.run(&categories, &mut session);
        assert_eq!(second.downloaded, 0);
        assert_eq!(second.cached, 2);
        assert_eq!(transport.requests.borrow().len(), 2);
    }

    #[test]
    fn test_failed_category_is_skipped() {
        let dir = TempDir::new().unwrap();
        let transport = FakeTransport::serving(&[A, B]);
        // No markup for premier, so its extraction fails
        let (_state, mut acq) = acquisition(
            &dir,
            HashMap::from([("competitive".to_string(), competitive_html())]),
            &transport,
        );
        let mut session = test_session("alice", "good");

        let summary = acq.run(&["premier".to_string(), "competitive".to_string()], &mut session);
        assert_eq!(summary.failed_categories, vec!["premier".to_string()]);
        assert_eq!(summary.downloaded, 2);
        assert!(!summary.is_clean());
        assert!(summary.to_string().contains("failed categories: premier"));
    }

    #[test]
    fn test_continuous_stops_when_told() {
        let dir = TempDir::new().unwrap();
        let transport = FakeTransport::serving(&[A, B]);
        let (_state, mut acq) = acquisition(
            &dir,
            HashMap::from([("competitive".to_string(), competitive_html())]),
            &transport,
        );
        let mut session = test_session("alice", "good");

        let mut passes = Vec::new();
        acq.run_continuous(&["competitive".to_string()], &mut session, Duration::ZERO, |s| {
            passes.push(s.clone());
            if passes.len() == 2 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });

        assert_eq!(passes.len(), 2);
        assert_eq!(passes[0].downloaded, 2);
        assert_eq!(passes[1].downloaded, 0);
        assert_eq!(passes[1].cached, 2);
    }

    #[test]
    fn test_continuous_survives_browser_dying_between_passes() {
        let dir = TempDir::new().unwrap();
        let transport = FakeTransport::serving(&[A, B]);
        let (state, mut acq) = acquisition(
            &dir,
            HashMap::from([("competitive".to_string(), competitive_html())]),
            &transport,
        );
        let mut session = test_session("alice", "good");

        let mut passes = Vec::new();
        acq.run_continuous(&["competitive".to_string()], &mut session, Duration::ZERO, |s| {
            passes.push(s.clone());
            // The driver connection times out while idling between passes
            state.dead.set(true);
            if passes.len() == 2 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });

        assert_eq!(passes.len(), 2);
        assert!(passes[1].failed_categories.is_empty());
        assert_eq!(passes[1].parsed, 2);
        assert_eq!(passes[1].cached, 2);
        // End of pass one, relaunch in pass two, end of pass two
        assert_eq!(state.releases.get(), 3);
        assert_eq!(state.opened.get(), 2);
    }

    #[test]
    fn test_summary_display() {
        let summary = RunSummary {
            parsed: 3,
            skipped_recent: 1,
            downloaded: 2,
            cached: 1,
            ..RunSummary::default()
        };
        assert_eq!(
            summary.to_string(),
            "matches: 3 parsed, 1 too recent, 0 failed | demos: 2 downloaded, 1 cached, 0 failed, 0 expired"
        );
    }
}
