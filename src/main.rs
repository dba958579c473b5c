mod browser;
mod cache;
mod config;
mod error;
mod history;
mod matches;
mod orchestrator;
mod progress;
mod session;
mod steam_auth;
mod transport;

use anyhow::{anyhow, bail, Result};
use clap::Parser;
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use crate::browser::ChromeBrowser;
use crate::cache::DownloadCache;
use crate::config::{Config, Interval};
use crate::history::MatchHistoryScraper;
use crate::orchestrator::Acquisition;
use crate::session::{SessionStore, DEFAULT_USER_AGENT};
use crate::steam_auth::{SteamLogin, TerminalPrompt};
use crate::transport::HttpTransport;

#[derive(Parser)]
#[command(name = "cs2dl", about = "Download CS2 match demos from your Steam match history")]
pub struct Args {
    #[arg(long, env = "CS2DL_CONFIG", help = "Config file path (skips the layered lookup)")]
    pub config: Option<PathBuf>,

    #[arg(long, env = "CS2DL_ACCOUNT", help = "Steam account name")]
    pub account: Option<String>,

    #[arg(long = "tab", value_name = "TAB", action = clap::ArgAction::Append, help = "Match type to download (replaces configured tabs)")]
    pub tabs: Vec<String>,

    #[arg(long, help = "Keep running and check again after each interval")]
    pub continuous: bool,

    #[arg(long, value_name = "INTERVAL", help = "Interval for continuous mode: hourly, daily")]
    pub interval: Option<String>,

    #[arg(long, help = "Ignore the stored session and sign in again")]
    pub force_login: bool,

    #[arg(long, help = "Delete the stored session for the account and exit")]
    pub logout: bool,

    #[arg(long, help = "Show the browser window")]
    pub headed: bool,

    #[arg(short, long, help = "Debug logging")]
    pub verbose: bool,
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

fn load_config(args: &Args) -> Result<Config> {
    if let Some(path) = &args.config {
        return Config::load_from(path);
    }

    if !Config::exists_anywhere() {
        let path = Config::project_path();
        match Config::write_template(&path) {
            Ok(()) => println!(
                "Wrote a config template to {}. Edit it to choose which match types to download.",
                path.display()
            ),
            Err(err) => tracing::warn!(error = %format!("{:#}", err), "could not write config template"),
        }
    }
    Config::load()
}

/// --account / CS2DL_ACCOUNT, then the config file, then an interactive prompt
fn resolve_account(args: &Args, cfg: &Config) -> Result<String> {
    if let Some(account) = args.account.as_deref().map(str::trim).filter(|a| !a.is_empty()) {
        return Ok(account.to_string());
    }
    if !cfg.account.name.trim().is_empty() {
        return Ok(cfg.account.name.trim().to_string());
    }
    let account = steam_auth::read_line("Steam account name: ")?;
    if account.is_empty() {
        bail!("No Steam account given. Use --account, CS2DL_ACCOUNT or [account].name in the config.");
    }
    Ok(account)
}

fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    init_logging(args.verbose);

    let mut cfg = load_config(&args)?;

    // CLI overrides
    if !args.tabs.is_empty() {
        cfg.download.tabs = args.tabs.clone();
    }
    if args.continuous {
        cfg.schedule.continuous = true;
    }
    if let Some(interval) = &args.interval {
        cfg.schedule.interval = Interval::from_str(interval)
            .ok_or_else(|| anyhow!("Invalid interval: {}. Use: hourly, daily", interval))?;
    }
    if args.headed {
        cfg.browser.headless = false;
    }

    if let Err(errors) = cfg.validate() {
        for err in &errors {
            eprintln!("config error {}", err);
        }
        bail!("invalid configuration ({} errors)", errors.len());
    }

    let account = resolve_account(&args, &cfg)?;
    let sessions = SessionStore::new(
        cfg.sessions_dir(),
        SteamLogin::new(Box::new(TerminalPrompt), DEFAULT_USER_AGENT),
    );

    if args.logout {
        if sessions.remove(&account)? {
            println!("Removed stored session for {}", account);
        } else {
            println!("No stored session for {}", account);
        }
        return Ok(ExitCode::SUCCESS);
    }

    println!("[CS2 DEMO DOWNLOADER]");
    println!("------------------------------------");
    let mut session = sessions.load_or_create(&account, args.force_login)?;

    let browser = ChromeBrowser::new(
        cfg.browser.headless,
        Duration::from_millis(cfg.browser.settle_ms),
    );
    let scraper = MatchHistoryScraper::new(browser, cfg.scraper_options());
    let cache = DownloadCache::new(
        cfg.download.root.clone(),
        cfg.cache_path(),
        HttpTransport::new(Duration::from_secs(cfg.download.read_timeout_secs)),
        progress::default_reporter(),
    );
    let mut acquisition = Acquisition::new(scraper, sessions, cache);

    let tabs = cfg.download.tabs.clone();
    tracing::info!(account = %account, tabs = ?tabs, continuous = cfg.schedule.continuous, "starting");

    if cfg.schedule.continuous {
        let interval = cfg.schedule.interval;
        acquisition.run_continuous(&tabs, &mut session, interval.as_duration(), |summary| {
            println!("{}", summary);
            println!("Next check {}", interval.as_str());
            ControlFlow::Continue(())
        });
        Ok(ExitCode::SUCCESS)
    } else {
        let summary = acquisition.run(&tabs, &mut session);
        println!("{}", summary);
        // A pass with any failure exits non-zero
        if summary.is_clean() {
            Ok(ExitCode::SUCCESS)
        } else {
            Ok(ExitCode::FAILURE)
        }
    }
}
