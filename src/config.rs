use anyhow::{bail, Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::history::{ScraperOptions, DEFAULT_HISTORY_URL};

static TAB_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9_]+$").expect("static regex"));

/// A validation error in the configuration
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]: {}", self.field, self.message)
    }
}

/// Pause between passes in continuous mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Interval {
    Hourly,
    #[default]
    Daily,
}

impl Interval {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "hourly" | "hour" | "1h" => Some(Self::Hourly),
            "daily" | "day" | "24h" => Some(Self::Daily),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hourly => "hourly",
            Self::Daily => "daily",
        }
    }

    pub fn as_duration(&self) -> Duration {
        match self {
            Self::Hourly => Duration::from_secs(60 * 60),
            Self::Daily => Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, Default)]
pub struct AccountConfig {
    /// Steam account name used to sign in
    #[serde(default)]
    pub name: String,
    /// Where session documents are kept; defaults to the user data dir
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sessions_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DownloadConfig {
    /// Match-history categories: premier, competitive, competitivepermap, scrimmage, wingman
    #[serde(default = "default_tabs")]
    pub tabs: Vec<String>,
    #[serde(default = "default_root")]
    pub root: PathBuf,
    /// Cache document, relative to `root` unless absolute
    #[serde(default = "default_cache_file")]
    pub cache_file: PathBuf,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
}

fn default_tabs() -> Vec<String> {
    vec!["premier".to_string()]
}

fn default_root() -> PathBuf {
    PathBuf::from("demos")
}

fn default_cache_file() -> PathBuf {
    PathBuf::from("cache.json")
}

fn default_read_timeout() -> u64 {
    300
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            tabs: default_tabs(),
            root: default_root(),
            cache_file: default_cache_file(),
            read_timeout_secs: default_read_timeout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, Default)]
pub struct ScheduleConfig {
    #[serde(default)]
    pub continuous: bool,
    #[serde(default)]
    pub interval: Interval,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct BrowserConfig {
    #[serde(default = "default_true")]
    pub headless: bool,
    #[serde(default = "default_history_url")]
    pub history_url: String,
    #[serde(default = "default_load_more_retries")]
    pub load_more_retries: u32,
    #[serde(default = "default_extra_pages")]
    pub extra_pages: u32,
    /// Wait after each "load more" click
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

fn default_true() -> bool {
    true
}
fn default_history_url() -> String {
    DEFAULT_HISTORY_URL.to_string()
}
fn default_load_more_retries() -> u32 {
    10
}
fn default_extra_pages() -> u32 {
    4
}
fn default_settle_ms() -> u64 {
    1500
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: default_true(),
            history_url: default_history_url(),
            load_more_retries: default_load_more_retries(),
            extra_pages: default_extra_pages(),
            settle_ms: default_settle_ms(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, Default)]
pub struct Config {
    #[serde(default)]
    pub account: AccountConfig,
    #[serde(default)]
    pub download: DownloadConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub browser: BrowserConfig,
}

const TEMPLATE: &str = r#"# cs2dl configuration

[account]
# Steam account name (can also be given with --account or CS2DL_ACCOUNT)
name = ""

[download]
# Match types to download: premier, competitive, competitivepermap, scrimmage, wingman
tabs = ["premier"]
root = "demos"
cache_file = "cache.json"
read_timeout_secs = 300

[schedule]
# Keep running and check again after each interval (hourly / daily)
continuous = false
interval = "daily"

[browser]
headless = true
load_more_retries = 10
extra_pages = 4
settle_ms = 1500
"#;

impl Config {
    /// Config files in increasing priority: user, project, local
    pub fn default_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".cs2dl").join("config.toml"));
        }
        let project = Path::new(".cs2dl");
        paths.push(project.join("config.toml"));
        paths.push(project.join("config.local.toml"));
        paths
    }

    /// Where the first-run template is written
    pub fn project_path() -> PathBuf {
        Path::new(".cs2dl").join("config.toml")
    }

    /// Load configuration from default paths
    /// Priority: local (.cs2dl/config.local.toml) > project (.cs2dl/config.toml) > user (~/.cs2dl/config.toml)
    pub fn load() -> Result<Self> {
        Self::load_layers(&Self::default_paths())
    }

    /// Merge the existing files of `paths` over the built-in defaults, later files winning
    pub fn load_layers(paths: &[PathBuf]) -> Result<Self> {
        let toml::Value::Table(mut merged) =
            toml::Value::try_from(Config::default()).context("serializing defaults")?
        else {
            bail!("defaults did not serialize to a table");
        };
        for path in paths.iter().filter(|p| p.exists()) {
            let layer = read_table(path)?;
            tracing::debug!(path = %path.display(), "merging config layer");
            merge_tables(&mut merged, layer);
        }
        let config: Config = toml::Value::Table(merged)
            .try_into()
            .context("invalid configuration")?;
        Ok(config)
    }

    /// Load configuration from a specific path, over the built-in defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    /// Whether any of the default config files exists
    pub fn exists_anywhere() -> bool {
        Self::default_paths().iter().any(|p| p.exists())
    }

    /// Write the commented template, creating parent directories
    pub fn write_template(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        std::fs::write(path, TEMPLATE).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.account.sessions_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("cs2dl")
                .join("sessions")
        })
    }

    pub fn cache_path(&self) -> PathBuf {
        if self.download.cache_file.is_absolute() {
            self.download.cache_file.clone()
        } else {
            self.download.root.join(&self.download.cache_file)
        }
    }

    pub fn scraper_options(&self) -> ScraperOptions {
        ScraperOptions {
            history_url: self.browser.history_url.clone(),
            load_more_retries: self.browser.load_more_retries,
            extra_pages: self.browser.extra_pages,
        }
    }

    /// Validate configuration and return any errors found
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if self.download.tabs.is_empty() {
            errors.push(ValidationError {
                field: "download.tabs".to_string(),
                message: "At least one match type is required".to_string(),
            });
        }
        for (i, tab) in self.download.tabs.iter().enumerate() {
            if !TAB_NAME.is_match(tab) {
                errors.push(ValidationError {
                    field: format!("download.tabs[{}]", i),
                    message: format!("Invalid match type '{}'", tab),
                });
            }
        }

        if self.download.read_timeout_secs == 0 {
            errors.push(ValidationError {
                field: "download.read_timeout_secs".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        match url::Url::parse(&self.browser.history_url) {
            Ok(u) if u.scheme() == "https" || u.scheme() == "http" => {}
            _ => errors.push(ValidationError {
                field: "browser.history_url".to_string(),
                message: format!("Invalid URL '{}'", self.browser.history_url),
            }),
        }

        if self.browser.load_more_retries == 0 {
            errors.push(ValidationError {
                field: "browser.load_more_retries".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn read_table(path: &Path) -> Result<toml::Table> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let table: toml::Table =
        toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
    Ok(table)
}

/// Tables merge key by key; any other value replaces the base value
fn merge_tables(base: &mut toml::Table, layer: toml::Table) {
    for (key, value) in layer {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_validate_valid_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.download.tabs, vec!["premier"]);
        assert_eq!(config.schedule.interval, Interval::Daily);
    }

    #[test]
    fn test_template_matches_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".cs2dl").join("config.toml");
        Config::write_template(&path).unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_layers_override_in_order() {
        let dir = TempDir::new().unwrap();
        let user = dir.path().join("user.toml");
        let project = dir.path().join("project.toml");
        let local = dir.path().join("local.toml");
        let missing = dir.path().join("missing.toml");

        std::fs::write(
            &user,
            "[account]\nname = \"alice\"\n[download]\nroot = \"/srv/demos\"\n",
        )
        .unwrap();
        std::fs::write(
            &project,
            "[download]\ntabs = [\"competitive\", \"wingman\"]\n[schedule]\ninterval = \"hourly\"\n",
        )
        .unwrap();
        std::fs::write(&local, "[account]\nname = \"bob\"\n").unwrap();

        let config = Config::load_layers(&[user, missing, project, local]).unwrap();
        assert_eq!(config.account.name, "bob");
        // Keys untouched by later layers survive
        assert_eq!(config.download.root, PathBuf::from("/srv/demos"));
        assert_eq!(config.download.tabs, vec!["competitive", "wingman"]);
        assert_eq!(config.download.read_timeout_secs, 300);
        assert_eq!(config.schedule.interval, Interval::Hourly);
        assert!(config.browser.headless);
    }

    #[test]
    fn test_invalid_layer_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[schedule]\ninterval = \"weekly\"\n").unwrap();
        assert!(Config::load_layers(&[path]).is_err());
    }

    #[test]
    fn test_validate_collects_errors() {
        let mut config = Config::default();
        config.download.tabs = vec!["premier".to_string(), "../etc".to_string()];
        config.download.read_timeout_secs = 0;
        config.browser.history_url = "not a url".to_string();

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors[0].field.contains("download.tabs[1]"));
        assert!(errors[1].message.contains("greater than 0"));
        assert!(errors[2].field.contains("history_url"));
    }

    #[test]
    fn test_validate_no_tabs() {
        let mut config = Config::default();
        config.download.tabs.clear();
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("At least one"));
    }

    #[test]
    fn test_interval_parsing() {
        assert_eq!(Interval::from_str("Hourly"), Some(Interval::Hourly));
        assert_eq!(Interval::from_str("daily"), Some(Interval::Daily));
        assert_eq!(Interval::from_str("weekly"), None);
        assert_eq!(Interval::Hourly.as_duration(), Duration::from_secs(3600));
    }

    #[test]
    fn test_derived_paths() {
        let mut config = Config::default();
        assert_eq!(config.cache_path(), PathBuf::from("demos").join("cache.json"));

        config.account.sessions_dir = Some(PathBuf::from("/tmp/sessions"));
        assert_eq!(config.sessions_dir(), PathBuf::from("/tmp/sessions"));

        let options = config.scraper_options();
        assert_eq!(options.load_more_retries, 10);
        assert_eq!(options.extra_pages, 4);
    }
}
