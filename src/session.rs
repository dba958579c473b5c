//! Authenticated session lifecycle: load a persisted session per account, or
//! run an interactive login and persist the result.
//!
//! Session documents hold bearer-equivalent tokens, so they are written with
//! owner-only permissions.

use crate::error::AcquireError;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0 Safari/537.36";

/// A single HTTP cookie belonging to a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    #[serde(default = "default_cookie_path")]
    pub path: String,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub http_only: bool,
}

fn default_cookie_path() -> String {
    "/".to_string()
}

impl SessionCookie {
    /// Whether this cookie should be sent to `host` (domain or any subdomain)
    pub fn matches_host(&self, host: &str) -> bool {
        let domain = self.domain.trim_start_matches('.');
        if domain.is_empty() {
            return false;
        }
        host.eq_ignore_ascii_case(domain)
            || host
                .to_ascii_lowercase()
                .ends_with(&format!(".{}", domain.to_ascii_lowercase()))
    }
}

/// Identity tokens returned by the identity provider
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub steam_id: String,
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub request_id: String,
}

/// An authenticated identity able to reach the personal match-history page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub account: String,
    pub cookies: Vec<SessionCookie>,
    pub identity: Identity,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    pub created_at: DateTime<Utc>,
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

impl Session {
    /// Build a `Cookie` header value for a request to `url`, if any cookie applies
    pub fn cookie_header(&self, url: &str) -> Option<String> {
        let parsed = url::Url::parse(url).ok()?;
        let host = parsed.host_str()?;
        let secure = parsed.scheme() == "https";

        let pairs: Vec<String> = self
            .cookies
            .iter()
            .filter(|c| c.matches_host(host))
            .filter(|c| secure || !c.secure)
            .filter(|c| parsed.path().starts_with(c.path.as_str()))
            .map(|c| format!("{}={}", c.name, c.value))
            .collect();

        if pairs.is_empty() {
            None
        } else {
            Some(pairs.join("; "))
        }
    }
}

/// Performs an interactive login for an account.
///
/// Implementations never replay stored credentials; persisted sessions are
/// handled by [`SessionStore`].
pub trait IdentityProvider {
    fn login(&self, account: &str) -> Result<Session, AcquireError>;
}

/// Persists sessions per account under a single directory
pub struct SessionStore<P> {
    dir: PathBuf,
    provider: P,
}

impl<P: IdentityProvider> SessionStore<P> {
    pub fn new(dir: impl Into<PathBuf>, provider: P) -> Self {
        Self {
            dir: dir.into(),
            provider,
        }
    }

    #[cfg(test)]
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Path of the persisted session document for `account`
    pub fn path_for(&self, account: &str) -> PathBuf {
        self.dir
            .join(format!("{}.session.json", sanitize_account(account)))
    }

    /// Return the persisted session for `account`, or log in and persist a new one.
    ///
    /// With `force`, any persisted session is ignored and replaced. A failed
    /// write is logged and the in-memory session is still returned.
    pub fn load_or_create(&self, account: &str, force: bool) -> Result<Session, AcquireError> {
        if account.trim().is_empty() {
            return Err(AcquireError::auth(account, "empty account identifier"));
        }

        if !force {
            if let Some(session) = self.load(account) {
                tracing::info!(account, path = %self.path_for(account).display(), "loaded persisted session");
                return Ok(session);
            }
        }

        tracing::info!(account, force, "interactive login required");
        let session = self.provider.login(account)?;

        match self.save(&session) {
            Ok(()) => {
                tracing::warn!(
                    account,
                    path = %self.path_for(account).display(),
                    "session stored on disk; treat this file as a secret"
                );
            }
            Err(err) => {
                tracing::error!(account, error = %err, "session not persisted, continuing in memory");
            }
        }

        Ok(session)
    }

    /// Load a persisted session. Unreadable or malformed documents count as absent.
    pub fn load(&self, account: &str) -> Option<Session> {
        let path = self.path_for(account);
        if !path.exists() {
            return None;
        }

        match read_session(&path) {
            Ok(session) => Some(session),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "ignoring unreadable session file");
                None
            }
        }
    }

    /// Write `session` to durable storage with owner-only permissions
    pub fn save(&self, session: &Session) -> Result<(), AcquireError> {
        let path = self.path_for(&session.account);
        write_session(&self.dir, &path, session)
            .map_err(|e| AcquireError::persistence(&path, format!("{:#}", e)))
    }

    /// Delete the persisted session for `account`; returns whether one existed
    pub fn remove(&self, account: &str) -> Result<bool, AcquireError> {
        let path = self.path_for(account);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path).map_err(|e| AcquireError::persistence(&path, e))?;
        Ok(true)
    }
}

fn read_session(path: &Path) -> Result<Session> {
    let content = fs::read_to_string(path)?;
    let session: Session = serde_json::from_str(&content)?;
    Ok(session)
}

fn write_session(dir: &Path, path: &Path, session: &Session) -> Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        restrict_dir(dir)?;
    }

    let content = serde_json::to_string_pretty(session)?;
    let tmp = path.with_extension("json.tmp");
    let _ = fs::remove_file(&tmp);

    let mut opts = OpenOptions::new();
    opts.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    let mut file = opts
        .open(&tmp)
        .with_context(|| format!("creating {}", tmp.display()))?;
    file.write_all(content.as_bytes())?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp, path).with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}

#[cfg(unix)]
fn restrict_dir(dir: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

/// Make an account identifier safe to use as a file stem
fn sanitize_account(account: &str) -> String {
    account
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
