//! Error taxonomy for the acquisition pipeline.
//!
//! Variants are contained at different scopes. Authentication, pagination and
//! browser failures lose one category; a parse failure loses one match; a
//! download failure loses one URL. A persistence failure loses only durability.

use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum AcquireError {
    #[error("authentication failed for account '{account}': {reason}")]
    Authentication { account: String, reason: String },

    #[error("match table for tab '{tab}' still empty after {attempts} load-more attempts")]
    PaginationTimeout { tab: String, attempts: u32 },

    #[error("browser failure on tab '{tab}': {reason}")]
    Browser { tab: String, reason: String },

    #[error("parse error in {context}: {reason}")]
    Parse { context: String, reason: String },

    #[error("download of {url} failed: {reason}")]
    Download { url: String, reason: String },

    #[error("could not persist {path}: {reason}")]
    Persistence { path: String, reason: String },
}

impl AcquireError {
    pub fn auth(account: &str, reason: impl ToString) -> Self {
        Self::Authentication {
            account: account.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn browser(tab: &str, err: anyhow::Error) -> Self {
        Self::Browser {
            tab: tab.to_string(),
            reason: format!("{:#}", err),
        }
    }

    pub fn parse(context: impl Into<String>, reason: impl ToString) -> Self {
        Self::Parse {
            context: context.into(),
            reason: reason.to_string(),
        }
    }

    pub fn download(url: &str, reason: impl ToString) -> Self {
        Self::Download {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn persistence(path: &Path, reason: impl ToString) -> Self {
        Self::Persistence {
            path: path.display().to_string(),
            reason: reason.to_string(),
        }
    }

    /// Short machine-friendly kind, used as a structured log field
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Authentication { .. } => "authentication",
            Self::PaginationTimeout { .. } => "pagination_timeout",
            Self::Browser { .. } => "browser",
            Self::Parse { .. } => "parse",
            Self::Download { .. } => "download",
            Self::Persistence { .. } => "persistence",
        }
    }
}
