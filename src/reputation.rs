use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub const DEFAULT_FEED_URL: &str = "https://raw.githubusercontent.com/borestad/blocklist-abuseipdb/main/abuseipdb-s100-30d.ipv4";
pub const PATH_ENV: &str = "ALB_REPORTER_REPUTATION_PATH";

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("download failed: {0}")]
    Http(String),
}

/// Client addresses flagged by an external blocklist. Immutable once loaded.
#[derive(Clone, Debug, Default)]
pub struct ReputationSet {
    addrs: HashSet<String>,
    pub updated: Option<DateTime<Utc>>,
    pub source: String,
}

fn canonical(addr: &str) -> String {
    addr.parse::<IpAddr>().map(|ip| ip.to_string()).unwrap_or_else(|_| addr.to_string())
}

impl ReputationSet {
    pub fn empty() -> Self { Self::default() }

    /// One address per line; `#` starts a comment and anything after the first
    /// whitespace-separated token is ignored.
    pub fn from_lines(text: &str, source: impl Into<String>, updated: Option<DateTime<Utc>>) -> Self {
        let addrs = text.lines()
            .filter_map(|l| l.split('#').next())
            .filter_map(|l| l.split_whitespace().next())
            .map(canonical)
            .collect();
        Self { addrs, updated, source: source.into() }
    }

    pub fn load_file(path: &Path) -> Result<Self, FeedError> {
        let text = std::fs::read_to_string(path)?;
        let updated = std::fs::metadata(path).and_then(|m| m.modified()).ok().map(DateTime::<Utc>::from);
        Ok(Self::from_lines(&text, path.to_string_lossy(), updated))
    }

    pub fn fetch(url: &str, timeout: Duration) -> Result<Self, FeedError> {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        let resp = agent.get(url).call().map_err(|e| FeedError::Http(e.to_string()))?;
        let text = resp.into_string()?;
        Ok(Self::from_lines(&text, url, Some(Utc::now())))
    }

    pub fn contains(&self, addr: &str) -> bool {
        self.addrs.contains(addr) || self.addrs.contains(&canonical(addr))
    }

    pub fn len(&self) -> usize { self.addrs.len() }
    pub fn is_empty(&self) -> bool { self.addrs.is_empty() }
}

/// Resolves the feed from an explicit path, then `ALB_REPORTER_REPUTATION_PATH`,
/// then the URL. Any failure degrades to an empty set.
pub fn load(path_opt: Option<&str>, url: &str, timeout: Duration) -> ReputationSet {
    let path = path_opt.map(|s| s.to_string()).or_else(|| std::env::var(PATH_ENV).ok());
    let res = match path.as_ref() {
        Some(p) => ReputationSet::load_file(Path::new(p)),
        None => ReputationSet::fetch(url, timeout),
    };
    match res {
        Ok(set) => {
            log::info!("Loaded {} flagged addresses from {}", set.len(), set.source);
            set
        }
        Err(e) => {
            log::warn!("Reputation list unavailable ({}), continuing without it: {}", path.as_deref().unwrap_or(url), e);
            ReputationSet::empty()
        }
    }
}
