//! Upstream service endpoints.

use threadwatch_fetch::{ChallengeEndpoints, Url};

pub const DEFAULT_DOMAIN: &str = "https://f95zone.to";
pub const DEFAULT_UPDATE_ENDPOINT: &str =
    "https://api.github.com/repos/Willy-JL/F95Checker/releases/latest";

/// Every URL the tracker talks to, derived from one domain.
#[derive(Debug, Clone)]
pub struct Site {
    pub domain: Url,
    /// Host name of `domain`, used to tell foreign image hosts apart.
    pub host: String,
    /// Canonical thread prefix, e.g. `https://f95zone.to/threads/`.
    pub threads_page: String,
    pub check_login_page: String,
    pub login_page: String,
    pub notif_endpoint: String,
    pub update_endpoint: String,
    pub challenge: ChallengeEndpoints,
}

impl Site {
    pub fn new(domain: &str) -> Result<Self, url::ParseError> {
        let domain = Url::parse(domain)?;
        let host = domain
            .host_str()
            .ok_or(url::ParseError::EmptyHost)?
            .to_owned();
        let base = domain.as_str().trim_end_matches('/').to_owned();
        Ok(Self {
            threads_page: format!("{base}/threads/"),
            check_login_page: format!("{base}/account/security"),
            login_page: format!("{base}/login/"),
            notif_endpoint: format!("{base}/conversations/popup"),
            update_endpoint: DEFAULT_UPDATE_ENDPOINT.to_owned(),
            challenge: ChallengeEndpoints::default(),
            domain,
            host,
        })
    }

    /// `true` when `url` is served by this site or one of its subdomains.
    pub fn owns(&self, url: &str) -> bool {
        Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_owned))
            .is_some_and(|host| host == self.host || host.ends_with(&format!(".{}", self.host)))
    }
}

impl Default for Site {
    fn default() -> Self {
        Self::new(DEFAULT_DOMAIN).expect("default domain is a valid URL")
    }
}
