use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use reqwest::header::{HeaderMap, SET_COOKIE};

/// Cookie name → value.
pub type CookieMap = BTreeMap<String, String>;

#[derive(Debug, Default)]
struct SessionState {
    /// Authenticated cookies obtained from a login.
    base: CookieMap,
    /// Cookies harvested while getting past the anti-bot challenge.
    challenge: CookieMap,
    /// Per-session anti-forgery token scraped by the session guard.
    token: Option<String>,
}

/// Process-wide session state shared by every request.
///
/// Cloning is cheap; all clones observe the same cookies and token. Writers
/// only ever merge into the jar so cookies harvested by one in-flight request
/// are never lost to a sibling.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    inner: Arc<RwLock<SessionState>>,
}

impl SessionContext {
    /// Create a context seeded with authenticated `base` cookies.
    pub fn new(base: CookieMap) -> Self {
        Self {
            inner: Arc::new(RwLock::new(SessionState {
                base,
                ..SessionState::default()
            })),
        }
    }

    fn read<T>(&self, f: impl FnOnce(&SessionState) -> T) -> T {
        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    fn write<T>(&self, f: impl FnOnce(&mut SessionState) -> T) -> T {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Install the cookie set from a fresh login.
    ///
    /// A new login invalidates both the old authenticated cookies and the
    /// token; challenge cookies belong to the client, not the account, and
    /// are kept.
    pub fn replace_base(&self, cookies: CookieMap) {
        self.write(|state| {
            state.base = cookies;
            state.token = None;
        });
    }

    /// Merge cookies harvested along the challenge chain. Last writer wins.
    pub fn merge_challenge<I>(&self, cookies: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.write(|state| state.challenge.extend(cookies));
    }

    /// Authenticated cookies only.
    pub fn base_cookies(&self) -> CookieMap {
        self.read(|state| state.base.clone())
    }

    /// The cookies a request should carry.
    ///
    /// Challenge cookies are laid down first; a base cookie with the same
    /// name wins unless its value is empty.
    pub fn effective_cookies(&self) -> CookieMap {
        self.read(|state| {
            let mut merged = state.challenge.clone();
            for (name, value) in &state.base {
                if !value.is_empty() || !merged.contains_key(name) {
                    merged.insert(name.clone(), value.clone());
                }
            }
            merged
        })
    }

    /// Render a `Cookie` header value, with per-call `overrides` on top.
    pub fn cookie_header(&self, overrides: &CookieMap) -> Option<String> {
        let mut cookies = self.effective_cookies();
        cookies.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        if cookies.is_empty() {
            return None;
        }
        Some(
            cookies
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    pub fn token(&self) -> Option<String> {
        self.read(|state| state.token.clone())
    }

    pub fn set_token(&self, token: Option<String>) {
        self.write(|state| state.token = token);
    }
}

/// Parse a single `Set-Cookie` header value into `(name, value)`.
pub fn parse_set_cookie(raw: &str) -> Option<(String, String)> {
    let pair = raw.split(';').next()?;
    let (name, value) = pair.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name.to_owned(), value.trim().trim_matches('"').to_owned()))
}

/// Every cookie set by a response, in header order.
pub fn set_cookies(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(parse_set_cookie)
        .collect()
}
