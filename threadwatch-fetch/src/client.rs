use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::header::{COOKIE, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, StatusCode, Url};
use tracing::{debug, warn};

use crate::challenge::{ChallengeBypass, ChallengeEndpoints};
use crate::cookies::{self, CookieMap, SessionContext};
use crate::error::FetchError;
use crate::read::{self, ReadMode, StopScanner};

/// Header value that identifies the anti-bot proxy.
const BLOCK_SERVER_HEADER: &str = "ddos-guard";
/// Body marker of the anti-bot block page.
const BLOCK_BODY_MARKER: &[u8] = b"<title>DDOS-GUARD</title>";

/// Static configuration for a [`ResilientClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Default per-request deadline.
    pub timeout: Duration,
    /// Extra attempts after the first on network-level failures.
    pub max_retries: u32,
    pub user_agent: String,
    pub challenge: ChallengeEndpoints,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 2,
            user_agent: concat!("threadwatch/", env!("CARGO_PKG_VERSION"), " reqwest").to_owned(),
            challenge: ChallengeEndpoints::default(),
        }
    }
}

/// Per-call knobs for [`ResilientClient::fetch`].
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    pub form: Option<Vec<(String, String)>>,
    pub json: Option<serde_json::Value>,
    /// Overrides [`ClientConfig::timeout`] for this call.
    pub timeout: Option<Duration>,
    pub read: ReadMode,
    /// Cookies layered on top of the session cookies for this call only.
    pub cookies: CookieMap,
}

impl FetchOptions {
    pub fn read(mut self, read: ReadMode) -> Self {
        self.read = read;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn form(mut self, fields: Vec<(String, String)>) -> Self {
        self.form = Some(fields);
        self
    }

    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.json = Some(body);
        self
    }
}

/// Status, headers and final (post-redirect) URL of a response.
#[derive(Debug, Clone)]
pub struct ResponseMeta {
    pub status: StatusCode,
    pub url: Url,
    pub headers: HeaderMap,
}

impl ResponseMeta {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Cookies set by this response.
    pub fn set_cookies(&self) -> Vec<(String, String)> {
        cookies::set_cookies(&self.headers)
    }
}

/// HTTP client for the upstream service.
///
/// Every request carries the session cookies, follows redirects without
/// limit and skips TLS verification. Network failures are retried;
/// the anti-bot block page triggers [`ChallengeBypass`].
#[derive(Debug, Clone)]
pub struct ResilientClient {
    http: Client,
    session: SessionContext,
    config: ClientConfig,
}

impl ResilientClient {
    pub fn new(config: ClientConfig, session: SessionContext) -> Result<Self, FetchError> {
        let http = Client::builder()
            .user_agent(config.user_agent.clone())
            .danger_accept_invalid_certs(true)
            .redirect(reqwest::redirect::Policy::custom(|attempt| attempt.follow()))
            .build()
            .map_err(|e| FetchError::InvalidRequest(e.to_string()))?;
        Ok(Self {
            http,
            session,
            config,
        })
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Issue a request and read its body according to `options.read`.
    ///
    /// Non-2xx bodies are always read in full. If the response is the
    /// anti-bot block page the request is resubmitted with the block
    /// response's cookies, then once more after the bypass sequence; a third
    /// block is reported as [`FetchError::Challenge`].
    pub async fn fetch(
        &self,
        method: Method,
        url: &str,
        options: FetchOptions,
    ) -> Result<(Bytes, ResponseMeta), FetchError> {
        let (body, meta) = self.fetch_raw(&method, url, &options).await?;
        if !is_blocked(&method, &body, &meta) {
            return Ok((body, meta));
        }

        warn!(url, status = %meta.status, "anti-bot block page, retrying with its cookies");
        self.session.merge_challenge(meta.set_cookies());
        let (body, meta) = self.fetch_raw(&method, url, &options).await?;
        if !is_blocked(&method, &body, &meta) {
            return Ok((body, meta));
        }

        warn!(url, "anti-bot block page again, running bypass sequence");
        self.session.merge_challenge(meta.set_cookies());
        let harvested = ChallengeBypass::new(self, &self.config.challenge)
            .run(&meta.url)
            .await?;
        debug!(url, cookies = harvested.len(), "bypass sequence harvested cookies");
        self.session.merge_challenge(harvested);

        let (body, meta) = self.fetch_raw(&method, url, &options).await?;
        if is_blocked(&method, &body, &meta) {
            return Err(FetchError::Challenge {
                url: url.to_owned(),
            });
        }
        Ok((body, meta))
    }

    /// Send with retries and read the body, without any challenge handling.
    pub(crate) async fn fetch_raw(
        &self,
        method: &Method,
        url: &str,
        options: &FetchOptions,
    ) -> Result<(Bytes, ResponseMeta), FetchError> {
        let attempts = self.config.max_retries + 1;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match self.send(method, url, options).await {
                Ok(response) => read_body(response, &options.read)
                    .await
                    .map_err(|e| FetchError::from_reqwest(url, e)),
                Err(e) => Err(e),
            };
            match result {
                Err(e) if e.is_retryable() && attempt < attempts => {
                    warn!(url, attempt, attempts, error = %e, "request failed, retrying");
                }
                other => return other,
            }
        }
    }

    /// Send with retries and hand back the unread response.
    ///
    /// Used for large downloads that the caller streams itself.
    pub async fn open(
        &self,
        method: Method,
        url: &str,
        options: FetchOptions,
    ) -> Result<reqwest::Response, FetchError> {
        let attempts = self.config.max_retries + 1;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.send(&method, url, &options).await {
                Err(e) if e.is_retryable() && attempt < attempts => {
                    warn!(url, attempt, attempts, error = %e, "request failed, retrying");
                }
                other => return other,
            }
        }
    }

    async fn send(
        &self,
        method: &Method,
        url: &str,
        options: &FetchOptions,
    ) -> Result<reqwest::Response, FetchError> {
        let mut request = self
            .http
            .request(method.clone(), url)
            .timeout(options.timeout.unwrap_or(self.config.timeout));

        let mut headers = HeaderMap::new();
        for (name, value) in &options.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| FetchError::InvalidRequest(e.to_string()))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| FetchError::InvalidRequest(e.to_string()))?;
            headers.append(name, value);
        }
        if let Some(cookie) = self.session.cookie_header(&options.cookies) {
            let value = HeaderValue::from_str(&cookie)
                .map_err(|e| FetchError::InvalidRequest(e.to_string()))?;
            headers.insert(COOKIE, value);
        }
        request = request.headers(headers);

        if !options.query.is_empty() {
            request = request.query(&options.query);
        }
        if let Some(form) = &options.form {
            request = request.form(form);
        } else if let Some(json) = &options.json {
            request = request.json(json);
        }

        request
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(url, e))
    }
}

/// Read the body of `response` according to `mode`.
async fn read_body(
    response: reqwest::Response,
    mode: &ReadMode,
) -> Result<(Bytes, ResponseMeta), reqwest::Error> {
    let meta = ResponseMeta {
        status: response.status(),
        url: response.url().clone(),
        headers: response.headers().clone(),
    };

    if !meta.status.is_success() {
        return Ok((response.bytes().await?, meta));
    }

    let Some(mut scanner) = StopScanner::for_mode(mode) else {
        return match mode {
            ReadMode::HeadersOnly => Ok((Bytes::new(), meta)),
            _ => Ok((response.bytes().await?, meta)),
        };
    };

    let mut buf = BytesMut::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        buf.extend_from_slice(&chunk?);
        if scanner.satisfied(&buf) {
            break;
        }
    }
    Ok((buf.freeze(), meta))
}

/// `true` when the response is the anti-bot block page.
///
/// HEAD responses carry no body, so for them the header alone decides.
fn is_blocked(method: &Method, body: &[u8], meta: &ResponseMeta) -> bool {
    let header_matches = meta
        .header("server")
        .is_some_and(|server| server.to_ascii_lowercase().contains(BLOCK_SERVER_HEADER));
    if !header_matches {
        return false;
    }
    if *method == Method::HEAD {
        return !meta.status.is_success();
    }
    read::find(body, BLOCK_BODY_MARKER).is_some()
}
