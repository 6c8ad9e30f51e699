//! Login session lifecycle.

use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use threadwatch_fetch::read::{find, rfind};
use threadwatch_fetch::{CookieMap, FetchOptions, Method, ReadMode, ResilientClient};
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::diagnostics::{self, Diagnostics};
use crate::error::SessionError;
use crate::store::Store;

pub const LOGIN_REQUIRED_MARKER: &[u8] = b"<title>Log in | F95zone</title>";
pub const MAINTENANCE_MARKER: &[u8] =
    b"<p>Automated backups are currently executing. During this time, the site will be unavailable</p>";

/// Fail on the login-required and maintenance pages.
pub fn check_signatures(raw: &[u8]) -> Result<(), SessionError> {
    if find(raw, LOGIN_REQUIRED_MARKER).is_some() {
        return Err(SessionError::LoginExpired);
    }
    if find(raw, MAINTENANCE_MARKER).is_some() {
        return Err(SessionError::Maintenance);
    }
    Ok(())
}

/// The anti-forgery token: within the page up to the first `>` after
/// `_xfToken`, the value between the last `value="` and the next `"`.
pub fn extract_token(raw: &[u8]) -> Option<String> {
    const VALUE: &[u8] = b"value=\"";
    let marker = find(raw, b"_xfToken")?;
    let end = marker + find(&raw[marker..], b">")?;
    let raw = &raw[..end];
    let start = rfind(raw, VALUE)? + VALUE.len();
    let len = find(&raw[start..], b"\"")?;
    let token = std::str::from_utf8(&raw[start..start + len]).ok()?;
    (!token.is_empty()).then(|| token.to_owned())
}

/// Obtains a fresh authenticated cookie set, typically by asking the user
/// to log in.
pub trait BrowserLogin: Send + Sync + 'static {
    fn login(&self, login_page: &str) -> impl Future<Output = Result<CookieMap, SessionError>> + Send;
}

/// Runs `program args... <login_page>` and reads a JSON object of cookies
/// from its stdout.
#[derive(Debug, Clone)]
pub struct CommandLogin {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandLogin {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl BrowserLogin for CommandLogin {
    async fn login(&self, login_page: &str) -> Result<CookieMap, SessionError> {
        let output = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .arg(login_page)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| SessionError::LoginHelper(format!("spawn {}: {e}", self.program.display())))?;
        if !output.status.success() {
            return Err(SessionError::LoginHelper(format!(
                "login helper exited with {}",
                output.status
            )));
        }
        serde_json::from_slice(&output.stdout)
            .map_err(|e| SessionError::LoginHelper(format!("bad cookie JSON from login helper: {e}")))
    }
}

/// Makes sure the shared session is logged in.
///
/// `ensure` calls are serialized, so a caller that waited on a login in
/// progress simply re-probes and finds the fresh session.
pub struct SessionGuard<L, S> {
    client: ResilientClient,
    check_login_page: String,
    login_page: String,
    login: L,
    store: Arc<S>,
    diagnostics: Diagnostics,
    serial: Mutex<()>,
}

impl<L: BrowserLogin, S: Store> SessionGuard<L, S> {
    pub fn new(
        client: ResilientClient,
        check_login_page: impl Into<String>,
        login_page: impl Into<String>,
        login: L,
        store: Arc<S>,
        diagnostics: Diagnostics,
    ) -> Self {
        Self {
            client,
            check_login_page: check_login_page.into(),
            login_page: login_page.into(),
            login,
            store,
            diagnostics,
            serial: Mutex::new(()),
        }
    }

    /// `Ok(true)` once the session is valid, `Ok(false)` if a fresh login
    /// still does not validate.
    #[instrument(skip(self))]
    pub async fn ensure(&self) -> Result<bool, SessionError> {
        let _serial = self.serial.lock().await;
        if self.probe().await? {
            return Ok(true);
        }

        info!(login_page = %self.login_page, "session invalid, asking for a fresh login");
        let cookies = self.login.login(&self.login_page).await?;
        let store = Arc::clone(&self.store);
        let persisted = cookies.clone();
        // Finish persisting even if the caller goes away.
        tokio::spawn(async move { store.save_cookies(&persisted).await })
            .await
            .map_err(|e| SessionError::LoginHelper(format!("cookie save task failed: {e}")))??;
        self.client.session().replace_base(cookies);

        let valid = self.probe().await?;
        if !valid {
            warn!("fresh login did not validate");
        }
        Ok(valid)
    }

    async fn probe(&self) -> Result<bool, SessionError> {
        let (raw, meta) = self
            .client
            .fetch(
                Method::GET,
                &self.check_login_page,
                FetchOptions::default().read(ReadMode::until_markers(["_xfToken", ">"])),
            )
            .await?;

        if !meta.is_success() {
            return match check_signatures(&raw) {
                Err(SessionError::LoginExpired) => Ok(false),
                Err(other) => Err(other),
                Ok(()) => {
                    let dump = self.diagnostics.dump(diagnostics::LOGIN_BROKEN, &raw).await?;
                    Err(SessionError::Assertion {
                        status: meta.status.as_u16(),
                        url: meta.url.to_string(),
                        dump,
                    })
                }
            };
        }

        match extract_token(&raw) {
            Some(token) => {
                self.client.session().set_token(Some(token));
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
