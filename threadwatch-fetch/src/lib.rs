//! HTTP plumbing for threadwatch.
//!
//! [`ResilientClient`] wraps `reqwest` with retries, the shared
//! [`SessionContext`] cookie jar, streamed partial reads and the anti-bot
//! [`ChallengeBypass`]. [`release`] implements the self-update channel.
//!
//! ```rust,no_run
//! # async fn demo() -> Result<(), threadwatch_fetch::FetchError> {
//! use threadwatch_fetch::{ClientConfig, FetchOptions, ReadMode, ResilientClient, SessionContext};
//! use reqwest::Method;
//!
//! let client = ResilientClient::new(ClientConfig::default(), SessionContext::default())?;
//! let (head, _meta) = client
//!     .fetch(
//!         Method::GET,
//!         "https://forum.example/account/",
//!         FetchOptions::default().read(ReadMode::until_markers(["_xfToken", ">"])),
//!     )
//!     .await?;
//! # let _ = head;
//! # Ok(())
//! # }
//! ```

pub mod challenge;
pub mod client;
pub mod cookies;
pub mod error;
pub mod read;
pub mod release;
pub mod version;

pub use challenge::{ChallengeBypass, ChallengeEndpoints};
pub use client::{ClientConfig, FetchOptions, ResilientClient, ResponseMeta};
pub use cookies::{CookieMap, SessionContext};
pub use error::FetchError;
pub use read::ReadMode;

pub use reqwest::{Method, StatusCode, Url};
