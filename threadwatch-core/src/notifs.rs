//! Unread alerts and conversations.

use serde_json::Value;
use threadwatch_fetch::{FetchOptions, Method, ResilientClient};
use tracing::info;

use crate::diagnostics::{self, Diagnostics};
use crate::error::RefreshError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotifCounts {
    pub alerts: u64,
    pub conversations: u64,
}

impl NotifCounts {
    pub fn total(&self) -> u64 {
        self.alerts + self.conversations
    }

    /// Human summary, `None` when there is nothing unread.
    pub fn summary(&self) -> Option<String> {
        let plural = |n: u64| if n > 1 { "s" } else { "" };
        match (self.alerts, self.conversations) {
            (0, 0) => None,
            (a, 0) => Some(format!("You have {a} unread alert{}.", plural(a))),
            (0, c) => Some(format!("You have {c} unread conversation{}.", plural(c))),
            (a, c) => Some(format!(
                "You have {} unread notifications ({a} alert{} and {c} conversation{}).",
                a + c,
                plural(a),
                plural(c)
            )),
        }
    }
}

/// Read the unread counters from the notification endpoint's JSON body.
pub fn parse_counts(raw: &[u8]) -> Result<NotifCounts, String> {
    let res: Value = serde_json::from_slice(raw).map_err(|e| format!("invalid JSON: {e}"))?;
    if res.get("status").and_then(Value::as_str) == Some("error") {
        let errors = res
            .get("errors")
            .and_then(Value::as_array)
            .map(|errors| {
                errors
                    .iter()
                    .map(|e| e.as_str().map(str::to_owned).unwrap_or_else(|| e.to_string()))
                    .collect::<Vec<_>>()
                    .join("; ")
            })
            .unwrap_or_default();
        return Err(format!("upstream error: {errors}"));
    }
    let visitor = res.get("visitor").ok_or("no visitor object")?;
    Ok(NotifCounts {
        alerts: counter(visitor, "alerts_unread")?,
        conversations: counter(visitor, "conversations_unread")?,
    })
}

fn counter(visitor: &Value, key: &str) -> Result<u64, String> {
    match visitor.get(key) {
        Some(Value::Number(n)) => n.as_u64().ok_or_else(|| format!("{key} is not a count")),
        Some(Value::String(s)) => s
            .replace(',', "")
            .trim()
            .parse()
            .map_err(|e| format!("{key}: {e}")),
        _ => Err(format!("missing {key}")),
    }
}

/// Query the notification endpoint with the session token.
///
/// Unreadable bodies are saved as `notifs_broken.bin`.
pub async fn check(
    client: &ResilientClient,
    endpoint: &str,
    diagnostics: &Diagnostics,
) -> Result<NotifCounts, RefreshError> {
    let token = client.session().token().unwrap_or_default();
    let (raw, _) = client
        .fetch(
            Method::GET,
            endpoint,
            FetchOptions::default()
                .query("_xfToken", token)
                .query("_xfResponseType", "json"),
        )
        .await?;
    match parse_counts(&raw) {
        Ok(counts) => {
            info!(alerts = counts.alerts, conversations = counts.conversations, "notifications checked");
            Ok(counts)
        }
        Err(message) => {
            let dump = diagnostics.try_dump(diagnostics::NOTIFS_BROKEN, &raw).await;
            Err(RefreshError::Notifications { message, dump })
        }
    }
}
