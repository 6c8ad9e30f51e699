//! Thread page field extraction, run out of band.
//!
//! The [`Parser`] turns raw page bytes into [`ParsedFields`]. Markup
//! handling lives behind that trait; [`CommandParser`] runs an external
//! helper per document. [`ParseDispatcher`] feeds a small worker pool over a
//! request channel, answers each request on a oneshot and enforces the
//! deadline.

use std::collections::BTreeSet;
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::NaiveDate;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::entity::{Download, EntityId, ImageRef, Kind, Status};
use crate::error::RefreshError;

/// Fields extracted from one thread page.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ParsedFields {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub developer: String,
    #[serde(default)]
    pub kind: Kind,
    pub status: Status,
    /// Canonical thread URL after redirects.
    pub url: String,
    #[serde(default)]
    pub score: f32,
    #[serde(default)]
    pub last_updated: Option<NaiveDate>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub changelog: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// `Absent` when the first post has no image.
    pub image_url: ImageRef,
    #[serde(default)]
    pub downloads: Vec<Download>,
}

/// Why a parser could not produce fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseFailure {
    /// The page lacks the sections the parser needs.
    Malformed(String),
    /// The parser itself broke (crashed, bad output).
    Internal(String),
}

impl std::fmt::Display for ParseFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseFailure::Malformed(m) => write!(f, "malformed page: {m}"),
            ParseFailure::Internal(m) => write!(f, "parser failure: {m}"),
        }
    }
}

pub trait Parser: Send + Sync + 'static {
    fn parse(
        &self,
        id: EntityId,
        raw: Bytes,
    ) -> impl Future<Output = Result<ParsedFields, ParseFailure>> + Send;
}

// ── Dispatcher ──────────────────────────────────────────────────────────────

struct ParseRequest {
    id: EntityId,
    raw: Bytes,
    deadline: Instant,
    reply_tx: oneshot::Sender<ParseReply>,
}

enum ParseReply {
    Fields(Box<ParsedFields>),
    Failed(ParseFailure),
}

/// Handle to the parser worker pool. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ParseDispatcher {
    tx: flume::Sender<ParseRequest>,
}

impl ParseDispatcher {
    /// Spawn `workers` tasks that serve parse requests with `parser`.
    ///
    /// Workers stop once every handle is dropped.
    pub fn start<P: Parser>(parser: P, workers: usize) -> Self {
        let workers = workers.max(1);
        let (tx, rx) = flume::bounded::<ParseRequest>(workers * 2);
        let parser = Arc::new(parser);
        for worker in 0..workers {
            let rx = rx.clone();
            let parser = Arc::clone(&parser);
            tokio::spawn(async move {
                while let Ok(mut req) = rx.recv_async().await {
                    if req.reply_tx.is_closed() || Instant::now() >= req.deadline {
                        debug!(worker, id = req.id, "dropping abandoned parse request");
                        continue;
                    }
                    // The parser future, and any helper process it owns, is
                    // dropped as soon as the caller stops waiting.
                    let reply = tokio::select! {
                        parsed = tokio::time::timeout_at(req.deadline, parser.parse(req.id, req.raw)) => match parsed {
                            Ok(Ok(fields)) => ParseReply::Fields(Box::new(fields)),
                            Ok(Err(failure)) => ParseReply::Failed(failure),
                            Err(_) => {
                                warn!(worker, id = req.id, "parser timed out");
                                continue;
                            }
                        },
                        () = req.reply_tx.closed() => {
                            debug!(worker, id = req.id, "parse abandoned by caller");
                            continue;
                        }
                    };
                    let _ = req.reply_tx.send(reply);
                }
                debug!(worker, "parser worker stopped");
            });
        }
        Self { tx }
    }

    /// Parse one document, giving up after `timeout`.
    ///
    /// The deadline covers waiting for a free worker as well as the parse
    /// itself. A [`ParseFailure`] is returned as-is in the inner result so
    /// the caller can decide what to dump.
    pub async fn parse(
        &self,
        id: EntityId,
        raw: Bytes,
        timeout: Duration,
    ) -> Result<Result<ParsedFields, ParseFailure>, RefreshError> {
        let deadline = Instant::now() + timeout;
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = ParseRequest {
            id,
            raw,
            deadline,
            reply_tx,
        };
        let answer = tokio::time::timeout_at(deadline, async {
            self.tx
                .send_async(request)
                .await
                .map_err(|_| RefreshError::Worker("parser pool shut down".into()))?;
            Ok::<_, RefreshError>(reply_rx.await)
        })
        .await;
        match answer {
            Err(_) => {
                warn!(id, ?timeout, "no parse result before the deadline");
                Err(RefreshError::ParseTimeout { id })
            }
            Ok(Err(e)) => Err(e),
            Ok(Ok(Ok(ParseReply::Fields(fields)))) => Ok(Ok(*fields)),
            Ok(Ok(Ok(ParseReply::Failed(failure)))) => Ok(Err(failure)),
            // Only a worker that hit the deadline drops the reply sender,
            // racing our own timer.
            Ok(Ok(Err(_))) if Instant::now() >= deadline => Err(RefreshError::ParseTimeout { id }),
            Ok(Ok(Err(_))) => Err(RefreshError::Worker("parser worker dropped the request".into())),
        }
    }
}

// ── Command parser ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(untagged)]
enum HelperOutput {
    Failure {
        error: String,
        #[serde(default)]
        malformed: bool,
    },
    Fields(Box<ParsedFields>),
}

/// Runs `program args... <id>` once per document, writing the page to its
/// stdin and reading [`ParsedFields`] as JSON from its stdout.
///
/// The helper reports failure as `{"error": "...", "malformed": true}`.
/// The child is killed if the parse is abandoned.
#[derive(Debug, Clone)]
pub struct CommandParser {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandParser {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl Parser for CommandParser {
    async fn parse(&self, id: EntityId, raw: Bytes) -> Result<ParsedFields, ParseFailure> {
        let internal = |what: &str, e: std::io::Error| ParseFailure::Internal(format!("{what}: {e}"));

        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .arg(id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| internal("spawn parser", e))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&raw)
                .await
                .map_err(|e| internal("write page to parser", e))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| internal("wait for parser", e))?;
        if !output.status.success() {
            return Err(ParseFailure::Internal(format!("parser exited with {}", output.status)));
        }

        match serde_json::from_slice::<HelperOutput>(&output.stdout) {
            Ok(HelperOutput::Fields(fields)) => Ok(*fields),
            Ok(HelperOutput::Failure { error, malformed: true }) => Err(ParseFailure::Malformed(error)),
            Ok(HelperOutput::Failure { error, .. }) => Err(ParseFailure::Internal(error)),
            Err(e) => Err(ParseFailure::Internal(format!("bad parser output: {e}"))),
        }
    }
}
