//! Process configuration, loaded from environment variables at startup.
//!
//! User preferences (workers, timeouts, ...) live in the database settings
//! table instead; see `threadwatch_core::settings`.

use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    /// sqlx SQLite URL (default: `sqlite://<data_dir>/threadwatch.db`).
    pub database_url: String,

    /// Images and diagnostic dumps (default: the platform data dir).
    pub data_dir: PathBuf,

    /// Forum root all endpoints derive from.
    pub domain: String,

    /// Page parser helper, split on whitespace. Receives the page on stdin
    /// and the thread id as its last argument.
    pub parser_cmd: Vec<String>,

    /// Browser login helper, split on whitespace. Prints a JSON cookie map.
    pub login_cmd: Vec<String>,

    /// Parser helper processes allowed at once.
    pub parser_workers: usize,

    /// `tracing` filter string, e.g. `"info"` or `"debug,sqlx=warn"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var_os("THREADWATCH_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir);
        let default_db = format!("sqlite://{}", data_dir.join("threadwatch.db").display());
        Self {
            database_url: env_or("THREADWATCH_DATABASE_URL", &default_db),
            domain: env_or("THREADWATCH_DOMAIN", threadwatch_core::site::DEFAULT_DOMAIN),
            parser_cmd: split_cmd(&env_or("THREADWATCH_PARSER_CMD", "threadwatch-parse")),
            login_cmd: split_cmd(&env_or("THREADWATCH_LOGIN_CMD", "threadwatch-login")),
            parser_workers: parse_env("THREADWATCH_PARSER_WORKERS", 4),
            log_level: env_or("THREADWATCH_LOG", "info"),
            log_json: std::env::var("THREADWATCH_LOG_JSON")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            data_dir,
        }
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn default_data_dir() -> PathBuf {
    dirs_next::data_dir()
        .map(|dir| dir.join("threadwatch"))
        .unwrap_or_else(|| PathBuf::from(".threadwatch"))
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn split_cmd(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_owned).collect()
}
