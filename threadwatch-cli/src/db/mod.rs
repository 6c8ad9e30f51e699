//! Persistence for the CLI.
//!
//! The tracker only sees the [`threadwatch_core::Store`] trait; this module
//! provides the SQLite implementation. To swap databases, implement `Store`
//! for another type and change the concrete type in `main.rs`.

pub mod sqlite;

pub use sqlite::SqliteStore;
