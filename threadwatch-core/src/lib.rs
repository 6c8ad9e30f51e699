//! Thread tracking engine.
//!
//! A [`Tracker`] keeps a list of forum threads ([`Entity`]) current. Its
//! refresh run ([`refresh::RefreshOrchestrator`]) probes each thread, fetches
//! and parses the ones that moved or aged out, reconciles the result with
//! the stored record ([`merge`]) and publishes [`RefreshEvent`]s. Persistence
//! sits behind the [`Store`] trait; page parsing behind [`Parser`]; the
//! interactive login behind [`session::BrowserLogin`].

pub mod diagnostics;
pub mod entity;
pub mod error;
pub mod events;
pub mod images;
pub mod import;
pub mod limiter;
pub mod merge;
pub mod notifs;
pub mod parser;
pub mod refresh;
pub mod session;
pub mod settings;
pub mod site;
pub mod store;
pub mod tracker;
pub mod updates;

#[cfg(test)]
mod testing;

pub use entity::{Entity, EntityId, ImageRef, Kind, OldEntitySnapshot, Status};
pub use error::{RefreshError, SessionError, StoreError};
pub use events::{EventBus, RefreshEvent};
pub use parser::{CommandParser, ParsedFields, Parser};
pub use refresh::{RefreshOrchestrator, RefreshRun};
pub use session::{BrowserLogin, CommandLogin};
pub use settings::Settings;
pub use site::Site;
pub use store::{MemoryStore, Store};
pub use tracker::{Tracker, TrackerOptions};
