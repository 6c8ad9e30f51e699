//! Tracked thread records.

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

pub type EntityId = u64;

/// Development status as shown by the thread prefixes.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
pub enum Status {
    /// Never fetched.
    #[default]
    Unchecked,
    Normal,
    Completed,
    OnHold,
    Abandoned,
}

/// Content category, taken from the thread prefixes.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
pub enum Kind {
    #[default]
    Misc,
    CheatMod,
    Mod,
    Tool,
    ReadMe,
    Request,
    Tutorial,
    SiteRip,
    Collection,
    Manga,
    Comics,
    Video,
    Gif,
    Pinup,
    Cg,
    Adrift,
    Flash,
    Html,
    Java,
    Others,
    Qsp,
    Rags,
    Rpgm,
    RenPy,
    Tads,
    Unity,
    UnrealEngine,
    WebGl,
    WolfRpg,
}

/// Remote cover image of a thread.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "url", rename_all = "snake_case")]
pub enum ImageRef {
    /// Not known yet; the thread was never fully fetched.
    #[default]
    Unresolved,
    /// The thread has no image, or its host is gone.
    Absent,
    Remote(String),
}

impl ImageRef {
    /// Single-column encoding: `""` unresolved, `"-"` absent, else the URL.
    pub fn to_column(&self) -> &str {
        match self {
            ImageRef::Unresolved => "",
            ImageRef::Absent => "-",
            ImageRef::Remote(url) => url,
        }
    }

    pub fn from_column(raw: &str) -> Self {
        match raw {
            "" => ImageRef::Unresolved,
            "-" => ImageRef::Absent,
            url => ImageRef::Remote(url.to_owned()),
        }
    }

    pub fn remote(&self) -> Option<&str> {
        match self {
            ImageRef::Remote(url) => Some(url),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadLink {
    pub label: String,
    pub url: String,
}

/// A named group of download links, e.g. one per platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Download {
    pub name: String,
    pub links: Vec<DownloadLink>,
}

/// One tracked remote thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub url: String,
    pub name: String,
    pub version: String,
    pub developer: String,
    pub kind: Kind,
    pub status: Status,
    pub score: f32,
    /// Date of the last upstream update. Never moves backwards.
    pub last_updated: Option<NaiveDate>,
    pub last_full_refresh: Option<DateTime<Utc>>,
    /// Application version that produced the current fields.
    pub last_refresh_version: String,
    pub played: bool,
    /// Version that was installed, if any.
    pub installed: Option<String>,
    /// Set when a noteworthy change is detected, cleared on acknowledgment.
    pub updated: bool,
    pub description: String,
    pub changelog: String,
    pub tags: BTreeSet<String>,
    pub image_url: ImageRef,
    pub downloads: Vec<Download>,
    pub added_on: DateTime<Utc>,
}

impl Entity {
    /// A freshly imported, never checked entity.
    pub fn new(id: EntityId, url: impl Into<String>, added_on: DateTime<Utc>) -> Self {
        Self {
            id,
            url: url.into(),
            name: format!("Unchecked thread {id}"),
            version: String::new(),
            developer: String::new(),
            kind: Kind::default(),
            status: Status::Unchecked,
            score: 0.0,
            last_updated: None,
            last_full_refresh: None,
            last_refresh_version: String::new(),
            played: false,
            installed: None,
            updated: false,
            description: String::new(),
            changelog: String::new(),
            tags: BTreeSet::new(),
            image_url: ImageRef::Unresolved,
            downloads: Vec::new(),
            added_on,
        }
    }

    pub fn snapshot(&self) -> OldEntitySnapshot {
        OldEntitySnapshot {
            id: self.id,
            name: self.name.clone(),
            version: self.version.clone(),
            status: self.status,
        }
    }
}

/// The user-visible identity of an entity before a merge changed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OldEntitySnapshot {
    pub id: EntityId,
    pub name: String,
    pub version: String,
    pub status: Status,
}
