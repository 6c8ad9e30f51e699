//! Reconciles freshly parsed fields with a stored entity.
//!
//! [`merge`] is pure: it takes value snapshots and returns the new record,
//! the change record (if any) and the image decision. Side effects belong to
//! the refresh worker.

use chrono::{DateTime, Utc};
use threadwatch_fetch::version;

use crate::entity::{Entity, ImageRef, OldEntitySnapshot, Status};
use crate::parser::ParsedFields;

/// Records older than this parsed versions differently.
pub const VERSION_PARSING_THRESHOLD: &str = "9.0";
/// Records older than this may carry a stale image URL; keep their image.
pub const KEEP_OLD_IMAGE_THRESHOLD: &str = "9.0";
/// Records older than this miss fields; force a full refresh.
pub const PARSING_CHANGES_THRESHOLD: &str = "9.4";

/// Which schema-breaking changes happened since the record was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakingChecks {
    pub version_parsing: bool,
    pub keep_old_image: bool,
    pub parsing_changes: bool,
}

impl BreakingChecks {
    /// `last_refresh_version` of the stored record; empty means `"0"`.
    pub fn for_version(last_refresh_version: &str) -> Self {
        let stored = if last_refresh_version.is_empty() {
            "0"
        } else {
            last_refresh_version
        };
        Self {
            version_parsing: version::is_breaking(stored, VERSION_PARSING_THRESHOLD),
            keep_old_image: version::is_breaking(stored, KEEP_OLD_IMAGE_THRESHOLD),
            parsing_changes: version::is_breaking(stored, PARSING_CHANGES_THRESHOLD),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MergeContext {
    pub now: DateTime<Utc>,
    /// Version of the running application, stamped on the merged record.
    pub app_version: String,
    pub keep_image_on_update: bool,
    /// Whether the local image file for this entity is missing.
    pub image_missing: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub entity: Entity,
    pub change: Option<OldEntitySnapshot>,
    /// Remote image to download and store, if one should be fetched.
    pub fetch_image: Option<String>,
}

pub fn merge(old: &Entity, parsed: &ParsedFields, ctx: &MergeContext) -> MergeOutcome {
    let breaking = BreakingChecks::for_version(&old.last_refresh_version);

    let mut played = old.played;
    let mut installed = old.installed.clone();
    if breaking.version_parsing {
        if installed.as_deref() == Some(old.version.as_str()) {
            installed = Some(parsed.version.clone());
        }
    } else if parsed.version != old.version {
        played = false;
    }

    let last_updated = match (old.last_updated, parsed.last_updated) {
        (Some(old), Some(new)) => Some(old.max(new)),
        (old, new) => new.or(old),
    };

    let change = (old.status != Status::Unchecked
        && !breaking.version_parsing
        && (parsed.name != old.name || parsed.version != old.version || parsed.status != old.status))
        .then(|| old.snapshot());

    let mut wants_image = ctx.image_missing;
    if !ctx.keep_image_on_update && !breaking.keep_old_image {
        wants_image = wants_image || parsed.image_url != old.image_url;
    }
    let fetch_image = if wants_image {
        parsed.image_url.remote().map(str::to_owned)
    } else {
        None
    };

    let entity = Entity {
        id: old.id,
        url: parsed.url.clone(),
        name: parsed.name.clone(),
        version: parsed.version.clone(),
        developer: parsed.developer.clone(),
        kind: parsed.kind,
        status: parsed.status,
        score: parsed.score,
        last_updated,
        last_full_refresh: Some(ctx.now),
        last_refresh_version: ctx.app_version.clone(),
        played,
        installed,
        updated: old.updated || change.is_some(),
        description: parsed.description.clone(),
        changelog: parsed.changelog.clone(),
        tags: parsed.tags.clone(),
        image_url: parsed.image_url.clone(),
        downloads: parsed.downloads.clone(),
        added_on: old.added_on,
    };

    MergeOutcome {
        entity,
        change,
        fetch_image,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::{NaiveDate, TimeZone};

    use super::*;
    use crate::entity::Kind;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn ctx() -> MergeContext {
        MergeContext {
            now: now(),
            app_version: "11.0".into(),
            keep_image_on_update: false,
            image_missing: false,
        }
    }

    fn stored() -> Entity {
        let mut e = Entity::new(42, "https://forum.example/threads/game.42/", now());
        e.name = "Game".into();
        e.version = "0.5".into();
        e.status = Status::Normal;
        e.last_refresh_version = "10.2".into();
        e.played = true;
        e.installed = Some("0.5".into());
        e.image_url = ImageRef::Remote("https://img.example/a.png".into());
        e.last_updated = NaiveDate::from_ymd_opt(2026, 2, 1);
        e
    }

    fn parsed_from(e: &Entity) -> ParsedFields {
        ParsedFields {
            name: e.name.clone(),
            version: e.version.clone(),
            developer: e.developer.clone(),
            kind: Kind::RenPy,
            status: e.status,
            url: e.url.clone(),
            score: 4.0,
            last_updated: e.last_updated,
            description: "story".into(),
            changelog: String::new(),
            tags: BTreeSet::from(["2d game".to_owned()]),
            image_url: e.image_url.clone(),
            downloads: Vec::new(),
        }
    }

    #[test]
    fn breaking_comparison_pads_fields() {
        assert!(!BreakingChecks::for_version("9").version_parsing);
        assert!(!BreakingChecks::for_version("9.0").version_parsing);
        assert!(!BreakingChecks::for_version("9.4").version_parsing);
        assert!(BreakingChecks::for_version("9.0").parsing_changes);
        assert!(!BreakingChecks::for_version("9.4").parsing_changes);
        assert!(BreakingChecks::for_version("").version_parsing);
        assert!(BreakingChecks::for_version("8.9.9").keep_old_image);
    }

    #[test]
    fn merge_is_idempotent() {
        let mut parsed = parsed_from(&stored());
        parsed.version = "0.6".into();

        let first = merge(&stored(), &parsed, &ctx());
        let second = merge(&first.entity, &parsed, &ctx());

        assert_eq!(second.entity, first.entity);
        assert_eq!(second.change, None);
        assert_eq!(second.fetch_image, None);
    }

    #[test]
    fn first_check_never_reports_a_change() {
        let mut old = Entity::new(42, "https://forum.example/threads/42/", now());
        old.last_refresh_version = "11.0".into();
        let mut parsed = parsed_from(&stored());
        parsed.name = "Brand new".into();

        let outcome = merge(&old, &parsed, &ctx());
        assert_eq!(outcome.change, None);
        assert!(!outcome.entity.updated);
    }

    #[test]
    fn version_change_reports_and_resets_played() {
        let mut parsed = parsed_from(&stored());
        parsed.version = "0.6".into();

        let outcome = merge(&stored(), &parsed, &ctx());
        assert!(!outcome.entity.played);
        assert_eq!(outcome.entity.installed.as_deref(), Some("0.5"));
        assert!(outcome.entity.updated);
        assert_eq!(
            outcome.change,
            Some(OldEntitySnapshot {
                id: 42,
                name: "Game".into(),
                version: "0.5".into(),
                status: Status::Normal,
            })
        );
    }

    #[test]
    fn breaking_version_parsing_keeps_played_and_restamps_installed() {
        let mut old = stored();
        old.last_refresh_version = "8.5".into();
        let mut parsed = parsed_from(&old);
        parsed.version = "v0.5 Public".into();

        let outcome = merge(&old, &parsed, &ctx());
        assert!(outcome.entity.played);
        assert_eq!(outcome.entity.installed.as_deref(), Some("v0.5 Public"));
        assert_eq!(outcome.change, None);
        assert_eq!(outcome.entity.last_refresh_version, "11.0");
    }

    #[test]
    fn installed_other_version_is_not_restamped() {
        let mut old = stored();
        old.last_refresh_version = "8.5".into();
        old.installed = Some("0.4".into());
        let mut parsed = parsed_from(&old);
        parsed.version = "0.6".into();

        let outcome = merge(&old, &parsed, &ctx());
        assert_eq!(outcome.entity.installed.as_deref(), Some("0.4"));
    }

    #[test]
    fn last_updated_never_regresses() {
        let mut parsed = parsed_from(&stored());
        parsed.last_updated = NaiveDate::from_ymd_opt(2025, 1, 1);
        let outcome = merge(&stored(), &parsed, &ctx());
        assert_eq!(outcome.entity.last_updated, NaiveDate::from_ymd_opt(2026, 2, 1));

        parsed.last_updated = NaiveDate::from_ymd_opt(2026, 2, 20);
        let outcome = merge(&stored(), &parsed, &ctx());
        assert_eq!(outcome.entity.last_updated, NaiveDate::from_ymd_opt(2026, 2, 20));
    }

    #[test]
    fn status_change_alone_is_reported() {
        let mut parsed = parsed_from(&stored());
        parsed.status = Status::Completed;
        let outcome = merge(&stored(), &parsed, &ctx());
        assert_eq!(outcome.change.map(|c| c.status), Some(Status::Normal));
        assert!(outcome.entity.played);
    }

    #[test]
    fn image_decision() {
        let mut parsed = parsed_from(&stored());
        parsed.image_url = ImageRef::Remote("https://img.example/b.png".into());

        let outcome = merge(&stored(), &parsed, &ctx());
        assert_eq!(outcome.fetch_image.as_deref(), Some("https://img.example/b.png"));

        let keep = MergeContext {
            keep_image_on_update: true,
            ..ctx()
        };
        assert_eq!(merge(&stored(), &parsed, &keep).fetch_image, None);

        let missing = MergeContext {
            image_missing: true,
            ..keep
        };
        assert!(merge(&stored(), &parsed, &missing).fetch_image.is_some());

        let mut old_record = stored();
        old_record.last_refresh_version = "8.0".into();
        assert_eq!(merge(&old_record, &parsed, &ctx()).fetch_image, None);

        parsed.image_url = ImageRef::Absent;
        assert_eq!(merge(&stored(), &parsed, &missing).fetch_image, None);
    }
}
