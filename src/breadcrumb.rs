use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};

use crate::error::{Result, ScrapeError};

pub const TYPE: &str = "type";
pub const CODE: &str = "code";
pub const TITLE: &str = "title";
pub const START: &str = "start";
pub const END: &str = "end";
pub const TIMESTAMP: &str = "timestamp";

/// Page type a breadcrumb points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    MainPage,
    LetterPage,
    ActMain,
    ActVersions,
    ActItem,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::MainPage => "main_page",
            Stage::LetterPage => "letter_page",
            Stage::ActMain => "act_main",
            Stage::ActVersions => "act_versions",
            Stage::ActItem => "act_item",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = ScrapeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "main_page" => Ok(Stage::MainPage),
            "letter_page" => Ok(Stage::LetterPage),
            "act_main" => Ok(Stage::ActMain),
            "act_versions" => Ok(Stage::ActVersions),
            "act_item" => Ok(Stage::ActItem),
            other => Err(ScrapeError::UnknownStage(other.to_string())),
        }
    }
}

/// Context accumulated along a crawl path.
///
/// There is no way to mutate an `Attrs` in place: every hop derives a new
/// map with [`Attrs::with`], so sibling breadcrumbs never share state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attrs(BTreeMap<String, String>);

impl Attrs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(&self, key: &str, value: impl Into<String>) -> Self {
        let mut map = self.0.clone();
        map.insert(key.to_string(), value.into());
        Attrs(map)
    }

    pub fn with_stage(&self, stage: Stage) -> Self {
        self.with(TYPE, stage.as_str())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Look up an attribute a stage cannot run without.
    pub fn require(&self, stage: Stage, key: &'static str) -> Result<&str> {
        self.get(key).ok_or(ScrapeError::MissingAttr {
            stage: stage.as_str(),
            key,
        })
    }

    /// Parsed `timestamp`, if one was recorded.
    pub fn timestamp(&self) -> Result<Option<DateTime<Utc>>> {
        self.get(TIMESTAMP).map(parse_timestamp).transpose()
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.0
    }
}

impl From<BTreeMap<String, String>> for Attrs {
    fn from(map: BTreeMap<String, String>) -> Self {
        Attrs(map)
    }
}

impl<const N: usize> From<[(&str, &str); N]> for Attrs {
    fn from(pairs: [(&str, &str); N]) -> Self {
        Attrs(
            pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

/// Accepts RFC 3339, or a naive ISO datetime in the local timezone (what
/// older publishers wrote).
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    let invalid = || ScrapeError::InvalidTimestamp(raw.to_string());
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f").map_err(|_| invalid())?;
    // Falls in a DST gap only if the writer's clock did too.
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(invalid)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breadcrumb {
    pub url: String,
    pub attrs: Attrs,
}

impl Breadcrumb {
    pub fn new(url: impl Into<String>, attrs: impl Into<Attrs>) -> Self {
        Self {
            url: url.into(),
            attrs: attrs.into(),
        }
    }

    pub fn stage(&self) -> Result<Stage> {
        self.attrs
            .get(TYPE)
            .ok_or_else(|| ScrapeError::MissingStage {
                url: self.url.clone(),
            })?
            .parse()
    }
}

/// One version of one act, as scraped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActItem {
    pub code: String,
    pub title: String,
    pub start: String,
    /// Empty while the version is still in force.
    pub end: String,
    pub body: String,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ScrapeResult {
    pub breadcrumbs: Vec<Breadcrumb>,
    pub items: Vec<ActItem>,
}

impl ScrapeResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn breadcrumbs(breadcrumbs: Vec<Breadcrumb>) -> Self {
        Self {
            breadcrumbs,
            items: Vec::new(),
        }
    }

    pub fn items(items: Vec<ActItem>) -> Self {
        Self {
            breadcrumbs: Vec::new(),
            items,
        }
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.breadcrumbs.is_empty() && self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_leaves_parent_untouched() {
        let parent = Attrs::from([(TYPE, "letter_page")]);
        let a = parent.with(CODE, "A-1");
        let b = parent.with(CODE, "A-1.5");

        assert_eq!(parent.get(CODE), None);
        assert_eq!(a.get(CODE), Some("A-1"));
        assert_eq!(b.get(CODE), Some("A-1.5"));
        assert_eq!(a.get(TYPE), Some("letter_page"));
    }

    #[test]
    fn stage_from_type_tag() {
        let crumb = Breadcrumb::new("file:///x", [(TYPE, "act_versions")]);
        assert_eq!(crumb.stage().unwrap(), Stage::ActVersions);

        for stage in [
            Stage::MainPage,
            Stage::LetterPage,
            Stage::ActMain,
            Stage::ActVersions,
            Stage::ActItem,
        ] {
            assert_eq!(stage.as_str().parse::<Stage>().unwrap(), stage);
        }
    }

    #[test]
    fn missing_or_unknown_type_is_an_error() {
        let crumb = Breadcrumb::new("file:///x", Attrs::new());
        assert!(matches!(crumb.stage(), Err(ScrapeError::MissingStage { .. })));

        let crumb = Breadcrumb::new("file:///x", [(TYPE, "act_summary")]);
        assert!(matches!(crumb.stage(), Err(ScrapeError::UnknownStage(t)) if t == "act_summary"));
    }

    #[test]
    fn require_names_stage_and_key() {
        let attrs = Attrs::from([(CODE, "A-1")]);
        assert_eq!(attrs.require(Stage::ActMain, CODE).unwrap(), "A-1");
        let err = attrs.require(Stage::ActMain, TITLE).unwrap_err();
        assert_eq!(err.to_string(), "stage act_main requires attribute `title`");
    }

    #[test]
    fn timestamps_rfc3339_and_naive() {
        let expected = Utc.with_ymd_and_hms(2016, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(parse_timestamp("2016-01-01T00:00:00+00:00").unwrap(), expected);
        assert_eq!(parse_timestamp("2016-01-01T00:00:00Z").unwrap(), expected);
        assert_eq!(parse_timestamp("2016-01-01T02:00:00+02:00").unwrap(), expected);
        assert!(parse_timestamp("yesterday").is_err());

        assert_eq!(Attrs::new().timestamp().unwrap(), None);
    }

    #[test]
    fn naive_timestamps_are_local_time() {
        let local = Local.with_ymd_and_hms(2016, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(
            parse_timestamp("2016-01-01T00:00:00").unwrap(),
            local.with_timezone(&Utc)
        );
        assert_eq!(
            parse_timestamp("2016-01-01T00:00:00.250").unwrap(),
            local.with_timezone(&Utc) + chrono::Duration::milliseconds(250)
        );
    }
}
