use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;
use scraper::{Html, Selector};
use url::Url;

use super::{links, text_of};
use crate::breadcrumb::{Attrs, Breadcrumb, ScrapeResult, Stage, CODE, END, START, TITLE};
use crate::error::{Result, ScrapeError};

static VERSION_LINKS: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"main[property="mainContentOfPage"] > ul a"#).unwrap());
static RANGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^From (\d{4}-\d{2}-\d{2}) to (\d{4}-\d{2}-\d{2})").unwrap());

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionLink {
    pub url: Url,
    pub start: NaiveDate,
    /// `None` for the version currently in force.
    pub end: Option<NaiveDate>,
}

/// Point-in-time index: one breadcrumb per version, newest first.
pub fn parse_act_versions(doc: &Html, base: &Url, attrs: &Attrs) -> Result<ScrapeResult> {
    attrs.require(Stage::ActVersions, CODE)?;
    attrs.require(Stage::ActVersions, TITLE)?;

    let mut versions = Vec::new();
    for (url, _, el) in links(doc, &VERSION_LINKS, base)? {
        let text = text_of(&el);
        let (start, end) = parse_range(&text).ok_or_else(|| ScrapeError::MalformedVersionRange {
            url: base.to_string(),
            text: text.clone(),
        })?;
        versions.push(VersionLink {
            url,
            start,
            end: Some(end),
        });
    }

    let crumbs = order_versions(versions)
        .into_iter()
        .map(|v| {
            let end = v.end.map(|d| d.format(DATE_FORMAT).to_string()).unwrap_or_default();
            let next = attrs
                .with(START, v.start.format(DATE_FORMAT).to_string())
                .with(END, end)
                .with_stage(Stage::ActItem);
            Breadcrumb::new(v.url, next)
        })
        .collect();
    Ok(ScrapeResult::breadcrumbs(crumbs))
}

/// `From 2015-07-09 to 2015-07-29` → both dates.
pub fn parse_range(text: &str) -> Option<(NaiveDate, NaiveDate)> {
    let caps = RANGE_RE.captures(text)?;
    let start = NaiveDate::parse_from_str(&caps[1], DATE_FORMAT).ok()?;
    let end = NaiveDate::parse_from_str(&caps[2], DATE_FORMAT).ok()?;
    Some((start, end))
}

/// Newest start first; the newest version is the one in force, so its scraped
/// end date is dropped and a later crawl still sees it as open.
pub fn order_versions(mut versions: Vec<VersionLink>) -> Vec<VersionLink> {
    versions.sort_by(|a, b| b.start.cmp(&a.start));
    if let Some(latest) = versions.first_mut() {
        latest.end = None;
    }
    versions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breadcrumb::TYPE;
    use crate::parser::{fixtures, parse};

    fn a1_attrs() -> Attrs {
        Attrs::from([
            (CODE, "A-1"),
            (TITLE, "Access to Information Act"),
            (TYPE, "act_versions"),
        ])
    }

    #[test]
    fn versions_sorted_newest_first_with_open_end() {
        let page = fixtures::page("A-1/PITIndex.html");
        let result = parse(Stage::ActVersions, &page, &a1_attrs()).unwrap();

        assert!(result.items.is_empty());
        let crumbs = &result.breadcrumbs;
        assert_eq!(crumbs.len(), 3);

        let starts: Vec<_> = crumbs.iter().map(|c| c.attrs.get(START).unwrap()).collect();
        assert_eq!(starts, ["2016-04-05", "2015-07-30", "2015-07-09"]);
        let ends: Vec<_> = crumbs.iter().map(|c| c.attrs.get(END).unwrap()).collect();
        assert_eq!(ends, ["", "2016-04-04", "2015-07-29"]);

        assert!(crumbs[0].url.ends_with("A-1/20160405/P1TT3xt3.html"));
        assert!(crumbs[1].url.ends_with("A-1/20150730/P1TT3xt3.html"));
        assert!(crumbs[2].url.ends_with("A-1/20150709/P1TT3xt3.html"));
        assert!(crumbs.iter().all(|c| c.attrs.get(CODE) == Some("A-1")));
        assert!(crumbs
            .iter()
            .all(|c| c.attrs.get(TITLE) == Some("Access to Information Act")));
        assert!(crumbs.iter().all(|c| c.attrs.get(TYPE) == Some("act_item")));
    }

    #[test]
    fn latest_is_by_date_not_document_order() {
        let page = fixtures::inline(
            "http://laws-lois.justice.gc.ca/eng/acts/X-9/PITIndex.html",
            r#"<main property="mainContentOfPage"><ul>
                <li><a href="20120101/P1TT3xt3.html">From 2012-01-01 to 2012-12-31</a></li>
                <li><a href="20140101/P1TT3xt3.html">From 2014-01-01 to 2014-06-30</a></li>
                <li><a href="20130101/P1TT3xt3.html">From 2013-01-01 to 2013-12-31</a></li>
            </ul></main>"#,
        );
        let result = parse(Stage::ActVersions, &page, &a1_attrs()).unwrap();
        let pairs: Vec<_> = result
            .breadcrumbs
            .iter()
            .map(|c| (c.attrs.get(START).unwrap(), c.attrs.get(END).unwrap()))
            .collect();
        assert_eq!(
            pairs,
            [
                ("2014-01-01", ""),
                ("2013-01-01", "2013-12-31"),
                ("2012-01-01", "2012-12-31"),
            ]
        );
    }

    #[test]
    fn malformed_range_is_fatal() {
        let page = fixtures::inline(
            "http://laws-lois.justice.gc.ca/eng/acts/X-9/PITIndex.html",
            r#"<main property="mainContentOfPage"><ul>
                <li><a href="20140101/P1TT3xt3.html">From 2014-01-01 to 2014-06-30</a></li>
                <li><a href="current/P1TT3xt3.html">Current version</a></li>
            </ul></main>"#,
        );
        let err = parse(Stage::ActVersions, &page, &a1_attrs()).unwrap_err();
        match err {
            ScrapeError::MalformedVersionRange { url, text } => {
                assert!(url.ends_with("X-9/PITIndex.html"));
                assert_eq!(text, "Current version");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn impossible_dates_do_not_parse() {
        assert!(parse_range("From 2015-02-30 to 2015-03-01").is_none());
        assert!(parse_range("from 2015-02-01 to 2015-03-01").is_none());
        assert!(parse_range("From 2015-02-01 to 2015-03-01 [Previous Version]").is_some());
    }

    #[test]
    fn no_versions_no_breadcrumbs() {
        let page = fixtures::inline(
            "http://laws-lois.justice.gc.ca/eng/acts/X-9/PITIndex.html",
            r#"<main property="mainContentOfPage"><ul></ul></main>"#,
        );
        assert!(parse(Stage::ActVersions, &page, &a1_attrs()).unwrap().is_empty());
    }
}
