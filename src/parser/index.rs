use std::sync::LazyLock;

use scraper::{Html, Selector};
use url::Url;

use super::{links, text_of};
use crate::breadcrumb::{Attrs, Breadcrumb, ScrapeResult, Stage, CODE, TITLE};
use crate::error::Result;

static LETTER_LINKS: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(r#"div#alphaList a[class="btn btn-default"]"#).unwrap()
});
static ACT_LINKS: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(r#"div[class="contentBlock"] > ul > li > span[class="objTitle"] > a"#).unwrap()
});

/// Catalog page: one breadcrumb per letter button.
pub fn parse_main_page(doc: &Html, base: &Url, attrs: &Attrs) -> Result<ScrapeResult> {
    let next = attrs.with_stage(Stage::LetterPage);
    let crumbs = links(doc, &LETTER_LINKS, base)?
        .into_iter()
        .map(|(url, _, _)| Breadcrumb::new(url, next.clone()))
        .collect();
    Ok(ScrapeResult::breadcrumbs(crumbs))
}

/// Letter index: one breadcrumb per act, carrying its title and code.
pub fn parse_letter_page(doc: &Html, base: &Url, attrs: &Attrs) -> Result<ScrapeResult> {
    let crumbs = links(doc, &ACT_LINKS, base)?
        .into_iter()
        .map(|(url, href, el)| {
            let next = attrs
                .with(TITLE, text_of(&el))
                .with(CODE, code_from_href(href))
                .with_stage(Stage::ActMain);
            Breadcrumb::new(url, next)
        })
        .collect();
    Ok(ScrapeResult::breadcrumbs(crumbs))
}

/// `A-1/index.html` → `A-1`, `B-1.01.html` → `B-1.01`.
pub fn code_from_href(href: &str) -> &str {
    let segment = href.split('/').next().unwrap_or(href);
    segment.split(".html").next().unwrap_or(segment)
}
