use std::sync::LazyLock;

use scraper::{Html, Selector};
use tracing::{info, warn};
use url::Url;

use super::links;
use crate::breadcrumb::{ActItem, Attrs, Breadcrumb, ScrapeResult, Stage, CODE, END, START, TITLE};
use crate::error::Result;

static PIT_INDEX_LINK: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("p#assentedDate > a").unwrap());
static CONTENT: LazyLock<Selector> = LazyLock::new(|| Selector::parse("div#wb-cont").unwrap());

/// Act landing page: follow the link to the point-in-time index.
pub fn parse_act_main(doc: &Html, base: &Url, attrs: &Attrs) -> Result<ScrapeResult> {
    attrs.require(Stage::ActMain, CODE)?;
    attrs.require(Stage::ActMain, TITLE)?;

    let next = attrs.with_stage(Stage::ActVersions);
    let crumbs = links(doc, &PIT_INDEX_LINK, base)?
        .into_iter()
        .map(|(url, _, _)| Breadcrumb::new(url, next.clone()))
        .collect();
    Ok(ScrapeResult::breadcrumbs(crumbs))
}

/// Full text of one version. Terminal: never yields breadcrumbs.
pub fn parse_act_item(doc: &Html, base: &Url, attrs: &Attrs) -> Result<ScrapeResult> {
    let stage = Stage::ActItem;
    let code = attrs.require(stage, CODE)?;
    let title = attrs.require(stage, TITLE)?;
    let start = attrs.require(stage, START)?;
    let end = attrs.require(stage, END)?;

    let items: Vec<ActItem> = doc
        .select(&CONTENT)
        .map(|node| ActItem {
            code: code.to_string(),
            title: title.to_string(),
            start: start.to_string(),
            end: end.to_string(),
            body: node.html(),
        })
        .collect();

    if items.is_empty() {
        warn!(url = %base, code, start, "No document body on version page");
    }
    for item in &items {
        info!(code = %item.code, start = %item.start, "Scraped item");
    }
    Ok(ScrapeResult::items(items))
}
