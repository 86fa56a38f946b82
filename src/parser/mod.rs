pub mod act;
pub mod index;
pub mod versions;

use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::breadcrumb::{Attrs, ScrapeResult, Stage};
use crate::error::Result;
use crate::fetch::FetchedPage;

/// Run the parser for `stage` over a fetched page.
pub fn parse(stage: Stage, page: &FetchedPage, attrs: &Attrs) -> Result<ScrapeResult> {
    let doc = Html::parse_document(&page.body);
    let base = &page.url;
    match stage {
        Stage::MainPage => index::parse_main_page(&doc, base, attrs),
        Stage::LetterPage => index::parse_letter_page(&doc, base, attrs),
        Stage::ActMain => act::parse_act_main(&doc, base, attrs),
        Stage::ActVersions => versions::parse_act_versions(&doc, base, attrs),
        Stage::ActItem => act::parse_act_item(&doc, base, attrs),
    }
}

/// Elements matching `selector` that carry an `href`, resolved against `base`.
fn links<'a>(
    doc: &'a Html,
    selector: &'a Selector,
    base: &Url,
) -> Result<Vec<(Url, &'a str, ElementRef<'a>)>> {
    let mut out = Vec::new();
    for el in doc.select(selector) {
        let Some(href) = el.value().attr("href") else {
            continue;
        };
        out.push((base.join(href)?, href, el));
    }
    Ok(out)
}

fn text_of(el: &ElementRef) -> String {
    el.text().collect::<String>().trim().to_string()
}
