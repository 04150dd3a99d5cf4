use std::sync::LazyLock;

use anyhow::{Context, Result, bail};
use regex::Regex;
use scraper::{Html, Selector};
use tracing::{debug, warn};
use url::Url;

use crate::net::TrustedDialer;
use crate::types::{Episode, ShowCandidate};

const MAX_SEARCH_PAGES: usize = 10;

static ORDINAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+").expect("valid ordinal pattern"));

pub trait Catalog {
    async fn search(&self, query: &str) -> Result<Vec<ShowCandidate>>;
    async fn list_episodes(&self, show_url: &str) -> Result<Vec<Episode>>;
}

pub struct AnimeFireCatalog {
    dialer: TrustedDialer,
    base_url: Url,
}

impl AnimeFireCatalog {
    pub fn new(dialer: TrustedDialer, base_url: &str) -> Result<Self> {
        let base_url =
            Url::parse(base_url).with_context(|| format!("invalid catalog URL '{base_url}'"))?;
        Ok(Self { dialer, base_url })
    }

    async fn fetch_html(&self, url: &str) -> Result<String> {
        let response = self.dialer.get(url).await?;
        if !response.status().is_success() {
            bail!("{} answered with status {}", url, response.status());
        }
        response
            .text()
            .await
            .with_context(|| format!("failed to read {url}"))
    }
}

impl Catalog for AnimeFireCatalog {
    async fn search(&self, query: &str) -> Result<Vec<ShowCandidate>> {
        let mut page_url = self
            .base_url
            .join(&format!("pesquisar/{}", normalize_query(query)))
            .context("failed to build search URL")?;

        for _ in 0..MAX_SEARCH_PAGES {
            let html = self.fetch_html(page_url.as_str()).await?;
            let page = parse_search_page(&html);
            if !page.shows.is_empty() {
                let shows = page
                    .shows
                    .into_iter()
                    .filter_map(|show| absolutize(&page_url, show))
                    .collect();
                return Ok(shows);
            }
            let Some(next) = page.next else { break };
            debug!(next = %next, "no results on this page, following pagination");
            page_url = page_url
                .join(&next)
                .with_context(|| format!("invalid pagination link '{next}'"))?;
        }
        Ok(Vec::new())
    }

    async fn list_episodes(&self, show_url: &str) -> Result<Vec<Episode>> {
        let html = self.fetch_html(show_url).await?;
        let base = Url::parse(show_url).with_context(|| format!("invalid show URL '{show_url}'"))?;
        let episodes = parse_episode_list(&html)
            .into_iter()
            .filter_map(|ep| match base.join(&ep.source_ref) {
                Ok(url) => Some(Episode {
                    source_ref: url.to_string(),
                    ..ep
                }),
                Err(err) => {
                    warn!(label = %ep.label, error = %err, "skipping episode with a bad link");
                    None
                }
            })
            .collect();
        Ok(episodes)
    }
}

fn absolutize(base: &Url, show: ShowCandidate) -> Option<ShowCandidate> {
    match base.join(&show.url) {
        Ok(url) => Some(ShowCandidate {
            url: url.to_string(),
            ..show
        }),
        Err(err) => {
            warn!(name = %show.name, error = %err, "skipping result with a bad link");
            None
        }
    }
}

#[derive(Debug, Default)]
pub struct SearchPage {
    pub shows: Vec<ShowCandidate>,
    pub next: Option<String>,
}

pub fn parse_search_page(html: &str) -> SearchPage {
    let doc = Html::parse_document(html);
    let result_sel = Selector::parse(".row.ml-1.mr-1 a").expect("valid CSS selector");
    let next_sel = Selector::parse(".pagination .next a").expect("valid CSS selector");

    let shows = doc
        .select(&result_sel)
        .filter_map(|link| {
            let url = link.value().attr("href")?.trim();
            let name = link.text().collect::<String>().trim().to_string();
            if url.is_empty() || name.is_empty() {
                return None;
            }
            Some(ShowCandidate {
                name,
                url: url.to_string(),
            })
        })
        .collect();
    let next = doc
        .select(&next_sel)
        .next()
        .and_then(|el| el.value().attr("href"))
        .map(str::trim)
        .filter(|href| !href.is_empty())
        .map(str::to_string);

    SearchPage { shows, next }
}

pub fn parse_episode_list(html: &str) -> Vec<Episode> {
    let doc = Html::parse_document(html);
    let sel = Selector::parse("a.lEp.epT.divNumEp.smallbox.px-2.mx-1.text-left.d-flex")
        .expect("valid CSS selector");

    let mut episodes = Vec::new();
    for link in doc.select(&sel) {
        let label = link.text().collect::<String>().trim().to_string();
        let Some(href) = link.value().attr("href").map(str::trim) else {
            continue;
        };
        let Some(ordinal) = parse_ordinal(&label) else {
            warn!(%label, "could not parse episode number");
            continue;
        };
        episodes.push(Episode::new(label, ordinal, href));
    }
    sort_episodes(&mut episodes);
    episodes
}

pub fn parse_ordinal(label: &str) -> Option<u32> {
    ORDINAL_RE.find(label)?.as_str().parse().ok()
}

pub fn sort_episodes(episodes: &mut [Episode]) {
    episodes.sort_by_key(|ep| ep.ordinal);
}

pub fn normalize_query(query: &str) -> String {
    query.trim().to_lowercase().replace(' ', "-")
}

pub fn show_slug(show_url: &str) -> String {
    let segment = match Url::parse(show_url) {
        Ok(url) => url
            .path_segments()
            .and_then(|mut segments| segments.rfind(|s| !s.is_empty()).map(str::to_string))
            .unwrap_or_default(),
        Err(_) => show_url.to_string(),
    };
    let cleaned: String = segment
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|ch| ch == '.') {
        String::from("unknown")
    } else {
        cleaned
    }
}
