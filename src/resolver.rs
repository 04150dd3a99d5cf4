use reqwest::StatusCode;
use scraper::{Html, Selector};
use tracing::debug;
use url::Url;

use crate::error::ResolveError;
use crate::net::TrustedDialer;
use crate::playback::MediaSource;
use crate::types::{Episode, MediaCandidate, RenditionListing};

const VIDEO_SOURCE_ATTR: &str = "data-video-src";

#[derive(Clone)]
pub struct VideoResolver {
    dialer: TrustedDialer,
}

impl VideoResolver {
    pub fn new(dialer: TrustedDialer) -> Self {
        Self { dialer }
    }

    pub async fn resolve_page(&self, page_url: &str) -> Result<String, ResolveError> {
        let response = self.dialer.get(page_url).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ResolveError::Status {
                url: page_url.to_string(),
                status,
            });
        }
        let html = response
            .text()
            .await
            .map_err(|err| ResolveError::Network(self.dialer.classify(err)))?;
        let source = extract_video_source(&html)
            .ok_or_else(|| ResolveError::NotFound(page_url.to_string()))?;
        let resolved = join_url(page_url, &source)?;
        debug!(page = page_url, source = %resolved, "found rendition listing");
        Ok(resolved)
    }

    pub async fn resolve_media(&self, source_url: &str) -> Result<String, ResolveError> {
        let response = self.dialer.get(source_url).await?;
        let status = response.status();
        if status != StatusCode::OK {
            return Err(ResolveError::Status {
                url: source_url.to_string(),
                status,
            });
        }
        let body = response
            .bytes()
            .await
            .map_err(|err| ResolveError::Network(self.dialer.classify(err)))?;
        let listing: RenditionListing =
            serde_json::from_slice(&body).map_err(|err| ResolveError::Parse {
                url: source_url.to_string(),
                reason: err.to_string(),
            })?;
        let best = select_highest_quality(&listing.data)
            .ok_or_else(|| ResolveError::NoCandidates(source_url.to_string()))?;
        debug!(label = %best.label, src = %best.src, candidates = listing.data.len(), "selected rendition");
        Ok(best.src.clone())
    }

    pub async fn resolve_episode(&self, page_url: &str) -> Result<String, ResolveError> {
        let source = self.resolve_page(page_url).await?;
        self.resolve_media(&source).await
    }
}

impl MediaSource for VideoResolver {
    async fn media_url(&self, episode: &Episode) -> Result<String, ResolveError> {
        self.resolve_episode(&episode.source_ref).await
    }
}

fn join_url(base: &str, reference: &str) -> Result<String, ResolveError> {
    let parse_err = |err: url::ParseError| ResolveError::Parse {
        url: base.to_string(),
        reason: format!("bad video source '{reference}': {err}"),
    };
    let base = Url::parse(base).map_err(parse_err)?;
    Ok(base.join(reference).map_err(parse_err)?.to_string())
}

pub fn extract_video_source(html: &str) -> Option<String> {
    let doc = Html::parse_document(html);
    let video = Selector::parse("video[data-video-src]").expect("valid CSS selector");
    let container = Selector::parse("div[data-video-src]").expect("valid CSS selector");
    doc.select(&video)
        .next()
        .or_else(|| doc.select(&container).next())
        .and_then(|el| el.value().attr(VIDEO_SOURCE_ATTR))
        .map(str::trim)
        .filter(|src| !src.is_empty())
        .map(str::to_string)
}

pub fn quality_value(label: &str) -> u32 {
    label
        .trim()
        .trim_end_matches(['p', 'P'])
        .trim()
        .parse()
        .unwrap_or(0)
}

pub fn is_higher_quality(candidate: &str, current: &str) -> bool {
    quality_value(candidate) > quality_value(current)
}

// On ties the earliest candidate is kept.
pub fn select_highest_quality(candidates: &[MediaCandidate]) -> Option<&MediaCandidate> {
    let mut best: Option<&MediaCandidate> = None;
    for candidate in candidates {
        match best {
            Some(current) if !is_higher_quality(&candidate.label, &current.label) => {}
            _ => best = Some(candidate),
        }
    }
    best
}
