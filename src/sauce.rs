use lazy_static::lazy_static;
use regex::Regex;
use reqwest::Client as HttpClient;
use serde::Deserialize;
use serenity::async_trait;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::SauceError;
use crate::host::{EmbedCard, EmbedField, InboundMessage};
use crate::rate_limiter::RateLimiter;

// API endpoints
const SAUCENAO_API_URL: &str = "https://saucenao.com/search.php";
const SAUCENAO_WEB_URL: &str = "https://saucenao.com/search.php";

const MAX_SOURCE_FIELDS: usize = 2;

lazy_static! {
    static ref IMAGE_URL_REGEX: Regex =
        Regex::new(r"(?i)https?://[^\s<>]+?\.(?:jpe?g|png|webp)(?:\?[^\s<>]*)?").unwrap();
}

/// The best match the search service found for one image.
#[derive(Debug, Clone, PartialEq)]
pub struct SauceResult {
    pub title: String,
    pub author: String,
    pub similarity: f64,
    pub source_urls: Vec<String>,
    pub thumbnail_url: Option<String>,
}

#[async_trait]
pub trait ReverseSearch: Send + Sync {
    async fn lookup(&self, image_url: &str) -> Result<SauceResult, SauceError>;

    /// A link a human can open to see the full result list.
    fn search_link(&self, image_url: &str) -> String {
        format!("{}?url={}", SAUCENAO_WEB_URL, urlencoding::encode(image_url))
    }
}

#[derive(Debug, Deserialize)]
struct SauceResponse {
    header: SauceResponseHeader,
    #[serde(default)]
    results: Vec<SauceEntry>,
}

#[derive(Debug, Deserialize)]
struct SauceResponseHeader {
    #[serde(default)]
    status: i64,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SauceEntry {
    header: SauceEntryHeader,
    data: SauceEntryData,
}

#[derive(Debug, Deserialize)]
struct SauceEntryHeader {
    similarity: String,
    thumbnail: Option<String>,
    #[serde(default)]
    index_name: String,
}

#[derive(Debug, Default, Deserialize)]
struct SauceEntryData {
    #[serde(default)]
    ext_urls: Vec<String>,
    title: Option<String>,
    eng_name: Option<String>,
    source: Option<String>,
    material: Option<String>,
    member_name: Option<String>,
    author_name: Option<String>,
    /// A plain string on most indexes, a list of names on booru indexes.
    creator: Option<serde_json::Value>,
}

impl SauceEntryData {
    fn title(&self) -> Option<String> {
        [&self.title, &self.eng_name, &self.source, &self.material]
            .into_iter()
            .flatten()
            .find(|s| !s.trim().is_empty())
            .cloned()
    }

    fn author(&self) -> Option<String> {
        if let Some(name) = [&self.member_name, &self.author_name]
            .into_iter()
            .flatten()
            .find(|s| !s.trim().is_empty())
        {
            return Some(name.clone());
        }
        match &self.creator {
            Some(serde_json::Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(serde_json::Value::Array(names)) => {
                let names: Vec<&str> = names.iter().filter_map(|n| n.as_str()).collect();
                if names.is_empty() {
                    None
                } else {
                    Some(names.join(", "))
                }
            }
            _ => None,
        }
    }
}

pub struct SauceNaoClient {
    http_client: HttpClient,
    api_key: String,
    endpoint: String,
    min_similarity: f64,
    rate_limiter: RateLimiter,
}

impl SauceNaoClient {
    pub fn new(
        api_key: String,
        endpoint: Option<String>,
        min_similarity: f64,
        rate_limiter: RateLimiter,
    ) -> Result<Self, SauceError> {
        let http_client = HttpClient::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            http_client,
            api_key,
            endpoint: endpoint.unwrap_or_else(|| SAUCENAO_API_URL.to_string()),
            min_similarity,
            rate_limiter,
        })
    }
}

#[async_trait]
impl ReverseSearch for SauceNaoClient {
    async fn lookup(&self, image_url: &str) -> Result<SauceResult, SauceError> {
        self.rate_limiter.acquire().await?;
        let (window_used, window_limit, day_used, day_limit) = self.rate_limiter.usage().await;
        debug!(
            "SauceNAO usage: {}/{} in the current window, {}/{} today",
            window_used, window_limit, day_used, day_limit
        );

        info!("Looking up image source for {}", image_url);
        let response = self
            .http_client
            .get(&self.endpoint)
            .query(&[
                ("output_type", "2"),
                ("numres", "3"),
                ("db", "999"),
                ("api_key", self.api_key.as_str()),
                ("url", image_url),
            ])
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(SauceError::RateLimited("the search service refused the request".to_string()));
        }
        if !status.is_success() {
            return Err(SauceError::Api(format!("HTTP {}", status)));
        }

        let body: SauceResponse = response.json().await?;
        parse_best_result(body, self.min_similarity)
    }
}

fn parse_best_result(body: SauceResponse, min_similarity: f64) -> Result<SauceResult, SauceError> {
    if body.header.status != 0 {
        return Err(SauceError::Api(
            body.header
                .message
                .unwrap_or_else(|| format!("status {}", body.header.status)),
        ));
    }

    let mut best: Option<SauceResult> = None;
    for entry in body.results {
        let similarity = entry.header.similarity.parse::<f64>().unwrap_or(0.0);
        if similarity < min_similarity {
            debug!("Skipping result from {} at {}%", entry.header.index_name, similarity);
            continue;
        }
        if best.as_ref().is_some_and(|b| b.similarity >= similarity) {
            continue;
        }
        best = Some(SauceResult {
            title: entry.data.title().unwrap_or_else(|| entry.header.index_name.clone()),
            author: entry.data.author().unwrap_or_default(),
            similarity,
            source_urls: entry.data.ext_urls.clone(),
            thumbnail_url: entry.header.thumbnail.clone(),
        });
    }
    best.ok_or(SauceError::NoResults)
}

/// Attachment urls that look like images, then inline image links, without duplicates.
pub fn extract_image_urls(msg: &InboundMessage) -> Vec<String> {
    let mut urls: Vec<String> = Vec::new();
    for attachment in &msg.attachments {
        let is_image = attachment
            .content_type
            .as_deref()
            .is_some_and(|ct| ct.starts_with("image/"))
            || IMAGE_URL_REGEX.is_match(&attachment.url);
        if is_image && !urls.contains(&attachment.url) {
            urls.push(attachment.url.clone());
        }
    }
    for found in IMAGE_URL_REGEX.find_iter(&msg.content) {
        let url = found.as_str().to_string();
        if !urls.contains(&url) {
            urls.push(url);
        }
    }
    urls
}

/// Short site name for a source link, e.g. `Danbooru` for `https://danbooru.donmai.us/posts/1`.
pub fn source_label(link: &str) -> String {
    let host = url::Url::parse(link)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_default();
    let labels: Vec<&str> = host
        .split('.')
        .filter(|l| !l.is_empty())
        .skip_while(|l| *l == "www" || *l == "m")
        .collect();
    let name = labels.first().copied().unwrap_or("Source");
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => "Source".to_string(),
    }
}

pub fn format_embed(result: &SauceResult, search_link: String, colour: u32) -> EmbedCard {
    let title = if result.author.is_empty() {
        format!("{} ({:.1}%)", result.title, result.similarity)
    } else {
        format!("{} by {} ({:.1}%)", result.title, result.author, result.similarity)
    };
    let inline = result.source_urls.len() > 1;
    let fields = result
        .source_urls
        .iter()
        .take(MAX_SOURCE_FIELDS)
        .map(|link| EmbedField {
            name: source_label(link),
            value: format!("[Source]({})", link),
            inline,
        })
        .collect();
    EmbedCard {
        title,
        url: Some(search_link),
        colour,
        thumbnail: result.thumbnail_url.clone(),
        fields,
    }
}
