//! Hugging Face Hub REST client

use super::{RegistryClient, RegistryPage};
use crate::config::RegistryConfig;
use crate::error::{Error, Result};
use crate::models::{Popularity, ResourceRecord, ResourceType};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::header::{HeaderMap, AUTHORIZATION, LINK, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Listing entry for models, datasets and spaces
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HubEntry {
    #[serde(alias = "modelId")]
    id: String,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    downloads: Option<u64>,
    #[serde(default)]
    likes: Option<u64>,
    #[serde(default)]
    last_modified: Option<DateTime<Utc>>,
    #[serde(default)]
    card_data: Option<CardData>,
    #[serde(default, rename = "pipeline_tag")]
    pipeline_tag: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CardData {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    short_description: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

/// Entry of the daily papers feed
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DailyPaper {
    paper: PaperBody,
    #[serde(default)]
    published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaperBody {
    id: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    authors: Vec<PaperAuthor>,
    #[serde(default)]
    upvotes: Option<u64>,
    #[serde(default)]
    published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct PaperAuthor {
    #[serde(default)]
    name: Option<String>,
}

fn next_link_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"<([^>]+)>\s*;\s*rel="?next"?"#).ok())
        .as_ref()
}

/// Extract the `rel="next"` target from a `Link` header
pub(crate) fn parse_next_link(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(LINK)?.to_str().ok()?;
    next_link_regex()?
        .captures(value)
        .map(|caps| caps[1].to_string())
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn classify_status(status: StatusCode, headers: &HeaderMap, url: &str) -> Error {
    match status {
        StatusCode::TOO_MANY_REQUESTS => Error::RateLimited {
            retry_after: parse_retry_after(headers),
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Error::Unauthorized(format!("HTTP {} from {}", status, url))
        }
        s if s.is_server_error() || s == StatusCode::REQUEST_TIMEOUT => {
            Error::TransientIo(format!("HTTP {} from {}", status, url))
        }
        _ => Error::Fatal(format!("HTTP {} from {}", status, url)),
    }
}

fn classify_transport(err: reqwest::Error) -> Error {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        Error::TransientIo(err.to_string())
    } else {
        Error::Fatal(err.to_string())
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn entry_to_record(resource_type: ResourceType, raw: Value) -> Result<ResourceRecord> {
    let entry: HubEntry = serde_json::from_value(raw)
        .map_err(|e| Error::DataIntegrity(format!("Malformed {} entry: {}", resource_type, e)))?;
    if entry.id.trim().is_empty() {
        return Err(Error::DataIntegrity(format!(
            "{} entry without an id",
            resource_type
        )));
    }

    let mut record = ResourceRecord::new(resource_type, entry.id.trim());
    if let Some(author) = non_empty(entry.author) {
        record.author = author;
    }
    let card = entry.card_data.unwrap_or_default();
    if let Some(title) = non_empty(card.title) {
        record.display_name = title;
    }
    record.description = non_empty(entry.description)
        .or_else(|| non_empty(card.short_description))
        .or_else(|| non_empty(card.description))
        .or_else(|| non_empty(entry.pipeline_tag))
        .unwrap_or_default();
    record.tags = entry
        .tags
        .into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    record.popularity = Popularity {
        downloads: entry.downloads.unwrap_or(0),
        likes: entry.likes.unwrap_or(0),
    };
    record.upstream_last_modified = entry.last_modified;
    record.refresh_hash();
    Ok(record)
}

fn paper_to_record(raw: Value) -> Result<ResourceRecord> {
    let entry: DailyPaper = serde_json::from_value(raw)
        .map_err(|e| Error::DataIntegrity(format!("Malformed paper entry: {}", e)))?;
    let paper = entry.paper;
    if paper.id.trim().is_empty() {
        return Err(Error::DataIntegrity("paper entry without an id".to_string()));
    }

    let mut record = ResourceRecord::new(ResourceType::Paper, paper.id.trim());
    record.author = paper
        .authors
        .into_iter()
        .find_map(|a| non_empty(a.name))
        .unwrap_or_default();
    if let Some(title) = non_empty(paper.title) {
        record.display_name = title;
    }
    record.description = non_empty(paper.summary).unwrap_or_default();
    record.popularity = Popularity {
        downloads: 0,
        likes: paper.upvotes.unwrap_or(0),
    };
    record.upstream_last_modified = paper.published_at.or(entry.published_at);
    record.refresh_hash();
    Ok(record)
}

/// Client for the public Hub listing API
pub struct HubClient {
    client: Client,
    base_url: Url,
    page_size: usize,
    token: Option<String>,
}

impl HubClient {
    pub fn new(config: &RegistryConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout())
            .gzip(true)
            .brotli(true)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: Url::parse(&config.base_url)?,
            page_size: config.page_size.max(1),
            token: config.token(),
        })
    }

    fn first_page_url(&self, resource_type: ResourceType) -> Result<Url> {
        let path = match resource_type {
            ResourceType::Model => "/api/models",
            ResourceType::Dataset => "/api/datasets",
            ResourceType::Space => "/api/spaces",
            ResourceType::Paper => "/api/daily_papers",
        };
        let mut url = self.base_url.join(path)?;
        let limit = self.page_size.to_string();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("limit", &limit);
            match resource_type {
                ResourceType::Paper => {
                    query.append_pair("p", "0");
                }
                _ => {
                    query
                        .append_pair("sort", "downloads")
                        .append_pair("direction", "-1")
                        .append_pair("full", "true");
                }
            }
        }
        Ok(url)
    }

    /// Papers paginate by page number rather than a `Link` header
    fn next_paper_url(&self, current: &Url, returned: usize) -> Option<String> {
        if returned < self.page_size {
            return None;
        }
        let page = current
            .query_pairs()
            .find(|(k, _)| k == "p")
            .and_then(|(_, v)| v.parse::<u64>().ok())
            .unwrap_or(0);
        let mut next = current.clone();
        let pairs: Vec<(String, String)> = current
            .query_pairs()
            .filter(|(k, _)| k != "p")
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        {
            let mut query = next.query_pairs_mut();
            query.clear();
            for (k, v) in &pairs {
                query.append_pair(k, v);
            }
            query.append_pair("p", &(page + 1).to_string());
        }
        Some(next.to_string())
    }
}

#[async_trait]
impl RegistryClient for HubClient {
    async fn list_page(
        &self,
        resource_type: ResourceType,
        cursor: Option<&str>,
    ) -> Result<RegistryPage> {
        let url = match cursor {
            Some(next) => Url::parse(next)
                .map_err(|e| Error::Fatal(format!("Invalid page cursor '{}': {}", next, e)))?,
            None => self.first_page_url(resource_type)?,
        };
        debug!("Fetching {} page: {}", resource_type, url);

        let mut request = self.client.get(url.clone());
        if let Some(token) = &self.token {
            request = request.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        let response = request.send().await.map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let err = classify_status(status, response.headers(), url.as_str());
            warn!(%status, resource_type = %resource_type, "Registry request failed");
            return Err(err);
        }

        let link_next = parse_next_link(response.headers());
        let body: Value = response.json().await.map_err(classify_transport)?;
        let Value::Array(raw_items) = body else {
            return Err(Error::TransientIo(format!(
                "Expected a JSON array from {}",
                url
            )));
        };

        let returned = raw_items.len();
        let items: Vec<Result<ResourceRecord>> = raw_items
            .into_iter()
            .map(|raw| match resource_type {
                ResourceType::Paper => paper_to_record(raw),
                other => entry_to_record(other, raw),
            })
            .collect();

        let next_cursor = match resource_type {
            ResourceType::Paper => self.next_paper_url(&url, returned),
            _ => link_next,
        };
        Ok(RegistryPage { items, next_cursor })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(base: &str, page_size: usize) -> RegistryConfig {
        RegistryConfig {
            base_url: base.to_string(),
            page_size,
            token_env: String::new(),
            ..RegistryConfig::default()
        }
    }

    #[test]
    fn test_parse_next_link() {
        let mut headers = HeaderMap::new();
        headers.insert(
            LINK,
            HeaderValue::from_static(
                "<https://huggingface.co/api/models?cursor=abc&limit=2>; rel=\"next\"",
            ),
        );
        assert_eq!(
            parse_next_link(&headers).as_deref(),
            Some("https://huggingface.co/api/models?cursor=abc&limit=2")
        );
        assert_eq!(parse_next_link(&HeaderMap::new()), None);
    }

    #[test]
    fn test_entry_mapping() {
        let record = entry_to_record(
            ResourceType::Model,
            json!({
                "id": "Nymbo/tiny-llm",
                "author": "Nymbo",
                "tags": ["gguf", " llm ", ""],
                "downloads": 42,
                "likes": 3,
                "lastModified": "2024-05-01T10:00:00.000Z",
                "pipeline_tag": "text-generation"
            }),
        )
        .unwrap();
        assert_eq!(record.author, "Nymbo");
        assert_eq!(record.display_name, "tiny-llm");
        assert_eq!(record.description, "text-generation");
        assert_eq!(record.tags.len(), 2);
        assert!(record.tags.contains("llm"));
        assert_eq!(record.popularity.downloads, 42);
        assert!(record.upstream_last_modified.is_some());
        assert_eq!(record.content_hash, record.compute_content_hash());
    }

    #[test]
    fn test_malformed_entry_is_data_integrity() {
        let err = entry_to_record(ResourceType::Dataset, json!({"likes": "many"})).unwrap_err();
        assert!(matches!(err, Error::DataIntegrity(_)));
    }

    #[tokio::test]
    async fn test_list_page_follows_link_and_keeps_bad_items_inline() {
        let server = MockServer::start().await;
        let next = format!("{}/api/models?cursor=page2", server.uri());
        Mock::given(method("GET"))
            .and(path("/api/models"))
            .and(query_param("sort", "downloads"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("link", format!("<{}>; rel=\"next\"", next).as_str())
                    .set_body_json(json!([
                        {"id": "a/one", "tags": []},
                        {"tags": "not-a-list"}
                    ])),
            )
            .mount(&server)
            .await;

        let client = HubClient::new(&config(&server.uri(), 2)).unwrap();
        let page = client.list_page(ResourceType::Model, None).await.unwrap();
        assert_eq!(page.items.len(), 2);
        assert!(page.items[0].is_ok());
        assert!(matches!(page.items[1], Err(Error::DataIntegrity(_))));
        assert_eq!(page.next_cursor.as_deref(), Some(next.as_str()));
    }

    #[tokio::test]
    async fn test_status_classification() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/datasets"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/spaces"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/models"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let client = HubClient::new(&config(&server.uri(), 10)).unwrap();
        match client.list_page(ResourceType::Dataset, None).await {
            Err(Error::RateLimited { retry_after }) => {
                assert_eq!(retry_after, Some(Duration::from_secs(7)))
            }
            other => panic!("expected rate limit, got {:?}", other),
        }
        assert!(matches!(
            client.list_page(ResourceType::Space, None).await,
            Err(Error::Unauthorized(_))
        ));
        assert!(matches!(
            client.list_page(ResourceType::Model, None).await,
            Err(Error::TransientIo(_))
        ));
    }

    #[tokio::test]
    async fn test_papers_paginate_by_page_number() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/daily_papers"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"paper": {"id": "2401.00001", "title": "Tiny LLMs", "summary": "s",
                           "authors": [{"name": "Ada"}], "upvotes": 5}},
                {"paper": {"id": "2401.00002", "title": "Other"}}
            ])))
            .mount(&server)
            .await;

        let client = HubClient::new(&config(&server.uri(), 2)).unwrap();
        let page = client.list_page(ResourceType::Paper, None).await.unwrap();
        let first = page.items[0].as_ref().unwrap();
        assert_eq!(first.display_name, "Tiny LLMs");
        assert_eq!(first.author, "Ada");
        let cursor = page.next_cursor.unwrap();
        assert!(cursor.contains("p=1"));
    }
}
