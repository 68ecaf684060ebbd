//! The `Crawler` capability (C4): the one boundary the worker pool calls
//! out to but never implements itself. No production HTTP client ships
//! in this crate — only the contract and a scripted test double.

use crate::errors::CrawlError;
use async_trait::async_trait;

#[derive(Clone, Debug, Default)]
pub struct WarmOptions {
    pub verify_second_request: bool,
    pub user_agent: Option<String>,
}

#[derive(Clone, Debug)]
pub struct WarmResult {
    pub status_code: u16,
    pub response_time_ms: u32,
    pub cache_status: Option<String>,
    pub redirect_url: Option<String>,
    pub second_response_time_ms: Option<u32>,
    pub second_cache_status: Option<String>,
    pub content_hash: Option<String>,
    pub body: String,
}

#[derive(Clone, Debug)]
pub struct DiscoveredLink {
    pub url: String,
}

#[derive(Clone, Debug, Default)]
pub struct RobotsFetch {
    pub crawl_delay_seconds: Option<f64>,
    pub disallow_patterns: Vec<String>,
    pub sitemap_urls: Vec<String>,
}

/// External crawling capability. Implementations live outside `bbb-core`;
/// the worker pool (C5) is generic over `Arc<dyn Crawler>`.
#[async_trait]
pub trait Crawler: Send + Sync {
    async fn warm_url(&self, url: &str, opts: &WarmOptions) -> Result<WarmResult, CrawlError>;
    async fn extract_links(&self, base_url: &str, body: &str) -> Result<Vec<DiscoveredLink>, CrawlError>;
    async fn fetch_robots(&self, domain: &str) -> Result<RobotsFetch, CrawlError>;
    async fn fetch_sitemap(&self, url: &str) -> Result<Vec<String>, CrawlError>;
}

/// Scripted test double: returns queued responses in order, falling back
/// to a default 200 once exhausted. Used by worker-pool unit tests the
/// same way the teacher exercises `BpmnLiteEngine` against `MemoryStore`
/// without any real transport.
#[derive(Default)]
pub struct NullCrawler {
    responses: tokio::sync::Mutex<std::collections::VecDeque<Result<WarmResult, CrawlError>>>,
}

impl NullCrawler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(&self, result: Result<WarmResult, CrawlError>) {
        self.responses.try_lock().unwrap().push_back(result);
    }

    fn default_ok() -> WarmResult {
        WarmResult {
            status_code: 200,
            response_time_ms: 50,
            cache_status: Some("HIT".to_string()),
            redirect_url: None,
            second_response_time_ms: None,
            second_cache_status: None,
            content_hash: None,
            body: String::new(),
        }
    }
}

#[async_trait]
impl Crawler for NullCrawler {
    async fn warm_url(&self, _url: &str, _opts: &WarmOptions) -> Result<WarmResult, CrawlError> {
        let mut queue = self.responses.lock().await;
        queue.pop_front().unwrap_or_else(|| Ok(Self::default_ok()))
    }

    async fn extract_links(&self, _base_url: &str, _body: &str) -> Result<Vec<DiscoveredLink>, CrawlError> {
        Ok(Vec::new())
    }

    async fn fetch_robots(&self, _domain: &str) -> Result<RobotsFetch, CrawlError> {
        Ok(RobotsFetch::default())
    }

    async fn fetch_sitemap(&self, _url: &str) -> Result<Vec<String>, CrawlError> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_crawler_returns_queued_responses_in_order() {
        let crawler = NullCrawler::new();
        crawler.push_response(Err(CrawlError::Blocking {
            status_code: Some(429),
            retry_after_ms: Some(1000),
        }));
        crawler.push_response(Ok(NullCrawler::default_ok()));

        let first = crawler.warm_url("https://example.com/", &WarmOptions::default()).await;
        assert!(matches!(first, Err(CrawlError::Blocking { .. })));
        let second = crawler.warm_url("https://example.com/", &WarmOptions::default()).await;
        assert!(second.is_ok());
        let third = crawler.warm_url("https://example.com/", &WarmOptions::default()).await;
        assert_eq!(third.unwrap().status_code, 200);
    }
}
