//! reqwest-backed [`Fetcher`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info, trace};

use crate::{parse_content_type, Fetcher, NetError, Request, Response, ResponseType};

/// Resource loader configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// User agent string.
    pub user_agent: String,
    /// Accept-Language header.
    pub accept_language: String,
    /// Default timeout, applied when a request has none of its own.
    pub default_timeout: Duration,
    /// Maximum redirects.
    pub max_redirects: usize,
    /// Enable cookies.
    pub cookies_enabled: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("PwaKit/{}", env!("CARGO_PKG_VERSION")),
            accept_language: "en-US,en;q=0.9".to_string(),
            default_timeout: Duration::from_secs(30),
            max_redirects: 10,
            cookies_enabled: true,
        }
    }
}

/// Resource loader for fetching URLs over HTTP.
pub struct ResourceLoader {
    client: Client,
    config: LoaderConfig,
}

impl ResourceLoader {
    /// Create a new resource loader.
    pub fn new(config: LoaderConfig) -> Result<Self, NetError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.default_timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .cookie_store(config.cookies_enabled)
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        info!(user_agent = %config.user_agent, "ResourceLoader initialized");

        Ok(Self { client, config })
    }

    /// The active configuration.
    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }
}

#[async_trait]
impl Fetcher for ResourceLoader {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        debug!(url = %request.url, method = %request.method, mode = ?request.mode, "Fetching resource");

        if !request.is_http() {
            return Err(NetError::InvalidUrl(request.url.to_string()));
        }

        let mut req_builder = self
            .client
            .request(request.method.clone(), request.url.clone());

        for (name, value) in request.headers.iter() {
            req_builder = req_builder.header(name, value);
        }

        req_builder = req_builder.header("Accept-Language", &self.config.accept_language);

        if let Some(ref referrer) = request.referrer {
            req_builder = req_builder.header("Referer", referrer.as_str());
        }

        if let Some(ref body) = request.body {
            req_builder = req_builder.body(body.clone());
        }

        if let Some(timeout) = request.timeout {
            req_builder = req_builder.timeout(timeout);
        }

        let response = req_builder.send().await.map_err(|e| {
            if e.is_timeout() {
                NetError::Timeout(request.timeout.unwrap_or(self.config.default_timeout))
            } else {
                NetError::HttpError(e)
            }
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let redirected = url != request.url;
        let response_type = ResponseType::classify(&request, &url);

        let body = response.bytes().await?;

        trace!(
            url = %url,
            status = %status,
            response_type = ?response_type,
            redirected,
            body_len = body.len(),
            "Response received"
        );

        Ok(Response {
            request_id: Some(request.id),
            content_type: parse_content_type(&headers),
            url: Some(url),
            status,
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            response_type,
            redirected,
            body,
        })
    }
}
