use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, REFERER, TRANSFER_ENCODING, USER_AGENT};
use reqwest::{Client, Method, RequestBuilder, Response};
use tracing::{debug, warn};

use super::{LoadError, HeadInfo, RemoteBody, RequestHeaders, SourceLoader};

/// HTTP-based loader with connection pooling, retries, and backoff.
#[derive(Debug, Clone)]
pub struct HttpLoader {
    client: Client,
    max_retries: u32,
    base_backoff: Duration,
}

impl HttpLoader {
    pub fn new(timeout: Duration, max_retries: u32, base_backoff: Duration) -> Self {
        let client = Self::build_client(timeout);
        Self {
            client,
            max_retries,
            base_backoff,
        }
    }

    pub fn with_client(client: Client, max_retries: u32, base_backoff: Duration) -> Self {
        Self {
            client,
            max_retries,
            base_backoff,
        }
    }

    pub fn from_config(config: &crate::config::GrabConfig) -> Self {
        Self::new(config.request_timeout, config.max_retries, config.retry_backoff)
    }

    pub fn build_client(timeout: Duration) -> Client {
        Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(5))
            .pool_max_idle_per_host(20)
            .gzip(true)
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "Falling back to default HTTP client");
                Client::new()
            })
    }

    fn request(&self, method: Method, url: &str, headers: &RequestHeaders) -> RequestBuilder {
        let mut req = self
            .client
            .request(method, url)
            .header(USER_AGENT, headers.user_agent.as_str());
        if let Some(ref referer) = headers.referer {
            req = req.header(REFERER, referer.as_str());
        }
        for (name, value) in &headers.extra {
            req = req.header(name.as_str(), value.as_str());
        }
        req
    }

    async fn send_with_retry(
        &self,
        method: Method,
        url: &str,
        headers: &RequestHeaders,
    ) -> Result<Response, LoadError> {
        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            let is_last = attempt == self.max_retries;

            if attempt > 0 {
                let backoff = self.base_backoff * 2u32.saturating_pow(attempt - 1);
                debug!(url, attempt, backoff_ms = backoff.as_millis(), "Retrying fetch");
                tokio::time::sleep(backoff).await;
            }

            match self.request(method.clone(), url, headers).send().await {
                Ok(response) => {
                    if response.status().is_success() {
                        return Ok(response);
                    }
                    let status = response.status().as_u16();
                    let message = response
                        .status()
                        .canonical_reason()
                        .unwrap_or("Unknown")
                        .to_string();
                    warn!(url, status, attempt, "Fetch returned error status");
                    let err = LoadError::Http {
                        url: url.to_string(),
                        status,
                        message,
                        is_last_retry: is_last,
                    };

                    if (400..500).contains(&status) && status != 429 {
                        return Err(err);
                    }
                    last_error = Some(err);
                }
                Err(e) => {
                    if e.is_timeout() {
                        warn!(url, attempt, "Fetch timed out");
                        last_error = Some(LoadError::Timeout {
                            url: url.to_string(),
                            is_last_retry: is_last,
                        });
                    } else {
                        warn!(url, attempt, error = %e, "Fetch network error");
                        last_error = Some(LoadError::Network {
                            url: url.to_string(),
                            reason: e.to_string(),
                            is_last_retry: is_last,
                        });
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| LoadError::Network {
            url: url.to_string(),
            reason: "no attempt was made".to_string(),
            is_last_retry: true,
        }))
    }
}

impl Default for HttpLoader {
    fn default() -> Self {
        Self::new(Duration::from_secs(15), 2, Duration::from_millis(200))
    }
}

fn body_error(url: &str, e: reqwest::Error) -> LoadError {
    if e.is_timeout() {
        LoadError::Timeout {
            url: url.to_string(),
            is_last_retry: true,
        }
    } else {
        LoadError::Network {
            url: url.to_string(),
            reason: e.to_string(),
            is_last_retry: true,
        }
    }
}

fn header_str(response: &Response, name: reqwest::header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

#[async_trait]
impl SourceLoader for HttpLoader {
    async fn load_text(&self, url: &str, headers: &RequestHeaders) -> Result<String, LoadError> {
        let response = self.send_with_retry(Method::GET, url, headers).await?;
        response.text().await.map_err(|e| body_error(url, e))
    }

    async fn load_bytes(&self, url: &str, headers: &RequestHeaders) -> Result<Bytes, LoadError> {
        let response = self.send_with_retry(Method::GET, url, headers).await?;
        response.bytes().await.map_err(|e| body_error(url, e))
    }

    async fn head(&self, url: &str, headers: &RequestHeaders) -> Result<HeadInfo, LoadError> {
        let response = self.send_with_retry(Method::HEAD, url, headers).await?;
        let content_length = header_str(&response, CONTENT_LENGTH).and_then(|v| v.trim().parse().ok());
        let chunked = header_str(&response, TRANSFER_ENCODING)
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false);
        Ok(HeadInfo {
            content_length,
            chunked,
            content_type: header_str(&response, CONTENT_TYPE),
        })
    }

    async fn open(&self, url: &str, headers: &RequestHeaders) -> Result<RemoteBody, LoadError> {
        let response = self.send_with_retry(Method::GET, url, headers).await?;
        let content_type = header_str(&response, CONTENT_TYPE);
        let content_length = response.content_length();
        let owned_url = url.to_string();
        let stream = response
            .bytes_stream()
            .map(move |chunk| chunk.map_err(|e| body_error(&owned_url, e)))
            .boxed();
        Ok(RemoteBody {
            content_type,
            content_length,
            stream,
        })
    }
}
