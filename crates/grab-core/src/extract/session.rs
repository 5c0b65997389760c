//! Pooled page sessions.
//!
//! Each checkout gets its own HTTP client, so nothing a page sets (cookies,
//! connection state) leaks into another request. The pool only bounds how
//! many sessions are live at once; a session's slot is released when it is
//! dropped, including when a timeout abandons it mid-load.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{REFERER, USER_AGENT};
use reqwest::Client;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;
use url::Url;

use super::ExtractError;
use crate::config::GrabConfig;
use crate::loader::RequestHeaders;

#[derive(Debug, Clone)]
pub struct SessionPool {
    permits: Arc<Semaphore>,
    size: usize,
    navigation_timeout: Duration,
    settle_timeout: Duration,
}

impl SessionPool {
    pub fn new(size: usize, navigation_timeout: Duration, settle_timeout: Duration) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
            navigation_timeout,
            settle_timeout,
        }
    }

    pub fn from_config(config: &GrabConfig) -> Self {
        Self::new(
            config.session_pool_size,
            config.navigation_timeout,
            config.settle_timeout,
        )
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Waits up to the navigation timeout for a free slot.
    pub async fn checkout(&self, url: &Url) -> Result<PageSession, ExtractError> {
        let permit = tokio::time::timeout(
            self.navigation_timeout,
            Arc::clone(&self.permits).acquire_owned(),
        )
        .await
        .map_err(|_| session_error(url, "no page session became available"))?
        .map_err(|_| session_error(url, "session pool closed"))?;

        let client = Client::builder()
            .connect_timeout(self.navigation_timeout)
            .gzip(true)
            .build()
            .map_err(|e| session_error(url, e))?;

        Ok(PageSession {
            client,
            navigation_timeout: self.navigation_timeout,
            settle_timeout: self.settle_timeout,
            _permit: permit,
        })
    }
}

fn session_error(url: &Url, reason: impl std::fmt::Display) -> ExtractError {
    ExtractError::Session {
        url: url.to_string(),
        reason: reason.to_string(),
    }
}

/// A loaded page: the URL after redirects and its body.
#[derive(Debug, Clone)]
pub struct LoadedPage {
    pub final_url: Url,
    pub body: String,
}

/// One checked-out session. Dropping it frees the pool slot.
pub struct PageSession {
    client: Client,
    navigation_timeout: Duration,
    settle_timeout: Duration,
    _permit: OwnedSemaphorePermit,
}

impl PageSession {
    /// Navigates to `url`. Response headers must arrive within the navigation
    /// timeout and the body within the settle timeout.
    pub async fn load(&self, url: &Url, headers: &RequestHeaders) -> Result<LoadedPage, ExtractError> {
        let mut req = self
            .client
            .get(url.as_str())
            .header(USER_AGENT, headers.user_agent.as_str());
        if let Some(ref referer) = headers.referer {
            req = req.header(REFERER, referer.as_str());
        }
        for (name, value) in &headers.extra {
            req = req.header(name.as_str(), value.as_str());
        }

        let response = tokio::time::timeout(self.navigation_timeout, req.send())
            .await
            .map_err(|_| session_error(url, "navigation timed out"))?
            .map_err(|e| session_error(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(session_error(url, format!("navigation returned HTTP {}", status.as_u16())));
        }
        let final_url = response.url().clone();

        let body = tokio::time::timeout(self.settle_timeout, response.text())
            .await
            .map_err(|_| session_error(url, "page did not settle in time"))?
            .map_err(|e| session_error(url, e))?;

        debug!(url = %final_url, bytes = body.len(), "Page loaded");
        Ok(LoadedPage { final_url, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn slot_is_released_on_drop() {
        let pool = SessionPool::new(1, Duration::from_millis(100), Duration::from_millis(100));
        let url = Url::parse("https://example.com/").unwrap();

        let session = pool.checkout(&url).await.unwrap();
        assert_eq!(pool.available(), 0);
        assert!(matches!(pool.checkout(&url).await, Err(ExtractError::Session { .. })));
        drop(session);
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn slow_navigation_times_out_and_releases() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/slow"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let pool = SessionPool::new(1, Duration::from_millis(100), Duration::from_millis(100));
        let url = Url::parse(&format!("{}/slow", server.uri())).unwrap();
        let result = async {
            let session = pool.checkout(&url).await?;
            session.load(&url, &RequestHeaders::new("UA")).await
        }
        .await;
        match result {
            Err(ExtractError::Session { reason, .. }) => assert_eq!(reason, "navigation timed out"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn load_returns_body_and_final_url() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<video src=\"a.mp4\"></video>"))
            .mount(&server)
            .await;

        let pool = SessionPool::new(2, Duration::from_secs(5), Duration::from_secs(5));
        let url = Url::parse(&format!("{}/page", server.uri())).unwrap();
        let page = pool
            .checkout(&url)
            .await
            .unwrap()
            .load(&url, &RequestHeaders::new("UA"))
            .await
            .unwrap();
        assert_eq!(page.final_url, url);
        assert!(page.body.contains("a.mp4"));
    }
}
