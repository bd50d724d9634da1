//! Retrieval of rendered markup for a content item.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, instrument};

use crate::catalog::{ContentRef, ContentResolver};
use crate::error::{Error, Result};

/// Provides the rendered markup of a content item.
///
/// Completion of `fetch_markup` is the "markup ready" signal for the
/// selection that requested it.
#[async_trait]
pub trait MarkupSource: Send + Sync {
    async fn fetch_markup(&self, content: &ContentRef) -> Result<String>;
}

/// Fetches rendered markup over HTTP from the URL a resolver produces.
pub struct HttpMarkupSource {
    resolver: Arc<dyn ContentResolver>,
    http: Client,
    api_key: Option<String>,
    timeout: Duration,
}

impl HttpMarkupSource {
    pub fn new(resolver: Arc<dyn ContentResolver>) -> Result<Self> {
        let http = Client::builder()
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            resolver,
            http,
            api_key: None,
            timeout: Duration::from_secs(30),
        })
    }

    /// Send `Authorization: Key <api_key>` with every request.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl MarkupSource for HttpMarkupSource {
    #[instrument(skip(self, content), fields(content_id = %content.id))]
    async fn fetch_markup(&self, content: &ContentRef) -> Result<String> {
        let url = self.resolver.resolve_url(content)?;

        let mut request = self.http.get(url.clone()).timeout(self.timeout);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Key {key}"));
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Markup(format!("timed out fetching {url}"))
            } else {
                Error::Markup(format!("request to {url} failed: {e}"))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Markup(format!("{url} returned {status}")));
        }

        let markup = response
            .text()
            .await
            .map_err(|e| Error::Markup(format!("failed to read body of {url}: {e}")))?;
        debug!(markup_len = markup.len(), "Markup fetched");
        Ok(markup)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{BaseUrlResolver, ContentKind};

    #[tokio::test]
    async fn test_resolver_errors_propagate() {
        let resolver = Arc::new(BaseUrlResolver::new("http://127.0.0.1:9/").unwrap());
        let source = HttpMarkupSource::new(resolver).unwrap();
        let content = ContentRef::new("a/b", "Nested", "ana", ContentKind::Static);

        let err = source.fetch_markup(&content).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)), "{err}");
    }

    #[tokio::test]
    async fn test_unreachable_host_is_markup_error() {
        // Port 9 (discard) is closed on test hosts.
        let resolver = Arc::new(BaseUrlResolver::new("http://127.0.0.1:9/").unwrap());
        let source = HttpMarkupSource::new(resolver)
            .unwrap()
            .with_timeout(Duration::from_secs(2));
        let content = ContentRef::new("abc", "Report", "ana", ContentKind::Rendered);

        let err = source.fetch_markup(&content).await.unwrap_err();
        assert!(matches!(err, Error::Markup(_)), "{err}");
    }
}
