//! Model Discovery
//!
//! Asks a provider which models it serves. OpenAI-compatible servers answer
//! `GET /v1/models` (`{"data":[{"id":..}]}`); Ollama answers `GET /api/tags`
//! (`{"models":[{"name":..}]}`). The first endpoint that answers wins.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Discovery errors
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Connection failed or timed out
    #[error("request to {url} failed: {source}")]
    Http {
        /// Endpoint tried
        url: String,
        /// Transport error
        #[source]
        source: reqwest::Error,
    },

    /// Endpoint answered with a non-success status
    #[error("{url} returned HTTP {status}")]
    Status {
        /// Endpoint tried
        url: String,
        /// HTTP status
        status: u16,
    },

    /// Body was not a model listing
    #[error("{url} returned an unexpected body: {reason}")]
    Body {
        /// Endpoint tried
        url: String,
        /// Decode error
        reason: String,
    },
}

#[derive(Debug, Deserialize)]
struct OpenAiModels {
    data: Vec<OpenAiModel>,
}

#[derive(Debug, Deserialize)]
struct OpenAiModel {
    id: String,
}

#[derive(Debug, Deserialize)]
struct OllamaTags {
    models: Vec<OllamaTag>,
}

#[derive(Debug, Deserialize)]
struct OllamaTag {
    name: String,
}

/// Model listing client
#[derive(Clone, Debug)]
pub struct ModelDiscovery {
    client: reqwest::Client,
    timeout: Duration,
}

impl Default for ModelDiscovery {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl ModelDiscovery {
    /// Discovery with a per-request timeout
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }

    /// Models served at `base_url`
    pub async fn discover(&self, base_url: &str, auth_key: Option<&str>) -> Result<Vec<String>, DiscoveryError> {
        let base = base_url.trim_end_matches('/');

        match self.fetch::<OpenAiModels>(&format!("{base}/v1/models"), auth_key).await {
            Ok(listing) => return Ok(listing.data.into_iter().map(|m| m.id).collect()),
            Err(e) => tracing::debug!(error = %e, "OpenAI model listing unavailable, trying Ollama tags"),
        }

        let tags = self
            .fetch::<OllamaTags>(&format!("{base}/api/tags"), auth_key)
            .await?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    async fn fetch<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        auth_key: Option<&str>,
    ) -> Result<T, DiscoveryError> {
        let mut request = self.client.get(url).timeout(self.timeout);
        if let Some(key) = auth_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|source| DiscoveryError::Http {
            url: url.to_string(),
            source,
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(DiscoveryError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        response.json::<T>().await.map_err(|e| DiscoveryError::Body {
            url: url.to_string(),
            reason: e.to_string(),
        })
    }
}
