use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use crate::app::ports::{SourceClient, SourceResponse};
use crate::constants;
use crate::error::SourceError;
use crate::types::Entity;

fn build_client(source_name: &str, timeout: Duration) -> Result<reqwest::Client, SourceError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .gzip(true)
        .build()
        .map_err(|e| SourceError::Transport {
            source_name: source_name.to_string(),
            message: format!("could not build HTTP client: {}", e),
        })
}

async fn into_response(source_name: &str, resp: reqwest::Response) -> Result<SourceResponse, SourceError> {
    let status = resp.status().as_u16();
    let bytes = resp.bytes().await.map_err(|e| SourceError::Transport {
        source_name: source_name.to_string(),
        message: e.to_string(),
    })?;
    // Error bodies are frequently not JSON; keep the status and drop the body.
    let payload = match serde_json::from_slice(&bytes) {
        Ok(v) => v,
        Err(e) if (200..300).contains(&status) => {
            return Err(SourceError::Decode {
                source_name: source_name.to_string(),
                message: e.to_string(),
            })
        }
        Err(_) => serde_json::Value::Null,
    };
    Ok(SourceResponse { status, payload })
}

/// Primary provider: OpenAQ v3 `latest`, queried by city name
pub struct OpenAqClient {
    client: reqwest::Client,
    base_url: String,
}

impl OpenAqClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, SourceError> {
        Ok(Self {
            client: build_client("openaq", timeout)?,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl SourceClient for OpenAqClient {
    fn name(&self) -> &str {
        "openaq"
    }

    async fn call(&self, entity: &Entity) -> Result<SourceResponse, SourceError> {
        debug!(url = %self.base_url, city = %entity.key, "GET openaq latest");
        let resp = self
            .client
            .get(&self.base_url)
            .query(&[("city", entity.key.as_str())])
            .send()
            .await
            .map_err(|e| SourceError::Transport {
                source_name: self.name().to_string(),
                message: e.to_string(),
            })?;
        into_response(self.name(), resp).await
    }

    fn is_empty_payload(&self, payload: &serde_json::Value) -> bool {
        payload
            .get("results")
            .and_then(|r| r.as_array())
            .map_or(true, |r| r.is_empty())
    }
}

/// Fallback provider: Open-Meteo hourly air quality, queried by coordinates
pub struct OpenMeteoClient {
    client: reqwest::Client,
    base_url: String,
}

impl OpenMeteoClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, SourceError> {
        Ok(Self {
            client: build_client("open-meteo", timeout)?,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl SourceClient for OpenMeteoClient {
    fn name(&self) -> &str {
        "open-meteo"
    }

    async fn call(&self, entity: &Entity) -> Result<SourceResponse, SourceError> {
        debug!(url = %self.base_url, city = %entity.key, "GET open-meteo air quality");
        let latitude = entity.latitude.to_string();
        let longitude = entity.longitude.to_string();
        let resp = self
            .client
            .get(&self.base_url)
            .query(&[
                ("latitude", latitude.as_str()),
                ("longitude", longitude.as_str()),
                ("hourly", constants::OPEN_METEO_HOURLY),
            ])
            .send()
            .await
            .map_err(|e| SourceError::Transport {
                source_name: self.name().to_string(),
                message: e.to_string(),
            })?;
        into_response(self.name(), resp).await
    }

    fn is_empty_payload(&self, payload: &serde_json::Value) -> bool {
        !payload.get("hourly").map_or(false, |h| h.is_object())
    }
}
