use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{Config, ConverterConfig};
use crate::error::{DocsplitError, Result};

/// Result of converting one file: content, an error, or content with an error
/// (a warning).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Conversion {
    pub content: Option<String>,
    pub error: Option<String>,
}

impl Conversion {
    pub fn content(text: impl Into<String>) -> Self {
        Self {
            content: Some(text.into()),
            error: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            content: None,
            error: Some(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.content.is_some()
    }
}

/// Turns a file (whole document or part) into text.
///
/// `Err` means the call itself failed (transport, I/O); a `Conversion`
/// without content is a failure the converter reported. The worker pool
/// retries both.
#[async_trait]
pub trait Converter: Send + Sync {
    async fn convert(&self, path: &Path) -> Result<Conversion>;
}

/// Reads the file as UTF-8 text.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainTextConverter;

#[async_trait]
impl Converter for PlainTextConverter {
    async fn convert(&self, path: &Path) -> Result<Conversion> {
        let bytes = tokio::fs::read(path).await?;
        match String::from_utf8(bytes) {
            Ok(text) => Ok(Conversion::content(text)),
            Err(e) => {
                let text = String::from_utf8_lossy(e.as_bytes()).into_owned();
                Ok(Conversion {
                    content: Some(text),
                    error: Some(format!("not valid UTF-8 at byte {}; decoded lossily", e.utf8_error().valid_up_to())),
                })
            }
        }
    }
}

/// The HTTP converter when `[converter]` is configured, plain text otherwise.
pub fn build_converter(config: &Config) -> Result<Arc<dyn Converter>> {
    match &config.converter {
        Some(converter) => {
            log::info!("Using converter endpoint {}", converter.endpoint);
            Ok(Arc::new(HttpConverter::from_config(converter)?))
        }
        None => Ok(Arc::new(PlainTextConverter)),
    }
}

/// Remote converter response body
#[derive(Debug, Deserialize)]
struct ConvertResponse {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// POSTs file bytes to a conversion service.
pub struct HttpConverter {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpConverter {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DocsplitError::Converter(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key,
        })
    }

    /// Build from config; the API key is read from the configured env var.
    pub fn from_config(config: &ConverterConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env).ok().filter(|k| !k.is_empty());
        if api_key.is_none() {
            log::debug!("{} not set, calling converter without credentials", config.api_key_env);
        }
        Self::new(config.endpoint.clone(), api_key, Duration::from_secs(config.timeout_secs))
    }
}

#[async_trait]
impl Converter for HttpConverter {
    async fn convert(&self, path: &Path) -> Result<Conversion> {
        let bytes = tokio::fs::read(path).await?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        let mut request = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/octet-stream")
            .header("X-Filename", filename)
            .body(bytes);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let response = request
            .send()
            .await
            .map_err(|e| DocsplitError::Converter(format!("Network error: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error response".to_string());
            return Err(DocsplitError::Converter(format!("Converter error {}: {}", status, body)));
        }

        let body: ConvertResponse = response
            .json()
            .await
            .map_err(|e| DocsplitError::Converter(format!("Failed to parse response: {}", e)))?;

        Ok(Conversion {
            content: body.content,
            error: body.error,
        })
    }
}
