//! Ollama-backed policy oracle.
//!
//! Speaks the non-streaming `/api/generate` endpoint with JSON output mode.

use crate::oracle::{OracleError, OracleRequest, PolicyOracle};
use async_trait::async_trait;
use pilotgate_core::OracleConfig;
use reqwest::{header, Client};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Ollama HTTP backend.
pub struct OllamaOracle {
    client: Client,
    base_url: String,
    model: String,
    temperature: f32,
}

impl OllamaOracle {
    /// Create a backend for the Ollama server at `base_url`.
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        temperature: f32,
    ) -> Result<Self, OracleError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| OracleError::Unreachable(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            temperature,
        })
    }

    /// Create a backend from the `oracle` config section.
    pub fn from_config(config: &OracleConfig) -> Result<Self, OracleError> {
        Self::new(&config.base_url, &config.model, config.temperature)
    }

    fn generate_url(&self) -> String {
        format!("{}/api/generate", self.base_url)
    }
}

/// Ollama generate request body.
#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    format: &'static str,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
}

/// Ollama generate response.
#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

#[async_trait]
impl PolicyOracle for OllamaOracle {
    fn id(&self) -> &str {
        &self.model
    }

    async fn query(&self, request: &OracleRequest) -> Result<String, OracleError> {
        let body = GenerateRequest {
            model: &self.model,
            prompt: &request.prompt,
            stream: false,
            format: "json",
            options: GenerateOptions {
                temperature: self.temperature,
            },
        };

        debug!(snapshot_id = request.snapshot_id, model = %self.model, "Querying Ollama");

        let response = self
            .client
            .post(self.generate_url())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    OracleError::Timeout
                } else {
                    OracleError::Unreachable(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(OracleError::Unreachable(format!("HTTP {status}: {text}")));
        }

        let generated: GenerateResponse = response
            .json()
            .await
            .map_err(|e| OracleError::ParseError(format!("invalid Ollama response: {e}")))?;

        Ok(generated.response)
    }
}
