use crate::config::GeneratorConfig;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Typography {
    pub primary: String,
    pub secondary: String,
}

/// Generated brand identity returned by the remote endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrandKit {
    pub logos: Vec<String>,
    pub colors: Vec<String>,
    pub typography: Typography,
    pub mockups: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    pub briefing: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variations_count: Option<u32>,
}

/// Wire shape of a successful response. Older deployments return a single
/// `logo` instead of `logos`.
#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    logos: Vec<String>,
    #[serde(default)]
    logo: Option<String>,
    colors: Vec<String>,
    typography: Typography,
    #[serde(default)]
    mockups: Vec<String>,
}

impl From<GenerateResponse> for BrandKit {
    fn from(resp: GenerateResponse) -> Self {
        let mut logos = resp.logos;
        if let Some(logo) = resp.logo {
            if !logos.contains(&logo) {
                logos.insert(0, logo);
            }
        }
        BrandKit {
            logos,
            colors: resp.colors,
            typography: resp.typography,
            mockups: resp.mockups,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GenerateError {
    /// Non-2xx response. `message` is the endpoint's own error text, verbatim.
    #[error("generation failed ({status}): {message}")]
    Upstream { status: u16, message: String },

    #[error("invalid response format: {0}")]
    InvalidFormat(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for GenerateError {
    fn from(e: reqwest::Error) -> Self {
        GenerateError::Transport(e.to_string())
    }
}

/// The remote brand generation call.
pub trait BrandGenerator: Send + Sync {
    fn generate(&self, request: GenerateRequest) -> BoxFuture<'static, Result<BrandKit, GenerateError>>;
}

pub type SharedGenerator = Arc<dyn BrandGenerator>;

/// Decode an endpoint response body given its HTTP status.
pub fn decode_response(status: u16, body: &[u8]) -> Result<BrandKit, GenerateError> {
    if !(200..300).contains(&status) {
        let message = serde_json::from_slice::<ErrorBody>(body)
            .map(|b| b.error)
            .unwrap_or_else(|_| String::from_utf8_lossy(body).trim().to_string());
        return Err(GenerateError::Upstream { status, message });
    }

    serde_json::from_slice::<GenerateResponse>(body)
        .map(BrandKit::from)
        .map_err(|e| GenerateError::InvalidFormat(e.to_string()))
}

/// `BrandGenerator` over HTTP, posting JSON to the configured endpoint.
pub struct HttpGenerator {
    client: reqwest::Client,
    endpoint_url: String,
    api_key: Option<String>,
}

impl HttpGenerator {
    pub fn new(config: &GeneratorConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint_url: config.endpoint_url.clone(),
            api_key: config.api_key.clone(),
        }
    }
}

impl BrandGenerator for HttpGenerator {
    fn generate(&self, request: GenerateRequest) -> BoxFuture<'static, Result<BrandKit, GenerateError>> {
        let mut builder = self.client.post(&self.endpoint_url).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        Box::pin(async move {
            tracing::debug!(
                briefing_len = request.briefing.len(),
                variations = ?request.variations_count,
                "calling generation endpoint"
            );
            let resp = builder.send().await?;
            let status = resp.status().as_u16();
            let body = resp.bytes().await?;
            decode_response(status, &body)
        })
    }
}
