use reqwest::Client;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::dispatch::GENERATION_TIMEOUT;
use crate::error::LlmError;
use crate::text::concat_path;

pub const PROVIDER: &str = "openai";

const MAX_RESPONSE_BYTES: usize = 8 * 1024 * 1024; // 8MB

/// HTTP client shared by the completion and chat adapters.
pub struct OpenAiClient {
    client: Client,
    base_url: String,
    api_key: String,
    organization: Option<String>,
}

impl std::fmt::Debug for OpenAiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiClient")
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .field("organization", &self.organization)
            .finish()
    }
}

impl OpenAiClient {
    pub fn new(
        base_url: &str,
        api_key: &str,
        organization: Option<&str>,
    ) -> Result<Self, LlmError> {
        let client = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .timeout(GENERATION_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.to_string(),
            api_key: api_key.to_string(),
            organization: organization.map(str::to_string),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, concat_path(&self.base_url, path))
            .bearer_auth(&self.api_key);
        if let Some(org) = &self.organization {
            builder = builder.header("OpenAI-Organization", org);
        }
        builder
    }

    /// POST `body` to `path`; returns the typed response and the raw JSON.
    pub async fn post<B, T>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<(T, serde_json::Value), LlmError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self
            .request(reqwest::Method::POST, path)
            .json(body)
            .send()
            .await?;
        read_json(response).await
    }

    pub async fn get<T>(&self, path: &str) -> Result<(T, serde_json::Value), LlmError>
    where
        T: DeserializeOwned,
    {
        let response = self.request(reqwest::Method::GET, path).send().await?;
        read_json(response).await
    }
}

async fn read_json<T: DeserializeOwned>(
    response: reqwest::Response,
) -> Result<(T, serde_json::Value), LlmError> {
    let status = response.status();

    // Cap body reads so a misbehaving endpoint cannot exhaust memory.
    let bytes = response.bytes().await.map_err(|e| LlmError::Upstream {
        provider: PROVIDER.to_string(),
        message: format!("failed to read response body: {e}"),
        status: Some(status.as_u16()),
    })?;
    let bytes = &bytes[..bytes.len().min(MAX_RESPONSE_BYTES)];

    if !status.is_success() {
        return Err(LlmError::Upstream {
            provider: PROVIDER.to_string(),
            message: error_message(bytes),
            status: Some(status.as_u16()),
        });
    }

    let raw: serde_json::Value = serde_json::from_slice(bytes)
        .map_err(|e| LlmError::SchemaParse(format!("failed to parse response: {e}")))?;
    let typed = serde_json::from_value(raw.clone())
        .map_err(|e| LlmError::SchemaParse(format!("unexpected response shape: {e}")))?;
    Ok((typed, raw))
}

/// OpenAI wraps failures as `{"error": {"message": ...}}`; fall back to the body.
fn error_message(body: &[u8]) -> String {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| String::from_utf8_lossy(body).trim().to_string())
}
