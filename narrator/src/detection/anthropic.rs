use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;

use super::{check_status, validate_base_url, ProviderError, VisionBackend, VisionRequest};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic messages API with a base64 image block.
pub struct AnthropicBackend {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl AnthropicBackend {
    pub fn new(
        api_key: String,
        model: String,
        base_url: String,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_key,
            model,
            base_url: validate_base_url(&base_url)?,
        })
    }

    fn request_body(&self, request: &VisionRequest) -> Result<Value, ProviderError> {
        let (media_type, data) = request
            .image_parts()
            .ok_or_else(|| ProviderError::InvalidResponse("image is not a base64 data URI".into()))?;

        Ok(json!({
            "model": self.model,
            "system": request.system,
            "messages": [
                {
                    "role": "user",
                    "content": [
                        { "type": "text", "text": request.prompt },
                        {
                            "type": "image",
                            "source": { "type": "base64", "media_type": media_type, "data": data },
                        },
                    ],
                },
            ],
            "max_tokens": request.max_tokens,
            "temperature": request.temperature.clamp(0.0, 1.0),
        }))
    }
}

fn extract_text(json: &Value) -> Result<Option<String>, ProviderError> {
    let content = json
        .get("content")
        .and_then(Value::as_array)
        .ok_or_else(|| ProviderError::InvalidResponse("no content array".into()))?;

    Ok(content.iter().rev().find_map(|block| {
        (block["type"] == "text")
            .then(|| block["text"].as_str())
            .flatten()
            .map(str::to_string)
    }))
}

#[async_trait]
impl VisionBackend for AnthropicBackend {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &VisionRequest) -> Result<Option<String>, ProviderError> {
        let url = format!("{}/messages", self.base_url);
        debug!(url, model = self.model, "sending Anthropic vision request");

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&self.request_body(request)?)
            .send()
            .await?;
        let json: Value = check_status(response).await?.json().await?;
        extract_text(&json)
    }
}
