pub mod anthropic;
pub mod coordinator;
pub mod openai;

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use scene_narrator_common::config::{Provider, ResolvedProvider};
use tracing::{error, info, warn};

use self::anthropic::AnthropicBackend;
use self::openai::OpenAiBackend;

pub const SYSTEM_PROMPT: &str = "You are a helpful assistant that describes scenes in images.
Provide concise, natural descriptions focusing on:
- Main subjects and their actions
- Important objects and their relationships
- The overall scene context
Keep descriptions brief (1-2 sentences) and conversational.";

pub const USER_PROMPT: &str = "Describe what you see in this image.";
pub const MAX_TOKENS: u32 = 150;
pub const TEMPERATURE: f32 = 0.7;

/// Narrated in place of a description when the backend call fails.
pub const ERROR_FALLBACK: &str = "Error processing image";
/// Narrated when the backend answers without any text.
pub const EMPTY_FALLBACK: &str = "Unable to generate description";

const JPEG_DATA_URI_PREFIX: &str = "data:image/jpeg;base64,";
const MAX_ERROR_BODY_CHARS: usize = 500;

/// Turns image bytes into a description.
///
/// Implementations never fail: backend errors are logged and replaced with
/// [`ERROR_FALLBACK`] so the capture loop keeps running through provider
/// outages.
#[async_trait]
pub trait DetectionProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn analyze(&self, image_bytes: &[u8]) -> String;
}

/// One chat completion call against a vision-capable model.
#[async_trait]
pub trait VisionBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn model(&self) -> &str;

    /// Returns the last textual reply, or `None` if the model produced none.
    async fn complete(&self, request: &VisionRequest) -> Result<Option<String>, ProviderError>;
}

/// Everything a backend needs to build its request.
#[derive(Debug, Clone, PartialEq)]
pub struct VisionRequest {
    pub system: String,
    pub prompt: String,
    pub image_data_uri: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl VisionRequest {
    pub fn for_jpeg(jpeg_bytes: &[u8]) -> Self {
        Self {
            system: SYSTEM_PROMPT.to_string(),
            prompt: USER_PROMPT.to_string(),
            image_data_uri: format!("{JPEG_DATA_URI_PREFIX}{}", BASE64.encode(jpeg_bytes)),
            max_tokens: MAX_TOKENS,
            temperature: TEMPERATURE,
        }
    }

    /// Split the data URI into `(media_type, base64_payload)`.
    pub fn image_parts(&self) -> Option<(&str, &str)> {
        let rest = self.image_data_uri.strip_prefix("data:")?;
        let (media_type, data) = rest.split_once(";base64,")?;
        Some((media_type, data))
    }
}

/// [`DetectionProvider`] backed by a remote chat model.
pub struct SceneDescriber {
    backend: Box<dyn VisionBackend>,
}

impl SceneDescriber {
    pub fn new(backend: Box<dyn VisionBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl DetectionProvider for SceneDescriber {
    fn name(&self) -> &str {
        self.backend.name()
    }

    async fn analyze(&self, image_bytes: &[u8]) -> String {
        let request = VisionRequest::for_jpeg(image_bytes);
        match self.backend.complete(&request).await {
            Ok(Some(text)) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => {
                warn!(provider = self.backend.name(), "model returned no text");
                EMPTY_FALLBACK.to_string()
            }
            Err(e) => {
                error!(
                    provider = self.backend.name(),
                    model = self.backend.model(),
                    error = %e,
                    "error analyzing image"
                );
                ERROR_FALLBACK.to_string()
            }
        }
    }
}

/// Build the provider selected in the config.
pub fn build_provider(
    resolved: &ResolvedProvider,
    timeout: Duration,
) -> Result<SceneDescriber, ProviderError> {
    let backend: Box<dyn VisionBackend> = match resolved.provider {
        Provider::OpenAi => Box::new(OpenAiBackend::new(
            resolved.api_key.clone(),
            resolved.model.clone(),
            resolved.base_url.clone(),
            timeout,
        )?),
        Provider::Anthropic => Box::new(AnthropicBackend::new(
            resolved.api_key.clone(),
            resolved.model.clone(),
            resolved.base_url.clone(),
            timeout,
        )?),
    };
    info!(
        provider = backend.name(),
        model = backend.model(),
        "detection provider ready"
    );
    Ok(SceneDescriber::new(backend))
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("rate limit exceeded")]
    RateLimited,
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid response from provider: {0}")]
    InvalidResponse(String),
    #[error("invalid base URL {0}")]
    InvalidBaseUrl(String),
}

/// Map non-success statuses to [`ProviderError`], passing successful
/// responses through.
pub(crate) async fn check_status(
    response: reqwest::Response,
) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    match status.as_u16() {
        429 => Err(ProviderError::RateLimited),
        401 | 403 => Err(ProviderError::AuthenticationFailed),
        code => {
            let text = response.text().await.unwrap_or_default();
            Err(ProviderError::Status {
                status: code,
                body: text.chars().take(MAX_ERROR_BODY_CHARS).collect(),
            })
        }
    }
}

pub(crate) fn validate_base_url(base_url: &str) -> Result<String, ProviderError> {
    let trimmed = base_url.trim_end_matches('/');
    if trimmed.starts_with("https://") || trimmed.starts_with("http://") {
        Ok(trimmed.to_string())
    } else {
        Err(ProviderError::InvalidBaseUrl(base_url.to_string()))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Backend returning a canned result and remembering the last request.
    struct ScriptedBackend {
        reply: Mutex<Option<Result<Option<String>, ProviderError>>>,
        seen: Mutex<Option<VisionRequest>>,
    }

    impl ScriptedBackend {
        fn new(reply: Result<Option<String>, ProviderError>) -> Self {
            Self {
                reply: Mutex::new(Some(reply)),
                seen: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl VisionBackend for Arc<ScriptedBackend> {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn model(&self) -> &str {
            "test-model"
        }

        async fn complete(
            &self,
            request: &VisionRequest,
        ) -> Result<Option<String>, ProviderError> {
            *self.seen.lock().unwrap() = Some(request.clone());
            self.reply.lock().unwrap().take().unwrap_or(Ok(None))
        }
    }

    fn describer(
        reply: Result<Option<String>, ProviderError>,
    ) -> (SceneDescriber, Arc<ScriptedBackend>) {
        let backend = Arc::new(ScriptedBackend::new(reply));
        (SceneDescriber::new(Box::new(backend.clone())), backend)
    }

    #[test]
    fn request_carries_prompt_and_image() {
        let request = VisionRequest::for_jpeg(&[0xFF, 0xD8, 0xFF]);
        assert_eq!(request.prompt, "Describe what you see in this image.");
        assert_eq!(request.max_tokens, 150);
        assert!((request.temperature - 0.7).abs() < f32::EPSILON);
        assert_eq!(request.image_data_uri, "data:image/jpeg;base64,/9j/");
        assert_eq!(request.image_parts(), Some(("image/jpeg", "/9j/")));
    }

    #[tokio::test]
    async fn description_is_passed_through() {
        let (provider, backend) = describer(Ok(Some("  A cat on a sofa. \n".into())));
        assert_eq!(provider.analyze(&[1, 2, 3]).await, "A cat on a sofa.");
        let seen = backend.seen.lock().unwrap().clone().unwrap();
        assert_eq!(seen.image_data_uri, "data:image/jpeg;base64,AQID");
    }

    #[tokio::test]
    async fn backend_failure_becomes_fallback_text() {
        let (provider, _) = describer(Err(ProviderError::RateLimited));
        assert_eq!(provider.analyze(&[1]).await, ERROR_FALLBACK);
    }

    #[tokio::test]
    async fn missing_text_becomes_placeholder() {
        let (provider, _) = describer(Ok(None));
        assert_eq!(provider.analyze(&[1]).await, EMPTY_FALLBACK);
        let (provider, _) = describer(Ok(Some("   ".into())));
        assert_eq!(provider.analyze(&[1]).await, EMPTY_FALLBACK);
    }

    #[test]
    fn base_url_must_be_http() {
        assert_eq!(
            validate_base_url("https://api.openai.com/v1/").unwrap(),
            "https://api.openai.com/v1"
        );
        assert!(validate_base_url("file:///etc/passwd").is_err());
    }

    #[test]
    fn builds_selected_provider() {
        let resolved = ResolvedProvider {
            provider: Provider::Anthropic,
            api_key: "sk-ant".into(),
            model: "claude-3-sonnet-20240229".into(),
            base_url: "https://api.anthropic.com/v1".into(),
        };
        let provider = build_provider(&resolved, Duration::from_secs(5)).unwrap();
        assert_eq!(provider.name(), "anthropic");
    }
}
