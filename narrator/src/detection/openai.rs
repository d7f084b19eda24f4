use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;

use super::{check_status, validate_base_url, ProviderError, VisionBackend, VisionRequest};

/// OpenAI chat completions with an `image_url` content part.
pub struct OpenAiBackend {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenAiBackend {
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

    fn request_body(&self, request: &VisionRequest) -> Value {
        json!({
            "model": self.model,
            "messages": [
                {
                    "role": "system",
                    "content": request.system,
                },
                {
                    "role": "user",
                    "content": [
                        { "type": "text", "text": request.prompt },
                        { "type": "image_url", "image_url": { "url": request.image_data_uri } },
                    ],
                },
            ],
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        })
    }
}

/// Last non-empty assistant text across the returned choices. `content` may
/// be a plain string or an array of typed parts.
fn extract_text(json: &Value) -> Result<Option<String>, ProviderError> {
    let choices = json
        .get("choices")
        .and_then(Value::as_array)
        .ok_or_else(|| ProviderError::InvalidResponse("no choices array".into()))?;

    let text = choices.iter().rev().find_map(|choice| {
        let content = &choice["message"]["content"];
        match content {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Array(parts) => parts.iter().rev().find_map(|part| {
                (part["type"] == "text")
                    .then(|| part["text"].as_str())
                    .flatten()
                    .map(str::to_string)
            }),
            _ => None,
        }
    });
    Ok(text)
}

#[async_trait]
impl VisionBackend for OpenAiBackend {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &VisionRequest) -> Result<Option<String>, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        debug!(url, model = self.model, "sending OpenAI vision request");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.request_body(request))
            .send()
            .await?;
        let json: Value = check_status(response).await?.json().await?;
        extract_text(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::test_server::serve_once;
    use crate::detection::{DetectionProvider, SceneDescriber, ERROR_FALLBACK};

    fn backend() -> OpenAiBackend {
        OpenAiBackend::new(
            "sk-test".into(),
            "gpt-4-vision-preview".into(),
            "https://api.openai.com/v1/".into(),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn body_has_system_prompt_and_image_part() {
        let request = VisionRequest::for_jpeg(&[1, 2, 3]);
        let body = backend().request_body(&request);

        assert_eq!(body["model"], "gpt-4-vision-preview");
        assert_eq!(body["max_tokens"], 150);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][0]["content"], request.system.as_str());
        let parts = &body["messages"][1]["content"];
        assert_eq!(parts[0]["text"], "Describe what you see in this image.");
        assert_eq!(parts[1]["image_url"]["url"], "data:image/jpeg;base64,AQID");
        let temperature = body["temperature"].as_f64().unwrap();
        assert!((temperature - 0.7).abs() < 1e-6);
    }

    #[test]
    fn trailing_slash_is_trimmed() {
        assert_eq!(backend().base_url, "https://api.openai.com/v1");
    }

    #[test]
    fn extracts_string_content() {
        let json = json!({
            "choices": [{ "message": { "role": "assistant", "content": "A dog asleep." } }]
        });
        assert_eq!(extract_text(&json).unwrap().as_deref(), Some("A dog asleep."));
    }

    #[test]
    fn extracts_last_text_part() {
        let json = json!({
            "choices": [{ "message": { "content": [
                { "type": "text", "text": "first" },
                { "type": "text", "text": "second" },
            ] } }]
        });
        assert_eq!(extract_text(&json).unwrap().as_deref(), Some("second"));
    }

    #[test]
    fn null_content_is_none() {
        let json = json!({ "choices": [{ "message": { "content": null } }] });
        assert_eq!(extract_text(&json).unwrap(), None);
        let json = json!({ "choices": [] });
        assert_eq!(extract_text(&json).unwrap(), None);
    }

    #[test]
    fn missing_choices_is_invalid() {
        let err = extract_text(&json!({ "error": "boom" })).unwrap_err();
        assert!(matches!(err, ProviderError::InvalidResponse(_)));
    }

    fn local_backend(base_url: String) -> OpenAiBackend {
        OpenAiBackend {
            client: Client::builder()
                .no_proxy()
                .timeout(Duration::from_secs(5))
                .build()
                .unwrap(),
            api_key: "sk-test".into(),
            model: "gpt-4o".into(),
            base_url,
        }
    }

    async fn complete_against(
        status: &'static str,
        body: &'static str,
    ) -> (Result<Option<String>, ProviderError>, String) {
        let (base_url, request) = serve_once(status, body).await;
        let result = local_backend(base_url)
            .complete(&VisionRequest::for_jpeg(&[1, 2, 3]))
            .await;
        (result, request.await.unwrap())
    }

    #[tokio::test]
    async fn posts_chat_completion_and_reads_reply() {
        let (result, request) = complete_against(
            "200 OK",
            r#"{"choices":[{"message":{"role":"assistant","content":"A cat on a sofa."}}]}"#,
        )
        .await;

        assert_eq!(result.unwrap().as_deref(), Some("A cat on a sofa."));
        assert!(request.starts_with("POST /v1/chat/completions "));
        let lower = request.to_ascii_lowercase();
        assert!(lower.contains("authorization: bearer sk-test"));
        assert!(request.contains("data:image/jpeg;base64,AQID"));
    }

    #[tokio::test]
    async fn error_statuses_are_classified() {
        let (result, _) = complete_against("429 Too Many Requests", "{}").await;
        assert!(matches!(result, Err(ProviderError::RateLimited)));

        for status in ["401 Unauthorized", "403 Forbidden"] {
            let (result, _) = complete_against(status, "{}").await;
            assert!(
                matches!(result, Err(ProviderError::AuthenticationFailed)),
                "{status}"
            );
        }

        let (result, _) = complete_against("500 Internal Server Error", "upstream exploded").await;
        match result {
            Err(ProviderError::Status { status, body }) => {
                assert_eq!(status, 500);
                assert_eq!(body, "upstream exploded");
            }
            other => panic!("expected Status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_body_falls_back_to_error_text() {
        let (result, _) = complete_against("200 OK", "<html>not json</html>").await;
        assert!(matches!(result, Err(ProviderError::Http(_))));

        let (base_url, _request) = serve_once("200 OK", "<html>not json</html>").await;
        let describer = SceneDescriber::new(Box::new(local_backend(base_url)));
        assert_eq!(describer.analyze(&[1, 2, 3]).await, ERROR_FALLBACK);
    }
}
