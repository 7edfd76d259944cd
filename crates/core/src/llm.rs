use crate::cost::TokenUsage;
use crate::error::ModelError;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub system: String,
    pub prompt: String,
    pub image_png: Option<Vec<u8>>,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatResponse {
    pub text: String,
    pub usage: TokenUsage,
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    fn model_id(&self) -> &str;

    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, ModelError>;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    pub fn backoff(&self, attempt: usize) -> Duration {
        let capped = attempt.min(5) as u32;
        self.base_delay * (1 << capped)
    }
}

pub async fn with_retries<T, F, Fut>(
    policy: RetryPolicy,
    label: &str,
    mut call: F,
) -> Result<T, ModelError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ModelError>>,
{
    let mut attempt = 0usize;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_transient() && attempt + 1 < policy.max_attempts => {
                attempt += 1;
                let delay = policy.backoff(attempt);
                warn!(
                    call = label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    %error,
                    "retrying model call"
                );
                tokio::time::sleep(delay).await;
            }
            Err(error) => return Err(error),
        }
    }
}

const REFUSAL_PREFIXES: [&str; 8] = [
    "i'm sorry",
    "i am sorry",
    "i cannot",
    "i can't",
    "sorry, i",
    "as an ai",
    "unable to analyze",
    "抱歉",
];

pub fn looks_like_refusal(text: &str) -> bool {
    let lowered = text.trim_start().to_lowercase();
    REFUSAL_PREFIXES
        .iter()
        .any(|prefix| lowered.starts_with(prefix))
}

#[derive(Clone)]
pub struct OpenAiChatModel {
    client: Client,
    endpoint: String,
    model: String,
    timeout: Duration,
    retry: RetryPolicy,
}

impl OpenAiChatModel {
    pub fn new(
        base_url: &str,
        api_key: Option<&str>,
        model: impl Into<String>,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self, ModelError> {
        let api_key = api_key
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .ok_or_else(|| ModelError::MissingCredentials("OPENAI_API_KEY is not set".to_string()))?;

        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|_| ModelError::MissingCredentials("api key is not a valid header".to_string()))?;
        headers.insert(AUTHORIZATION, auth);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            model: model.into(),
            timeout,
            retry,
        })
    }

    fn body(&self, request: &ChatRequest) -> Value {
        let user_content = match &request.image_png {
            Some(png) => json!([
                { "type": "text", "text": request.prompt },
                {
                    "type": "image_url",
                    "image_url": { "url": format!("data:image/png;base64,{}", STANDARD.encode(png)) }
                }
            ]),
            None => json!(request.prompt),
        };

        json!({
            "model": self.model,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
            "messages": [
                { "role": "system", "content": request.system },
                { "role": "user", "content": user_content },
            ],
        })
    }

    async fn send_once(&self, body: &Value) -> Result<ChatResponse, ModelError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(body)
            .send()
            .await
            .map_err(|error| ModelError::from_http(error, self.timeout))?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(ModelError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatCompletion = response
            .json()
            .await
            .map_err(|error| ModelError::from_http(error, self.timeout))?;
        parsed.into_response()
    }
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, ModelError> {
        let body = self.body(request);
        with_retries(self.retry, "chat_completion", || self.send_once(&body)).await
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

impl ChatCompletion {
    fn into_response(self) -> Result<ChatResponse, ModelError> {
        let text = self
            .choices
            .into_iter()
            .find_map(|choice| choice.message.content)
            .ok_or_else(|| ModelError::Malformed("completion has no message content".to_string()))?;
        let usage = self
            .usage
            .map(|usage| TokenUsage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            })
            .unwrap_or_default();
        Ok(ChatResponse { text, usage })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn rate_limits_are_retried_until_success() {
        let calls = AtomicUsize::new(0);
        let result = with_retries(fast_policy(), "test", || {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(ModelError::Status {
                        status: 429,
                        body: "slow down".to_string(),
                    })
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.ok(), Some(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), ModelError> = with_retries(fast_policy(), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(ModelError::Status {
                    status: 400,
                    body: "bad request".to_string(),
                })
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn attempts_are_bounded() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), ModelError> = with_retries(fast_policy(), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ModelError::Timeout(Duration::from_secs(1))) }
        })
        .await;

        assert!(matches!(result, Err(ModelError::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stalled_endpoint_reports_a_transient_timeout() -> Result<(), Box<dyn std::error::Error>> {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        let address = listener.local_addr()?;
        std::thread::spawn(move || {
            if let Ok((stream, _)) = listener.accept() {
                std::thread::sleep(Duration::from_secs(2));
                drop(stream);
            }
        });

        let model = OpenAiChatModel::new(
            &format!("http://{address}/v1"),
            Some("sk-test"),
            "gpt-4o",
            Duration::from_millis(200),
            RetryPolicy::new(1),
        )?;
        let result = model
            .complete(&ChatRequest {
                system: "system".to_string(),
                prompt: "describe".to_string(),
                image_png: None,
                max_tokens: 10,
                temperature: 0.0,
            })
            .await;

        match result {
            Err(error @ ModelError::Timeout(_)) => assert!(error.is_transient()),
            other => panic!("expected a timeout, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn backoff_grows_exponentially() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(2), Duration::from_millis(2_000));
        assert_eq!(policy.backoff(9), Duration::from_millis(16_000));
    }

    #[test]
    fn missing_api_key_fails_at_construction() {
        let result = OpenAiChatModel::new(
            "https://api.openai.com/v1",
            Some("  "),
            "gpt-4o",
            Duration::from_secs(30),
            RetryPolicy::default(),
        );
        assert!(matches!(result, Err(ModelError::MissingCredentials(_))));
    }

    #[test]
    fn image_requests_use_content_parts() -> Result<(), ModelError> {
        let model = OpenAiChatModel::new(
            "https://api.openai.com/v1/",
            Some("sk-test"),
            "gpt-4o",
            Duration::from_secs(30),
            RetryPolicy::default(),
        )?;
        let body = model.body(&ChatRequest {
            system: "system".to_string(),
            prompt: "describe".to_string(),
            image_png: Some(vec![1, 2, 3]),
            max_tokens: 100,
            temperature: 0.1,
        });

        assert_eq!(model.endpoint, "https://api.openai.com/v1/chat/completions");
        let url = body
            .pointer("/messages/1/content/1/image_url/url")
            .and_then(Value::as_str)
            .unwrap_or_default();
        assert_eq!(url, "data:image/png;base64,AQID");
        Ok(())
    }

    #[test]
    fn completion_usage_maps_to_token_usage() -> Result<(), Box<dyn std::error::Error>> {
        let parsed: ChatCompletion = serde_json::from_value(json!({
            "choices": [{ "message": { "content": "page text" } }],
            "usage": { "prompt_tokens": 1200, "completion_tokens": 340 }
        }))?;
        let response = parsed.into_response()?;
        assert_eq!(response.text, "page text");
        assert_eq!(response.usage.input_tokens, 1200);
        assert_eq!(response.usage.output_tokens, 340);
        Ok(())
    }

    #[test]
    fn refusals_are_detected() {
        assert!(looks_like_refusal("I'm sorry, but I can't help with that."));
        assert!(!looks_like_refusal("# Crimp height\nMeasure with a micrometer."));
    }
}
