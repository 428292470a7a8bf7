//! Text-generation HTTP client (§4.5): two wire shapes selected by config,
//! one non-streaming call per completion request.

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::error::AshletError;
use crate::error::Result;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WireApi {
    Responses,
    ChatCompletions,
}

pub struct GeneratorClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    wire_api: WireApi,
    max_output_tokens: u32,
    temperature: f32,
    stop: Vec<String>,
    attribution: Option<Attribution>,
}

#[derive(Clone)]
pub struct Attribution {
    pub title: String,
    pub referer: String,
}

pub struct GeneratorConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub wire_api: WireApi,
    pub max_output_tokens: u32,
    pub temperature: f32,
    pub stop: Vec<String>,
    pub attribution: Option<Attribution>,
}

impl GeneratorClient {
    pub fn new(config: GeneratorConfig) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(GeneratorClient {
            client,
            base_url: config.base_url,
            api_key: config.api_key,
            model: config.model,
            wire_api: config.wire_api,
            max_output_tokens: config.max_output_tokens,
            temperature: config.temperature,
            stop: config.stop,
            attribution: config.attribution,
        })
    }

    pub async fn generate(&self, system: &str, user: &str) -> Result<String> {
        match self.wire_api {
            WireApi::Responses => self.call_responses(system, user).await,
            WireApi::ChatCompletions => self.call_chat_completions(system, user).await,
        }
    }

    fn request_builder(&self, url: &str) -> reqwest::RequestBuilder {
        let mut builder = self.client.post(url);
        if !self.api_key.is_empty() {
            builder = builder.bearer_auth(&self.api_key);
        }
        if let Some(attribution) = &self.attribution {
            builder = builder
                .header("X-Title", &attribution.title)
                .header("HTTP-Referer", &attribution.referer);
        }
        builder
    }

    async fn call_responses(&self, system: &str, user: &str) -> Result<String> {
        let url = format!("{}/responses", self.base_url.trim_end_matches('/'));
        let payload = ResponsesRequest {
            model: &self.model,
            input: vec![
                ResponsesMessage { role: "system", content: system },
                ResponsesMessage { role: "user", content: user },
            ],
            max_output_tokens: self.max_output_tokens,
            temperature: self.temperature,
            stop: &self.stop,
        };
        let response = self.request_builder(&url).json(&payload).send().await?;
        let body = parse_or_status_error(response).await?;
        let parsed: ResponsesBody = serde_json::from_str(&body)?;
        parsed
            .output
            .into_iter()
            .find(|item| item.kind == "message")
            .and_then(|message| message.content.into_iter().find(|c| c.kind == "output_text"))
            .map(|c| c.text)
            .ok_or(AshletError::EmptyGeneration)
    }

    async fn call_chat_completions(&self, system: &str, user: &str) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let payload = ChatCompletionsRequest {
            model: &self.model,
            messages: vec![
                ChatMessage { role: "system", content: system },
                ChatMessage { role: "user", content: user },
            ],
            max_tokens: self.max_output_tokens,
            temperature: self.temperature,
            stop: &self.stop,
        };
        let response = self.request_builder(&url).json(&payload).send().await?;
        let body = parse_or_status_error(response).await?;
        let parsed: ChatCompletionsBody = serde_json::from_str(&body)?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .filter(|content| !content.is_empty())
            .ok_or(AshletError::EmptyGeneration)
    }
}

async fn parse_or_status_error(response: reqwest::Response) -> Result<String> {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if !status.is_success() {
        let prefix: String = body.chars().take(200).collect();
        return Err(AshletError::UnexpectedStatus(status, prefix));
    }
    Ok(body)
}

#[derive(Serialize)]
struct ResponsesMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponsesRequest<'a> {
    model: &'a str,
    input: Vec<ResponsesMessage<'a>>,
    max_output_tokens: u32,
    temperature: f32,
    stop: &'a [String],
}

#[derive(Deserialize)]
struct ResponsesBody {
    output: Vec<ResponsesOutputItem>,
}

#[derive(Deserialize)]
struct ResponsesOutputItem {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    content: Vec<ResponsesContentItem>,
}

#[derive(Deserialize)]
struct ResponsesContentItem {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatCompletionsRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    stop: &'a [String],
}

#[derive(Deserialize)]
struct ChatCompletionsBody {
    choices: Vec<ChatCompletionsChoice>,
}

#[derive(Deserialize)]
struct ChatCompletionsChoice {
    message: ChatCompletionsMessage,
}

#[derive(Deserialize)]
struct ChatCompletionsMessage {
    #[serde(default)]
    content: String,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use wiremock::matchers::method;
    use wiremock::matchers::path;
    use wiremock::Mock;
    use wiremock::MockServer;
    use wiremock::ResponseTemplate;

    use super::*;

    fn config(server: &MockServer, wire_api: WireApi) -> GeneratorConfig {
        GeneratorConfig {
            base_url: server.uri(),
            api_key: "key".into(),
            model: "test-model".into(),
            wire_api,
            max_output_tokens: 128,
            temperature: 0.2,
            stop: vec![],
            attribution: None,
        }
    }

    #[tokio::test]
    async fn responses_wire_extracts_first_message_output_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/responses"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "output": [
                    {"type": "reasoning", "content": []},
                    {"type": "message", "content": [{"type": "output_text", "text": "git status"}]}
                ]
            })))
            .mount(&server)
            .await;

        let client = GeneratorClient::new(config(&server, WireApi::Responses)).expect("client");
        let text = client.generate("system", "user").await.expect("ok");
        assert_eq!(text, "git status");
    }

    #[tokio::test]
    async fn chat_completions_wire_extracts_first_choice() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"content": "git status"}}]
            })))
            .mount(&server)
            .await;

        let client = GeneratorClient::new(config(&server, WireApi::ChatCompletions)).expect("client");
        let text = client.generate("system", "user").await.expect("ok");
        assert_eq!(text, "git status");
    }

    #[tokio::test]
    async fn missing_content_fails_with_empty_generation() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/responses"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"output": []})))
            .mount(&server)
            .await;

        let client = GeneratorClient::new(config(&server, WireApi::Responses)).expect("client");
        let err = client.generate("system", "user").await.expect_err("should fail");
        assert!(matches!(err, AshletError::EmptyGeneration));
    }

    #[tokio::test]
    async fn non_200_status_carries_status_and_body_prefix() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(503).set_body_string("upstream down"))
            .mount(&server)
            .await;

        let client = GeneratorClient::new(config(&server, WireApi::ChatCompletions)).expect("client");
        let err = client.generate("system", "user").await.expect_err("should fail");
        let message = err.to_string();
        assert!(message.contains("503"));
        assert!(message.contains("upstream down"));
    }
}
