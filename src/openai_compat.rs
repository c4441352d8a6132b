//! Backends speaking the OpenAI chat-completions format (OpenAI, DeepSeek, Grok).

use crate::config::ProviderConfig;
use crate::error::ProviderError;
use crate::http_client::HttpClient;
use crate::providers::GenerationRequest;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<Choice>,
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

pub struct OpenAiCompatibleProvider {
    config: ProviderConfig,
    http: Arc<dyn HttpClient>,
}

impl OpenAiCompatibleProvider {
    pub fn new(config: ProviderConfig, http: Arc<dyn HttpClient>) -> Self {
        Self { config, http }
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn is_available(&self) -> bool {
        !self.config.api_key.is_empty()
    }

    fn request_body(&self, request: &GenerationRequest) -> Value {
        let mut body = json!({
            "model": self.config.model,
            "messages": [
                { "role": "system", "content": request.system_prompt },
                { "role": "user", "content": request.user_prompt },
            ],
            "temperature": request.options.temperature,
            "max_tokens": request.options.max_tokens,
        });
        if !request.options.stop.is_empty() {
            body["stop"] = json!(request.options.stop);
        }
        body
    }

    pub async fn generate(&self, request: &GenerationRequest) -> Result<String, ProviderError> {
        let name = self.config.name.as_str();
        if !self.is_available() {
            return Err(ProviderError::Unavailable {
                provider: name.to_string(),
                hint: format!("no API key configured for {}", name),
            });
        }

        let url = format!("{}/chat/completions", self.config.endpoint);
        let auth = format!("Bearer {}", self.config.api_key);
        debug!("POST {} (model {})", url, self.config.model);

        let response = self
            .http
            .post_json(&url, &[("Authorization", auth.as_str())], &self.request_body(request))
            .await
            .map_err(|e| ProviderError::transport(name, e))?;

        if !response.is_success() {
            return Err(ProviderError::Backend {
                provider: name.to_string(),
                status: response.status,
                body: response.body,
            });
        }

        let completion: ChatCompletion = serde_json::from_str(&response.body).map_err(|e| {
            warn!("Unparseable response from {}: {}", name, e);
            ProviderError::empty(name)
        })?;

        completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty())
            .ok_or_else(|| ProviderError::empty(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderKind;
    use crate::http_client::mock::MockHttpClient;
    use crate::providers::GenerationOptions;

    fn config(api_key: &str) -> ProviderConfig {
        ProviderConfig {
            name: "deepseek".to_string(),
            kind: ProviderKind::OpenAiCompatible,
            endpoint: "https://api.deepseek.com/v1".to_string(),
            model: "deepseek-chat".to_string(),
            api_key: api_key.to_string(),
            temperature: 0.1,
            max_tokens: None,
        }
    }

    fn request() -> GenerationRequest {
        GenerationRequest::new(
            "system".to_string(),
            "list files".to_string(),
            GenerationOptions::for_provider(&config("k")),
        )
    }

    fn provider(client: MockHttpClient) -> (OpenAiCompatibleProvider, Arc<MockHttpClient>) {
        let client = Arc::new(client);
        (OpenAiCompatibleProvider::new(config("sk-abc"), client.clone()), client)
    }

    #[tokio::test]
    async fn test_generate_sends_chat_completion() {
        let (provider, client) = provider(MockHttpClient::responding(
            200,
            r#"{"choices":[{"message":{"role":"assistant","content":"  ls -la \n"}}]}"#,
        ));

        let text = provider.generate(&request()).await.unwrap();
        assert_eq!(text, "ls -la");

        let sent = client.last_request();
        assert_eq!(sent.url, "https://api.deepseek.com/v1/chat/completions");
        assert_eq!(sent.headers, vec![("Authorization".to_string(), "Bearer sk-abc".to_string())]);
        assert_eq!(sent.body["model"], "deepseek-chat");
        assert_eq!(sent.body["messages"][0]["role"], "system");
        assert_eq!(sent.body["messages"][1]["content"], "list files");
        assert_eq!(sent.body["max_tokens"], 256);
        assert!(sent.body.get("stop").is_none());
    }

    #[tokio::test]
    async fn test_missing_key_is_unavailable_without_request() {
        let client = Arc::new(MockHttpClient::responding(200, "{}"));
        let provider = OpenAiCompatibleProvider::new(config(""), client.clone());

        assert!(!provider.is_available());
        let err = provider.generate(&request()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable { .. }));
        assert_eq!(client.request_count(), 0);
    }

    #[tokio::test]
    async fn test_non_success_is_backend_error() {
        let (provider, _) = provider(MockHttpClient::responding(401, r#"{"error":"bad key"}"#));

        match provider.generate(&request()).await {
            Err(ProviderError::Backend { status, body, .. }) => {
                assert_eq!(status, 401);
                assert!(body.contains("bad key"));
            }
            other => panic!("expected backend error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_usable_content_is_empty() {
        for body in [
            r#"{"choices":[]}"#,
            r#"{"choices":[{"message":{"content":"   "}}]}"#,
            r#"{"choices":[{"message":{"content":null}}]}"#,
        ] {
            let (provider, _) = provider(MockHttpClient::responding(200, body));
            let err = provider.generate(&request()).await.unwrap_err();
            assert!(matches!(err, ProviderError::Empty { .. }), "{}", body);
        }
    }

    #[tokio::test]
    async fn test_transport_failure() {
        let (provider, _) = provider(MockHttpClient::failing("connection refused"));
        let err = provider.generate(&request()).await.unwrap_err();

        assert!(matches!(err, ProviderError::Transport { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_real_client_against_mock_server() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .match_header("authorization", "Bearer sk-abc")
            .with_status(200)
            .with_body(r#"{"choices":[{"message":{"content":"df -h"}}]}"#)
            .create_async()
            .await;

        let mut cfg = config("sk-abc");
        cfg.endpoint = format!("{}/v1", server.url());
        let provider = OpenAiCompatibleProvider::new(cfg, Arc::new(crate::http_client::ReqwestHttpClient::new()));

        assert_eq!(provider.generate(&request()).await.unwrap(), "df -h");
        mock.assert_async().await;
    }
}
