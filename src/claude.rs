//! Claude messages API backend.

use crate::config::ProviderConfig;
use crate::error::ProviderError;
use crate::http_client::HttpClient;
use crate::providers::GenerationRequest;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

pub struct ClaudeProvider {
    config: ProviderConfig,
    http: Arc<dyn HttpClient>,
}

impl ClaudeProvider {
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
        json!({
            "model": self.config.model,
            "max_tokens": request.options.max_tokens,
            "temperature": request.options.temperature,
            "system": request.system_prompt,
            "messages": [
                { "role": "user", "content": request.user_prompt }
            ]
        })
    }

    pub async fn generate(&self, request: &GenerationRequest) -> Result<String, ProviderError> {
        let name = self.config.name.as_str();
        if !self.is_available() {
            return Err(ProviderError::Unavailable {
                provider: name.to_string(),
                hint: "no Anthropic API key configured".to_string(),
            });
        }

        let url = format!("{}/messages", self.config.endpoint);
        debug!("POST {} (model {})", url, self.config.model);

        let headers = [
            ("x-api-key", self.config.api_key.as_str()),
            ("anthropic-version", ANTHROPIC_VERSION),
        ];
        let response = self
            .http
            .post_json(&url, &headers, &self.request_body(request))
            .await
            .map_err(|e| ProviderError::transport(name, e))?;

        if !response.is_success() {
            return Err(ProviderError::Backend {
                provider: name.to_string(),
                status: response.status,
                body: response.body,
            });
        }

        let message: MessagesResponse = serde_json::from_str(&response.body).map_err(|e| {
            warn!("Failed to parse Claude response: {}", e);
            ProviderError::empty(name)
        })?;

        let text: String = message
            .content
            .iter()
            .filter(|block| block.kind == "text")
            .map(|block| block.text.as_str())
            .collect();

        let text = text.trim();
        if text.is_empty() {
            return Err(ProviderError::empty(name));
        }
        Ok(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderKind;
    use crate::http_client::mock::MockHttpClient;
    use crate::providers::GenerationOptions;

    fn config() -> ProviderConfig {
        ProviderConfig {
            name: "claude".to_string(),
            kind: ProviderKind::Claude,
            endpoint: "https://api.anthropic.com/v1".to_string(),
            model: "claude-3-5-haiku-20241022".to_string(),
            api_key: "sk-ant-test".to_string(),
            temperature: 0.1,
            max_tokens: Some(128),
        }
    }

    fn request() -> GenerationRequest {
        GenerationRequest::new(
            "be terse".to_string(),
            "show disk usage".to_string(),
            GenerationOptions::for_provider(&config()),
        )
    }

    #[tokio::test]
    async fn test_generate_uses_messages_api() {
        let client = Arc::new(MockHttpClient::responding(
            200,
            r#"{"content":[{"type":"text","text":"du -sh"},{"type":"text","text":" *\n"}]}"#,
        ));
        let provider = ClaudeProvider::new(config(), client.clone());

        assert_eq!(provider.generate(&request()).await.unwrap(), "du -sh *");

        let sent = client.last_request();
        assert_eq!(sent.url, "https://api.anthropic.com/v1/messages");
        assert!(sent.headers.contains(&("x-api-key".to_string(), "sk-ant-test".to_string())));
        assert!(sent.headers.contains(&("anthropic-version".to_string(), "2023-06-01".to_string())));
        assert_eq!(sent.body["system"], "be terse");
        assert_eq!(sent.body["messages"].as_array().map(|m| m.len()), Some(1));
        assert_eq!(sent.body["messages"][0]["role"], "user");
        assert_eq!(sent.body["max_tokens"], 128);
    }

    #[tokio::test]
    async fn test_non_text_blocks_are_ignored() {
        let client = Arc::new(MockHttpClient::responding(
            200,
            r#"{"content":[{"type":"tool_use","id":"x"},{"type":"text","text":"pwd"}]}"#,
        ));
        let provider = ClaudeProvider::new(config(), client);
        assert_eq!(provider.generate(&request()).await.unwrap(), "pwd");
    }

    #[tokio::test]
    async fn test_empty_content_is_empty_error() {
        let provider = ClaudeProvider::new(config(), Arc::new(MockHttpClient::responding(200, r#"{"content":[]}"#)));
        assert!(matches!(provider.generate(&request()).await, Err(ProviderError::Empty { .. })));
    }

    #[tokio::test]
    async fn test_overloaded_is_retryable_backend_error() {
        let provider = ClaudeProvider::new(
            config(),
            Arc::new(MockHttpClient::responding(529, r#"{"type":"error","error":{"type":"overloaded_error"}}"#)),
        );

        let err = provider.generate(&request()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Backend { status: 529, .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_missing_key_is_unavailable() {
        let mut cfg = config();
        cfg.api_key.clear();
        let provider = ClaudeProvider::new(cfg, Arc::new(MockHttpClient::responding(200, "{}")));

        assert!(!provider.is_available());
        assert!(matches!(
            provider.generate(&request()).await,
            Err(ProviderError::Unavailable { .. })
        ));
    }
}
