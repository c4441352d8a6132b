//! Local runtime backend (Ollama-style chat API).
//!
//! Setup is lazy: the first call installs and starts the runtime if needed and
//! settles on a model. The chosen model is remembered for later calls.

use crate::config::{ConfigStore, ProviderConfig};
use crate::error::ProviderError;
use crate::http_client::HttpClient;
use crate::normalizer::clean_local_response;
use crate::providers::GenerationRequest;
use crate::runtime::{ProgressFn, RuntimeManager, RuntimeProgress};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

const TOP_P: f32 = 0.7;
const TOP_K: u32 = 20;
const REPEAT_PENALTY: f32 = 1.2;

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    message: Option<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: String,
}

pub struct LocalProvider {
    config: ProviderConfig,
    http: Arc<dyn HttpClient>,
    runtime: RuntimeManager,
    store: Option<ConfigStore>,
    model: Mutex<Option<String>>,
}

impl LocalProvider {
    pub fn new(
        config: ProviderConfig,
        http: Arc<dyn HttpClient>,
        runtime: RuntimeManager,
        store: Option<ConfigStore>,
    ) -> Self {
        Self {
            config,
            http,
            runtime,
            store,
            model: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn runtime(&self) -> &RuntimeManager {
        &self.runtime
    }

    pub async fn is_available(&self) -> bool {
        self.runtime.is_healthy().await
    }

    /// Make sure the server is up and a model is present; returns the model.
    pub async fn prepare(&self, progress: ProgressFn<'_>) -> Result<String, ProviderError> {
        let mut model = self.model.lock().await;
        if let Some(name) = model.as_ref() {
            if self.runtime.is_healthy().await {
                return Ok(name.clone());
            }
        }

        self.runtime.ensure_running(progress).await?;
        let name = self
            .runtime
            .ensure_model(&self.config.model, self.store.as_ref(), progress)
            .await?;
        info!("Local provider using model {}", name);

        *model = Some(name.clone());
        Ok(name)
    }

    fn request_body(&self, model: &str, request: &GenerationRequest) -> Value {
        json!({
            "model": model,
            "messages": [
                { "role": "system", "content": request.system_prompt },
                { "role": "user", "content": request.user_prompt },
            ],
            "stream": false,
            "options": {
                "temperature": request.options.temperature,
                "num_predict": request.options.max_tokens,
                "top_p": TOP_P,
                "top_k": TOP_K,
                "repeat_penalty": REPEAT_PENALTY,
                "stop": request.options.stop,
            }
        })
    }

    pub async fn generate(&self, request: &GenerationRequest) -> Result<String, ProviderError> {
        let name = self.config.name.as_str();
        let mut quiet = |update: RuntimeProgress| debug!("{}", update.status);
        let model = self.prepare(&mut quiet).await?;

        let url = format!("{}/api/chat", self.config.endpoint);
        debug!("POST {} (model {})", url, model);

        let response = self
            .http
            .post_json(&url, &[], &self.request_body(&model, request))
            .await
            .map_err(|e| ProviderError::transport(name, e))?;

        if !response.is_success() {
            return Err(ProviderError::Backend {
                provider: name.to_string(),
                status: response.status,
                body: response.body,
            });
        }

        let chat: ChatResponse =
            serde_json::from_str(&response.body).map_err(|_| ProviderError::empty(name))?;
        let content = chat.message.map(|m| m.content).unwrap_or_default();

        let cleaned = clean_local_response(&content);
        if cleaned.is_empty() {
            return Err(ProviderError::empty(name));
        }
        Ok(cleaned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderKind;
    use crate::http_client::mock::MockHttpClient;
    use crate::providers::GenerationOptions;
    use tempfile::TempDir;

    fn config(endpoint: &str, model: &str) -> ProviderConfig {
        ProviderConfig {
            name: "local".to_string(),
            kind: ProviderKind::Local,
            endpoint: endpoint.to_string(),
            model: model.to_string(),
            api_key: String::new(),
            temperature: 0.0,
            max_tokens: None,
        }
    }

    fn request(cfg: &ProviderConfig) -> GenerationRequest {
        GenerationRequest::new(
            "system".to_string(),
            "list files".to_string(),
            GenerationOptions::for_provider(cfg),
        )
    }

    async fn runtime_with_models(models: &[&str]) -> mockito::ServerGuard {
        let mut server = mockito::Server::new_async().await;
        let listed: Vec<_> = models.iter().map(|m| json!({ "name": m })).collect();
        server
            .mock("GET", "/api/tags")
            .with_body(json!({ "models": listed }).to_string())
            .create_async()
            .await;
        server
    }

    #[tokio::test]
    async fn test_generate_posts_chat_with_resolved_model() {
        let server = runtime_with_models(&["qwen2.5-coder:3b"]).await;
        let home = TempDir::new().unwrap();
        let cfg = config(&server.url(), "");
        let client = Arc::new(MockHttpClient::responding(
            200,
            r#"{"message":{"role":"assistant","content":"```bash\n# list\nls -la\n```"}}"#,
        ));
        let provider = LocalProvider::new(
            cfg.clone(),
            client.clone(),
            RuntimeManager::new(home.path(), &server.url()),
            None,
        );

        let text = provider.generate(&request(&cfg)).await.unwrap();
        assert_eq!(text, "ls -la");

        let sent = client.last_request();
        assert_eq!(sent.url, format!("{}/api/chat", server.url()));
        assert_eq!(sent.body["model"], "qwen2.5-coder:3b");
        assert_eq!(sent.body["stream"], false);
        assert_eq!(sent.body["options"]["num_predict"], 100);
        assert_eq!(sent.body["options"]["top_k"], 20);
        assert_eq!(sent.body["options"]["stop"][0], "\n\n");
    }

    #[tokio::test]
    async fn test_prepare_keeps_configured_model() {
        let server = runtime_with_models(&["llama3.2:3b", "qwen2.5-coder:7b"]).await;
        let home = TempDir::new().unwrap();
        let cfg = config(&server.url(), "llama3.2:3b");
        let provider = LocalProvider::new(
            cfg,
            Arc::new(MockHttpClient::responding(200, "{}")),
            RuntimeManager::new(home.path(), &server.url()),
            None,
        );

        let mut progress = |_: RuntimeProgress| {};
        assert_eq!(provider.prepare(&mut progress).await.unwrap(), "llama3.2:3b");
        assert!(provider.is_available().await);
    }

    #[tokio::test]
    async fn test_empty_content_is_empty_error() {
        let server = runtime_with_models(&["qwen2.5-coder:1.5b"]).await;
        let home = TempDir::new().unwrap();
        let cfg = config(&server.url(), "");
        let provider = LocalProvider::new(
            cfg.clone(),
            Arc::new(MockHttpClient::responding(200, r#"{"message":{"content":"  "}}"#)),
            RuntimeManager::new(home.path(), &server.url()),
            None,
        );

        assert!(matches!(
            provider.generate(&request(&cfg)).await,
            Err(ProviderError::Empty { .. })
        ));
    }

    #[tokio::test]
    async fn test_server_failure_surfaces_runtime_error() {
        let home = TempDir::new().unwrap();
        let binary = crate::runtime::RuntimePaths::under(home.path()).binary;
        std::fs::create_dir_all(binary.parent().unwrap()).unwrap();
        std::fs::write(&binary, "").unwrap();

        let cfg = config("http://127.0.0.1:9", "");
        let runtime = RuntimeManager::new(home.path(), &cfg.endpoint).with_policy(crate::runtime::StartupPolicy {
            attempts: 1,
            interval: std::time::Duration::from_millis(10),
        });
        let provider = LocalProvider::new(
            cfg.clone(),
            Arc::new(MockHttpClient::responding(200, "{}")),
            runtime,
            None,
        );

        let err = provider.generate(&request(&cfg)).await.unwrap_err();
        assert!(matches!(err, ProviderError::Runtime(_)));
        assert!(!err.is_retryable());
    }
}
