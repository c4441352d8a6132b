//! Typed errors for the provider, runtime and query layers.
//!
//! Library code returns these; the binary wraps them in `anyhow` at the edge.

use thiserror::Error;

/// Failure to get any HTTP response at all (connect, timeout, body read).
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{message}")]
pub struct TransportError {
    pub message: String,
    pub timed_out: bool,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            timed_out: false,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        Self {
            message: err.to_string(),
            timed_out: err.is_timeout(),
        }
    }
}

/// Errors surfaced by a provider call.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// No credentials, or the backend cannot be reached at all.
    #[error("provider '{provider}' is not available\n{hint}")]
    Unavailable { provider: String, hint: String },

    #[error("request to '{provider}' failed: {source}")]
    Transport {
        provider: String,
        #[source]
        source: TransportError,
    },

    #[error("'{provider}' returned HTTP {status}: {body}")]
    Backend {
        provider: String,
        status: u16,
        body: String,
    },

    /// A 2xx response that carried no usable text.
    #[error("'{provider}' returned an empty response")]
    Empty { provider: String },

    #[error("unknown provider '{name}' (known: {known})")]
    UnknownProvider { name: String, known: String },

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl ProviderError {
    pub fn transport(provider: &str, source: TransportError) -> Self {
        Self::Transport {
            provider: provider.to_string(),
            source,
        }
    }

    pub fn empty(provider: &str) -> Self {
        Self::Empty {
            provider: provider.to_string(),
        }
    }

    /// Whether a repeated attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } | Self::Empty { .. } => true,
            Self::Backend { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Errors from installing, starting or provisioning the local runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("no runtime build available for {os}/{arch}")]
    UnsupportedPlatform { os: String, arch: String },

    #[error("runtime download failed: HTTP {status}")]
    DownloadStatus { status: u16 },

    #[error("failed to extract runtime: {0}")]
    Extract(String),

    #[error("failed to launch runtime server: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("runtime server did not become ready after {attempts} attempts")]
    StartupTimeout { attempts: u32, pid: Option<u32> },

    #[error("runtime server exited during startup ({status})")]
    ExitedDuringStartup { status: String },

    #[error("runtime server at {url} is unreachable")]
    Unreachable { url: String },

    #[error("failed to pull model '{model}': {message}")]
    Pull { model: String, message: String },

    #[error("runtime request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(status: u16) -> ProviderError {
        ProviderError::Backend {
            provider: "openai".to_string(),
            status,
            body: "{}".to_string(),
        }
    }

    #[test]
    fn test_transport_and_empty_are_retryable() {
        assert!(ProviderError::transport("openai", TransportError::new("connection reset")).is_retryable());
        assert!(ProviderError::empty("local").is_retryable());
    }

    #[test]
    fn test_backend_retryable_only_for_throttling_and_server_errors() {
        assert!(backend(429).is_retryable());
        assert!(backend(503).is_retryable());
        assert!(!backend(401).is_retryable());
        assert!(!backend(400).is_retryable());
    }

    #[test]
    fn test_unavailable_is_not_retryable() {
        let err = ProviderError::Unavailable {
            provider: "claude".to_string(),
            hint: "set a key".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("set a key"));
    }
}
