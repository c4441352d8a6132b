//! Dictum - natural language to shell commands.
//!
//! Describe what you want in plain words and get back a single shell command,
//! checked for risk before it is shown or run. It supports:
//!
//! - **Several backends**: a managed local runtime, OpenAI-compatible APIs
//!   (OpenAI, DeepSeek, Grok) and the Claude messages API
//! - **Zero-setup local inference**: the runtime is installed, started and
//!   given a model sized to the machine's RAM on first use
//! - **Response normalization** that isolates one command from chatty output
//! - **Risk classification** with a user block list that always wins
//!
//! # Architecture
//!
//! - [`orchestrator`] - Drives one query end-to-end
//! - [`providers`] - Provider enum and registry
//! - [`local`], [`openai_compat`], [`claude`] - Backend wire formats
//! - [`runtime`] - Local runtime install, server lifecycle and models
//! - [`normalizer`] - Extracts a command from model output
//! - [`risk`] - Risk levels and the classifier
//! - [`prompt`] - System context and prompt text
//! - [`executor`] - Runs accepted commands in the user's shell
//! - [`config`] - Configuration file and environment overrides
//! - [`confirm`], [`progress`] - Terminal interaction
//! - [`http_client`] - HTTP client abstraction
//! - [`error`] - Typed errors
//!
//! # Example
//!
//! ```ignore
//! use dictum::config::ConfigStore;
//! use dictum::orchestrator::{QueryOptions, QueryOrchestrator, report};
//! use dictum::providers::ProviderRegistry;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = ConfigStore::default_location()?;
//!     let registry = ProviderRegistry::new(store.load(), store);
//!     let orchestrator = QueryOrchestrator::new(registry);
//!
//!     let options = QueryOptions::default();
//!     let provider = orchestrator.provider(&options)?;
//!     orchestrator.check_available(&provider).await?;
//!     let outcome = orchestrator.run(&provider, "show disk usage", &options).await?;
//!     report(&outcome, false, &mut std::io::stdout(), &mut std::io::stderr())?;
//!     Ok(())
//! }
//! ```

pub mod claude;
pub mod config;
pub mod confirm;
pub mod error;
pub mod executor;
pub mod http_client;
pub mod local;
pub mod normalizer;
pub mod openai_compat;
pub mod orchestrator;
pub mod progress;
pub mod prompt;
pub mod providers;
pub mod risk;
pub mod runtime;
