//! Drives one query end-to-end.
//!
//! Provider lookup, availability check, prompt building, generation (with
//! optional retry), extraction, risk classification and the final decision
//! on what to do with the command.

use crate::config::{Config, RetryConfig};
use crate::error::ProviderError;
use crate::executor::{first_tool, is_tool_available, Executor, ProcessRunner, ShellInvocation, SystemProcessRunner};
use crate::normalizer::ExtractedCommand;
use crate::prompt::{build_system_prompt, build_user_prompt, SystemContext};
use crate::providers::{GenerationRequest, Provider, ProviderRegistry};
use crate::risk::{RiskAssessment, RiskClassifier, RiskLevel};
use std::io::{self, Write};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum QueryError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("Could not extract a command from the response. Try being more specific.")]
    EmptyCommand,
}

/// Per-invocation options from the command line.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Overrides the configured provider.
    pub provider: Option<String>,
    /// Run the command after showing it.
    pub execute: bool,
    pub verbose: bool,
}

/// What should happen to a generated command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Print only.
    Show,
    /// Print, then run.
    Run,
    /// Print, ask, then run if accepted.
    Confirm,
    /// Print with a blocking warning. Never run.
    Refuse,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The model refused the request.
    Declined { message: String },
    /// The model asked for more detail.
    NeedsClarification { message: String },
    Command {
        command: String,
        assessment: RiskAssessment,
        /// First program of the command when it is not on PATH.
        missing_tool: Option<String>,
        action: Action,
    },
}

/// Pick the action for a command of the given risk.
pub fn decide_action(level: RiskLevel, execute: bool, confirm_dangerous: bool) -> Action {
    match level {
        RiskLevel::Critical => Action::Refuse,
        _ if !execute => Action::Show,
        RiskLevel::Dangerous if confirm_dangerous => Action::Confirm,
        _ => Action::Run,
    }
}

/// Capped exponential backoff: `base * 2^attempt`, at most `max`.
fn backoff_delay(retry: &RetryConfig, attempt: u32) -> Duration {
    let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    let delay = retry.base_delay_ms.saturating_mul(factor).min(retry.max_delay_ms);
    Duration::from_millis(delay)
}

pub struct QueryOrchestrator<R: ProcessRunner = SystemProcessRunner> {
    config: Config,
    registry: ProviderRegistry,
    classifier: RiskClassifier,
    executor: Executor,
    runner: R,
    shell_env: Option<String>,
}

impl QueryOrchestrator<SystemProcessRunner> {
    pub fn new(registry: ProviderRegistry) -> Self {
        Self::with_runner(
            registry,
            SystemProcessRunner,
            ShellInvocation::detect(),
            std::env::var("SHELL").ok(),
        )
    }
}

impl<R: ProcessRunner> QueryOrchestrator<R> {
    pub fn with_runner(
        registry: ProviderRegistry,
        runner: R,
        shell: ShellInvocation,
        shell_env: Option<String>,
    ) -> Self {
        let config = registry.config().clone();
        let blocked = config.safety.blocked_commands.clone();
        Self {
            classifier: RiskClassifier::new(blocked.clone()),
            executor: Executor::new(shell, blocked),
            config,
            registry,
            runner,
            shell_env,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The override from `options`, or the configured default.
    pub fn provider(&self, options: &QueryOptions) -> Result<Provider, QueryError> {
        let provider = match options.provider.as_deref() {
            Some(name) => self.registry.resolve(name)?,
            None => self.registry.default_provider()?,
        };
        Ok(provider)
    }

    /// API providers without credentials fail here with a setup hint. The
    /// local provider is left to start its runtime on demand.
    pub async fn check_available(&self, provider: &Provider) -> Result<(), QueryError> {
        if matches!(provider, Provider::Local(_)) || provider.is_available().await {
            return Ok(());
        }
        Err(ProviderError::Unavailable {
            provider: provider.name().to_string(),
            hint: provider.setup_hint(),
        }
        .into())
    }

    /// Generate, retrying only errors that may clear up on their own.
    pub async fn generate(
        &self,
        provider: &Provider,
        request: &GenerationRequest,
    ) -> Result<String, ProviderError> {
        let retry = &self.config.retry;
        let mut attempt = 0;
        loop {
            match provider.generate(request).await {
                Ok(text) => return Ok(text),
                Err(err) if err.is_retryable() && attempt < retry.max_retries => {
                    let delay = backoff_delay(retry, attempt);
                    warn!(
                        "Attempt {} of {} failed: {}; retrying in {:?}",
                        attempt + 1,
                        retry.max_retries + 1,
                        err,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Turn a natural-language query into an [`Outcome`].
    pub async fn run(
        &self,
        provider: &Provider,
        query: &str,
        options: &QueryOptions,
    ) -> Result<Outcome, QueryError> {
        info!("Query via {}: {}", provider.name(), query);

        let context = SystemContext::gather_with(&self.runner, self.shell_env.clone());
        debug!("Context: {:?}", context);

        let request = provider.request(build_system_prompt(&context), build_user_prompt(query));
        let raw = self.generate(provider, &request).await?;
        debug!("Raw response: {:?}", raw);

        let extracted = ExtractedCommand::from_response(&raw);
        if extracted.declined {
            return Ok(Outcome::Declined {
                message: extracted.command,
            });
        }
        if extracted.ambiguous {
            return Ok(Outcome::NeedsClarification {
                message: extracted.command,
            });
        }
        if extracted.is_empty() {
            return Err(QueryError::EmptyCommand);
        }

        let command = extracted.command;
        let assessment = self.classifier.assess(&command);
        let missing_tool = first_tool(&command).filter(|tool| !is_tool_available(tool, &self.runner));
        let action = decide_action(
            assessment.level,
            options.execute,
            self.config.safety.require_confirm_dangerous,
        );
        info!("Command '{}' is {} -> {:?}", command, assessment.level, action);

        Ok(Outcome::Command {
            command,
            assessment,
            missing_tool,
            action,
        })
    }

    /// Run an accepted command in the user's shell; returns its exit code.
    pub fn execute(&self, command: &str) -> anyhow::Result<i32> {
        self.executor.execute_with_runner(command, &self.runner)
    }
}

/// Print an outcome. The command itself goes to `out`, everything else to
/// `err`, so `$(dictum ...)` captures only the command.
pub fn report<O: Write, E: Write>(outcome: &Outcome, verbose: bool, out: &mut O, err: &mut E) -> io::Result<()> {
    match outcome {
        Outcome::Declined { message } | Outcome::NeedsClarification { message } => {
            writeln!(out, "{}", message)?;
        }
        Outcome::Command {
            command,
            assessment,
            missing_tool,
            ..
        } => {
            match assessment.level {
                RiskLevel::Critical => {
                    writeln!(err, "⛔ DANGER: This command is destructive! It will not be run.")?;
                    if assessment.rule.is_blocked() {
                        writeln!(err, "   Blocked by safety settings: {}", assessment.rule)?;
                    } else {
                        writeln!(err, "   {}", assessment.rule)?;
                    }
                }
                RiskLevel::Dangerous => {
                    writeln!(err, "⚠️  WARNING: Review before running ({})", assessment.rule)?;
                }
                RiskLevel::Safe | RiskLevel::Moderate if verbose => {
                    writeln!(err, "Risk: {} ({})", assessment.level, assessment.rule)?;
                }
                _ => {}
            }

            writeln!(out, "{}", command)?;

            if let Some(tool) = missing_tool {
                writeln!(err, "💡 Note: '{}' is not installed", tool)?;
            }
        }
    }
    Ok(())
}
