//! Hands an accepted command to the user's shell.
//!
//! Execution is a plain pass-through with inherited stdio: no sandbox, no
//! output capture. The block list is checked once more right before spawning.

use anyhow::{anyhow, bail, Result};
use std::process::Command;
use tracing::{error, info};

// =============================================================================
// Traits for Dependency Injection
// =============================================================================

/// Trait for running system processes.
///
/// This abstraction enables testing without spawning real processes.
pub trait ProcessRunner: Send + Sync {
    /// Runs `program flag command` with inherited stdio and returns the exit code.
    fn run_shell(&self, shell: &ShellInvocation, command: &str) -> Result<i32>;

    /// Checks if a program exists in PATH.
    fn program_exists(&self, program: &str) -> bool;
}

/// Default process runner using std::process::Command.
pub struct SystemProcessRunner;

impl ProcessRunner for SystemProcessRunner {
    fn run_shell(&self, shell: &ShellInvocation, command: &str) -> Result<i32> {
        let status = Command::new(&shell.program)
            .arg(&shell.flag)
            .arg(command)
            .status()
            .map_err(|e| anyhow!("Failed to launch {}: {}", shell.program, e))?;
        // Killed by a signal: report a generic failure code.
        Ok(status.code().unwrap_or(1))
    }

    fn program_exists(&self, program: &str) -> bool {
        which::which(program).is_ok()
    }
}

/// Shell binary plus the flag that makes it run a command string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellInvocation {
    pub program: String,
    pub flag: String,
}

impl ShellInvocation {
    /// Detect the user's shell from the environment.
    pub fn detect() -> Self {
        Self::detect_with(
            std::env::consts::OS,
            std::env::var("SHELL").ok(),
            &SystemProcessRunner,
        )
    }

    pub fn detect_with(os: &str, shell_env: Option<String>, runner: &impl ProcessRunner) -> Self {
        if os == "windows" {
            return if runner.program_exists("pwsh") {
                Self::new("pwsh", "-Command")
            } else {
                Self::new("cmd", "/C")
            };
        }

        if let Some(shell) = shell_env.filter(|s| !s.trim().is_empty()) {
            return Self::new(&shell, "-c");
        }

        for candidate in ["zsh", "bash", "sh"] {
            if runner.program_exists(candidate) {
                return Self::new(candidate, "-c");
            }
        }
        Self::new("sh", "-c")
    }

    fn new(program: &str, flag: &str) -> Self {
        Self {
            program: program.to_string(),
            flag: flag.to_string(),
        }
    }
}

// =============================================================================
// Executor Implementation
// =============================================================================

/// Runs accepted commands in the user's shell.
///
/// # Example
///
/// ```ignore
/// let executor = Executor::new(ShellInvocation::detect(), vec![]);
/// let code = executor.execute("ls -la")?;
/// ```
pub struct Executor {
    shell: ShellInvocation,
    blocked: Vec<String>,
}

impl Executor {
    pub fn new(shell: ShellInvocation, blocked: Vec<String>) -> Self {
        Self { shell, blocked }
    }

    pub fn shell(&self) -> &ShellInvocation {
        &self.shell
    }

    /// Executes a command in the user's shell and returns its exit code.
    pub fn execute(&self, command: &str) -> Result<i32> {
        self.execute_with_runner(command, &SystemProcessRunner)
    }

    /// Executes a command with an injected runner (for testing).
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The command is empty
    /// - The command contains a blocked substring
    /// - The shell cannot be launched
    pub fn execute_with_runner(&self, command: &str, runner: &impl ProcessRunner) -> Result<i32> {
        let command = command.trim();
        if command.is_empty() {
            bail!("No command provided");
        }

        if let Some(blocked) = self.blocked.iter().find(|b| !b.is_empty() && command.contains(b.as_str())) {
            error!("Refusing blocked command (matched '{}')", blocked);
            bail!("Command is blocked by safety settings (matched '{}')", blocked);
        }

        info!("Executing via {} {}: {}", self.shell.program, self.shell.flag, command);
        let code = runner.run_shell(&self.shell, command)?;
        if code != 0 {
            error!("Command failed with status: {}", code);
        }
        Ok(code)
    }
}

// =============================================================================
// Tool availability
// =============================================================================

const WRAPPERS: [&str; 4] = ["sudo", "env", "nohup", "time"];

const SHELL_BUILTINS: &[&str] = &[
    "echo", "cd", "pwd", "export", "source", "alias", "exit", "return", "set", "unset", "read",
    "eval", "exec", "trap", "wait", "kill", "test", "[", "[[", "if", "for", "while", "case",
    "function", "time", ".", "type", "ulimit", "umask",
];

fn is_operator(word: &str) -> bool {
    matches!(
        word,
        "|" | "||" | "&&" | ">" | ">>" | "<" | "<<" | "2>" | "2>>" | "&>" | "&>>" | "1>" | "1>>"
    )
}

/// The program a command line starts with, skipping wrappers like `sudo`.
///
/// Returns `None` for subshells, substitutions and explicit paths, which
/// cannot be looked up on PATH meaningfully.
pub fn first_tool(command: &str) -> Option<String> {
    let parts: Vec<&str> = command.split_whitespace().collect();
    let mut index = 0;

    loop {
        let word = *parts.get(index)?;
        if word.starts_with('(') || word.starts_with('$') || word.starts_with('`') {
            return None;
        }
        if word.starts_with('/') || word.starts_with("./") || word.starts_with("../") || word.starts_with('~') {
            return None;
        }

        let next = parts.get(index + 1);
        let is_wrapper = WRAPPERS.contains(&word);
        match next {
            Some(next) if is_wrapper && !is_operator(next) && !next.starts_with('-') && !next.contains('=') => {
                index += 1;
            }
            _ => return Some(word.to_string()),
        }
    }
}

/// Whether a tool resolves on PATH. Shell builtins always count as present.
pub fn is_tool_available(tool: &str, runner: &impl ProcessRunner) -> bool {
    tool.is_empty() || SHELL_BUILTINS.contains(&tool) || runner.program_exists(tool)
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Mock process runner for testing.
    pub struct MockProcessRunner {
        exit_code: i32,
        installed: HashSet<String>,
        pub executed: Mutex<Vec<String>>,
    }

    impl MockProcessRunner {
        pub fn with_programs(programs: &[&str]) -> Self {
            Self {
                exit_code: 0,
                installed: programs.iter().map(|p| p.to_string()).collect(),
                executed: Mutex::new(Vec::new()),
            }
        }

        pub fn exiting_with(mut self, code: i32) -> Self {
            self.exit_code = code;
            self
        }
    }

    impl ProcessRunner for MockProcessRunner {
        fn run_shell(&self, _shell: &ShellInvocation, command: &str) -> Result<i32> {
            self.executed.lock().unwrap().push(command.to_string());
            Ok(self.exit_code)
        }

        fn program_exists(&self, program: &str) -> bool {
            self.installed.contains(program)
        }
    }
}
