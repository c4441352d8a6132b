//! Machine context and prompt construction.

use crate::executor::{ProcessRunner, SystemProcessRunner};

/// Tools worth telling the model about when they are installed.
const KNOWN_TOOLS: &[&str] = &[
    // Version control
    "git", "gh", "svn",
    // Containers
    "docker", "docker-compose", "podman", "kubectl", "helm", "k9s", "minikube",
    // Package managers
    "npm", "yarn", "pnpm", "bun", "pip", "pip3", "pipenv", "poetry",
    "go", "cargo", "brew", "apt", "dnf", "pacman",
    // Languages
    "python", "python3", "node", "deno", "ruby", "php", "java",
    // Build tools
    "make", "cmake", "mvn", "gradle",
    // Cloud
    "terraform", "ansible", "aws", "gcloud", "az", "flyctl", "vercel",
    // Databases
    "psql", "mysql", "mongo", "redis-cli", "sqlite3",
    // Networking
    "curl", "wget", "ssh", "scp", "rsync", "nc", "lsof",
    // Text and search
    "jq", "yq", "fzf", "rg", "fd", "awk", "sed", "grep",
    // Compression
    "tar", "zip", "unzip", "gzip",
    // System
    "htop", "top", "ps", "df", "du", "free",
    // Media
    "ffmpeg", "convert",
];

/// Snapshot of the machine a query runs on. Built per query, never stored.
#[derive(Debug, Clone, PartialEq)]
pub struct SystemContext {
    pub os: String,
    pub arch: String,
    pub shell: String,
    pub working_dir: String,
    pub available_tools: Vec<String>,
}

impl SystemContext {
    pub fn gather() -> Self {
        Self::gather_with(&SystemProcessRunner, std::env::var("SHELL").ok())
    }

    pub fn gather_with(runner: &impl ProcessRunner, shell_env: Option<String>) -> Self {
        let os = std::env::consts::OS.to_string();
        let shell = shell_name(&os, shell_env, runner);

        Self {
            arch: std::env::consts::ARCH.to_string(),
            shell,
            working_dir: std::env::current_dir()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            available_tools: KNOWN_TOOLS
                .iter()
                .filter(|tool| runner.program_exists(tool))
                .map(|tool| tool.to_string())
                .collect(),
            os,
        }
    }

    fn os_hint(&self) -> Option<&'static str> {
        match self.os.as_str() {
            "macos" => Some("macOS: use BSD-style flags (e.g. ls -G for colors)"),
            "linux" => Some("Linux: use GNU-style flags (e.g. ls --color for colors)"),
            "windows" => Some("Windows: prefer PowerShell cmdlets when appropriate"),
            _ => None,
        }
    }
}

fn shell_name(os: &str, shell_env: Option<String>, runner: &impl ProcessRunner) -> String {
    if os == "windows" {
        return if runner.program_exists("pwsh") { "powershell" } else { "cmd" }.to_string();
    }

    shell_env
        .as_deref()
        .and_then(|s| s.rsplit('/').next())
        .filter(|s| !s.is_empty())
        .unwrap_or("sh")
        .to_string()
}

/// Build the system prompt from a context snapshot.
pub fn build_system_prompt(ctx: &SystemContext) -> String {
    let tools = if ctx.available_tools.is_empty() {
        "none detected".to_string()
    } else {
        ctx.available_tools.join(", ")
    };
    let hint = ctx.os_hint().map(|h| format!("\n- Note: {}", h)).unwrap_or_default();

    format!(
        r#"Convert the request to a single shell command. Output ONLY the command, on one line, with no explanation and no markdown.

SYSTEM INFO:
- OS: {os}
- Architecture: {arch}
- Shell: {shell}
- Current directory: {cwd}
- Available tools: {tools}{hint}

EXAMPLES:
"list files" → ls -la
"disk usage" → du -sh *
"find py files" → find . -name "*.py"
"remove txt files" → rm *.txt
"git status" → git status
"ping google" → ping -c 4 google.com
"check memory" → free -h

If the request is too vague to turn into a command, output: echo "Please specify: <what is missing>"
If the request can only be met by destroying the system (e.g. rm -rf /, overwriting a disk, a fork bomb), output: echo "Declined: <reason>"

Command:"#,
        os = ctx.os,
        arch = ctx.arch,
        shell = ctx.shell,
        cwd = ctx.working_dir,
        tools = tools,
        hint = hint,
    )
}

pub fn build_user_prompt(query: &str) -> String {
    query.trim().to_string()
}
