//! Turns free-form model output into a single command line.
//!
//! Models disagree on conventions: some wrap the answer in a fenced block,
//! some prefix it with `$ `, some add prose. [`extract_command`] tries the
//! structural signals first and only then falls back to heuristics.

use once_cell::sync::Lazy;
use regex::Regex;

static CODE_BLOCK: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"```(?:bash|sh|shell|zsh|cmd|powershell|console)?[ \t]*\r?\n([\s\S]*?)\r?\n[ \t]*```").ok()
});

static INLINE_CODE: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"`([^`]+)`").ok());

fn first_capture<'t>(pattern: &Option<Regex>, text: &'t str) -> Option<&'t str> {
    pattern
        .as_ref()
        .and_then(|re| re.captures(text))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// Leading labels removed before extraction, with their case sensitivity.
const LABELS: [(&str, bool); 4] = [
    ("command:", true),
    ("cmd:", true),
    ("$ ", false),
    ("> ", false),
];

const PROMPT_MARKERS: [char; 3] = ['$', '>', '#'];

/// Openers that mark a line as an explanation rather than a command.
const PROSE_OPENERS: [&str; 6] = ["I ", "The ", "This ", "To ", "You ", "Here "];

const KNOWN_COMMANDS: &[&str] = &[
    "ls", "cd", "pwd", "cat", "echo", "grep", "find", "mkdir", "rm", "cp", "mv",
    "git", "docker", "kubectl", "npm", "yarn", "pip", "go", "cargo", "make",
    "curl", "wget", "ssh", "scp", "tar", "zip", "unzip", "chmod", "chown",
    "ps", "kill", "top", "df", "du", "head", "tail", "sort", "uniq", "wc",
    "awk", "sed", "cut", "tr", "diff", "touch", "ln", "file", "which",
    "python", "python3", "node", "ruby", "perl", "java", "javac",
    "brew", "apt", "apt-get", "yum", "dnf", "pacman",
    "sudo", "su", "env", "export", "source", "alias",
];

const MAX_COMMAND_LEN: usize = 500;

fn strip_label<'a>(text: &'a str, label: &str, case_insensitive: bool) -> Option<&'a str> {
    let head = text.get(..label.len())?;
    let matches = if case_insensitive {
        head.eq_ignore_ascii_case(label)
    } else {
        head == label
    };
    matches.then(|| &text[label.len()..])
}

fn strip_labels(text: &str) -> &str {
    let mut text = text.trim();
    for (label, case_insensitive) in LABELS {
        if let Some(rest) = strip_label(text, label, case_insensitive) {
            text = rest.trim();
        }
    }
    text
}

fn looks_like_command(line: &str) -> bool {
    if line.is_empty() || line.len() > MAX_COMMAND_LEN {
        return false;
    }
    if PROSE_OPENERS.iter().any(|opener| line.starts_with(opener)) {
        return false;
    }

    KNOWN_COMMANDS.iter().any(|cmd| {
        line == *cmd || line.strip_prefix(cmd).is_some_and(|rest| rest.starts_with(' '))
    })
}

/// Extract the single command line from a raw model response.
///
/// First match wins:
/// 1. leading labels (`Command:`, `$ `, ...) are removed
/// 2. the interior of the first fenced code block
/// 3. the interior of the first inline code span
/// 4. the first line that starts with a prompt marker, marker removed
/// 5. the first line, if it looks like a known command
/// 6. the whole (trimmed) text
pub fn extract_command(raw: &str) -> String {
    let text = strip_labels(raw);

    if let Some(block) = first_capture(&CODE_BLOCK, text) {
        return block.trim().to_string();
    }

    if let Some(span) = first_capture(&INLINE_CODE, text) {
        return span.trim().to_string();
    }

    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(rest) = line.strip_prefix(PROMPT_MARKERS) {
            return rest.trim().to_string();
        }
    }

    if let Some(first) = text.lines().next().map(str::trim) {
        if looks_like_command(first) {
            return first.to_string();
        }
    }

    text.to_string()
}

const LOCAL_PREFIXES: [&str; 5] = ["$ ", "> ", "Command: ", "command: ", "Output: "];

fn is_commentary(line: &str) -> bool {
    line.starts_with('#')
        || line.starts_with("//")
        || line.starts_with("Note:")
        || line.starts_with("This ")
        || line.starts_with("The ")
        || (line.starts_with('\'') && line.contains("not installed"))
}

/// Cleanup applied to local-runtime output before [`extract_command`].
///
/// Small local models tend to add fences and commentary lines even when told
/// not to; this keeps the fenced interior and drops lines that read as notes.
pub fn clean_local_response(raw: &str) -> String {
    let mut response = raw.trim().to_string();

    if response.contains("```") {
        let mut inside = false;
        let mut kept = Vec::new();
        for line in response.lines() {
            if line.trim().starts_with("```") {
                inside = !inside;
                continue;
            }
            if inside {
                kept.push(line);
            }
        }
        if !kept.is_empty() {
            response = kept.join("\n");
        }
    }

    let mut text = response.as_str();
    for prefix in LOCAL_PREFIXES {
        text = text.strip_prefix(prefix).unwrap_or(text);
    }

    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !is_commentary(line))
        .map(str::to_string)
        .unwrap_or_else(|| text.trim().to_string())
}

/// What the model's answer amounts to after extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedCommand {
    /// The text to show or run. For sentinels, the message without `echo`.
    pub command: String,
    /// The model refused the request.
    pub declined: bool,
    /// The model asked for clarification.
    pub ambiguous: bool,
}

impl ExtractedCommand {
    pub fn from_response(raw: &str) -> Self {
        let command = extract_command(raw);
        let message = sentinel_message(&command).map(str::to_string);

        match message {
            Some(msg) if msg.starts_with("Declined") => Self {
                command: msg,
                declined: true,
                ambiguous: false,
            },
            Some(msg) if msg.starts_with("Please specify") => Self {
                command: msg,
                declined: false,
                ambiguous: true,
            },
            _ => Self {
                command,
                declined: false,
                ambiguous: false,
            },
        }
    }

    pub fn is_empty(&self) -> bool {
        self.command.trim().is_empty()
    }
}

/// Unwraps `echo "..."` so both the bare and echoed sentinel forms are seen.
fn sentinel_message(command: &str) -> Option<&str> {
    let unwrapped = command
        .strip_prefix("echo ")
        .map(|rest| rest.trim().trim_matches(|c: char| c == '"' || c == '\''))
        .unwrap_or(command);

    (unwrapped.starts_with("Declined") || unwrapped.starts_with("Please specify")).then_some(unwrapped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extraction_patterns_compile() {
        assert!(CODE_BLOCK.is_some());
        assert!(INLINE_CODE.is_some());
    }

    // =========================================================================
    // extract_command
    // =========================================================================

    #[test]
    fn test_fenced_block_with_language_tag() {
        assert_eq!(extract_command("```bash\nls -la\n```"), "ls -la");
    }

    #[test]
    fn test_fenced_block_wins_over_surrounding_prose() {
        let raw = "Sure! Here you go:\n```sh\nfind . -name \"*.py\"\n```\nThis lists python files.";
        assert_eq!(extract_command(raw), "find . -name \"*.py\"");
    }

    #[test]
    fn test_fenced_block_without_tag() {
        assert_eq!(extract_command("```\n  du -sh *  \n```"), "du -sh *");
    }

    #[test]
    fn test_fenced_single_line_roundtrip() {
        for line in ["git log --oneline", "docker ps -a", "echo 'a # b'"] {
            assert_eq!(extract_command(&format!("```bash\n{}\n```", line)), line);
        }
    }

    #[test]
    fn test_inline_code_span() {
        assert_eq!(extract_command("Run `df -h` to see disk usage"), "df -h");
    }

    #[test]
    fn test_labels_are_stripped() {
        assert_eq!(extract_command("Command: ls -la"), "ls -la");
        assert_eq!(extract_command("COMMAND: ps aux"), "ps aux");
        assert_eq!(extract_command("cmd: pwd"), "pwd");
        assert_eq!(extract_command("$ git status"), "git status");
    }

    #[test]
    fn test_prompt_marker_line() {
        let raw = "To do that, run:\n\n$ free -h\n";
        assert_eq!(extract_command(raw), "free -h");
        assert_eq!(extract_command("Try this\n# apt list --installed"), "apt list --installed");
    }

    #[test]
    fn test_first_line_known_command() {
        assert_eq!(extract_command("tar -czf out.tgz src\nCompresses src."), "tar -czf out.tgz src");
        assert_eq!(extract_command("pwd"), "pwd");
    }

    #[test]
    fn test_prose_falls_through_unchanged() {
        assert_eq!(extract_command("I think you want: ls -la"), "I think you want: ls -la");
        assert_eq!(extract_command("  lsblkx is not a thing  "), "lsblkx is not a thing");
    }

    #[test]
    fn test_known_command_needs_word_boundary() {
        assert!(looks_like_command("git"));
        assert!(!looks_like_command("gitk --all"));
        assert!(!looks_like_command("The ls command"));
        assert!(!looks_like_command(&"ls ".repeat(200)));
    }

    #[test]
    fn test_extract_is_idempotent() {
        let samples = [
            "```bash\nls -la\n```",
            "Command: git status",
            "Run `kubectl get pods -A` now",
            "$ docker ps",
            "> echo hi",
            "I think you want: ls -la",
            "rm -rf ./build",
            "# du -sh .",
        ];
        for raw in samples {
            let once = extract_command(raw);
            assert_eq!(extract_command(&once), once, "not idempotent for {:?}", raw);
        }
    }

    // =========================================================================
    // clean_local_response
    // =========================================================================

    #[test]
    fn test_clean_local_strips_fence_and_commentary() {
        let raw = "```bash\n# list everything\nls -la\n```";
        assert_eq!(clean_local_response(raw), "ls -la");
    }

    #[test]
    fn test_clean_local_skips_notes() {
        let raw = "Note: requires GNU find\nThe command is below\nfind . -mtime -1";
        assert_eq!(clean_local_response(raw), "find . -mtime -1");
    }

    #[test]
    fn test_clean_local_skips_not_installed_fragment() {
        let raw = "'htop' is not installed\ntop -o %MEM";
        assert_eq!(clean_local_response(raw), "top -o %MEM");
    }

    #[test]
    fn test_clean_local_strips_prefix() {
        assert_eq!(clean_local_response("Output: uname -a"), "uname -a");
    }

    #[test]
    fn test_clean_local_all_commentary_returns_text() {
        assert_eq!(clean_local_response("# nothing useful"), "# nothing useful");
        assert_eq!(clean_local_response("   "), "");
    }

    // =========================================================================
    // ExtractedCommand
    // =========================================================================

    #[test]
    fn test_declined_sentinel_in_echo() {
        let extracted = ExtractedCommand::from_response("echo \"Declined: this would wipe the disk\"");
        assert!(extracted.declined);
        assert!(!extracted.ambiguous);
        assert_eq!(extracted.command, "Declined: this would wipe the disk");
    }

    #[test]
    fn test_bare_declined_sentinel() {
        assert!(ExtractedCommand::from_response("echo \"Declined\"").declined);
        assert!(ExtractedCommand::from_response("Declined: no").declined);
    }

    #[test]
    fn test_clarification_sentinel() {
        let extracted = ExtractedCommand::from_response("```\necho 'Please specify: which directory?'\n```");
        assert!(extracted.ambiguous);
        assert_eq!(extracted.command, "Please specify: which directory?");
    }

    #[test]
    fn test_regular_command_is_not_a_sentinel() {
        let extracted = ExtractedCommand::from_response("echo \"hello\"");
        assert!(!extracted.declined && !extracted.ambiguous);
        assert_eq!(extracted.command, "echo \"hello\"");
    }

    #[test]
    fn test_empty_extraction() {
        assert!(ExtractedCommand::from_response("  \n ").is_empty());
    }
}
