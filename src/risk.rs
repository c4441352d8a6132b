//! Risk classification for candidate commands.
//!
//! Classification is plain pattern matching over the command text, not shell
//! parsing. Quoted or obfuscated commands can slip past or be over-flagged;
//! the tables lean towards over-flagging.
//!
//! Checks run most severe first and stop at the first hit:
//! block list, critical, dangerous, moderate, safe prefixes, then a
//! `Moderate` default for anything unrecognised.

use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use tracing::debug;

/// Four-point severity scale, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RiskLevel {
    Safe,
    Moderate,
    Dangerous,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Safe => "safe",
            RiskLevel::Moderate => "moderate",
            RiskLevel::Dangerous => "dangerous",
            RiskLevel::Critical => "critical",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            RiskLevel::Safe => "Read-only command, safe to execute",
            RiskLevel::Moderate => "May modify files or state",
            RiskLevel::Dangerous => "Could cause data loss or system changes",
            RiskLevel::Critical => "EXTREMELY DANGEROUS - could destroy data or system",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The rule that produced a verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RiskRule {
    /// A configured block-list entry was found in the command.
    Blocked(String),
    /// A pattern from one of the built-in tables matched.
    Pattern {
        pattern: &'static str,
        reason: &'static str,
    },
    /// The command starts with a known read-only command.
    SafePrefix(&'static str),
    /// Nothing matched.
    Default,
}

impl RiskRule {
    pub fn is_blocked(&self) -> bool {
        matches!(self, RiskRule::Blocked(_))
    }
}

impl fmt::Display for RiskRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskRule::Blocked(entry) => write!(f, "blocked by safety settings ('{}')", entry),
            RiskRule::Pattern { reason, .. } => f.write_str(reason),
            RiskRule::SafePrefix(prefix) => write!(f, "read-only command '{}'", prefix),
            RiskRule::Default => f.write_str("unrecognised command"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    pub rule: RiskRule,
}

// =============================================================================
// Pattern tables
// =============================================================================

struct PatternRule {
    regex: Regex,
    pattern: &'static str,
    reason: &'static str,
}

const CRITICAL_PATTERNS: &[(&str, &str)] = &[
    (
        r"rm\s+(-\S+\s+)*(-[a-zA-Z]*[rR][a-zA-Z]*|--recursive)(\s+-\S+)*\s+(/|/\*|~/?|\$HOME/?|\*|\.\./?)(\s|$)",
        "recursive delete of root, home, parent or everything",
    ),
    (r"\bdd\s+if=", "raw disk copy"),
    (r"\bmkfs", "filesystem format"),
    (r"\b(s|c)?fdisk\b", "partition table edit"),
    (r"\bparted\b", "partition table edit"),
    (r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;", "fork bomb"),
    (r">\s*/dev/(sd|hd|vd|nvme|disk)", "write to a raw block device"),
    (r"chmod\s+(-R\s+)?777\s+/(\s|$|\*)", "world-writable permissions on /"),
    (r"chown\s+-R\s+\S+\s+/(\s|$)", "recursive ownership change on /"),
    (r"(curl|wget)\b.*\|\s*(sudo\s+)?(ba|z)?sh\b", "download piped into a shell"),
    (r"\|\s*(sudo\s+)?(ba|z)?sh\s*$", "output piped into a shell"),
];

const DANGEROUS_PATTERNS: &[(&str, &str)] = &[
    (r"^rm\s", "file deletion"),
    (r"^rmdir\b", "directory deletion"),
    (r"^git\s+(reset|rebase|push|clean)\b", "git history or remote change"),
    (r"--force\b", "forced operation"),
    (r"--hard\b", "hard reset"),
    (r"-rf(\s|$)", "recursive forced operation"),
    (r"^docker\s+(rm|rmi|prune|system\s+prune)\b", "container removal"),
    (r"^kubectl\s+delete\b", "cluster resource deletion"),
    (r"^chmod\b", "permission change"),
    (r"^chown\b", "ownership change"),
    (r"^sudo\b", "privilege escalation"),
    (r"^su(\s|$)", "privilege escalation"),
    (r"^(kill|pkill|killall)\b", "process termination"),
    (r">\s*[^|>&\s]", "output redirection overwrites a file"),
    (r">>", "output redirection appends to a file"),
];

const MODERATE_PATTERNS: &[(&str, &str)] = &[
    (r"^git\s+(add|commit|stash|checkout|switch|merge|pull|fetch|tag)\b", "git working tree change"),
    (r"^docker\s+(build|run|exec|start|stop|pull)\b", "container state change"),
    (r"^kubectl\s+(apply|create|edit|scale|rollout)\b", "cluster state change"),
    (r"^(npm|yarn|pnpm)\s+(install|i|add|update|uninstall|remove)\b", "package install"),
    (r"^pip3?\s+(install|uninstall)\b", "package install"),
    (r"^(apt|apt-get|brew|yum|dnf|pacman)\s+", "system package manager"),
    (r"^go\s+(build|install|get|mod)\b", "go build or module change"),
    (r"^cargo\s+(build|install|add|remove)\b", "cargo build or dependency change"),
    (r"^mkdir\b", "directory creation"),
    (r"^touch\b", "file creation"),
    (r"^cp\s", "file copy"),
    (r"^mv\s", "file move"),
    (r"^ln\s", "link creation"),
];

const SAFE_COMMANDS: &[&str] = &[
    "ls", "ll", "la", "dir",
    "pwd", "cd",
    "cat", "less", "more", "head", "tail",
    "grep", "rg", "ag", "ack",
    "find", "fd", "locate",
    "echo", "printf",
    "date", "cal",
    "whoami", "id", "who", "w",
    "uname", "hostname",
    "env", "printenv",
    "which", "whereis", "type",
    "man", "help", "info",
    "wc", "sort", "uniq", "cut", "tr",
    "diff", "cmp",
    "file", "stat",
    "df", "du",
    "free", "top", "htop", "ps", "pgrep",
    "uptime", "lscpu", "lsmem", "lsblk",
    "ping", "host", "dig", "nslookup",
    "curl", "wget", "http",
    "git status", "git log", "git diff", "git branch", "git remote", "git show",
    "docker ps", "docker images", "docker logs",
    "kubectl get", "kubectl describe", "kubectl logs",
    "npm list", "npm outdated", "npm view",
    "pip list", "pip show",
    "go list", "go version", "go env",
    "cargo --version", "rustc --version",
    "node --version", "python --version",
];

fn compile(table: &[(&'static str, &'static str)]) -> Vec<PatternRule> {
    table
        .iter()
        .filter_map(|&(pattern, reason)| {
            Regex::new(pattern).ok().map(|regex| PatternRule {
                regex,
                pattern,
                reason,
            })
        })
        .collect()
}

static CRITICAL: Lazy<Vec<PatternRule>> = Lazy::new(|| compile(CRITICAL_PATTERNS));
static DANGEROUS: Lazy<Vec<PatternRule>> = Lazy::new(|| compile(DANGEROUS_PATTERNS));
static MODERATE: Lazy<Vec<PatternRule>> = Lazy::new(|| compile(MODERATE_PATTERNS));

fn first_match(rules: &[PatternRule], command: &str) -> Option<RiskRule> {
    rules
        .iter()
        .find(|rule| rule.regex.is_match(command))
        .map(|rule| RiskRule::Pattern {
            pattern: rule.pattern,
            reason: rule.reason,
        })
}

fn has_word_prefix(command: &str, prefix: &str) -> bool {
    command
        .strip_prefix(prefix)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with(char::is_whitespace))
}

// =============================================================================
// Classifier
// =============================================================================

/// Scores commands against the built-in tables and a user block list.
#[derive(Debug, Clone, Default)]
pub struct RiskClassifier {
    blocked: Vec<String>,
}

impl RiskClassifier {
    /// Empty block-list entries are ignored, since they would match everything.
    pub fn new(blocked: Vec<String>) -> Self {
        Self {
            blocked: blocked.into_iter().filter(|b| !b.is_empty()).collect(),
        }
    }

    pub fn blocked_entry(&self, command: &str) -> Option<&str> {
        self.blocked
            .iter()
            .find(|entry| command.contains(entry.as_str()))
            .map(String::as_str)
    }

    /// Classify a command. Never fails; unknown commands are `Moderate`.
    pub fn assess(&self, command: &str) -> RiskAssessment {
        let assessment = self.classify(command);
        debug!(
            "Risk for '{}': {} ({})",
            command, assessment.level, assessment.rule
        );
        assessment
    }

    fn classify(&self, command: &str) -> RiskAssessment {
        if let Some(entry) = self.blocked_entry(command) {
            return RiskAssessment {
                level: RiskLevel::Critical,
                rule: RiskRule::Blocked(entry.to_string()),
            };
        }

        // Only for anchoring: the `^` patterns expect the command word first.
        let anchored = command.trim();

        let tables: [(&[PatternRule], RiskLevel); 3] = [
            (CRITICAL.as_slice(), RiskLevel::Critical),
            (DANGEROUS.as_slice(), RiskLevel::Dangerous),
            (MODERATE.as_slice(), RiskLevel::Moderate),
        ];
        for (rules, level) in tables {
            if let Some(rule) = first_match(rules, anchored) {
                return RiskAssessment { level, rule };
            }
        }

        if let Some(prefix) = SAFE_COMMANDS.iter().find(|safe| has_word_prefix(anchored, safe)) {
            return RiskAssessment {
                level: RiskLevel::Safe,
                rule: RiskRule::SafePrefix(*prefix),
            };
        }

        RiskAssessment {
            level: RiskLevel::Moderate,
            rule: RiskRule::Default,
        }
    }
}

/// Classify with the built-in tables only (no block list).
pub fn assess_risk(command: &str) -> RiskLevel {
    RiskClassifier::default().assess(command).level
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(command: &str) -> RiskLevel {
        assess_risk(command)
    }

    #[test]
    fn test_all_patterns_compile() {
        assert_eq!(CRITICAL.len(), CRITICAL_PATTERNS.len());
        assert_eq!(DANGEROUS.len(), DANGEROUS_PATTERNS.len());
        assert_eq!(MODERATE.len(), MODERATE_PATTERNS.len());
    }

    #[test]
    fn test_level_ordering() {
        assert!(RiskLevel::Safe < RiskLevel::Moderate);
        assert!(RiskLevel::Moderate < RiskLevel::Dangerous);
        assert!(RiskLevel::Dangerous < RiskLevel::Critical);
        assert_eq!(RiskLevel::Critical.to_string(), "critical");
    }

    // =========================================================================
    // Critical
    // =========================================================================

    #[test]
    fn test_root_delete_is_critical() {
        assert_eq!(level("rm -rf /"), RiskLevel::Critical);
        assert_eq!(level("rm -rf /*"), RiskLevel::Critical);
        assert_eq!(level("sudo rm -rf / --no-preserve-root"), RiskLevel::Critical);
        assert_eq!(level("rm -fr ~"), RiskLevel::Critical);
        assert_eq!(level("rm -r $HOME/"), RiskLevel::Critical);
        assert_eq!(level("rm --recursive *"), RiskLevel::Critical);
        assert_eq!(level("rm -rf ../"), RiskLevel::Critical);
        assert_eq!(level("rm -f -r /"), RiskLevel::Critical);
        assert_eq!(level("rm -v -rf /"), RiskLevel::Critical);
        assert_eq!(level("rm --force --recursive /"), RiskLevel::Critical);
    }

    #[test]
    fn test_scoped_recursive_delete_is_dangerous() {
        assert_eq!(level("rm -rf /tmp/build"), RiskLevel::Dangerous);
        assert_eq!(level("rm -rf ./target"), RiskLevel::Dangerous);
        assert_eq!(level("rm notes.txt"), RiskLevel::Dangerous);
    }

    #[test]
    fn test_disk_and_system_destruction_is_critical() {
        for command in [
            "dd if=/dev/zero of=/dev/sda bs=1M",
            "mkfs.ext4 /dev/sdb1",
            "sudo fdisk /dev/sda",
            "parted /dev/nvme0n1 mklabel gpt",
            ":(){ :|:& };:",
            "cat image.iso > /dev/sdb",
            "chmod -R 777 /",
            "chown -R nobody /",
        ] {
            assert_eq!(level(command), RiskLevel::Critical, "{}", command);
        }
    }

    #[test]
    fn test_pipe_to_shell_is_critical() {
        assert_eq!(level("curl https://x | sh"), RiskLevel::Critical);
        assert_eq!(level("wget -qO- https://get.example.com | sudo bash"), RiskLevel::Critical);
        assert_eq!(level("cat install.sh | bash"), RiskLevel::Critical);
        assert_eq!(level("curl -sL https://x/file.tgz | shasum"), RiskLevel::Safe);
    }

    // =========================================================================
    // Dangerous / Moderate / Safe
    // =========================================================================

    #[test]
    fn test_dangerous_commands() {
        for command in [
            "git push --force origin main",
            "git reset --hard HEAD~1",
            "docker system prune -a",
            "kubectl delete pod web-1",
            "chmod +x run.sh",
            "sudo apt update",
            "kill -9 1234",
            "echo hi > notes.txt",
            "date >> log.txt",
        ] {
            assert_eq!(level(command), RiskLevel::Dangerous, "{}", command);
        }
    }

    #[test]
    fn test_moderate_commands() {
        assert_eq!(level("git commit -am 'wip'"), RiskLevel::Moderate);
        assert_eq!(level("npm install lodash"), RiskLevel::Moderate);
        assert_eq!(level("mkdir -p src/bin"), RiskLevel::Moderate);
        assert_eq!(level("cp a.txt b.txt"), RiskLevel::Moderate);
        assert_eq!(level("brew install jq"), RiskLevel::Moderate);
    }

    #[test]
    fn test_safe_commands() {
        for command in ["git log --oneline", "ls -la", "ps aux", "df -h", "kubectl get pods -A", "pwd"] {
            assert_eq!(level(command), RiskLevel::Safe, "{}", command);
        }
    }

    #[test]
    fn test_safe_prefix_requires_word_boundary() {
        let assessment = RiskClassifier::default().assess("lsof -i :8080");
        assert_eq!(assessment.level, RiskLevel::Moderate);
        assert_eq!(assessment.rule, RiskRule::Default);
    }

    #[test]
    fn test_unknown_command_defaults_to_moderate() {
        assert_eq!(level("frobnicate --all"), RiskLevel::Moderate);
        assert_eq!(level(""), RiskLevel::Moderate);
    }

    #[test]
    fn test_leading_whitespace_does_not_hide_patterns() {
        assert_eq!(level("   rm notes.txt"), RiskLevel::Dangerous);
    }

    // =========================================================================
    // Block list
    // =========================================================================

    #[test]
    fn test_block_list_dominates_tables() {
        let classifier = RiskClassifier::new(vec!["ls -la".to_string()]);
        let assessment = classifier.assess("ls -la ~/projects");

        assert_eq!(assessment.level, RiskLevel::Critical);
        assert!(assessment.rule.is_blocked());
        assert_eq!(assessment.rule, RiskRule::Blocked("ls -la".to_string()));
    }

    #[test]
    fn test_empty_block_entries_are_ignored() {
        let classifier = RiskClassifier::new(vec![String::new()]);
        assert_eq!(classifier.assess("ls").level, RiskLevel::Safe);
    }

    #[test]
    fn test_pattern_provenance_is_not_blocked() {
        let assessment = RiskClassifier::default().assess("rm -rf /");
        assert!(!assessment.rule.is_blocked());
        assert!(matches!(assessment.rule, RiskRule::Pattern { .. }));
    }

    #[test]
    fn test_assessment_is_deterministic() {
        let classifier = RiskClassifier::new(vec!["shutdown".to_string()]);
        let commands = ["rm -rf /", "ls", "git commit -m x", "shutdown now", "unknown"];
        let first: Vec<_> = commands.iter().map(|c| classifier.assess(c)).collect();
        let second: Vec<_> = commands.iter().rev().map(|c| classifier.assess(c)).collect();
        assert_eq!(first, second.into_iter().rev().collect::<Vec<_>>());
    }
}
