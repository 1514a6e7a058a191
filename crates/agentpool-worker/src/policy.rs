//! Command execution policy: environment allow-list and command deny-list.
//!
//! The deny-list is a best-effort safety net against catastrophic typos and
//! obvious abuse. It matches the literal command line only and is trivially
//! bypassed through indirection (`$(...)`, aliases, scripts), so it is not a
//! security boundary for untrusted input.

use regex::RegexSet;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Variables passed through from the parent environment by exact name.
pub const DEFAULT_ENV_EXACT: &[&str] = &[
    "PATH", "HOME", "USER", "LOGNAME", "SHELL", "LANG", "TERM", "TMPDIR", "TZ", "PWD", "NODE_ENV",
];

/// Variables passed through by prefix.
pub const DEFAULT_ENV_PREFIXES: &[&str] = &["LC_", "AGENT_", "CLAUDE_", "ANTHROPIC_"];

/// Built-in catastrophic command patterns.
pub const DEFAULT_DENY_PATTERNS: &[&str] = &[
    // recursive deletion of the filesystem root or the home directory
    r"(?:^|[;&|\s])rm\s+(?:-{1,2}[\w-]+\s+)*(?:/\*?|~/?|\$HOME/?)(?:$|[\s;&|])",
    // classic fork bomb and its named variants
    r":\s*\(\s*\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:",
    r"\b\w+\s*\(\s*\)\s*\{\s*\w+\s*\|\s*\w+\s*&\s*\}",
    // filesystem formatting
    r"\bmkfs\b",
    r"\bmke2fs\b",
    r"\bwipefs\b",
    // raw writes to block devices
    r"\bdd\s+[^;&|]*\bof=/dev/(?:sd|hd|nvme|xvd|vd|mmcblk|disk)",
    r">\s*/dev/(?:sd|hd|nvme|xvd|vd|mmcblk|disk)",
    // world-writable root
    r"\bchmod\s+(?:-\w+\s+)*-R\s+(?:-\w+\s+)*0?777\s+/(?:$|\s)",
];

/// Environment allow-list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvPolicy {
    pub exact: Vec<String>,
    pub prefixes: Vec<String>,
}

impl Default for EnvPolicy {
    fn default() -> Self {
        Self {
            exact: DEFAULT_ENV_EXACT.iter().map(|s| s.to_string()).collect(),
            prefixes: DEFAULT_ENV_PREFIXES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl EnvPolicy {
    pub fn allows(&self, name: &str) -> bool {
        self.exact.iter().any(|e| e == name) || self.prefixes.iter().any(|p| name.starts_with(p))
    }

    /// Keep only allowed variables.
    pub fn filter<I>(&self, vars: I) -> Vec<(String, String)>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        vars.into_iter().filter(|(k, _)| self.allows(k)).collect()
    }
}

/// A command line rejected by the deny-list.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("command blocked by policy (matched '{pattern}')")]
pub struct BlockedCommand {
    pub pattern: String,
}

/// Checks command lines against a set of deny patterns.
#[derive(Debug, Clone)]
pub struct CommandGuard {
    set: RegexSet,
}

impl CommandGuard {
    /// Build a guard from explicit patterns.
    pub fn new<I, S>(patterns: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Ok(Self {
            set: RegexSet::new(patterns)?,
        })
    }

    /// The built-in patterns plus any extras.
    pub fn with_defaults(extra: &[String]) -> Result<Self, regex::Error> {
        let patterns = DEFAULT_DENY_PATTERNS
            .iter()
            .map(|p| p.to_string())
            .chain(extra.iter().cloned());
        Self::new(patterns)
    }

    pub fn check(&self, command_line: &str) -> Result<(), BlockedCommand> {
        match self.set.matches(command_line).iter().next() {
            Some(idx) => Err(BlockedCommand {
                pattern: self.set.patterns()[idx].clone(),
            }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> CommandGuard {
        CommandGuard::with_defaults(&[]).unwrap()
    }

    #[test]
    fn test_blocks_catastrophic_commands() {
        let guard = guard();
        for cmd in [
            "rm -rf /",
            "rm -rf /*",
            "sudo rm -rf --no-preserve-root /",
            "echo bye && rm -r -f /",
            "rm -rf ~",
            ":(){ :|:& };:",
            "bomb(){ bomb|bomb& }; bomb",
            "mkfs.ext4 /dev/sda1",
            "dd if=/dev/zero of=/dev/sda bs=1M",
            "cat image.iso > /dev/nvme0n1",
            "chmod -R 777 /",
        ] {
            assert!(guard.check(cmd).is_err(), "expected '{}' to be blocked", cmd);
        }
    }

    #[test]
    fn test_allows_ordinary_commands() {
        let guard = guard();
        for cmd in [
            "rm -rf /tmp/build",
            "rm -rf ./target",
            "ls -la /",
            "echo hello > /dev/null",
            "dd if=/dev/zero of=./disk.img bs=1M count=1",
            "cargo build --release",
            "farm -rf /",
        ] {
            assert!(guard.check(cmd).is_ok(), "expected '{}' to be allowed", cmd);
        }
    }

    #[test]
    fn test_extra_patterns() {
        let guard = CommandGuard::with_defaults(&[r"\bshutdown\b".to_string()]).unwrap();
        let err = guard.check("sudo shutdown -h now").unwrap_err();
        assert_eq!(err.pattern, r"\bshutdown\b");
    }

    #[test]
    fn test_env_filter() {
        let policy = EnvPolicy::default();
        let vars = vec![
            ("PATH".to_string(), "/usr/bin".to_string()),
            ("LC_ALL".to_string(), "C".to_string()),
            ("AWS_SECRET_ACCESS_KEY".to_string(), "shh".to_string()),
            ("ANTHROPIC_API_KEY".to_string(), "k".to_string()),
            ("PATHOLOGICAL".to_string(), "x".to_string()),
        ];
        let kept: Vec<String> = policy.filter(vars).into_iter().map(|(k, _)| k).collect();
        assert_eq!(kept, vec!["PATH", "LC_ALL", "ANTHROPIC_API_KEY"]);
    }
}
