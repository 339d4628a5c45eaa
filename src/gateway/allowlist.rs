//! Declarative allow-lists for every gateway operation type (spec §4.1,
//! §9 "Plugin-style proxy surface": "allow-lists ... should be data, not
//! code"). Every operation carries an explicit list of permitted
//! subcommands and, per subcommand, an explicit list of permitted flags.
//! Unknown subcommands or flags are rejected with `not_allowed`.

use crate::error::GatewayError;
use std::collections::HashMap;

/// Flags permanently blocked across all git operations regardless of
/// subcommand (spec §4.1 Allow-lists): runtime config override, hook
/// bypass, anything that can execute arbitrary commands, anything that
/// changes git-dir/work-tree.
const GLOBALLY_BLOCKED_FLAG_PREFIXES: &[&str] = &[
    "-c",
    "--git-dir",
    "--work-tree",
    "--exec-path",
    "--upload-pack",
    "--receive-pack",
    "--no-verify",
    "--no-verify-signatures",
    "--upload-pack=",
    "--receive-pack=",
];

/// Allow-list for a single git subcommand: the flags a caller may pass.
#[derive(Debug, Clone)]
pub struct GitSubcommandAllowlist {
    pub subcommand: &'static str,
    pub flags: &'static [&'static str],
}

/// The local-git-exec allow-list: subcommands that only read or mutate the
/// working tree, never network or metadata that would let one container
/// observe another's state (spec §4.2).
pub fn local_git_allowlist() -> &'static [GitSubcommandAllowlist] {
    &[
        GitSubcommandAllowlist { subcommand: "status", flags: &["--short", "--branch", "-s", "-b"] },
        GitSubcommandAllowlist { subcommand: "diff", flags: &["--stat", "--cached", "--name-only", "--name-status"] },
        GitSubcommandAllowlist { subcommand: "log", flags: &["--oneline", "--graph", "-n", "--max-count", "--all"] },
        GitSubcommandAllowlist { subcommand: "add", flags: &["-A", "--all", "-u", "--update", "-p", "--patch"] },
        GitSubcommandAllowlist { subcommand: "commit", flags: &["-m", "--message", "--amend", "-a", "--all"] },
        GitSubcommandAllowlist { subcommand: "branch", flags: &["-a", "--all", "-l", "--list", "-d", "-D"] },
        GitSubcommandAllowlist { subcommand: "checkout", flags: &["-b", "--", "-f", "--force"] },
        GitSubcommandAllowlist { subcommand: "restore", flags: &["--staged", "--worktree"] },
        GitSubcommandAllowlist { subcommand: "show", flags: &["--stat", "--name-only"] },
        GitSubcommandAllowlist { subcommand: "config", flags: &["--global", "--get", "--list"] },
    ]
}

/// The network-git allow-list: subcommands the gateway's `/git/*` endpoints
/// accept, with their permitted flags (spec §4.1 Git-over-network proxy).
pub fn network_git_allowlist() -> &'static [GitSubcommandAllowlist] {
    &[
        GitSubcommandAllowlist { subcommand: "push", flags: &["--force-with-lease", "-u", "--set-upstream"] },
        GitSubcommandAllowlist { subcommand: "fetch", flags: &["--prune", "--tags"] },
        GitSubcommandAllowlist { subcommand: "pull", flags: &["--rebase", "--ff-only"] },
        GitSubcommandAllowlist { subcommand: "ls-remote", flags: &["--heads", "--tags"] },
    ]
}

/// Validate `argv` (subcommand first, flags after) against `table`. Returns
/// `Ok(())` if the subcommand is known and every flag it carries is in the
/// subcommand's permitted set and not in the global block-list.
pub fn validate(argv: &[String], table: &[GitSubcommandAllowlist]) -> Result<(), GatewayError> {
    let Some((subcommand, rest)) = argv.split_first() else {
        return Err(GatewayError::NotAllowed("empty argv".to_string()));
    };

    let entry = table
        .iter()
        .find(|e| e.subcommand == subcommand)
        .ok_or_else(|| GatewayError::NotAllowed(format!("subcommand '{subcommand}' is not allowed")))?;

    for arg in rest {
        if !arg.starts_with('-') {
            // Positional argument (refspec, pathspec, commit message body
            // following -m, etc.) — not a flag, not validated here.
            continue;
        }
        if GLOBALLY_BLOCKED_FLAG_PREFIXES
            .iter()
            .any(|blocked| arg == blocked || arg.starts_with(&format!("{blocked}=")))
        {
            return Err(GatewayError::NotAllowed(format!(
                "flag '{arg}' is globally blocked for git operations"
            )));
        }
        let bare = arg.split('=').next().unwrap_or(arg);
        if !entry.flags.contains(&bare) {
            return Err(GatewayError::NotAllowed(format!(
                "flag '{arg}' is not allowed for 'git {subcommand}'"
            )));
        }
    }

    Ok(())
}

/// Tool names stripped from model requests in private mode (spec §3 glossary
/// "Private mode", §8 boundary behavior), matched case-insensitively.
pub fn private_mode_blocked_tools() -> &'static [&'static str] {
    &["web_search", "web_fetch"]
}

pub fn is_private_mode_blocked_tool(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    private_mode_blocked_tools().contains(&lower.as_str())
}

/// Per-code-hosting-operation allow-list: which repo roles + auth
/// requirements a given REST-ish operation needs (spec §4.1 Code-hosting
/// proxy). Kept as plain data so adding an operation is a table edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeHostOp {
    GetIssueOrPr,
    ListIssuesOrPrs,
    CreateIssueOrPr,
    Comment,
    Review,
    Checks,
    Tree,
}

impl CodeHostOp {
    /// Whether this operation mutates the repository (requires `writable`)
    /// vs. only reads it (requires `writable` or `readable`).
    pub fn is_write(self) -> bool {
        matches!(self, CodeHostOp::CreateIssueOrPr | CodeHostOp::Comment | CodeHostOp::Review)
    }
}

/// Declarative map of protected-branch defaults, merged with whatever a
/// policy record overrides per-repo (spec §4.1: "configurable per policy,
/// default includes main and master").
pub fn default_protected_branches() -> HashMap<&'static str, ()> {
    [("main", ()), ("master", ())].into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_subcommand() {
        let argv = vec!["rebase".to_string()];
        let error = validate(&argv, local_git_allowlist()).unwrap_err();
        assert_eq!(error.kind(), "not_allowed");
    }

    #[test]
    fn rejects_globally_blocked_flag_even_on_allowed_subcommand() {
        let argv = vec!["commit".to_string(), "-c".to_string(), "user.name=x".to_string()];
        let error = validate(&argv, local_git_allowlist()).unwrap_err();
        assert!(error.to_string().contains("globally blocked"));
    }

    #[test]
    fn rejects_git_dir_override() {
        let argv = vec!["status".to_string(), "--git-dir=/tmp/evil".to_string()];
        let error = validate(&argv, local_git_allowlist()).unwrap_err();
        assert!(error.to_string().contains("globally blocked"));
    }

    #[test]
    fn accepts_known_subcommand_and_flags() {
        let argv = vec!["commit".to_string(), "-m".to_string(), "fix bug".to_string()];
        assert!(validate(&argv, local_git_allowlist()).is_ok());
    }

    #[test]
    fn push_is_only_in_network_allowlist() {
        let argv = vec!["push".to_string()];
        assert!(validate(&argv, network_git_allowlist()).is_ok());
        assert!(validate(&argv, local_git_allowlist()).is_err());
    }

    #[test]
    fn private_mode_tool_match_is_case_insensitive() {
        assert!(is_private_mode_blocked_tool("Web_Search"));
        assert!(is_private_mode_blocked_tool("WEB_FETCH"));
        assert!(!is_private_mode_blocked_tool("read_file"));
    }
}
