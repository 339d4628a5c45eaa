//! Sandbox-side `git` wrapper (spec §4.2 "How local git still works", "How
//! network git is forced through the gateway"). Installed as `/usr/bin/git`
//! inside the container image. Never invokes the real git binary for any
//! operation requiring metadata — everything routes to the gateway's
//! `/git/local` or network endpoints, which run against the real worktree
//! on the host side.

use std::io::Write as _;
use std::path::{Path, PathBuf};

const NETWORK_SUBCOMMANDS: &[&str] = &["push", "fetch", "pull", "ls-remote"];

fn gateway_url() -> String {
    std::env::var("JIB_GATEWAY_URL").unwrap_or_else(|_| "http://127.0.0.1:8733".to_string())
}

fn container_id() -> String {
    std::env::var("JIB_CONTAINER_ID").unwrap_or_default()
}

/// Resolve which repository `full_name` the current working directory
/// belongs to by walking up to the nearest `.jib-repo-fullname` marker file,
/// dropped at the mount root by the container lifecycle manager.
fn resolve_repo_full_name() -> anyhow::Result<String> {
    let mut dir = std::env::current_dir()?;
    loop {
        let marker = dir.join(".jib-repo-fullname");
        if marker.exists() {
            return Ok(std::fs::read_to_string(marker)?.trim().to_string());
        }
        if !dir.pop() {
            anyhow::bail!("not inside a jib-managed repository (no .jib-repo-fullname marker found)");
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    if args.first().map(String::as_str) == Some("--version") {
        println!("git version 2.43.0 (jib sandbox wrapper)");
        return Ok(());
    }

    let Some(subcommand) = args.first() else {
        anyhow::bail!("usage: git <subcommand> [args...]");
    };

    // `git config --global` edits $HOME/.gitconfig directly, with no git
    // binary involved at all (spec §4.2).
    if subcommand == "config" && args.iter().any(|a| a == "--global") {
        return handle_global_config(&args[1..]);
    }

    if NETWORK_SUBCOMMANDS.contains(&subcommand.as_str()) {
        return route_network(subcommand, &args[1..]).await;
    }

    route_local(&args).await
}

fn handle_global_config(args: &[String]) -> anyhow::Result<()> {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_string());
    let gitconfig_path = Path::new(&home).join(".gitconfig");

    // Strip the --global flag; remaining is `key value` or `--get key` or `--list`.
    let rest: Vec<&String> = args.iter().filter(|a| a.as_str() != "--global").collect();

    if rest.first().map(|s| s.as_str()) == Some("--list") {
        if gitconfig_path.exists() {
            print!("{}", std::fs::read_to_string(&gitconfig_path)?);
        }
        return Ok(());
    }

    if rest.first().map(|s| s.as_str()) == Some("--get") {
        let key = rest.get(1).map(|s| s.as_str()).unwrap_or_default();
        let content = std::fs::read_to_string(&gitconfig_path).unwrap_or_default();
        if let Some(value) = find_config_value(&content, key) {
            println!("{value}");
        }
        return Ok(());
    }

    let (Some(key), Some(value)) = (rest.first(), rest.get(1)) else {
        anyhow::bail!("usage: git config --global <key> <value>");
    };

    let mut content = std::fs::read_to_string(&gitconfig_path).unwrap_or_default();
    content = upsert_config_value(&content, key, value);
    std::fs::write(&gitconfig_path, content)?;
    Ok(())
}

fn find_config_value(content: &str, dotted_key: &str) -> Option<String> {
    let (section, key) = dotted_key.split_once('.')?;
    let mut in_section = false;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with('[') {
            in_section = trimmed == format!("[{section}]");
            continue;
        }
        if in_section {
            if let Some((k, v)) = trimmed.split_once('=') {
                if k.trim() == key {
                    return Some(v.trim().to_string());
                }
            }
        }
    }
    None
}

fn upsert_config_value(content: &str, dotted_key: &str, value: &str) -> String {
    let Some((section, key)) = dotted_key.split_once('.') else {
        return content.to_string();
    };
    let section_header = format!("[{section}]");

    if content.contains(&section_header) {
        let mut out = String::new();
        let mut in_section = false;
        let mut written = false;
        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed == section_header {
                in_section = true;
                out.push_str(line);
                out.push('\n');
                continue;
            }
            if in_section && trimmed.starts_with('[') {
                if !written {
                    out.push_str(&format!("\t{key} = {value}\n"));
                    written = true;
                }
                in_section = false;
            }
            if in_section {
                if let Some((k, _)) = trimmed.split_once('=') {
                    if k.trim() == key {
                        out.push_str(&format!("\t{key} = {value}\n"));
                        written = true;
                        continue;
                    }
                }
            }
            out.push_str(line);
            out.push('\n');
        }
        if in_section && !written {
            out.push_str(&format!("\t{key} = {value}\n"));
        }
        out
    } else {
        format!("{content}{section_header}\n\t{key} = {value}\n")
    }
}

async fn route_local(argv: &[String]) -> anyhow::Result<()> {
    let repo = resolve_repo_full_name()?;
    let body = serde_json::json!({
        "container_id": container_id(),
        "repo": repo,
        "argv": argv,
    });

    let client = reqwest::Client::new();
    let response: serde_json::Value = client
        .post(format!("{}/git/local", gateway_url()))
        .json(&body)
        .send()
        .await?
        .json()
        .await?;

    if let Some(stdout) = response.get("stdout").and_then(|v| v.as_str()) {
        print!("{stdout}");
    }
    if let Some(stderr) = response.get("stderr").and_then(|v| v.as_str()) {
        eprint!("{stderr}");
    }
    std::io::stdout().flush().ok();

    let exit_code = response.get("exit_code").and_then(|v| v.as_i64()).unwrap_or(0);
    std::process::exit(exit_code as i32);
}

async fn route_network(subcommand: &str, argv: &[String]) -> anyhow::Result<()> {
    let repo = resolve_repo_full_name()?;
    // The refspec / remote ref is the last positional (non-flag) argument.
    let refspec = argv
        .iter()
        .rev()
        .find(|a| !a.starts_with('-'))
        .cloned()
        .unwrap_or_default();

    let body = serde_json::json!({
        "container_id": container_id(),
        "repo": repo,
        "refspec": refspec,
        "subcommand": subcommand,
    });

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{}/git/{}", gateway_url(), subcommand))
        .json(&body)
        .send()
        .await?;

    let status = response.status();
    if status.is_success() {
        let parsed: serde_json::Value = response.json().await?;
        if let Some(stdout) = parsed.get("stdout").and_then(|v| v.as_str()) {
            print!("{stdout}");
        }
        Ok(())
    } else {
        let body = response.text().await.unwrap_or_default();
        eprintln!("git {subcommand} rejected by gateway ({status}): {body}");
        // 60 signals "blocked by proxy/firewall" (spec §6 exit codes).
        std::process::exit(60);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_adds_new_section_when_absent() {
        let out = upsert_config_value("", "user.name", "Agent Bot");
        assert!(out.contains("[user]"));
        assert!(out.contains("name = Agent Bot"));
    }

    #[test]
    fn upsert_replaces_existing_key() {
        let existing = "[user]\n\tname = Old Name\n\temail = old@example.com\n";
        let out = upsert_config_value(existing, "user.name", "New Name");
        assert!(out.contains("name = New Name"));
        assert!(!out.contains("Old Name"));
        assert!(out.contains("old@example.com"));
    }

    #[test]
    fn find_config_value_reads_nested_key() {
        let content = "[user]\n\tname = Agent Bot\n\temail = bot@example.com\n";
        assert_eq!(find_config_value(content, "user.email").as_deref(), Some("bot@example.com"));
    }

    #[test]
    fn path_buf_unused_import_is_fine() {
        let _: Option<PathBuf> = None;
    }
}
