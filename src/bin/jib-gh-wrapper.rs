//! Sandbox-side code-hosting CLI wrapper (spec §4.2 "How code-hosting CLI is
//! forced through the gateway"). Installed inside the container image under
//! the name the agent's tooling expects (`gh` for GitHub). A pure HTTP client
//! against the gateway's `/code/*` endpoints — it never talks to the code
//! host directly and never sees a credential.

use clap::{Parser, Subcommand};

fn gateway_url() -> String {
    std::env::var("JIB_GATEWAY_URL").unwrap_or_else(|_| "http://127.0.0.1:8733".to_string())
}

fn container_id() -> String {
    std::env::var("JIB_CONTAINER_ID").unwrap_or_default()
}

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

#[derive(Parser)]
#[command(name = "gh", about = "jib sandbox code-hosting wrapper")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Pull request operations.
    Pr {
        #[command(subcommand)]
        action: PrAction,
    },
    /// List check runs at a ref.
    Checks {
        #[arg(default_value = "HEAD")]
        r#ref: String,
    },
    /// Fetch the repository tree at a ref.
    Tree {
        #[arg(default_value = "HEAD")]
        r#ref: String,
    },
}

#[derive(Subcommand)]
enum PrAction {
    Create {
        #[arg(long)]
        title: String,
        #[arg(long)]
        body: String,
        #[arg(long)]
        head: String,
        #[arg(long)]
        base: String,
    },
    View {
        number: u64,
    },
    Comment {
        number: u64,
        #[arg(long)]
        body: String,
    },
    Review {
        number: u64,
        #[arg(long)]
        body: Option<String>,
        #[arg(long, default_value = "COMMENT")]
        event: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let repo = resolve_repo_full_name()?;
    let client = reqwest::Client::new();
    let base = gateway_url();
    let container_id = container_id();

    let (path, body) = match cli.command {
        Command::Pr { action } => match action {
            PrAction::Create { title, body, head, base: base_branch } => (
                "/code/pr".to_string(),
                serde_json::json!({
                    "container_id": container_id, "repo": repo,
                    "title": title, "body": body, "head": head, "base": base_branch,
                }),
            ),
            PrAction::View { number } => (format!("/code/pr/{number}?repo={repo}"), serde_json::Value::Null),
            PrAction::Comment { number, body } => (
                format!("/code/pr/{number}/comment"),
                serde_json::json!({ "container_id": container_id, "repo": repo, "body": body }),
            ),
            PrAction::Review { number, body, event } => (
                format!("/code/pr/{number}/review"),
                serde_json::json!({ "container_id": container_id, "repo": repo, "body": body, "event": event }),
            ),
        },
        Command::Checks { r#ref } => (format!("/code/checks/{ref}?repo={repo}"), serde_json::Value::Null),
        Command::Tree { r#ref } => (format!("/code/tree/{ref}?repo={repo}"), serde_json::Value::Null),
    };

    let url = format!("{base}{path}");
    let response = if body.is_null() {
        client.get(&url).send().await?
    } else {
        client.post(&url).json(&body).send().await?
    };

    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    if status.is_success() {
        println!("{text}");
        Ok(())
    } else {
        eprintln!("gh wrapper: gateway rejected request ({status}): {text}");
        std::process::exit(1);
    }
}
