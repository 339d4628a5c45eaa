//! `setup`: interactive onboarding for a fresh instance directory. Writes
//! `config/secrets.env` (mode 600), `config/repositories.yaml`, and
//! `config/context-filters.yaml` (spec §6 Configuration files). Safe to
//! re-run with `--update` to change a subset of settings, or `--force` to
//! start over from blank defaults.

use anyhow::Context as _;
use clap::Parser;
use dialoguer::{theme::ColorfulTheme, Confirm, Input, Password, Select};
use std::collections::HashMap;
use std::io::Write as _;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "setup", version)]
#[command(about = "interactive setup for a jib instance directory")]
struct Cli {
    #[arg(long)]
    instance_dir: Option<PathBuf>,

    /// Re-run setup against an existing instance, prompting with current
    /// values as defaults instead of starting blank.
    #[arg(long)]
    update: bool,

    /// Ignore any existing configuration and start from blank defaults.
    #[arg(long, conflicts_with = "update")]
    force: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let instance_dir = cli.instance_dir.unwrap_or_else(jib::config::Config::default_instance_dir);
    let config = jib::config::Config::load_from(&instance_dir).context("failed to prepare instance directory")?;

    let theme = ColorfulTheme::default();
    println!("Setting up jib at {}", instance_dir.display());

    let existing_secrets = if cli.force { None } else { read_existing_secrets(&config.secrets_path()) };
    let secrets = prompt_secrets(&theme, existing_secrets.as_ref())?;
    write_secrets(&config.secrets_path(), &secrets)?;
    println!("wrote {}", config.secrets_path().display());

    let repo_yaml = prompt_repositories(&theme)?;
    std::fs::write(config.repositories_path(), repo_yaml).context("failed to write repositories.yaml")?;
    println!("wrote {}", config.repositories_path().display());

    if !config.context_filters_path().exists() || cli.force {
        let filters = prompt_context_filters(&theme)?;
        std::fs::write(config.context_filters_path(), filters).context("failed to write context-filters.yaml")?;
        println!("wrote {}", config.context_filters_path().display());
    }

    println!("\nsetup complete. Start the daemon with `jib-hostd start`.");
    Ok(())
}

fn read_existing_secrets(path: &std::path::Path) -> Option<HashMap<String, String>> {
    let content = std::fs::read_to_string(path).ok()?;
    let mut map = HashMap::new();
    for line in content.lines() {
        if let Some((key, value)) = line.split_once('=') {
            map.insert(key.trim().to_string(), value.trim().trim_matches('"').to_string());
        }
    }
    Some(map)
}

fn prompt_secrets(
    theme: &ColorfulTheme,
    existing: Option<&HashMap<String, String>>,
) -> anyhow::Result<HashMap<String, String>> {
    let mut secrets = HashMap::new();

    let default_str = |key: &str| existing.and_then(|m| m.get(key)).cloned().unwrap_or_default();

    secrets.insert(
        "CHAT_BOT_TOKEN".to_string(),
        Password::with_theme(theme)
            .with_prompt("Slack bot token (xoxb-...)")
            .allow_empty_password(!default_str("CHAT_BOT_TOKEN").is_empty())
            .interact()?,
    );
    secrets.insert(
        "CHAT_SOCKET_TOKEN".to_string(),
        Password::with_theme(theme)
            .with_prompt("Slack app-level socket token (xapp-...)")
            .allow_empty_password(!default_str("CHAT_SOCKET_TOKEN").is_empty())
            .interact()?,
    );

    let auth_style = Select::with_theme(theme)
        .with_prompt("Code-hosting authentication")
        .items(&["GitHub App", "Personal access token"])
        .default(0)
        .interact()?;

    if auth_style == 0 {
        secrets.insert(
            "CODE_HOST_APP_ID".to_string(),
            Input::with_theme(theme)
                .with_prompt("GitHub App ID")
                .default(default_str("CODE_HOST_APP_ID"))
                .interact_text()?,
        );
        secrets.insert(
            "CODE_HOST_INSTALLATION_ID".to_string(),
            Input::with_theme(theme)
                .with_prompt("GitHub App installation ID")
                .default(default_str("CODE_HOST_INSTALLATION_ID"))
                .interact_text()?,
        );
        let key_path: String = Input::with_theme(theme)
            .with_prompt("Path to the GitHub App private key PEM")
            .interact_text()?;
        secrets.insert("CODE_HOST_PRIVATE_KEY_PATH".to_string(), key_path);
    } else {
        secrets.insert(
            "CODE_HOST_TOKEN".to_string(),
            Password::with_theme(theme).with_prompt("GitHub personal access token").interact()?,
        );
    }

    if Confirm::with_theme(theme)
        .with_prompt("Configure an incognito personal token for auth_mode=incognito repositories?")
        .default(false)
        .interact()?
    {
        secrets.insert(
            "INCOGNITO_PERSONAL_TOKEN".to_string(),
            Password::with_theme(theme).with_prompt("Incognito personal access token").interact()?,
        );
    }

    let model_auth = Select::with_theme(theme)
        .with_prompt("Model credential")
        .items(&["OAuth token", "API key"])
        .default(1)
        .interact()?;
    if model_auth == 0 {
        secrets.insert(
            "MODEL_OAUTH_TOKEN".to_string(),
            Password::with_theme(theme).with_prompt("Model OAuth token").interact()?,
        );
    } else {
        secrets.insert("MODEL_API_KEY".to_string(), Password::with_theme(theme).with_prompt("Model API key").interact()?);
    }

    Ok(secrets)
}

fn write_secrets(path: &std::path::Path, secrets: &HashMap<String, String>) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut content = String::new();
    let mut keys: Vec<&String> = secrets.keys().collect();
    keys.sort();
    for key in keys {
        let value = &secrets[key];
        if !value.is_empty() {
            content.push_str(&format!("{key}=\"{value}\"\n"));
        }
    }

    let mut file = std::fs::OpenOptions::new().create(true).write(true).truncate(true).open(path)?;
    file.write_all(content.as_bytes())?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}

fn prompt_repositories(theme: &ColorfulTheme) -> anyhow::Result<String> {
    let github_username: String = Input::with_theme(theme).with_prompt("GitHub bot username").interact_text()?;

    let mut writable_repos = Vec::new();
    loop {
        let repo: String = Input::with_theme(theme)
            .with_prompt("Writable repository (org/name), blank to stop")
            .allow_empty(true)
            .interact_text()?;
        if repo.is_empty() {
            break;
        }
        writable_repos.push(repo);
    }

    let mut readable_repos = Vec::new();
    loop {
        let repo: String = Input::with_theme(theme)
            .with_prompt("Readable-only repository (org/name), blank to stop")
            .allow_empty(true)
            .interact_text()?;
        if repo.is_empty() {
            break;
        }
        readable_repos.push(repo);
    }

    let mut yaml = format!("github_username: {github_username}\nwritable_repos: {writable_repos:?}\nreadable_repos: {readable_repos:?}\n");

    if Confirm::with_theme(theme).with_prompt("Configure an incognito commit identity?").default(false).interact()? {
        let user_handle: String = Input::with_theme(theme).with_prompt("Incognito GitHub user handle").interact_text()?;
        let git_name: String = Input::with_theme(theme).with_prompt("Incognito commit author name").interact_text()?;
        let git_email: String = Input::with_theme(theme).with_prompt("Incognito commit author email").interact_text()?;
        yaml.push_str(&format!(
            "incognito:\n  github_user: {user_handle}\n  git_name: {git_name}\n  git_email: {git_email}\n"
        ));
    }

    Ok(yaml)
}

fn prompt_context_filters(theme: &ColorfulTheme) -> anyhow::Result<String> {
    let mut spaces = Vec::new();
    println!("Configure the documentation spaces the bulk-sync adapter pulls from.");
    loop {
        let id: String =
            Input::with_theme(theme).with_prompt("Documentation space id, blank to stop").allow_empty(true).interact_text()?;
        if id.is_empty() {
            break;
        }
        let base_url: String = Input::with_theme(theme).with_prompt("Base URL for this space").interact_text()?;
        spaces.push((id, base_url));
    }

    let mut yaml = String::from("spaces:\n");
    for (id, base_url) in spaces {
        yaml.push_str(&format!("  - id: {id}\n    base_url: {base_url}\n"));
    }
    Ok(yaml)
}
