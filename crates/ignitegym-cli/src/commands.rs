use std::io::{self, BufRead, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use tokio::sync::broadcast;
use tracing::warn;

use ignitegym_core::models::{AvatarUpload, HistoryByDay, ProfileUpdate, SignUp};
use ignitegym_core::{ApiError, Config, SessionError, SessionEvent, SessionManager, SessionStatus};

use super::Command;

/// Environment variable holding the account password for non-interactive login.
const PASSWORD_ENV: &str = "IGNITEGYM_PASSWORD";

pub async fn run(command: Command, manager: &Arc<SessionManager>, config: &mut Config, json: bool) -> Result<()> {
    match command {
        Command::Login { email } => login(manager, config, email).await,
        Command::Logout => {
            manager.sign_out().await.map_err(friendly)?;
            println!("Signed out.");
            Ok(())
        }
        Command::Status => status(manager, json),
        Command::History => history(manager, json).await,
        Command::Profile { name } => {
            require_session(manager)?;
            let user = manager
                .save_profile(&ProfileUpdate::rename(name))
                .await
                .map_err(friendly)?;
            println!("Profile updated: {}", user.display_name());
            Ok(())
        }
        Command::Avatar { path } => avatar(manager, &path).await,
        Command::Signup { name, email } => signup(manager, name, email).await,
    }
}

/// Print notices for session events that happened while the command ran.
pub fn report_events(events: &mut broadcast::Receiver<SessionEvent>) {
    while let Ok(event) = events.try_recv() {
        if event.is_session_expired() {
            eprintln!("Session expired. Please sign in again with `ignitegym login`.");
        }
    }
}

fn friendly(e: SessionError) -> anyhow::Error {
    warn!(error = %e, "Session operation failed");
    anyhow!(e.user_message())
}

fn friendly_api(e: ApiError) -> anyhow::Error {
    warn!(error = %e, "API request failed");
    anyhow!(e.user_message())
}

fn require_session(manager: &SessionManager) -> Result<()> {
    match manager.status() {
        SessionStatus::Authenticated | SessionStatus::RefreshingToken => Ok(()),
        _ => bail!("Not signed in. Run `ignitegym login` first."),
    }
}

fn prompt_line(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

async fn login(manager: &SessionManager, config: &mut Config, email: Option<String>) -> Result<()> {
    let email = match email.or_else(|| config.last_email.clone()) {
        Some(email) => email,
        None => prompt_line("E-mail: ")?,
    };
    if email.is_empty() {
        bail!("An e-mail is required to sign in");
    }
    let password = match std::env::var(PASSWORD_ENV) {
        Ok(password) => password,
        Err(_) => rpassword::prompt_password("Password: ")?,
    };

    let user = manager.sign_in(&email, &password).await.map_err(friendly)?;
    println!("Signed in as {}.", user.display_name());

    config.last_email = Some(email);
    if let Err(e) = config.save() {
        warn!(error = %e, "Failed to save config");
    }
    Ok(())
}

fn status(manager: &SessionManager, json: bool) -> Result<()> {
    let status = manager.status();
    let user = manager.user();
    if json {
        let value = serde_json::json!({ "status": status, "user": user });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }
    match user {
        Some(user) => println!("Signed in as {} <{}>", user.display_name(), user.email),
        None => println!("Not signed in."),
    }
    Ok(())
}

async fn history(manager: &SessionManager, json: bool) -> Result<()> {
    require_session(manager)?;
    let days = manager.api().fetch_history().await.map_err(friendly_api)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&days)?);
    } else {
        print_history(&days);
    }
    Ok(())
}

fn print_history(days: &[HistoryByDay]) {
    if days.is_empty() {
        println!("No exercises recorded yet.");
        return;
    }
    for day in days {
        println!("{}", day.title);
        for entry in &day.data {
            println!("  {:>5}  {} ({})", entry.hour, entry.name, entry.group);
        }
    }
}

async fn avatar(manager: &SessionManager, path: &Path) -> Result<()> {
    require_session(manager)?;
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("Invalid file name: {}", path.display()))?;

    let user = manager
        .change_avatar(AvatarUpload::from_file_name(file_name, bytes))
        .await
        .map_err(friendly)?;
    println!("Avatar updated: {}", user.avatar.unwrap_or_default());
    Ok(())
}

async fn signup(manager: &SessionManager, name: String, email: String) -> Result<()> {
    let password = rpassword::prompt_password("Password: ")?;
    let confirm = rpassword::prompt_password("Confirm password: ")?;
    if password != confirm {
        bail!("Passwords do not match");
    }

    manager
        .api()
        .create_user(&SignUp { name, email, password })
        .await
        .map_err(friendly_api)?;
    println!("Account created. Sign in with `ignitegym login`.");
    Ok(())
}
