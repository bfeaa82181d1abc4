//! Gridrr CLI - drive a Gridrr session from the terminal.
//!
//! Logs in, shows who is signed in, edits the profile and keeps a session
//! alive with `watch`, which prints every state change, toast and event
//! until interrupted.

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use gridrr_core::auth::ToastCenter;
use gridrr_core::{
    Config, LoginData, ProfileUpdate, SessionEvent, SessionManager, SessionSnapshot, SignupData,
};

/// Directory for a daily rolling log file, when set
const ENV_LOG_DIR: &str = "GRIDRR_LOG_DIR";

const LOG_FILE_PREFIX: &str = "gridrr.log";

const USAGE: &str = "\
Usage: gridrr <command>

Commands:
  login [email]       Sign in and store the access token
  signup              Create an account
  whoami              Show the signed-in user
  update-profile      Change name or email
  change-password     Change the account password
  logout              Sign out and clear the stored token
  watch               Keep the session alive and print every change";

/// Initialize the tracing subscriber for logging.
///
/// The returned guard flushes the log file on drop.
fn init_tracing() -> Option<WorkerGuard> {
    // RUST_LOG controls the level (e.g. RUST_LOG=gridrr_core=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match std::env::var(ENV_LOG_DIR) {
        Ok(dir) if !dir.trim().is_empty() => {
            let appender = tracing_appender::rolling::daily(dir.trim(), LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_writer(writer).with_ansi(false)), Some(guard))
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();
    let _log_guard = init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        eprintln!("{}", USAGE);
        return Ok(());
    };

    let mut config = Config::load()?;
    info!(api = %config.api_base_url, backend = ?config.token_backend, "Gridrr CLI starting");

    let toasts = Arc::new(ToastCenter::new());
    let session = SessionManager::from_config(&config, toasts.clone())?;

    let result = match command.as_str() {
        "login" => login(&session, &mut config, args.get(1).cloned()).await,
        "signup" => signup(&session, &mut config).await,
        "whoami" => whoami(&session).await,
        "update-profile" => update_profile(&session).await,
        "change-password" => change_password(&session).await,
        "logout" => {
            session.logout().await;
            println!("Logged out");
            Ok(())
        }
        "watch" => watch(&session, &toasts).await,
        "-h" | "--help" | "help" => {
            println!("{}", USAGE);
            Ok(())
        }
        other => bail!("Unknown command '{}'\n\n{}", other, USAGE),
    };

    if let Some(toast) = toasts.current() {
        eprintln!("! {}", toast.message);
    }
    result
}

async fn login(session: &SessionManager, config: &mut Config, email: Option<String>) -> Result<()> {
    let email = match email {
        Some(email) => email,
        None => prompt("Email", config.last_email.as_deref())?,
    };
    let password = rpassword::prompt_password("Password: ").context("Failed to read password")?;

    let user = session.login(LoginData { email: email.clone(), password }).await?;
    remember_email(config, email);
    println!("Logged in as {} <{}>", user.full_name(), user.email);
    Ok(())
}

async fn signup(session: &SessionManager, config: &mut Config) -> Result<()> {
    let first_name = prompt("First name", None)?;
    let last_name = prompt("Last name", None)?;
    let email = prompt("Email", None)?;
    let password = rpassword::prompt_password("Password: ").context("Failed to read password")?;
    let accepted_terms = prompt("Accept the terms of service? [y/N]", None)?
        .eq_ignore_ascii_case("y");

    let user = session
        .signup(SignupData {
            first_name,
            last_name,
            email: email.clone(),
            password,
            accepted_terms,
        })
        .await?;
    remember_email(config, email);
    println!("Welcome, {}!", user.full_name());
    Ok(())
}

async fn whoami(session: &SessionManager) -> Result<()> {
    match session.current_user().await? {
        Some(user) => {
            println!("{}", serde_json::to_string_pretty(&user)?);
            if let Some(age) = session.profile_age() {
                println!("Profile fetched {}", age);
            }
            if let Some(at) = session.next_refresh_at() {
                println!("Token refresh due {}", at.format("%Y-%m-%d %H:%M:%S UTC"));
            }
        }
        None => println!("Not logged in"),
    }
    Ok(())
}

async fn update_profile(session: &SessionManager) -> Result<()> {
    let Some(current) = session.current_user().await? else {
        bail!("Not logged in");
    };
    let update = ProfileUpdate {
        first_name: prompt("First name", Some(&current.first_name))?,
        last_name: prompt("Last name", Some(&current.last_name))?,
        email: prompt("Email", Some(&current.email))?,
    };
    let user = session.update_profile(update).await?;
    println!("Profile updated: {} <{}>", user.full_name(), user.email);
    Ok(())
}

async fn change_password(session: &SessionManager) -> Result<()> {
    let current = rpassword::prompt_password("Current password: ")?;
    let new = rpassword::prompt_password("New password: ")?;
    let confirm = rpassword::prompt_password("Repeat new password: ")?;
    if new != confirm {
        bail!("Passwords do not match");
    }
    session.change_password(&current, &new).await?;
    println!("Password changed");
    Ok(())
}

async fn watch(session: &SessionManager, toasts: &ToastCenter) -> Result<()> {
    let mut snapshots = session.subscribe();
    let mut toast_rx = toasts.subscribe();
    let mut events = session.events();

    print_snapshot(&session.start().await);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                print_snapshot(&snapshot);
            }
            changed = toast_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                if let Some(toast) = toast_rx.borrow_and_update().clone() {
                    println!("[toast] {}", toast.message);
                }
            }
            event = events.recv() => match event {
                Ok(SessionEvent::Refreshed) => {
                    let due = session
                        .next_refresh_at()
                        .map(|at| at.format("%H:%M:%S").to_string())
                        .unwrap_or_else(|| "-".to_string());
                    println!("[event] token refreshed, next refresh {}", due);
                }
                Ok(event) => println!("[event] {:?}", event),
                // Lagged: keep going, the snapshot is authoritative
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    Ok(())
}

fn print_snapshot(snapshot: &SessionSnapshot) {
    let who = snapshot
        .user
        .as_ref()
        .map(|u| u.email.as_str())
        .unwrap_or("-");
    println!(
        "[session] {:?} authenticated={} user={}",
        snapshot.phase, snapshot.is_authenticated, who
    );
}

fn remember_email(config: &mut Config, email: String) {
    config.last_email = Some(email);
    if let Err(e) = config.save() {
        tracing::warn!(error = %e, "Failed to save config");
    }
}

/// Read one line from stdin, falling back to `default` on empty input.
fn prompt(label: &str, default: Option<&str>) -> Result<String> {
    match default {
        Some(d) => print!("{} [{}]: ", label, d),
        None => print!("{}: ", label),
    }
    io::stdout().flush()?;

    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    let value = line.trim();
    Ok(match (value.is_empty(), default) {
        (true, Some(d)) => d.to_string(),
        _ => value.to_string(),
    })
}
