//! Termtab CLI - remote terminal sessions from the command line.
//!
//! This is the main binary entry point. See the `termtab` library for the
//! session core.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use termtab::auth::{self, AuthClient, CallbackOutcome};
use termtab::credentials::RestoreOutcome;
use termtab::lifecycle::ConnectionState;
use termtab::storage::DurableStorage;
use termtab::terminal::StdoutTerminalFactory;
use termtab::{Config, ConsoleUi, CredentialStore, SessionRegistry, SessionUi, TabId};
use tokio::sync::mpsc::UnboundedReceiver;

/// Environment variable standing in for the auth server's session cookie.
const TOKEN_ENV: &str = "TERMTAB_AUTH_TOKEN";

/// How often the window size is checked.
const RESIZE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// How often a held connect latch is rechecked.
const LATCH_POLL_INTERVAL: Duration = Duration::from_millis(100);

// CLI
#[derive(Parser)]
#[command(name = "termtab")]
#[command(version)]
#[command(about = "Multi-tab remote terminal sessions")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a GitHub login and print the URL to open
    Login,
    /// Finish a login from the URL the auth server redirected to
    Callback {
        /// Redirect URL, e.g. `http://localhost:8080/?auth_success=true`
        url: String,
        /// Token issued by the auth server (defaults to TERMTAB_AUTH_TOKEN)
        #[arg(long)]
        token: Option<String>,
    },
    /// Connect and attach to a terminal tab
    Connect {
        /// Tab to attach to; missing tabs up to it are created
        #[arg(long, default_value = "1")]
        tab: TabId,
    },
    /// Show login state and backend endpoints
    Status,
    /// Forget the stored credential
    Logout,
    /// Print the configuration, or set one key
    Config {
        key: Option<String>,
        value: Option<String>,
    },
}

fn init_logging(config: &Config) {
    let default_filter = if config.debug { "debug" } else { "info" };
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter));
    builder.format_timestamp_secs();

    // Terminal output owns stdout, so logs go to a file when possible.
    let log_path = match std::env::var("TERMTAB_LOG_FILE") {
        Ok(path) => Some(std::path::PathBuf::from(path)),
        Err(_) => Config::config_dir().ok().map(|dir| dir.join("termtab.log")),
    };
    if let Some(file) = log_path.and_then(|path| std::fs::File::create(path).ok()) {
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();
}

fn build_registry(
    config: &Config,
    attached: TabId,
) -> Result<(SessionRegistry, UnboundedReceiver<TabId>)> {
    let ui: Arc<dyn SessionUi> = Arc::new(ConsoleUi);
    let storage = DurableStorage::open().context("Failed to open local storage")?;
    let auth = AuthClient::new(config)?;

    let mut credentials = CredentialStore::new(storage, auth, Arc::clone(&ui));
    credentials.set_session_cookie(std::env::var(TOKEN_ENV).ok());

    let (terminals, detach_rx) = StdoutTerminalFactory::new(attached);
    let registry = SessionRegistry::new(config.clone(), credentials, ui, Box::new(terminals));
    Ok((registry, detach_rx))
}

/// Drive the registry until the user leaves or every socket is gone.
async fn run_session(
    registry: &mut SessionRegistry,
    detach_rx: &mut UnboundedReceiver<TabId>,
) {
    let mut resize_poll = tokio::time::interval(RESIZE_POLL_INTERVAL);
    let mut window = crossterm::terminal::size().ok();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    while registry.socket_count() > 0 {
        tokio::select! {
            _ = &mut ctrl_c => {
                log::info!("Interrupted");
                break;
            }
            Some(tab) = detach_rx.recv() => {
                log::info!("Detached from tab {tab}");
                break;
            }
            _ = resize_poll.tick() => {
                let current = crossterm::terminal::size().ok();
                if current != window {
                    window = current;
                    registry.resize_all();
                }
            }
            event = registry.next_event() => match event {
                Some(event) => registry.handle_event(event),
                None => break,
            },
        }
    }

    registry.shutdown();
}

/// Create missing tabs up to `target` and connect it.
///
/// Waits out the connect latch when an earlier tab's connect holds it.
async fn open_tab(registry: &mut SessionRegistry, target: TabId) -> Result<()> {
    while registry.session(target).is_none() {
        registry.create_tab()?;
    }

    while !registry.has_socket(target) {
        if !registry.credentials().is_authenticated() {
            anyhow::bail!("Login ended before tab {target} connected");
        }
        if registry.state(target) == Some(ConnectionState::Failed) {
            anyhow::bail!("Tab {target} failed to connect");
        }
        if registry.latch().is_held() {
            tokio::select! {
                Some(event) = registry.next_event() => registry.handle_event(event),
                () = tokio::time::sleep(LATCH_POLL_INTERVAL) => {}
            }
        } else {
            registry.switch_active_tab(target)?;
        }
    }
    Ok(())
}

async fn connect(config: &Config, tab: TabId) -> Result<()> {
    let (mut registry, mut detach_rx) = build_registry(config, tab)?;

    if !registry.restore_session().await? {
        anyhow::bail!("Not logged in. Run `termtab login` first.");
    }
    open_tab(&mut registry, tab).await?;

    run_session(&mut registry, &mut detach_rx).await;
    Ok(())
}

async fn callback(config: &Config, url: &str, token: Option<String>) -> Result<()> {
    match auth::parse_callback(url)? {
        CallbackOutcome::Success => {}
        CallbackOutcome::Failed(reason) => anyhow::bail!("Authentication failed: {reason}"),
        CallbackOutcome::NotACallback => anyhow::bail!("Not an authentication callback: {url}"),
    }

    let token = token
        .or_else(|| std::env::var(TOKEN_ENV).ok())
        .filter(|t| !t.is_empty())
        .with_context(|| format!("No token given; pass --token or set {TOKEN_ENV}"))?;

    let (mut registry, mut detach_rx) = build_registry(config, TabId::FIRST)?;
    registry.complete_login(&token, true).await?;

    run_session(&mut registry, &mut detach_rx).await;
    Ok(())
}

fn login(config: &Config) -> Result<()> {
    let mut storage = DurableStorage::open().context("Failed to open local storage")?;
    let request = auth::begin_login(config, &mut storage)?;

    println!("Open this URL to log in with GitHub:");
    println!();
    println!("  {}", request.authorize_url);
    println!();
    println!("Then run `termtab callback <redirect-url>` with {TOKEN_ENV} set.");
    Ok(())
}

fn status(config: &Config) -> Result<()> {
    let ui: Arc<dyn SessionUi> = Arc::new(ConsoleUi);
    let storage = DurableStorage::open().context("Failed to open local storage")?;
    let mut credentials = CredentialStore::new(storage, AuthClient::new(config)?, ui);
    credentials.set_session_cookie(std::env::var(TOKEN_ENV).ok());

    match credentials.restore() {
        RestoreOutcome::Authenticated(identity) => {
            println!("Logged in as {} ({})", identity.display_name, identity.handle);
        }
        RestoreOutcome::NeedsValidation(_) => {
            println!("Token present, not validated yet");
        }
        RestoreOutcome::Unauthenticated => println!("Not logged in"),
    }
    println!("Auth server: {}", config.auth_server());
    println!("Sessions:    {}", config.ws_url());
    println!("VM type:     {}", config.vm_type);
    Ok(())
}

fn logout(config: &Config) -> Result<()> {
    let (mut registry, _detach_rx) = build_registry(config, TabId::FIRST)?;
    registry.logout();
    println!("Logged out");
    Ok(())
}

fn configure(config: Config, key: Option<String>, value: Option<String>) -> Result<()> {
    let mut json = serde_json::to_value(&config)?;
    match (key, value) {
        (None, _) => println!("{}", serde_json::to_string_pretty(&json)?),
        (Some(key), None) => match json.get(&key) {
            Some(value) => println!("{value}"),
            None => anyhow::bail!("Unknown or unset config key '{key}'"),
        },
        (Some(key), Some(value)) => {
            let parsed = serde_json::from_str::<serde_json::Value>(&value)
                .unwrap_or_else(|_| serde_json::Value::String(value.clone()));
            let serde_json::Value::Object(map) = &mut json else {
                anyhow::bail!("Configuration is not an object");
            };
            map.insert(key.clone(), parsed);
            let updated: Config =
                serde_json::from_value(json).with_context(|| format!("Invalid value for '{key}'"))?;
            updated.save()?;
            println!("Set {key} = {value}");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load()?;
    init_logging(&config);

    match cli.command {
        Commands::Login => login(&config)?,
        Commands::Callback { url, token } => callback(&config, &url, token).await?,
        Commands::Connect { tab } => connect(&config, tab).await?,
        Commands::Status => status(&config)?,
        Commands::Logout => logout(&config)?,
        Commands::Config { key, value } => configure(config, key, value)?,
    }

    Ok(())
}
