//! Configuration loading and persistence.
//!
//! Reads `config.json` from the config directory, applies `TERMTAB_*`
//! environment overrides, and derives the backend URLs from
//! `backend_domain` when they are not given explicitly. The bearer token is
//! never part of the config file; it lives in [`crate::storage`].

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::time::Duration;
use std::{fs, path::PathBuf};

use crate::constants;

const LOCAL_AUTH_SERVER: &str = "http://localhost:3000";
const LOCAL_WS_URL: &str = "ws://localhost:8081";
const LOCAL_REDIRECT_URI: &str = "http://localhost:3000/auth/github/callback";

/// Configuration for the termtab client.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Domain running the auth and session servers, e.g. `example.com`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_domain: Option<String>,
    /// Session WebSocket endpoint. Derived from `backend_domain` when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ws_url: Option<String>,
    /// Auth server base URL. Derived from `backend_domain` when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_server: Option<String>,
    /// Kind of remote environment requested from the backend.
    pub vm_type: String,
    /// GitHub OAuth app client id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub github_client_id: Option<String>,
    /// GitHub OAuth app name, appended to the CSRF state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub github_app_name: Option<String>,
    /// OAuth scope requested at login.
    pub github_scope: String,
    /// OAuth redirect URI. Derived from `backend_domain` when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub github_redirect_uri: Option<String>,
    /// Minimum terminal width sent in resize frames.
    pub default_cols: u16,
    /// Minimum terminal height sent in resize frames.
    pub default_rows: u16,
    /// Milliseconds a socket may take to open.
    pub connection_timeout_ms: u64,
    /// Milliseconds the connect latch stays held after an attempt resolves.
    pub connect_cooloff_ms: u64,
    /// Milliseconds between a fatal policy signal and closing all sockets.
    pub teardown_grace_ms: u64,
    /// Verbose logging.
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend_domain: None,
            ws_url: None,
            auth_server: None,
            vm_type: "cka".to_string(),
            github_client_id: None,
            github_app_name: None,
            github_scope: "read:user".to_string(),
            github_redirect_uri: None,
            default_cols: constants::DEFAULT_COLS,
            default_rows: constants::DEFAULT_ROWS,
            connection_timeout_ms: constants::CONNECTION_TIMEOUT.as_millis() as u64,
            connect_cooloff_ms: constants::CONNECT_COOLOFF.as_millis() as u64,
            teardown_grace_ms: constants::TEARDOWN_GRACE.as_millis() as u64,
            debug: false,
        }
    }
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// Directory selection priority:
    /// 1. `TERMTAB_CONFIG_DIR` env var: explicit override
    /// 2. Any test mode: `tmp/termtab-test` under the crate
    /// 3. Default: platform config dir + `termtab`
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("TERMTAB_CONFIG_DIR") {
            PathBuf::from(dir)
        } else if cfg!(test) || crate::env::is_any_test() {
            PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tmp/termtab-test")
        } else {
            dirs::config_dir()
                .context("Could not determine config directory")?
                .join("termtab")
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config dir {}", dir.display()))?;
        Ok(dir)
    }

    /// Loads configuration from file, with environment variable overrides.
    ///
    /// A missing or unreadable file falls back to defaults.
    pub fn load() -> Result<Self> {
        let mut config = match Self::load_from_file() {
            Ok(config) => config,
            Err(e) => {
                log::debug!("Using default config: {e:#}");
                Self::default()
            }
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn load_from_file() -> Result<Self> {
        let config_path = Self::config_dir()?.join("config.json");
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        serde_json::from_str(&content).context("Invalid config.json")
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(domain) = std::env::var("TERMTAB_BACKEND_DOMAIN") {
            self.backend_domain = Some(domain);
        }
        if let Ok(url) = std::env::var("TERMTAB_WS_URL") {
            self.ws_url = Some(url);
        }
        if let Ok(url) = std::env::var("TERMTAB_AUTH_SERVER") {
            self.auth_server = Some(url);
        }
        if let Ok(vm_type) = std::env::var("TERMTAB_VM_TYPE") {
            self.vm_type = vm_type;
        }
        if let Ok(id) = std::env::var("TERMTAB_GITHUB_CLIENT_ID") {
            self.github_client_id = Some(id);
        }
        if let Ok(name) = std::env::var("TERMTAB_GITHUB_APP_NAME") {
            self.github_app_name = Some(name);
        }
        if let Ok(timeout) = std::env::var("TERMTAB_CONNECTION_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse::<u64>() {
                self.connection_timeout_ms = ms;
            }
        }
        if let Ok(debug) = std::env::var("TERMTAB_DEBUG") {
            self.debug = matches!(debug.as_str(), "1" | "true" | "yes");
        }
    }

    /// Persists the current configuration to disk.
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_dir()?.join("config.json");
        fs::write(&config_path, serde_json::to_string_pretty(self)?)?;

        #[cfg(unix)]
        fs::set_permissions(&config_path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// Whether the client targets a local development backend.
    #[must_use]
    pub fn is_localhost(&self) -> bool {
        match self.backend_domain.as_deref() {
            None => true,
            Some(domain) => {
                let domain = domain.trim_start_matches("www.");
                domain == "localhost" || domain.starts_with("127.0.0.1")
            }
        }
    }

    fn remote_domain(&self) -> Option<&str> {
        if self.is_localhost() {
            None
        } else {
            self.backend_domain.as_deref()
        }
    }

    /// Session WebSocket endpoint.
    #[must_use]
    pub fn ws_url(&self) -> String {
        match (&self.ws_url, self.remote_domain()) {
            (Some(url), _) => url.clone(),
            (None, Some(domain)) => format!("wss://wss.{domain}"),
            (None, None) => LOCAL_WS_URL.to_string(),
        }
    }

    /// Auth server base URL, without trailing slash.
    #[must_use]
    pub fn auth_server(&self) -> String {
        let url = match (&self.auth_server, self.remote_domain()) {
            (Some(url), _) => url.clone(),
            (None, Some(domain)) => format!("https://auth.{domain}"),
            (None, None) => LOCAL_AUTH_SERVER.to_string(),
        };
        url.trim_end_matches('/').to_string()
    }

    /// OAuth redirect URI registered with GitHub.
    #[must_use]
    pub fn github_redirect_uri(&self) -> String {
        match (&self.github_redirect_uri, self.remote_domain()) {
            (Some(uri), _) => uri.clone(),
            (None, Some(domain)) => format!("https://auth.{domain}/auth/github/callback"),
            (None, None) => LOCAL_REDIRECT_URI.to_string(),
        }
    }

    /// Socket open timeout.
    #[must_use]
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    /// Connect latch cool-off.
    #[must_use]
    pub fn connect_cooloff(&self) -> Duration {
        Duration::from_millis(self.connect_cooloff_ms)
    }

    /// Grace delay before policy-driven teardown.
    #[must_use]
    pub fn teardown_grace(&self) -> Duration {
        Duration::from_millis(self.teardown_grace_ms)
    }

    /// Check the options required to start an OAuth login.
    ///
    /// Remote deployments additionally need explicit URLs when no
    /// `backend_domain` is available to derive them from.
    pub fn validate_for_login(&self) -> Result<()> {
        let mut missing = Vec::new();
        if self.github_client_id.as_deref().is_none_or(str::is_empty) {
            missing.push("github_client_id");
        }
        if self.github_app_name.as_deref().is_none_or(str::is_empty) {
            missing.push("github_app_name");
        }
        // A half-configured remote setup would send the login to one host
        // and the sessions to localhost.
        if self.backend_domain.is_none() && self.auth_server.is_some() != self.ws_url.is_some() {
            missing.push("backend_domain");
        }
        if missing.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("Missing required options: {}", missing.join(", "))
        }
    }
}
