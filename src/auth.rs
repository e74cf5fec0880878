//! Auth server client and GitHub OAuth entry points.
//!
//! The authorization-code exchange happens on the auth server. This client
//! only starts the flow (CSRF state plus authorize URL), recognises the
//! callback redirect, and validates the resulting token against
//! `POST {auth_server}/validate-token`.

use anyhow::{Context, Result};
use rand::Rng;
use reqwest::Url;
use serde::Deserialize;

use crate::config::Config;
use crate::constants::{self, AUTH_COOKIE_NAME};
use crate::credentials::Identity;
use crate::error::SessionError;
use crate::storage::DurableStorage;

/// Storage key for the CSRF state of the pending login.
pub const OAUTH_STATE_KEY: &str = "github_oauth_state";

/// GitHub OAuth authorize endpoint.
const GITHUB_AUTHORIZE_URL: &str = "https://github.com/login/oauth/authorize";

/// Length of the random part of the CSRF state.
const STATE_NONCE_LEN: usize = 13;

/// Response from `POST /validate-token`.
#[derive(Debug, Deserialize)]
pub struct ValidateTokenResponse {
    /// Whether the token is accepted.
    #[serde(default)]
    pub valid: bool,
    /// Owner of the token, present when valid.
    #[serde(default)]
    pub user: Option<ValidatedUser>,
}

/// User record in a validation response.
#[derive(Debug, Deserialize)]
pub struct ValidatedUser {
    /// GitHub login.
    pub username: String,
}

/// HTTP client for the auth server.
#[derive(Debug, Clone)]
pub struct AuthClient {
    client: reqwest::Client,
    auth_server: String,
}

impl AuthClient {
    /// Client for the auth server configured in `config`.
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(constants::HTTP_REQUEST_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            auth_server: config.auth_server(),
        })
    }

    /// Auth server base URL.
    #[must_use]
    pub fn auth_server(&self) -> &str {
        &self.auth_server
    }

    /// Ask the auth server who owns `token`.
    ///
    /// The token is sent as the `auth_token` cookie, the way a browser
    /// would send it with credentials included.
    pub async fn validate_token(&self, token: &str) -> Result<Identity, SessionError> {
        let url = format!("{}/validate-token", self.auth_server);

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("Cookie", format!("{AUTH_COOKIE_NAME}={token}"))
            .send()
            .await
            .map_err(|e| SessionError::Validation(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SessionError::Validation(format!("HTTP error! Status: {status}")));
        }

        let body: ValidateTokenResponse = response
            .json()
            .await
            .map_err(|e| SessionError::Validation(format!("invalid response: {e}")))?;

        match body {
            ValidateTokenResponse {
                valid: true,
                user: Some(user),
            } if !user.username.is_empty() => Ok(Identity::from_username(&user.username)),
            _ => Err(SessionError::Validation("token rejected".to_string())),
        }
    }
}

/// A started login: where to send the user and the state to expect back.
#[derive(Debug, Clone)]
pub struct LoginRequest {
    /// GitHub authorize URL.
    pub authorize_url: Url,
    /// CSRF state embedded in the URL.
    pub state: String,
}

/// Start a GitHub OAuth login.
///
/// Generates a fresh CSRF state `<nonce>_<app name>`, stores it (replacing
/// the state of any earlier attempt) and builds the authorize URL.
pub fn begin_login(config: &Config, storage: &mut DurableStorage) -> Result<LoginRequest> {
    config.validate_for_login()?;

    let client_id = config.github_client_id.as_deref().unwrap_or_default();
    let app_name = config.github_app_name.as_deref().unwrap_or_default();
    let state = format!("{}_{app_name}", state_nonce());

    storage
        .set(OAUTH_STATE_KEY, state.as_str())
        .context("Failed to store OAuth state")?;

    let mut authorize_url = Url::parse(GITHUB_AUTHORIZE_URL)?;
    authorize_url
        .query_pairs_mut()
        .append_pair("client_id", client_id)
        .append_pair("redirect_uri", &config.github_redirect_uri())
        .append_pair("scope", &config.github_scope)
        .append_pair("state", &state);

    log::debug!("[Credentials] OAuth login started for app {app_name}");

    Ok(LoginRequest {
        authorize_url,
        state,
    })
}

fn state_nonce() -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::rng();
    (0..STATE_NONCE_LEN)
        .map(|_| char::from(ALPHABET[rng.random_range(0..ALPHABET.len())]))
        .collect()
}

/// What the auth server reported on the redirect back to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    /// `auth_success=true`: the auth cookie has been issued.
    Success,
    /// The redirect carried an error.
    Failed(String),
    /// The URL is not an OAuth callback.
    NotACallback,
}

/// Interpret the redirect URL the auth server sent the user back to.
pub fn parse_callback(url: &str) -> Result<CallbackOutcome> {
    let url = Url::parse(url).with_context(|| format!("invalid callback URL: {url}"))?;

    let mut outcome = CallbackOutcome::NotACallback;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "auth_success" if value == "true" => return Ok(CallbackOutcome::Success),
            "auth_success" => outcome = CallbackOutcome::Failed("authentication failed".into()),
            "error" => outcome = CallbackOutcome::Failed(value.into_owned()),
            _ => {}
        }
    }
    Ok(outcome)
}
