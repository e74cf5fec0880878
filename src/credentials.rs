//! Credential Store.
//!
//! Resolves, adopts and clears the bearer token and identity. Tokens come
//! from the session cookie first and the durable storage backup second.
//! Exactly one credential is active per process, and every change is
//! reported to the UI through [`SessionUi::auth_status_changed`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::auth::{AuthClient, OAUTH_STATE_KEY};
use crate::error::SessionError;
use crate::storage::DurableStorage;
use crate::ui::{NoticeLevel, SessionUi};

/// Storage key for the token backup.
pub const TOKEN_KEY: &str = "terminal_auth_token";
/// Storage key for the user profile.
pub const PROFILE_KEY: &str = "terminal_user_profile";

/// Who the credential belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Login handle. An empty handle makes the identity invalid.
    #[serde(rename = "login")]
    pub handle: String,
    /// Name shown in the UI.
    #[serde(rename = "name")]
    pub display_name: String,
}

impl Identity {
    /// Identity whose handle and display name are both `username`.
    #[must_use]
    pub fn from_username(username: &str) -> Self {
        Self {
            handle: username.to_string(),
            display_name: username.to_string(),
        }
    }

    /// Whether the identity has a handle.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.handle.trim().is_empty()
    }
}

/// Token plus identity.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    /// Opaque bearer token.
    pub token: String,
    /// Token owner.
    pub identity: Identity,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("token", &redact(&self.token))
            .field("identity", &self.identity)
            .finish()
    }
}

/// Token prefix safe for logs.
#[must_use]
pub fn redact(token: &str) -> String {
    let prefix: String = token.chars().take(6).collect();
    format!("{prefix}...")
}

/// Result of restoring state at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// A stored profile and a token were found.
    Authenticated(Identity),
    /// Only a cookie token exists; it must be validated first.
    NeedsValidation(String),
    /// Nothing usable.
    Unauthenticated,
}

/// Owner of the active credential.
#[derive(Debug)]
pub struct CredentialStore {
    cookie: Option<String>,
    storage: DurableStorage,
    active: Option<Credential>,
    auth: AuthClient,
    ui: Arc<dyn SessionUi>,
}

impl CredentialStore {
    /// Store over `storage`, validating against `auth`.
    pub fn new(storage: DurableStorage, auth: AuthClient, ui: Arc<dyn SessionUi>) -> Self {
        Self {
            cookie: None,
            storage,
            active: None,
            auth,
            ui,
        }
    }

    /// Set the session cookie, as issued by the auth server.
    pub fn set_session_cookie(&mut self, token: Option<String>) {
        self.cookie = token.filter(|t| !t.is_empty());
    }

    /// Current session cookie.
    #[must_use]
    pub fn session_cookie(&self) -> Option<&str> {
        self.cookie.as_deref()
    }

    /// Durable storage shared with the rest of the client.
    pub fn storage(&self) -> &DurableStorage {
        &self.storage
    }

    /// Mutable durable storage.
    pub fn storage_mut(&mut self) -> &mut DurableStorage {
        &mut self.storage
    }

    /// Active credential, if authenticated.
    #[must_use]
    pub fn active(&self) -> Option<&Credential> {
        self.active.as_ref()
    }

    /// Whether a credential is active.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.active.is_some()
    }

    /// Bearer token to open a socket with: cookie first, then storage.
    #[must_use]
    pub fn resolve_token(&self) -> Option<String> {
        self.cookie
            .clone()
            .or_else(|| self.storage.get(TOKEN_KEY).map(str::to_string))
            .filter(|t| !t.is_empty())
    }

    fn stored_identity(&self) -> Option<Identity> {
        self.storage
            .get_json::<Identity>(PROFILE_KEY)
            .filter(Identity::is_valid)
    }

    /// Token and stored identity, when both are available.
    ///
    /// A cookie without a stored profile is not enough; such a token has to
    /// go through [`CredentialStore::validate_and_adopt`].
    #[must_use]
    pub fn resolve(&self) -> Option<Credential> {
        let token = self.resolve_token()?;
        let identity = self.stored_identity()?;
        Some(Credential { token, identity })
    }

    /// Restore authentication state at startup.
    pub fn restore(&mut self) -> RestoreOutcome {
        let stored_token = self.storage.get(TOKEN_KEY).map(str::to_string);
        let token = stored_token.clone().or_else(|| self.cookie.clone());

        if let (Some(token), Some(identity)) = (token, self.stored_identity()) {
            log::info!("[Credentials] Restored session for {}", identity.handle);
            self.active = Some(Credential {
                token,
                identity: identity.clone(),
            });
            self.ui.auth_status_changed(Some(&identity));
            return RestoreOutcome::Authenticated(identity);
        }

        if let (Some(cookie), None) = (&self.cookie, stored_token) {
            log::debug!("[Credentials] Cookie token without stored profile, validation needed");
            return RestoreOutcome::NeedsValidation(cookie.clone());
        }

        self.ui.auth_status_changed(None);
        RestoreOutcome::Unauthenticated
    }

    /// Make `token`/`identity` the active credential and persist it.
    pub fn adopt(&mut self, token: &str, identity: Identity) -> Result<(), SessionError> {
        if !identity.is_valid() {
            self.ui
                .notify("Authentication failed: Invalid user profile", NoticeLevel::Error);
            return Err(SessionError::Validation("invalid user profile".to_string()));
        }

        let persisted = self
            .storage
            .set(TOKEN_KEY, token)
            .and_then(|()| self.storage.set_json(PROFILE_KEY, &identity));
        if let Err(e) = persisted {
            log::warn!("[Credentials] Could not persist credential: {e:#}");
        }

        log::info!(
            "[Credentials] Authenticated as {} (token {})",
            identity.handle,
            redact(token)
        );
        self.active = Some(Credential {
            token: token.to_string(),
            identity,
        });
        self.ui
            .auth_status_changed(self.active.as_ref().map(|c| &c.identity));
        Ok(())
    }

    /// Validate `token` with the auth server and adopt it on success.
    ///
    /// On failure the error is reported to the UI and the store stays
    /// unauthenticated. Running it again simply re-adopts.
    pub async fn validate_and_adopt(&mut self, token: &str) -> Result<Identity, SessionError> {
        self.ui.notify("Validating token...", NoticeLevel::Info);

        let identity = match self.auth.validate_token(token).await {
            Ok(identity) => identity,
            Err(e) => {
                log::warn!("[Credentials] {e}");
                self.ui.notify(&e.to_string(), NoticeLevel::Error);
                return Err(e);
            }
        };

        self.adopt(token, identity.clone())?;
        self.ui.notify(
            &format!("Logged in as {}", identity.display_name),
            NoticeLevel::Success,
        );
        Ok(identity)
    }

    /// Forget everything: cookie, stored token, profile and OAuth state.
    pub fn invalidate(&mut self) {
        self.cookie = None;
        self.active = None;
        for key in [TOKEN_KEY, PROFILE_KEY, OAUTH_STATE_KEY] {
            if let Err(e) = self.storage.remove(key) {
                log::warn!("[Credentials] Failed to clear {key}: {e:#}");
            }
        }
        log::info!("[Credentials] Authentication cleared");
        self.ui.auth_status_changed(None);
    }
}
