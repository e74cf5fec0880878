//! Termtab - multi-tab remote terminal session client.
//!
//! Connects up to four terminal tabs to a backend that provisions a remote
//! environment per user, streams terminal I/O over one WebSocket per tab,
//! and enforces the backend's quota and cooldown signals on the client.
//!
//! # Architecture
//!
//! - **Registry** - owns every tab, runs the event loop
//! - **Lifecycle** - per-tab state machine and connection tasks
//! - **Credentials** - bearer token and identity, restored at startup
//! - **Policy** - turns fatal control frames into actions
//! - **Terminal / UI** - collaborator traits implemented by a front end
//!
//! # Modules
//!
//! - [`registry`] - Session registry and event loop
//! - [`protocol`] - Control frame codec
//! - [`auth`] - Token validation and OAuth login entry points
//! - [`config`] - Configuration loading/saving

// Library modules
pub mod auth;
pub mod credentials;
pub mod latch;
pub mod lifecycle;
pub mod policy;
pub mod protocol;
pub mod registry;
pub mod terminal;
pub mod ui;
pub mod ws;

pub mod config;
pub mod constants;
pub mod env;
pub mod error;
pub mod storage;
pub mod tab;

// Re-export commonly used types
pub use config::Config;
pub use credentials::{CredentialStore, Identity};
pub use error::{FatalKind, SessionError};
pub use registry::{ConnectOutcome, RegistryEvent, SessionRegistry};
pub use tab::TabId;
pub use ui::{ConsoleUi, NoticeLevel, SessionUi};
