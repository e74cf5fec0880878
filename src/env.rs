//! Runtime environment detection.
//!
//! Read from the `TERMTAB_ENV` environment variable. `test` and
//! `system_test` switch local storage from the OS keyring to a JSON file;
//! anything else runs against the keyring.

/// Whether `TERMTAB_ENV` names a test mode.
fn is_test_mode(value: Option<&str>) -> bool {
    matches!(value, Some("test" | "system_test"))
}

/// Returns `true` if running in any test mode (unit tests or system tests).
#[must_use]
pub fn is_any_test() -> bool {
    is_test_mode(std::env::var("TERMTAB_ENV").ok().as_deref())
}

/// Returns `true` if the OS keyring should be bypassed in favour of a file.
#[must_use]
pub fn should_skip_keyring() -> bool {
    is_any_test()
}
