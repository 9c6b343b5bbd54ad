//! Field manager name attached to every write
//!
//! Resolution order: an explicit per-client override, then the process-wide
//! override installed at startup with [`init_field_manager`], then the name of
//! the running binary, then `"unknown"`.

use std::path::Path;
use std::sync::OnceLock;

/// Fallback when no name can be derived
pub const UNKNOWN_FIELD_MANAGER: &str = "unknown";

static PROCESS_OVERRIDE: OnceLock<String> = OnceLock::new();
static DERIVED_DEFAULT: OnceLock<String> = OnceLock::new();

/// Install the process-wide field manager name
///
/// Only the first call has an effect; returns false when a name was already
/// installed.
pub fn init_field_manager(name: impl Into<String>) -> bool {
    PROCESS_OVERRIDE.set(name.into()).is_ok()
}

/// Derive a field manager name from a binary path
pub fn field_manager_from_binary(argv0: &str) -> Option<String> {
    Path::new(argv0)
        .file_stem()
        .and_then(|s| s.to_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Pick the first non-empty name
pub fn resolve(
    explicit: Option<&str>,
    process_override: Option<&str>,
    derived: Option<&str>,
) -> String {
    fn non_empty<'a>(name: Option<&'a str>) -> Option<&'a str> {
        name.filter(|s| !s.is_empty())
    }
    non_empty(explicit)
        .or_else(|| non_empty(process_override))
        .or_else(|| non_empty(derived))
        .unwrap_or(UNKNOWN_FIELD_MANAGER)
        .to_string()
}

/// Field manager for a client, honouring its override
pub fn resolve_field_manager(explicit: Option<&str>) -> String {
    let derived = DERIVED_DEFAULT.get_or_init(|| {
        std::env::args()
            .next()
            .and_then(|argv0| field_manager_from_binary(&argv0))
            .unwrap_or_else(|| UNKNOWN_FIELD_MANAGER.to_string())
    });
    resolve(
        explicit,
        PROCESS_OVERRIDE.get().map(String::as_str),
        Some(derived),
    )
}
