//! Error types for tally-core operations.
//!
//! Most of the counting pipeline degrades instead of failing, so the variants
//! here cover the few places where a caller has to decide: loading
//! configuration and compiling the selector and pattern sets it names.

use std::path::PathBuf;

// ═══════════════════════════════════════════════════════════════════════════════
// Core Error
// ═══════════════════════════════════════════════════════════════════════════════

/// All errors that can occur in tally-core operations.
#[derive(Debug, thiserror::Error)]
pub enum TallyError {
    // ─────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Configuration file malformed: {path}: {details}")]
    ConfigMalformed { path: PathBuf, details: String },

    // ─────────────────────────────────────────────────────────────────────
    // Extraction Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Invalid selector {selector:?}: {reason}")]
    InvalidSelector { selector: String, reason: String },

    #[error("Invalid pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    // ─────────────────────────────────────────────────────────────────────
    // I/O Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Convenience type alias for Results using TallyError.
pub type Result<T> = std::result::Result<T, TallyError>;

impl From<TallyError> for String {
    fn from(err: TallyError) -> String {
        err.to_string()
    }
}
