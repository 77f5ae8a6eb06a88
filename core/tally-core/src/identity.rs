//! Participant identities.
//!
//! An [`Identity`] is the deduplication key for a chat participant. Raw labels
//! come from page text and attributes, so they carry whitespace, decorations
//! and mixed case; normalization keeps ASCII word characters and `-`, then
//! lowercases. Two labels are the same participant exactly when their
//! normalized forms are equal.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Normalizes a raw label. Returns `None` when nothing survives.
    pub fn normalize(raw: &str) -> Option<Self> {
        let cleaned: String = raw
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
            .map(|c| c.to_ascii_lowercase())
            .collect();

        if cleaned.is_empty() {
            None
        } else {
            Some(Identity(cleaned))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Identity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Normalizes every label, dropping the ones that normalize to nothing.
pub fn normalize_all<I, S>(labels: I) -> HashSet<Identity>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    labels
        .into_iter()
        .filter_map(|label| Identity::normalize(label.as_ref()))
        .collect()
}

/// Sorted string form, used wherever a set crosses the wire or hits storage.
pub fn sorted_strings(identities: &HashSet<Identity>) -> Vec<String> {
    let mut values: Vec<String> = identities.iter().map(|id| id.as_str().to_string()).collect();
    values.sort();
    values
}
