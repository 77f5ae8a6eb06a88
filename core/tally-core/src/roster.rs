//! Exclusion discovery from the roster panel.
//!
//! The page lists automated accounts in their own roster section. Each entry
//! contributes its visible name and, when the entry's button carries an
//! accessible label naming the account, that name too.

use regex::Regex;
use std::collections::HashSet;
use tracing::debug;

use crate::config::RosterConfig;
use crate::dom::{Node, Selector};
use crate::error::{Result, TallyError};
use crate::identity::Identity;

#[derive(Debug, Clone)]
pub struct RosterScanner {
    section: Selector,
    section_title: String,
    title: Selector,
    item: Selector,
    name: Selector,
    button: Selector,
    aria_label: Regex,
}

impl RosterScanner {
    pub fn from_config(config: &RosterConfig) -> Result<Self> {
        let aria_label =
            Regex::new(&config.aria_label_pattern).map_err(|source| TallyError::InvalidPattern {
                pattern: config.aria_label_pattern.clone(),
                source,
            })?;

        Ok(Self {
            section: Selector::parse(&config.section_selector)?,
            section_title: config.section_title.trim().to_string(),
            title: Selector::parse(&config.title_selector)?,
            item: Selector::parse(&config.item_selector)?,
            name: Selector::parse(&config.name_selector)?,
            button: Selector::parse(&config.button_selector)?,
            aria_label,
        })
    }

    /// The first roster section whose heading equals the configured title.
    pub fn find_section<'a>(&self, root: &'a Node) -> Option<&'a Node> {
        let mut candidates = Vec::new();
        if root.matches(&self.section) {
            candidates.push(root);
        }
        candidates.extend(root.query_all(&self.section));

        candidates.into_iter().find(|section| {
            section
                .query_first(&self.title)
                .map(|title| title.text_content().trim() == self.section_title)
                .unwrap_or(false)
        })
    }

    /// Every identity listed in the bot section. No section means no bots.
    pub fn discover(&self, root: &Node) -> HashSet<Identity> {
        let mut found = HashSet::new();
        let Some(section) = self.find_section(root) else {
            debug!("Roster bot section not found");
            return found;
        };

        for item in section.query_all(&self.item) {
            if let Some(identity) = item
                .query_first(&self.name)
                .and_then(|name| Identity::normalize(&name.text_content()))
            {
                found.insert(identity);
            }

            let from_aria = item
                .query_first(&self.button)
                .and_then(|button| button.attr("aria-label"))
                .and_then(|label| self.aria_label.captures(label))
                .and_then(|captures| captures.get(1))
                .and_then(|name| Identity::normalize(name.as_str()));
            if let Some(identity) = from_aria {
                found.insert(identity);
            }
        }

        debug!(bots = found.len(), "Roster bot section scanned");
        found
    }
}
