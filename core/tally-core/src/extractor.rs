//! Incremental identity extraction.
//!
//! Turns batches of added nodes into accepted-identity events for one
//! session. Each added node may be a message unit itself or contain several;
//! each unit yields at most one label. Label strategies are an ordered list of
//! pure functions tried in priority order, so supporting another page layout
//! means adding one [`LabelStrategy`], not another branch.
//!
//! The attribute fallback only runs when no primary strategy produced an
//! accepted label for the same unit. That latch lives for the duration of a
//! single unit, which is what keeps one message from being counted twice
//! through two different strategies.

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::config::ExtractionConfig;
use crate::dom::{Node, Selector};
use crate::error::Result;
use crate::identity::Identity;
use crate::session::{Acceptance, Session};

pub type LabelFn = Arc<dyn Fn(&Node) -> Option<String> + Send + Sync>;

/// One way of pulling a raw label out of a message unit.
#[derive(Clone)]
pub struct LabelStrategy {
    name: String,
    extract: LabelFn,
}

impl LabelStrategy {
    pub fn new(
        name: impl Into<String>,
        extract: impl Fn(&Node) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            extract: Arc::new(extract),
        }
    }

    /// Trimmed text of the first descendant matching `selector`.
    pub fn descendant_text(selector: Selector) -> Self {
        let name = format!("text:{}", selector);
        Self::new(name, move |unit| {
            unit.query_first(&selector)
                .map(|node| node.text_content().trim().to_string())
                .filter(|text| !text.is_empty())
        })
    }

    /// First non-empty attribute on the unit itself, in the given order.
    pub fn attributes(names: Vec<String>) -> Self {
        let name = format!("attr:{}", names.join("|"));
        Self::new(name, move |unit| {
            names
                .iter()
                .filter_map(|attr| unit.attr(attr))
                .map(str::trim)
                .find(|value| !value.is_empty())
                .map(str::to_string)
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn extract(&self, unit: &Node) -> Option<String> {
        (self.extract)(unit).filter(|label| !label.trim().is_empty())
    }
}

impl fmt::Debug for LabelStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LabelStrategy")
            .field("name", &self.name)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedIdentity {
    pub identity: Identity,
    pub is_new: bool,
    pub current_count: usize,
}

#[derive(Debug, Clone)]
pub struct Extractor {
    message_selectors: Vec<Selector>,
    strategies: Vec<LabelStrategy>,
    fallback: Option<LabelStrategy>,
}

impl Extractor {
    pub fn new(
        message_selectors: Vec<Selector>,
        strategies: Vec<LabelStrategy>,
        fallback: Option<LabelStrategy>,
    ) -> Self {
        Self {
            message_selectors,
            strategies,
            fallback,
        }
    }

    pub fn from_config(config: &ExtractionConfig) -> Result<Self> {
        let message_selectors = Selector::parse_all(&config.message_selectors)?;
        let strategies = Selector::parse_all(&config.label_selectors)?
            .into_iter()
            .map(LabelStrategy::descendant_text)
            .collect();
        let fallback = if config.label_attributes.is_empty() {
            None
        } else {
            Some(LabelStrategy::attributes(config.label_attributes.clone()))
        };
        Ok(Self::new(message_selectors, strategies, fallback))
    }

    /// Message units inside one added node. The first selector that matches
    /// the node itself, or failing that any of its descendants, decides.
    pub fn locate_units<'a>(&self, node: &'a Node) -> Vec<&'a Node> {
        for selector in &self.message_selectors {
            if node.matches(selector) {
                return vec![node];
            }
            let found = node.query_all(selector);
            if !found.is_empty() {
                return found;
            }
        }
        Vec::new()
    }

    /// Units already present inside the container when observation starts.
    pub fn existing_units<'a>(&self, container: &'a Node) -> Vec<&'a Node> {
        self.message_selectors
            .iter()
            .map(|selector| container.query_all(selector))
            .find(|units| !units.is_empty())
            .unwrap_or_default()
    }

    /// Raw label from the primary strategies, first non-empty wins.
    pub fn primary_label(&self, unit: &Node) -> Option<String> {
        self.strategies.iter().find_map(|strategy| {
            let label = strategy.extract(unit);
            if label.is_some() {
                trace!(strategy = strategy.name(), "Label strategy matched");
            }
            label
        })
    }

    pub fn observe_batch(
        &self,
        session: &mut Session,
        nodes: &[Node],
        now: DateTime<Utc>,
    ) -> Vec<AcceptedIdentity> {
        let mut accepted = Vec::new();
        for node in nodes {
            for unit in self.locate_units(node) {
                self.process_unit(session, unit, now, &mut accepted);
            }
        }
        accepted
    }

    /// One-shot pass over pre-existing units. Callers only run this while the
    /// session has no counted identities.
    pub fn backfill(
        &self,
        session: &mut Session,
        units: &[Node],
        now: DateTime<Utc>,
    ) -> Vec<AcceptedIdentity> {
        let mut accepted = Vec::new();
        for unit in units {
            self.process_unit(session, unit, now, &mut accepted);
        }
        debug!(
            session_id = %session.session_id(),
            units = units.len(),
            accepted = accepted.len(),
            unique = session.user_count(),
            "Backfill complete"
        );
        accepted
    }

    fn process_unit(
        &self,
        session: &mut Session,
        unit: &Node,
        now: DateTime<Utc>,
        out: &mut Vec<AcceptedIdentity>,
    ) {
        let latched = self
            .primary_label(unit)
            .map(|raw| offer(session, &raw, now, out))
            .unwrap_or(false);
        if latched {
            return;
        }

        if let Some(raw) = self.fallback.as_ref().and_then(|f| f.extract(unit)) {
            offer(session, &raw, now, out);
        }
    }
}

/// Returns true when the label was accepted (new or duplicate).
fn offer(
    session: &mut Session,
    raw: &str,
    now: DateTime<Utc>,
    out: &mut Vec<AcceptedIdentity>,
) -> bool {
    let Some(identity) = Identity::normalize(raw) else {
        return false;
    };

    match session.accept(identity.clone(), now) {
        Acceptance::Excluded => {
            debug!(
                session_id = %session.session_id(),
                identity = %identity,
                "Excluded identity dropped"
            );
            false
        }
        outcome => {
            out.push(AcceptedIdentity {
                identity,
                is_new: outcome == Acceptance::New,
                current_count: session.user_count(),
            });
            true
        }
    }
}
