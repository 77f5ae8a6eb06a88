//! Navigation detection for a monitored instance.
//!
//! Polled at low frequency; only a URL that differs from the previous
//! observation counts as navigation, so repeated polls are no-ops.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationChange {
    /// First URL ever observed; establishes the baseline.
    Initial,
    Changed,
    Unchanged,
}

#[derive(Debug, Clone, Default)]
pub struct NavigationTracker {
    current: Option<String>,
}

impl NavigationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn observe(&mut self, url: &str) -> NavigationChange {
        match self.current.as_deref() {
            Some(current) if current == url => NavigationChange::Unchanged,
            Some(_) => {
                self.current = Some(url.to_string());
                NavigationChange::Changed
            }
            None => {
                self.current = Some(url.to_string());
                NavigationChange::Initial
            }
        }
    }
}
