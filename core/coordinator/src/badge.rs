//! Badge indicator for the foreground session.

use std::sync::{Arc, Mutex};
use tracing::info;

pub trait BadgeSink: Send {
    fn show(&mut self, text: &str, color: &str);
}

/// Count when greater than zero, otherwise empty.
pub fn badge_text(count: usize) -> String {
    if count > 0 {
        count.to_string()
    } else {
        String::new()
    }
}

/// Writes badge changes to the log; used when no display is attached.
#[derive(Debug, Default)]
pub struct LogBadge;

impl BadgeSink for LogBadge {
    fn show(&mut self, text: &str, color: &str) {
        info!(text, color, "Badge updated");
    }
}

/// Keeps every badge update; shared so tests can inspect it after handing the
/// sink to the coordinator.
#[derive(Debug, Clone, Default)]
pub struct RecordingBadge {
    shown: Arc<Mutex<Vec<(String, String)>>>,
}

impl RecordingBadge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shown(&self) -> Vec<(String, String)> {
        self.shown
            .lock()
            .map(|shown| shown.clone())
            .unwrap_or_default()
    }

    pub fn last_text(&self) -> Option<String> {
        self.shown().last().map(|(text, _)| text.clone())
    }
}

impl BadgeSink for RecordingBadge {
    fn show(&mut self, text: &str, color: &str) {
        if let Ok(mut shown) = self.shown.lock() {
            shown.push((text.to_string(), color.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_count_renders_empty() {
        assert_eq!(badge_text(0), "");
        assert_eq!(badge_text(42), "42");
    }

    #[test]
    fn recording_badge_is_shared_between_clones() {
        let badge = RecordingBadge::new();
        let mut sink = badge.clone();
        sink.show("3", "#9146ff");
        assert_eq!(badge.last_text().as_deref(), Some("3"));
    }
}
