//! Feed source seam.
//!
//! A feed source answers two synchronous questions (is the message container
//! there yet, what units does it already hold) and pushes [`FeedEvent`]s
//! through a channel as the page changes. How it finds the container is its
//! own business.

use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

use crate::dom::{Node, Selector};
use crate::extractor::Extractor;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    ContainerAvailable,
    Batch(Vec<Node>),
}

pub trait FeedSource: Send {
    /// One locate attempt. Must not block.
    fn locate_container(&mut self) -> bool;

    /// Message units present in the container right now.
    fn existing_units(&self) -> Vec<Node>;
}

/// Sending half handed to whatever produces page notifications.
#[derive(Debug, Clone)]
pub struct FeedSender {
    sender: mpsc::UnboundedSender<FeedEvent>,
}

impl FeedSender {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<FeedEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    pub fn container_available(&self) {
        self.send(FeedEvent::ContainerAvailable);
    }

    pub fn batch(&self, nodes: Vec<Node>) {
        if !nodes.is_empty() {
            self.send(FeedEvent::Batch(nodes));
        }
    }

    fn send(&self, event: FeedEvent) {
        if self.sender.send(event).is_err() {
            debug!("Feed event dropped; monitor is gone");
        }
    }
}

/// Feed source backed by a document tree that the host replaces as the page
/// changes.
#[derive(Clone)]
pub struct DocumentFeed {
    document: Arc<Mutex<Option<Node>>>,
    container_selectors: Vec<Selector>,
    extractor: Extractor,
    located: Option<Selector>,
}

impl DocumentFeed {
    pub fn new(container_selectors: Vec<Selector>, extractor: Extractor) -> Self {
        Self {
            document: Arc::new(Mutex::new(None)),
            container_selectors,
            extractor,
            located: None,
        }
    }

    /// Handle for the host to swap the document in.
    pub fn document_handle(&self) -> DocumentHandle {
        DocumentHandle {
            document: Arc::clone(&self.document),
        }
    }

    fn container_of<'a>(&self, document: &'a Node) -> Option<(&'a Node, &Selector)> {
        self.container_selectors
            .iter()
            .find_map(|selector| document.closest_down(selector).map(|node| (node, selector)))
    }
}

impl FeedSource for DocumentFeed {
    fn locate_container(&mut self) -> bool {
        let located = match self.document.lock() {
            Ok(guard) => guard
                .as_ref()
                .and_then(|document| self.container_of(document))
                .map(|(_, selector)| selector.clone()),
            Err(_) => None,
        };
        self.located = located;
        self.located.is_some()
    }

    fn existing_units(&self) -> Vec<Node> {
        let Some(selector) = &self.located else {
            return Vec::new();
        };
        let Ok(guard) = self.document.lock() else {
            return Vec::new();
        };
        guard
            .as_ref()
            .and_then(|document| document.closest_down(selector))
            .map(|container| {
                self.extractor
                    .existing_units(container)
                    .into_iter()
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct DocumentHandle {
    document: Arc<Mutex<Option<Node>>>,
}

impl DocumentHandle {
    pub fn replace(&self, document: Node) {
        if let Ok(mut guard) = self.document.lock() {
            *guard = Some(document);
        }
    }

    /// Runs `f` against the current document, if any.
    pub fn with_document<T>(&self, f: impl FnOnce(&Node) -> T) -> Option<T> {
        let guard = self.document.lock().ok()?;
        guard.as_ref().map(f)
    }
}
