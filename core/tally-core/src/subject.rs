//! Best-effort label for what a monitored instance is currently showing.

use crate::dom::{Node, Selector};

const SKIPPED_PATH_SEGMENTS: &[&str] = &["directory", "browse"];
const SKIPPED_HEADING_WORDS: &[&str] = &["Twitch", "Browse"];

/// The path segment is the default; the first usable heading overrides it.
pub fn detect_subject<S: AsRef<str>>(url: &str, headings: &[S]) -> Option<String> {
    let heading = headings
        .iter()
        .map(|heading| heading.as_ref().trim())
        .find(|text| {
            !text.is_empty() && !SKIPPED_HEADING_WORDS.iter().any(|word| text.contains(word))
        })
        .map(str::to_string);

    heading.or_else(|| channel_from_url(url))
}

/// First path segment of `url`, unless it is a listing page.
pub fn channel_from_url(url: &str) -> Option<String> {
    let path = url_path(url);
    let segment = path.trim_start_matches('/').split('/').next()?;
    if segment.is_empty() || SKIPPED_PATH_SEGMENTS.contains(&segment) {
        return None;
    }
    Some(segment.to_string())
}

/// Text of the first element matched by each selector, in selector order.
pub fn heading_candidates(document: &Node, selectors: &[Selector]) -> Vec<String> {
    selectors
        .iter()
        .filter_map(|selector| document.closest_down(selector))
        .map(|node| node.text_content().trim().to_string())
        .filter(|text| !text.is_empty())
        .collect()
}

fn url_path(url: &str) -> &str {
    let without_scheme = match url.find("://") {
        Some(index) => &url[index + 3..],
        None => return strip_query(url),
    };
    match without_scheme.find('/') {
        Some(index) => strip_query(&without_scheme[index..]),
        None => "",
    }
}

fn strip_query(path: &str) -> &str {
    let end = path.find(['?', '#']).unwrap_or(path.len());
    &path[..end]
}
