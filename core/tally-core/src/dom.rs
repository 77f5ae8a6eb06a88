//! Structural node model and a small selector engine.
//!
//! The monitored page is represented as a plain element tree. Feed sources
//! translate whatever they observe into [`Node`]s; the extractor only ever
//! asks the questions below (does this node match, find descendants that
//! match, what is its text).
//!
//! Supported selector grammar:
//!
//! ```text
//! selector  := compound (WS compound)*        descendant combinator only
//! compound  := tag? ( '.' class | '[' attr ( op '"' value '"' )? ']' )*
//! op        := '=' | '*='
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Result, TallyError};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub classes: Vec<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub children: Vec<Node>,
}

impl Node {
    pub fn element(tag: &str) -> Self {
        Self {
            tag: tag.to_ascii_lowercase(),
            ..Self::default()
        }
    }

    pub fn with_class(mut self, class: &str) -> Self {
        self.classes.push(class.to_string());
        self
    }

    pub fn with_attr(mut self, name: &str, value: &str) -> Self {
        self.attributes.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_text(mut self, text: &str) -> Self {
        self.text = Some(text.to_string());
        self
    }

    pub fn with_child(mut self, child: Node) -> Self {
        self.children.push(child);
        self
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.classes.iter().any(|candidate| candidate == class)
    }

    /// Concatenated text of this node and all descendants, in document order.
    pub fn text_content(&self) -> String {
        let mut out = String::new();
        self.collect_text(&mut out);
        out
    }

    fn collect_text(&self, out: &mut String) {
        if let Some(text) = &self.text {
            out.push_str(text);
        }
        for child in &self.children {
            child.collect_text(out);
        }
    }

    /// Whether this node matches on its own. Descendant selectors need
    /// ancestors, so they never match a detached node.
    pub fn matches(&self, selector: &Selector) -> bool {
        selector.matches_with_ancestors(self, &[])
    }

    /// First descendant (excluding `self`) matching the selector.
    pub fn query_first(&self, selector: &Selector) -> Option<&Node> {
        let mut ancestors = vec![self];
        find_first(self, selector, &mut ancestors)
    }

    /// Every descendant (excluding `self`) matching the selector, in document order.
    pub fn query_all(&self, selector: &Selector) -> Vec<&Node> {
        let mut found = Vec::new();
        let mut ancestors = vec![self];
        find_all(self, selector, &mut ancestors, &mut found);
        found
    }

    /// `self` if it matches, otherwise the first matching descendant.
    pub fn closest_down(&self, selector: &Selector) -> Option<&Node> {
        if self.matches(selector) {
            Some(self)
        } else {
            self.query_first(selector)
        }
    }
}

fn find_first<'a>(
    node: &'a Node,
    selector: &Selector,
    ancestors: &mut Vec<&'a Node>,
) -> Option<&'a Node> {
    for child in &node.children {
        if selector.matches_with_ancestors(child, ancestors) {
            return Some(child);
        }
        ancestors.push(child);
        let found = find_first(child, selector, ancestors);
        ancestors.pop();
        if found.is_some() {
            return found;
        }
    }
    None
}

fn find_all<'a>(
    node: &'a Node,
    selector: &Selector,
    ancestors: &mut Vec<&'a Node>,
    found: &mut Vec<&'a Node>,
) {
    for child in &node.children {
        if selector.matches_with_ancestors(child, ancestors) {
            found.push(child);
        }
        ancestors.push(child);
        find_all(child, selector, ancestors, found);
        ancestors.pop();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum AttrOp {
    Exists,
    Equals(String),
    Contains(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct AttrMatch {
    name: String,
    op: AttrOp,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Compound {
    tag: Option<String>,
    classes: Vec<String>,
    attrs: Vec<AttrMatch>,
}

impl Compound {
    fn matches(&self, node: &Node) -> bool {
        if let Some(tag) = &self.tag {
            if !node.tag.eq_ignore_ascii_case(tag) {
                return false;
            }
        }
        if !self.classes.iter().all(|class| node.has_class(class)) {
            return false;
        }
        self.attrs.iter().all(|attr| match (&attr.op, node.attr(&attr.name)) {
            (_, None) => false,
            (AttrOp::Exists, Some(_)) => true,
            (AttrOp::Equals(expected), Some(value)) => value == expected,
            (AttrOp::Contains(needle), Some(value)) => value.contains(needle.as_str()),
        })
    }
}

/// A parsed selector. Cheap to clone; parse once, match many times.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    source: String,
    chain: Vec<Compound>,
}

impl Selector {
    pub fn parse(source: &str) -> Result<Self> {
        let invalid = |reason: &str| TallyError::InvalidSelector {
            selector: source.to_string(),
            reason: reason.to_string(),
        };

        let chain = split_compounds(source)
            .map_err(|reason| invalid(&reason))?
            .into_iter()
            .map(|part| parse_compound(&part).map_err(|reason| invalid(&reason)))
            .collect::<Result<Vec<_>>>()?;

        if chain.is_empty() {
            return Err(invalid("selector is empty"));
        }

        Ok(Self {
            source: source.trim().to_string(),
            chain,
        })
    }

    pub fn parse_all<S: AsRef<str>>(sources: &[S]) -> Result<Vec<Self>> {
        sources
            .iter()
            .map(|source| Self::parse(source.as_ref()))
            .collect()
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// `ancestors` is ordered root first, nearest parent last.
    fn matches_with_ancestors(&self, node: &Node, ancestors: &[&Node]) -> bool {
        let Some((last, rest)) = self.chain.split_last() else {
            return false;
        };
        if !last.matches(node) {
            return false;
        }

        let mut remaining = ancestors.len();
        for compound in rest.iter().rev() {
            let mut matched = false;
            while remaining > 0 {
                remaining -= 1;
                if compound.matches(ancestors[remaining]) {
                    matched = true;
                    break;
                }
            }
            if !matched {
                return false;
            }
        }
        true
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn split_compounds(source: &str) -> std::result::Result<Vec<String>, String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_brackets = false;
    let mut in_quotes = false;

    for c in source.chars() {
        match c {
            '"' if in_brackets => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            '[' if !in_quotes => {
                if in_brackets {
                    return Err("nested '['".to_string());
                }
                in_brackets = true;
                current.push(c);
            }
            ']' if !in_quotes => {
                if !in_brackets {
                    return Err("unbalanced ']'".to_string());
                }
                in_brackets = false;
                current.push(c);
            }
            c if c.is_whitespace() && !in_brackets => {
                if !current.is_empty() {
                    parts.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }

    if in_brackets || in_quotes {
        return Err("unterminated attribute selector".to_string());
    }
    if !current.is_empty() {
        parts.push(current);
    }
    Ok(parts)
}

fn parse_compound(part: &str) -> std::result::Result<Compound, String> {
    let mut compound = Compound::default();
    let chars: Vec<char> = part.chars().collect();
    let mut index = 0;

    let tag: String = chars
        .iter()
        .take_while(|c| is_ident_char(**c) || **c == '*')
        .collect();
    index += tag.chars().count();
    if !tag.is_empty() && tag != "*" {
        compound.tag = Some(tag.to_ascii_lowercase());
    }

    while index < chars.len() {
        match chars[index] {
            '.' => {
                index += 1;
                let class: String = chars[index..]
                    .iter()
                    .take_while(|c| is_ident_char(**c))
                    .collect();
                if class.is_empty() {
                    return Err("empty class name".to_string());
                }
                index += class.chars().count();
                compound.classes.push(class);
            }
            '[' => {
                let close = chars[index..]
                    .iter()
                    .position(|c| *c == ']')
                    .map(|offset| index + offset)
                    .ok_or_else(|| "unterminated attribute selector".to_string())?;
                let body: String = chars[index + 1..close].iter().collect();
                compound.attrs.push(parse_attr(&body)?);
                index = close + 1;
            }
            other => return Err(format!("unexpected character {:?}", other)),
        }
    }

    Ok(compound)
}

fn parse_attr(body: &str) -> std::result::Result<AttrMatch, String> {
    let (name, op) = if let Some((name, value)) = body.split_once("*=") {
        (name, AttrOp::Contains(unquote(value)?))
    } else if let Some((name, value)) = body.split_once('=') {
        (name, AttrOp::Equals(unquote(value)?))
    } else {
        (body, AttrOp::Exists)
    };

    let name = name.trim();
    if name.is_empty() || !name.chars().all(is_ident_char) {
        return Err(format!("invalid attribute name {:?}", name));
    }
    Ok(AttrMatch {
        name: name.to_string(),
        op,
    })
}

fn unquote(value: &str) -> std::result::Result<String, String> {
    let value = value.trim();
    let stripped = value
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .or_else(|| {
            value
                .strip_prefix('\'')
                .and_then(|rest| rest.strip_suffix('\''))
        })
        .unwrap_or(value);
    if stripped.contains('"') {
        return Err("stray quote in attribute value".to_string());
    }
    Ok(stripped.to_string())
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '-' || c == '_'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sel(source: &str) -> Selector {
        Selector::parse(source).expect("selector")
    }

    fn chat_line(user: &str) -> Node {
        Node::element("div")
            .with_class("chat-line__message")
            .with_attr("data-a-target", "chat-line-message")
            .with_child(
                Node::element("span")
                    .with_attr("data-a-target", "chat-message-username")
                    .with_text(user),
            )
            .with_child(Node::element("span").with_text(": hello"))
    }

    #[test]
    fn matches_attribute_equals() {
        let node = chat_line("alice");
        assert!(node.matches(&sel(r#"[data-a-target="chat-line-message"]"#)));
        assert!(!node.matches(&sel(r#"[data-a-target="other"]"#)));
    }

    #[test]
    fn matches_class_and_tag() {
        let node = chat_line("alice");
        assert!(node.matches(&sel(".chat-line__message")));
        assert!(node.matches(&sel("div.chat-line__message")));
        assert!(!node.matches(&sel("span.chat-line__message")));
        assert!(!node.matches(&sel(".chat-line")));
    }

    #[test]
    fn matches_attribute_contains_and_exists() {
        let node = Node::element("h1").with_attr("class", "channel-title-main");
        assert!(node.matches(&sel(r#"h1[class*="title"]"#)));
        assert!(node.matches(&sel("[class]")));
        assert!(!node.matches(&sel("[id]")));
    }

    #[test]
    fn query_first_searches_descendants_only() {
        let node = chat_line("alice");
        let username = node
            .query_first(&sel(r#"[data-a-target="chat-message-username"]"#))
            .expect("username");
        assert_eq!(username.text_content(), "alice");
        assert!(node.query_first(&sel(".chat-line__message")).is_none());
    }

    #[test]
    fn query_all_returns_document_order() {
        let container = Node::element("div")
            .with_child(chat_line("alice"))
            .with_child(Node::element("div").with_child(chat_line("bob")))
            .with_child(chat_line("carol"));

        let users: Vec<String> = container
            .query_all(&sel(".chat-line__message"))
            .into_iter()
            .map(|line| {
                line.query_first(&sel(r#"[data-a-target="chat-message-username"]"#))
                    .map(Node::text_content)
                    .unwrap_or_default()
            })
            .collect();
        assert_eq!(users, vec!["alice", "bob", "carol"]);
    }

    #[test]
    fn descendant_combinator_requires_ancestor() {
        let page = Node::element("body")
            .with_child(
                Node::element("div")
                    .with_class("channel-info-content")
                    .with_child(Node::element("h1").with_text("Streamer")),
            )
            .with_child(Node::element("h1").with_text("Other"));

        let found = page.query_all(&sel(".channel-info-content h1"));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].text_content(), "Streamer");
        assert!(!Node::element("h1").matches(&sel(".channel-info-content h1")));
    }

    #[test]
    fn compound_class_selector_needs_every_class() {
        let node = Node::element("div")
            .with_class("Layout-sc-1xcs6mc-0")
            .with_class("iymPrH");
        assert!(node.matches(&sel(".Layout-sc-1xcs6mc-0.iymPrH")));
        let partial = Node::element("div").with_class("iymPrH");
        assert!(!partial.matches(&sel(".Layout-sc-1xcs6mc-0.iymPrH")));
    }

    #[test]
    fn text_content_concatenates_descendants() {
        assert_eq!(chat_line("alice").text_content(), "alice: hello");
    }

    #[test]
    fn rejects_malformed_selectors() {
        assert!(Selector::parse("").is_err());
        assert!(Selector::parse("[data-a").is_err());
        assert!(Selector::parse("div]").is_err());
        assert!(Selector::parse(".").is_err());
        assert!(Selector::parse("div > span").is_err());
    }

    #[test]
    fn node_parses_from_sparse_json() {
        let json = r#"{"tag":"div","classes":["chat-line"],"attributes":{"data-user":"Bob"}}"#;
        let node: Node = serde_json::from_str(json).expect("parse node");
        assert!(node.matches(&sel(".chat-line")));
        assert_eq!(node.attr("data-user"), Some("Bob"));
        assert!(node.children.is_empty());
    }
}
