//! HTML documents for `mango.utils.parseHTML`
//!
//! Parsed documents live in a per-runtime arena and are addressed from
//! script by `(document handle, node index)`. The arena is cleared after each
//! call; wrappers kept across calls stop resolving.

use std::collections::HashMap;

use ego_tree::NodeId;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};

use super::xpath::{self, XPathItem};

#[derive(Debug, thiserror::Error)]
pub enum HtmlError {
    #[error("unknown document handle {0}")]
    UnknownDocument(u32),

    #[error("unknown node {node} in document {doc}")]
    UnknownNode { doc: u32, node: usize },

    #[error("invalid selector {selector:?}: {reason}")]
    InvalidSelector { selector: String, reason: String },

    #[error(transparent)]
    XPath(#[from] xpath::XPathError),
}

const MAX_SELECTOR_LEN: usize = 1024;
const MAX_SELECTOR_DEPTH: usize = 32;

/// Reject selectors the recursive CSS parser cannot handle on a plugin
/// thread's stack
fn check_selector(selector: &str) -> Result<(), HtmlError> {
    let invalid = |reason: String| HtmlError::InvalidSelector {
        selector: selector.chars().take(64).collect(),
        reason,
    };
    if selector.len() > MAX_SELECTOR_LEN {
        return Err(invalid(format!("longer than {} bytes", MAX_SELECTOR_LEN)));
    }

    let mut depth = 0usize;
    for c in selector.chars() {
        match c {
            '(' | '[' => {
                depth += 1;
                if depth > MAX_SELECTOR_DEPTH {
                    return Err(invalid(format!(
                        "nested deeper than {} levels",
                        MAX_SELECTOR_DEPTH
                    )));
                }
            }
            ')' | ']' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    Ok(())
}

struct ParsedDocument {
    html: Html,
    ids: Vec<NodeId>,
    index: HashMap<NodeId, usize>,
}

impl ParsedDocument {
    fn parse(source: &str) -> Self {
        let html = Html::parse_document(source);
        let ids: Vec<NodeId> = html.tree.root().descendants().map(|n| n.id()).collect();
        let index = ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();
        Self { html, ids, index }
    }

    fn node_id(&self, doc: u32, node: usize) -> Result<NodeId, HtmlError> {
        self.ids
            .get(node)
            .copied()
            .ok_or(HtmlError::UnknownNode { doc, node })
    }

    fn element_info(&self, element: ElementRef<'_>) -> ElementInfo {
        let value = element.value();
        ElementInfo {
            node: self.index.get(&element.id()).copied().unwrap_or_default(),
            tag_name: value.name().to_ascii_uppercase(),
            text_content: element.text().collect(),
            inner_html: element.inner_html(),
            outer_html: element.html(),
            attributes: value
                .attrs()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect(),
        }
    }
}

/// Snapshot of an element handed to script
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementInfo {
    pub node: usize,
    pub tag_name: String,
    pub text_content: String,
    #[serde(rename = "innerHTML")]
    pub inner_html: String,
    #[serde(rename = "outerHTML")]
    pub outer_html: String,
    pub attributes: HashMap<String, String>,
}

/// XPath result handed to script
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "nodeType", rename_all = "camelCase")]
pub enum XPathNode {
    Element(ElementInfo),
    Attribute { name: String, value: String },
    Text {
        #[serde(rename = "textContent")]
        text_content: String,
    },
}

/// CSS query issued from script
#[derive(Debug, Clone, Deserialize)]
pub struct SelectRequest {
    pub doc: u32,
    #[serde(default)]
    pub node: usize,
    pub selector: String,
    #[serde(default)]
    pub all: bool,
}

/// XPath query issued from script
#[derive(Debug, Clone, Deserialize)]
pub struct XPathRequest {
    pub doc: u32,
    #[serde(default)]
    pub node: usize,
    pub expr: String,
}

/// Arena of documents parsed during the current call
#[derive(Default)]
pub struct HtmlDocuments {
    docs: HashMap<u32, ParsedDocument>,
    next_handle: u32,
}

impl HtmlDocuments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a document and return its handle; node 0 is the document root
    pub fn parse(&mut self, source: &str) -> u32 {
        self.next_handle = self.next_handle.wrapping_add(1);
        let handle = self.next_handle;
        self.docs.insert(handle, ParsedDocument::parse(source));
        handle
    }

    fn doc(&self, handle: u32) -> Result<&ParsedDocument, HtmlError> {
        self.docs.get(&handle).ok_or(HtmlError::UnknownDocument(handle))
    }

    /// Run a CSS selector against the descendants of a node
    pub fn select(&self, req: &SelectRequest) -> Result<Vec<ElementInfo>, HtmlError> {
        let doc = self.doc(req.doc)?;
        check_selector(&req.selector)?;
        let selector = Selector::parse(&req.selector).map_err(|e| HtmlError::InvalidSelector {
            selector: req.selector.clone(),
            reason: e.to_string(),
        })?;

        let id = doc.node_id(req.doc, req.node)?;
        let node = doc
            .html
            .tree
            .get(id)
            .ok_or(HtmlError::UnknownNode { doc: req.doc, node: req.node })?;

        let matches: Box<dyn Iterator<Item = ElementRef<'_>> + '_> = match ElementRef::wrap(node) {
            Some(element) => Box::new(element.select(&selector)),
            None => Box::new(doc.html.select(&selector)),
        };

        let limit = if req.all { usize::MAX } else { 1 };
        Ok(matches.take(limit).map(|el| doc.element_info(el)).collect())
    }

    pub fn xpath(&self, req: &XPathRequest) -> Result<Vec<XPathNode>, HtmlError> {
        let doc = self.doc(req.doc)?;
        let context = doc.node_id(req.doc, req.node)?;

        let items = xpath::evaluate(&doc.html, context, &req.expr)?;
        Ok(items
            .into_iter()
            .filter_map(|item| match item {
                // The document node itself has no element view
                XPathItem::Element(id) => doc
                    .html
                    .tree
                    .get(id)
                    .and_then(ElementRef::wrap)
                    .map(|element| XPathNode::Element(doc.element_info(element))),
                XPathItem::Attribute { name, value } => Some(XPathNode::Attribute { name, value }),
                XPathItem::Text(text_content) => Some(XPathNode::Text { text_content }),
            })
            .collect())
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Drop all documents; handles are not reused
    pub fn clear(&mut self) {
        self.docs.clear();
    }
}
