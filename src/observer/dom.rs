//! Arena page model
//!
//! A minimal element tree with stable node identities. Mutating operations
//! return the `MutationRecord` a page observer would receive.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::selectors::{Compound, Selector};

/// Stable identity of a node for the lifetime of the tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    ChildList,
    Attributes,
}

/// One observed change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationRecord {
    pub kind: MutationKind,
    pub target: NodeId,
    pub added: Vec<NodeId>,
    pub removed: Vec<NodeId>,
}

impl MutationRecord {
    fn child_list(target: NodeId, added: Vec<NodeId>, removed: Vec<NodeId>) -> Self {
        Self {
            kind: MutationKind::ChildList,
            target,
            added,
            removed,
        }
    }
}

/// Element description used to build nodes
#[derive(Debug, Clone, Default)]
pub struct Element {
    tag: String,
    classes: Vec<String>,
    attrs: BTreeMap<String, String>,
    text: String,
}

impl Element {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_ascii_lowercase(),
            ..Default::default()
        }
    }

    pub fn class(mut self, class: &str) -> Self {
        self.classes.extend(class.split_whitespace().map(String::from));
        self
    }

    pub fn attr(mut self, name: &str, value: &str) -> Self {
        self.attrs.insert(name.to_string(), value.to_string());
        self
    }

    pub fn text(mut self, text: &str) -> Self {
        self.text = text.to_string();
        self
    }
}

#[derive(Debug, Clone)]
struct Node {
    element: Element,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

/// Element tree rooted at `body`
#[derive(Debug, Clone)]
pub struct DomTree {
    nodes: Vec<Node>,
    body: NodeId,
}

impl Default for DomTree {
    fn default() -> Self {
        Self::new()
    }
}

impl DomTree {
    pub fn new() -> Self {
        Self {
            nodes: vec![Node {
                element: Element::new("body"),
                parent: None,
                children: Vec::new(),
            }],
            body: NodeId(0),
        }
    }

    pub fn body(&self) -> NodeId {
        self.body
    }

    fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    /// Create a detached node
    pub fn create(&mut self, element: Element) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            element,
            parent: None,
            children: Vec::new(),
        });
        id
    }

    /// Create a node and append it under `parent`
    pub fn append(&mut self, parent: NodeId, element: Element) -> (NodeId, MutationRecord) {
        let id = self.create(element);
        let record = self.append_child(parent, id);
        (id, record)
    }

    /// Attach `child` (detaching it from any previous parent) as the last child
    pub fn append_child(&mut self, parent: NodeId, child: NodeId) -> MutationRecord {
        self.insert_child(parent, child, usize::MAX)
    }

    /// Move or insert `child` at `index` among `parent`'s children
    pub fn insert_child(&mut self, parent: NodeId, child: NodeId, index: usize) -> MutationRecord {
        let mut removed = Vec::new();
        if let Some(old_parent) = self.nodes[child.0].parent {
            self.nodes[old_parent.0].children.retain(|c| *c != child);
            if old_parent == parent {
                removed.push(child);
            }
        }
        let children = &mut self.nodes[parent.0].children;
        let index = index.min(children.len());
        children.insert(index, child);
        self.nodes[child.0].parent = Some(parent);
        MutationRecord::child_list(parent, vec![child], removed)
    }

    /// Detach `node` from its parent. The node keeps its identity and can be
    /// re-attached later.
    pub fn remove(&mut self, node: NodeId) -> Option<MutationRecord> {
        let parent = self.nodes[node.0].parent.take()?;
        self.nodes[parent.0].children.retain(|c| *c != node);
        Some(MutationRecord::child_list(parent, Vec::new(), vec![node]))
    }

    /// Remove every child of `node`
    pub fn clear_children(&mut self, node: NodeId) -> MutationRecord {
        let removed = std::mem::take(&mut self.nodes[node.0].children);
        for child in &removed {
            self.nodes[child.0].parent = None;
        }
        MutationRecord::child_list(node, Vec::new(), removed)
    }

    pub fn set_attr(&mut self, node: NodeId, name: &str, value: &str) -> MutationRecord {
        self.nodes[node.0]
            .element
            .attrs
            .insert(name.to_string(), value.to_string());
        MutationRecord {
            kind: MutationKind::Attributes,
            target: node,
            added: Vec::new(),
            removed: Vec::new(),
        }
    }

    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.node(node).parent
    }

    pub fn children(&self, node: NodeId) -> &[NodeId] {
        &self.node(node).children
    }

    pub fn tag(&self, node: NodeId) -> &str {
        &self.node(node).element.tag
    }

    pub fn attr(&self, node: NodeId, name: &str) -> Option<&str> {
        self.node(node).element.attrs.get(name).map(|s| s.as_str())
    }

    pub fn has_class(&self, node: NodeId, class: &str) -> bool {
        self.node(node).element.classes.iter().any(|c| c == class)
    }

    /// Own text plus descendants' text, in document order
    pub fn text_content(&self, node: NodeId) -> String {
        let mut out = self.node(node).element.text.clone();
        for d in self.descendants(node) {
            out.push_str(&self.node(d).element.text);
        }
        out
    }

    /// True when `node` is attached under `body`
    pub fn is_connected(&self, node: NodeId) -> bool {
        self.is_inclusive_descendant(node, self.body)
    }

    /// True when `node` is `ancestor` or lies beneath it
    pub fn is_inclusive_descendant(&self, node: NodeId, ancestor: NodeId) -> bool {
        let mut cur = Some(node);
        while let Some(n) = cur {
            if n == ancestor {
                return true;
            }
            cur = self.node(n).parent;
        }
        false
    }

    /// Descendants of `scope` (excluding it) in document order
    pub fn descendants(&self, scope: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.node(scope).children.iter().rev().copied().collect();
        while let Some(n) = stack.pop() {
            out.push(n);
            stack.extend(self.node(n).children.iter().rev().copied());
        }
        out
    }

    fn matches_compound(&self, node: NodeId, compound: &Compound) -> bool {
        let element = &self.node(node).element;
        if let Some(tag) = &compound.tag {
            if &element.tag != tag {
                return false;
            }
        }
        if !compound.classes.iter().all(|c| element.classes.contains(c)) {
            return false;
        }
        compound.attrs.iter().all(|a| match (&a.value, element.attrs.get(&a.name)) {
            (None, Some(_)) => true,
            (Some(expected), Some(actual)) => expected == actual,
            _ => false,
        })
    }

    /// Whether `node` matches `selector`. Descendant parts are matched against
    /// ancestors anywhere in the tree.
    pub fn matches(&self, node: NodeId, selector: &Selector) -> bool {
        let parts = selector.parts();
        let Some((subject, ancestors)) = parts.split_last() else {
            return false;
        };
        if !self.matches_compound(node, subject) {
            return false;
        }
        let mut remaining = ancestors.iter().rev().peekable();
        let mut cur = self.parent(node);
        while let Some(compound) = remaining.peek() {
            let Some(n) = cur else {
                return false;
            };
            if self.matches_compound(n, compound) {
                remaining.next();
            }
            cur = self.parent(n);
        }
        true
    }

    /// Matching descendants of `scope` in document order
    pub fn query_all(&self, scope: NodeId, selector: &Selector) -> Vec<NodeId> {
        self.descendants(scope)
            .into_iter()
            .filter(|n| self.matches(*n, selector))
            .collect()
    }

    pub fn query(&self, scope: NodeId, selector: &Selector) -> Option<NodeId> {
        self.descendants(scope)
            .into_iter()
            .find(|n| self.matches(*n, selector))
    }
}
