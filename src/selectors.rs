//! Selector indirection
//!
//! Maps semantic page actions ("user_message", "turn_list_parent", ...) to
//! selector strings. When the product ships UI changes only this config needs
//! updating; stored overrides are merged over the defaults.
//!
//! Selector strings use a small CSS subset: `tag`, `.class`, `[attr]`,
//! `[attr="value"]`, and the descendant combinator (whitespace).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SelectorError {
    #[error("No selector configured for action: {0}")]
    Unmapped(String),
    #[error("Invalid selector `{selector}`: {reason}")]
    Parse { selector: String, reason: String },
}

impl Serialize for SelectorError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Semantic actions the core relies on
pub mod actions {
    pub const USER_MESSAGE: &str = "user_message";
    pub const ASSISTANT_ACTION_BAR: &str = "assistant_action_bar";
    pub const ASSISTANT_CONTENT: &str = "assistant_content";
    pub const TURN_LIST_PARENT: &str = "turn_list_parent";
    pub const CONVERSATION_TURN: &str = "conversation_turn";
    pub const SINGLE_TURN: &str = "single_turn";
    pub const TURN_CONTENT: &str = "turn_content";
    pub const SCROLL_CONTAINER: &str = "scroll_container";
    pub const CHAT_INPUT: &str = "chat_input";
    pub const CHAT_INPUT_SSR: &str = "chat_input_ssr";
    pub const PROMPT_FIELDSET: &str = "prompt_fieldset";
    pub const SEND_BUTTON: &str = "send_button";
    pub const MODEL_SELECTOR: &str = "model_selector";
    pub const MODEL_MENU: &str = "model_menu";
    pub const MODEL_MENU_ITEM: &str = "model_menu_item";
    pub const CHAT_TITLE: &str = "chat_title";
    pub const CHAT_MENU_TRIGGER: &str = "chat_menu_trigger";
    pub const PAGE_HEADER: &str = "page_header";
    pub const ACTION_COPY: &str = "action_copy";
    pub const ACTION_RETRY: &str = "action_retry";
    pub const ARTIFACT_BLOCK: &str = "artifact_block";
    pub const SIDEBAR: &str = "sidebar";
    pub const NEW_CHAT: &str = "new_chat";
    pub const SIDEBAR_TOGGLE: &str = "sidebar_toggle";
    pub const FILE_UPLOAD: &str = "file_upload";
    pub const SCROLL_BOTTOM: &str = "scroll_bottom";
    pub const USER_MENU: &str = "user_menu";
    pub const WIGGLE_CONTROLS: &str = "wiggle_controls";
}

// Class-based entries are the fragile ones; prefer data-testid/aria anchors.
const DEFAULT_SELECTORS: &[(&str, &str)] = &[
    (actions::USER_MESSAGE, r#"[data-testid="user-message"]"#),
    (actions::ASSISTANT_ACTION_BAR, r#"[role="group"][aria-label="Message actions"]"#),
    (actions::ASSISTANT_CONTENT, "div.group.relative.inline-flex.gap-2.bg-bg-300"),
    (actions::TURN_LIST_PARENT, "div.flex-1.flex.flex-col.px-4.max-w-3xl"),
    (actions::CONVERSATION_TURN, "div[data-test-render-count]"),
    (actions::SINGLE_TURN, "div.mb-1.mt-6.group"),
    (actions::TURN_CONTENT, "div.flex.flex-col.items-end.gap-1"),
    (actions::SCROLL_CONTAINER, "div.overflow-y-scroll.overflow-x-hidden"),
    (actions::CHAT_INPUT, r#"[data-testid="chat-input"]"#),
    (actions::CHAT_INPUT_SSR, r#"[data-testid="chat-input-ssr"]"#),
    (actions::PROMPT_FIELDSET, r#"[data-testid="prompt-input-ssr-interactive"]"#),
    (actions::SEND_BUTTON, r#"button[aria-label="Send message"]"#),
    (actions::MODEL_SELECTOR, r#"[data-testid="model-selector-dropdown"]"#),
    (actions::MODEL_MENU, r#"[role="menu"]"#),
    (actions::MODEL_MENU_ITEM, r#"[role="menu"] [role="menuitem"]"#),
    (actions::CHAT_TITLE, r#"[data-testid="chat-title-button"]"#),
    (actions::CHAT_MENU_TRIGGER, r#"[data-testid="chat-menu-trigger"]"#),
    (actions::PAGE_HEADER, r#"[data-testid="page-header"]"#),
    (actions::ACTION_COPY, r#"[data-testid="action-bar-copy"]"#),
    (actions::ACTION_RETRY, r#"[data-testid="action-bar-retry"]"#),
    (actions::ARTIFACT_BLOCK, ".artifact-block-cell"),
    (actions::SIDEBAR, r#"nav[aria-label="Sidebar"]"#),
    (actions::NEW_CHAT, r#"a[aria-label="New chat"]"#),
    (actions::SIDEBAR_TOGGLE, r#"[data-testid="pin-sidebar-toggle"]"#),
    (actions::FILE_UPLOAD, r#"[data-testid="file-upload"]"#),
    (actions::SCROLL_BOTTOM, r#"button[aria-label="Scroll to bottom"]"#),
    (actions::USER_MENU, r#"[data-testid="user-menu-button"]"#),
    (actions::WIGGLE_CONTROLS, r#"[data-testid="wiggle-controls-actions"]"#),
];

/// Action → selector string
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectorMap {
    entries: BTreeMap<String, String>,
}

impl Default for SelectorMap {
    fn default() -> Self {
        Self {
            entries: DEFAULT_SELECTORS
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

impl SelectorMap {
    pub fn with_overrides(overrides: BTreeMap<String, String>) -> Self {
        let mut map = Self::default();
        map.entries.extend(overrides);
        map
    }

    /// Empty map (no defaults), mainly for exercising unmapped actions
    pub fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    pub fn get(&self, action: &str) -> Option<&str> {
        self.entries.get(action).map(|s| s.as_str())
    }

    /// Resolve and parse the selector for `action`, failing fast when the
    /// action has no mapping.
    pub fn require(&self, action: &str) -> Result<Selector, SelectorError> {
        let raw = self
            .get(action)
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| SelectorError::Unmapped(action.to_string()))?;
        Selector::parse(raw)
    }

    pub fn entries(&self) -> &BTreeMap<String, String> {
        &self.entries
    }
}

/// Attribute condition inside a compound selector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttrMatch {
    pub name: String,
    /// `None` matches on presence only
    pub value: Option<String>,
}

/// `tag.class[attr="v"]` with no combinators
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Compound {
    pub tag: Option<String>,
    pub classes: Vec<String>,
    pub attrs: Vec<AttrMatch>,
}

/// Parsed selector: compounds joined by descendant combinators, outermost first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    source: String,
    parts: Vec<Compound>,
}

impl Selector {
    pub fn parse(input: &str) -> Result<Self, SelectorError> {
        let err = |reason: &str| SelectorError::Parse {
            selector: input.to_string(),
            reason: reason.to_string(),
        };

        let mut parts = Vec::new();
        let chars: Vec<char> = input.trim().chars().collect();
        let mut i = 0;
        let mut current = Compound::default();
        let mut has_content = false;

        while i < chars.len() {
            let c = chars[i];
            if c.is_whitespace() {
                if has_content {
                    parts.push(std::mem::take(&mut current));
                    has_content = false;
                }
                i += 1;
            } else if c == '.' {
                i += 1;
                let start = i;
                while i < chars.len() && is_ident_char(chars[i]) {
                    i += 1;
                }
                if start == i {
                    return Err(err("empty class name"));
                }
                current.classes.push(chars[start..i].iter().collect());
                has_content = true;
            } else if c == '[' {
                i += 1;
                let start = i;
                while i < chars.len() && is_ident_char(chars[i]) {
                    i += 1;
                }
                if start == i {
                    return Err(err("empty attribute name"));
                }
                let name: String = chars[start..i].iter().collect();
                let value = if i < chars.len() && chars[i] == '=' {
                    i += 1;
                    let quote = chars.get(i).copied().filter(|q| *q == '"' || *q == '\'');
                    if let Some(q) = quote {
                        i += 1;
                        let vstart = i;
                        while i < chars.len() && chars[i] != q {
                            i += 1;
                        }
                        if i >= chars.len() {
                            return Err(err("unterminated attribute value"));
                        }
                        let v: String = chars[vstart..i].iter().collect();
                        i += 1;
                        Some(v)
                    } else {
                        let vstart = i;
                        while i < chars.len() && chars[i] != ']' {
                            i += 1;
                        }
                        Some(chars[vstart..i].iter().collect())
                    }
                } else {
                    None
                };
                if i >= chars.len() || chars[i] != ']' {
                    return Err(err("expected `]`"));
                }
                i += 1;
                current.attrs.push(AttrMatch { name, value });
                has_content = true;
            } else if is_ident_char(c) || c == '*' {
                if has_content {
                    return Err(err("tag name must start a compound"));
                }
                let start = i;
                while i < chars.len() && (is_ident_char(chars[i]) || chars[i] == '*') {
                    i += 1;
                }
                let tag: String = chars[start..i].iter().collect();
                if tag != "*" {
                    current.tag = Some(tag.to_ascii_lowercase());
                }
                has_content = true;
            } else {
                return Err(err(&format!("unsupported character `{}`", c)));
            }
        }
        if has_content {
            parts.push(current);
        }
        if parts.is_empty() {
            return Err(err("empty selector"));
        }

        Ok(Self {
            source: input.to_string(),
            parts,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Compounds, outermost ancestor first; the last one is the subject
    pub fn parts(&self) -> &[Compound] {
        &self.parts
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == ':'
}
