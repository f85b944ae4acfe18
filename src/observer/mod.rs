//! Interaction observer
//!
//! Turns raw page mutations into two signals: "a new user turn appeared" and
//! "the active conversation changed". Two layers:
//!
//! - the root sentinel (`sentinel`) sees every mutation of the page body and,
//!   once the page has been quiet for the debounce window, re-resolves the
//!   conversation container (`on_root_tick`);
//! - the conversation layer (`on_container_mutations`) rescans the container
//!   whenever nodes were added inside it and counts markers it has not seen.
//!
//! The observer knows nothing about Threads or Segments beyond an optional
//! bound segment id it stamps on outgoing messages. `from_store` reads its
//! selectors and split policy once, at construction.

pub mod dom;
pub mod sentinel;

use std::collections::HashSet;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::bus::{Context, Endpoint, Message};
use crate::lifecycle::{LifecycleError, LifecycleManager};
use crate::policy::SplitPolicy;
use crate::store::StoreError;
use crate::selectors::{actions, Selector, SelectorError, SelectorMap};
use dom::{DomTree, MutationKind, MutationRecord, NodeId};

pub use sentinel::{spawn_sentinel, LivePage, ObserverCommand, SentinelHandle};

/// Ancestors inspected when walking up from a turn marker
const MAX_WALK_DEPTH: usize = 10;

/// Outcome of a root tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootTick {
    Unchanged,
    /// Attached to a new container (first attach or navigation)
    Attached(NodeId),
    /// The container disappeared
    Detached,
}

#[derive(Error, Debug)]
pub enum ObserverError {
    #[error(transparent)]
    Selector(#[from] SelectorError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

pub struct InteractionObserver {
    endpoint: Endpoint,
    marker: Selector,
    turn_list: Selector,
    title: Option<Selector>,
    policy: SplitPolicy,
    container: Option<NodeId>,
    seen: HashSet<NodeId>,
    count: u32,
    segment_id: Option<String>,
    conversation_url: Option<String>,
    split_latched: bool,
    last_response_chars: Option<usize>,
    last_title: Option<String>,
}

impl InteractionObserver {
    /// Fails fast when the marker or container selectors are unmapped.
    pub fn new(selectors: &SelectorMap, policy: SplitPolicy, endpoint: Endpoint) -> Result<Self, SelectorError> {
        let marker = selectors.require(actions::USER_MESSAGE)?;
        let turn_list = selectors.require(actions::TURN_LIST_PARENT)?;
        let title = match selectors.require(actions::CHAT_TITLE) {
            Ok(sel) => Some(sel),
            Err(SelectorError::Unmapped(_)) => None,
            Err(e) => return Err(e),
        };

        Ok(Self {
            endpoint,
            marker,
            turn_list,
            title,
            policy,
            container: None,
            seen: HashSet::new(),
            count: 0,
            segment_id: None,
            conversation_url: None,
            split_latched: false,
            last_response_chars: None,
            last_title: None,
        })
    }

    /// Observer configured from the store: selector overrides merged over
    /// the defaults, and the split policy of the active thread.
    pub fn from_store(lifecycle: &LifecycleManager, endpoint: Endpoint) -> Result<Self, ObserverError> {
        let selectors = lifecycle.records().selector_config()?;
        let policy = lifecycle.split_policy(None)?;
        debug!(threshold = policy.threshold, "Observer configured from store");
        Ok(Self::new(&selectors, policy, endpoint)?)
    }

    pub fn container(&self) -> Option<NodeId> {
        self.container
    }

    pub fn is_attached(&self) -> bool {
        self.container.is_some()
    }

    pub fn interaction_count(&self) -> u32 {
        self.count
    }

    pub fn segment_id(&self) -> Option<&str> {
        self.segment_id.as_deref()
    }

    pub fn set_policy(&mut self, policy: SplitPolicy) {
        self.policy = policy;
    }

    /// Locate the turn list. Primary: walk up from the first marker to the
    /// lowest ancestor holding every marker, one per marker-bearing direct
    /// child. Fallback: the `turn_list_parent` selector.
    pub fn resolve_container(&self, dom: &DomTree) -> Option<NodeId> {
        let markers = dom.query_all(dom.body(), &self.marker);
        if let Some(first) = markers.first() {
            let mut cur = dom.parent(*first);
            for _ in 0..MAX_WALK_DEPTH {
                let Some(candidate) = cur else {
                    break;
                };
                if self.is_turn_list(dom, candidate, markers.len()) {
                    return Some(candidate);
                }
                cur = dom.parent(candidate);
            }
        }
        dom.query(dom.body(), &self.turn_list)
    }

    fn markers_within(&self, dom: &DomTree, node: NodeId) -> usize {
        usize::from(dom.matches(node, &self.marker)) + dom.query_all(node, &self.marker).len()
    }

    fn is_turn_list(&self, dom: &DomTree, candidate: NodeId, total: usize) -> bool {
        if dom.query_all(candidate, &self.marker).len() != total {
            return false;
        }
        let mut bearing = 0;
        for child in dom.children(candidate) {
            match self.markers_within(dom, *child) {
                0 => {}
                1 => bearing += 1,
                _ => return false,
            }
        }
        // A lone marker's wrapper also looks like a turn list; only trust the
        // class anchor in that case.
        bearing == total && (total >= 2 || dom.matches(candidate, &self.turn_list))
    }

    /// Start observing `container`. Existing markers are baselined, not counted.
    pub fn attach(&mut self, dom: &DomTree, container: NodeId) {
        self.detach();
        self.container = Some(container);
        let existing = dom.query_all(container, &self.marker);
        let baselined = existing.len();
        self.seen.extend(existing);
        info!(
            container = ?container,
            baselined,
            segment_id = ?self.segment_id,
            "Conversation observer attached"
        );
    }

    /// Stop observing and reset all per-attach state
    pub fn detach(&mut self) {
        if let Some(container) = self.container.take() {
            debug!(container = ?container, "Conversation observer detached");
        }
        self.seen.clear();
        self.count = 0;
        self.split_latched = false;
        self.last_response_chars = None;
    }

    /// Debounced root check: re-resolve the container and reattach on change
    pub fn on_root_tick(&mut self, dom: &DomTree) -> RootTick {
        self.check_title(dom);

        let resolved = self.resolve_container(dom);
        if resolved == self.container {
            return RootTick::Unchanged;
        }
        match resolved {
            Some(container) => {
                if self.container.is_some() {
                    info!("Navigation detected, resetting observer");
                }
                self.attach(dom, container);
                RootTick::Attached(container)
            }
            None => {
                info!("Conversation container removed, detaching");
                self.detach();
                RootTick::Detached
            }
        }
    }

    /// Count unseen markers after a batch that added nodes inside the
    /// container. Returns how many new interactions were counted.
    pub fn on_container_mutations(&mut self, dom: &DomTree, records: &[MutationRecord]) -> u32 {
        let Some(container) = self.container else {
            return 0;
        };
        let added_inside = records.iter().any(|r| {
            r.kind == MutationKind::ChildList
                && !r.added.is_empty()
                && dom.is_inclusive_descendant(r.target, container)
        });
        if !added_inside {
            return 0;
        }

        let mut counted = 0;
        for marker in dom.query_all(container, &self.marker) {
            if !self.seen.insert(marker) {
                continue;
            }
            self.count += 1;
            counted += 1;
            debug!(count = self.count, segment_id = ?self.segment_id, "User message detected");
            self.emit(Message::InteractionDetected {
                count: self.count,
                segment_id: self.segment_id.clone(),
            });
            self.evaluate_split();
        }
        counted
    }

    /// Feed the length of the latest assistant response into the policy
    pub fn observe_response_length(&mut self, chars: usize) {
        self.last_response_chars = Some(chars);
        self.evaluate_split();
    }

    /// Zero the counter after a completed split. Markers currently in the
    /// container are re-baselined so they are never counted again.
    pub fn reset_interaction_count(&mut self, dom: &DomTree) {
        self.count = 0;
        self.split_latched = false;
        self.last_response_chars = None;
        if let Some(container) = self.container {
            self.seen.extend(dom.query_all(container, &self.marker));
        }
    }

    pub fn bind_segment(&mut self, segment_id: Option<String>) {
        self.segment_id = segment_id;
    }

    /// Conversation the page is showing, reported with split triggers so a
    /// conversation without a thread can be adopted
    pub fn bind_conversation(&mut self, conversation_url: Option<String>) {
        self.conversation_url = conversation_url;
    }

    /// The page is moving to another segment: bind it and drop the current
    /// container. The next root tick attaches to whatever is rendered.
    pub fn navigate_to(&mut self, segment_id: String) {
        info!(segment_id = %segment_id, "Navigating to segment");
        self.bind_segment(Some(segment_id));
        self.detach();
    }

    fn evaluate_split(&mut self) {
        if self.split_latched {
            return;
        }
        if let Some(reason) = self.policy.evaluate(self.count, self.last_response_chars) {
            self.split_latched = true;
            info!(count = self.count, reason = ?reason, "Split threshold reached");
            self.emit(Message::SplitTriggered {
                segment_id: self.segment_id.clone(),
                reason: Some(reason),
                conversation_url: self.conversation_url.clone(),
            });
        }
    }

    fn check_title(&mut self, dom: &DomTree) {
        let Some(selector) = &self.title else {
            return;
        };
        let Some(node) = dom.query(dom.body(), selector) else {
            return;
        };
        let title = dom.text_content(node).trim().to_string();
        if title.is_empty() || self.last_title.as_deref() == Some(title.as_str()) {
            return;
        }
        self.last_title = Some(title.clone());
        self.emit(Message::TitleDetected {
            title,
            segment_id: self.segment_id.clone(),
            conversation_url: self.conversation_url.clone(),
        });
    }

    fn emit(&self, message: Message) {
        if let Err(e) = self.endpoint.notify(Context::Orchestrator, &message) {
            warn!(error = %e, kind = message.kind(), "Observer notification dropped");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::bus::{Mailbox, MessageBus};
    use crate::policy::SplitReason;
    use dom::Element;

    pub(crate) const TURN_LIST_CLASSES: &str = "flex-1 flex flex-col px-4 max-w-3xl";

    pub(crate) fn user_turn(dom: &mut DomTree, list: NodeId) -> (NodeId, MutationRecord) {
        let turn = dom.create(Element::new("div").attr("data-test-render-count", "1"));
        dom.append(turn, Element::new("div").attr("data-testid", "user-message").text("hi"));
        let record = dom.append_child(list, turn);
        (turn, record)
    }

    fn setup(threshold: u32) -> (InteractionObserver, Mailbox) {
        let bus = MessageBus::new();
        let mailbox = bus.register(Context::Orchestrator);
        let observer = InteractionObserver::new(
            &SelectorMap::default(),
            SplitPolicy {
                threshold,
                adaptive_char_threshold: None,
            },
            bus.endpoint(Context::Page),
        )
        .unwrap();
        (observer, mailbox)
    }

    fn page_with_turns(n: usize) -> (DomTree, NodeId) {
        let mut dom = DomTree::new();
        let body = dom.body();
        let (main, _) = dom.append(body, Element::new("main"));
        let (list, _) = dom.append(main, Element::new("div").class(TURN_LIST_CLASSES));
        for _ in 0..n {
            user_turn(&mut dom, list);
        }
        (dom, list)
    }

    fn drain(mailbox: &mut Mailbox) -> Vec<Message> {
        let mut out = Vec::new();
        while let Some(d) = mailbox.try_recv() {
            out.push(d.message);
        }
        out
    }

    #[test]
    fn test_resolve_container_by_walk_up() {
        let (observer, _mb) = setup(2);
        let mut dom = DomTree::new();
        let body = dom.body();
        // No class anchor: walk-up needs two markers to be sure
        let (list, _) = dom.append(body, Element::new("section"));
        user_turn(&mut dom, list);
        user_turn(&mut dom, list);
        assert_eq!(observer.resolve_container(&dom), Some(list));
    }

    #[test]
    fn test_resolve_container_single_marker_uses_anchor() {
        let (observer, _mb) = setup(2);
        let (dom, list) = page_with_turns(1);
        assert_eq!(observer.resolve_container(&dom), Some(list));
    }

    #[test]
    fn test_resolve_container_fallback_without_markers() {
        let (observer, _mb) = setup(2);
        let (dom, list) = page_with_turns(0);
        assert_eq!(observer.resolve_container(&dom), Some(list));
        assert_eq!(observer.resolve_container(&DomTree::new()), None);
    }

    #[test]
    fn test_baseline_excluded_from_count() {
        let (mut observer, mut mailbox) = setup(10);
        let (mut dom, list) = page_with_turns(3);
        assert_eq!(observer.on_root_tick(&dom), RootTick::Attached(list));
        assert_eq!(observer.interaction_count(), 0);

        let (_, r1) = user_turn(&mut dom, list);
        let (_, r2) = user_turn(&mut dom, list);
        observer.on_container_mutations(&dom, &[r1, r2]);
        assert_eq!(observer.interaction_count(), 2);

        let counts: Vec<u32> = drain(&mut mailbox)
            .into_iter()
            .filter_map(|m| match m {
                Message::InteractionDetected { count, .. } => Some(count),
                _ => None,
            })
            .collect();
        assert_eq!(counts, vec![1, 2]);
    }

    #[test]
    fn test_reorder_and_attribute_changes_not_recounted() {
        let (mut observer, _mb) = setup(10);
        let (mut dom, list) = page_with_turns(0);
        observer.on_root_tick(&dom);

        let (t1, r1) = user_turn(&mut dom, list);
        let (_t2, r2) = user_turn(&mut dom, list);
        observer.on_container_mutations(&dom, &[r1, r2]);
        assert_eq!(observer.interaction_count(), 2);

        // Move the first turn to the end (re-render) and touch an attribute
        let moved = dom.append_child(list, t1);
        let attr = dom.set_attr(t1, "data-test-render-count", "2");
        observer.on_container_mutations(&dom, &[moved, attr]);
        assert_eq!(observer.interaction_count(), 2);
    }

    #[test]
    fn test_mutations_outside_container_ignored() {
        let (mut observer, _mb) = setup(10);
        let (mut dom, _list) = page_with_turns(1);
        observer.on_root_tick(&dom);

        let body = dom.body();
        let (_, record) = dom.append(body, Element::new("div").attr("data-testid", "user-message"));
        assert_eq!(observer.on_container_mutations(&dom, &[record]), 0);
    }

    #[test]
    fn test_split_emitted_once_per_attach() {
        let (mut observer, mut mailbox) = setup(2);
        observer.bind_segment(Some("seg-1".to_string()));
        let (mut dom, list) = page_with_turns(0);
        observer.on_root_tick(&dom);

        for _ in 0..4 {
            let (_, r) = user_turn(&mut dom, list);
            observer.on_container_mutations(&dom, &[r]);
        }

        let splits: Vec<Message> = drain(&mut mailbox)
            .into_iter()
            .filter(|m| matches!(m, Message::SplitTriggered { .. }))
            .collect();
        assert_eq!(
            splits,
            vec![Message::SplitTriggered {
                segment_id: Some("seg-1".to_string()),
                reason: Some(SplitReason::Threshold),
                conversation_url: None,
            }]
        );
    }

    #[test]
    fn test_navigation_resets_state() {
        let (mut observer, _mb) = setup(10);
        let (mut dom, list) = page_with_turns(2);
        observer.on_root_tick(&dom);
        let (_, r) = user_turn(&mut dom, list);
        observer.on_container_mutations(&dom, &[r]);
        assert_eq!(observer.interaction_count(), 1);

        // SPA navigation: old list removed, new conversation rendered
        let main = dom.parent(list).unwrap();
        dom.remove(list);
        let (new_list, _) = dom.append(main, Element::new("div").class(TURN_LIST_CLASSES));
        user_turn(&mut dom, new_list);

        assert_eq!(observer.on_root_tick(&dom), RootTick::Attached(new_list));
        assert_eq!(observer.interaction_count(), 0);
        assert_eq!(observer.on_root_tick(&dom), RootTick::Unchanged);

        dom.remove(new_list);
        assert_eq!(observer.on_root_tick(&dom), RootTick::Detached);
        assert!(!observer.is_attached());
    }

    #[test]
    fn test_reset_rebaselines() {
        let (mut observer, _mb) = setup(10);
        let (mut dom, list) = page_with_turns(0);
        observer.on_root_tick(&dom);
        let (_, r) = user_turn(&mut dom, list);
        observer.on_container_mutations(&dom, &[r.clone()]);
        observer.reset_interaction_count(&dom);
        assert_eq!(observer.interaction_count(), 0);

        // Re-delivering the same batch must not count the old marker
        observer.on_container_mutations(&dom, &[r]);
        assert_eq!(observer.interaction_count(), 0);
    }

    #[test]
    fn test_long_response_triggers_split() {
        let bus = MessageBus::new();
        let mut mailbox = bus.register(Context::Orchestrator);
        let mut observer = InteractionObserver::new(
            &SelectorMap::default(),
            SplitPolicy {
                threshold: 10,
                adaptive_char_threshold: Some(100),
            },
            bus.endpoint(Context::Page),
        )
        .unwrap();
        let (mut dom, list) = page_with_turns(0);
        observer.on_root_tick(&dom);
        let (_, r) = user_turn(&mut dom, list);
        observer.on_container_mutations(&dom, &[r]);
        observer.observe_response_length(500);

        assert!(drain(&mut mailbox).contains(&Message::SplitTriggered {
            segment_id: None,
            reason: Some(SplitReason::LongResponse),
            conversation_url: None,
        }));
    }

    #[test]
    fn test_title_detected_once_per_change() {
        let (mut observer, mut mailbox) = setup(10);
        let (mut dom, _list) = page_with_turns(0);
        let body = dom.body();
        let (title, _) = dom.append(
            body,
            Element::new("button")
                .attr("data-testid", "chat-title-button")
                .text("Parser design"),
        );
        observer.on_root_tick(&dom);
        observer.on_root_tick(&dom);
        dom.clear_children(title);
        dom.append(title, Element::new("span").text(" "));

        let titles: Vec<Message> = drain(&mut mailbox)
            .into_iter()
            .filter(|m| matches!(m, Message::TitleDetected { .. }))
            .collect();
        assert_eq!(
            titles,
            vec![Message::TitleDetected {
                title: "Parser design".to_string(),
                segment_id: None,
                conversation_url: None,
            }]
        );
    }

    #[test]
    fn test_unmapped_marker_fails_fast() {
        let bus = MessageBus::new();
        let result = InteractionObserver::new(
            &SelectorMap::empty(),
            SplitPolicy::default(),
            bus.endpoint(Context::Page),
        );
        assert!(matches!(result, Err(SelectorError::Unmapped(_))));
    }

    #[test]
    fn test_missing_receiver_is_swallowed() {
        let bus = MessageBus::new();
        let mut observer = InteractionObserver::new(
            &SelectorMap::default(),
            SplitPolicy::default(),
            bus.endpoint(Context::Page),
        )
        .unwrap();
        let (mut dom, list) = page_with_turns(0);
        observer.on_root_tick(&dom);
        let (_, r) = user_turn(&mut dom, list);
        assert_eq!(observer.on_container_mutations(&dom, &[r]), 1);
    }

    fn store_with_thread(threshold: u32) -> LifecycleManager {
        let lifecycle = LifecycleManager::new(crate::store::Records::in_memory());
        lifecycle
            .records()
            .update_settings(|s| s.split_threshold = threshold)
            .unwrap();
        lifecycle
            .create_thread(crate::lifecycle::NewThread {
                title: "Parser".to_string(),
                conversation_url: "https://chat.example/chat/c1".to_string(),
                conversation_id: "c1".to_string(),
                ..Default::default()
            })
            .unwrap();
        lifecycle
    }

    #[test]
    fn test_from_store_uses_adjusted_threshold() {
        for (threshold, fires_at) in [(2, 2), (4, 4)] {
            let lifecycle = store_with_thread(threshold);
            let bus = MessageBus::new();
            let mut mailbox = bus.register(Context::Orchestrator);
            let mut observer = InteractionObserver::from_store(&lifecycle, bus.endpoint(Context::Page)).unwrap();
            let (mut dom, list) = page_with_turns(0);
            observer.on_root_tick(&dom);

            let mut split_at = None;
            for n in 1..=5 {
                let (_, r) = user_turn(&mut dom, list);
                observer.on_container_mutations(&dom, &[r]);
                let split = drain(&mut mailbox)
                    .iter()
                    .any(|m| matches!(m, Message::SplitTriggered { .. }));
                if split && split_at.is_none() {
                    split_at = Some(n);
                }
            }
            assert_eq!(split_at, Some(fires_at), "threshold {}", threshold);
        }
    }

    #[test]
    fn test_from_store_uses_selector_overrides() {
        let lifecycle = store_with_thread(10);
        let overrides = [(actions::USER_MESSAGE.to_string(), r#"[data-role="human"]"#.to_string())]
            .into_iter()
            .collect();
        lifecycle.records().update_selector_config(overrides).unwrap();
        let bus = MessageBus::new();
        let mut observer = InteractionObserver::from_store(&lifecycle, bus.endpoint(Context::Page)).unwrap();
        let (mut dom, list) = page_with_turns(0);
        observer.on_root_tick(&dom);

        let turn = dom.create(Element::new("div"));
        dom.append(turn, Element::new("p").attr("data-role", "human").text("hello"));
        let added = dom.append_child(list, turn);
        assert_eq!(observer.on_container_mutations(&dom, &[added]), 1);

        // The default marker no longer counts
        let (_, r) = user_turn(&mut dom, list);
        assert_eq!(observer.on_container_mutations(&dom, &[r]), 0);
        assert_eq!(observer.interaction_count(), 1);
    }
}
