//! Thread/Segment lifecycle
//!
//! The only component that creates Threads and Segments or moves a Segment
//! between statuses. Loads go through read-repair so a crash between two
//! record writes never leaves a dangling active pointer behind.

use chrono::{Duration, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};
use ulid::Ulid;

use crate::model::{format_segment_name, Segment, SegmentStatus, Thread, ThreadState};
use crate::policy::SplitPolicy;
use crate::store::{keys, Records, StoreError};

/// How long a Thread may exist without its first Segment before it is
/// considered corrupt
const CREATION_WINDOW_SECS: i64 = 30;

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Thread not found: {0}")]
    ThreadNotFound(String),
    #[error("Segment not found: {0}")]
    SegmentNotFound(String),
    #[error("Segment {segment_id} does not belong to thread {thread_id}")]
    ForeignSegment { segment_id: String, thread_id: String },
    #[error("Thread {0} has no segments and cannot be repaired")]
    Corrupted(String),
}

impl Serialize for LifecycleError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Input for `create_thread`. Unset fields fall back to user settings.
#[derive(Debug, Clone, Default)]
pub struct NewThread {
    pub title: String,
    pub conversation_url: String,
    pub conversation_id: String,
    pub project_name: Option<String>,
    pub prefix: Option<String>,
    pub split_threshold: Option<u32>,
    pub local_root: Option<String>,
}

/// Outcome of `repair_all`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairReport {
    pub threads_checked: usize,
    pub repaired: Vec<String>,
    pub corrupted: Vec<String>,
    pub orphan_segments: Vec<String>,
}

/// Conversation id is the last path component of the conversation URL
pub fn conversation_id_from_url(url: &str) -> String {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(url)
        .to_string()
}

#[derive(Clone)]
pub struct LifecycleManager {
    records: Records,
}

impl LifecycleManager {
    pub fn new(records: Records) -> Self {
        Self { records }
    }

    pub fn records(&self) -> &Records {
        &self.records
    }

    /// Create a Thread together with Segment 1 and make it the active thread.
    ///
    /// Written in three steps (thread without pointer, segment, pointer) so
    /// that a crash in between is recoverable by read-repair.
    pub fn create_thread(&self, input: NewThread) -> Result<(Thread, Segment), LifecycleError> {
        let settings = self.records.settings()?;
        let now = Utc::now();
        let prefix = input.prefix.unwrap_or(settings.default_prefix);

        let mut thread = Thread {
            id: Ulid::new().to_string(),
            project_name: input.project_name.unwrap_or_else(|| input.title.clone()),
            title: input.title,
            project_url: None,
            prefix,
            segment_count: 0,
            active_segment_id: None,
            split_threshold: input.split_threshold.unwrap_or(settings.split_threshold),
            local_root: input.local_root.unwrap_or(settings.local_root),
            created_at: now,
            updated_at: now,
        };
        self.records.save_thread(&thread)?;

        let segment = Segment {
            id: Ulid::new().to_string(),
            thread_id: thread.id.clone(),
            sequence: 1,
            conversation_url: input.conversation_url,
            conversation_id: input.conversation_id,
            display_name: format_segment_name(&thread.prefix, 1, &thread.title),
            status: SegmentStatus::Active,
            interaction_count: 0,
            brief: None,
            continuation_prompt: None,
            artifacts: Vec::new(),
            started_at: now,
            checkpointed_at: None,
        };
        self.records.save_segment(&segment)?;

        thread.active_segment_id = Some(segment.id.clone());
        thread.segment_count = 1;
        thread.updated_at = Utc::now();
        self.records.save_thread(&thread)?;
        self.records.set_active_thread_id(Some(&thread.id))?;

        info!(thread_id = %thread.id, segment_id = %segment.id, title = %thread.title, "Created thread");
        Ok((thread, segment))
    }

    /// Load a Thread, repairing its count and active pointer if needed
    pub fn load_thread(&self, thread_id: &str) -> Result<Thread, LifecycleError> {
        let thread = self
            .records
            .thread(thread_id)?
            .ok_or_else(|| LifecycleError::ThreadNotFound(thread_id.to_string()))?;
        self.repair_thread(thread)
    }

    pub fn threads(&self) -> Result<Vec<Thread>, LifecycleError> {
        Ok(self.records.threads()?)
    }

    fn repair_thread(&self, thread: Thread) -> Result<Thread, LifecycleError> {
        let mut segments = self.records.segments_by_thread(&thread.id)?;
        if segments.is_empty() {
            if Utc::now() - thread.created_at < Duration::seconds(CREATION_WINDOW_SECS) {
                return Ok(thread);
            }
            return Err(LifecycleError::Corrupted(thread.id));
        }

        let count = segments.len() as u32;
        let pointer_ok = thread
            .active_segment_id
            .as_deref()
            .and_then(|id| segments.iter().find(|s| s.id == id))
            .is_some_and(|s| s.is_active());

        let target = if pointer_ok {
            None
        } else if let Some(active) = segments.iter().rev().find(|s| s.is_active()) {
            Some(active.id.clone())
        } else {
            // No active segment left: bring the newest one back
            let Some(last) = segments.last_mut() else {
                return Err(LifecycleError::Corrupted(thread.id));
            };
            last.status = SegmentStatus::Active;
            self.records.save_segment(last)?;
            warn!(thread_id = %thread.id, segment_id = %last.id, "Re-activated newest segment");
            Some(last.id.clone())
        };

        if thread.segment_count == count && target.is_none() {
            return Ok(thread);
        }

        warn!(
            thread_id = %thread.id,
            stored_count = thread.segment_count,
            actual_count = count,
            old_pointer = ?thread.active_segment_id,
            new_pointer = ?target,
            "Repairing thread"
        );
        let repaired = self
            .records
            .update(keys::THREADS, &thread.id, |t: &mut Thread| {
                t.segment_count = count;
                if let Some(id) = target {
                    t.active_segment_id = Some(id);
                }
                t.updated_at = Utc::now();
            })?;
        repaired.ok_or(LifecycleError::ThreadNotFound(thread.id))
    }

    /// Segments of a thread ordered by sequence
    pub fn segments_for_thread(&self, thread_id: &str) -> Result<Vec<Segment>, LifecycleError> {
        Ok(self.records.segments_by_thread(thread_id)?)
    }

    pub fn get_segment(&self, segment_id: &str) -> Result<Segment, LifecycleError> {
        self.records
            .segment(segment_id)?
            .ok_or_else(|| LifecycleError::SegmentNotFound(segment_id.to_string()))
    }

    pub fn find_segment_by_conversation(&self, conversation_url: &str) -> Result<Option<Segment>, LifecycleError> {
        Ok(self.records.segment_by_conversation(conversation_url)?)
    }

    /// Apply a field update to a segment owned by a pipeline stage
    pub fn update_segment<F>(&self, segment_id: &str, f: F) -> Result<Segment, LifecycleError>
    where
        F: FnOnce(&mut Segment),
    {
        self.records
            .update(keys::SEGMENTS, segment_id, f)?
            .ok_or_else(|| LifecycleError::SegmentNotFound(segment_id.to_string()))
    }

    fn update_thread<F>(&self, thread_id: &str, f: F) -> Result<Thread, LifecycleError>
    where
        F: FnOnce(&mut Thread),
    {
        self.records
            .update(keys::THREADS, thread_id, |t: &mut Thread| {
                f(t);
                t.updated_at = Utc::now();
            })?
            .ok_or_else(|| LifecycleError::ThreadNotFound(thread_id.to_string()))
    }

    /// One more user turn observed on `segment_id`
    pub fn record_interaction(&self, segment_id: &str) -> Result<Segment, LifecycleError> {
        self.update_segment(segment_id, |s| s.interaction_count += 1)
    }

    /// Rename from a detected conversation title, keeping prefix and sequence
    pub fn rename_segment(&self, segment_id: &str, auto_title: &str) -> Result<Segment, LifecycleError> {
        let segment = self.get_segment(segment_id)?;
        let thread = self.load_thread(&segment.thread_id)?;
        let name = format_segment_name(&thread.prefix, segment.sequence, auto_title);
        self.update_segment(segment_id, |s| s.display_name = name)
    }

    pub fn attach_project(&self, thread_id: &str, project_url: &str) -> Result<Thread, LifecycleError> {
        let thread = self.update_thread(thread_id, |t| t.project_url = Some(project_url.to_string()))?;
        info!(thread_id = %thread_id, project_url = %project_url, "Attached project");
        Ok(thread)
    }

    /// Create (or find) the successor of `predecessor_id` and point the
    /// thread at it. Idempotent by `(thread_id, sequence)`.
    pub fn open_successor(
        &self,
        predecessor_id: &str,
        conversation_url: &str,
    ) -> Result<Segment, LifecycleError> {
        let predecessor = self.get_segment(predecessor_id)?;
        let thread = self.load_thread(&predecessor.thread_id)?;
        let sequence = predecessor.sequence + 1;
        let segments = self.records.segments_by_thread(&thread.id)?;

        let successor = match segments.into_iter().find(|s| s.sequence == sequence) {
            Some(existing) => {
                info!(thread_id = %thread.id, segment_id = %existing.id, sequence, "Successor already exists");
                existing
            }
            None => {
                let segment = Segment {
                    id: Ulid::new().to_string(),
                    thread_id: thread.id.clone(),
                    sequence,
                    conversation_url: conversation_url.to_string(),
                    conversation_id: conversation_id_from_url(conversation_url),
                    display_name: format_segment_name(&thread.prefix, sequence, &thread.title),
                    status: SegmentStatus::Active,
                    interaction_count: 0,
                    brief: None,
                    continuation_prompt: None,
                    artifacts: Vec::new(),
                    started_at: Utc::now(),
                    checkpointed_at: None,
                };
                self.records.save_segment(&segment)?;
                info!(thread_id = %thread.id, segment_id = %segment.id, sequence, "Opened successor segment");
                segment
            }
        };

        let count = self.records.segments_by_thread(&thread.id)?.len() as u32;
        let successor_id = successor.id.clone();
        self.update_thread(&thread.id, |t| {
            t.active_segment_id = Some(successor_id);
            t.segment_count = count;
        })?;
        Ok(successor)
    }

    /// Mark a segment checkpointed. Already-checkpointed segments are
    /// returned unchanged.
    pub fn finalize_segment(&self, segment_id: &str) -> Result<Segment, LifecycleError> {
        let segment = self.update_segment(segment_id, |s| {
            if s.status == SegmentStatus::Active {
                s.status = SegmentStatus::Checkpointed;
                s.checkpointed_at = Some(Utc::now());
            }
        })?;
        info!(segment_id = %segment_id, status = segment.status.as_str(), "Finalized segment");
        Ok(segment)
    }

    /// Delete a thread with all of its segments and any pending checkpoint.
    /// Returns how many segments were removed.
    pub fn delete_thread(&self, thread_id: &str) -> Result<usize, LifecycleError> {
        let existed = self.records.thread(thread_id)?.is_some();
        let removed = self
            .records
            .retain(keys::SEGMENTS, |s: &Segment| s.thread_id != thread_id)?;
        if !existed && removed == 0 {
            return Err(LifecycleError::ThreadNotFound(thread_id.to_string()));
        }
        self.records.remove(keys::THREADS, thread_id)?;
        self.records.clear_progress(thread_id)?;
        if self.records.active_thread_id()?.as_deref() == Some(thread_id) {
            self.records.set_active_thread_id(None)?;
        }
        info!(thread_id = %thread_id, segments = removed, "Deleted thread");
        Ok(removed)
    }

    pub fn set_active_thread(&self, thread_id: Option<&str>) -> Result<(), LifecycleError> {
        if let Some(id) = thread_id {
            if self.records.thread(id)?.is_none() {
                return Err(LifecycleError::ThreadNotFound(id.to_string()));
            }
        }
        self.records.set_active_thread_id(thread_id)?;
        Ok(())
    }

    /// The active thread, repaired. A dangling pointer is cleared.
    pub fn active_thread(&self) -> Result<Option<Thread>, LifecycleError> {
        let Some(id) = self.records.active_thread_id()? else {
            return Ok(None);
        };
        match self.load_thread(&id) {
            Ok(thread) => Ok(Some(thread)),
            Err(LifecycleError::ThreadNotFound(_)) => {
                warn!(thread_id = %id, "Active thread pointer is dangling, clearing");
                self.records.set_active_thread_id(None)?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Active segment of the active thread
    pub fn active_segment(&self) -> Result<Option<Segment>, LifecycleError> {
        let Some(thread) = self.active_thread()? else {
            return Ok(None);
        };
        match thread.active_segment_id {
            Some(id) => Ok(self.records.segment(&id)?),
            None => Ok(None),
        }
    }

    /// Split policy for a thread, or for the active thread when `thread_id`
    /// is `None`. Without a thread the user settings apply.
    pub fn split_policy(&self, thread_id: Option<&str>) -> Result<SplitPolicy, LifecycleError> {
        let settings = self.records.settings()?;
        let thread = match thread_id {
            Some(id) => Some(self.load_thread(id)?),
            None => self.active_thread()?,
        };
        Ok(match thread {
            Some(thread) => SplitPolicy::for_thread(&thread, &settings),
            None => SplitPolicy::from_settings(&settings),
        })
    }

    pub fn thread_state(&self) -> Result<ThreadState, LifecycleError> {
        let Some(thread) = self.active_thread()? else {
            return Ok(ThreadState::default());
        };
        let segments = self.segments_for_thread(&thread.id)?;
        Ok(ThreadState {
            thread: Some(thread),
            segments,
        })
    }

    /// Read-repair every thread and report segments whose thread is gone
    pub fn repair_all(&self) -> Result<RepairReport, LifecycleError> {
        let mut report = RepairReport::default();
        let threads = self.records.threads()?;

        for thread in &threads {
            report.threads_checked += 1;
            match self.repair_thread(thread.clone()) {
                Ok(repaired) => {
                    if repaired.segment_count != thread.segment_count
                        || repaired.active_segment_id != thread.active_segment_id
                    {
                        report.repaired.push(thread.id.clone());
                    }
                }
                Err(LifecycleError::Corrupted(id)) => {
                    error!(thread_id = %id, "Thread has no segments");
                    report.corrupted.push(id);
                }
                Err(e) => return Err(e),
            }
        }

        for segment in self.records.segments()? {
            if !threads.iter().any(|t| t.id == segment.thread_id) {
                warn!(segment_id = %segment.id, thread_id = %segment.thread_id, "Orphan segment");
                report.orphan_segments.push(segment.id);
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> LifecycleManager {
        LifecycleManager::new(Records::in_memory())
    }

    fn new_thread(title: &str, url: &str) -> NewThread {
        NewThread {
            title: title.to_string(),
            conversation_url: url.to_string(),
            conversation_id: conversation_id_from_url(url),
            ..Default::default()
        }
    }

    #[test]
    fn test_create_thread() {
        let lifecycle = manager();
        let (thread, segment) = lifecycle
            .create_thread(new_thread("Parser", "https://chat.example/chat/abc"))
            .unwrap();
        assert_eq!(thread.segment_count, 1);
        assert_eq!(thread.active_segment_id.as_deref(), Some(segment.id.as_str()));
        assert_eq!(segment.display_name, "CW-001-Parser");
        assert_eq!(segment.conversation_id, "abc");
        assert_eq!(
            lifecycle.records().active_thread_id().unwrap().as_deref(),
            Some(thread.id.as_str())
        );
    }

    #[test]
    fn test_split_policy_follows_settings_and_thread() {
        let lifecycle = manager();
        assert_eq!(lifecycle.split_policy(None).unwrap().threshold, 2);

        lifecycle
            .records()
            .update_settings(|s| {
                s.split_threshold = 5;
                s.adaptive_char_threshold = Some(3000);
            })
            .unwrap();
        let (inherited, _) = lifecycle
            .create_thread(new_thread("A", "https://chat.example/chat/a"))
            .unwrap();
        let (own, _) = lifecycle
            .create_thread(NewThread {
                split_threshold: Some(7),
                ..new_thread("B", "https://chat.example/chat/b")
            })
            .unwrap();

        let policy = lifecycle.split_policy(Some(&inherited.id)).unwrap();
        assert_eq!(policy.threshold, 5);
        assert_eq!(policy.adaptive_char_threshold, Some(3000));
        assert_eq!(lifecycle.split_policy(Some(&own.id)).unwrap().threshold, 7);
        // The most recently created thread is active
        assert_eq!(lifecycle.split_policy(None).unwrap().threshold, 7);
    }

    #[test]
    fn test_open_successor_is_idempotent() {
        let lifecycle = manager();
        let (thread, first) = lifecycle
            .create_thread(new_thread("T", "https://chat.example/chat/a"))
            .unwrap();

        let second = lifecycle
            .open_successor(&first.id, "https://chat.example/chat/b")
            .unwrap();
        let again = lifecycle
            .open_successor(&first.id, "https://chat.example/chat/c")
            .unwrap();
        assert_eq!(second.id, again.id);
        assert_eq!(second.sequence, 2);
        assert_eq!(second.display_name, "CW-002-T");

        let thread = lifecycle.load_thread(&thread.id).unwrap();
        assert_eq!(thread.segment_count, 2);
        assert_eq!(thread.active_segment_id.as_deref(), Some(second.id.as_str()));
    }

    #[test]
    fn test_repair_dangling_pointer() {
        let lifecycle = manager();
        let (thread, first) = lifecycle
            .create_thread(new_thread("T", "https://chat.example/chat/a"))
            .unwrap();
        lifecycle
            .records()
            .update(keys::THREADS, &thread.id, |t: &mut Thread| {
                t.active_segment_id = Some("ghost".to_string());
                t.segment_count = 7;
            })
            .unwrap();

        let repaired = lifecycle.load_thread(&thread.id).unwrap();
        assert_eq!(repaired.segment_count, 1);
        assert_eq!(repaired.active_segment_id.as_deref(), Some(first.id.as_str()));
    }

    #[test]
    fn test_repair_reactivates_newest_when_none_active() {
        let lifecycle = manager();
        let (thread, first) = lifecycle
            .create_thread(new_thread("T", "https://chat.example/chat/a"))
            .unwrap();
        let second = lifecycle
            .open_successor(&first.id, "https://chat.example/chat/b")
            .unwrap();
        lifecycle.finalize_segment(&first.id).unwrap();
        lifecycle.finalize_segment(&second.id).unwrap();

        let repaired = lifecycle.load_thread(&thread.id).unwrap();
        assert_eq!(repaired.active_segment_id.as_deref(), Some(second.id.as_str()));
        assert!(lifecycle.get_segment(&second.id).unwrap().is_active());
        assert!(!lifecycle.get_segment(&first.id).unwrap().is_active());
    }

    #[test]
    fn test_thread_without_segments() {
        let lifecycle = manager();
        let now = Utc::now();
        let mut thread = Thread {
            id: "t-empty".to_string(),
            title: "x".to_string(),
            project_name: "x".to_string(),
            project_url: None,
            prefix: "CW".to_string(),
            segment_count: 0,
            active_segment_id: None,
            split_threshold: 2,
            local_root: "Claude-Threads".to_string(),
            created_at: now,
            updated_at: now,
        };
        lifecycle.records().save_thread(&thread).unwrap();
        // Still inside the creation window
        assert!(lifecycle.load_thread("t-empty").is_ok());

        thread.created_at = now - Duration::minutes(5);
        lifecycle.records().save_thread(&thread).unwrap();
        assert!(matches!(
            lifecycle.load_thread("t-empty"),
            Err(LifecycleError::Corrupted(_))
        ));
        let report = lifecycle.repair_all().unwrap();
        assert_eq!(report.corrupted, vec!["t-empty".to_string()]);
    }

    #[test]
    fn test_delete_cascades_only_own_segments() {
        let lifecycle = manager();
        let (a, a1) = lifecycle
            .create_thread(new_thread("A", "https://chat.example/chat/a1"))
            .unwrap();
        lifecycle
            .open_successor(&a1.id, "https://chat.example/chat/a2")
            .unwrap();
        let (b, _) = lifecycle
            .create_thread(new_thread("B", "https://chat.example/chat/b1"))
            .unwrap();

        assert_eq!(lifecycle.delete_thread(&a.id).unwrap(), 2);
        assert!(lifecycle.segments_for_thread(&a.id).unwrap().is_empty());
        assert_eq!(lifecycle.segments_for_thread(&b.id).unwrap().len(), 1);
        assert!(lifecycle.records().thread(&a.id).unwrap().is_none());
        assert!(matches!(
            lifecycle.delete_thread(&a.id),
            Err(LifecycleError::ThreadNotFound(_))
        ));
    }

    #[test]
    fn test_record_interaction_and_rename() {
        let lifecycle = manager();
        let (_, segment) = lifecycle
            .create_thread(new_thread("T", "https://chat.example/chat/a"))
            .unwrap();
        lifecycle.record_interaction(&segment.id).unwrap();
        let updated = lifecycle.record_interaction(&segment.id).unwrap();
        assert_eq!(updated.interaction_count, 2);

        let renamed = lifecycle.rename_segment(&segment.id, "Lexer work").unwrap();
        assert_eq!(renamed.display_name, "CW-001-Lexer work");
    }

    #[test]
    fn test_active_thread_pointer_cleared_when_dangling() {
        let lifecycle = manager();
        lifecycle.records().set_active_thread_id(Some("missing")).unwrap();
        assert!(lifecycle.active_thread().unwrap().is_none());
        assert!(lifecycle.records().active_thread_id().unwrap().is_none());
        assert_eq!(lifecycle.thread_state().unwrap(), ThreadState::default());
    }

    #[test]
    fn test_thread_state_orders_segments() {
        let lifecycle = manager();
        let (_, first) = lifecycle
            .create_thread(new_thread("T", "https://chat.example/chat/a"))
            .unwrap();
        lifecycle
            .open_successor(&first.id, "https://chat.example/chat/b")
            .unwrap();
        let state = lifecycle.thread_state().unwrap();
        let seqs: Vec<u32> = state.segments.iter().map(|s| s.sequence).collect();
        assert_eq!(seqs, vec![1, 2]);
    }
}
