//! Checkpoint orchestrator
//!
//! Runs the checkpoint pipeline for a segment and routes bus messages to the
//! lifecycle manager. Every stage transition is committed to the store
//! before the next await, so a killed host resumes at the recorded stage.

pub mod api_brief;
pub mod collaborators;
pub mod continuation;
pub mod progress;
mod stages;

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::archive::{ArchiveError, LocalArchive};
use crate::bus::{Context, Delivery, Endpoint, Mailbox, Message};
use crate::lifecycle::{conversation_id_from_url, LifecycleError, LifecycleManager, NewThread};
use crate::model::{Segment, Thread};
use crate::policy::should_split;
use crate::store::StoreError;
use collaborators::{CollaboratorError, Collaborators};
use progress::{CheckpointProgress, CheckpointStage, TriggerSource};

/// Default bound on a single collaborator call
pub const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(120);

/// Why a single stage failed
#[derive(Error, Debug)]
pub enum StageError {
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
    #[error("{call} timed out after {secs}s")]
    Timeout { call: &'static str, secs: u64 },
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{failed} of {total} knowledge uploads incomplete")]
    UploadIncomplete { failed: usize, total: usize },
    #[error("Missing checkpoint data: {0}")]
    MissingData(&'static str),
}

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Checkpoint already in flight for thread {0}")]
    AlreadyInFlight(String),
    #[error("No active segment to checkpoint")]
    NoActiveSegment,
    #[error("Segment {0} is not active")]
    SegmentNotActive(String),
    #[error("Thread {0} was deleted during its checkpoint")]
    ThreadDeleted(String),
    #[error("Stage {stage} failed: {source}")]
    Stage {
        stage: CheckpointStage,
        #[source]
        source: StageError,
    },
}

impl Serialize for CheckpointError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Outcome of `resume_pending`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeSummary {
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    /// Records dropped because their thread no longer exists
    pub dropped: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub stage_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            stage_timeout: DEFAULT_STAGE_TIMEOUT,
        }
    }
}

/// Title seen for a conversation that has no segment yet
struct DetectedTitle {
    conversation_url: Option<String>,
    title: String,
}

pub(crate) struct Inner {
    lifecycle: LifecycleManager,
    archive: LocalArchive,
    collaborators: Collaborators,
    endpoint: Endpoint,
    config: OrchestratorConfig,
    /// Threads with a pipeline executing in this process
    running: Mutex<HashSet<String>>,
    last_title: Mutex<Option<DetectedTitle>>,
}

/// Releases the per-thread claim when dropped
struct RunningGuard {
    inner: Arc<Inner>,
    thread_id: String,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.inner.running.lock().remove(&self.thread_id);
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        lifecycle: LifecycleManager,
        archive: LocalArchive,
        collaborators: Collaborators,
        endpoint: Endpoint,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                lifecycle,
                archive,
                collaborators,
                endpoint,
                config,
                running: Mutex::new(HashSet::new()),
                last_title: Mutex::new(None),
            }),
        }
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.inner.lifecycle
    }

    /// True while a pipeline for `thread_id` is executing in this process
    pub fn is_running(&self, thread_id: &str) -> bool {
        self.inner.running.lock().contains(thread_id)
    }

    fn claim(&self, thread_id: &str) -> Option<RunningGuard> {
        if !self.inner.running.lock().insert(thread_id.to_string()) {
            return None;
        }
        Some(RunningGuard {
            inner: self.inner.clone(),
            thread_id: thread_id.to_string(),
        })
    }

    /// Checkpoint `segment_id`. Returns the successor segment.
    ///
    /// A split trigger is rejected while a record is pending for the thread;
    /// a manual trigger resumes that record instead. Either is rejected while
    /// the thread's pipeline is executing.
    pub async fn trigger(&self, segment_id: &str, trigger: TriggerSource) -> Result<Segment, CheckpointError> {
        let segment = self.inner.lifecycle.get_segment(segment_id)?;
        let thread_id = segment.thread_id.clone();
        let Some(_guard) = self.claim(&thread_id) else {
            info!(thread_id = %thread_id, "Checkpoint already executing, trigger rejected");
            return Err(CheckpointError::AlreadyInFlight(thread_id));
        };

        let records = self.inner.lifecycle.records();
        let progress = match records.progress(&thread_id)? {
            Some(pending) if trigger == TriggerSource::Split => {
                info!(
                    thread_id = %thread_id,
                    stage = %pending.stage,
                    "Checkpoint pending, split trigger rejected"
                );
                return Err(CheckpointError::AlreadyInFlight(thread_id));
            }
            Some(pending) => {
                info!(
                    thread_id = %thread_id,
                    stage = %pending.stage,
                    attempts = pending.attempts,
                    "Retrying pending checkpoint"
                );
                pending
            }
            None => {
                if !segment.is_active() {
                    return Err(CheckpointError::SegmentNotActive(segment.id));
                }
                let progress = CheckpointProgress::new(&thread_id, &segment.id, trigger);
                records.save_progress(&progress)?;
                info!(thread_id = %thread_id, segment_id = %segment.id, trigger = ?trigger, "Checkpoint started");
                self.inner.broadcast(&Message::CheckpointStart {
                    segment_id: segment.id.clone(),
                });
                progress
            }
        };

        self.inner.run_pipeline(progress).await
    }

    /// Resume every stored progress record at its recorded stage. Threads
    /// are independent, so their pipelines run concurrently.
    pub async fn resume_pending(&self) -> Result<ResumeSummary, CheckpointError> {
        let records = self.inner.lifecycle.records();
        let mut summary = ResumeSummary::default();
        let mut pending = Vec::new();
        for progress in records.all_progress()? {
            if records.thread(&progress.thread_id)?.is_none() {
                warn!(thread_id = %progress.thread_id, "Dropping checkpoint record of deleted thread");
                records.clear_progress(&progress.thread_id)?;
                summary.dropped.push(progress.thread_id);
            } else {
                pending.push(progress);
            }
        }

        let runs = pending.into_iter().filter_map(|mut progress| {
            let guard = self.claim(&progress.thread_id)?;
            let inner = self.inner.clone();
            Some(async move {
                let _guard = guard;
                let thread_id = progress.thread_id.clone();
                info!(thread_id = %thread_id, stage = %progress.stage, "Resuming checkpoint");
                progress.trigger = TriggerSource::Resume;
                let result = inner.run_pipeline(progress).await;
                (thread_id, result)
            })
        });

        for (thread_id, result) in futures::future::join_all(runs).await {
            match result {
                Ok(_) => summary.completed.push(thread_id),
                Err(CheckpointError::ThreadDeleted(_)) => summary.dropped.push(thread_id),
                Err(e) => {
                    warn!(thread_id = %thread_id, error = %e, "Resume failed");
                    summary.failed.push(thread_id);
                }
            }
        }
        Ok(summary)
    }

    /// Thread and segment for a conversation, creating both on first sight
    pub fn ensure_thread_for_conversation(
        &self,
        conversation_url: &str,
        title: Option<&str>,
    ) -> Result<(Thread, Segment), CheckpointError> {
        let lifecycle = &self.inner.lifecycle;
        if let Some(segment) = lifecycle.find_segment_by_conversation(conversation_url)? {
            let thread = lifecycle.load_thread(&segment.thread_id)?;
            return Ok((thread, segment));
        }
        let conversation_id = conversation_id_from_url(conversation_url);
        let detected = self.inner.last_title.lock().as_ref().and_then(|d| {
            match d.conversation_url.as_deref() {
                Some(url) if url != conversation_url => None,
                _ => Some(d.title.clone()),
            }
        });
        let title = title
            .map(str::to_string)
            .or(detected)
            .unwrap_or_else(|| conversation_id.clone());
        Ok(lifecycle.create_thread(NewThread {
            title,
            conversation_url: conversation_url.to_string(),
            conversation_id,
            ..Default::default()
        })?)
    }

    /// Segment a trigger refers to: the given id, else the active segment
    fn resolve_segment(
        &self,
        segment_id: Option<&str>,
        conversation_url: Option<&str>,
    ) -> Result<Segment, CheckpointError> {
        if let Some(id) = segment_id.filter(|id| !id.is_empty()) {
            return Ok(self.inner.lifecycle.get_segment(id)?);
        }
        if let Some(url) = conversation_url {
            return Ok(self.ensure_thread_for_conversation(url, None)?.1);
        }
        self.inner
            .lifecycle
            .active_segment()?
            .ok_or(CheckpointError::NoActiveSegment)
    }

    fn spawn_checkpoint(&self, segment: Segment, trigger: TriggerSource) {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            if let Err(e) = orchestrator.trigger(&segment.id, trigger).await {
                match &e {
                    CheckpointError::Stage { .. } => {}
                    // Page and orchestrator can both decide to split
                    CheckpointError::AlreadyInFlight(_) | CheckpointError::SegmentNotActive(_)
                        if trigger == TriggerSource::Split =>
                    {
                        debug!(segment_id = %segment.id, error = %e, "Duplicate split trigger ignored")
                    }
                    other => warn!(segment_id = %segment.id, error = %other, "Checkpoint not run"),
                }
            }
        });
    }

    /// Route one message. Pipelines are spawned, so this returns promptly.
    pub async fn handle(&self, delivery: Delivery) {
        let kind = delivery.message.kind();
        if let Err(e) = self.route(delivery).await {
            warn!(kind, error = %e, "Message handling failed");
        }
    }

    async fn route(&self, delivery: Delivery) -> Result<(), CheckpointError> {
        let lifecycle = &self.inner.lifecycle;
        match delivery.message.clone() {
            Message::InteractionDetected { count, segment_id } => {
                let segment = self.resolve_segment(segment_id.as_deref(), None)?;
                let updated = lifecycle.record_interaction(&segment.id)?;
                debug!(
                    segment_id = %updated.id,
                    observed = count,
                    total = updated.interaction_count,
                    "Interaction recorded"
                );
                // The thread's own threshold applies to the persisted count,
                // which survives page reloads
                let policy = lifecycle.split_policy(Some(&updated.thread_id))?;
                if updated.is_active()
                    && should_split(updated.interaction_count, policy.threshold)
                    && !self.is_running(&updated.thread_id)
                    && lifecycle.records().progress(&updated.thread_id)?.is_none()
                {
                    info!(
                        segment_id = %updated.id,
                        count = updated.interaction_count,
                        threshold = policy.threshold,
                        "Split threshold reached"
                    );
                    self.spawn_checkpoint(updated, TriggerSource::Split);
                }
            }
            Message::SplitTriggered {
                segment_id,
                reason,
                conversation_url,
            } => {
                let segment = self.resolve_segment(segment_id.as_deref(), conversation_url.as_deref())?;
                info!(segment_id = %segment.id, reason = ?reason, "Split triggered");
                self.spawn_checkpoint(segment, TriggerSource::Split);
            }
            Message::ManualCheckpoint => {
                let segment = lifecycle.active_segment()?.ok_or(CheckpointError::NoActiveSegment)?;
                info!(segment_id = %segment.id, "Manual checkpoint requested");
                self.spawn_checkpoint(segment, TriggerSource::Manual);
            }
            Message::GetThreadState => {
                let state = lifecycle.thread_state()?;
                let reply = Message::ThreadState {
                    thread: state.thread,
                    segments: state.segments,
                };
                self.reply(delivery, &reply);
            }
            Message::TitleDetected {
                title,
                segment_id,
                conversation_url,
            } => {
                // Rename the segment the page is showing, not the active one
                let target = match (segment_id.as_deref().filter(|id| !id.is_empty()), conversation_url.as_deref()) {
                    (Some(id), _) => Some(lifecycle.get_segment(id)?),
                    (None, Some(url)) => lifecycle.find_segment_by_conversation(url)?,
                    (None, None) => lifecycle.active_segment()?,
                };
                match target {
                    Some(segment) if segment.is_active() => {
                        let renamed = lifecycle.rename_segment(&segment.id, &title)?;
                        info!(segment_id = %renamed.id, name = %renamed.display_name, "Segment renamed");
                    }
                    Some(segment) => debug!(segment_id = %segment.id, "Title for a closed segment ignored"),
                    None => {
                        debug!(conversation_url = ?conversation_url, "Title kept for an untracked conversation");
                        *self.inner.last_title.lock() = Some(DetectedTitle { conversation_url, title });
                    }
                }
            }
            Message::NavigateSegment { segment_id } => {
                let segment = lifecycle.get_segment(&segment_id)?;
                lifecycle.set_active_thread(Some(&segment.thread_id))?;
                info!(thread_id = %segment.thread_id, segment_id = %segment_id, "Active thread switched");
                if delivery.from != Context::Page {
                    self.inner
                        .notify(Context::Page, &Message::NavigateSegment { segment_id });
                }
            }
            other => debug!(kind = other.kind(), "Ignoring message"),
        }
        Ok(())
    }

    fn reply(&self, delivery: Delivery, message: &Message) {
        if delivery.expects_reply() {
            if let Err(e) = delivery.respond(message) {
                warn!(error = %e, "Reply dropped");
            }
        } else {
            self.inner.notify(delivery.from, message);
        }
    }

    /// Serve the orchestrator mailbox until every sender is gone
    pub async fn run(self, mut mailbox: Mailbox) {
        info!("Orchestrator listening");
        while let Some(delivery) = mailbox.recv().await {
            self.handle(delivery).await;
        }
        info!("Orchestrator mailbox closed");
    }
}

impl Inner {
    fn broadcast(&self, message: &Message) {
        if self.endpoint.broadcast(message) == 0 {
            debug!(kind = message.kind(), "No listeners for broadcast");
        }
    }

    fn notify(&self, to: Context, message: &Message) {
        if let Err(e) = self.endpoint.notify(to, message) {
            warn!(to = to.as_str(), kind = message.kind(), error = %e, "Notification dropped");
        }
    }

    /// Save the record, unless its thread has been deleted meanwhile. A
    /// deleted thread takes its record with it.
    fn persist_progress(&self, progress: &CheckpointProgress) -> Result<(), CheckpointError> {
        let records = self.lifecycle.records();
        if records.thread(&progress.thread_id)?.is_none() {
            records.clear_progress(&progress.thread_id)?;
            warn!(
                thread_id = %progress.thread_id,
                stage = %progress.stage,
                "Thread deleted during checkpoint, record dropped"
            );
            return Err(CheckpointError::ThreadDeleted(progress.thread_id.clone()));
        }
        records.save_progress(progress)?;
        Ok(())
    }

    async fn run_pipeline(&self, mut progress: CheckpointProgress) -> Result<Segment, CheckpointError> {
        let records = self.lifecycle.records();
        loop {
            let stage = progress.stage;
            progress.touch();
            self.persist_progress(&progress)?;
            self.broadcast(&Message::CheckpointProgress {
                stage,
                detail: Some(stage.label().to_string()),
            });

            if let Err(source) = self.run_stage(stage, &mut progress).await {
                error!(
                    thread_id = %progress.thread_id,
                    stage = %stage,
                    attempts = progress.attempts + 1,
                    error = %source,
                    "Checkpoint stage failed"
                );
                progress.record_failure(stage, source.to_string());
                match self.persist_progress(&progress) {
                    Ok(()) => {}
                    Err(deleted @ CheckpointError::ThreadDeleted(_)) => return Err(deleted),
                    Err(e) => error!(thread_id = %progress.thread_id, error = %e, "Failed to record stage failure"),
                }
                self.broadcast(&Message::CheckpointError {
                    stage,
                    error: source.to_string(),
                });
                return Err(CheckpointError::Stage { stage, source });
            }

            match stage.next() {
                Some(next) => progress.stage = next,
                None => break,
            }
        }

        let new_segment_id = progress
            .new_segment_id
            .clone()
            .ok_or(CheckpointError::Stage {
                stage: CheckpointStage::Finalize,
                source: StageError::MissingData("new_segment_id"),
            })?;
        let successor = self.lifecycle.get_segment(&new_segment_id)?;
        records.clear_progress(&progress.thread_id)?;

        info!(
            thread_id = %progress.thread_id,
            segment_id = %progress.segment_id,
            new_segment_id = %new_segment_id,
            "Checkpoint complete"
        );
        self.broadcast(&Message::CheckpointComplete {
            segment_id: progress.segment_id.clone(),
            new_segment_id: new_segment_id.clone(),
        });
        self.notify(
            Context::Page,
            &Message::NavigateSegment {
                segment_id: new_segment_id,
            },
        );
        Ok(successor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MessageBus;
    use crate::store::Records;
    use tempfile::TempDir;

    struct Harness {
        orchestrator: Orchestrator,
        bus: MessageBus,
        _dir: TempDir,
    }

    fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let bus = MessageBus::new();
        let orchestrator = Orchestrator::new(
            LifecycleManager::new(Records::in_memory()),
            LocalArchive::new(dir.path()),
            Collaborators::unavailable(),
            bus.endpoint(Context::Orchestrator),
            OrchestratorConfig::default(),
        );
        Harness {
            orchestrator,
            bus,
            _dir: dir,
        }
    }

    fn start_thread(orchestrator: &Orchestrator) -> (Thread, Segment) {
        orchestrator
            .ensure_thread_for_conversation("https://chat.example/chat/c1", Some("Parser"))
            .unwrap()
    }

    #[tokio::test]
    async fn test_failed_stage_keeps_record() {
        let h = harness();
        let (thread, segment) = start_thread(&h.orchestrator);

        let err = h.orchestrator.trigger(&segment.id, TriggerSource::Split).await.unwrap_err();
        assert!(matches!(
            err,
            CheckpointError::Stage {
                stage: CheckpointStage::EnsureProject,
                ..
            }
        ));

        let record = h.orchestrator.lifecycle().records().progress(&thread.id).unwrap().unwrap();
        assert_eq!(record.stage, CheckpointStage::EnsureProject);
        assert_eq!(record.attempts, 1);
        assert!(record.last_error.unwrap().message.contains("create_project"));
        assert!(!h.orchestrator.is_running(&thread.id));
    }

    #[tokio::test]
    async fn test_split_rejected_manual_resumes() {
        let h = harness();
        let (thread, segment) = start_thread(&h.orchestrator);
        let _ = h.orchestrator.trigger(&segment.id, TriggerSource::Split).await;

        let err = h.orchestrator.trigger(&segment.id, TriggerSource::Split).await.unwrap_err();
        assert!(matches!(err, CheckpointError::AlreadyInFlight(_)));
        let record = h.orchestrator.lifecycle().records().progress(&thread.id).unwrap().unwrap();
        assert_eq!(record.attempts, 1);

        let _ = h.orchestrator.trigger(&segment.id, TriggerSource::Manual).await;
        let record = h.orchestrator.lifecycle().records().progress(&thread.id).unwrap().unwrap();
        assert_eq!(record.attempts, 2);
        assert_eq!(record.trigger, TriggerSource::Split);
    }

    #[tokio::test]
    async fn test_running_thread_rejects_trigger() {
        let h = harness();
        let (thread, segment) = start_thread(&h.orchestrator);
        let _guard = h.orchestrator.claim(&thread.id).unwrap();

        let err = h.orchestrator.trigger(&segment.id, TriggerSource::Manual).await.unwrap_err();
        assert!(matches!(err, CheckpointError::AlreadyInFlight(_)));
        assert!(h.orchestrator.lifecycle().records().progress(&thread.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_checkpointed_segment_not_triggered() {
        let h = harness();
        let (_, segment) = start_thread(&h.orchestrator);
        h.orchestrator.lifecycle().finalize_segment(&segment.id).unwrap();

        let err = h.orchestrator.trigger(&segment.id, TriggerSource::Manual).await.unwrap_err();
        assert!(matches!(err, CheckpointError::SegmentNotActive(_)));
    }

    #[tokio::test]
    async fn test_failure_broadcasts_start_progress_and_error() {
        let h = harness();
        let mut panel = h.bus.register(Context::Panel);
        let (_, segment) = start_thread(&h.orchestrator);
        let _ = h.orchestrator.trigger(&segment.id, TriggerSource::Manual).await;

        let mut kinds = Vec::new();
        while let Some(delivery) = panel.try_recv() {
            kinds.push(delivery.message.kind());
        }
        assert_eq!(kinds, vec!["CHECKPOINT_START", "CHECKPOINT_PROGRESS", "CHECKPOINT_ERROR"]);
    }

    #[tokio::test]
    async fn test_get_thread_state_request() {
        let h = harness();
        let (thread, _) = start_thread(&h.orchestrator);
        let mailbox = h.bus.register(Context::Orchestrator);
        tokio::spawn(h.orchestrator.clone().run(mailbox));

        let panel = h.bus.endpoint(Context::Panel);
        let reply = panel
            .request(Context::Orchestrator, &Message::GetThreadState, Duration::from_secs(5))
            .await
            .unwrap();
        match reply {
            Message::ThreadState { thread: Some(t), segments } => {
                assert_eq!(t.id, thread.id);
                assert_eq!(segments.len(), 1);
            }
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_interaction_and_title_routing() {
        let h = harness();
        let (_, segment) = start_thread(&h.orchestrator);
        let mut orchestrator_box = h.bus.register(Context::Orchestrator);
        let page = h.bus.endpoint(Context::Page);

        page.notify(
            Context::Orchestrator,
            &Message::InteractionDetected {
                count: 1,
                segment_id: None,
            },
        )
        .unwrap();
        page.notify(
            Context::Orchestrator,
            &Message::TitleDetected {
                title: "Lexer design".to_string(),
                segment_id: None,
                conversation_url: None,
            },
        )
        .unwrap();
        page.notify(
            Context::Orchestrator,
            &Message::CheckpointProgress {
                stage: CheckpointStage::Extract,
                detail: None,
            },
        )
        .unwrap();

        for _ in 0..3 {
            let delivery = orchestrator_box.recv().await.unwrap();
            h.orchestrator.handle(delivery).await;
        }

        let updated = h.orchestrator.lifecycle().get_segment(&segment.id).unwrap();
        assert_eq!(updated.interaction_count, 1);
        assert_eq!(updated.display_name, "CW-001-Lexer design");
    }

    #[tokio::test]
    async fn test_interaction_reaching_thread_threshold_starts_checkpoint() {
        let h = harness();
        let records = h.orchestrator.lifecycle().records().clone();
        records.update_settings(|s| s.split_threshold = 3).unwrap();
        let (thread, segment) = start_thread(&h.orchestrator);
        let mut panel = h.bus.register(Context::Panel);
        let mut orchestrator_box = h.bus.register(Context::Orchestrator);
        let page = h.bus.endpoint(Context::Page);

        for count in 1..=3 {
            page.notify(
                Context::Orchestrator,
                &Message::InteractionDetected {
                    count,
                    segment_id: Some(segment.id.clone()),
                },
            )
            .unwrap();
            let delivery = orchestrator_box.recv().await.unwrap();
            h.orchestrator.handle(delivery).await;
            if count < 3 {
                assert!(records.progress(&thread.id).unwrap().is_none());
                assert!(panel.try_recv().is_none());
            }
        }

        let started = tokio::time::timeout(Duration::from_secs(5), panel.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            started.message,
            Message::CheckpointStart {
                segment_id: segment.id.clone()
            }
        );
        let segment = h.orchestrator.lifecycle().get_segment(&segment.id).unwrap();
        assert_eq!(segment.interaction_count, 3);
    }

    async fn send_title(h: &Harness, mailbox: &mut Mailbox, title: &str, conversation_url: &str) {
        h.bus
            .endpoint(Context::Page)
            .notify(
                Context::Orchestrator,
                &Message::TitleDetected {
                    title: title.to_string(),
                    segment_id: None,
                    conversation_url: Some(conversation_url.to_string()),
                },
            )
            .unwrap();
        let delivery = mailbox.recv().await.unwrap();
        h.orchestrator.handle(delivery).await;
    }

    #[tokio::test]
    async fn test_title_renames_the_conversation_on_screen() {
        let h = harness();
        let (_, background) = start_thread(&h.orchestrator);
        let (_, active) = h
            .orchestrator
            .ensure_thread_for_conversation("https://chat.example/chat/c2", Some("Active"))
            .unwrap();

        let mut mailbox = h.bus.register(Context::Orchestrator);
        send_title(&h, &mut mailbox, "Tokenizer", "https://chat.example/chat/c1").await;
        let lifecycle = h.orchestrator.lifecycle();
        assert_eq!(lifecycle.get_segment(&background.id).unwrap().display_name, "CW-001-Tokenizer");
        assert_eq!(lifecycle.get_segment(&active.id).unwrap().display_name, "CW-001-Active");

        // A title for an untracked conversation only names that conversation
        send_title(&h, &mut mailbox, "Scratch", "https://chat.example/chat/new").await;
        assert_eq!(lifecycle.get_segment(&active.id).unwrap().display_name, "CW-001-Active");
        let (unrelated, _) = h
            .orchestrator
            .ensure_thread_for_conversation("https://chat.example/chat/other", None)
            .unwrap();
        assert_eq!(unrelated.title, "other");
        let (adopted, _) = h
            .orchestrator
            .ensure_thread_for_conversation("https://chat.example/chat/new", None)
            .unwrap();
        assert_eq!(adopted.title, "Scratch");
    }

    #[tokio::test]
    async fn test_panel_navigation_switches_thread_and_forwards() {
        let h = harness();
        let (first, segment) = start_thread(&h.orchestrator);
        h.orchestrator
            .ensure_thread_for_conversation("https://chat.example/chat/other", None)
            .unwrap();
        let mut page = h.bus.register(Context::Page);
        let mut orchestrator_box = h.bus.register(Context::Orchestrator);

        h.bus
            .endpoint(Context::Panel)
            .notify(
                Context::Orchestrator,
                &Message::NavigateSegment {
                    segment_id: segment.id.clone(),
                },
            )
            .unwrap();
        let delivery = orchestrator_box.recv().await.unwrap();
        h.orchestrator.handle(delivery).await;

        assert_eq!(
            h.orchestrator.lifecycle().records().active_thread_id().unwrap().as_deref(),
            Some(first.id.as_str())
        );
        let forwarded = page.try_recv().unwrap();
        assert_eq!(
            forwarded.message,
            Message::NavigateSegment {
                segment_id: segment.id
            }
        );
    }

    #[test]
    fn test_ensure_thread_reuses_known_conversation() {
        let h = harness();
        let (thread, segment) = start_thread(&h.orchestrator);
        let (again, same) = h
            .orchestrator
            .ensure_thread_for_conversation("https://chat.example/chat/c1", Some("Other"))
            .unwrap();
        assert_eq!(again.id, thread.id);
        assert_eq!(same.id, segment.id);
        assert_eq!(h.orchestrator.lifecycle().threads().unwrap().len(), 1);
    }
}
