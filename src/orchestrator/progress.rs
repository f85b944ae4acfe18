//! Checkpoint progress record
//!
//! The persisted marker of an in-flight checkpoint. It names the next stage
//! to run and carries whatever later stages need from earlier ones, so a
//! restarted host can pick up exactly where the previous one stopped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{ConversationTurn, ExtractedArtifact};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStage {
    EnsureProject,
    Extract,
    PersistArtifacts,
    GenerateBrief,
    UploadKnowledge,
    BuildContinuation,
    OpenSegment,
    InjectContinuation,
    Rename,
    Finalize,
}

impl CheckpointStage {
    pub const ALL: [CheckpointStage; 10] = [
        CheckpointStage::EnsureProject,
        CheckpointStage::Extract,
        CheckpointStage::PersistArtifacts,
        CheckpointStage::GenerateBrief,
        CheckpointStage::UploadKnowledge,
        CheckpointStage::BuildContinuation,
        CheckpointStage::OpenSegment,
        CheckpointStage::InjectContinuation,
        CheckpointStage::Rename,
        CheckpointStage::Finalize,
    ];

    pub fn first() -> Self {
        CheckpointStage::EnsureProject
    }

    /// Stage after this one, `None` after `Finalize`
    pub fn next(&self) -> Option<Self> {
        let index = Self::ALL.iter().position(|s| s == self)?;
        Self::ALL.get(index + 1).copied()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointStage::EnsureProject => "ensure_project",
            CheckpointStage::Extract => "extract",
            CheckpointStage::PersistArtifacts => "persist_artifacts",
            CheckpointStage::GenerateBrief => "generate_brief",
            CheckpointStage::UploadKnowledge => "upload_knowledge",
            CheckpointStage::BuildContinuation => "build_continuation",
            CheckpointStage::OpenSegment => "open_segment",
            CheckpointStage::InjectContinuation => "inject_continuation",
            CheckpointStage::Rename => "rename",
            CheckpointStage::Finalize => "finalize",
        }
    }

    /// Short label shown in the panel
    pub fn label(&self) -> &'static str {
        match self {
            CheckpointStage::EnsureProject => "Creating project",
            CheckpointStage::Extract => "Extracting conversation",
            CheckpointStage::PersistArtifacts => "Saving artifacts",
            CheckpointStage::GenerateBrief => "Generating brief",
            CheckpointStage::UploadKnowledge => "Uploading to Project Knowledge",
            CheckpointStage::BuildContinuation => "Building continuation prompt",
            CheckpointStage::OpenSegment => "Opening next segment",
            CheckpointStage::InjectContinuation => "Sending continuation prompt",
            CheckpointStage::Rename => "Renaming segment",
            CheckpointStage::Finalize => "Finalizing",
        }
    }
}

impl std::fmt::Display for CheckpointStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What started the checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerSource {
    Split,
    Manual,
    /// Picked up from a stored record at startup
    Resume,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageFailure {
    pub stage: CheckpointStage,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointProgress {
    pub thread_id: String,
    pub segment_id: String,
    /// Next stage to run
    pub stage: CheckpointStage,
    pub trigger: TriggerSource,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<StageFailure>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(default)]
    pub project_url: Option<String>,
    #[serde(default)]
    pub transcript: Vec<ConversationTurn>,
    /// Artifact contents awaiting the archive; emptied once persisted
    #[serde(default)]
    pub extracted: Vec<ExtractedArtifact>,
    #[serde(default)]
    pub brief_text: Option<String>,
    #[serde(default)]
    pub continuation_prompt: Option<String>,
    #[serde(default)]
    pub new_segment_id: Option<String>,
    #[serde(default)]
    pub new_conversation_url: Option<String>,
}

impl CheckpointProgress {
    pub fn new(thread_id: &str, segment_id: &str, trigger: TriggerSource) -> Self {
        let now = Utc::now();
        Self {
            thread_id: thread_id.to_string(),
            segment_id: segment_id.to_string(),
            stage: CheckpointStage::first(),
            trigger,
            attempts: 0,
            last_error: None,
            started_at: now,
            updated_at: now,
            project_url: None,
            transcript: Vec::new(),
            extracted: Vec::new(),
            brief_text: None,
            continuation_prompt: None,
            new_segment_id: None,
            new_conversation_url: None,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn record_failure(&mut self, stage: CheckpointStage, message: String) {
        self.attempts += 1;
        self.last_error = Some(StageFailure {
            stage,
            message,
            at: Utc::now(),
        });
        self.touch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order() {
        let mut stage = CheckpointStage::first();
        let mut seen = vec![stage];
        while let Some(next) = stage.next() {
            assert!(next > stage);
            seen.push(next);
            stage = next;
        }
        assert_eq!(seen, CheckpointStage::ALL.to_vec());
        assert_eq!(CheckpointStage::Finalize.next(), None);
    }

    #[test]
    fn test_stage_wire_name_matches_as_str() {
        for stage in CheckpointStage::ALL {
            let value = serde_json::to_value(stage).unwrap();
            assert_eq!(value, stage.as_str());
        }
    }

    #[test]
    fn test_old_record_without_resume_data_loads() {
        let json = r#"{
            "threadId": "t1",
            "segmentId": "s1",
            "stage": "generate_brief",
            "trigger": "split",
            "startedAt": "2026-01-01T00:00:00Z",
            "updatedAt": "2026-01-01T00:00:00Z"
        }"#;
        let progress: CheckpointProgress = serde_json::from_str(json).unwrap();
        assert_eq!(progress.stage, CheckpointStage::GenerateBrief);
        assert_eq!(progress.attempts, 0);
        assert!(progress.transcript.is_empty());
    }

    #[test]
    fn test_record_failure() {
        let mut progress = CheckpointProgress::new("t1", "s1", TriggerSource::Manual);
        progress.record_failure(CheckpointStage::UploadKnowledge, "boom".to_string());
        progress.record_failure(CheckpointStage::UploadKnowledge, "again".to_string());
        assert_eq!(progress.attempts, 2);
        assert_eq!(progress.last_error.unwrap().message, "again");
    }
}
