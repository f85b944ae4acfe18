//! Thread, Segment and artifact records
//!
//! These are the shapes persisted in the durable store and carried on the bus.
//! Mutation rules live in `lifecycle`; this module only defines the data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default number of user turns before a segment is checkpointed
pub const DEFAULT_SPLIT_THRESHOLD: u32 = 2;
/// Default display-name prefix for new threads
pub const DEFAULT_PREFIX: &str = "CW";
/// Default directory (under the data dir) where briefs and artifacts are written
pub const DEFAULT_LOCAL_ROOT: &str = "Claude-Threads";
/// Assistant responses longer than this (in chars) trigger an early split
pub const ADAPTIVE_CHAR_THRESHOLD: usize = 2000;

/// Format a segment display name. Sequence is zero-padded to 3 digits.
pub fn format_segment_name(prefix: &str, sequence: u32, auto_title: &str) -> String {
    format!("{}-{:03}-{}", prefix, sequence, auto_title)
}

/// A single logical conversation spanning multiple segments.
/// Maps 1:1 to a remote project.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Thread {
    pub id: String,
    pub title: String,
    pub project_name: String,
    #[serde(default)]
    pub project_url: Option<String>,
    pub prefix: String,
    pub segment_count: u32,
    /// `None` only while the first segment is being created
    #[serde(default)]
    pub active_segment_id: Option<String>,
    pub split_threshold: u32,
    pub local_root: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Segment status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SegmentStatus {
    /// Receiving turns; can trigger a checkpoint
    #[default]
    Active,
    /// Checkpoint completed and a successor exists
    Checkpointed,
    /// Reserved for pruning; nothing transitions here yet
    Archived,
}

impl SegmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SegmentStatus::Active => "active",
            SegmentStatus::Checkpointed => "checkpointed",
            SegmentStatus::Archived => "archived",
        }
    }
}

/// One physical conversation within a thread
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub id: String,
    pub thread_id: String,
    /// 1-indexed
    pub sequence: u32,
    pub conversation_url: String,
    pub conversation_id: String,
    pub display_name: String,
    pub status: SegmentStatus,
    pub interaction_count: u32,
    #[serde(default)]
    pub brief: Option<BriefMetadata>,
    #[serde(default)]
    pub continuation_prompt: Option<String>,
    #[serde(default)]
    pub artifacts: Vec<ArtifactManifest>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub checkpointed_at: Option<DateTime<Utc>>,
}

impl Segment {
    pub fn is_active(&self) -> bool {
        self.status == SegmentStatus::Active
    }

    /// Artifacts still waiting for a confirmed knowledge upload
    pub fn pending_uploads(&self) -> impl Iterator<Item = &ArtifactManifest> {
        self.artifacts.iter().filter(|a| !a.knowledge_uploaded)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactType {
    Code,
    Document,
    Html,
    Svg,
    /// Interactive component
    React,
    /// Diagram
    Mermaid,
}

impl ArtifactType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactType::Code => "code",
            ArtifactType::Document => "document",
            ArtifactType::Html => "html",
            ArtifactType::Svg => "svg",
            ArtifactType::React => "react",
            ArtifactType::Mermaid => "mermaid",
        }
    }

    /// File extension used when the artifact is written to the local archive
    pub fn extension(&self, language: Option<&str>) -> &'static str {
        match self {
            ArtifactType::Code => match language.map(|l| l.to_ascii_lowercase()).as_deref() {
                Some("rust") => "rs",
                Some("python") => "py",
                Some("typescript") => "ts",
                Some("javascript") => "js",
                Some("json") => "json",
                Some("bash") | Some("shell") | Some("sh") => "sh",
                Some("go") => "go",
                Some("sql") => "sql",
                _ => "txt",
            },
            ArtifactType::Document => "md",
            ArtifactType::Html => "html",
            ArtifactType::Svg => "svg",
            ArtifactType::React => "jsx",
            ArtifactType::Mermaid => "mmd",
        }
    }
}

/// Manifest entry for one extracted artifact
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactManifest {
    pub id: String,
    pub title: String,
    #[serde(rename = "type")]
    pub artifact_type: ArtifactType,
    #[serde(default)]
    pub language: Option<String>,
    pub estimated_tokens: u32,
    pub local_path: String,
    #[serde(default)]
    pub knowledge_uploaded: bool,
}

/// Which strategy produced a brief
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BriefGeneratorKind {
    /// Brief produced inside the product by a second conversation
    #[serde(rename = "option-c")]
    InProduct,
    /// Brief produced by calling the API directly with the user's key
    #[serde(rename = "option-b-api")]
    Api,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BriefMetadata {
    pub generated_at: DateTime<Utc>,
    pub generator: BriefGeneratorKind,
    pub model: String,
    pub local_path: String,
    #[serde(default)]
    pub knowledge_uploaded: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

/// One extracted conversation turn
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationTurn {
    pub role: TurnRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Artifact as handed over by the extractor, content attached.
/// Not stored on segments; only in checkpoint progress until persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedArtifact {
    pub id: String,
    pub title: String,
    #[serde(rename = "type")]
    pub artifact_type: ArtifactType,
    #[serde(default)]
    pub language: Option<String>,
    pub content: String,
}

/// User-configurable settings, stored as a single value
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct UserSettings {
    pub split_threshold: u32,
    pub default_prefix: String,
    pub local_root: String,
    /// `None` means briefs are generated in-product
    pub api_key: Option<String>,
    pub first_run_complete: bool,
    /// `None` disables the long-response heuristic
    pub adaptive_char_threshold: Option<usize>,
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            split_threshold: DEFAULT_SPLIT_THRESHOLD,
            default_prefix: DEFAULT_PREFIX.to_string(),
            local_root: DEFAULT_LOCAL_ROOT.to_string(),
            api_key: None,
            first_run_complete: false,
            adaptive_char_threshold: Some(ADAPTIVE_CHAR_THRESHOLD),
        }
    }
}

/// Snapshot returned to the panel for `GET_THREAD_STATE`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ThreadState {
    pub thread: Option<Thread>,
    pub segments: Vec<Segment>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_segment_name() {
        assert_eq!(format_segment_name("CW", 1, "Parser"), "CW-001-Parser");
        assert_eq!(format_segment_name("X", 42, "t"), "X-042-t");
        assert_eq!(format_segment_name("X", 1234, "t"), "X-1234-t");
    }

    #[test]
    fn test_settings_fill_missing_fields() {
        let settings: UserSettings = serde_json::from_str(r#"{"splitThreshold": 5}"#).unwrap();
        assert_eq!(settings.split_threshold, 5);
        assert_eq!(settings.default_prefix, DEFAULT_PREFIX);
        assert_eq!(settings.adaptive_char_threshold, Some(ADAPTIVE_CHAR_THRESHOLD));
    }

    #[test]
    fn test_artifact_wire_names() {
        let manifest = ArtifactManifest {
            id: "a1".to_string(),
            title: "Diagram".to_string(),
            artifact_type: ArtifactType::Mermaid,
            language: None,
            estimated_tokens: 10,
            local_path: "/tmp/a1.mmd".to_string(),
            knowledge_uploaded: false,
        };
        let value = serde_json::to_value(&manifest).unwrap();
        assert_eq!(value["type"], "mermaid");
        assert_eq!(value["knowledgeUploaded"], false);

        let kind = serde_json::to_value(BriefGeneratorKind::Api).unwrap();
        assert_eq!(kind, "option-b-api");
    }

    #[test]
    fn test_code_extension_by_language() {
        assert_eq!(ArtifactType::Code.extension(Some("Rust")), "rs");
        assert_eq!(ArtifactType::Code.extension(None), "txt");
        assert_eq!(ArtifactType::Document.extension(Some("rust")), "md");
    }
}
