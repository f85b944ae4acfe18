//! External collaborators
//!
//! The pipeline drives page automation, extraction, summarization and the
//! knowledge upload through these traits. Concrete page adapters live
//! outside this crate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

use crate::model::{BriefGeneratorKind, ConversationTurn, ExtractedArtifact};
use crate::selectors::SelectorError;

#[derive(Error, Debug)]
pub enum CollaboratorError {
    #[error("Not implemented: {0}")]
    NotImplemented(&'static str),
    #[error("Selector not found for action: {0}")]
    SelectorNotFound(String),
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("Collaborator unavailable: {0}")]
    Unavailable(String),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("{0}")]
    Other(String),
}

impl Serialize for CollaboratorError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl From<reqwest::Error> for CollaboratorError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            CollaboratorError::Timeout(e.to_string())
        } else {
            CollaboratorError::Http(e.to_string())
        }
    }
}

impl From<SelectorError> for CollaboratorError {
    fn from(e: SelectorError) -> Self {
        match e {
            SelectorError::Unmapped(action) => CollaboratorError::SelectorNotFound(action),
            other => CollaboratorError::Other(other.to_string()),
        }
    }
}

/// A freshly opened conversation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationRef {
    pub url: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BriefResult {
    pub text: String,
    pub model: String,
    pub generated_at: DateTime<Utc>,
    pub generator: BriefGeneratorKind,
}

#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self) -> Result<Vec<ConversationTurn>, CollaboratorError>;
    async fn extract_artifacts(&self) -> Result<Vec<ExtractedArtifact>, CollaboratorError>;
}

#[async_trait]
pub trait BriefGenerator: Send + Sync {
    async fn generate(&self, turns: &[ConversationTurn]) -> Result<BriefResult, CollaboratorError>;
}

#[async_trait]
pub trait KnowledgeUploader: Send + Sync {
    /// `Ok(false)` means the upload was attempted and not confirmed
    async fn upload(&self, project_url: &str, content: &str, file_name: &str) -> Result<bool, CollaboratorError>;
}

#[async_trait]
pub trait PageAutomation: Send + Sync {
    /// Returns the new project's URL
    async fn create_project(&self, name: &str) -> Result<String, CollaboratorError>;
    /// Move the current conversation into a project
    async fn move_conversation(&self, project_url: &str) -> Result<(), CollaboratorError>;
    async fn open_conversation(&self, project_url: &str) -> Result<ConversationRef, CollaboratorError>;
    async fn inject_text(&self, text: &str) -> Result<(), CollaboratorError>;
    async fn rename(&self, name: &str) -> Result<(), CollaboratorError>;
}

/// Everything the pipeline talks to
#[derive(Clone)]
pub struct Collaborators {
    pub page: Arc<dyn PageAutomation>,
    pub extractor: Arc<dyn Extractor>,
    pub briefs: Arc<dyn BriefGenerator>,
    pub uploader: Arc<dyn KnowledgeUploader>,
}

/// Stand-in used until a page adapter connects. Every call fails, so a
/// pipeline started against it stops at its first stage with the record
/// kept for a later retry.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailablePage;

#[async_trait]
impl PageAutomation for UnavailablePage {
    async fn create_project(&self, _name: &str) -> Result<String, CollaboratorError> {
        Err(CollaboratorError::NotImplemented("create_project"))
    }

    async fn move_conversation(&self, _project_url: &str) -> Result<(), CollaboratorError> {
        Err(CollaboratorError::NotImplemented("move_conversation"))
    }

    async fn open_conversation(&self, _project_url: &str) -> Result<ConversationRef, CollaboratorError> {
        Err(CollaboratorError::NotImplemented("open_conversation"))
    }

    async fn inject_text(&self, _text: &str) -> Result<(), CollaboratorError> {
        Err(CollaboratorError::NotImplemented("inject_text"))
    }

    async fn rename(&self, _name: &str) -> Result<(), CollaboratorError> {
        Err(CollaboratorError::NotImplemented("rename"))
    }
}

#[async_trait]
impl Extractor for UnavailablePage {
    async fn extract(&self) -> Result<Vec<ConversationTurn>, CollaboratorError> {
        Err(CollaboratorError::NotImplemented("extract"))
    }

    async fn extract_artifacts(&self) -> Result<Vec<ExtractedArtifact>, CollaboratorError> {
        Err(CollaboratorError::NotImplemented("extract_artifacts"))
    }
}

#[async_trait]
impl KnowledgeUploader for UnavailablePage {
    async fn upload(&self, _project_url: &str, _content: &str, _file_name: &str) -> Result<bool, CollaboratorError> {
        Err(CollaboratorError::NotImplemented("upload"))
    }
}

/// In-product brief generation needs a second conversation driven by the
/// page adapter; without one it is unavailable.
#[async_trait]
impl BriefGenerator for UnavailablePage {
    async fn generate(&self, _turns: &[ConversationTurn]) -> Result<BriefResult, CollaboratorError> {
        Err(CollaboratorError::NotImplemented("generate_brief"))
    }
}

impl Collaborators {
    /// All collaborators unavailable
    pub fn unavailable() -> Self {
        let stub = Arc::new(UnavailablePage);
        Self {
            page: stub.clone(),
            extractor: stub.clone(),
            briefs: stub.clone(),
            uploader: stub,
        }
    }
}
