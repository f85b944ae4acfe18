//! Pipeline stages
//!
//! Each stage reads what it needs from the progress record and the store,
//! and is safe to re-run after a crash at any point inside it.

use std::future::Future;
use std::path::Path;
use tracing::{debug, info, warn};

use super::collaborators::CollaboratorError;
use super::continuation::build_continuation_prompt;
use super::progress::{CheckpointProgress, CheckpointStage};
use super::{Inner, StageError};
use crate::bus::Message;
use crate::model::{ArtifactManifest, BriefMetadata, Segment, Thread};
use crate::tokens::count_tokens;

impl Inner {
    pub(super) async fn run_stage(
        &self,
        stage: CheckpointStage,
        progress: &mut CheckpointProgress,
    ) -> Result<(), StageError> {
        debug!(thread_id = %progress.thread_id, stage = %stage, "Running stage");
        match stage {
            CheckpointStage::EnsureProject => self.ensure_project(progress).await,
            CheckpointStage::Extract => self.extract(progress).await,
            CheckpointStage::PersistArtifacts => self.persist_artifacts(progress),
            CheckpointStage::GenerateBrief => self.generate_brief(progress).await,
            CheckpointStage::UploadKnowledge => self.upload_knowledge(progress).await,
            CheckpointStage::BuildContinuation => self.build_continuation(progress),
            CheckpointStage::OpenSegment => self.open_segment(progress).await,
            CheckpointStage::InjectContinuation => self.inject_continuation(progress).await,
            CheckpointStage::Rename => self.rename(progress).await,
            CheckpointStage::Finalize => {
                self.lifecycle.finalize_segment(&progress.segment_id)?;
                Ok(())
            }
        }
    }

    /// Bound a collaborator call by the stage timeout
    async fn call<T, F>(&self, call: &'static str, fut: F) -> Result<T, StageError>
    where
        F: Future<Output = Result<T, CollaboratorError>>,
    {
        match tokio::time::timeout(self.config.stage_timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(StageError::Timeout {
                call,
                secs: self.config.stage_timeout.as_secs(),
            }),
        }
    }

    fn context(&self, progress: &CheckpointProgress) -> Result<(Thread, Segment), StageError> {
        let segment = self.lifecycle.get_segment(&progress.segment_id)?;
        let thread = self.lifecycle.load_thread(&segment.thread_id)?;
        Ok((thread, segment))
    }

    fn project_url(&self, progress: &CheckpointProgress) -> Result<String, StageError> {
        if let Some(url) = &progress.project_url {
            return Ok(url.clone());
        }
        self.lifecycle
            .load_thread(&progress.thread_id)?
            .project_url
            .ok_or(StageError::MissingData("project_url"))
    }

    async fn ensure_project(&self, progress: &mut CheckpointProgress) -> Result<(), StageError> {
        if progress.project_url.is_some() {
            return Ok(());
        }
        let (thread, segment) = self.context(progress)?;

        let url = match thread.project_url {
            Some(url) => url,
            None => {
                let url = self
                    .call("create_project", self.collaborators.page.create_project(&thread.project_name))
                    .await?;
                self.lifecycle.attach_project(&thread.id, &url)?;
                self.broadcast(&Message::ProjectCreated {
                    thread_id: thread.id.clone(),
                    project_url: url.clone(),
                });
                url
            }
        };

        // Segment 1 started outside any project
        if segment.sequence == 1 {
            self.call("move_conversation", self.collaborators.page.move_conversation(&url))
                .await?;
        }
        progress.project_url = Some(url);
        Ok(())
    }

    async fn extract(&self, progress: &mut CheckpointProgress) -> Result<(), StageError> {
        let turns = self.call("extract", self.collaborators.extractor.extract()).await?;
        let artifacts = self
            .call("extract_artifacts", self.collaborators.extractor.extract_artifacts())
            .await?;
        info!(
            segment_id = %progress.segment_id,
            turns = turns.len(),
            artifacts = artifacts.len(),
            "Conversation extracted"
        );
        progress.transcript = turns;
        progress.extracted = artifacts;
        Ok(())
    }

    fn persist_artifacts(&self, progress: &mut CheckpointProgress) -> Result<(), StageError> {
        let (thread, segment) = self.context(progress)?;

        for artifact in &progress.extracted {
            let path = self.archive.write_artifact(&thread, segment.sequence, artifact)?;
            let manifest = ArtifactManifest {
                id: artifact.id.clone(),
                title: artifact.title.clone(),
                artifact_type: artifact.artifact_type,
                language: artifact.language.clone(),
                estimated_tokens: count_tokens(&artifact.content),
                local_path: path.display().to_string(),
                knowledge_uploaded: false,
            };

            let mut added = false;
            let entry = manifest.clone();
            self.lifecycle.update_segment(&segment.id, |s| {
                if !s.artifacts.iter().any(|a| a.id == entry.id) {
                    s.artifacts.push(entry);
                    added = true;
                }
            })?;
            if added {
                self.broadcast(&Message::ArtifactExtracted {
                    segment_id: segment.id.clone(),
                    manifest,
                });
            }
        }

        progress.extracted.clear();
        Ok(())
    }

    async fn generate_brief(&self, progress: &mut CheckpointProgress) -> Result<(), StageError> {
        let (thread, segment) = self.context(progress)?;
        if segment.brief.is_some() && progress.brief_text.is_some() {
            return Ok(());
        }

        let result = self
            .call("generate_brief", self.collaborators.briefs.generate(&progress.transcript))
            .await?;
        let path = self.archive.write_brief(&thread, segment.sequence, &result.text)?;
        let brief = BriefMetadata {
            generated_at: result.generated_at,
            generator: result.generator,
            model: result.model,
            local_path: path.display().to_string(),
            knowledge_uploaded: false,
        };
        let stored = brief.clone();
        self.lifecycle.update_segment(&segment.id, |s| s.brief = Some(stored))?;
        progress.brief_text = Some(result.text);

        info!(segment_id = %segment.id, model = %brief.model, "Brief generated");
        self.broadcast(&Message::BriefReady {
            segment_id: segment.id,
            brief,
        });
        Ok(())
    }

    /// Upload the brief and every artifact not yet confirmed. Each success is
    /// persisted on its own, so a retry only uploads what is still missing.
    async fn upload_knowledge(&self, progress: &mut CheckpointProgress) -> Result<(), StageError> {
        let project_url = self.project_url(progress)?;
        let segment = self.lifecycle.get_segment(&progress.segment_id)?;
        let mut total = 0;
        let mut failed = 0;

        if let Some(brief) = segment.brief.as_ref().filter(|b| !b.knowledge_uploaded) {
            total += 1;
            let content = match &progress.brief_text {
                Some(text) => Ok(text.clone()),
                None => self.archive.read(Path::new(&brief.local_path)).map_err(StageError::from),
            };
            let file_name = format!("{}-brief.md", segment.display_name);
            match self.upload_one(&project_url, content, &file_name).await {
                Ok(()) => {
                    self.lifecycle.update_segment(&segment.id, |s| {
                        if let Some(b) = s.brief.as_mut() {
                            b.knowledge_uploaded = true;
                        }
                    })?;
                }
                Err(e) => {
                    warn!(segment_id = %segment.id, error = %e, "Brief upload failed");
                    failed += 1;
                }
            }
        }

        for manifest in segment.pending_uploads() {
            total += 1;
            let path = Path::new(&manifest.local_path);
            let content = self.archive.read(path).map_err(StageError::from);
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| manifest.id.clone());
            match self.upload_one(&project_url, content, &file_name).await {
                Ok(()) => {
                    let id = manifest.id.clone();
                    self.lifecycle.update_segment(&segment.id, |s| {
                        if let Some(a) = s.artifacts.iter_mut().find(|a| a.id == id) {
                            a.knowledge_uploaded = true;
                        }
                    })?;
                }
                Err(e) => {
                    warn!(segment_id = %segment.id, artifact_id = %manifest.id, error = %e, "Artifact upload failed");
                    failed += 1;
                }
            }
        }

        if failed > 0 {
            return Err(StageError::UploadIncomplete { failed, total });
        }
        debug!(segment_id = %segment.id, uploaded = total, "Knowledge upload complete");
        Ok(())
    }

    async fn upload_one(
        &self,
        project_url: &str,
        content: Result<String, StageError>,
        file_name: &str,
    ) -> Result<(), StageError> {
        let content = content?;
        let confirmed = self
            .call("upload", self.collaborators.uploader.upload(project_url, &content, file_name))
            .await?;
        if confirmed {
            Ok(())
        } else {
            Err(StageError::Collaborator(CollaboratorError::Other(format!(
                "Upload of {} not confirmed",
                file_name
            ))))
        }
    }

    fn build_continuation(&self, progress: &mut CheckpointProgress) -> Result<(), StageError> {
        let (thread, segment) = self.context(progress)?;
        let brief_text = match (&progress.brief_text, &segment.brief) {
            (Some(text), _) => text.clone(),
            (None, Some(brief)) => self.archive.read(Path::new(&brief.local_path))?,
            (None, None) => return Err(StageError::MissingData("brief_text")),
        };

        let prompt = build_continuation_prompt(
            &brief_text,
            &segment.artifacts,
            &thread.id,
            segment.sequence,
            &thread.prefix,
        );
        let stored = prompt.clone();
        self.lifecycle
            .update_segment(&segment.id, |s| s.continuation_prompt = Some(stored))?;
        progress.continuation_prompt = Some(prompt);
        Ok(())
    }

    async fn open_segment(&self, progress: &mut CheckpointProgress) -> Result<(), StageError> {
        if progress.new_segment_id.is_some() {
            return Ok(());
        }
        let project_url = self.project_url(progress)?;
        let conversation = self
            .call("open_conversation", self.collaborators.page.open_conversation(&project_url))
            .await?;

        let mut successor = self
            .lifecycle
            .open_successor(&progress.segment_id, &conversation.url)?;
        // A successor left by an interrupted run follows the conversation
        // actually opened now
        if successor.conversation_url != conversation.url {
            let (url, id) = (conversation.url.clone(), conversation.id.clone());
            successor = self.lifecycle.update_segment(&successor.id, |s| {
                s.conversation_url = url;
                s.conversation_id = id;
            })?;
        }

        info!(
            thread_id = %progress.thread_id,
            segment_id = %successor.id,
            sequence = successor.sequence,
            "Successor conversation opened"
        );
        progress.new_segment_id = Some(successor.id);
        progress.new_conversation_url = Some(conversation.url);
        Ok(())
    }

    async fn inject_continuation(&self, progress: &mut CheckpointProgress) -> Result<(), StageError> {
        let prompt = match &progress.continuation_prompt {
            Some(prompt) => prompt.clone(),
            None => self
                .lifecycle
                .get_segment(&progress.segment_id)?
                .continuation_prompt
                .ok_or(StageError::MissingData("continuation_prompt"))?,
        };
        self.call("inject_text", self.collaborators.page.inject_text(&prompt))
            .await
    }

    async fn rename(&self, progress: &mut CheckpointProgress) -> Result<(), StageError> {
        let successor_id = progress
            .new_segment_id
            .as_deref()
            .ok_or(StageError::MissingData("new_segment_id"))?;
        let successor = self.lifecycle.get_segment(successor_id)?;
        self.call("rename", self.collaborators.page.rename(&successor.display_name))
            .await
    }
}
