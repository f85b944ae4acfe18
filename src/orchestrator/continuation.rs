//! Prompt composition
//!
//! Pure text builders: the brief-generation prompt and the continuation
//! prompt injected into the successor segment.

use crate::model::{ArtifactManifest, ConversationTurn, TurnRole};

pub const BRIEF_GENERATION_PROMPT: &str = "You are generating an intelligence brief for a conversation thread management system. Your job is to produce a structured summary that allows a future Claude instance to continue this work with full context.

Read the conversation below and produce a brief with these sections:

1. IDENTITY & CORRECTIONS
- What this project IS (one sentence)
- What it is NOT (common misconceptions or things discussed and rejected)
- Any corrections to earlier assumptions

2. KEY DECISIONS (with WHY)
- Each major decision made, with the rationale behind it
- Format: \"Decision: [what]. Why: [reasoning]\"

3. CURRENT STATE
- What has been completed
- What is in progress
- What the immediate next step is

4. ANTI-DRIFT WARNINGS
- Decisions most likely to be forgotten or contradicted
- Tag each as [observed] (actually happened in conversation) or [predicted] (likely to recur)
- Format: \"Do not [wrong thing]. Instead: [correct thing]. (Reference: [decision])\"

5. ARTIFACT MANIFEST
- List any code, documents, or other artifacts produced
- For each: title, type, brief description

Keep the brief concise but complete. Prioritize information that would be lost if someone started fresh without this context. Write in direct, declarative sentences. No filler.

--- CONVERSATION TO SUMMARIZE ---
";

/// Brief template followed by the transcript
pub fn brief_prompt(turns: &[ConversationTurn]) -> String {
    let mut prompt = String::from(BRIEF_GENERATION_PROMPT);
    let transcript: Vec<String> = turns
        .iter()
        .map(|turn| {
            let speaker = match turn.role {
                TurnRole::User => "User",
                TurnRole::Assistant => "Assistant",
            };
            format!("{}: {}", speaker, turn.content.trim())
        })
        .collect();
    prompt.push_str(&transcript.join("\n\n"));
    prompt
}

/// Continuation prompt for the segment after `segment_sequence`
pub fn build_continuation_prompt(
    brief_text: &str,
    manifests: &[ArtifactManifest],
    thread_id: &str,
    segment_sequence: u32,
    prefix: &str,
) -> String {
    let manifest_section = if manifests.is_empty() {
        "  (none)".to_string()
    } else {
        manifests
            .iter()
            .map(|a| {
                format!(
                    "  - \"{}\" ({}, ~{} tokens) — available in Project Knowledge",
                    a.title,
                    a.artifact_type.as_str(),
                    a.estimated_tokens
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        "[ClaudeWeaver Thread Continuation — Segment {next:03}]
Thread: {thread_id} | Previous segment: {prefix}-{current:03}

--- INTELLIGENCE BRIEF FROM PREVIOUS SEGMENT ---
{brief_text}
--- END BRIEF ---

ARTIFACT MANIFEST (content available in Project Knowledge, not repeated here):
{manifest_section}

Please confirm you have access to the Project Knowledge files and understand the thread context. Then continue from where we left off.",
        next = segment_sequence + 1,
        current = segment_sequence,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ArtifactType;

    fn manifest(title: &str, artifact_type: ArtifactType, tokens: u32) -> ArtifactManifest {
        ArtifactManifest {
            id: title.to_lowercase(),
            title: title.to_string(),
            artifact_type,
            language: None,
            estimated_tokens: tokens,
            local_path: format!("/tmp/{}", title),
            knowledge_uploaded: true,
        }
    }

    #[test]
    fn test_continuation_header_and_manifest() {
        let prompt = build_continuation_prompt(
            "We chose a Pratt parser.",
            &[
                manifest("Lexer", ArtifactType::Code, 420),
                manifest("Flow", ArtifactType::Mermaid, 35),
            ],
            "01THREAD",
            1,
            "CW",
        );
        assert!(prompt.starts_with("[ClaudeWeaver Thread Continuation — Segment 002]\n"));
        assert!(prompt.contains("Thread: 01THREAD | Previous segment: CW-001\n"));
        assert!(prompt.contains("--- INTELLIGENCE BRIEF FROM PREVIOUS SEGMENT ---\nWe chose a Pratt parser.\n--- END BRIEF ---"));
        assert!(prompt.contains("  - \"Lexer\" (code, ~420 tokens) — available in Project Knowledge\n  - \"Flow\" (mermaid, ~35 tokens)"));
        assert!(prompt.ends_with("Then continue from where we left off."));
    }

    #[test]
    fn test_continuation_without_artifacts() {
        let prompt = build_continuation_prompt("b", &[], "t", 12, "X");
        assert!(prompt.contains("Segment 013]"));
        assert!(prompt.contains("Previous segment: X-012"));
        assert!(prompt.contains("not repeated here):\n  (none)\n"));
    }

    #[test]
    fn test_brief_prompt_appends_transcript() {
        let turns = vec![
            ConversationTurn {
                role: TurnRole::User,
                content: "Build a lexer ".to_string(),
                timestamp: None,
            },
            ConversationTurn {
                role: TurnRole::Assistant,
                content: "Here it is".to_string(),
                timestamp: None,
            },
        ];
        let prompt = brief_prompt(&turns);
        assert!(prompt.starts_with(BRIEF_GENERATION_PROMPT));
        assert!(prompt.ends_with("User: Build a lexer\n\nAssistant: Here it is"));
    }
}
