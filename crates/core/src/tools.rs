//! Tutor Tool Service
//!
//! MCP tools the agent can call mid-turn. Interactive tools (exercises,
//! multiple choice, proposed note edits) register a pending call with the
//! correlation registry, forward a presentation payload to the client, and
//! suspend until the client's answer resolves the call — the agent's turn
//! blocks on a human in the loop without blocking the host process. The
//! remaining tools give the agent narrow access to the topic workspace and
//! the spaced-repetition arithmetic.

use crate::content::TopicWorkspace;
use crate::registry::ToolCallRegistry;
use crate::srs::{self, ReviewState};
use rmcp::{
    ServerHandler,
    handler::server::{router::tool::ToolRouter, tool::Parameters},
    model::{ServerCapabilities, ServerInfo},
    tool, tool_handler, tool_router,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::info;

// --- Presentation payloads ---

/// An exercise for the learner to attempt.
#[derive(Serialize, Deserialize, JsonSchema, Debug, Clone)]
pub struct ExercisePayload {
    /// Exercise form, e.g. "translate", "fill_blank", "respond".
    pub kind: String,
    /// The prompt shown to the learner, in the target or native language.
    pub prompt: String,
    /// Optional hint the client may reveal on request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

/// A multiple-choice question.
#[derive(Serialize, Deserialize, JsonSchema, Debug, Clone)]
pub struct OptionsPayload {
    pub question: String,
    /// The choices to offer (2-5 entries).
    pub options: Vec<String>,
}

/// One proposed note edit.
#[derive(Serialize, Deserialize, JsonSchema, Debug, Clone)]
pub struct FileChange {
    /// Target note: summary, learned, review, current, plan or future.
    pub note: String,
    /// Full replacement content for the note.
    pub content: String,
}

/// A batch of note edits awaiting learner approval.
#[derive(Serialize, Deserialize, JsonSchema, Debug, Clone)]
pub struct ProposeFileChangesPayload {
    /// One-line explanation of why the notes should change.
    pub description: String,
    pub changes: Vec<FileChange>,
}

/// Out-of-band notifications from tool handlers to the connected client.
#[derive(Debug, Clone)]
pub enum ToolEvent {
    Exercise {
        call_id: String,
        payload: ExercisePayload,
    },
    Options {
        call_id: String,
        payload: OptionsPayload,
    },
    ProposeFileChanges {
        call_id: String,
        payload: ProposeFileChangesPayload,
    },
}

// --- Remaining tool arguments ---

#[derive(Deserialize, JsonSchema, Debug)]
pub struct ReadNoteArgs {
    /// Note to read: summary, learned, review, current, plan or future.
    pub note: String,
}

#[derive(Deserialize, JsonSchema, Debug)]
pub struct WriteNoteArgs {
    /// Note to overwrite: summary, learned, review, current, plan or future.
    pub note: String,
    pub content: String,
}

#[derive(Deserialize, JsonSchema, Debug)]
pub struct AppendSessionLogArgs {
    /// Markdown body of the session log entry.
    pub content: String,
}

#[derive(Deserialize, JsonSchema, Debug)]
pub struct ScheduleReviewArgs {
    /// The vocabulary item or structure that was reviewed.
    pub item: String,
    #[schemars(description = "Recall quality from 0 (blackout) to 5 (perfect)")]
    pub quality: u8,
    /// Prior schedule for the item; omit for a first review.
    #[serde(default)]
    pub state: Option<ReviewState>,
}

// --- Service ---

pub struct TutorService {
    registry: Arc<ToolCallRegistry>,
    events: mpsc::UnboundedSender<ToolEvent>,
    workspace: TopicWorkspace,
    tool_router: ToolRouter<Self>,
}

#[tool_handler]
impl ServerHandler for TutorService {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

impl TutorService {
    /// Forwards a presentation to the client and suspends until the
    /// registered call resolves. The turn stays blocked here for as long
    /// as the learner takes to answer.
    async fn await_answer(
        &self,
        event: ToolEvent,
        rx: oneshot::Receiver<Value>,
    ) -> Result<Value, String> {
        self.events
            .send(event)
            .map_err(|_| "client event channel is closed".to_string())?;
        rx.await
            .map_err(|_| "tool call was abandoned before an answer arrived".to_string())
    }
}

#[tool_router]
impl TutorService {
    pub fn new(
        registry: Arc<ToolCallRegistry>,
        events: mpsc::UnboundedSender<ToolEvent>,
        workspace: TopicWorkspace,
    ) -> Self {
        Self {
            registry,
            events,
            workspace,
            tool_router: Self::tool_router(),
        }
    }

    #[tool(
        description = "Present an exercise to the learner and wait for their answer. Returns the learner's answer as JSON."
    )]
    pub async fn present_exercise(
        &self,
        args: Parameters<ExercisePayload>,
    ) -> Result<String, String> {
        let (call_id, rx) = self.registry.register();
        info!(%call_id, kind = %args.0.kind, "presenting exercise");
        let answer = self
            .await_answer(
                ToolEvent::Exercise {
                    call_id,
                    payload: args.0,
                },
                rx,
            )
            .await?;
        serde_json::to_string(&answer).map_err(|e| e.to_string())
    }

    #[tool(
        description = "Present a multiple-choice question and wait for the learner's selection. Returns the selection as JSON."
    )]
    pub async fn present_options(
        &self,
        args: Parameters<OptionsPayload>,
    ) -> Result<String, String> {
        if args.0.options.len() < 2 {
            return Err("present_options needs at least two options".to_string());
        }
        let (call_id, rx) = self.registry.register();
        info!(%call_id, "presenting options");
        let answer = self
            .await_answer(
                ToolEvent::Options {
                    call_id,
                    payload: args.0,
                },
                rx,
            )
            .await?;
        serde_json::to_string(&answer).map_err(|e| e.to_string())
    }

    #[tool(
        description = "Propose edits to the topic's notes. The learner sees a diff-style summary and must approve before anything is written."
    )]
    pub async fn propose_file_changes(
        &self,
        args: Parameters<ProposeFileChangesPayload>,
    ) -> Result<String, String> {
        let (call_id, rx) = self.registry.register();
        info!(%call_id, changes = args.0.changes.len(), "proposing note changes");
        let answer = self
            .await_answer(
                ToolEvent::ProposeFileChanges {
                    call_id,
                    payload: args.0.clone(),
                },
                rx,
            )
            .await?;

        let approved = answer
            .get("approved")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !approved {
            return Ok("The learner declined the proposed changes; nothing was written.".to_string());
        }

        for change in &args.0.changes {
            self.workspace
                .write_note(&change.note, &change.content)
                .map_err(|e| e.to_string())?;
        }
        Ok(format!("OK. Applied {} note update(s).", args.0.changes.len()))
    }

    #[tool(
        description = "Read one of the topic's notes: summary, learned, review, current, plan or future."
    )]
    pub async fn read_note(&self, args: Parameters<ReadNoteArgs>) -> Result<String, String> {
        self.workspace
            .read_note(&args.0.note)
            .map_err(|e| e.to_string())
    }

    #[tool(
        description = "Overwrite one of the topic's notes with new content. Use propose_file_changes when the learner should confirm first."
    )]
    pub async fn write_note(&self, args: Parameters<WriteNoteArgs>) -> Result<String, String> {
        self.workspace
            .write_note(&args.0.note, &args.0.content)
            .map_err(|e| e.to_string())?;
        Ok(format!("OK. Wrote {}.md.", args.0.note))
    }

    #[tool(description = "Append a dated log entry for this session under sessions/.")]
    pub async fn append_session_log(
        &self,
        args: Parameters<AppendSessionLogArgs>,
    ) -> Result<String, String> {
        let date = chrono::Utc::now().date_naive();
        let path = self
            .workspace
            .append_session_log(date, &args.0.content)
            .map_err(|e| e.to_string())?;
        Ok(format!("OK. Logged to {}.", path.display()))
    }

    #[tool(
        description = "Compute the next spaced-repetition schedule for a review item from recall quality (0-5)."
    )]
    pub async fn schedule_review(
        &self,
        args: Parameters<ScheduleReviewArgs>,
    ) -> Result<String, String> {
        let prior = args.0.state.unwrap_or_default();
        let next = srs::next_review(prior, args.0.quality);
        serde_json::to_string(&serde_json::json!({
            "item": args.0.item,
            "next": next,
        }))
        .map_err(|e| e.to_string())
    }
}
