//! Defines the WebSocket message protocol between the client and the server.

use crate::models;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tandem_core::tools::{ExercisePayload, OptionsPayload, ProposeFileChangesPayload};
use uuid::Uuid;

/// Messages sent from the client to the server.
#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Requests a full state snapshot (used after connecting).
    GetState,
    /// Starts a new session for a topic, superseding any active one.
    NewSession {
        /// Language tag, e.g. "es".
        topic: String,
        /// Target-language immersion; omitted means "leave as is".
        immersion: Option<bool>,
    },
    /// A chat message from the learner to the tutor.
    Chat {
        text: String,
        immersion: Option<bool>,
    },
    /// Ends the active session; `discard` skips the wrap-up and commit.
    EndSession {
        #[serde(default)]
        discard: bool,
    },
    /// Resumes a specific prior session by id.
    ResumeSession { session_id: Uuid },
    /// Re-attaches to the in-memory session, or revives the most recent
    /// active record if the process restarted.
    Reconnect { immersion: Option<bool> },
    /// The learner's answer to a pending tool call.
    ToolAnswer {
        tool_call_id: String,
        answer: Value,
    },
}

/// Messages sent from the server to the client.
#[derive(Serialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Full state snapshot: transcript plus session flags.
    State {
        messages: Vec<models::Message>,
        session_active: bool,
        session_id: Option<Uuid>,
        topic: Option<String>,
        onboarded: bool,
    },
    /// One complete tutor message.
    AssistantMessage {
        text: String,
        message_id: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        onboarded: Option<bool>,
    },
    /// Whether the agent is currently working on a turn.
    AgentThinking { thinking: bool },
    SessionStarted { session_id: Uuid },
    SessionEnded { summary: String },
    /// Reports a non-fatal error to the client.
    Error { message: String },
    /// An exercise awaiting the learner's answer.
    Exercise {
        #[serde(flatten)]
        payload: ExercisePayload,
        tool_call_id: String,
    },
    /// A multiple-choice question awaiting a selection.
    Options {
        #[serde(flatten)]
        payload: OptionsPayload,
        tool_call_id: String,
    },
    /// Proposed note edits awaiting approval.
    ProposeFileChanges {
        #[serde(flatten)]
        payload: ProposeFileChangesPayload,
        tool_call_id: String,
    },
}
