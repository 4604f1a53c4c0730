//! Session Manager
//!
//! Owns the single live agent binding and implements the session lifecycle:
//! start, resume/reconnect, chat, end, discard. All process-wide session
//! state — the active handle, the session record, the immersion flag — is
//! mutated only here. Client-bound events leave through a broadcast hub so
//! a reconnecting WebSocket can re-attach without touching the agent.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use chrono::Utc;
use serde_json::Value;
use tandem_core::{
    agent::{
        AgentContext, AgentEvent, AgentHandle, HistoryEntry, HistoryRole, LlmClient, spawn_agent,
    },
    commit::{self, CommitOutcome},
    content::TopicWorkspace,
    feeder::InputFeeder,
    registry::ToolCallRegistry,
    tools::{ToolEvent, TutorService},
};
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::Db;
use crate::models::{MessageRole, Session};
use crate::ws::protocol::ServerMessage;

/// Priming instruction for a topic with no notes yet.
const PRIME_ONBOARDING: &str = "Begin onboarding for this topic: greet the learner, find out \
their level and goals, and agree on an initial plan. Save the plan to the plan note.";

/// Priming instruction for a topic that already has notes.
const PRIME_RESUME: &str = "Review the topic notes and continue from the current plan: greet \
the learner briefly and pick up where the last session left off.";

/// Wrap-up instruction sent on graceful end; the commit handshake waits for
/// the turn this produces to drain before touching git.
const WRAP_UP: &str = "The session is ending. Do not present new exercises. Update the notes \
to reflect this session, append a session log entry, then say goodbye in one short message.";

const IMMERSION_SUFFIX: &str =
    "[Reply in the target language only; use English only when the learner is stuck.]";
const NATIVE_SUFFIX: &str =
    "[Reply mostly in English, weaving in the target language gradually.]";

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no active session")]
    NoActiveSession,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// The explicit session-context object: everything bound to one live agent.
struct ActiveSession {
    session: Session,
    feeder: InputFeeder,
    registry: Arc<ToolCallRegistry>,
    agent: AgentHandle,
    consumer: JoinHandle<()>,
    forwarder: JoinHandle<()>,
}

pub struct SessionManager {
    db: Arc<Db>,
    llm: Arc<dyn LlmClient>,
    system_prompt: Arc<String>,
    content_root: PathBuf,
    push_on_commit: bool,
    events: broadcast::Sender<ServerMessage>,
    immersion: AtomicBool,
    active: Mutex<Option<ActiveSession>>,
}

impl SessionManager {
    pub fn new(
        db: Arc<Db>,
        llm: Arc<dyn LlmClient>,
        system_prompt: Arc<String>,
        content_root: PathBuf,
        push_on_commit: bool,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            db,
            llm,
            system_prompt,
            content_root,
            push_on_commit,
            events,
            immersion: AtomicBool::new(false),
            active: Mutex::new(None),
        }
    }

    /// Subscribes a client connection to the event hub.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerMessage> {
        self.events.subscribe()
    }

    /// Broadcasts to whoever is connected; a momentarily absent client is
    /// not an error (reconnect re-synchronizes from durable state).
    pub fn emit(&self, msg: ServerMessage) {
        let _ = self.events.send(msg);
    }

    pub fn notify_error(&self, message: impl Into<String>) {
        self.emit(ServerMessage::Error {
            message: message.into(),
        });
    }

    fn set_immersion(&self, flag: Option<bool>) {
        if let Some(on) = flag {
            self.immersion.store(on, Ordering::Relaxed);
        }
    }

    /// Appends the mode suffix read from the immersion flag.
    fn decorate(&self, text: &str) -> String {
        let suffix = if self.immersion.load(Ordering::Relaxed) {
            IMMERSION_SUFFIX
        } else {
            NATIVE_SUFFIX
        };
        format!("{text}\n\n{suffix}")
    }

    /// Starts a fresh session, superseding any active one. The prior handle
    /// is fully closed before the new one becomes visible.
    pub async fn start_session(
        &self,
        topic: &str,
        immersion: Option<bool>,
    ) -> Result<Uuid, SessionError> {
        self.set_immersion(immersion);
        let mut slot = self.active.lock().await;
        if let Some(prev) = slot.take() {
            info!(prev = %prev.session.id, "superseding active session");
            self.close_active(prev).await;
        }

        let session = self.db.create_session(topic).await?;
        let session_id = session.id;
        let workspace = TopicWorkspace::new(&self.content_root, topic);
        workspace
            .ensure()
            .context("failed to prepare topic workspace")?;
        let onboarded = workspace.is_onboarded();

        let active = self.spawn_session(session, Vec::new()).await?;

        self.emit(ServerMessage::SessionStarted { session_id });
        self.emit(ServerMessage::AgentThinking { thinking: true });
        let priming = if onboarded { PRIME_RESUME } else { PRIME_ONBOARDING };
        active
            .feeder
            .enqueue(self.decorate(priming))
            .map_err(anyhow::Error::from)?;
        *slot = Some(active);

        info!(%session_id, %topic, %onboarded, "session started");
        Ok(session_id)
    }

    /// Re-attaches to the in-memory session if one exists (never starts a
    /// second agent); otherwise revives the requested or most recent active
    /// record, replaying its transcript into a fresh agent context first.
    pub async fn resume_or_reconnect(
        &self,
        explicit: Option<Uuid>,
        immersion: Option<bool>,
    ) -> Result<(), SessionError> {
        self.set_immersion(immersion);
        let mut slot = self.active.lock().await;
        if slot.is_some() {
            drop(slot);
            debug!("reconnect with live handle; re-attaching");
            return self.send_state().await;
        }

        let record = match explicit {
            Some(id) => self.db.get_session(id).await?,
            None => self.db.latest_active_session().await?,
        };
        let Some(session) = record else {
            drop(slot);
            if let Some(id) = explicit {
                self.notify_error(format!("session '{id}' not found"));
            }
            // Report "no active session" rather than failing.
            return self.send_state().await;
        };

        let transcript = self.db.session_messages(session.id).await?;
        let history = transcript
            .iter()
            .map(|m| HistoryEntry {
                role: match m.role {
                    MessageRole::User => HistoryRole::User,
                    MessageRole::Assistant => HistoryRole::Assistant,
                },
                text: m.content.clone(),
            })
            .collect();

        self.db.activate_session(session.id).await?;
        let session_id = session.id;
        let active = self.spawn_session(session, history).await?;
        *slot = Some(active);
        drop(slot);

        info!(%session_id, "session resumed from record");
        self.send_state().await
    }

    /// Persists the learner's message and feeds it to the agent.
    pub async fn chat(&self, text: &str, immersion: Option<bool>) -> Result<(), SessionError> {
        self.set_immersion(immersion);
        let slot = self.active.lock().await;
        let active = slot.as_ref().ok_or(SessionError::NoActiveSession)?;

        self.db
            .add_message(active.session.id, MessageRole::User, text)
            .await?;
        self.emit(ServerMessage::AgentThinking { thinking: true });
        active
            .feeder
            .enqueue(self.decorate(text))
            .map_err(anyhow::Error::from)?;
        Ok(())
    }

    /// Routes a client answer to the pending tool call it belongs to.
    /// Unknown or stale ids are ignored by the registry.
    pub async fn resolve_tool(&self, call_id: &str, answer: Value) {
        let slot = self.active.lock().await;
        match slot.as_ref() {
            Some(active) => active.registry.resolve(call_id, answer),
            None => debug!(%call_id, "tool answer with no active session"),
        }
    }

    /// Ends the session. Graceful end lets the agent write its final notes
    /// and waits for the output stream to finish before committing;
    /// `discard` tears everything down immediately and never commits.
    pub async fn end_session(&self, discard: bool) -> Result<(), SessionError> {
        let taken = self.active.lock().await.take();
        let Some(mut active) = taken else {
            self.emit(ServerMessage::SessionEnded {
                summary: "No session was active.".to_string(),
            });
            return Ok(());
        };
        let session = active.session.clone();

        if discard {
            // Pending tool calls are left unresolved; that leak is accepted
            // until process restart.
            self.close_active(active).await;
            self.emit(ServerMessage::SessionEnded {
                summary: "Session discarded; notes were not committed.".to_string(),
            });
            info!(session_id = %session.id, "session discarded");
            return Ok(());
        }

        if active.feeder.enqueue(WRAP_UP.to_string()).is_err() {
            warn!("agent input already closed before wrap-up");
        }
        active.feeder.close();

        // Committing before the agent finishes writing would lose its final
        // edits, so wait for the output stream's natural completion.
        if let Err(e) = (&mut active.consumer).await {
            warn!(error = ?e, "output consumer ended abnormally");
        }
        active.agent.close();
        active.forwarder.abort();

        if let Err(e) = self.db.deactivate_session(session.id).await {
            error!(error = ?e, "failed to deactivate session record");
        }

        let summary = match commit::commit_session_notes(
            &self.content_root,
            &session.topic,
            Utc::now().date_naive(),
            self.push_on_commit,
        )
        .await
        {
            Ok(CommitOutcome::NoChanges) => "Session ended. No note changes to commit.".to_string(),
            Ok(CommitOutcome::Committed { pushed: true }) => {
                "Session ended; notes committed and pushed.".to_string()
            }
            Ok(CommitOutcome::Committed { pushed: false }) => {
                "Session ended; notes committed locally.".to_string()
            }
            Err(e) => {
                // Local data is still on disk; the client is told the
                // session ended either way.
                error!(error = %e, "commit handshake failed");
                "Session ended, but committing notes failed; they remain on disk.".to_string()
            }
        };

        self.emit(ServerMessage::SessionEnded { summary });
        info!(session_id = %session.id, "session ended");
        Ok(())
    }

    /// Broadcasts a full state snapshot from durable + in-memory state.
    pub async fn send_state(&self) -> Result<(), SessionError> {
        let slot = self.active.lock().await;
        let in_memory = slot.is_some();
        let record = match slot.as_ref() {
            Some(active) => Some(active.session.clone()),
            None => self.db.latest_active_session().await?,
        };
        drop(slot);

        match record {
            Some(session) => {
                let messages = self.db.session_messages(session.id).await?;
                let onboarded =
                    TopicWorkspace::new(&self.content_root, &session.topic).is_onboarded();
                self.emit(ServerMessage::State {
                    messages,
                    session_active: in_memory,
                    session_id: Some(session.id),
                    topic: Some(session.topic),
                    onboarded,
                });
            }
            None => self.emit(ServerMessage::State {
                messages: Vec::new(),
                session_active: false,
                session_id: None,
                topic: None,
                onboarded: false,
            }),
        }
        Ok(())
    }

    /// Builds the agent binding for a session: tool service, feeder,
    /// runtime, output consumer and tool-event forwarder.
    async fn spawn_session(
        &self,
        session: Session,
        history: Vec<HistoryEntry>,
    ) -> Result<ActiveSession, SessionError> {
        let workspace = TopicWorkspace::new(&self.content_root, &session.topic);
        workspace
            .ensure()
            .context("failed to prepare topic workspace")?;

        let registry = Arc::new(ToolCallRegistry::new());
        let (tool_tx, tool_rx) = mpsc::unbounded_channel();
        let service = TutorService::new(registry.clone(), tool_tx, workspace.clone());

        let mut system_prompt = format!("{}\n\n# Topic: {}", self.system_prompt, session.topic);
        let notes = workspace.context_block();
        if !notes.is_empty() {
            system_prompt.push_str("\n\n# Topic notes\n\n");
            system_prompt.push_str(&notes);
        }

        let (feeder, input_rx) = InputFeeder::channel();
        let mut agent = spawn_agent(
            self.llm.clone(),
            service,
            AgentContext::new(system_prompt, history),
            input_rx,
        )
        .await
        .context("failed to start agent")?;
        let output = agent
            .take_output()
            .context("agent output stream already taken")
            .map_err(SessionError::Internal)?;

        let consumer = tokio::spawn(consume_output(
            self.db.clone(),
            self.events.clone(),
            registry.clone(),
            session.id,
            output,
        ));
        let forwarder = tokio::spawn(forward_tool_events(self.events.clone(), tool_rx));

        Ok(ActiveSession {
            session,
            feeder,
            registry,
            agent,
            consumer,
            forwarder,
        })
    }

    /// Unconditionally tears down a session binding and deactivates its
    /// record. Used for supersede and discard.
    async fn close_active(&self, mut active: ActiveSession) {
        active.feeder.close();
        active.agent.close();
        active.consumer.abort();
        active.forwarder.abort();
        if let Err(e) = self.db.deactivate_session(active.session.id).await {
            error!(error = ?e, "failed to deactivate superseded session");
        }
    }
}

/// Drains the agent's output stream: narration is persisted and forwarded,
/// failures surface as a single error event, and the thinking indicator is
/// always cleared so the client never sees an indefinite spinner.
async fn consume_output(
    db: Arc<Db>,
    events: broadcast::Sender<ServerMessage>,
    registry: Arc<ToolCallRegistry>,
    session_id: Uuid,
    mut output: mpsc::Receiver<AgentEvent>,
) {
    while let Some(event) = output.recv().await {
        match event {
            AgentEvent::Narration { text } => {
                match db
                    .add_message(session_id, MessageRole::Assistant, &text)
                    .await
                {
                    Ok(message) => {
                        let _ = events.send(ServerMessage::AssistantMessage {
                            text: message.content,
                            message_id: message.message_id,
                            onboarded: None,
                        });
                    }
                    Err(e) => {
                        error!(error = ?e, "failed to persist assistant message");
                        let _ = events.send(ServerMessage::Error {
                            message: "failed to record the tutor's reply".to_string(),
                        });
                    }
                }
                if registry.pending_count() == 0 {
                    let _ = events.send(ServerMessage::AgentThinking { thinking: false });
                }
            }
            AgentEvent::TurnComplete => {
                let _ = events.send(ServerMessage::AgentThinking { thinking: false });
            }
            AgentEvent::TurnFailed { message } => {
                error!(%message, "agent turn failed");
                let _ = events.send(ServerMessage::Error { message });
                let _ = events.send(ServerMessage::AgentThinking { thinking: false });
            }
        }
    }
    info!(%session_id, "agent output stream finished");
}

/// Relays out-of-band tool presentations into the client event hub.
async fn forward_tool_events(
    events: broadcast::Sender<ServerMessage>,
    mut tool_rx: mpsc::UnboundedReceiver<ToolEvent>,
) {
    while let Some(event) = tool_rx.recv().await {
        let msg = match event {
            ToolEvent::Exercise { call_id, payload } => ServerMessage::Exercise {
                payload,
                tool_call_id: call_id,
            },
            ToolEvent::Options { call_id, payload } => ServerMessage::Options {
                payload,
                tool_call_id: call_id,
            },
            ToolEvent::ProposeFileChanges { call_id, payload } => {
                ServerMessage::ProposeFileChanges {
                    payload,
                    tool_call_id: call_id,
                }
            }
        };
        let _ = events.send(msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tandem_core::agent::{LlmAction, ScriptedLlm};
    use tokio::time::timeout;

    struct Fixture {
        _db_dir: tempfile::TempDir,
        _content_dir: tempfile::TempDir,
        db: Arc<Db>,
        manager: Arc<SessionManager>,
    }

    async fn fixture(actions: impl IntoIterator<Item = LlmAction>) -> Fixture {
        let db_dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}/tandem-test.db", db_dir.path().display());
        let db = Arc::new(Db::connect(&url).await.unwrap());
        db.run_migrations().await.unwrap();

        let content_dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(SessionManager::new(
            db.clone(),
            Arc::new(ScriptedLlm::new(actions)),
            Arc::new("You are a language tutor.".to_string()),
            content_dir.path().to_path_buf(),
            false,
        ));
        Fixture {
            _db_dir: db_dir,
            _content_dir: content_dir,
            db,
            manager,
        }
    }

    async fn next_event(rx: &mut broadcast::Receiver<ServerMessage>) -> ServerMessage {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event hub closed")
    }

    /// Reads events until the predicate matches, returning every event seen
    /// along the way (the matching one last).
    async fn events_until(
        rx: &mut broadcast::Receiver<ServerMessage>,
        mut stop: impl FnMut(&ServerMessage) -> bool,
    ) -> Vec<ServerMessage> {
        let mut seen = Vec::new();
        loop {
            let event = next_event(rx).await;
            let done = stop(&event);
            seen.push(event);
            if done {
                return seen;
            }
        }
    }

    #[tokio::test]
    async fn chat_persists_user_message_and_thinking_precedes_reply() {
        let fx = fixture([
            LlmAction::Text("¡Bienvenido! Empecemos.".into()),
            LlmAction::Text("¡Hola! ¿Cómo estás?".into()),
        ])
        .await;
        let mut rx = fx.manager.subscribe();

        let session_id = fx.manager.start_session("es", None).await.unwrap();
        fx.manager.chat("Hola", None).await.unwrap();

        let seen = events_until(&mut rx, |e| {
            matches!(e, ServerMessage::AssistantMessage { text, .. } if text.contains("¿Cómo estás?"))
        })
        .await;

        let thinking_at = seen
            .iter()
            .position(|e| matches!(e, ServerMessage::AgentThinking { thinking: true }))
            .expect("no thinking event");
        let reply_at = seen
            .iter()
            .position(|e| matches!(e, ServerMessage::AssistantMessage { .. }))
            .expect("no assistant message");
        assert!(thinking_at < reply_at, "thinking must precede narration");

        let messages = fx.db.session_messages(session_id).await.unwrap();
        let user_texts: Vec<_> = messages
            .iter()
            .filter(|m| m.role == MessageRole::User)
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(user_texts, ["Hola"]);
    }

    #[tokio::test]
    async fn chat_without_a_session_is_rejected() {
        let fx = fixture([]).await;
        let err = fx.manager.chat("Hola", None).await.unwrap_err();
        assert!(matches!(err, SessionError::NoActiveSession));
    }

    #[tokio::test]
    async fn starting_again_supersedes_the_previous_session() {
        let fx = fixture([
            LlmAction::Text("first".into()),
            LlmAction::Text("second".into()),
        ])
        .await;

        let first = fx.manager.start_session("es", None).await.unwrap();
        let second = fx.manager.start_session("fr", None).await.unwrap();
        assert_ne!(first, second);

        // The prior record is deactivated before the new session is visible.
        assert!(!fx.db.get_session(first).await.unwrap().unwrap().active);
        let latest = fx.db.latest_active_session().await.unwrap().unwrap();
        assert_eq!(latest.id, second);
    }

    #[tokio::test]
    async fn reconnect_with_live_handle_is_idempotent() {
        let fx = fixture([LlmAction::Text("hola".into())]).await;
        let mut rx = fx.manager.subscribe();

        let session_id = fx.manager.start_session("es", None).await.unwrap();
        fx.manager.resume_or_reconnect(None, None).await.unwrap();

        // No second session record was created.
        assert_eq!(fx.db.list_sessions().await.unwrap().len(), 1);

        let seen = events_until(&mut rx, |e| matches!(e, ServerMessage::State { .. })).await;
        match seen.last().unwrap() {
            ServerMessage::State {
                session_active,
                session_id: sid,
                ..
            } => {
                assert!(*session_active);
                assert_eq!(*sid, Some(session_id));
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn resume_from_record_replays_history_in_order() {
        let fx = fixture([]).await;

        // Seed a prior session's transcript directly, as if the process had
        // restarted and lost its in-memory handle.
        let session = fx.db.create_session("es").await.unwrap();
        fx.db
            .add_message(session.id, MessageRole::User, "Hola")
            .await
            .unwrap();
        fx.db
            .add_message(session.id, MessageRole::Assistant, "¡Hola! ¿Qué tal?")
            .await
            .unwrap();

        let mut rx = fx.manager.subscribe();
        fx.manager.resume_or_reconnect(None, None).await.unwrap();

        let seen = events_until(&mut rx, |e| matches!(e, ServerMessage::State { .. })).await;
        match seen.last().unwrap() {
            ServerMessage::State {
                messages,
                session_active,
                ..
            } => {
                assert!(*session_active);
                let contents: Vec<_> = messages.iter().map(|m| m.content.as_str()).collect();
                assert_eq!(contents, ["Hola", "¡Hola! ¿Qué tal?"]);
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn reconnect_with_nothing_reports_no_active_session() {
        let fx = fixture([]).await;
        let mut rx = fx.manager.subscribe();

        fx.manager.resume_or_reconnect(None, None).await.unwrap();

        match next_event(&mut rx).await {
            ServerMessage::State {
                session_active,
                session_id,
                messages,
                ..
            } => {
                assert!(!session_active);
                assert!(session_id.is_none());
                assert!(messages.is_empty());
            }
            other => panic!("expected state, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn discard_deactivates_without_committing() {
        let fx = fixture([LlmAction::Text("hola".into())]).await;
        let mut rx = fx.manager.subscribe();

        let session_id = fx.manager.start_session("es", None).await.unwrap();
        fx.manager.end_session(true).await.unwrap();

        let seen =
            events_until(&mut rx, |e| matches!(e, ServerMessage::SessionEnded { .. })).await;
        match seen.last().unwrap() {
            ServerMessage::SessionEnded { summary } => {
                assert!(summary.contains("discarded"));
                assert!(summary.contains("not committed"));
            }
            _ => unreachable!(),
        }
        assert!(!fx.db.get_session(session_id).await.unwrap().unwrap().active);
        assert!(fx.db.latest_active_session().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn graceful_end_waits_for_the_wrapup_turn_before_finishing() {
        let fx = fixture([
            LlmAction::Text("¡Bienvenido!".into()),
            LlmAction::Text("Adiós, ¡hasta la próxima!".into()),
        ])
        .await;
        let mut rx = fx.manager.subscribe();

        let session_id = fx.manager.start_session("es", None).await.unwrap();
        fx.manager.end_session(false).await.unwrap();

        let seen =
            events_until(&mut rx, |e| matches!(e, ServerMessage::SessionEnded { .. })).await;

        // The wrap-up narration drained (and was persisted) before the
        // session-ended notification fired.
        let wrapup_at = seen
            .iter()
            .position(
                |e| matches!(e, ServerMessage::AssistantMessage { text, .. } if text.contains("Adiós")),
            )
            .expect("wrap-up narration missing");
        assert!(wrapup_at < seen.len() - 1);

        let messages = fx.db.session_messages(session_id).await.unwrap();
        assert!(
            messages
                .iter()
                .any(|m| m.role == MessageRole::Assistant && m.content.contains("Adiós"))
        );
        assert!(!fx.db.get_session(session_id).await.unwrap().unwrap().active);

        // The content root is not a git repository, so the commit handshake
        // fails softly; the client is still told the session ended.
        match seen.last().unwrap() {
            ServerMessage::SessionEnded { summary } => {
                assert!(summary.starts_with("Session ended"));
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn ending_with_no_session_still_reports() {
        let fx = fixture([]).await;
        let mut rx = fx.manager.subscribe();
        fx.manager.end_session(false).await.unwrap();
        match next_event(&mut rx).await {
            ServerMessage::SessionEnded { summary } => {
                assert!(summary.contains("No session was active"));
            }
            other => panic!("expected session_ended, got {other:?}"),
        }
    }
}
