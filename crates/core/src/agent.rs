//! Agent runtime.
//!
//! The bridge's side of the external conversational agent: a task that
//! consumes the ordered input stream produced by the [`InputFeeder`],
//! drives one model turn per input item (executing tool calls through an
//! in-process MCP client, which may suspend for minutes while a learner
//! answers), and emits [`AgentEvent`]s on its output stream. The output
//! stream ends when the input stream closes and the final turn drains —
//! the session manager relies on that natural completion before it commits.
//!
//! [`InputFeeder`]: crate::feeder::InputFeeder

use crate::tools::TutorService;
use anyhow::{Context, Result, anyhow};
use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestToolMessageArgs,
        ChatCompletionRequestUserMessageArgs, ChatCompletionTool, ChatCompletionToolArgs,
        CreateChatCompletionRequestArgs, FunctionObjectArgs,
    },
};
use async_trait::async_trait;
use rmcp::{
    ServiceExt,
    model::{CallToolRequestParam, RawContent},
    service::{RoleClient, RunningService},
};
use std::sync::Arc;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
};
use tracing::{error, info, instrument, warn};

/// A tool call requested by the model.
pub type ToolCall = async_openai::types::ChatCompletionMessageToolCall;

/// The outcome of one model invocation.
#[derive(Debug, Clone)]
pub enum LlmAction {
    /// The model responded with narration text.
    Text(String),
    /// The model asked for one or more tool invocations first.
    ToolCalls(Vec<ToolCall>),
}

/// A chat-completion backend.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(
        &self,
        messages: Vec<ChatCompletionRequestMessage>,
        tools: Vec<ChatCompletionTool>,
    ) -> Result<LlmAction>;
}

/// An implementation of [`LlmClient`] for any OpenAI-compatible API.
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiClient {
    pub fn new(config: OpenAIConfig, model: String) -> Self {
        Self {
            client: Client::with_config(config),
            model,
        }
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(
        &self,
        messages: Vec<ChatCompletionRequestMessage>,
        tools: Vec<ChatCompletionTool>,
    ) -> Result<LlmAction> {
        let mut builder = CreateChatCompletionRequestArgs::default();
        builder.model(&self.model).messages(messages);
        if !tools.is_empty() {
            builder.tools(tools).tool_choice("auto");
        }
        let request = builder.build()?;

        let response = self.client.chat().create(request).await?;
        let choice = response
            .choices
            .first()
            .context("no response choice from model")?;

        if let Some(tool_calls) = &choice.message.tool_calls {
            Ok(LlmAction::ToolCalls(tool_calls.clone()))
        } else if let Some(content) = &choice.message.content {
            Ok(LlmAction::Text(content.clone()))
        } else {
            Err(anyhow!("model response had neither text nor tool calls"))
        }
    }
}

/// A scripted [`LlmClient`] for development and integration testing: each
/// call pops the next action from the script.
pub struct ScriptedLlm {
    script: std::sync::Mutex<std::collections::VecDeque<LlmAction>>,
}

impl ScriptedLlm {
    pub fn new(actions: impl IntoIterator<Item = LlmAction>) -> Self {
        Self {
            script: std::sync::Mutex::new(actions.into_iter().collect()),
        }
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(
        &self,
        _messages: Vec<ChatCompletionRequestMessage>,
        _tools: Vec<ChatCompletionTool>,
    ) -> Result<LlmAction> {
        self.script
            .lock()
            .expect("script lock poisoned")
            .pop_front()
            .context("scripted LLM ran out of actions")
    }
}

/// One prior transcript entry replayed into a fresh agent context.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub role: HistoryRole,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryRole {
    User,
    Assistant,
}

/// Events the runtime emits on its output stream.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// User-visible narration from the agent.
    Narration { text: String },
    /// The turn for one input item finished cleanly.
    TurnComplete,
    /// The turn failed; the runtime stays alive for the next input item.
    TurnFailed { message: String },
}

/// Everything a fresh runtime needs before its first input item.
pub struct AgentContext {
    /// System prompt, already including the topic's note context.
    pub system_prompt: String,
    /// Transcript replayed from a resumed session, oldest first.
    pub history: Vec<HistoryEntry>,
    /// Upper bound on tool rounds within a single turn.
    pub max_tool_rounds: usize,
}

impl AgentContext {
    pub fn new(system_prompt: String, history: Vec<HistoryEntry>) -> Self {
        Self {
            system_prompt,
            history,
            max_tool_rounds: 8,
        }
    }
}

/// The live binding to a running agent: its output stream plus the task
/// handles needed to tear it down. The input sink is the [`InputFeeder`]
/// created alongside it; both are owned by the session manager.
///
/// [`InputFeeder`]: crate::feeder::InputFeeder
pub struct AgentHandle {
    output: Option<mpsc::Receiver<AgentEvent>>,
    runtime_task: JoinHandle<()>,
    service_task: JoinHandle<()>,
}

impl AgentHandle {
    /// Takes the output stream; yields `None` after the first call.
    pub fn take_output(&mut self) -> Option<mpsc::Receiver<AgentEvent>> {
        self.output.take()
    }

    /// Aborts the runtime and its tool service unconditionally.
    pub fn close(&self) {
        self.runtime_task.abort();
        self.service_task.abort();
    }
}

/// Spawns the agent runtime together with its in-process tool service and
/// returns the handle the session manager will own.
pub async fn spawn_agent(
    llm: Arc<dyn LlmClient>,
    service: TutorService,
    ctx: AgentContext,
    input: mpsc::UnboundedReceiver<String>,
) -> Result<AgentHandle> {
    let (server_transport, client_transport) = tokio::io::duplex(4096);

    let service_task = tokio::spawn(async move {
        if let Ok(running) = service.serve(server_transport).await {
            let _ = running.waiting().await;
        }
    });
    let mcp = ()
        .serve(client_transport)
        .await
        .context("failed to connect the in-process tool client")?;

    let runtime = AgentRuntime::new(llm, mcp, ctx)?;
    let (output_tx, output_rx) = mpsc::channel(32);
    let runtime_task = tokio::spawn(runtime.run(input, output_tx));

    Ok(AgentHandle {
        output: Some(output_rx),
        runtime_task,
        service_task,
    })
}

struct AgentRuntime {
    llm: Arc<dyn LlmClient>,
    mcp: RunningService<RoleClient, ()>,
    messages: Vec<ChatCompletionRequestMessage>,
    max_tool_rounds: usize,
}

impl AgentRuntime {
    fn new(
        llm: Arc<dyn LlmClient>,
        mcp: RunningService<RoleClient, ()>,
        ctx: AgentContext,
    ) -> Result<Self> {
        let mut messages: Vec<ChatCompletionRequestMessage> = vec![
            ChatCompletionRequestSystemMessageArgs::default()
                .content(ctx.system_prompt)
                .build()?
                .into(),
        ];
        for entry in ctx.history {
            match entry.role {
                HistoryRole::User => messages.push(
                    ChatCompletionRequestUserMessageArgs::default()
                        .content(entry.text)
                        .build()?
                        .into(),
                ),
                HistoryRole::Assistant => messages.push(
                    ChatCompletionRequestAssistantMessageArgs::default()
                        .content(entry.text)
                        .build()?
                        .into(),
                ),
            }
        }
        Ok(Self {
            llm,
            mcp,
            messages,
            max_tool_rounds: ctx.max_tool_rounds,
        })
    }

    /// Drives turns until the input stream closes, then lets the output
    /// channel close behind it.
    #[instrument(name = "agent_runtime", skip_all)]
    async fn run(mut self, mut input: mpsc::UnboundedReceiver<String>, output: mpsc::Sender<AgentEvent>) {
        while let Some(text) = input.recv().await {
            match self.turn(&text).await {
                Ok(narration) => {
                    if !narration.is_empty()
                        && output
                            .send(AgentEvent::Narration { text: narration })
                            .await
                            .is_err()
                    {
                        break;
                    }
                    if output.send(AgentEvent::TurnComplete).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    error!(error = ?e, "agent turn failed");
                    let failed = AgentEvent::TurnFailed {
                        message: e.to_string(),
                    };
                    if output.send(failed).await.is_err() {
                        break;
                    }
                }
            }
        }
        info!("agent input stream closed; runtime finished");
    }

    /// One full turn: user text in, narration out, any number of tool
    /// rounds (up to the budget) in between.
    async fn turn(&mut self, user_text: &str) -> Result<String> {
        self.messages.push(
            ChatCompletionRequestUserMessageArgs::default()
                .content(user_text.to_string())
                .build()?
                .into(),
        );

        let tools = self.list_tools().await?;

        for _round in 0..self.max_tool_rounds {
            let action = self
                .llm
                .complete(self.messages.clone(), tools.clone())
                .await?;

            match action {
                LlmAction::Text(text) => {
                    self.messages.push(
                        ChatCompletionRequestAssistantMessageArgs::default()
                            .content(text.clone())
                            .build()?
                            .into(),
                    );
                    return Ok(text);
                }
                LlmAction::ToolCalls(calls) => {
                    self.messages.push(
                        ChatCompletionRequestAssistantMessageArgs::default()
                            .tool_calls(calls.clone())
                            .build()?
                            .into(),
                    );
                    for call in &calls {
                        // A failed tool is reported back to the model as the
                        // call's result so the turn can recover in-band.
                        let result_text = match self.call_tool(call).await {
                            Ok(text) => text,
                            Err(e) => {
                                warn!(tool = %call.function.name, error = ?e, "tool call failed");
                                format!("{{\"error\": {}}}", serde_json::json!(e.to_string()))
                            }
                        };
                        self.messages.push(
                            ChatCompletionRequestToolMessageArgs::default()
                                .tool_call_id(call.id.clone())
                                .content(result_text)
                                .build()?
                                .into(),
                        );
                    }
                }
            }
        }

        Err(anyhow!(
            "tool-call budget exhausted without a final response"
        ))
    }

    /// Advertises the MCP tool list to the model.
    async fn list_tools(&self) -> Result<Vec<ChatCompletionTool>> {
        self.mcp
            .list_all_tools()
            .await?
            .into_iter()
            .map(|t| {
                Ok(ChatCompletionToolArgs::default()
                    .function(
                        FunctionObjectArgs::default()
                            .name(t.name)
                            .description(t.description.unwrap_or_default())
                            .parameters(serde_json::to_value(&*t.input_schema)?)
                            .build()?,
                    )
                    .build()?)
            })
            .collect()
    }

    async fn call_tool(&self, call: &ToolCall) -> Result<String> {
        let result = self
            .mcp
            .peer()
            .call_tool(CallToolRequestParam {
                name: call.function.name.clone().into(),
                arguments: Some(serde_json::from_str(&call.function.arguments)?),
            })
            .await?;

        let annotated = result
            .content
            .context("tool call returned no content")?
            .pop()
            .context("tool content list was empty")?;
        match annotated.raw {
            RawContent::Text(text_content) => Ok(text_content.text),
            _ => Ok("{\"error\": \"unexpected content type from tool\"}".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::TopicWorkspace;
    use crate::feeder::InputFeeder;
    use crate::registry::ToolCallRegistry;
    use crate::tools::ToolEvent;
    use async_openai::types::{ChatCompletionToolType, FunctionCall};
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    fn tool_call(id: &str, name: &str, arguments: serde_json::Value) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            r#type: ChatCompletionToolType::Function,
            function: FunctionCall {
                name: name.to_string(),
                arguments: arguments.to_string(),
            },
        }
    }

    async fn recv(
        output: &mut mpsc::Receiver<AgentEvent>,
    ) -> Option<AgentEvent> {
        timeout(Duration::from_secs(5), output.recv())
            .await
            .expect("timed out waiting for agent event")
    }

    #[tokio::test]
    async fn plain_turn_emits_narration_then_completion() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ToolCallRegistry::new());
        let (tool_tx, _tool_rx) = mpsc::unbounded_channel();
        let service = TutorService::new(
            registry,
            tool_tx,
            TopicWorkspace::new(dir.path(), "es"),
        );
        let llm = Arc::new(ScriptedLlm::new([LlmAction::Text("¡Hola!".into())]));

        let (mut feeder, input_rx) = InputFeeder::channel();
        let mut handle = spawn_agent(
            llm,
            service,
            AgentContext::new("You are a tutor.".into(), vec![]),
            input_rx,
        )
        .await
        .unwrap();
        let mut output = handle.take_output().unwrap();

        feeder.enqueue("Hola").unwrap();
        feeder.close();

        match recv(&mut output).await {
            Some(AgentEvent::Narration { text }) => assert_eq!(text, "¡Hola!"),
            other => panic!("expected narration, got {other:?}"),
        }
        assert!(matches!(
            recv(&mut output).await,
            Some(AgentEvent::TurnComplete)
        ));
        // Input closed and the turn drained, so the stream ends naturally.
        assert!(recv(&mut output).await.is_none());
    }

    #[tokio::test]
    async fn tool_call_suspends_until_the_registry_resolves() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ToolCallRegistry::new());
        let (tool_tx, mut tool_rx) = mpsc::unbounded_channel();
        let service = TutorService::new(
            registry.clone(),
            tool_tx,
            TopicWorkspace::new(dir.path(), "es"),
        );
        let llm = Arc::new(ScriptedLlm::new([
            LlmAction::ToolCalls(vec![tool_call(
                "call_1",
                "present_exercise",
                json!({"kind": "translate", "prompt": "the red house"}),
            )]),
            LlmAction::Text("¡Bien hecho!".into()),
        ]));

        let (mut feeder, input_rx) = InputFeeder::channel();
        let mut handle = spawn_agent(
            llm,
            service,
            AgentContext::new("You are a tutor.".into(), vec![]),
            input_rx,
        )
        .await
        .unwrap();
        let mut output = handle.take_output().unwrap();

        feeder.enqueue("ready").unwrap();

        // The runtime is now suspended inside the tool call; the exercise
        // surfaces out-of-band with its correlation id.
        let event = timeout(Duration::from_secs(5), tool_rx.recv())
            .await
            .expect("timed out waiting for tool event")
            .expect("tool event channel closed");
        let call_id = match event {
            ToolEvent::Exercise { call_id, payload } => {
                assert_eq!(payload.prompt, "the red house");
                call_id
            }
            other => panic!("expected exercise, got {other:?}"),
        };
        assert_eq!(registry.pending_count(), 1);

        registry.resolve(&call_id, json!({"answer": "la casa roja"}));

        match recv(&mut output).await {
            Some(AgentEvent::Narration { text }) => assert_eq!(text, "¡Bien hecho!"),
            other => panic!("expected narration, got {other:?}"),
        }
        assert!(matches!(
            recv(&mut output).await,
            Some(AgentEvent::TurnComplete)
        ));
        assert_eq!(registry.pending_count(), 0);

        feeder.close();
        assert!(recv(&mut output).await.is_none());
    }

    #[tokio::test]
    async fn turn_failure_keeps_the_runtime_alive() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ToolCallRegistry::new());
        let (tool_tx, _tool_rx) = mpsc::unbounded_channel();
        let service = TutorService::new(
            registry,
            tool_tx,
            TopicWorkspace::new(dir.path(), "es"),
        );
        // First turn exhausts the script mid-way; second turn still runs.
        let llm = Arc::new(ScriptedLlm::new([]));

        let (mut feeder, input_rx) = InputFeeder::channel();
        let mut handle = spawn_agent(
            llm,
            service,
            AgentContext::new("You are a tutor.".into(), vec![]),
            input_rx,
        )
        .await
        .unwrap();
        let mut output = handle.take_output().unwrap();

        feeder.enqueue("first").unwrap();
        assert!(matches!(
            recv(&mut output).await,
            Some(AgentEvent::TurnFailed { .. })
        ));

        feeder.enqueue("second").unwrap();
        assert!(matches!(
            recv(&mut output).await,
            Some(AgentEvent::TurnFailed { .. })
        ));

        feeder.close();
        assert!(recv(&mut output).await.is_none());
    }
}
