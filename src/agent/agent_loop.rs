//! Core agent loop implementation.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::{AgentConfig, Config};
use crate::embedding::HttpEmbedder;
use crate::llm::{LlmClient, OpenAiCompatibleClient};
use crate::retry::{with_retry, RetryPolicy};
use crate::tools::{
    DispatchError, SchemaRetriever, SqlExecutor, ToolRegistry, SCHEMA_TOOL_NAME, SQL_TOOL_NAME,
};
use crate::vector_index::SqliteVectorIndex;

use super::parser::{parse_step, ParsedStep};
use super::prompt::build_system_prompt;
use super::transcript::{Step, Transcript};

/// Where the loop is within a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Thinking,
    Acting,
    Observing,
    Answering,
    Error,
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("no answer after {max_steps} steps")]
    StepBudgetExceeded { max_steps: usize },

    #[error("more than {max_retries} malformed or rejected steps")]
    RetryBudgetExceeded { max_retries: usize },

    #[error("language model or embedding service unavailable: {0}")]
    Transport(String),

    #[error("agent setup failed: {0}")]
    Setup(String),
}

impl AgentError {
    /// Failure text safe to show to an end user.
    pub fn user_message(&self) -> String {
        match self {
            AgentError::StepBudgetExceeded { max_steps } => format!(
                "Could not complete the request: no answer was reached within {} steps. \
                 Please rephrase or simplify the question.",
                max_steps
            ),
            AgentError::RetryBudgetExceeded { .. } => "Could not complete the request: the \
                 language model kept producing malformed responses. Please try again."
                .to_string(),
            AgentError::Transport(_) => "Could not complete the request: the language model \
                 service is unavailable. Please try again later."
                .to_string(),
            AgentError::Setup(_) => "Could not complete the request: the agent is not \
                 configured correctly."
                .to_string(),
        }
    }
}

/// A successful turn.
#[derive(Debug, Clone, Serialize)]
pub struct AgentReply {
    pub answer: String,
    pub transcript: Transcript,
}

/// Everything a turn produced, successful or not.
#[derive(Debug)]
pub struct TurnOutcome {
    pub result: Result<String, AgentError>,
    pub transcript: Transcript,
    pub state: AgentState,
}

/// The SQL analyst agent.
pub struct Agent {
    llm: Arc<dyn LlmClient>,
    tools: ToolRegistry,
    system_prompt: String,
    config: AgentConfig,
    transport: RetryPolicy,
    llm_timeout: Duration,
    embedding_ready: bool,
}

impl Agent {
    /// Create an agent over an already-built tool registry.
    pub fn new(llm: Arc<dyn LlmClient>, tools: ToolRegistry, config: AgentConfig) -> Self {
        let system_prompt = build_system_prompt(&tools);
        let embedding_ready = tools.is_ready(SCHEMA_TOOL_NAME).unwrap_or(false);
        Self {
            llm,
            tools,
            system_prompt,
            config,
            transport: RetryPolicy::default(),
            llm_timeout: Duration::from_secs(60),
            embedding_ready,
        }
    }

    pub fn with_transport(mut self, policy: RetryPolicy, llm_timeout: Duration) -> Self {
        self.transport = policy;
        self.llm_timeout = llm_timeout;
        self
    }

    /// Wire up the HTTP clients, vector index and database from configuration.
    ///
    /// The embedding model is checked once; if it does not answer, schema
    /// lookups return a diagnostic instead of failing startup.
    pub async fn from_config(config: &Config) -> Result<Self, AgentError> {
        let llm = OpenAiCompatibleClient::new(config.api_key.clone(), &config.llm)
            .map_err(|e| AgentError::Setup(e.to_string()))?;
        let embedder = HttpEmbedder::new(config.api_key.clone(), &config.retrieval)
            .map_err(|e| AgentError::Setup(e.to_string()))?;

        let index = SqliteVectorIndex::new(
            &config.retrieval.index_path,
            config.retrieval.collection.clone(),
        );
        let retriever = SchemaRetriever::new(Arc::new(index), config.retrieval.top_k)
            .with_transport(config.transport.clone(), config.retrieval.embed_timeout)
            .initialize(Arc::new(embedder))
            .await;

        let executor = SqlExecutor::new(&config.database_path, config.sql_max_rows);
        let tools = ToolRegistry::with_default_tools(retriever, executor);

        Ok(Agent::new(Arc::new(llm), tools, config.agent.clone())
            .with_transport(config.transport.clone(), config.llm.timeout))
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    /// Whether schema lookups have a working embedding model.
    pub fn embedding_ready(&self) -> bool {
        self.embedding_ready
    }

    pub fn model(&self) -> &str {
        self.llm.model()
    }

    /// Answer `query`, or report why no answer was reached.
    pub async fn process(&self, query: &str) -> Result<AgentReply, AgentError> {
        let outcome = self.run_turn(query).await;
        outcome.result.map(|answer| AgentReply {
            answer,
            transcript: outcome.transcript,
        })
    }

    /// Answer `query` as plain text; failures become a labelled message.
    pub async fn answer(&self, query: &str) -> String {
        match self.process(query).await {
            Ok(reply) => reply.answer,
            Err(e) => e.user_message(),
        }
    }

    /// Run one turn and keep the transcript whatever the result.
    pub async fn run_turn(&self, query: &str) -> TurnOutcome {
        let turn_id = Uuid::new_v4();
        let span = tracing::info_span!("turn", id = %turn_id);
        async {
            tracing::info!("Processing query: {}", query);
            let mut turn = Turn {
                transcript: Transcript::new(query),
                state: AgentState::Thinking,
                protocol_errors: 0,
                max_protocol_retries: self.config.max_protocol_retries,
            };
            let result = self.drive(&mut turn).await;
            match &result {
                Ok(_) => tracing::info!("Answered after {} steps", turn.transcript.len()),
                Err(e) => {
                    turn.enter(AgentState::Error);
                    tracing::error!("Turn failed: {}", e);
                }
            }
            TurnOutcome {
                result,
                transcript: turn.transcript,
                state: turn.state,
            }
        }
        .instrument(span)
        .await
    }

    async fn drive(&self, turn: &mut Turn) -> Result<String, AgentError> {
        let mut schema_looked_up = false;

        for iteration in 0..self.config.max_steps {
            tracing::debug!("Agent iteration {}", iteration + 1);
            turn.enter(AgentState::Thinking);

            let messages = turn.transcript.to_messages(&self.system_prompt);
            let raw = with_retry(&self.transport, self.llm_timeout, "completion", || {
                self.llm.complete(&messages)
            })
            .await
            .map_err(|e| AgentError::Transport(e.to_string()))?;

            let parsed = match parse_step(&raw) {
                Ok(parsed) => parsed,
                Err(e) => {
                    turn.protocol_error(e.to_string())?;
                    continue;
                }
            };

            match parsed {
                ParsedStep::Thought(text) => {
                    if turn.transcript.ends_with_thought() {
                        turn.protocol_error(
                            "two thoughts in a row; follow your reasoning with an Action or an Answer"
                                .to_string(),
                        )?;
                    } else {
                        turn.transcript.push(Step::Thought { text });
                    }
                }
                ParsedStep::Answer { thought, answer } => {
                    if looks_like_sql(&answer) {
                        turn.protocol_error(
                            "the Answer must describe the result in plain language, not SQL"
                                .to_string(),
                        )?;
                        continue;
                    }
                    turn.enter(AgentState::Answering);
                    turn.transcript.push(Step::Answer {
                        thought,
                        text: answer.clone(),
                    });
                    return Ok(answer);
                }
                ParsedStep::Action {
                    thought,
                    tool,
                    input,
                } => {
                    turn.enter(AgentState::Acting);

                    let Some(spec) = self.tools.spec(&tool) else {
                        turn.protocol_error(format!(
                            "unknown tool '{}'; use one of: {}",
                            tool,
                            self.tools.names().join(", ")
                        ))?;
                        continue;
                    };
                    if let Err(reason) = spec.validate(&input) {
                        turn.protocol_error(format!("invalid input for '{}': {}", tool, reason))?;
                        continue;
                    }
                    if self.config.require_schema_lookup
                        && tool == SQL_TOOL_NAME
                        && !schema_looked_up
                    {
                        turn.protocol_error(format!(
                            "call '{}' before '{}'",
                            SCHEMA_TOOL_NAME, SQL_TOOL_NAME
                        ))?;
                        continue;
                    }

                    turn.transcript.push(Step::Action {
                        thought,
                        tool: tool.clone(),
                        input: input.clone(),
                    });

                    let observation = match self.tools.dispatch(&tool, &input).await {
                        Ok(text) => text,
                        Err(DispatchError::Transport { message, .. }) => {
                            return Err(AgentError::Transport(message));
                        }
                        Err(e) => {
                            turn.protocol_error(e.to_string())?;
                            continue;
                        }
                    };

                    turn.enter(AgentState::Observing);
                    if tool == SCHEMA_TOOL_NAME {
                        schema_looked_up = true;
                    }
                    tracing::debug!("Observation from {}: {}", tool, truncate_for_log(&observation, 500));
                    turn.transcript.push(Step::Observation { text: observation });
                }
            }
        }

        Err(AgentError::StepBudgetExceeded {
            max_steps: self.config.max_steps,
        })
    }
}

/// Mutable state of one turn.
struct Turn {
    transcript: Transcript,
    state: AgentState,
    protocol_errors: usize,
    max_protocol_retries: usize,
}

impl Turn {
    fn enter(&mut self, next: AgentState) {
        if self.state != next {
            tracing::debug!("{:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }

    /// Record feedback for the model; fails once the retry budget is spent.
    fn protocol_error(&mut self, text: String) -> Result<(), AgentError> {
        self.protocol_errors += 1;
        tracing::warn!(
            "Protocol error {}/{}: {}",
            self.protocol_errors,
            self.max_protocol_retries,
            text
        );
        self.transcript.push(Step::ProtocolError { text });
        if self.protocol_errors > self.max_protocol_retries {
            return Err(AgentError::RetryBudgetExceeded {
                max_retries: self.max_protocol_retries,
            });
        }
        Ok(())
    }
}

static SQL_ANSWER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?ix)
        ^\s*select\s[\s\S]*?\bfrom\b
        | ^\s*with\s+\w+\s+as\s*\(
        | ^\s*(insert\s+into|update\s+\w+\s+set|delete\s+from|drop\s+(table|view|index)|create\s+(table|view|index)|alter\s+table)\b
        | \bselect\s+(\*|[\w.]+\s*\(|[\w.]+\s*,)[\s\S]*?\bfrom\b
        | \bgroup\s+by\b
        | ;\s*$
        | ```sql",
    )
    .expect("static regex is valid")
});

/// Whether an answer is raw SQL rather than prose.
fn looks_like_sql(answer: &str) -> bool {
    SQL_ANSWER.is_match(answer)
}

/// Truncate a string for logging purposes.
fn truncate_for_log(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... [truncated]", &s[..end])
}
